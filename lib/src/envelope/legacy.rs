// SPDX-License-Identifier: MIT

//! The legacy concatenated format older grub2 consumes: a sealed secret
//! is `Marshal(TPM2B_PUBLIC) || Marshal(TPM2B_PRIVATE)`, a signed policy
//! is a bare `Marshal(TPMT_SIGNATURE)`.

use std::fs;
use std::path::Path;

use crate::envelope::SealedObject;
use crate::error::{Error, Result};
use crate::mu::{self, PolicySignature};
use crate::runtime::write_file_atomic;

pub fn write_sealed_secret(path: &Path, sealed: &SealedObject) -> Result<()> {
    let mut blob = sealed.public.clone();
    blob.extend_from_slice(&sealed.private);
    write_file_atomic(path, &blob)
}

pub fn read_sealed_secret(path: &Path) -> Result<SealedObject> {
    let blob = fs::read(path).map_err(|source| Error::File {
        path: path.into(),
        source,
    })?;
    let malformed = || Error::Envelope {
        kind: "sealed secret",
        path: path.into(),
    };

    let public_len = mu::tpm2b_wire_len(&blob).map_err(|_| malformed())?;
    let public = blob[..public_len].to_vec();
    let rest = &blob[public_len..];
    let private_len = mu::tpm2b_wire_len(rest).map_err(|_| malformed())?;
    if rest.len() != private_len {
        return Err(malformed());
    }
    Ok(SealedObject {
        public,
        private: rest.to_vec(),
    })
}

pub fn write_signature(path: &Path, signature: &PolicySignature) -> Result<()> {
    write_file_atomic(path, &signature.marshal())
}

pub fn read_signature(path: &Path) -> Result<PolicySignature> {
    let blob = fs::read(path).map_err(|source| Error::File {
        path: path.into(),
        source,
    })?;
    let mut input = blob.as_slice();
    let signature = PolicySignature::unmarshal(&mut input).map_err(|_| Error::Envelope {
        kind: "signed policy",
        path: path.into(),
    })?;
    if !input.is_empty() {
        return Err(Error::Envelope {
            kind: "signed policy",
            path: path.into(),
        });
    }
    Ok(signature)
}

/// A stored digest, e.g. a pre-computed authorized policy:
/// `Marshal(TPM2B_DIGEST)`.
pub fn write_digest(path: &Path, digest: &[u8]) -> Result<()> {
    write_file_atomic(path, &mu::marshal_tpm2b(digest))
}

pub fn read_digest(path: &Path) -> Result<Vec<u8>> {
    let blob = fs::read(path).map_err(|source| Error::File {
        path: path.into(),
        source,
    })?;
    let mut input = blob.as_slice();
    let digest = mu::unmarshal_tpm2b(&mut input).map_err(|_| Error::Envelope {
        kind: "policy digest",
        path: path.into(),
    })?;
    Ok(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algo::TPM2_ALG_SHA256;
    use crate::mu::TPM2_ALG_RSASSA;
    use std::path::PathBuf;

    fn scratch_file(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("predict-pcrs-legacy-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    #[test]
    fn sealed_secret_roundtrip() {
        let sealed = SealedObject {
            public: mu::marshal_tpm2b(&[0x11; 90]),
            private: mu::marshal_tpm2b(&[0x22; 140]),
        };
        let path = scratch_file("sealed.bin");
        write_sealed_secret(&path, &sealed).unwrap();
        assert_eq!(read_sealed_secret(&path).unwrap(), sealed);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        let sealed = SealedObject {
            public: mu::marshal_tpm2b(&[0x11; 16]),
            private: mu::marshal_tpm2b(&[0x22; 16]),
        };
        let path = scratch_file("garbage.bin");
        let mut blob = sealed.public.clone();
        blob.extend_from_slice(&sealed.private);
        blob.push(0xff);
        fs::write(&path, &blob).unwrap();
        assert!(read_sealed_secret(&path).is_err());
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn signature_roundtrip() {
        let signature = PolicySignature {
            sig_alg: TPM2_ALG_RSASSA,
            hash_alg: TPM2_ALG_SHA256,
            signature: vec![0x5c; 256],
        };
        let path = scratch_file("policy.sig");
        write_signature(&path, &signature).unwrap();
        assert_eq!(read_signature(&path).unwrap(), signature);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn digest_roundtrip() {
        let path = scratch_file("authpolicy.bin");
        write_digest(&path, &[0xabu8; 32]).unwrap();
        assert_eq!(read_digest(&path).unwrap(), vec![0xabu8; 32]);
        fs::remove_file(&path).unwrap();
    }
}
