// SPDX-License-Identifier: MIT

//! The unseal path: decode the envelope, reconstruct the stored policy
//! program, replay it inside a policy session and write out the secret.
//! This mirrors what the boot loader does at unlock time and exists
//! mostly so a prediction can be verified end to end.

use std::fs;
use std::path::Path;

use tss_esapi::traits::{Marshall, UnMarshall};
use tss_esapi::structures::Public;

use crate::bank::PcrSelection;
use crate::envelope::{legacy, tpm2key, PolicyStep, TargetPlatform};
use crate::error::{Error, Result};
use crate::rsa::RsaPublicKey;
use crate::runtime::write_file_atomic;
use crate::tpm::Tpm;

/// Read a verification public key, accepting both the marshalled
/// `TPM2B_PUBLIC` form (what `store-public-key` writes for the boot
/// loader) and a PEM file.
pub fn read_verification_key(path: &Path) -> Result<Vec<u8>> {
    let data = fs::read(path).map_err(|source| Error::File {
        path: path.into(),
        source,
    })?;
    if let Ok(public) = Public::unmarshall(&data) {
        return Ok(public.marshall()?);
    }
    Ok(RsaPublicKey::read(path)?.to_tss_public()?.marshall()?)
}

pub struct UnsealRequest<'a> {
    pub platform: TargetPlatform,
    pub input: &'a Path,
    pub output: &'a Path,
    /// Required for the legacy format, which does not store its policy.
    pub selection: Option<PcrSelection>,
    /// Legacy format only: a detached signed policy.
    pub signed_policy: Option<&'a Path>,
    /// Legacy format only: the verification key for the signed policy.
    pub public_key: Option<&'a Path>,
}

fn legacy_programs(req: &UnsealRequest) -> Result<Vec<Vec<PolicyStep>>> {
    let selection = req.selection.ok_or_else(|| {
        Error::Other("the legacy format needs an explicit PCR selection to unseal".into())
    })?;
    let pcr_step = PolicyStep::PcrPolicy {
        pcr_digest: Vec::new(),
        selections: vec![(selection.algo.tcg_id, selection.pcr_mask)],
    };

    let steps = match req.signed_policy {
        None => vec![pcr_step],
        Some(signed_policy) => {
            let signature = legacy::read_signature(signed_policy)?;
            let public_key = req.public_key.ok_or_else(|| {
                Error::Other("a signed policy needs the matching public key".into())
            })?;
            let public = read_verification_key(public_key)?;
            vec![
                pcr_step,
                PolicyStep::Authorize {
                    public,
                    policy_ref: Vec::new(),
                    signature,
                },
            ]
        }
    };
    Ok(vec![steps])
}

pub fn unseal_secret(tpm: &mut Tpm, req: &UnsealRequest) -> Result<()> {
    let (sealed, programs) = match req.platform {
        TargetPlatform::OldGrub => {
            (legacy::read_sealed_secret(req.input)?, legacy_programs(req)?)
        }
        TargetPlatform::Tpm2Key => {
            let key = tpm2key::read_file(req.input)?;
            let programs = if !key.auth_policies.is_empty() {
                key.auth_policies.iter().map(|ap| ap.steps.clone()).collect()
            } else {
                key.policy.clone().map(|steps| vec![steps]).unwrap_or_default()
            };
            (key.sealed, programs)
        }
        TargetPlatform::Systemd => return Err(Error::PlatformUnsupported("systemd")),
    };

    if programs.is_empty() {
        return Err(Error::UnsealDenied);
    }

    let secret = tpm.unseal_with_programs(&sealed, &programs)?;
    write_file_atomic(req.output, &secret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algo::{self, TPM2_ALG_SHA256};
    use crate::envelope::legacy;
    use crate::mu::{self, PolicySignature, TPM2_ALG_RSASSA};
    use std::fs;
    use std::path::PathBuf;

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("predict-pcrs-unseal-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn request<'a>(
        input: &'a Path,
        output: &'a Path,
        signed_policy: Option<&'a Path>,
        public_key: Option<&'a Path>,
    ) -> UnsealRequest<'a> {
        UnsealRequest {
            platform: TargetPlatform::OldGrub,
            input,
            output,
            selection: Some(PcrSelection {
                algo: algo::by_name("sha256").unwrap(),
                pcr_mask: 1 << 7,
            }),
            signed_policy,
            public_key,
        }
    }

    #[test]
    fn legacy_program_without_signed_policy() {
        let dir = scratch_dir();
        let input = dir.join("plain.sealed");
        let output = dir.join("plain.out");
        let req = request(&input, &output, None, None);

        let programs = legacy_programs(&req).unwrap();
        assert_eq!(programs.len(), 1);
        assert_eq!(
            programs[0],
            vec![PolicyStep::PcrPolicy {
                pcr_digest: Vec::new(),
                selections: vec![(TPM2_ALG_SHA256, 1 << 7)],
            }]
        );
    }

    #[test]
    fn legacy_program_with_signed_policy() {
        let dir = scratch_dir();
        let signed = dir.join("policy.sig");
        let pubkey = dir.join("key.pub");
        let signature = PolicySignature {
            sig_alg: TPM2_ALG_RSASSA,
            hash_alg: TPM2_ALG_SHA256,
            signature: vec![0x5a; 256],
        };
        legacy::write_signature(&signed, &signature).unwrap();

        let key = crate::rsa::RsaPrivateKey::generate(2048).unwrap();
        fs::write(&pubkey, key.to_tss_public().unwrap().marshall().unwrap()).unwrap();

        let input = dir.join("auth.sealed");
        let output = dir.join("auth.out");
        let req = request(&input, &output, Some(&signed), Some(&pubkey));

        let programs = legacy_programs(&req).unwrap();
        assert_eq!(programs.len(), 1);
        assert_eq!(programs[0].len(), 2);
        assert!(matches!(programs[0][0], PolicyStep::PcrPolicy { .. }));
        match &programs[0][1] {
            PolicyStep::Authorize {
                public,
                policy_ref,
                signature: stored,
            } => {
                assert!(mu::tpm2b_wire_len(public).is_ok());
                assert!(policy_ref.is_empty());
                assert_eq!(stored, &signature);
            }
            other => panic!("unexpected step {other:?}"),
        }

        fs::remove_file(&signed).unwrap();
        fs::remove_file(&pubkey).unwrap();
    }

    #[test]
    fn missing_selection_is_an_error() {
        let dir = scratch_dir();
        let input = dir.join("x");
        let output = dir.join("y");
        let mut req = request(&input, &output, None, None);
        req.selection = None;
        assert!(legacy_programs(&req).is_err());
    }

    #[test]
    fn verification_key_accepts_both_formats() {
        let dir = scratch_dir();
        let key = crate::rsa::RsaPrivateKey::generate(2048).unwrap();
        let expected = key.to_tss_public().unwrap().marshall().unwrap();

        // Marshalled TPM2B_PUBLIC, as written by store-public-key
        let native = dir.join("verify.tss");
        fs::write(&native, &expected).unwrap();
        assert_eq!(read_verification_key(&native).unwrap(), expected);

        // PEM public key
        let pem = dir.join("verify.pem");
        fs::write(&pem, key.public_pem().unwrap()).unwrap();
        assert_eq!(read_verification_key(&pem).unwrap(), expected);

        fs::remove_file(&native).unwrap();
        fs::remove_file(&pem).unwrap();
    }
}
