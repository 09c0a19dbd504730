// SPDX-License-Identifier: MIT

//! The "TPM 2.0 Key File" envelope: a DER `TSSPRIVKEY` structure carrying
//! the sealed blobs, the parent handle and either a raw policy program or
//! a list of named, signed policies.

use std::fs;
use std::path::Path;

use der::asn1::{ObjectIdentifier, OctetString};
use der::{Decode, Encode, Sequence};

use crate::envelope::{NamedPolicy, PolicyStep, SealedObject};
use crate::error::{Error, Result};
use crate::mu::{self, PolicySignature};
use crate::runtime::write_file_atomic;

/// Loadable key without authorization.
pub const OID_LOADABLE_KEY: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.23.133.10.1.3");
/// Sealed data blob.
pub const OID_SEALED_DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.23.133.10.1.5");

#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
struct TssPolicy {
    #[asn1(context_specific = "0", tag_mode = "EXPLICIT")]
    command_code: u32,
    #[asn1(context_specific = "1", tag_mode = "EXPLICIT")]
    command_policy: OctetString,
}

#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
struct TssAuthPolicy {
    #[asn1(context_specific = "0", optional = "true", tag_mode = "EXPLICIT")]
    name: Option<String>,
    #[asn1(context_specific = "1", tag_mode = "EXPLICIT")]
    policy: Vec<TssPolicy>,
}

#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
struct TssPrivKey {
    key_type: ObjectIdentifier,
    #[asn1(context_specific = "0", optional = "true", tag_mode = "EXPLICIT")]
    empty_auth: Option<bool>,
    #[asn1(context_specific = "1", optional = "true", tag_mode = "EXPLICIT")]
    policy: Option<Vec<TssPolicy>>,
    #[asn1(context_specific = "3", optional = "true", tag_mode = "EXPLICIT")]
    auth_policy: Option<Vec<TssAuthPolicy>>,
    parent: u32,
    pubkey: OctetString,
    privkey: OctetString,
}

/// Decoded contents of a key file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tpm2KeyFile {
    pub empty_auth: bool,
    pub parent: u32,
    pub sealed: SealedObject,
    /// Raw policy program, for pure PCR-sealed secrets.
    pub policy: Option<Vec<PolicyStep>>,
    /// Named signed policies, tried in order at unseal time.
    pub auth_policies: Vec<NamedPolicy>,
}

fn steps_to_asn1(steps: &[PolicyStep]) -> Result<Vec<TssPolicy>> {
    steps
        .iter()
        .map(|step| {
            Ok(TssPolicy {
                command_code: step.command_code(),
                command_policy: OctetString::new(step.command_policy())?,
            })
        })
        .collect()
}

fn steps_from_asn1(policies: &[TssPolicy]) -> Result<Vec<PolicyStep>> {
    policies
        .iter()
        .map(|p| PolicyStep::decode(p.command_code, p.command_policy.as_bytes()))
        .collect()
}

impl Tpm2KeyFile {
    fn to_asn1(&self) -> Result<TssPrivKey> {
        let policy = match &self.policy {
            Some(steps) => Some(steps_to_asn1(steps)?),
            None => None,
        };
        let auth_policy = if self.auth_policies.is_empty() {
            None
        } else {
            Some(
                self.auth_policies
                    .iter()
                    .map(|ap| {
                        Ok(TssAuthPolicy {
                            name: ap.name.clone(),
                            policy: steps_to_asn1(&ap.steps)?,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?,
            )
        };
        Ok(TssPrivKey {
            key_type: OID_SEALED_DATA,
            empty_auth: Some(self.empty_auth),
            policy,
            auth_policy,
            parent: mu::TPM2_RH_OWNER,
            pubkey: OctetString::new(self.sealed.public.clone())?,
            privkey: OctetString::new(self.sealed.private.clone())?,
        })
    }

    fn from_asn1(key: &TssPrivKey, path: &Path) -> Result<Tpm2KeyFile> {
        if key.key_type != OID_SEALED_DATA && key.key_type != OID_LOADABLE_KEY {
            return Err(Error::Envelope {
                kind: "TPM 2.0 key",
                path: path.into(),
            });
        }
        let policy = match &key.policy {
            Some(policies) => Some(steps_from_asn1(policies)?),
            None => None,
        };
        let auth_policies = match &key.auth_policy {
            Some(entries) => entries
                .iter()
                .map(|ap| {
                    Ok(NamedPolicy {
                        name: ap.name.clone(),
                        steps: steps_from_asn1(&ap.policy)?,
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };
        Ok(Tpm2KeyFile {
            empty_auth: key.empty_auth.unwrap_or(false),
            parent: key.parent,
            sealed: SealedObject {
                public: key.pubkey.as_bytes().to_vec(),
                private: key.privkey.as_bytes().to_vec(),
            },
            policy,
            auth_policies,
        })
    }
}

pub fn read_file(path: &Path) -> Result<Tpm2KeyFile> {
    let der = fs::read(path).map_err(|source| Error::File {
        path: path.into(),
        source,
    })?;
    let key = TssPrivKey::from_der(&der).map_err(|_| Error::Envelope {
        kind: "TPM 2.0 key",
        path: path.into(),
    })?;
    Tpm2KeyFile::from_asn1(&key, path)
}

pub fn write_file(path: &Path, key: &Tpm2KeyFile) -> Result<()> {
    let der = key.to_asn1()?.to_der()?;
    write_file_atomic(path, &der)
}

/// Persist a sealed secret. With a PCR selection, the file carries the
/// `PolicyPCR` program grub needs to replay; the empty digest makes the
/// TPM compute it from the live PCRs.
pub fn write_sealed_secret(
    path: &Path,
    sealed: &SealedObject,
    selection: Option<&[(u16, u32)]>,
) -> Result<()> {
    let policy = selection.map(|selections| {
        vec![PolicyStep::PcrPolicy {
            pcr_digest: Vec::new(),
            selections: selections.to_vec(),
        }]
    });
    let key = Tpm2KeyFile {
        empty_auth: true,
        parent: mu::TPM2_RH_OWNER,
        sealed: sealed.clone(),
        policy,
        auth_policies: Vec::new(),
    };
    write_file(path, &key)
}

/// Add a signed policy under `policy_name` to an existing key file.
/// A fresh name is prepended so the newest policy is tried first; an
/// existing name is replaced in place.
///
/// The stored program replays `PolicyPCR` over the live registers first,
/// so the session digest exists for `PolicyAuthorize` to approve.
pub fn add_signed_policy(
    input: Option<&Path>,
    output: &Path,
    policy_name: Option<&str>,
    selections: &[(u16, u32)],
    public: &[u8],
    signature: &PolicySignature,
) -> Result<()> {
    let name = policy_name.unwrap_or("default");
    // In-place update when no separate input was given
    let input = input.unwrap_or(output);
    let mut key = read_file(input)?;

    let entry = NamedPolicy {
        name: Some(name.to_string()),
        steps: vec![
            PolicyStep::PcrPolicy {
                pcr_digest: Vec::new(),
                selections: selections.to_vec(),
            },
            PolicyStep::Authorize {
                public: public.to_vec(),
                policy_ref: Vec::new(),
                signature: signature.clone(),
            },
        ],
    };

    match key
        .auth_policies
        .iter_mut()
        .find(|ap| ap.name.as_deref() == Some(name))
    {
        Some(existing) => *existing = entry,
        None => key.auth_policies.insert(0, entry),
    }

    write_file(output, &key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algo::TPM2_ALG_SHA256;
    use crate::mu::{TPM2_ALG_RSASSA, TPM2_CC_POLICY_PCR};
    use std::path::PathBuf;

    fn scratch_file(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("predict-pcrs-tpm2key-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    fn sample_sealed() -> SealedObject {
        SealedObject {
            public: mu::marshal_tpm2b(&[0x11; 90]),
            private: mu::marshal_tpm2b(&[0x22; 140]),
        }
    }

    fn sample_signature() -> PolicySignature {
        PolicySignature {
            sig_alg: TPM2_ALG_RSASSA,
            hash_alg: TPM2_ALG_SHA256,
            signature: vec![0x77; 256],
        }
    }

    #[test]
    fn sealed_secret_contains_single_pcr_policy() {
        let path = scratch_file("sealed.tpm2key");
        write_sealed_secret(&path, &sample_sealed(), Some(&[(TPM2_ALG_SHA256, 1 << 7)])).unwrap();

        let key = read_file(&path).unwrap();
        assert!(key.empty_auth);
        assert_eq!(key.parent, mu::TPM2_RH_OWNER);
        assert_eq!(key.sealed, sample_sealed());
        assert!(key.auth_policies.is_empty());

        let policy = key.policy.unwrap();
        assert_eq!(policy.len(), 1);
        assert_eq!(policy[0].command_code(), TPM2_CC_POLICY_PCR);
        match &policy[0] {
            PolicyStep::PcrPolicy {
                pcr_digest,
                selections,
            } => {
                assert!(pcr_digest.is_empty());
                assert_eq!(selections, &[(TPM2_ALG_SHA256, 1 << 7)]);
            }
            other => panic!("unexpected step {other:?}"),
        }
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn signed_policies_prepend_and_replace() {
        let path = scratch_file("signed.tpm2key");
        write_sealed_secret(&path, &sample_sealed(), None).unwrap();

        let selections = [(TPM2_ALG_SHA256, 0x81u32)];
        let public = mu::marshal_tpm2b(&[0x33; 64]);
        add_signed_policy(None, &path, Some("first"), &selections, &public, &sample_signature())
            .unwrap();
        add_signed_policy(None, &path, Some("second"), &selections, &public, &sample_signature())
            .unwrap();

        let key = read_file(&path).unwrap();
        assert_eq!(key.policy, None);
        assert_eq!(key.auth_policies.len(), 2);
        // Newest first
        assert_eq!(key.auth_policies[0].name.as_deref(), Some("second"));
        assert_eq!(key.auth_policies[1].name.as_deref(), Some("first"));

        // Re-signing an existing name replaces it without growing the list
        let mut other_sig = sample_signature();
        other_sig.signature = vec![0x88; 256];
        add_signed_policy(None, &path, Some("first"), &selections, &public, &other_sig).unwrap();
        let key = read_file(&path).unwrap();
        assert_eq!(key.auth_policies.len(), 2);
        let replaced = &key.auth_policies[1];
        assert_eq!(replaced.steps.len(), 2);
        assert!(matches!(replaced.steps[0], PolicyStep::PcrPolicy { .. }));
        match &replaced.steps[1] {
            PolicyStep::Authorize { signature, .. } => {
                assert_eq!(signature.signature, vec![0x88; 256])
            }
            other => panic!("unexpected step {other:?}"),
        }
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn der_roundtrip_preserves_everything() {
        let key = Tpm2KeyFile {
            empty_auth: true,
            parent: mu::TPM2_RH_OWNER,
            sealed: sample_sealed(),
            policy: None,
            auth_policies: vec![NamedPolicy {
                name: Some("default".into()),
                steps: vec![PolicyStep::Authorize {
                    public: mu::marshal_tpm2b(&[0x44; 30]),
                    policy_ref: Vec::new(),
                    signature: sample_signature(),
                }],
            }],
        };
        let path = scratch_file("roundtrip.tpm2key");
        write_file(&path, &key).unwrap();
        assert_eq!(read_file(&path).unwrap(), key);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn foreign_der_is_rejected() {
        let path = scratch_file("notakey.der");
        fs::write(&path, b"-----BEGIN NONSENSE-----").unwrap();
        assert!(matches!(read_file(&path), Err(Error::Envelope { .. })));
        fs::remove_file(&path).unwrap();
    }
}
