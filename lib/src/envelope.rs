// SPDX-License-Identifier: MIT

//! On-disk containers for sealed secrets and signed policies. Depending
//! on the target platform, the same sealed blob and policy metadata are
//! written to very different shapes of file.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::mu::{self, PolicySignature};

pub mod legacy;
pub mod systemd;
pub mod tpm2key;

/// The marshalled `TPM2B_PUBLIC` and `TPM2B_PRIVATE` halves of a sealed
/// object, exactly as the TPM returned them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedObject {
    pub public: Vec<u8>,
    pub private: Vec<u8>,
}

/// One instruction of a stored policy program. Programs execute strictly
/// in order inside a single policy session at unseal time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyStep {
    /// `TPM2_PolicyPCR`: bind to PCR state. An empty digest makes the TPM
    /// compute it from the live PCRs.
    PcrPolicy {
        pcr_digest: Vec<u8>,
        selections: Vec<(u16, u32)>,
    },
    /// `TPM2_PolicyAuthorize`: delegate to whatever the named key signs.
    Authorize {
        /// Marshalled `TPM2B_PUBLIC` of the verification key.
        public: Vec<u8>,
        policy_ref: Vec<u8>,
        signature: PolicySignature,
    },
}

impl PolicyStep {
    pub fn command_code(&self) -> u32 {
        match self {
            PolicyStep::PcrPolicy { .. } => mu::TPM2_CC_POLICY_PCR,
            PolicyStep::Authorize { .. } => mu::TPM2_CC_POLICY_AUTHORIZE,
        }
    }

    /// The `CommandPolicy` payload stored next to the command code.
    pub fn command_policy(&self) -> Vec<u8> {
        match self {
            PolicyStep::PcrPolicy {
                pcr_digest,
                selections,
            } => {
                let mut out = mu::marshal_tpm2b(pcr_digest);
                out.extend(mu::marshal_pcr_selection(selections));
                out
            }
            PolicyStep::Authorize {
                public,
                policy_ref,
                signature,
            } => {
                let mut out = public.clone();
                out.extend(mu::marshal_tpm2b(policy_ref));
                out.extend(signature.marshal());
                out
            }
        }
    }

    /// Decode a stored instruction. Opcodes other than PolicyPCR and
    /// PolicyAuthorize fail the whole envelope.
    pub fn decode(command_code: u32, payload: &[u8]) -> Result<PolicyStep> {
        let mut input = payload;
        match command_code {
            mu::TPM2_CC_POLICY_PCR => {
                let pcr_digest = mu::unmarshal_tpm2b(&mut input)?;
                let selections = mu::unmarshal_pcr_selection(&mut input)?;
                Ok(PolicyStep::PcrPolicy {
                    pcr_digest,
                    selections,
                })
            }
            mu::TPM2_CC_POLICY_AUTHORIZE => {
                let public_len = mu::tpm2b_wire_len(input)?;
                let public = mu::get_bytes(&mut input, public_len)?.to_vec();
                let policy_ref = mu::unmarshal_tpm2b(&mut input)?;
                let signature = PolicySignature::unmarshal(&mut input)?;
                Ok(PolicyStep::Authorize {
                    public,
                    policy_ref,
                    signature,
                })
            }
            other => Err(Error::UnsupportedPolicyStep(other)),
        }
    }
}

/// A policy program under an optional name. TPM 2.0 Key Files may carry
/// several; unsealing tries them in stored order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedPolicy {
    pub name: Option<String>,
    pub steps: Vec<PolicyStep>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetPlatform {
    /// Concatenated marshalled structures, as consumed by older grub2.
    OldGrub,
    /// The TPM 2.0 Key File ASN.1 envelope.
    Tpm2Key,
    /// systemd's JSON policy file.
    Systemd,
}

impl FromStr for TargetPlatform {
    type Err = Error;

    fn from_str(s: &str) -> Result<TargetPlatform> {
        match s {
            "oldgrub" => Ok(TargetPlatform::OldGrub),
            "tpm2.0" => Ok(TargetPlatform::Tpm2Key),
            "systemd" => Ok(TargetPlatform::Systemd),
            other => Err(Error::Other(format!("unknown target platform `{other}`"))),
        }
    }
}

impl fmt::Display for TargetPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TargetPlatform::OldGrub => "oldgrub",
            TargetPlatform::Tpm2Key => "tpm2.0",
            TargetPlatform::Systemd => "systemd",
        })
    }
}

impl TargetPlatform {
    pub fn needs_input_file(&self) -> bool {
        true
    }

    pub fn needs_output_file(&self) -> bool {
        true
    }

    /// Only the legacy format needs the caller to restate the PCR
    /// selection at unseal time; the other envelopes store it.
    pub fn needs_pcr_selection(&self) -> bool {
        matches!(self, TargetPlatform::OldGrub)
    }

    /// Persist a freshly sealed secret. `selection` is the PCR selection
    /// the secret was sealed against, for formats that store the policy
    /// program alongside.
    pub fn write_sealed_secret(
        &self,
        path: &Path,
        sealed: &SealedObject,
        selection: Option<&[(u16, u32)]>,
    ) -> Result<()> {
        match self {
            TargetPlatform::OldGrub => legacy::write_sealed_secret(path, sealed),
            TargetPlatform::Tpm2Key | TargetPlatform::Systemd => {
                tpm2key::write_sealed_secret(path, sealed, selection)
            }
        }
    }

    /// Persist a signed policy. The systemd JSON format is updated
    /// through its own dedicated operation instead.
    #[allow(clippy::too_many_arguments)]
    pub fn write_signed_policy(
        &self,
        input: Option<&Path>,
        output: &Path,
        policy_name: Option<&str>,
        selections: &[(u16, u32)],
        public: &[u8],
        signature: &PolicySignature,
    ) -> Result<()> {
        match self {
            TargetPlatform::OldGrub => legacy::write_signature(output, signature),
            TargetPlatform::Tpm2Key => tpm2key::add_signed_policy(
                input,
                output,
                policy_name,
                selections,
                public,
                signature,
            ),
            TargetPlatform::Systemd => Err(Error::PlatformUnsupported("systemd")),
        }
    }
}
