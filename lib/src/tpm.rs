// SPDX-License-Identifier: MIT

//! Everything that talks to the TPM: trial-session policy construction,
//! sealing under the SRK, live PCR reads and the policy-session unseal
//! path. One context, one outstanding command at a time; every transient
//! handle is flushed on every exit path.

use std::str::FromStr;

use log::{debug, info};
use tss_esapi::attributes::{ObjectAttributesBuilder, SessionAttributes};
use tss_esapi::constants::tss::{TPM2_RH_OWNER, TPM2_ST_VERIFIED};
use tss_esapi::constants::SessionType;
use tss_esapi::handles::KeyHandle;
use tss_esapi::interface_types::algorithm::{HashingAlgorithm, PublicAlgorithm};
use tss_esapi::interface_types::key_bits::RsaKeyBits;
use tss_esapi::interface_types::resource_handles::Hierarchy;
use tss_esapi::interface_types::session_handles::{AuthSession, HmacSession, PolicySession};
use tss_esapi::structures::{
    Auth, Digest, KeyedHashScheme, MaxBuffer, Nonce, PcrSelectionList, PcrSelectionListBuilder,
    PcrSlot, Private, Public, PublicBuilder, PublicKeyRsa, PublicKeyedHashParameters,
    PublicRsaParametersBuilder, RsaExponent, RsaSignature, SensitiveData, Signature,
    SymmetricDefinition, SymmetricDefinitionObject, VerifiedTicket,
};
use tss_esapi::tcti_ldr::{DeviceConfig, TctiNameConf};
use tss_esapi::traits::{Marshall, UnMarshall};
use tss_esapi::tss2_esys::{TPM2B_DIGEST, TPMT_TK_VERIFIED};
use zeroize::Zeroizing;

use crate::algo::{self, HashAlg};
use crate::bank::{PcrBank, PCR_BANK_REGISTER_MAX};
use crate::envelope::{PolicyStep, SealedObject};
use crate::error::{Error, Result};
use crate::mu::{self, PolicySignature};

pub fn hashing_algorithm(algo: &HashAlg) -> Result<HashingAlgorithm> {
    hashing_algorithm_from_tcg(algo.tcg_id)
}

pub fn hashing_algorithm_from_tcg(tcg_id: u16) -> Result<HashingAlgorithm> {
    match tcg_id {
        algo::TPM2_ALG_SHA1 => Ok(HashingAlgorithm::Sha1),
        algo::TPM2_ALG_SHA256 => Ok(HashingAlgorithm::Sha256),
        algo::TPM2_ALG_SHA384 => Ok(HashingAlgorithm::Sha384),
        algo::TPM2_ALG_SHA512 => Ok(HashingAlgorithm::Sha512),
        algo::TPM2_ALG_SM3_256 => Ok(HashingAlgorithm::Sm3_256),
        other => Err(Error::Other(format!("hash algorithm {other:#x} unusable with the TPM"))),
    }
}

fn pcr_slots_from_mask(pcr_mask: u32) -> Result<Vec<PcrSlot>> {
    (0..PCR_BANK_REGISTER_MAX)
        .filter(|i| pcr_mask & (1 << i) != 0)
        .map(|i| PcrSlot::try_from(1u32 << i).map_err(Error::from))
        .collect()
}

/// Build a `TPML_PCR_SELECTION` from (algorithm, mask) pairs.
pub fn selection_list(pairs: &[(u16, u32)]) -> Result<PcrSelectionList> {
    let mut builder = PcrSelectionListBuilder::new();
    for (alg_id, pcr_mask) in pairs {
        let slots = pcr_slots_from_mask(*pcr_mask)?;
        builder = builder.with_selection(hashing_algorithm_from_tcg(*alg_id)?, &slots);
    }
    Ok(builder.build()?)
}

/// The selection naming every *valid* register of the bank.
pub fn selection_for_bank(bank: &PcrBank) -> Result<PcrSelectionList> {
    selection_list(&[(bank.algo().tcg_id, bank.valid_mask())])
}

fn signature_to_tss(sig: &PolicySignature) -> Result<Signature> {
    let hash = hashing_algorithm_from_tcg(sig.hash_alg)?;
    let rsa = RsaSignature::create(hash, PublicKeyRsa::try_from(sig.signature.clone())?)?;
    match sig.sig_alg {
        mu::TPM2_ALG_RSASSA => Ok(Signature::RsaSsa(rsa)),
        mu::TPM2_ALG_RSAPSS => Ok(Signature::RsaPss(rsa)),
        other => Err(Error::Other(format!(
            "unsupported signature algorithm {other:#x}"
        ))),
    }
}

/// `TPM2_PolicyAuthorize` on a trial session only hashes its inputs, so
/// the verification ticket can be a null one.
fn null_verified_ticket() -> Result<VerifiedTicket> {
    let raw = TPMT_TK_VERIFIED {
        tag: TPM2_ST_VERIFIED,
        hierarchy: TPM2_RH_OWNER,
        digest: TPM2B_DIGEST {
            size: 0,
            buffer: [0u8; 64],
        },
    };
    Ok(VerifiedTicket::try_from(raw)?)
}

pub struct Tpm {
    context: tss_esapi::Context,
    srk_bits: RsaKeyBits,
}

impl Tpm {
    /// Connect through the named TCTI, the environment's, or the default
    /// device.
    pub fn new(tcti: Option<&str>) -> Result<Tpm> {
        let conf = match tcti {
            Some(name) => TctiNameConf::from_str(name)?,
            None => TctiNameConf::from_environment_variable()
                .unwrap_or_else(|_| TctiNameConf::Device(DeviceConfig::default())),
        };
        Ok(Tpm {
            context: tss_esapi::Context::new(conf)?,
            srk_bits: RsaKeyBits::Rsa2048,
        })
    }

    /// The SRK key size is configurable at process start; it must match
    /// whatever the boot loader derives.
    pub fn set_srk_rsa_bits(&mut self, bits: u32) -> Result<()> {
        self.srk_bits = match bits {
            1024 => RsaKeyBits::Rsa1024,
            2048 => RsaKeyBits::Rsa2048,
            3072 => RsaKeyBits::Rsa3072,
            4096 => RsaKeyBits::Rsa4096,
            other => {
                return Err(Error::Other(format!(
                    "unsupported SRK key size ({other} bits)"
                )))
            }
        };
        Ok(())
    }

    fn start_session(&mut self, session_type: SessionType) -> Result<AuthSession> {
        let session = self
            .context
            .start_auth_session(
                None,
                None,
                None,
                session_type,
                SymmetricDefinition::AES_128_CFB,
                HashingAlgorithm::Sha256,
            )?
            .ok_or_else(|| Error::PolicyBuild("unable to start auth session".into()))?;
        let (session_attributes, session_attributes_mask) = SessionAttributes::builder()
            .with_decrypt(true)
            .with_encrypt(true)
            .build();
        self.context
            .tr_sess_set_attributes(session, session_attributes, session_attributes_mask)?;
        Ok(session)
    }

    fn flush_session(&mut self, session: AuthSession) {
        let handle = match session {
            AuthSession::HmacSession(HmacSession::HmacSession {
                session_handle, ..
            }) => Some(session_handle),
            AuthSession::PolicySession(PolicySession::PolicySession {
                session_handle, ..
            }) => Some(session_handle),
            _ => None,
        };
        if let Some(handle) = handle {
            let _ = self.context.flush_context(handle.into());
        }
    }

    fn flush_key(&mut self, handle: KeyHandle) {
        let _ = self.context.flush_context(handle.into());
    }

    /// Read the live PCRs into the bank. `TPM2_PCR_Read` returns at most
    /// 8 digests per call, so wider masks go in chunks.
    pub fn read_pcrs_into_bank(&mut self, bank: &mut PcrBank) -> Result<()> {
        let alg_id = bank.algo().tcg_id;
        for chunk_offset in (0..PCR_BANK_REGISTER_MAX).step_by(8) {
            let chunk_mask = bank.pcr_mask() & (0xffu32 << chunk_offset);
            if chunk_mask == 0 {
                continue;
            }
            debug!("reading PCR chunk starting at {chunk_offset}");
            let selection = selection_list(&[(alg_id, chunk_mask)])?;
            let (_, _, digests) = self
                .context
                .execute_without_session(|ctx| ctx.pcr_read(selection))?;

            let mut values = digests.value().iter();
            for index in 0..PCR_BANK_REGISTER_MAX {
                if chunk_mask & (1 << index) == 0 {
                    continue;
                }
                let value = match values.next() {
                    Some(d) => d.value(),
                    None => break,
                };
                if value.is_empty() {
                    continue;
                }
                bank.set_register(index, value)?;
            }
        }
        Ok(())
    }

    /// The composite digest `TPM2_PolicyPCR` expects: the concatenated
    /// valid registers, hashed by the TPM through a hash sequence (the
    /// concatenation can exceed a single `TPM2B_MAX_BUFFER`).
    fn pcr_composite_digest(&mut self, bank: &PcrBank) -> Result<Digest> {
        let alg = hashing_algorithm(bank.algo())?;
        let sequence = self
            .context
            .execute_with_nullauth_session(|ctx| ctx.hash_sequence_start(Auth::default(), alg))?;

        let mut failure: Option<Error> = None;
        for (_, value) in bank.valid_registers() {
            let buffer = match MaxBuffer::try_from(value.to_vec()) {
                Ok(buffer) => buffer,
                Err(err) => {
                    failure = Some(err.into());
                    break;
                }
            };
            if let Err(err) = self
                .context
                .execute_with_nullauth_session(|ctx| ctx.sequence_update(sequence, buffer))
            {
                failure = Some(err.into());
                break;
            }
        }

        // Complete the sequence even after a failed update, otherwise the
        // sequence object stays live in the TPM.
        let completion = self.context.execute_with_nullauth_session(|ctx| {
            ctx.sequence_complete(sequence, MaxBuffer::default(), Hierarchy::Null)
        });

        match (failure, completion) {
            (Some(err), _) => Err(err),
            (None, Ok((digest, _))) => Ok(digest),
            (None, Err(err)) => Err(err.into()),
        }
    }

    fn in_trial_session<T>(
        &mut self,
        f: impl FnOnce(&mut Self, PolicySession) -> Result<T>,
    ) -> Result<T> {
        let session = self.start_session(SessionType::Trial)?;
        let policy_session = match PolicySession::try_from(session) {
            Ok(ps) => ps,
            Err(err) => {
                self.flush_session(session);
                return Err(err.into());
            }
        };
        let result = f(self, policy_session);
        self.flush_session(session);
        result
    }

    /// Build the `TPM2_PolicyPCR` digest for a predicted bank.
    pub fn pcr_policy(&mut self, bank: &PcrBank) -> Result<Vec<u8>> {
        let selection = selection_for_bank(bank)?;
        let composite = self.pcr_composite_digest(bank)?;
        debug!(
            "building PCR policy over bank {} (valid mask {:#x})",
            bank.algo().name,
            bank.valid_mask()
        );
        self.in_trial_session(|tpm, session| {
            tpm.context.policy_pcr(session, composite, selection)?;
            let digest = tpm.context.policy_get_digest(session)?;
            Ok(digest.value().to_vec())
        })
        .map_err(|err| Error::PolicyBuild(err.to_string()))
    }

    /// Wrap a PCR policy in a `TPM2_PolicyAuthorize` digest bound to the
    /// given verification key.
    pub fn authorized_policy(&mut self, pcr_policy: &[u8], public: Public) -> Result<Vec<u8>> {
        let key_handle = self.context.load_external_public(public, Hierarchy::Owner)?;
        let result = (|tpm: &mut Self| {
            let key_name = tpm.context.tr_get_name(key_handle.into())?;
            tpm.in_trial_session(|tpm, session| {
                tpm.context.policy_authorize(
                    session,
                    Digest::try_from(pcr_policy.to_vec())?,
                    Nonce::default(),
                    &key_name,
                    null_verified_ticket()?,
                )?;
                let digest = tpm.context.policy_get_digest(session)?;
                Ok(digest.value().to_vec())
            })
        })(self);
        self.flush_key(key_handle);
        result.map_err(|err| Error::PolicyBuild(err.to_string()))
    }

    fn srk_template(&self) -> Result<Public> {
        // grub2 derives the SRK with the NODA attribute, so the sealing
        // side has to match or names will differ.
        let object_attributes = ObjectAttributesBuilder::new()
            .with_fixed_tpm(true)
            .with_fixed_parent(true)
            .with_sensitive_data_origin(true)
            .with_user_with_auth(true)
            .with_decrypt(true)
            .with_restricted(true)
            .with_no_da(true)
            .build()?;
        Ok(PublicBuilder::new()
            .with_public_algorithm(PublicAlgorithm::Rsa)
            .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
            .with_object_attributes(object_attributes)
            .with_rsa_parameters(
                PublicRsaParametersBuilder::new_restricted_decryption_key(
                    SymmetricDefinitionObject::AES_128_CFB,
                    self.srk_bits,
                    RsaExponent::create(0)?,
                )
                .build()?,
            )
            .with_rsa_unique_identifier(PublicKeyRsa::default())
            .build()?)
    }

    fn create_srk(&mut self) -> Result<KeyHandle> {
        let template = self.srk_template()?;
        let result = self.context.execute_with_nullauth_session(|ctx| {
            ctx.create_primary(Hierarchy::Owner, template, None, None, None, None)
        })?;
        Ok(result.key_handle)
    }

    fn sealed_object_template(&self, policy: &[u8]) -> Result<Public> {
        let object_attributes = ObjectAttributesBuilder::new()
            .with_fixed_tpm(true)
            .with_fixed_parent(true)
            .build()?;
        Ok(PublicBuilder::new()
            .with_public_algorithm(PublicAlgorithm::KeyedHash)
            .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
            .with_object_attributes(object_attributes)
            .with_auth_policy(Digest::try_from(policy.to_vec())?)
            .with_keyed_hash_parameters(PublicKeyedHashParameters::new(KeyedHashScheme::Null))
            .with_keyed_hash_unique_identifier(Digest::default())
            .build()?)
    }

    /// Seal `secret` under a fresh SRK, gated on `policy`.
    pub fn seal(&mut self, policy: &[u8], secret: &[u8]) -> Result<SealedObject> {
        let sensitive = SensitiveData::try_from(secret.to_vec())?;
        let template = self.sealed_object_template(policy)?;

        // Deriving the SRK can take the TPM many seconds
        info!("sealing secret - this may take a moment");
        let srk = self.create_srk()?;
        let created = self
            .context
            .execute_with_nullauth_session(|ctx| {
                ctx.create(srk, template, None, Some(sensitive), None, None)
            })
            .map_err(Error::from);
        self.flush_key(srk);

        let created = created?;
        Ok(SealedObject {
            public: created.out_public.marshall()?,
            private: mu::marshal_tpm2b(created.out_private.value()),
        })
    }

    fn policy_authorize_step(
        &mut self,
        session: PolicySession,
        public_bytes: &[u8],
        policy_ref: &[u8],
        signature: &PolicySignature,
    ) -> Result<()> {
        // The session digest accumulated so far is what the signature
        // vouches for; the TPM verifies over its hash.
        let approved = self.context.policy_get_digest(session)?;
        let hash_alg = hashing_algorithm_from_tcg(signature.hash_alg)?;
        let (approved_hash, _) = self.context.execute_without_session(|ctx| {
            ctx.hash(
                MaxBuffer::try_from(approved.value().to_vec())?,
                hash_alg,
                Hierarchy::Null,
            )
        })?;

        let public = Public::unmarshall(public_bytes)?;
        let key_handle = self.context.load_external_public(public, Hierarchy::Owner)?;
        let result = (|tpm: &mut Self| {
            let key_name = tpm.context.tr_get_name(key_handle.into())?;
            let ticket =
                tpm.context
                    .verify_signature(key_handle, approved_hash, signature_to_tss(signature)?)?;
            tpm.context.policy_authorize(
                session,
                approved,
                Nonce::try_from(policy_ref.to_vec())?,
                &key_name,
                ticket,
            )?;
            Ok(())
        })(self);
        self.flush_key(key_handle);
        result
    }

    fn run_policy_steps(&mut self, session: PolicySession, steps: &[PolicyStep]) -> Result<()> {
        for step in steps {
            match step {
                PolicyStep::PcrPolicy {
                    pcr_digest,
                    selections,
                } => {
                    let list = selection_list(selections)?;
                    self.context
                        .policy_pcr(session, Digest::try_from(pcr_digest.clone())?, list)?;
                }
                PolicyStep::Authorize {
                    public,
                    policy_ref,
                    signature,
                } => self.policy_authorize_step(session, public, policy_ref, signature)?,
            }
        }
        Ok(())
    }

    fn unseal_once(&mut self, object: KeyHandle, steps: &[PolicyStep]) -> Result<Zeroizing<Vec<u8>>> {
        let session = self.start_session(SessionType::Policy)?;
        let result = (|tpm: &mut Self| {
            let policy_session = PolicySession::try_from(session)?;
            tpm.run_policy_steps(policy_session, steps)?;
            let sensitive = tpm
                .context
                .execute_with_session(Some(session), |ctx| ctx.unseal(object.into()))?;
            Ok(Zeroizing::new(sensitive.value().to_vec()))
        })(self);
        self.flush_session(session);
        result
    }

    /// Load the sealed object and try each stored policy program in
    /// order; the first one the TPM accepts unseals the secret.
    pub fn unseal_with_programs(
        &mut self,
        sealed: &SealedObject,
        programs: &[Vec<PolicyStep>],
    ) -> Result<Zeroizing<Vec<u8>>> {
        let public = Public::unmarshall(&sealed.public)?;
        let mut private_input = sealed.private.as_slice();
        let private = Private::try_from(mu::unmarshal_tpm2b(&mut private_input)?)?;

        info!("unsealing secret - this may take a moment");
        let srk = self.create_srk()?;
        let loaded = match self
            .context
            .execute_with_nullauth_session(|ctx| ctx.load(srk, private, public))
        {
            Ok(handle) => handle,
            Err(err) => {
                self.flush_key(srk);
                return Err(Error::from(err));
            }
        };

        let mut outcome: Result<Zeroizing<Vec<u8>>> = Err(Error::UnsealDenied);
        for steps in programs {
            match self.unseal_once(loaded, steps) {
                Ok(secret) => {
                    outcome = Ok(secret);
                    break;
                }
                Err(err) => debug!("stored policy did not unseal: {err}"),
            }
        }

        self.flush_key(loaded);
        self.flush_key(srk);
        outcome
    }
}
