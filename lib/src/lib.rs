// SPDX-License-Identifier: MIT

//! Predict the TPM PCR values of the *next* boot by replaying the
//! firmware event log with re-hashed digests, then gate sealed secrets
//! on the prediction: build `TPM2_PolicyPCR` / `TPM2_PolicyAuthorize`
//! digests, sign them, and read or write the sealed-secret envelopes a
//! boot loader consumes.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use tss_esapi::traits::Marshall;
use zeroize::Zeroizing;

pub mod algo;
pub mod bank;
pub mod bootentry;
pub mod envelope;
pub mod error;
pub mod eventlog;
pub mod events;
pub mod mu;
pub mod pefile;
pub mod rehash;
pub mod rsa;
pub mod runtime;
pub mod tpm;
pub mod unseal;

pub use bank::{parse_pcr_mask, PcrBank, PcrSelection};
pub use envelope::TargetPlatform;
pub use error::{Error, Result};
pub use runtime::Runtime;
pub use tpm::Tpm;

use bootentry::BootEntry;
use envelope::legacy;
use mu::PolicySignature;
use rehash::RehashContext;
use rsa::RsaPrivateKey;

/// Where the register values a secret is sealed against come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BankSource {
    /// Replay the event log, substituting next-boot digests.
    EventLog,
    /// Read the live PCRs.
    Current,
    /// All-zero registers (the shape authorized policies are built over).
    Zero,
    /// A textual `<index> <hex>` dump.
    Snapshot(PathBuf),
}

/// Options feeding the re-hash engine.
#[derive(Debug, Clone, Default)]
pub struct NextBoot {
    /// `auto` picks the newest boot entry; anything else is matched
    /// against entry version strings.
    pub next_kernel: Option<String>,
    pub boot_entry_path: Option<String>,
    pub efi_partition: Option<String>,
    pub require_rehash: bool,
}

fn resolve_boot_entry(runtime: &Runtime, next_kernel: Option<&str>) -> Result<Option<BootEntry>> {
    match next_kernel {
        None => Ok(None),
        Some("auto") => {
            let entry = bootentry::next_boot_entry(runtime)?;
            if let Some(entry) = &entry {
                debug!(
                    "next boot entry: {} {}",
                    entry.title.as_deref().unwrap_or("(untitled)"),
                    entry.version.as_deref().unwrap_or("")
                );
            }
            Ok(entry)
        }
        Some(version) => match bootentry::find_entry(runtime, version)? {
            Some(entry) => Ok(Some(entry)),
            None => Err(Error::Other(format!(
                "no boot entry with version `{version}`"
            ))),
        },
    }
}

/// Predict the post-boot PCR bank for the next boot.
pub fn predict_bank(
    runtime: &Runtime,
    selection: &PcrSelection,
    next_boot: &NextBoot,
) -> Result<PcrBank> {
    let mut reader = eventlog::EventLogReader::open(runtime)?;
    let mut events = reader.read_all()?;
    debug!(
        "replaying {} events from a TPMv{} log",
        events.len(),
        reader.tpm_version()
    );

    let mut ctx = RehashContext::new(selection.algo, runtime);
    ctx.boot_entry = resolve_boot_entry(runtime, next_boot.next_kernel.as_deref())?;
    ctx.boot_entry_path = next_boot.boot_entry_path.clone();
    ctx.efi_partition = next_boot.efi_partition.clone();
    ctx.require_rehash = next_boot.require_rehash;

    let mut bank = PcrBank::new(selection.algo, selection.pcr_mask);
    if let Some(locality) = reader.get_locality(0) {
        bank.set_locality(0, locality);
    }
    rehash::predict_bank(&mut events, &mut bank, &ctx)?;
    Ok(bank)
}

/// Materialize the bank an operation works on.
pub fn build_bank(
    tpm: &mut Tpm,
    runtime: &Runtime,
    selection: &PcrSelection,
    source: &BankSource,
    next_boot: &NextBoot,
) -> Result<PcrBank> {
    match source {
        BankSource::EventLog => predict_bank(runtime, selection, next_boot),
        BankSource::Current => {
            let mut bank = PcrBank::new(selection.algo, selection.pcr_mask);
            tpm.read_pcrs_into_bank(&mut bank)?;
            Ok(bank)
        }
        BankSource::Zero => {
            let mut bank = PcrBank::new(selection.algo, selection.pcr_mask);
            bank.init_from_zero();
            Ok(bank)
        }
        BankSource::Snapshot(path) => {
            let data = fs::read(path).map_err(|source| Error::File {
                path: path.clone(),
                source,
            })?;
            let mut bank = PcrBank::new(selection.algo, selection.pcr_mask);
            bank.init_from_snapshot(data.as_slice())?;
            Ok(bank)
        }
    }
}

fn read_secret(path: &Path) -> Result<Zeroizing<Vec<u8>>> {
    let data = fs::read(path).map_err(|source| Error::File {
        path: path.into(),
        source,
    })?;
    Ok(Zeroizing::new(data))
}

fn bank_selection_pairs(bank: &PcrBank) -> Vec<(u16, u32)> {
    vec![(bank.algo().tcg_id, bank.valid_mask())]
}

/// Seal a secret against the given bank's PCR policy.
pub fn seal_secret(
    tpm: &mut Tpm,
    platform: TargetPlatform,
    bank: &PcrBank,
    input: &Path,
    output: &Path,
) -> Result<()> {
    let secret = read_secret(input)?;
    let policy = tpm.pcr_policy(bank)?;
    let sealed = tpm.seal(&policy, &secret)?;
    platform.write_sealed_secret(output, &sealed, Some(&bank_selection_pairs(bank)))?;
    info!("sealed secret written to {}", output.display());
    Ok(())
}

/// Seal a secret under a previously created authorized-policy digest.
pub fn seal_secret_authorized(
    tpm: &mut Tpm,
    platform: TargetPlatform,
    authorized_policy: &Path,
    input: &Path,
    output: &Path,
) -> Result<()> {
    let policy = legacy::read_digest(authorized_policy)?;
    let secret = read_secret(input)?;
    let sealed = tpm.seal(&policy, &secret)?;
    platform.write_sealed_secret(output, &sealed, None)?;
    info!("sealed secret written to {}", output.display());
    Ok(())
}

/// Build the `TPM2_PolicyAuthorize` digest delegating the PCR policy for
/// `selection` to the holder of `private_key`, and store it.
pub fn authorized_policy_create(
    tpm: &mut Tpm,
    selection: &PcrSelection,
    private_key: &Path,
    output: &Path,
) -> Result<()> {
    let key = RsaPrivateKey::read(private_key)?;

    // The PCR policy is computed over all-zero registers; the actual
    // values are bound later, by signing each prediction.
    let mut zero_bank = PcrBank::new(selection.algo, selection.pcr_mask);
    zero_bank.init_from_zero();
    let pcr_policy = tpm.pcr_policy(&zero_bank)?;

    let authorized = tpm.authorized_policy(&pcr_policy, key.to_tss_public()?)?;
    legacy::write_digest(output, &authorized)?;
    info!("authorized policy written to {}", output.display());
    Ok(())
}

/// Sign the bank's PCR policy and store it in the platform's signed
/// policy shape.
pub fn sign_policy(
    tpm: &mut Tpm,
    platform: TargetPlatform,
    bank: &PcrBank,
    private_key: &Path,
    input: Option<&Path>,
    output: &Path,
    policy_name: Option<&str>,
) -> Result<()> {
    let key = RsaPrivateKey::read(private_key)?;
    let pcr_policy = tpm.pcr_policy(bank)?;
    let signature = PolicySignature {
        sig_alg: mu::TPM2_ALG_RSASSA,
        hash_alg: algo::TPM2_ALG_SHA256,
        signature: key.sign(&pcr_policy)?,
    };
    let public = key.to_tss_public()?.marshall()?;

    platform.write_signed_policy(
        input,
        output,
        policy_name,
        &bank_selection_pairs(bank),
        &public,
        &signature,
    )?;
    info!("signed PCR policy written to {}", output.display());
    Ok(())
}

/// Sign the bank's PCR policy into systemd's JSON policy file.
pub fn sign_policy_systemd(
    tpm: &mut Tpm,
    bank: &PcrBank,
    private_key: &Path,
    output: &Path,
) -> Result<()> {
    let key = RsaPrivateKey::read(private_key)?;
    let pcr_policy = tpm.pcr_policy(bank)?;
    let signature = key.sign(&pcr_policy)?;
    let fingerprint = key.public()?.fingerprint()?;

    envelope::systemd::add_entry(
        output,
        bank.algo().name,
        bank.pcr_mask(),
        &fingerprint,
        &pcr_policy,
        &signature,
    )?;
    info!("signed PCR policy written to {}", output.display());
    Ok(())
}

/// Store the public half of an RSA key as a marshalled `TPM2B_PUBLIC`,
/// the only format a boot loader can be expected to parse.
pub fn store_public_key(private_key: &Path, output: &Path) -> Result<()> {
    let key = RsaPrivateKey::read(private_key)?;
    let public = key.to_tss_public()?.marshall()?;
    runtime::write_file_atomic(output, &public)?;
    info!("public key written to {}", output.display());
    Ok(())
}

/// Read an RSA private key, generating and persisting one if the file
/// does not exist yet.
pub fn read_or_generate_key(path: &Path, bits: u32) -> Result<RsaPrivateKey> {
    if path.exists() {
        return RsaPrivateKey::read(path);
    }
    info!("generating {bits}-bit RSA key at {}", path.display());
    let key = RsaPrivateKey::generate(bits)?;
    key.write(path)?;
    RsaPrivateKey::read(path)
}
