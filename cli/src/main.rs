use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::LevelFilter;

use predict_pcrs_lib::envelope::TargetPlatform;
use predict_pcrs_lib::eventlog::EventLogReader;
use predict_pcrs_lib::unseal::{unseal_secret, UnsealRequest};
use predict_pcrs_lib::{
    algo, events, BankSource, NextBoot, PcrSelection, Runtime, Tpm,
};

#[derive(Parser, Debug)]
#[command(
    version,
    about,
    long_about = "Predict TPM PCR values for the next boot and seal secrets against them"
)]
struct Cli {
    /// Log verbosity. Defaults to Warn, -v for Info, -vv for Debug, -vvv for Trace
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// TCTI the TPM is reached through (e.g. device:/dev/tpmrm0, swtpm:port=2321)
    #[arg(long, global = true)]
    tcti: Option<String>,

    /// Path of the binary TCG event log
    #[arg(long, global = true)]
    log_path: Option<PathBuf>,

    /// Mount point of the EFI system partition
    #[arg(long, global = true)]
    esp: Option<PathBuf>,

    /// efivarfs directory
    #[arg(long, global = true)]
    efivars: Option<PathBuf>,

    /// Root filesystem prefix
    #[arg(long, global = true)]
    sysroot: Option<PathBuf>,

    /// Disk device carrying the GPT the firmware measured
    #[arg(long, global = true)]
    boot_disk: Option<PathBuf>,

    /// RSA key size for the SRK and for generated signing keys
    #[arg(long, global = true, default_value_t = 2048)]
    rsa_bits: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct PcrArgs {
    /// PCR bank algorithm (sha1, sha256, sha384, sha512, sm3_256)
    #[arg(long, default_value = "sha256")]
    algo: String,

    /// PCRs to cover: comma-separated indices and a-b ranges, e.g. 0-7,14
    #[arg(long)]
    pcrs: String,
}

impl PcrArgs {
    fn selection(&self) -> Result<PcrSelection> {
        Ok(PcrSelection {
            algo: algo::by_name(&self.algo)?,
            pcr_mask: predict_pcrs_lib::parse_pcr_mask(&self.pcrs)?,
        })
    }
}

#[derive(Args, Debug)]
struct SourceArgs {
    /// Register source: eventlog, current, zero, or snapshot:<path>
    #[arg(long, default_value = "eventlog")]
    from: String,

    /// Boot entry for the next boot: `auto` or an entry version string
    #[arg(long)]
    next_kernel: Option<String>,

    /// A changed boot-entry file to substitute during prediction
    #[arg(long)]
    boot_entry: Option<String>,

    /// Grub device name of the EFI partition (e.g. hd0,gpt1)
    #[arg(long)]
    efi_partition: Option<String>,

    /// Fail instead of reusing firmware digests when re-hashing is impossible
    #[arg(long, default_value_t = false)]
    strict: bool,
}

impl SourceArgs {
    fn bank_source(&self) -> Result<BankSource> {
        match self.from.as_str() {
            "eventlog" => Ok(BankSource::EventLog),
            "current" => Ok(BankSource::Current),
            "zero" => Ok(BankSource::Zero),
            other => match other.strip_prefix("snapshot:") {
                Some(path) => Ok(BankSource::Snapshot(PathBuf::from(path))),
                None => bail!("unknown register source `{other}`"),
            },
        }
    }

    fn next_boot(&self) -> NextBoot {
        NextBoot {
            next_kernel: self.next_kernel.clone(),
            boot_entry_path: self.boot_entry.clone(),
            efi_partition: self.efi_partition.clone(),
            require_rehash: self.strict,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Predict the PCR values of the next boot and print them
    Predict {
        #[command(flatten)]
        pcrs: PcrArgs,
        #[command(flatten)]
        source: SourceArgs,
        /// Write the snapshot here instead of standard output
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Dump the event log with parsed event descriptions
    ShowLog {},
    /// Seal a secret against the predicted PCR state
    SealSecret {
        #[command(flatten)]
        pcrs: PcrArgs,
        #[command(flatten)]
        source: SourceArgs,
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
        #[arg(long, default_value = "tpm2.0")]
        target_platform: String,
    },
    /// Unseal a previously sealed secret
    UnsealSecret {
        #[command(flatten)]
        pcrs: PcrArgs,
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
        #[arg(long, default_value = "tpm2.0")]
        target_platform: String,
        /// Detached signed policy (legacy format)
        #[arg(long)]
        signed_policy: Option<PathBuf>,
        /// Verification key for the signed policy
        #[arg(long)]
        public_key: Option<PathBuf>,
    },
    /// Authorized-policy workflows
    #[command(subcommand)]
    AuthorizedPolicy(AuthorizedPolicyCommand),
    /// Sign the predicted PCR policy with an RSA key
    SignPolicy {
        #[command(flatten)]
        pcrs: PcrArgs,
        #[command(flatten)]
        source: SourceArgs,
        #[arg(long)]
        private_key: PathBuf,
        /// Generate the private key if it does not exist
        #[arg(long, default_value_t = false)]
        generate_key: bool,
        /// Existing envelope to update (defaults to in-place on --output)
        #[arg(long)]
        input: Option<PathBuf>,
        #[arg(long)]
        output: PathBuf,
        /// Name of the policy inside the envelope
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value = "tpm2.0")]
        target_platform: String,
    },
    /// Sign the predicted PCR policy into systemd's JSON policy file
    PolicySignSystemd {
        #[command(flatten)]
        pcrs: PcrArgs,
        #[command(flatten)]
        source: SourceArgs,
        #[arg(long)]
        private_key: PathBuf,
        #[arg(long, default_value_t = false)]
        generate_key: bool,
        #[arg(long)]
        output: PathBuf,
    },
    /// Store the public half of an RSA key for the boot loader
    StorePublicKey {
        #[arg(long)]
        private_key: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum AuthorizedPolicyCommand {
    /// Create the authorized-policy digest for a PCR selection and key
    Create {
        #[command(flatten)]
        pcrs: PcrArgs,
        #[arg(long)]
        private_key: PathBuf,
        #[arg(long, default_value_t = false)]
        generate_key: bool,
        #[arg(long)]
        output: PathBuf,
    },
    /// Seal a secret under a stored authorized-policy digest
    SealSecret {
        #[arg(long)]
        authorized_policy: PathBuf,
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
        #[arg(long, default_value = "tpm2.0")]
        target_platform: String,
    },
    /// Unseal a secret sealed under an authorized policy
    UnsealSecret {
        #[command(flatten)]
        pcrs: PcrArgs,
        /// Detached signed policy (legacy format)
        #[arg(long)]
        signed_policy: Option<PathBuf>,
        /// Verification key for the signed policy
        #[arg(long)]
        public_key: Option<PathBuf>,
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
        #[arg(long, default_value = "tpm2.0")]
        target_platform: String,
    },
}

fn runtime_from(cli: &Cli) -> Runtime {
    let mut runtime = Runtime::default();
    if let Some(path) = &cli.log_path {
        runtime = runtime.with_eventlog_path(path);
    }
    if let Some(path) = &cli.esp {
        runtime = runtime.with_esp_dir(path);
    }
    if let Some(path) = &cli.efivars {
        runtime = runtime.with_efivars_dir(path);
    }
    if let Some(path) = &cli.sysroot {
        runtime = runtime.with_sysroot(path);
    }
    if let Some(path) = &cli.boot_disk {
        runtime = runtime.with_boot_disk(path);
    }
    runtime
}

fn connect_tpm(cli: &Cli) -> Result<Tpm> {
    let mut tpm = Tpm::new(cli.tcti.as_deref()).context("cannot connect to the TPM")?;
    tpm.set_srk_rsa_bits(cli.rsa_bits)?;
    Ok(tpm)
}

fn signing_key(path: &PathBuf, generate: bool, bits: u32) -> Result<PathBuf> {
    if generate {
        predict_pcrs_lib::read_or_generate_key(path, bits)?;
    }
    Ok(path.clone())
}

fn show_log(runtime: &Runtime) -> Result<()> {
    let mut reader = EventLogReader::open(runtime)?;
    while let Some(mut ev) = reader.read_next()? {
        println!(
            "{:05x}: event type={} pcr={} digests={} data={} bytes",
            ev.file_offset,
            ev.type_name(),
            ev.pcr_index,
            ev.digests.len(),
            ev.data.len()
        );
        ev.parsed = events::parse_event(&ev);
        if let Some(parsed) = &ev.parsed {
            println!("  {}", parsed.describe());
        }
        for digest in &ev.digests {
            let name = algo::by_tcg_id(digest.alg_id)
                .map(|a| a.name.to_string())
                .unwrap_or_else(|| format!("{:#x}", digest.alg_id));
            println!("  {:<10} {}", name, hex::encode(&digest.value));
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter(None, level)
        .format_timestamp(None)
        .init();

    let runtime = runtime_from(&cli);

    match &cli.command {
        Command::Predict {
            pcrs,
            source,
            output,
        } => {
            let selection = pcrs.selection()?;
            let bank = match source.bank_source()? {
                BankSource::EventLog => {
                    predict_pcrs_lib::predict_bank(&runtime, &selection, &source.next_boot())?
                }
                other => {
                    let mut tpm = connect_tpm(&cli)?;
                    predict_pcrs_lib::build_bank(
                        &mut tpm,
                        &runtime,
                        &selection,
                        &other,
                        &source.next_boot(),
                    )?
                }
            };
            match output {
                Some(path) => {
                    predict_pcrs_lib::runtime::write_file_atomic(path, bank.to_snapshot().as_bytes())?
                }
                None => print!("{}", bank.to_snapshot()),
            }
            Ok(())
        }

        Command::ShowLog {} => show_log(&runtime),

        Command::SealSecret {
            pcrs,
            source,
            input,
            output,
            target_platform,
        } => {
            let selection = pcrs.selection()?;
            let platform: TargetPlatform = target_platform.parse()?;
            let mut tpm = connect_tpm(&cli)?;
            let bank = predict_pcrs_lib::build_bank(
                &mut tpm,
                &runtime,
                &selection,
                &source.bank_source()?,
                &source.next_boot(),
            )?;
            predict_pcrs_lib::seal_secret(&mut tpm, platform, &bank, input, output)?;
            Ok(())
        }

        Command::UnsealSecret {
            pcrs,
            input,
            output,
            target_platform,
            signed_policy,
            public_key,
        } => {
            let platform: TargetPlatform = target_platform.parse()?;
            let selection = if platform.needs_pcr_selection() {
                Some(pcrs.selection()?)
            } else {
                None
            };
            let mut tpm = connect_tpm(&cli)?;
            unseal_secret(
                &mut tpm,
                &UnsealRequest {
                    platform,
                    input,
                    output,
                    selection,
                    signed_policy: signed_policy.as_deref(),
                    public_key: public_key.as_deref(),
                },
            )?;
            Ok(())
        }

        Command::AuthorizedPolicy(cmd) => match cmd {
            AuthorizedPolicyCommand::Create {
                pcrs,
                private_key,
                generate_key,
                output,
            } => {
                let selection = pcrs.selection()?;
                let key = signing_key(private_key, *generate_key, cli.rsa_bits)?;
                let mut tpm = connect_tpm(&cli)?;
                predict_pcrs_lib::authorized_policy_create(&mut tpm, &selection, &key, output)?;
                Ok(())
            }
            AuthorizedPolicyCommand::SealSecret {
                authorized_policy,
                input,
                output,
                target_platform,
            } => {
                let platform: TargetPlatform = target_platform.parse()?;
                let mut tpm = connect_tpm(&cli)?;
                predict_pcrs_lib::seal_secret_authorized(
                    &mut tpm,
                    platform,
                    authorized_policy,
                    input,
                    output,
                )?;
                Ok(())
            }
            AuthorizedPolicyCommand::UnsealSecret {
                pcrs,
                signed_policy,
                public_key,
                input,
                output,
                target_platform,
            } => {
                let platform: TargetPlatform = target_platform.parse()?;
                let selection = if platform.needs_pcr_selection() {
                    Some(pcrs.selection()?)
                } else {
                    None
                };
                let mut tpm = connect_tpm(&cli)?;
                unseal_secret(
                    &mut tpm,
                    &UnsealRequest {
                        platform,
                        input,
                        output,
                        selection,
                        signed_policy: signed_policy.as_deref(),
                        public_key: public_key.as_deref(),
                    },
                )?;
                Ok(())
            }
        },

        Command::SignPolicy {
            pcrs,
            source,
            private_key,
            generate_key,
            input,
            output,
            name,
            target_platform,
        } => {
            let selection = pcrs.selection()?;
            let platform: TargetPlatform = target_platform.parse()?;
            let key = signing_key(private_key, *generate_key, cli.rsa_bits)?;
            let mut tpm = connect_tpm(&cli)?;
            let bank = predict_pcrs_lib::build_bank(
                &mut tpm,
                &runtime,
                &selection,
                &source.bank_source()?,
                &source.next_boot(),
            )?;
            predict_pcrs_lib::sign_policy(
                &mut tpm,
                platform,
                &bank,
                &key,
                input.as_deref(),
                output,
                name.as_deref(),
            )?;
            Ok(())
        }

        Command::PolicySignSystemd {
            pcrs,
            source,
            private_key,
            generate_key,
            output,
        } => {
            let selection = pcrs.selection()?;
            let key = signing_key(private_key, *generate_key, cli.rsa_bits)?;
            let mut tpm = connect_tpm(&cli)?;
            let bank = predict_pcrs_lib::build_bank(
                &mut tpm,
                &runtime,
                &selection,
                &source.bank_source()?,
                &source.next_boot(),
            )?;
            predict_pcrs_lib::sign_policy_systemd(&mut tpm, &bank, &key, output)?;
            Ok(())
        }

        Command::StorePublicKey {
            private_key,
            output,
        } => {
            predict_pcrs_lib::store_public_key(private_key, output)?;
            Ok(())
        }
    }
}
