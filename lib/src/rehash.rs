// SPDX-License-Identifier: MIT

//! The re-hash engine: replay the event log into a simulated bank while
//! substituting, for every event we know how to reproduce, the digest the
//! *next* boot will measure instead of the one the firmware recorded.

use std::fs;
use std::io::{Read, Seek, SeekFrom};

use log::{debug, warn};

use crate::algo::{digest_is_invalid, HashAlg};
use crate::bank::PcrBank;
use crate::bootentry::{self, BootEntry};
use crate::error::{Error, Result};
use crate::eventlog::Event;
use crate::events::{
    self, encode_utf16le, GrubCommand, GrubCommandKind, GrubFile, ParsedEvent, INITRD_EVENT_TAG_ID,
    LOAD_OPTIONS_EVENT_TAG_ID,
};
use crate::pefile::PeFile;
use crate::runtime::{dos_to_unix, unix_to_dos, Runtime};

/// What the predictor substitutes into the events it replays.
pub struct RehashContext<'a> {
    pub algo: &'static HashAlg,
    pub runtime: &'a Runtime,
    /// The boot entry expected to boot next, if one was selected.
    pub boot_entry: Option<BootEntry>,
    /// A changed boot-entry file on the EFI partition.
    pub boot_entry_path: Option<String>,
    /// Overrides the device name grub uses for the EFI partition.
    pub efi_partition: Option<String>,
    /// Fail the prediction instead of falling back to the firmware digest
    /// when a rehasher cannot produce a value.
    pub require_rehash: bool,
}

impl<'a> RehashContext<'a> {
    pub fn new(algo: &'static HashAlg, runtime: &'a Runtime) -> Self {
        RehashContext {
            algo,
            runtime,
            boot_entry: None,
            boot_entry_path: None,
            efi_partition: None,
            require_rehash: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RehashStrategy {
    /// Reuse the digest the firmware recorded.
    Copy,
    /// Recompute the digest from next-boot artifacts.
    Rehash,
}

pub fn strategy(ev: &Event) -> RehashStrategy {
    match ev.parsed {
        Some(_) => RehashStrategy::Rehash,
        None => RehashStrategy::Copy,
    }
}

fn rehash_efi_variable_contents(name: &str, ctx: &RehashContext) -> Result<Option<Vec<u8>>> {
    match ctx.runtime.read_efi_variable(name) {
        Ok(data) => Ok(Some(ctx.algo.digest(&data))),
        Err(err) => {
            warn!("unable to read EFI variable {name}: {err}");
            Ok(None)
        }
    }
}

fn rehash_efi_variable(var: &events::EfiVariable, ctx: &RehashContext) -> Result<Option<Vec<u8>>> {
    let name = var.runtime_name();
    let value = match ctx.runtime.read_efi_variable(&name) {
        Ok(value) => value,
        Err(err) => {
            warn!("unable to read EFI variable {name}: {err}");
            return Ok(None);
        }
    };
    let next = events::EfiVariable::new(var.guid, &var.name, value);
    Ok(Some(ctx.algo.digest(&next.measured_bytes())))
}

/// Where a boot-services image lives: the device path routes through a
/// partition node for ESP-resident images; anything else is looked up on
/// the system partition.
fn bsa_image_path(app: &events::BootServicesApp, ctx: &RehashContext) -> Option<std::path::PathBuf> {
    let logged_path = app.file_path.as_deref()?;
    if app.on_partition {
        Some(ctx.runtime.efi_file_path(logged_path))
    } else {
        Some(ctx.runtime.rootfs_file_path(&dos_to_unix(logged_path)))
    }
}

fn rehash_bsa(app: &events::BootServicesApp, ctx: &RehashContext) -> Result<Option<Vec<u8>>> {
    let path = match bsa_image_path(app, ctx) {
        Some(path) => path,
        None => return Ok(None),
    };
    debug!("computing Authenticode digest of {}", path.display());
    match PeFile::load_from_file(&path.to_string_lossy())
        .and_then(|pe| pe.authenticode(ctx.algo))
    {
        Ok(digest) => Ok(Some(digest)),
        Err(err) => {
            warn!("cannot re-hash boot services image {}: {err}", path.display());
            Ok(None)
        }
    }
}

/// Files loaded by grub (PCR 9). The interesting cases are the boot-entry
/// file, the kernel and the initrd, which all come from the *next* boot.
fn rehash_grub_file(file: &GrubFile, ctx: &RehashContext) -> Result<Option<Vec<u8>>> {
    let on_system_partition = match &file.device {
        None => true,
        Some(device) => {
            if device == "crypto0" {
                true
            } else if let Some(esp) = &ctx.efi_partition {
                // With an explicit EFI partition device, anything else
                // grub touched lives on the system partition
                device != esp
            } else {
                false
            }
        }
    };

    let digest = if on_system_partition {
        debug!("assuming {} resides on the system partition", file.path);
        ctx.runtime.digest_rootfs_file(ctx.algo, &file.path)
    } else if bootentry::is_boot_entry(&file.path) && ctx.boot_entry_path.is_some() {
        let path = ctx.boot_entry_path.as_deref().unwrap();
        debug!("substituting boot entry file {path}");
        ctx.runtime.digest_rootfs_file(ctx.algo, path)
    } else if bootentry::is_kernel(&file.path, ctx.runtime) && ctx.boot_entry.is_some() {
        match ctx.boot_entry.as_ref().unwrap().image_path.as_deref() {
            Some(image) => {
                debug!("substituting next kernel {image}");
                ctx.runtime.digest_efi_file(ctx.algo, image)
            }
            None => return Ok(None),
        }
    } else if bootentry::is_initrd(&file.path, ctx.runtime) && ctx.boot_entry.is_some() {
        match ctx.boot_entry.as_ref().unwrap().initrd_path.as_deref() {
            Some(initrd) => {
                debug!("substituting next initrd {initrd}");
                ctx.runtime.digest_efi_file(ctx.algo, initrd)
            }
            None => return Ok(None),
        }
    } else {
        debug!("assuming {} resides on the EFI partition", file.path);
        ctx.runtime.digest_efi_file(ctx.algo, &file.path)
    };

    match digest {
        Ok(digest) => Ok(Some(digest)),
        Err(err) => {
            warn!("cannot re-hash grub file {}: {err}", file.join());
            Ok(None)
        }
    }
}

/// Commands recorded by grub (PCR 8). `linux`, `initrd` and the kernel
/// command line are rebuilt with the next boot's paths and options.
fn rehash_grub_command(cmd: &GrubCommand, ctx: &RehashContext) -> Result<Option<Vec<u8>>> {
    let entry = ctx.boot_entry.as_ref();
    let options = entry.and_then(|e| e.options.as_deref()).unwrap_or("");

    let rebuilt = match cmd.kind {
        GrubCommandKind::Command => cmd.string.clone(),
        GrubCommandKind::Linux => match (entry.and_then(|e| e.image_path.as_deref()), &cmd.file) {
            (Some(image), Some(file)) => {
                format!("linux {} {}", file.with_path(image).join(), options)
            }
            _ => cmd.string.clone(),
        },
        GrubCommandKind::Initrd => match (entry.and_then(|e| e.initrd_path.as_deref()), &cmd.file)
        {
            (Some(initrd), Some(file)) => format!("initrd {}", file.with_path(initrd).join()),
            _ => cmd.string.clone(),
        },
        GrubCommandKind::KernelCmdline => {
            match (entry.and_then(|e| e.image_path.as_deref()), &cmd.file) {
                (Some(image), Some(file)) => {
                    format!("{} {}", file.with_path(image).join(), options)
                }
                _ => cmd.string.clone(),
            }
        }
    };

    debug!("hashed grub command: {rebuilt}");
    Ok(Some(ctx.algo.digest(rebuilt.as_bytes())))
}

/// The command line systemd-boot (or the kernel's EFI stub) measures:
/// `initrd=<dos path> <options>`, UTF-16LE with the terminating NUL.
fn rehash_kernel_cmdline(ev: &Event, ctx: &RehashContext) -> Result<Option<Vec<u8>>> {
    let entry = match &ctx.boot_entry {
        Some(entry) => entry,
        // Without a next-kernel selection the measurement is unchanged.
        None => return Ok(ev.digest_for(ctx.algo).map(|d| d.to_vec())),
    };
    if entry.image_path.is_none() {
        warn!("unable to identify the next kernel");
        return Ok(None);
    }
    let initrd = match entry.initrd_path.as_deref() {
        Some(initrd) => initrd,
        None => {
            warn!("unable to identify the next initrd");
            return Ok(None);
        }
    };

    let cmdline = format!(
        "initrd={} {}",
        unix_to_dos(initrd),
        entry.options.as_deref().unwrap_or("")
    );
    debug!("measuring kernel command line: {cmdline}");
    let mut utf16 = encode_utf16le(&cmdline);
    utf16.extend_from_slice(&[0, 0]);
    Ok(Some(ctx.algo.digest(&utf16)))
}

fn rehash_tag_initrd(ev: &Event, ctx: &RehashContext) -> Result<Option<Vec<u8>>> {
    let entry = match &ctx.boot_entry {
        Some(entry) => entry,
        None => return Ok(ev.digest_for(ctx.algo).map(|d| d.to_vec())),
    };
    let initrd = match entry.initrd_path.as_deref() {
        Some(initrd) => initrd,
        None => {
            warn!("unable to identify the next initrd");
            return Ok(None);
        }
    };
    debug!("measuring initrd: {initrd}");
    match ctx.runtime.digest_efi_file(ctx.algo, initrd) {
        Ok(digest) => Ok(Some(digest)),
        Err(err) => {
            warn!("cannot re-hash initrd {initrd}: {err}");
            Ok(None)
        }
    }
}

/// Re-read the GPT from the boot disk and rebuild the measured layout.
fn rehash_gpt(_gpt: &events::GptEvent, ctx: &RehashContext) -> Result<Option<Vec<u8>>> {
    let disk = match ctx.runtime.boot_disk() {
        Some(disk) => disk,
        None => return Ok(None),
    };

    let read = || -> Result<Vec<u8>> {
        let mut file = fs::File::open(disk)?;
        file.seek(SeekFrom::Start(512))?;
        let mut header = vec![0u8; 92];
        file.read_exact(&mut header)?;
        if &header[0..8] != b"EFI PART" {
            return Err(Error::Other(format!("{} has no GPT", disk.display())));
        }
        let header_size = u32::from_le_bytes(header[12..16].try_into().unwrap()) as usize;
        if header_size > 512 {
            return Err(Error::Other("implausible GPT header size".into()));
        }
        header.resize(header_size, 0);
        if header_size > 92 {
            file.read_exact(&mut header[92..])?;
        }

        let entry_lba = u64::from_le_bytes(header[72..80].try_into().unwrap());
        let num_entries = u32::from_le_bytes(header[80..84].try_into().unwrap()) as usize;
        let entry_size = u32::from_le_bytes(header[84..88].try_into().unwrap()) as usize;

        file.seek(SeekFrom::Start(entry_lba * 512))?;
        let mut populated = Vec::new();
        for _ in 0..num_entries {
            let mut entry = vec![0u8; entry_size];
            file.read_exact(&mut entry)?;
            // Entries with a zero type GUID are unused and not measured
            if entry[..16].iter().any(|b| *b != 0) {
                populated.push(entry);
            }
        }

        let mut out = header;
        out.extend_from_slice(&(populated.len() as u64).to_le_bytes());
        for entry in &populated {
            out.extend_from_slice(entry);
        }
        Ok(out)
    };

    match read() {
        Ok(data) => Ok(Some(ctx.algo.digest(&data))),
        Err(err) => {
            warn!("cannot re-read GPT from {}: {err}", disk.display());
            Ok(None)
        }
    }
}

/// Recompute one event's digest for the next boot. `None` means the
/// rehasher has nothing better than the firmware digest.
pub fn rehash_event(
    ev: &Event,
    parsed: &ParsedEvent,
    ctx: &RehashContext,
) -> Result<Option<Vec<u8>>> {
    match parsed {
        ParsedEvent::EfiVariable(var) => rehash_efi_variable(var, ctx),
        ParsedEvent::BootServicesApp(app) => rehash_bsa(app, ctx),
        ParsedEvent::Gpt(gpt) => rehash_gpt(gpt, ctx),
        ParsedEvent::GrubFile(file) => rehash_grub_file(file, ctx),
        ParsedEvent::GrubCommand(cmd) => rehash_grub_command(cmd, ctx),
        ParsedEvent::SystemdBoot(_) => rehash_kernel_cmdline(ev, ctx),
        ParsedEvent::ShimVariable(shim) => rehash_efi_variable_contents(&shim.efi_variable, ctx),
        ParsedEvent::KernelTag(tag) => match tag.event_id {
            LOAD_OPTIONS_EVENT_TAG_ID => rehash_kernel_cmdline(ev, ctx),
            INITRD_EVENT_TAG_ID => rehash_tag_initrd(ev, ctx),
            _ => Ok(None),
        },
    }
}

fn copied_digest(ev: &Event, algo: &'static HashAlg) -> Result<Vec<u8>> {
    ev.digest_for(algo)
        .map(|d| d.to_vec())
        .ok_or(Error::MissingDigest {
            offset: ev.file_offset,
            algo: algo.name,
        })
}

/// Replay the events into the bank, substituting predicted digests where
/// a rehasher is available. Events are parsed on demand.
pub fn predict_bank(events: &mut [Event], bank: &mut PcrBank, ctx: &RehashContext) -> Result<()> {
    for ev in events.iter_mut() {
        if !bank.wants_pcr(ev.pcr_index as usize) {
            continue;
        }
        if ev.parsed.is_none() {
            ev.parsed = events::parse_event(ev);
        }

        let digest = match strategy(ev) {
            RehashStrategy::Copy => copied_digest(ev, ctx.algo)?,
            RehashStrategy::Rehash => {
                let parsed = ev.parsed.as_ref().unwrap();
                match rehash_event(ev, parsed, ctx)? {
                    Some(digest) if !digest_is_invalid(&digest) => digest,
                    _ if ctx.require_rehash => {
                        return Err(Error::RehashRequired(parsed.describe()));
                    }
                    _ => copied_digest(ev, ctx.algo)?,
                }
            }
        };
        bank.extend(ev.pcr_index as usize, &digest)?;
    }
    Ok(())
}

/// Replay the events with the firmware digests only. With an empty rehash
/// context this reproduces the live PCR values at the end of boot.
pub fn replay_bank(events: &[Event], bank: &mut PcrBank) -> Result<()> {
    for ev in events {
        if !bank.wants_pcr(ev.pcr_index as usize) {
            continue;
        }
        bank.extend(ev.pcr_index as usize, &copied_digest(ev, bank.algo())?)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algo;
    use crate::eventlog::testutil::wrap_tpm1_record;
    use crate::eventlog::{EventLogReader, EV_IPL};
    use std::path::PathBuf;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "predict-pcrs-{tag}-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn ipl_event(pcr: u32, body: &[u8]) -> Event {
        let rec = wrap_tpm1_record(pcr, EV_IPL, &[0x77u8; 20], body);
        EventLogReader::new(rec.as_slice())
            .read_next()
            .unwrap()
            .unwrap()
    }

    #[test]
    fn grub_command_rebuild_uses_next_kernel() {
        let algo = algo::by_name("sha256").unwrap();
        let runtime = Runtime::default();
        let mut ctx = RehashContext::new(algo, &runtime);
        ctx.boot_entry = Some(BootEntry {
            image_path: Some("/boot/vmlinuz-6.5".into()),
            initrd_path: Some("/boot/initrd-6.5".into()),
            options: Some("root=/dev/sda2 quiet".into()),
            ..Default::default()
        });

        let cmd = GrubCommand::parse("grub_cmd: linux (hd0,gpt2)/boot/vmlinuz-6.4 quiet").unwrap();
        let digest = rehash_grub_command(&cmd, &ctx).unwrap().unwrap();
        assert_eq!(
            digest,
            algo.digest(b"linux (hd0,gpt2)/boot/vmlinuz-6.5 root=/dev/sda2 quiet")
        );

        let cmd = GrubCommand::parse("grub_cmd: initrd (hd0,gpt2)/boot/initrd-6.4").unwrap();
        let digest = rehash_grub_command(&cmd, &ctx).unwrap().unwrap();
        assert_eq!(digest, algo.digest(b"initrd (hd0,gpt2)/boot/initrd-6.5"));
    }

    #[test]
    fn grub_command_without_entry_keeps_recorded_text() {
        let algo = algo::by_name("sha256").unwrap();
        let runtime = Runtime::default();
        let ctx = RehashContext::new(algo, &runtime);

        let cmd = GrubCommand::parse("grub_cmd: set root=hd0").unwrap();
        let digest = rehash_grub_command(&cmd, &ctx).unwrap().unwrap();
        assert_eq!(digest, algo.digest(b"set root=hd0"));
    }

    #[test]
    fn kernel_cmdline_rebuild_is_utf16_with_nul() {
        let algo = algo::by_name("sha256").unwrap();
        let runtime = Runtime::default();
        let mut ctx = RehashContext::new(algo, &runtime);
        ctx.boot_entry = Some(BootEntry {
            image_path: Some("/fedora/6.5/linux".into()),
            initrd_path: Some("/fedora/6.5/initrd".into()),
            options: Some("rw quiet".into()),
            ..Default::default()
        });

        let ev = ipl_event(12, &encode_utf16le("initrd=old\0"));
        let digest = rehash_kernel_cmdline(&ev, &ctx).unwrap().unwrap();

        let mut expected = encode_utf16le("initrd=\\fedora\\6.5\\initrd rw quiet");
        expected.extend_from_slice(&[0, 0]);
        assert_eq!(digest, algo.digest(&expected));
    }

    #[test]
    fn kernel_cmdline_without_entry_copies_firmware_digest() {
        let algo = algo::by_name("sha1").unwrap();
        let runtime = Runtime::default();
        let ctx = RehashContext::new(algo, &runtime);
        let ev = ipl_event(12, &encode_utf16le("initrd=old\0"));
        let digest = rehash_kernel_cmdline(&ev, &ctx).unwrap().unwrap();
        assert_eq!(digest, vec![0x77u8; 20]);
    }

    #[test]
    fn grub_file_routes_to_next_kernel_image() {
        let algo = algo::by_name("sha256").unwrap();
        let sysroot = scratch_dir("sysroot");
        let esp = scratch_dir("esp");
        fs::create_dir_all(sysroot.join("etc/kernel")).unwrap();
        fs::write(sysroot.join("etc/kernel/entry-token"), "fedora\n").unwrap();
        fs::create_dir_all(esp.join("fedora/6.5")).unwrap();
        fs::write(esp.join("fedora/6.5/linux"), b"next kernel image").unwrap();

        let runtime = Runtime::default()
            .with_sysroot(&sysroot)
            .with_esp_dir(&esp);
        let mut ctx = RehashContext::new(algo, &runtime);
        ctx.boot_entry = Some(BootEntry {
            image_path: Some("/fedora/6.5/linux".into()),
            ..Default::default()
        });

        let file = GrubFile::parse("(hd0,gpt1)/fedora/6.4/linux-6.4").unwrap();
        let digest = rehash_grub_file(&file, &ctx).unwrap().unwrap();
        assert_eq!(digest, algo.digest(b"next kernel image"));

        fs::remove_dir_all(&sysroot).unwrap();
        fs::remove_dir_all(&esp).unwrap();
    }

    #[test]
    fn explicit_efi_partition_routes_other_devices_to_rootfs() {
        let algo = algo::by_name("sha256").unwrap();
        let sysroot = scratch_dir("otherdev");
        fs::create_dir_all(sysroot.join("grub2")).unwrap();
        fs::write(sysroot.join("grub2/grub.cfg"), b"menu config").unwrap();

        let runtime = Runtime::default().with_sysroot(&sysroot);
        let mut ctx = RehashContext::new(algo, &runtime);
        ctx.efi_partition = Some("hd0,gpt1".into());

        let file = GrubFile::parse("(hd0,gpt2)/grub2/grub.cfg").unwrap();
        let digest = rehash_grub_file(&file, &ctx).unwrap().unwrap();
        assert_eq!(digest, algo.digest(b"menu config"));

        fs::remove_dir_all(&sysroot).unwrap();
    }

    #[test]
    fn grub_file_on_system_partition() {
        let algo = algo::by_name("sha256").unwrap();
        let sysroot = scratch_dir("rootfile");
        fs::create_dir_all(sysroot.join("boot")).unwrap();
        fs::write(sysroot.join("boot/vmlinuz"), b"kernel bytes").unwrap();

        let runtime = Runtime::default().with_sysroot(&sysroot);
        let ctx = RehashContext::new(algo, &runtime);
        let file = GrubFile::parse("/boot/vmlinuz").unwrap();
        let digest = rehash_grub_file(&file, &ctx).unwrap().unwrap();
        assert_eq!(digest, algo.digest(b"kernel bytes"));

        fs::remove_dir_all(&sysroot).unwrap();
    }

    #[test]
    fn bsa_images_route_by_device_path_partition() {
        let algo = algo::by_name("sha256").unwrap();
        let runtime = Runtime::default()
            .with_sysroot(std::path::Path::new("/sysroot"))
            .with_esp_dir(std::path::Path::new("/boot/efi"));
        let ctx = RehashContext::new(algo, &runtime);

        // Loaded off a partition: resolved on the ESP
        let esp_app = events::BootServicesApp {
            image_location: 0,
            image_length: 0,
            file_path: Some("\\EFI\\fedora\\shimx64.efi".into()),
            on_partition: true,
        };
        assert_eq!(
            bsa_image_path(&esp_app, &ctx),
            Some(PathBuf::from("/boot/efi/EFI/fedora/shimx64.efi"))
        );

        // No partition node in the device path: system partition
        let rootfs_app = events::BootServicesApp {
            on_partition: false,
            ..esp_app.clone()
        };
        assert_eq!(
            bsa_image_path(&rootfs_app, &ctx),
            Some(PathBuf::from("/sysroot/EFI/fedora/shimx64.efi"))
        );

        // No file path at all: nothing to re-hash
        let pathless = events::BootServicesApp {
            file_path: None,
            ..esp_app
        };
        assert_eq!(bsa_image_path(&pathless, &ctx), None);
    }

    #[test]
    fn shim_event_hashes_bare_variable_contents() {
        let algo = algo::by_name("sha256").unwrap();
        let efivars = scratch_dir("efivars");
        let name = "MokListRT-605dab50-e046-4300-abb6-3dd810dd8b23";
        let mut payload = vec![7, 0, 0, 0]; // attributes header
        payload.extend_from_slice(b"mok contents");
        fs::write(efivars.join(name), &payload).unwrap();

        let runtime = Runtime::default().with_efivars_dir(&efivars);
        let ctx = RehashContext::new(algo, &runtime);
        let digest = rehash_efi_variable_contents(name, &ctx).unwrap().unwrap();
        assert_eq!(digest, algo.digest(b"mok contents"));

        fs::remove_dir_all(&efivars).unwrap();
    }

    #[test]
    fn tpm1_crtm_version_replay() {
        let algo = algo::by_name("sha1").unwrap();
        let mut log = Vec::new();
        log.extend(wrap_tpm1_record(0, 0x8, &[0u8; 20], b"1.0\0"));
        let events = EventLogReader::new(log.as_slice()).read_all().unwrap();

        let mut bank = PcrBank::new(algo, 1);
        replay_bank(&events, &mut bank).unwrap();

        // PCR0 := SHA1(20 zero bytes || 20 zero bytes)
        assert_eq!(bank.register(0), algo.digest(&[0u8; 40]).as_slice());
        assert_eq!(bank.valid_mask(), 1);
    }

    #[test]
    fn predict_without_rehashers_equals_replay() {
        let algo = algo::by_name("sha1").unwrap();
        let runtime = Runtime::default();
        let ctx = RehashContext::new(algo, &runtime);

        let mut log = Vec::new();
        log.extend(wrap_tpm1_record(0, 0x8, &[0x11u8; 20], b"1.0\0"));
        log.extend(wrap_tpm1_record(4, 0x4, &[0x22u8; 20], &[0, 0, 0, 0]));
        let mut events = EventLogReader::new(log.as_slice()).read_all().unwrap();

        let mut predicted = PcrBank::new(algo, 0b1_0001);
        predict_bank(&mut events, &mut predicted, &ctx).unwrap();

        let mut replayed = PcrBank::new(algo, 0b1_0001);
        replay_bank(&events, &mut replayed).unwrap();

        assert_eq!(predicted, replayed);
    }

    #[test]
    fn required_rehash_failure_is_fatal() {
        let algo = algo::by_name("sha1").unwrap();
        let efivars = scratch_dir("missing-efivars");
        let runtime = Runtime::default().with_efivars_dir(&efivars);
        let mut ctx = RehashContext::new(algo, &runtime);
        ctx.require_rehash = true;

        // A shim IPL event whose runtime variable does not exist
        let mut events = vec![ipl_event(14, b"MokList\0")];
        let mut bank = PcrBank::new(algo, 1 << 14);
        assert!(matches!(
            predict_bank(&mut events, &mut bank, &ctx),
            Err(Error::RehashRequired(_))
        ));

        fs::remove_dir_all(&efivars).unwrap();
    }

    #[test]
    fn empty_ipl_event_is_copied() {
        let algo = algo::by_name("sha1").unwrap();
        let runtime = Runtime::default();
        let ctx = RehashContext::new(algo, &runtime);

        let mut events = vec![ipl_event(8, b"")];
        let mut bank = PcrBank::new(algo, 1 << 8);
        predict_bank(&mut events, &mut bank, &ctx).unwrap();

        let expected = algo.digest_parts(&[&[0u8; 20], &[0x77u8; 20]]);
        assert_eq!(bank.register(8), expected.as_slice());
    }

    #[test]
    fn boot_entry_file_substitution() {
        let algo = algo::by_name("sha256").unwrap();
        let sysroot = scratch_dir("entryfile");
        fs::create_dir_all(sysroot.join("boot/efi/loader/entries")).unwrap();
        fs::write(
            sysroot.join("boot/efi/loader/entries/fedora-6.5.conf"),
            b"title next entry\n",
        )
        .unwrap();

        let runtime = Runtime::default().with_sysroot(&sysroot);
        let mut ctx = RehashContext::new(algo, &runtime);
        ctx.boot_entry_path = Some("/boot/efi/loader/entries/fedora-6.5.conf".into());

        let file = GrubFile::parse("(hd0,gpt1)/loader/entries/fedora-6.4.conf").unwrap();
        let digest = rehash_grub_file(&file, &ctx).unwrap().unwrap();
        assert_eq!(digest, algo.digest(b"title next entry\n"));

        fs::remove_dir_all(&sysroot).unwrap();
    }

    #[test]
    fn predict_applies_to_selected_pcrs_only() {
        let algo = algo::by_name("sha1").unwrap();
        let runtime = Runtime::default();
        let ctx = RehashContext::new(algo, &runtime);

        let mut events = vec![ipl_event(8, b""), ipl_event(9, b"")];
        let mut bank = PcrBank::new(algo, 1 << 9);
        predict_bank(&mut events, &mut bank, &ctx).unwrap();
        assert!(!bank.register_is_valid(8));
        assert!(bank.register_is_valid(9));
    }
}
