// SPDX-License-Identifier: MIT

//! Decoders turning raw event bytes into typed, re-hashable events.
//!
//! Dispatch is on the event type, with a secondary dispatch on the PCR
//! index for IPL events, which grub2, shim and systemd-boot use to record
//! free-form strings. An event that no decoder understands simply has no
//! parsed form and keeps its firmware digest during prediction.

use uuid::{uuid, Uuid};

use crate::eventlog::{
    Event, EV_EFI_BOOT_SERVICES_APPLICATION, EV_EFI_BOOT_SERVICES_DRIVER, EV_EFI_GPT_EVENT,
    EV_EFI_VARIABLE_AUTHORITY, EV_EFI_VARIABLE_BOOT, EV_EFI_VARIABLE_DRIVER_CONFIG, EV_EVENT_TAG,
    EV_IPL,
};

pub const GUID_GLOBAL_VARIABLE: Uuid = uuid!("8be4df61-93ca-11d2-aa0d-00e098032b8c");
pub const GUID_SECURITY_DATABASE: Uuid = uuid!("d719b2cb-3d3a-4596-a3bc-dad00e67656f");
pub const GUID_SHIM_LOCK: Uuid = uuid!("605dab50-e046-4300-abb6-3dd810dd8b23");

/// Measured by the kernel's EFI stub into PCR 9 for the command line.
pub const LOAD_OPTIONS_EVENT_TAG_ID: u32 = 0x8f3b_22ec;
/// Measured by the kernel's EFI stub into PCR 9 for the initrd.
pub const INITRD_EVENT_TAG_ID: u32 = 0x894e_64f6;

/// Shim IPL events name the variable without the RT suffix it is exposed
/// under at runtime.
const SHIM_VARIABLES: [(&str, &str); 4] = [
    ("MokList", "MokListRT"),
    ("MokListX", "MokListXRT"),
    ("MokListTrusted", "MokListTrustedRT"),
    ("SbatLevel", "SbatLevelRT"),
];

pub fn shim_variable_rt_name(short_name: &str) -> Option<String> {
    SHIM_VARIABLES
        .iter()
        .find(|(n, _)| *n == short_name)
        .map(|(_, rt)| format!("{rt}-{GUID_SHIM_LOCK}"))
}

// The little endian representation of a GUID variable name.
pub fn guid_to_le_bytes(guid: &Uuid) -> Vec<u8> {
    let mut bytes: Vec<u8> = guid.as_bytes().to_vec();
    bytes[0..4].reverse();
    bytes[4..6].reverse();
    bytes[6..8].reverse();
    // Bytes from 8 on are not reversed
    bytes
}

pub fn guid_from_le_bytes(bytes: &[u8; 16]) -> Uuid {
    let mut be = *bytes;
    be[0..4].reverse();
    be[4..6].reverse();
    be[6..8].reverse();
    Uuid::from_bytes(be)
}

pub fn decode_utf16le(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

pub fn encode_utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedEvent {
    EfiVariable(EfiVariable),
    BootServicesApp(BootServicesApp),
    Gpt(GptEvent),
    GrubFile(GrubFile),
    GrubCommand(GrubCommand),
    SystemdBoot(SystemdBoot),
    ShimVariable(ShimVariable),
    KernelTag(KernelTag),
}

impl ParsedEvent {
    pub fn describe(&self) -> String {
        match self {
            ParsedEvent::EfiVariable(v) => format!("EFI variable {}-{}", v.name, v.guid),
            ParsedEvent::BootServicesApp(b) => match &b.file_path {
                Some(path) => format!("EFI application {path}"),
                None => "EFI application (no file path)".into(),
            },
            ParsedEvent::Gpt(g) => format!("GPT partition table with {} entries", g.entries.len()),
            ParsedEvent::GrubFile(f) => format!("grub2 file load from {}", f.join()),
            ParsedEvent::GrubCommand(c) => {
                let topic = match c.kind {
                    GrubCommandKind::Command => "grub2 command",
                    GrubCommandKind::Linux => "grub2 linux command",
                    GrubCommandKind::Initrd => "grub2 initrd command",
                    GrubCommandKind::KernelCmdline => "grub2 kernel cmdline",
                };
                format!("{topic} \"{}\"", c.string)
            }
            ParsedEvent::SystemdBoot(s) => {
                format!("systemd boot event {}", s.decoded().trim_end_matches('\0'))
            }
            ParsedEvent::ShimVariable(s) => format!("shim loader {} event", s.name),
            ParsedEvent::KernelTag(t) => match t.event_id {
                LOAD_OPTIONS_EVENT_TAG_ID => {
                    "kernel command line (measured by the kernel)".into()
                }
                INITRD_EVENT_TAG_ID => "initrd (measured by the kernel)".into(),
                other => format!("kernel tag event {other:#x}"),
            },
        }
    }
}

/// An EFI variable measurement, recorded as the TCG `UEFI_VARIABLE_DATA`
/// structure: GUID, name length, data length, UTF-16LE name, data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EfiVariable {
    pub guid: Uuid,
    pub name: String,
    pub value: Vec<u8>,
}

impl EfiVariable {
    pub fn new(guid: Uuid, name: &str, value: Vec<u8>) -> Self {
        EfiVariable {
            guid,
            name: name.to_string(),
            value,
        }
    }

    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 32 {
            return None;
        }
        let guid = guid_from_le_bytes(data[0..16].try_into().unwrap());
        let name_len = u64::from_le_bytes(data[16..24].try_into().unwrap()) as usize;
        let data_len = u64::from_le_bytes(data[24..32].try_into().unwrap()) as usize;
        let name_bytes = name_len.checked_mul(2)?;
        if data.len() < 32 + name_bytes + data_len {
            return None;
        }
        let name = decode_utf16le(&data[32..32 + name_bytes]);
        let value = data[32 + name_bytes..32 + name_bytes + data_len].to_vec();
        Some(EfiVariable { guid, name, value })
    }

    /// The runtime name of this variable under efivarfs.
    pub fn runtime_name(&self) -> String {
        format!("{}-{}", self.name, self.guid)
    }

    /// Re-encode the structure that actually gets hashed, with this
    /// variable's (possibly substituted) value.
    pub fn measured_bytes(&self) -> Vec<u8> {
        let unicode_name = encode_utf16le(&self.name);
        let mut out = Vec::with_capacity(32 + unicode_name.len() + self.value.len());
        out.extend_from_slice(&guid_to_le_bytes(&self.guid));
        out.extend_from_slice(&(self.name.encode_utf16().count() as u64).to_le_bytes());
        out.extend_from_slice(&(self.value.len() as u64).to_le_bytes());
        out.extend_from_slice(&unicode_name);
        out.extend_from_slice(&self.value);
        out
    }
}

/// `UEFI_IMAGE_LOAD_EVENT`: where the firmware loaded a boot services
/// image from, including the device path it resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootServicesApp {
    pub image_location: u64,
    pub image_length: u64,
    /// File Path node of the device path, backslash-separated.
    pub file_path: Option<String>,
    /// Set when the device path routes through a partition node.
    pub on_partition: bool,
}

impl BootServicesApp {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 32 {
            return None;
        }
        let image_location = u64::from_le_bytes(data[0..8].try_into().unwrap());
        let image_length = u64::from_le_bytes(data[8..16].try_into().unwrap());
        // data[16..24] is the link-time address, which nothing needs.
        let path_len = u64::from_le_bytes(data[24..32].try_into().unwrap()) as usize;
        if data.len() < 32 + path_len {
            return None;
        }
        let (file_path, on_partition) = walk_device_path(&data[32..32 + path_len]);
        Some(BootServicesApp {
            image_location,
            image_length,
            file_path,
            on_partition,
        })
    }
}

/// Extract the File Path node (type 4, subtype 4) of a packed UEFI device
/// path, and whether a Hard Drive node (type 4, subtype 1) precedes it.
fn walk_device_path(mut data: &[u8]) -> (Option<String>, bool) {
    let mut file_path: Option<String> = None;
    let mut on_partition = false;

    while data.len() >= 4 {
        let node_type = data[0];
        let node_subtype = data[1];
        let node_len = u16::from_le_bytes([data[2], data[3]]) as usize;
        if node_len < 4 || node_len > data.len() {
            break;
        }
        match (node_type, node_subtype) {
            // End of device path
            (0x7f, _) => break,
            // Media / Hard Drive
            (0x04, 0x01) => on_partition = true,
            // Media / File Path: UTF-16LE, NUL-terminated
            (0x04, 0x04) => {
                let raw = decode_utf16le(&data[4..node_len]);
                let segment = raw.trim_end_matches('\0').to_string();
                file_path = Some(match file_path {
                    // Nested file path nodes concatenate
                    Some(prev) => format!("{}\\{}", prev.trim_end_matches('\\'), segment),
                    None => segment,
                });
            }
            _ => {}
        }
        data = &data[node_len..];
    }

    (file_path, on_partition)
}

/// `UEFI_GPT_DATA`: the GPT header followed by the populated partition
/// entries, as measured by the firmware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GptEvent {
    pub header: Vec<u8>,
    pub entry_size: usize,
    pub entries: Vec<Vec<u8>>,
}

impl GptEvent {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 92 || &data[0..8] != b"EFI PART" {
            return None;
        }
        let header_size = u32::from_le_bytes(data[12..16].try_into().unwrap()) as usize;
        if header_size < 92 || data.len() < header_size + 8 {
            return None;
        }
        let entry_size = u32::from_le_bytes(data[84..88].try_into().unwrap()) as usize;
        if entry_size == 0 {
            return None;
        }
        let header = data[..header_size].to_vec();
        let count =
            u64::from_le_bytes(data[header_size..header_size + 8].try_into().unwrap()) as usize;
        let mut entries = Vec::with_capacity(count);
        let mut pos = header_size + 8;
        for _ in 0..count {
            if data.len() < pos + entry_size {
                return None;
            }
            entries.push(data[pos..pos + entry_size].to_vec());
            pos += entry_size;
        }
        Some(GptEvent {
            header,
            entry_size,
            entries,
        })
    }

    /// Rebuild the measured layout: header, entry count, entries.
    pub fn measured_bytes(&self) -> Vec<u8> {
        let mut out = self.header.clone();
        out.extend_from_slice(&(self.entries.len() as u64).to_le_bytes());
        for entry in &self.entries {
            out.extend_from_slice(entry);
        }
        out
    }
}

/// Files on the EFI partition are recorded by grub as
/// `(hdX,gptY)/EFI/BOOT/some.file`; once grub has settled on the root
/// device the device part is omitted (kernel and initrd loads).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GrubFile {
    pub device: Option<String>,
    pub path: String,
}

impl GrubFile {
    pub fn parse(value: &str) -> Option<Self> {
        if let Some(rest) = value.strip_prefix('(') {
            let (device, path) = rest.split_once(')')?;
            Some(GrubFile {
                device: Some(device.to_string()),
                path: path.to_string(),
            })
        } else if value.starts_with('/') {
            Some(GrubFile {
                device: None,
                path: value.to_string(),
            })
        } else {
            None
        }
    }

    pub fn join(&self) -> String {
        match &self.device {
            Some(device) => format!("({device}){}", self.path),
            None => self.path.clone(),
        }
    }

    pub fn with_path(&self, path: &str) -> GrubFile {
        GrubFile {
            device: self.device.clone(),
            path: path.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrubCommandKind {
    Command,
    Linux,
    Initrd,
    KernelCmdline,
}

/// PCR 8 IPL events: `grub_cmd: …` and `kernel_cmdline: …`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrubCommand {
    pub kind: GrubCommandKind,
    pub string: String,
    pub file: Option<GrubFile>,
}

impl GrubCommand {
    pub fn parse(value: &str) -> Option<Self> {
        let word_len = value
            .find(|c: char| !(c.is_ascii_alphabetic() || c == '_'))
            .unwrap_or(value.len());
        let keyword = &value[..word_len];
        let arg = value[word_len..].strip_prefix(": ")?;

        let (kind, file) = match keyword {
            "grub_cmd" => {
                let mut words = arg.splitn(2, ' ');
                match (words.next(), words.next()) {
                    (Some("linux"), Some(rest)) => {
                        let file_word = rest.split(' ').next().unwrap_or("");
                        (GrubCommandKind::Linux, Some(GrubFile::parse(file_word)?))
                    }
                    (Some("initrd"), Some(rest)) => {
                        let file_word = rest.split(' ').next().unwrap_or("");
                        (GrubCommandKind::Initrd, Some(GrubFile::parse(file_word)?))
                    }
                    _ => (GrubCommandKind::Command, None),
                }
            }
            "kernel_cmdline" => {
                let file_word = arg.split(' ').next().unwrap_or("");
                (
                    GrubCommandKind::KernelCmdline,
                    Some(GrubFile::parse(file_word)?),
                )
            }
            _ => return None,
        };

        Some(GrubCommand {
            kind,
            string: arg.to_string(),
            file,
        })
    }
}

/// PCR 12 IPL events from systemd-boot: the raw UTF-16LE string including
/// its trailing NULs, exactly as measured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemdBoot {
    pub raw: Vec<u8>,
}

impl SystemdBoot {
    pub fn decoded(&self) -> String {
        decode_utf16le(&self.raw)
    }
}

/// PCR 14 IPL events from shim, naming one of its MOK state variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShimVariable {
    pub name: String,
    /// Runtime efivarfs name (`MokListRT-<guid>` and friends).
    pub efi_variable: String,
}

/// `EV_EVENT_TAG` payload: the kernel tags its own measurements of the
/// command line and the initrd.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelTag {
    pub event_id: u32,
    pub data: Vec<u8>,
}

impl KernelTag {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 8 {
            return None;
        }
        let event_id = u32::from_le_bytes(data[0..4].try_into().unwrap());
        let data_len = u32::from_le_bytes(data[4..8].try_into().unwrap()) as usize;
        if data.len() < 8 + data_len {
            return None;
        }
        if event_id != LOAD_OPTIONS_EVENT_TAG_ID && event_id != INITRD_EVENT_TAG_ID {
            return None;
        }
        Some(KernelTag {
            event_id,
            data: data[8..8 + data_len].to_vec(),
        })
    }
}

fn parse_ipl(ev: &Event) -> Option<ParsedEvent> {
    // Empty IPL events exist in the wild (old firmware); they keep the
    // firmware digest verbatim.
    if ev.data.is_empty() || ev.data[0] == 0 {
        return None;
    }

    if ev.pcr_index == 12 {
        return Some(ParsedEvent::SystemdBoot(SystemdBoot {
            raw: ev.data.clone(),
        }));
    }

    // grub2 and shim record the string including its trailing NUL byte.
    if *ev.data.last().unwrap() != 0 {
        return None;
    }
    let value = std::str::from_utf8(&ev.data[..ev.data.len() - 1]).ok()?;

    match ev.pcr_index {
        8 => GrubCommand::parse(value).map(ParsedEvent::GrubCommand),
        9 => GrubFile::parse(value).map(ParsedEvent::GrubFile),
        14 => {
            let efi_variable = shim_variable_rt_name(value)?;
            Some(ParsedEvent::ShimVariable(ShimVariable {
                name: value.to_string(),
                efi_variable,
            }))
        }
        _ => None,
    }
}

/// Decode an event's payload. `None` means "no decoder": the event is
/// replayed with the digest the firmware recorded.
pub fn parse_event(ev: &Event) -> Option<ParsedEvent> {
    match ev.event_type {
        EV_EVENT_TAG => KernelTag::parse(&ev.data).map(ParsedEvent::KernelTag),
        EV_IPL => parse_ipl(ev),
        EV_EFI_VARIABLE_AUTHORITY | EV_EFI_VARIABLE_BOOT | EV_EFI_VARIABLE_DRIVER_CONFIG => {
            EfiVariable::parse(&ev.data).map(ParsedEvent::EfiVariable)
        }
        EV_EFI_BOOT_SERVICES_APPLICATION | EV_EFI_BOOT_SERVICES_DRIVER => {
            BootServicesApp::parse(&ev.data).map(ParsedEvent::BootServicesApp)
        }
        EV_EFI_GPT_EVENT => GptEvent::parse(&ev.data).map(ParsedEvent::Gpt),
        _ => None,
    }
}
