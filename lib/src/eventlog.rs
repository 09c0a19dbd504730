// SPDX-License-Identifier: MIT

//! Reader for the binary TCG event log the kernel exposes at
//! `/sys/kernel/security/tpm0/binary_bios_measurements`.
//!
//! Every record is laid out as
//! `u32 pcr_index | u32 event_type | digests | u32 event_size | data`,
//! all integers little-endian. TPMv1 logs carry a single SHA-1 digest per
//! event; TPMv2 ("crypto agile") logs carry a counted list of
//! `(u16 algorithm, digest)` pairs whose sizes are declared by the
//! Spec ID Event03 header record.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};

use log::debug;

use crate::algo::{self, HashAlg, TPM2_ALG_SHA1};
use crate::error::{Error, Result};
use crate::events::ParsedEvent;
use crate::runtime::Runtime;

pub const EV_PREBOOT_CERT: u32 = 0x0;
pub const EV_POST_CODE: u32 = 0x1;
pub const EV_NO_ACTION: u32 = 0x3;
pub const EV_SEPARATOR: u32 = 0x4;
pub const EV_ACTION: u32 = 0x5;
pub const EV_EVENT_TAG: u32 = 0x6;
pub const EV_S_CRTM_CONTENTS: u32 = 0x7;
pub const EV_S_CRTM_VERSION: u32 = 0x8;
pub const EV_CPU_MICROCODE: u32 = 0x9;
pub const EV_PLATFORM_CONFIG_FLAGS: u32 = 0xa;
pub const EV_TABLE_OF_DEVICES: u32 = 0xb;
pub const EV_COMPACT_HASH: u32 = 0xc;
pub const EV_IPL: u32 = 0xd;
pub const EV_IPL_PARTITION_DATA: u32 = 0xe;
pub const EV_OMIT_BOOT_DEVICE_EVENTS: u32 = 0x12;
pub const EV_EFI_VARIABLE_DRIVER_CONFIG: u32 = 0x8000_0001;
pub const EV_EFI_VARIABLE_BOOT: u32 = 0x8000_0002;
pub const EV_EFI_BOOT_SERVICES_APPLICATION: u32 = 0x8000_0003;
pub const EV_EFI_BOOT_SERVICES_DRIVER: u32 = 0x8000_0004;
pub const EV_EFI_RUNTIME_SERVICES_DRIVER: u32 = 0x8000_0005;
pub const EV_EFI_GPT_EVENT: u32 = 0x8000_0006;
pub const EV_EFI_ACTION: u32 = 0x8000_0007;
pub const EV_EFI_PLATFORM_FIRMWARE_BLOB: u32 = 0x8000_0008;
pub const EV_EFI_HANDOFF_TABLES: u32 = 0x8000_0009;
pub const EV_EFI_VARIABLE_BOOT2: u32 = 0x8000_000c;
pub const EV_EFI_VARIABLE_AUTHORITY: u32 = 0x8000_00e0;

/// Hard sanity cap on a single event record.
const MAX_EVENT_SIZE: u32 = 1024 * 1024;

const SPEC_ID_SIGNATURE: &[u8; 16] = b"Spec ID Event03\0";
const STARTUP_LOCALITY_SIGNATURE: &[u8; 16] = b"StartupLocality\0";

pub fn event_type_to_string(event_type: u32) -> String {
    let name = match event_type {
        EV_PREBOOT_CERT => "EVENT_PREBOOT_CERT",
        EV_POST_CODE => "EVENT_POST_CODE",
        EV_NO_ACTION => "EVENT_NO_ACTION",
        EV_SEPARATOR => "EVENT_SEPARATOR",
        EV_ACTION => "EVENT_ACTION",
        EV_EVENT_TAG => "EVENT_EVENT_TAG",
        EV_S_CRTM_CONTENTS => "EVENT_S_CRTM_CONTENTS",
        EV_S_CRTM_VERSION => "EVENT_S_CRTM_VERSION",
        EV_CPU_MICROCODE => "EVENT_CPU_MICROCODE",
        EV_PLATFORM_CONFIG_FLAGS => "EVENT_PLATFORM_CONFIG_FLAGS",
        EV_TABLE_OF_DEVICES => "EVENT_TABLE_OF_DEVICES",
        EV_COMPACT_HASH => "EVENT_COMPACT_HASH",
        EV_IPL => "EVENT_IPL",
        EV_IPL_PARTITION_DATA => "EVENT_IPL_PARTITION_DATA",
        EV_OMIT_BOOT_DEVICE_EVENTS => "EVENT_OMIT_BOOT_DEVICE_EVENTS",
        EV_EFI_VARIABLE_DRIVER_CONFIG => "EFI_VARIABLE_DRIVER_CONFIG",
        EV_EFI_VARIABLE_BOOT => "EFI_VARIABLE_BOOT",
        EV_EFI_BOOT_SERVICES_APPLICATION => "EFI_BOOT_SERVICES_APPLICATION",
        EV_EFI_BOOT_SERVICES_DRIVER => "EFI_BOOT_SERVICES_DRIVER",
        EV_EFI_RUNTIME_SERVICES_DRIVER => "EFI_RUNTIME_SERVICES_DRIVER",
        EV_EFI_GPT_EVENT => "EFI_GPT_EVENT",
        EV_EFI_ACTION => "EFI_ACTION",
        EV_EFI_PLATFORM_FIRMWARE_BLOB => "EFI_PLATFORM_FIRMWARE_BLOB",
        EV_EFI_HANDOFF_TABLES => "EFI_HANDOFF_TABLES",
        EV_EFI_VARIABLE_BOOT2 => "EFI_VARIABLE_BOOT2",
        EV_EFI_VARIABLE_AUTHORITY => "EFI_VARIABLE_AUTHORITY",
        other => return format!("{other:#x}"),
    };
    name.to_string()
}

/// One digest recorded by the firmware for an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDigest {
    pub alg_id: u16,
    pub value: Vec<u8>,
}

/// One record of the event log. The firmware-recorded digests are never
/// mutated; re-hashing produces replacement digests on the side.
#[derive(Debug, Clone)]
pub struct Event {
    pub index: usize,
    pub pcr_index: u32,
    pub event_type: u32,
    pub file_offset: u64,
    pub data: Vec<u8>,
    pub digests: Vec<EventDigest>,
    pub parsed: Option<ParsedEvent>,
}

impl Event {
    pub fn digest_for(&self, algo: &HashAlg) -> Option<&[u8]> {
        self.digests
            .iter()
            .find(|d| d.alg_id == algo.tcg_id)
            .map(|d| d.value.as_slice())
    }

    pub fn type_name(&self) -> String {
        event_type_to_string(self.event_type)
    }
}

struct Tcg2Info {
    platform_class: u32,
    spec_version_major: u8,
    spec_version_minor: u8,
    /// Digest sizes declared by the log header, including algorithms we do
    /// not implement. Later events for such algorithms can then at least
    /// be walked over.
    algorithm_sizes: HashMap<u16, usize>,
}

pub struct EventLogReader<R: Read> {
    src: R,
    offset: u64,
    tpm_version: u32,
    event_count: usize,
    tcg2: Option<Tcg2Info>,
    pcr0_locality: Option<u8>,
}

impl EventLogReader<BufReader<File>> {
    /// Open the event log at the runtime's configured path.
    pub fn open(runtime: &Runtime) -> Result<Self> {
        Ok(Self::new(BufReader::new(runtime.open_eventlog()?)))
    }
}

impl<R: Read> EventLogReader<R> {
    pub fn new(src: R) -> Self {
        EventLogReader {
            src,
            offset: 0,
            tpm_version: 1,
            event_count: 0,
            tcg2: None,
            pcr0_locality: None,
        }
    }

    pub fn tpm_version(&self) -> u32 {
        self.tpm_version
    }

    pub fn event_count(&self) -> usize {
        self.event_count
    }

    /// The startup locality recorded for a PCR, if the log declares one.
    /// Only PCR 0 ever has one.
    pub fn get_locality(&self, pcr_index: u32) -> Option<u8> {
        if pcr_index == 0 {
            self.pcr0_locality
        } else {
            None
        }
    }

    fn read_exactly(&mut self, buf: &mut [u8]) -> Result<()> {
        self.src
            .read_exact(buf)
            .map_err(|_| Error::EventLog("premature end of file".into()))?;
        self.offset += buf.len() as u64;
        Ok(())
    }

    fn read_u16le(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_exactly(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32le(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exactly(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Read the leading u32 of a record, reporting clean end-of-log as
    /// `None`. EOF in the middle of the word is still fatal.
    fn read_u32le_or_eof(&mut self) -> Result<Option<u32>> {
        let mut buf = [0u8; 4];
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.src.read(&mut buf[filled..])?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(Error::EventLog("premature end of file".into()));
            }
            filled += n;
        }
        self.offset += buf.len() as u64;
        Ok(Some(u32::from_le_bytes(buf)))
    }

    fn digest_size(&self, alg_id: u16) -> Result<usize> {
        if let Some(algo) = algo::by_tcg_id(alg_id) {
            return Ok(algo.digest_size);
        }
        self.tcg2
            .as_ref()
            .and_then(|info| info.algorithm_sizes.get(&alg_id).copied())
            .ok_or(Error::UnknownLogAlgorithm(alg_id))
    }

    fn read_digest(&mut self, alg_id: u16) -> Result<EventDigest> {
        let size = self.digest_size(alg_id)?;
        let mut value = vec![0u8; size];
        self.read_exactly(&mut value)?;
        Ok(EventDigest { alg_id, value })
    }

    fn read_digests_tpm1(&mut self) -> Result<Vec<EventDigest>> {
        Ok(vec![self.read_digest(TPM2_ALG_SHA1)?])
    }

    fn read_digests_tpm2(&mut self) -> Result<Vec<EventDigest>> {
        let count = self.read_u32le()?;
        if count > 32 {
            return Err(Error::EventLog(format!(
                "bad number of digests in event record ({count})"
            )));
        }
        let mut digests = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let alg_id = self.read_u16le()?;
            digests.push(self.read_digest(alg_id)?);
        }
        Ok(digests)
    }

    /// Read the next event, or `None` at the end of the log. The magic
    /// Spec ID Event03 and StartupLocality records are consumed internally
    /// and never surfaced.
    pub fn read_next(&mut self) -> Result<Option<Event>> {
        loop {
            let file_offset = self.offset;
            let pcr_index = match self.read_u32le_or_eof()? {
                Some(v) => v,
                None => return Ok(None),
            };
            let event_type = self.read_u32le()?;

            let digests = if self.tpm_version == 1 {
                self.read_digests_tpm1()?
            } else {
                self.read_digests_tpm2()?
            };

            let event_size = self.read_u32le()?;
            if event_size > MAX_EVENT_SIZE {
                return Err(Error::EventLog(format!(
                    "oversized event record with {event_size} bytes of data"
                )));
            }
            let mut data = vec![0u8; event_size as usize];
            self.read_exactly(&mut data)?;

            if event_type == EV_NO_ACTION
                && pcr_index == 0
                && self.event_count == 0
                && data.len() >= 16
            {
                if data[..16] == SPEC_ID_SIGNATURE[..] {
                    self.parse_spec_id(&data)?;
                    debug!("detected TPMv{} event log", self.tpm_version);
                    continue;
                }
                if data[..16] == STARTUP_LOCALITY_SIGNATURE[..] && data.len() == 17 {
                    self.pcr0_locality = Some(data[16]);
                    debug!("PCR0 startup locality {}", data[16]);
                    continue;
                }
            }

            let index = self.event_count;
            self.event_count += 1;
            return Ok(Some(Event {
                index,
                pcr_index,
                event_type,
                file_offset,
                data,
                digests,
                parsed: None,
            }));
        }
    }

    /// Drain the log.
    pub fn read_all(&mut self) -> Result<Vec<Event>> {
        let mut events = Vec::new();
        while let Some(ev) = self.read_next()? {
            events.push(ev);
        }
        Ok(events)
    }

    fn parse_spec_id(&mut self, data: &[u8]) -> Result<()> {
        let bad = || Error::EventLog("truncated Spec ID Event03 header".into());
        // signature (16) | platform_class u32 | minor u8 | major u8 |
        // errata u8 | uintn_size u8 | algo_count u32 | algo_count * (u16, u16)
        if data.len() < 28 {
            return Err(bad());
        }
        let platform_class = u32::from_le_bytes(data[16..20].try_into().unwrap());
        let spec_version_minor = data[20];
        let spec_version_major = data[21];
        let algo_count = u32::from_le_bytes(data[24..28].try_into().unwrap()) as usize;

        let mut algorithm_sizes = HashMap::new();
        let mut pos = 28;
        for _ in 0..algo_count {
            if data.len() < pos + 4 {
                return Err(bad());
            }
            let alg_id = u16::from_le_bytes(data[pos..pos + 2].try_into().unwrap());
            let alg_size = u16::from_le_bytes(data[pos + 2..pos + 4].try_into().unwrap());
            pos += 4;

            match algo::by_tcg_id(alg_id) {
                Some(known) if known.digest_size != alg_size as usize => {
                    return Err(Error::EventLog(format!(
                        "conflicting digest sizes for {}: {} versus {}",
                        known.name, known.digest_size, alg_size
                    )));
                }
                _ => {}
            }
            algorithm_sizes.insert(alg_id, alg_size as usize);
        }

        self.tpm_version = spec_version_major as u32;
        self.tcg2 = Some(Tcg2Info {
            platform_class,
            spec_version_major,
            spec_version_minor,
            algorithm_sizes,
        });
        Ok(())
    }

    pub fn platform_class(&self) -> Option<u32> {
        self.tcg2.as_ref().map(|i| i.platform_class)
    }

    pub fn spec_version(&self) -> Option<(u8, u8)> {
        self.tcg2
            .as_ref()
            .map(|i| (i.spec_version_major, i.spec_version_minor))
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    //! Helpers for synthesizing event logs in tests.

    pub fn push_u32le(buf: &mut Vec<u8>, v: u32) {
        buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn push_u16le(buf: &mut Vec<u8>, v: u16) {
        buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Spec ID Event03 header declaring the given (id, size) algorithms.
    pub fn spec_id_event(algorithms: &[(u16, u16)]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(b"Spec ID Event03\0");
        push_u32le(&mut data, 0); // platform class
        data.push(0); // minor
        data.push(2); // major
        data.push(0); // errata
        data.push(8); // uintn size
        push_u32le(&mut data, algorithms.len() as u32);
        for (id, size) in algorithms {
            push_u16le(&mut data, *id);
            push_u16le(&mut data, *size);
        }
        data.push(0); // vendor info size
        wrap_tpm1_record(0, super::EV_NO_ACTION, &[0u8; 20], &data)
    }

    pub fn startup_locality_event(locality: u8) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(b"StartupLocality\0");
        data.push(locality);
        let mut rec = Vec::new();
        push_u32le(&mut rec, 0);
        push_u32le(&mut rec, super::EV_NO_ACTION);
        push_u32le(&mut rec, 1); // digest count
        push_u16le(&mut rec, super::TPM2_ALG_SHA1);
        rec.extend_from_slice(&[0u8; 20]);
        push_u32le(&mut rec, data.len() as u32);
        rec.extend_from_slice(&data);
        rec
    }

    /// A TPMv1-framed record: single bare SHA-1 digest.
    pub fn wrap_tpm1_record(pcr: u32, event_type: u32, sha1: &[u8; 20], data: &[u8]) -> Vec<u8> {
        let mut rec = Vec::new();
        push_u32le(&mut rec, pcr);
        push_u32le(&mut rec, event_type);
        rec.extend_from_slice(sha1);
        push_u32le(&mut rec, data.len() as u32);
        rec.extend_from_slice(data);
        rec
    }

    /// A TPMv2-framed record with the given (algorithm, digest) pairs.
    pub fn wrap_tpm2_record(
        pcr: u32,
        event_type: u32,
        digests: &[(u16, &[u8])],
        data: &[u8],
    ) -> Vec<u8> {
        let mut rec = Vec::new();
        push_u32le(&mut rec, pcr);
        push_u32le(&mut rec, event_type);
        push_u32le(&mut rec, digests.len() as u32);
        for (alg, value) in digests {
            push_u16le(&mut rec, *alg);
            rec.extend_from_slice(value);
        }
        push_u32le(&mut rec, data.len() as u32);
        rec.extend_from_slice(data);
        rec
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use crate::algo::TPM2_ALG_SHA256;

    #[test]
    fn tpm1_log_without_header() {
        let mut log = Vec::new();
        log.extend(wrap_tpm1_record(0, EV_S_CRTM_VERSION, &[0u8; 20], b"1.0\0"));

        let mut reader = EventLogReader::new(log.as_slice());
        let ev = reader.read_next().unwrap().unwrap();
        assert_eq!(reader.tpm_version(), 1);
        assert_eq!(ev.pcr_index, 0);
        assert_eq!(ev.event_type, EV_S_CRTM_VERSION);
        assert_eq!(ev.data, b"1.0\0");
        assert_eq!(ev.digests.len(), 1);
        assert_eq!(ev.digests[0].alg_id, TPM2_ALG_SHA1);
        assert!(reader.read_next().unwrap().is_none());
        assert_eq!(reader.event_count(), 1);
    }

    #[test]
    fn tpm2_log_with_spec_id_header() {
        let digest = [0xaau8; 32];
        let mut log = Vec::new();
        log.extend(spec_id_event(&[(TPM2_ALG_SHA1, 20), (TPM2_ALG_SHA256, 32)]));
        log.extend(wrap_tpm2_record(
            7,
            EV_SEPARATOR,
            &[(TPM2_ALG_SHA256, &digest)],
            &[0, 0, 0, 0],
        ));

        let mut reader = EventLogReader::new(log.as_slice());
        let ev = reader.read_next().unwrap().unwrap();
        assert_eq!(reader.tpm_version(), 2);
        assert_eq!(ev.index, 0);
        assert_eq!(ev.pcr_index, 7);
        assert_eq!(
            ev.digest_for(algo::by_name("sha256").unwrap()),
            Some(&digest[..])
        );
        assert!(reader.read_next().unwrap().is_none());
    }

    #[test]
    fn startup_locality_is_consumed() {
        let mut log = Vec::new();
        log.extend(spec_id_event(&[(TPM2_ALG_SHA256, 32)]));
        log.extend(startup_locality_event(3));
        log.extend(wrap_tpm2_record(
            0,
            EV_POST_CODE,
            &[(TPM2_ALG_SHA256, &[0x11u8; 32])],
            b"",
        ));

        let mut reader = EventLogReader::new(log.as_slice());
        let ev = reader.read_next().unwrap().unwrap();
        assert_eq!(ev.event_type, EV_POST_CODE);
        assert_eq!(reader.get_locality(0), Some(3));
        assert_eq!(reader.get_locality(1), None);
        assert_eq!(reader.event_count(), 1);
    }

    #[test]
    fn unknown_algorithm_from_header_is_skippable() {
        // 0x0027 (sha3-256) is not implemented but declared by the header,
        // so its digests are carried opaquely.
        let mut log = Vec::new();
        log.extend(spec_id_event(&[(TPM2_ALG_SHA256, 32), (0x0027, 32)]));
        log.extend(wrap_tpm2_record(
            4,
            EV_SEPARATOR,
            &[(0x0027, &[0x22u8; 32]), (TPM2_ALG_SHA256, &[0x33u8; 32])],
            &[0xff, 0xff, 0xff, 0xff],
        ));

        let mut reader = EventLogReader::new(log.as_slice());
        let ev = reader.read_next().unwrap().unwrap();
        assert_eq!(ev.digests.len(), 2);
    }

    #[test]
    fn undeclared_algorithm_is_fatal() {
        let mut log = Vec::new();
        log.extend(spec_id_event(&[(TPM2_ALG_SHA256, 32)]));
        log.extend(wrap_tpm2_record(
            4,
            EV_SEPARATOR,
            &[(0x0029, &[0u8; 64])],
            b"",
        ));

        let mut reader = EventLogReader::new(log.as_slice());
        assert!(matches!(
            reader.read_next(),
            Err(Error::UnknownLogAlgorithm(0x0029))
        ));
    }

    #[test]
    fn truncated_log_is_fatal() {
        let mut log = Vec::new();
        log.extend(wrap_tpm1_record(0, EV_POST_CODE, &[0u8; 20], b"data"));
        log.truncate(log.len() - 2);

        let mut reader = EventLogReader::new(log.as_slice());
        assert!(reader.read_next().is_err());
    }

    #[test]
    fn oversized_event_is_fatal() {
        let mut log = Vec::new();
        push_u32le(&mut log, 0);
        push_u32le(&mut log, EV_POST_CODE);
        log.extend_from_slice(&[0u8; 20]);
        push_u32le(&mut log, 2 * 1024 * 1024);

        let mut reader = EventLogReader::new(log.as_slice());
        assert!(reader.read_next().is_err());
    }

    #[test]
    fn empty_event_data_is_accepted() {
        let mut log = Vec::new();
        log.extend(wrap_tpm1_record(3, EV_POST_CODE, &[0x42u8; 20], b""));
        let mut reader = EventLogReader::new(log.as_slice());
        let ev = reader.read_next().unwrap().unwrap();
        assert!(ev.data.is_empty());
    }
}
