// SPDX-License-Identifier: MIT

//! Access to the running system: the event log, efivarfs, the EFI system
//! partition and the root filesystem. Every well-known path is owned by
//! this module and can be overridden, so the prediction engine itself
//! never touches the filesystem layout directly.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use log::debug;

use crate::algo::HashAlg;
use crate::error::{Error, Result};

const DEFAULT_EVENTLOG_PATH: &str = "/sys/kernel/security/tpm0/binary_bios_measurements";
const DEFAULT_EFIVARS_DIR: &str = "/sys/firmware/efi/efivars";
const DEFAULT_ESP_DIR: &str = "/boot/efi";

/// efivarfs prepends a u32 of variable attributes to the payload.
const EFIVARS_ATTR_HEADER_LENGTH: usize = 4;

#[derive(Debug, Clone)]
pub struct Runtime {
    eventlog_path: PathBuf,
    efivars_dir: PathBuf,
    esp_dir: PathBuf,
    sysroot: PathBuf,
    boot_disk: Option<PathBuf>,
}

impl Default for Runtime {
    fn default() -> Self {
        Runtime {
            eventlog_path: DEFAULT_EVENTLOG_PATH.into(),
            efivars_dir: DEFAULT_EFIVARS_DIR.into(),
            esp_dir: DEFAULT_ESP_DIR.into(),
            sysroot: "/".into(),
            boot_disk: None,
        }
    }
}

impl Runtime {
    pub fn with_eventlog_path(mut self, path: &Path) -> Self {
        self.eventlog_path = path.into();
        self
    }

    pub fn with_efivars_dir(mut self, path: &Path) -> Self {
        self.efivars_dir = path.into();
        self
    }

    pub fn with_esp_dir(mut self, path: &Path) -> Self {
        self.esp_dir = path.into();
        self
    }

    pub fn with_sysroot(mut self, path: &Path) -> Self {
        self.sysroot = path.into();
        self
    }

    pub fn with_boot_disk(mut self, path: &Path) -> Self {
        self.boot_disk = Some(path.into());
        self
    }

    pub fn esp_dir(&self) -> &Path {
        &self.esp_dir
    }

    pub fn boot_disk(&self) -> Option<&Path> {
        self.boot_disk.as_deref()
    }

    pub fn open_eventlog(&self) -> Result<File> {
        File::open(&self.eventlog_path).map_err(|source| Error::File {
            path: self.eventlog_path.clone(),
            source,
        })
    }

    /// Read an EFI variable by its efivarfs name (`Name-<guid>`), with the
    /// attributes header stripped.
    pub fn read_efi_variable(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.efivars_dir.join(name);
        let mut data = fs::read(&path).map_err(|source| Error::File { path, source })?;
        if data.len() < EFIVARS_ATTR_HEADER_LENGTH {
            return Ok(Vec::new());
        }
        Ok(data.split_off(EFIVARS_ATTR_HEADER_LENGTH))
    }

    /// Resolve a path recorded in the event log (DOS or Unix separators)
    /// relative to the mounted EFI system partition.
    pub fn efi_file_path(&self, logged_path: &str) -> PathBuf {
        let unix = dos_to_unix(logged_path);
        self.esp_dir.join(unix.trim_start_matches('/'))
    }

    pub fn rootfs_file_path(&self, logged_path: &str) -> PathBuf {
        self.sysroot.join(logged_path.trim_start_matches('/'))
    }

    pub fn digest_efi_file(&self, algo: &HashAlg, logged_path: &str) -> Result<Vec<u8>> {
        let path = self.efi_file_path(logged_path);
        debug!("hashing {} from EFI partition", path.display());
        let data = fs::read(&path).map_err(|source| Error::File { path, source })?;
        Ok(algo.digest(&data))
    }

    pub fn digest_rootfs_file(&self, algo: &HashAlg, logged_path: &str) -> Result<Vec<u8>> {
        let path = self.rootfs_file_path(logged_path);
        debug!("hashing {} from system partition", path.display());
        let data = fs::read(&path).map_err(|source| Error::File { path, source })?;
        Ok(algo.digest(&data))
    }

    fn read_trimmed(&self, rel: &str) -> Option<String> {
        let content = fs::read_to_string(self.sysroot.join(rel)).ok()?;
        let line = content.lines().next()?.trim().to_string();
        if line.is_empty() {
            None
        } else {
            Some(line)
        }
    }

    pub fn machine_id(&self) -> Option<String> {
        self.read_trimmed("etc/machine-id")
    }

    fn os_release(&self, key: &str) -> Option<String> {
        let content = fs::read_to_string(self.sysroot.join("etc/os-release")).ok()?;
        for line in content.lines() {
            if let Some(value) = line.strip_prefix(key) {
                let value = value.trim_start();
                if let Some(value) = value.strip_prefix('=') {
                    return Some(value.trim().trim_matches('"').to_string());
                }
            }
        }
        None
    }

    /// The boot-loader-spec entry token: the prefix boot entry files carry
    /// on this installation.
    pub fn entry_token(&self) -> Option<String> {
        if let Some(token) = self.read_trimmed("etc/kernel/entry-token") {
            return Some(token);
        }
        let candidates = [
            self.os_release("ID"),
            self.os_release("IMAGE_ID"),
            self.machine_id(),
        ];
        for candidate in candidates.into_iter().flatten() {
            if self.esp_dir.join(&candidate).is_dir() {
                return Some(candidate);
            }
        }
        self.machine_id()
    }
}

pub fn dos_to_unix(path: &str) -> String {
    path.replace('\\', "/")
}

pub fn unix_to_dos(path: &str) -> String {
    path.replace('/', "\\")
}

/// Write a file so that the destination either keeps its old content or
/// carries the complete new content; no partial output survives an error.
pub fn write_file_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .ok_or_else(|| Error::Other(format!("invalid output path {}", path.display())))?;
    let tmp = dir.join(format!(".{}.tmp", name.to_string_lossy()));

    let result = (|| {
        let mut file = File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}
