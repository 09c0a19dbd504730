// SPDX-License-Identifier: MIT

//! Boot-loader-spec Type #1 entries: discovery, version ordering and the
//! filename classifiers the re-hash engine uses to recognize kernels and
//! initrds in grub file-load events.

use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::{Error, Result};
use crate::runtime::Runtime;

/// One entry under `$ESP/loader/entries/`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootEntry {
    pub path: PathBuf,
    pub title: Option<String>,
    pub version: Option<String>,
    pub sort_key: Option<String>,
    pub machine_id: Option<String>,
    pub options: Option<String>,
    pub image_path: Option<String>,
    pub initrd_path: Option<String>,
}

impl BootEntry {
    pub fn parse(content: &str) -> BootEntry {
        let mut entry = BootEntry::default();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = match line.split_once(char::is_whitespace) {
                Some(kv) => kv,
                None => continue,
            };
            let value = value.trim().to_string();
            match key {
                "title" => entry.title = Some(value),
                "version" => entry.version = Some(value),
                "sort-key" => entry.sort_key = Some(value),
                "machine-id" => entry.machine_id = Some(value),
                "options" => entry.options = Some(value),
                "linux" => entry.image_path = Some(value),
                "initrd" => entry.initrd_path = Some(value),
                _ => {}
            }
        }
        entry
    }

    pub fn load(path: &Path) -> Result<BootEntry> {
        let content = fs::read_to_string(path).map_err(|source| Error::File {
            path: path.into(),
            source,
        })?;
        let mut entry = BootEntry::parse(&content);
        entry.path = path.into();
        Ok(entry)
    }
}

/// Compare two version strings following the uapi-group version format
/// specification (the boot loader spec sorting rules).
pub fn vercmp(a: &str, b: &str) -> Ordering {
    fn is_valid(c: u8) -> bool {
        c.is_ascii_alphanumeric() || matches!(c, b'~' | b'-' | b'^' | b'.')
    }

    let mut a = a.as_bytes();
    let mut b = b.as_bytes();

    loop {
        while !a.is_empty() && !is_valid(a[0]) {
            a = &a[1..];
        }
        while !b.is_empty() && !is_valid(b[0]) {
            b = &b[1..];
        }

        // The longer string is considered newer
        if a.is_empty() || b.is_empty() {
            let ca = a.first().copied().unwrap_or(0);
            let cb = b.first().copied().unwrap_or(0);
            return ca.cmp(&cb);
        }

        for sep in [b'~', b'-', b'^', b'.'] {
            if a.is_empty() || b.is_empty() {
                break;
            }
            if a[0] == sep || b[0] == sep {
                let r = (a[0] != sep).cmp(&(b[0] != sep));
                if r != Ordering::Equal {
                    return r;
                }
                a = &a[1..];
                b = &b[1..];
            }
        }
        if a.is_empty() || b.is_empty() {
            continue;
        }

        if a[0].is_ascii_digit() || b[0].is_ascii_digit() {
            let na = a.iter().take_while(|c| c.is_ascii_digit()).count();
            let nb = b.iter().take_while(|c| c.is_ascii_digit()).count();

            let r = (na != 0).cmp(&(nb != 0));
            if r != Ordering::Equal {
                return r;
            }

            let va = std::str::from_utf8(&a[..na])
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(u64::MAX);
            let vb = std::str::from_utf8(&b[..nb])
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(u64::MAX);
            let r = va.cmp(&vb);
            if r != Ordering::Equal {
                return r;
            }

            a = &a[na..];
            b = &b[nb..];
        } else {
            let na = a.iter().take_while(|c| c.is_ascii_alphabetic()).count();
            let nb = b.iter().take_while(|c| c.is_ascii_alphabetic()).count();
            let m = na.min(nb);

            let r = a[..m].cmp(&b[..m]);
            if r != Ordering::Equal {
                return r;
            }
            let r = na.cmp(&nb);
            if r != Ordering::Equal {
                return r;
            }

            a = &a[na..];
            b = &b[nb..];
        }
    }
}

/// Boot loader spec ordering: sort-key, then machine-id, then version.
/// Reversed so that the newest kernel comes first.
fn entry_cmp(a: &BootEntry, b: &BootEntry) -> Ordering {
    let empty = String::new();
    let result = a
        .sort_key
        .as_ref()
        .unwrap_or(&empty)
        .cmp(b.sort_key.as_ref().unwrap_or(&empty))
        .then_with(|| {
            a.machine_id
                .as_ref()
                .unwrap_or(&empty)
                .cmp(b.machine_id.as_ref().unwrap_or(&empty))
        })
        .then_with(|| {
            vercmp(
                a.version.as_deref().unwrap_or(""),
                b.version.as_deref().unwrap_or(""),
            )
        });
    result.reverse()
}

/// All boot entries carrying this installation's entry token, newest
/// first.
pub fn list_entries(runtime: &Runtime) -> Result<Vec<BootEntry>> {
    let token = runtime.entry_token();
    let dir = runtime.esp_dir().join("loader/entries");
    let mut entries = Vec::new();

    let dirents = fs::read_dir(&dir).map_err(|source| Error::File {
        path: dir.clone(),
        source,
    })?;
    for dirent in dirents {
        let path = dirent?.path();
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name,
            None => continue,
        };
        if !name.ends_with(".conf") {
            continue;
        }
        if let Some(token) = &token {
            if !name.starts_with(token.as_str()) {
                continue;
            }
        }
        debug!("boot loader entry {name}");
        entries.push(BootEntry::load(&path)?);
    }

    entries.sort_by(entry_cmp);
    Ok(entries)
}

/// The entry the boot loader would pick for the next boot.
pub fn next_boot_entry(runtime: &Runtime) -> Result<Option<BootEntry>> {
    Ok(list_entries(runtime)?.into_iter().next())
}

/// Find an entry by its version string.
pub fn find_entry(runtime: &Runtime, version: &str) -> Result<Option<BootEntry>> {
    Ok(list_entries(runtime)?
        .into_iter()
        .find(|e| e.version.as_deref() == Some(version)))
}

/// Does this logged path name a boot-loader entry file?
pub fn is_boot_entry(logged_path: &str) -> bool {
    logged_path.contains("/loader/entries/") && logged_path.ends_with(".conf")
}

fn has_component_with_prefix(logged_path: &str, token: &str, prefix: &str) -> bool {
    let lead = format!("/{token}/");
    if !logged_path.starts_with(&lead) {
        return false;
    }
    logged_path.split('/').any(|c| c.starts_with(prefix))
}

/// Does this logged path name a kernel image under the entry-token tree?
pub fn is_kernel(logged_path: &str, runtime: &Runtime) -> bool {
    match runtime.entry_token() {
        Some(token) => has_component_with_prefix(logged_path, &token, "linux-")
            || has_component_with_prefix(logged_path, &token, "vmlinuz-"),
        None => false,
    }
}

/// Does this logged path name an initrd under the entry-token tree?
pub fn is_initrd(logged_path: &str, runtime: &Runtime) -> bool {
    match runtime.entry_token() {
        Some(token) => has_component_with_prefix(logged_path, &token, "initrd-"),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_entry() {
        let entry = BootEntry::parse(
            "title     Fedora Linux 40\n\
             version   6.8.5-301.fc40.x86_64\n\
             machine-id 7accbe22ab1d4b2c9e4a03e1e2b95d27\n\
             options   root=UUID=abcd ro quiet\n\
             linux     /7accbe22ab1d4b2c9e4a03e1e2b95d27/6.8.5-301.fc40.x86_64/linux\n\
             initrd    /7accbe22ab1d4b2c9e4a03e1e2b95d27/6.8.5-301.fc40.x86_64/initrd\n",
        );
        assert_eq!(entry.title.as_deref(), Some("Fedora Linux 40"));
        assert_eq!(entry.version.as_deref(), Some("6.8.5-301.fc40.x86_64"));
        assert_eq!(entry.options.as_deref(), Some("root=UUID=abcd ro quiet"));
        assert!(entry.image_path.as_deref().unwrap().ends_with("/linux"));
        assert!(entry.initrd_path.as_deref().unwrap().ends_with("/initrd"));
    }

    #[test]
    fn version_ordering() {
        assert_eq!(vercmp("6.4.12", "6.4.12"), Ordering::Equal);
        assert_eq!(vercmp("6.4.2", "6.4.12"), Ordering::Less);
        assert_eq!(vercmp("6.4", "6.4.1"), Ordering::Less);
        assert_eq!(vercmp("6.10", "6.9"), Ordering::Greater);
        // Tilde sorts before anything
        assert_eq!(vercmp("1.0~rc1", "1.0"), Ordering::Less);
        assert_eq!(vercmp("5.14.0-284", "5.14.0-362"), Ordering::Less);
    }

    #[test]
    fn newest_entry_sorts_first() {
        let old = BootEntry {
            version: Some("6.8.5-301.fc40.x86_64".into()),
            ..Default::default()
        };
        let new = BootEntry {
            version: Some("6.8.11-300.fc40.x86_64".into()),
            ..Default::default()
        };
        let mut entries = vec![old.clone(), new.clone()];
        entries.sort_by(entry_cmp);
        assert_eq!(entries[0], new);
        assert_eq!(entries[1], old);
    }

    #[test]
    fn classifiers() {
        assert!(is_boot_entry("/loader/entries/fedora-6.8.conf"));
        assert!(!is_boot_entry("/EFI/fedora/grub.cfg"));
    }
}
