// SPDX-License-Identifier: MIT

//! systemd's signed PCR policy file (`tpm2-pcr-signature.json`): per
//! algorithm, a list of `{pcrs, pkfp, pol, sig}` entries. Appending an
//! entry whose policy already exists updates that entry in place instead
//! of duplicating it.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::bank::PCR_BANK_REGISTER_MAX;
use crate::error::{Error, Result};
use crate::runtime::write_file_atomic;

#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyEntry {
    pub pcrs: Vec<u32>,
    #[serde_as(as = "serde_with::hex::Hex")]
    pub pkfp: Vec<u8>,
    #[serde_as(as = "serde_with::hex::Hex")]
    pub pol: Vec<u8>,
    #[serde_as(as = "serde_with::base64::Base64")]
    pub sig: Vec<u8>,
}

/// The whole file: bank name to entry list.
pub type PolicyFile = BTreeMap<String, Vec<PolicyEntry>>;

pub fn pcr_mask_to_list(pcr_mask: u32) -> Vec<u32> {
    (0..PCR_BANK_REGISTER_MAX as u32)
        .filter(|i| pcr_mask & (1 << i) != 0)
        .collect()
}

pub fn read_file(path: &Path) -> Result<PolicyFile> {
    let data = fs::read(path).map_err(|source| Error::File {
        path: path.into(),
        source,
    })?;
    serde_json::from_slice(&data).map_err(|_| Error::Envelope {
        kind: "systemd policy",
        path: path.into(),
    })
}

/// Add one signed policy entry, merging with an existing entry for the
/// same policy digest.
pub fn add_entry(
    path: &Path,
    algo_name: &str,
    pcr_mask: u32,
    pkfp: &[u8],
    policy: &[u8],
    signature: &[u8],
) -> Result<()> {
    let mut doc: PolicyFile = if path.exists() {
        read_file(path)?
    } else {
        PolicyFile::new()
    };

    let entries = doc.entry(algo_name.to_string()).or_default();
    let entry = PolicyEntry {
        pcrs: pcr_mask_to_list(pcr_mask),
        pkfp: pkfp.to_vec(),
        pol: policy.to_vec(),
        sig: signature.to_vec(),
    };
    match entries.iter_mut().find(|e| e.pol == policy) {
        Some(existing) => *existing = entry,
        None => entries.push(entry),
    }

    let mut json = serde_json::to_vec_pretty(&doc)
        .map_err(|e| Error::Other(format!("cannot serialize policy file: {e}")))?;
    json.push(b'\n');
    write_file_atomic(path, &json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn scratch_file(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("predict-pcrs-systemd-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    #[test]
    fn mask_to_list() {
        assert_eq!(pcr_mask_to_list(0b1001_0001), vec![0, 4, 7]);
        assert!(pcr_mask_to_list(0).is_empty());
    }

    #[test]
    fn entry_serialization_shape() {
        let entry = PolicyEntry {
            pcrs: vec![7],
            pkfp: vec![0xab, 0xcd],
            pol: vec![0x01, 0x02],
            sig: vec![0xff],
        };
        assert_eq!(
            serde_json::to_string(&entry).unwrap(),
            "{\"pcrs\":[7],\"pkfp\":\"abcd\",\"pol\":\"0102\",\"sig\":\"/w==\"}"
        );
    }

    #[test]
    fn add_then_read() {
        let path = scratch_file("policy.json");
        add_entry(&path, "sha256", 1 << 7, &[0x11; 32], &[0x22; 32], &[0x33; 256]).unwrap();

        let doc = read_file(&path).unwrap();
        assert_eq!(doc.len(), 1);
        let entries = &doc["sha256"];
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].pcrs, vec![7]);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn same_policy_merges_instead_of_duplicating() {
        let path = scratch_file("merge.json");
        let pol = [0x22u8; 32];
        add_entry(&path, "sha256", 1 << 7, &[0x11; 32], &pol, &[0x33; 256]).unwrap();
        // Same policy again with a different PCR list and signature
        add_entry(&path, "sha256", (1 << 7) | (1 << 14), &[0x11; 32], &pol, &[0x44; 256]).unwrap();

        let doc = read_file(&path).unwrap();
        let entries = &doc["sha256"];
        assert_eq!(entries.len(), 1);
        // The second write took effect
        assert_eq!(entries[0].pcrs, vec![7, 14]);
        assert_eq!(entries[0].sig, vec![0x44; 256]);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn distinct_policies_accumulate() {
        let path = scratch_file("distinct.json");
        add_entry(&path, "sha256", 1 << 7, &[0x11; 32], &[0x22; 32], &[0x33; 256]).unwrap();
        add_entry(&path, "sha256", 1 << 7, &[0x11; 32], &[0x55; 32], &[0x66; 256]).unwrap();

        let doc = read_file(&path).unwrap();
        assert_eq!(doc["sha256"].len(), 2);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn banks_are_separate() {
        let path = scratch_file("banks.json");
        add_entry(&path, "sha256", 1 << 7, &[0x11; 32], &[0x22; 32], &[0x33; 256]).unwrap();
        add_entry(&path, "sha1", 1 << 7, &[0x11; 20], &[0x22; 20], &[0x33; 256]).unwrap();

        let doc = read_file(&path).unwrap();
        assert_eq!(doc.len(), 2);
        assert!(doc.contains_key("sha1") && doc.contains_key("sha256"));
        fs::remove_file(&path).unwrap();
    }
}
