// SPDX-License-Identifier: MIT

//! The hash algorithm table shared by the event log reader, the re-hash
//! engine and the PCR bank simulator.
//!
//! TCG event logs are crypto-agile: every event carries one digest per
//! algorithm declared in the log header. The well-known algorithms live in
//! a static table; a log may additionally declare algorithms we do not
//! implement, for which only the digest size is remembered so the reader
//! can skip over their digests.

use digest::DynDigest;
use sha1::Sha1;
use sha2::{Sha256, Sha384, Sha512};
use sm3::Sm3;

use crate::error::{Error, Result};

pub const TPM2_ALG_SHA1: u16 = 0x0004;
pub const TPM2_ALG_SHA256: u16 = 0x000b;
pub const TPM2_ALG_SHA384: u16 = 0x000c;
pub const TPM2_ALG_SHA512: u16 = 0x000d;
pub const TPM2_ALG_SM3_256: u16 = 0x0012;

/// Descriptor for one hash algorithm: TCG numeric id, canonical name and
/// digest length in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashAlg {
    pub tcg_id: u16,
    pub name: &'static str,
    pub digest_size: usize,
}

static ALGORITHMS: [HashAlg; 5] = [
    HashAlg {
        tcg_id: TPM2_ALG_SHA1,
        name: "sha1",
        digest_size: 20,
    },
    HashAlg {
        tcg_id: TPM2_ALG_SHA256,
        name: "sha256",
        digest_size: 32,
    },
    HashAlg {
        tcg_id: TPM2_ALG_SHA384,
        name: "sha384",
        digest_size: 48,
    },
    HashAlg {
        tcg_id: TPM2_ALG_SHA512,
        name: "sha512",
        digest_size: 64,
    },
    HashAlg {
        tcg_id: TPM2_ALG_SM3_256,
        name: "sm3_256",
        digest_size: 32,
    },
];

pub fn by_name(name: &str) -> Result<&'static HashAlg> {
    ALGORITHMS
        .iter()
        .find(|a| a.name == name)
        .ok_or_else(|| Error::UnknownAlgorithm(name.to_string()))
}

pub fn by_tcg_id(tcg_id: u16) -> Option<&'static HashAlg> {
    ALGORITHMS.iter().find(|a| a.tcg_id == tcg_id)
}

impl HashAlg {
    fn hasher(&self) -> Box<dyn DynDigest> {
        match self.tcg_id {
            TPM2_ALG_SHA1 => Box::new(Sha1::default()),
            TPM2_ALG_SHA256 => Box::new(Sha256::default()),
            TPM2_ALG_SHA384 => Box::new(Sha384::default()),
            TPM2_ALG_SHA512 => Box::new(Sha512::default()),
            TPM2_ALG_SM3_256 => Box::new(Sm3::default()),
            _ => unreachable!("algorithm table entry without hasher"),
        }
    }

    /// Hash a single buffer.
    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        self.digest_parts(&[data])
    }

    /// Hash the concatenation of several buffers.
    pub fn digest_parts(&self, parts: &[&[u8]]) -> Vec<u8> {
        let mut hasher = self.hasher();
        for part in parts {
            hasher.update(part);
        }
        hasher.finalize().to_vec()
    }
}

/// A digest of length 0, or consisting of all-0x00 or all-0xff bytes over
/// the algorithm's digest length, carries no information and must never
/// enter a PCR bank.
pub fn digest_is_invalid(value: &[u8]) -> bool {
    value.is_empty() || value.iter().all(|b| *b == 0x00) || value.iter().all(|b| *b == 0xff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn lookup_by_name() {
        let algo = by_name("sha256").unwrap();
        assert_eq!(algo.tcg_id, TPM2_ALG_SHA256);
        assert_eq!(algo.digest_size, 32);
        assert!(by_name("md5").is_err());
    }

    #[test]
    fn lookup_by_tcg_id() {
        assert_eq!(by_tcg_id(0x0004).unwrap().name, "sha1");
        assert_eq!(by_tcg_id(0x0012).unwrap().name, "sm3_256");
        assert!(by_tcg_id(0x0027).is_none());
    }

    #[test]
    fn sha256_digest() {
        let algo = by_name("sha256").unwrap();
        assert_eq!(
            algo.digest(b"abc"),
            hex!("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad").to_vec()
        );
    }

    #[test]
    fn digest_parts_concatenates() {
        let algo = by_name("sha256").unwrap();
        assert_eq!(algo.digest_parts(&[b"ab", b"c"]), algo.digest(b"abc"));
    }

    #[test]
    fn invalid_digests() {
        assert!(digest_is_invalid(&[]));
        assert!(digest_is_invalid(&[0u8; 32]));
        assert!(digest_is_invalid(&[0xffu8; 20]));
        assert!(!digest_is_invalid(&[0u8, 1u8]));
    }
}
