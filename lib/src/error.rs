// SPDX-License-Identifier: MIT

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("cannot read {}: {source}", .path.display())]
    File {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed event log: {0}")]
    EventLog(String),

    #[error("unknown hash algorithm `{0}` in event log")]
    UnknownLogAlgorithm(u16),

    #[error("unsupported hash algorithm `{0}`")]
    UnknownAlgorithm(String),

    #[error("invalid PCR selection `{0}`")]
    PcrSpec(String),

    #[error("event at offset {offset:#x} carries no {algo} digest")]
    MissingDigest { offset: u64, algo: &'static str },

    #[error("{algo} digest has {actual} bytes, expected {expected}")]
    DigestSize {
        algo: &'static str,
        actual: usize,
        expected: usize,
    },

    #[error("prediction for event `{0}` failed and re-hashing was required")]
    RehashRequired(String),

    #[error(transparent)]
    Tss(#[from] tss_esapi::Error),

    #[error("TPM policy construction failed: {0}")]
    PolicyBuild(String),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error(transparent)]
    Crypto(#[from] openssl::error::ErrorStack),

    #[error("malformed {kind} file {}", .path.display())]
    Envelope { kind: &'static str, path: PathBuf },

    #[error(transparent)]
    Der(#[from] der::Error),

    #[error("policy program contains unsupported TPM command {0:#x}")]
    UnsupportedPolicyStep(u32),

    #[error("none of the stored policies authorized unsealing")]
    UnsealDenied,

    #[error("target platform `{0}` does not support this operation")]
    PlatformUnsupported(&'static str),

    #[error("{0}")]
    Other(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
