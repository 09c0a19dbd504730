use lief::pe;

use crate::algo::{self, HashAlg};
use crate::error::{Error, Result};

/// A PE/COFF boot services image, wrapped for Authenticode digesting.
pub struct PeFile {
    image: pe::Binary,
}

impl PeFile {
    pub fn load_from_file(path: &str) -> Result<PeFile> {
        match pe::Binary::parse(path) {
            Some(image) => Ok(PeFile { image }),
            None => Err(Error::Other(format!("{path} is not a PE/COFF image"))),
        }
    }

    /// The Authenticode digest: all sections except the certificate table
    /// and the checksum field.
    pub fn authenticode(&self, hash: &HashAlg) -> Result<Vec<u8>> {
        let algo = match hash.tcg_id {
            algo::TPM2_ALG_SHA1 => pe::Algorithms::SHA_1,
            algo::TPM2_ALG_SHA256 => pe::Algorithms::SHA_256,
            algo::TPM2_ALG_SHA384 => pe::Algorithms::SHA_384,
            algo::TPM2_ALG_SHA512 => pe::Algorithms::SHA_512,
            _ => {
                return Err(Error::Other(format!(
                    "no Authenticode digest for {}",
                    hash.name
                )))
            }
        };
        Ok(self.image.authentihash(algo))
    }
}
