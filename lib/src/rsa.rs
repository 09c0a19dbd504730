// SPDX-License-Identifier: MIT

//! RSA signing keys for authorized policies. Keys live in PEM files;
//! signatures are RSASSA PKCS#1 v1.5 over SHA-256, which is what the TPM
//! verifies during `TPM2_PolicyAuthorize`.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use openssl::hash::MessageDigest;
use openssl::pkey::{HasPublic, PKey, Private, Public as OsslPublic};
use openssl::rsa::Rsa;
use openssl::sign::Signer;
use tss_esapi::attributes::ObjectAttributesBuilder;
use tss_esapi::interface_types::algorithm::{HashingAlgorithm, PublicAlgorithm};
use tss_esapi::interface_types::key_bits::RsaKeyBits;
use tss_esapi::structures::{
    Public, PublicBuilder, PublicKeyRsa, PublicRsaParametersBuilder, RsaExponent, RsaScheme,
    RsaSchemeAlgorithm,
};

use crate::algo;
use crate::error::{Error, Result};

pub struct RsaPrivateKey {
    path: PathBuf,
    pkey: PKey<Private>,
}

pub struct RsaPublicKey {
    pkey: PKey<OsslPublic>,
}

impl RsaPrivateKey {
    /// Read a private key from a PEM file. Pass phrases are not
    /// supported.
    pub fn read(path: &Path) -> Result<RsaPrivateKey> {
        let pem = fs::read(path).map_err(|source| Error::File {
            path: path.into(),
            source,
        })?;
        let pkey = PKey::private_key_from_pem(&pem)?;
        if pkey.rsa().is_err() {
            return Err(Error::Signing(format!(
                "{} is not an RSA private key",
                path.display()
            )));
        }
        Ok(RsaPrivateKey {
            path: path.into(),
            pkey,
        })
    }

    pub fn generate(bits: u32) -> Result<RsaPrivateKey> {
        let rsa = Rsa::generate(bits)?;
        Ok(RsaPrivateKey {
            path: "<generated>".into(),
            pkey: PKey::from_rsa(rsa)?,
        })
    }

    /// Write the key as PEM, mode 0600 from the start.
    pub fn write(&self, path: &Path) -> Result<()> {
        use std::os::unix::fs::OpenOptionsExt;

        let pem = self.pkey.private_key_to_pem_pkcs8()?;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .map_err(|source| Error::File {
                path: path.into(),
                source,
            })?;
        file.write_all(&pem)?;
        Ok(())
    }

    /// RSASSA over SHA-256 of `data`.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut signer = Signer::new(MessageDigest::sha256(), &self.pkey)?;
        signer.update(data)?;
        Ok(signer.sign_to_vec()?)
    }

    pub fn public(&self) -> Result<RsaPublicKey> {
        let pem = self.pkey.public_key_to_pem()?;
        Ok(RsaPublicKey {
            pkey: PKey::public_key_from_pem(&pem)?,
        })
    }

    pub fn public_pem(&self) -> Result<Vec<u8>> {
        Ok(self.pkey.public_key_to_pem()?)
    }

    pub fn to_tss_public(&self) -> Result<Public> {
        rsa_to_tss_public(&self.pkey, &self.path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RsaPublicKey {
    pub fn read(path: &Path) -> Result<RsaPublicKey> {
        let pem = fs::read(path).map_err(|source| Error::File {
            path: path.into(),
            source,
        })?;
        let pkey = PKey::public_key_from_pem(&pem)?;
        if pkey.rsa().is_err() {
            return Err(Error::Signing(format!(
                "{} is not an RSA public key",
                path.display()
            )));
        }
        Ok(RsaPublicKey { pkey })
    }

    pub fn to_tss_public(&self) -> Result<Public> {
        rsa_to_tss_public(&self.pkey, Path::new("<public key>"))
    }

    /// The fingerprint systemd records as `pkfp`: SHA-256 over the DER
    /// encoding of the bare RSA public key.
    pub fn fingerprint(&self) -> Result<Vec<u8>> {
        let der = self.pkey.rsa()?.public_key_to_der_pkcs1()?;
        Ok(algo::by_name("sha256")?.digest(&der))
    }
}

/// Convert an RSA public key into the `TPM2B_PUBLIC` template used for
/// `TPM2_LoadExternal`: unrestricted signing/decryption key, null scheme.
fn rsa_to_tss_public<T: HasPublic>(pkey: &PKey<T>, path: &Path) -> Result<Public> {
    let rsa = pkey.rsa()?;
    let modulus = rsa.n().to_vec();
    let exponent_bytes = rsa.e().to_vec();

    let key_bits = match modulus.len() * 8 {
        1024 => RsaKeyBits::Rsa1024,
        2048 => RsaKeyBits::Rsa2048,
        3072 => RsaKeyBits::Rsa3072,
        4096 => RsaKeyBits::Rsa4096,
        bits => {
            return Err(Error::Signing(format!(
                "{}: unsupported RSA key size ({bits} bits)",
                path.display()
            )))
        }
    };
    if exponent_bytes.len() > 4 {
        return Err(Error::Signing(format!(
            "{}: unsupported RSA exponent size",
            path.display()
        )));
    }
    let mut exponent = 0u32;
    for byte in &exponent_bytes {
        exponent = (exponent << 8) | *byte as u32;
    }

    let object_attributes = ObjectAttributesBuilder::new()
        .with_decrypt(true)
        .with_sign_encrypt(true)
        .with_user_with_auth(true)
        .build()?;

    let rsa_parameters = PublicRsaParametersBuilder::new()
        .with_scheme(RsaScheme::create(RsaSchemeAlgorithm::Null, None)?)
        .with_key_bits(key_bits)
        .with_exponent(RsaExponent::create(exponent)?)
        .with_is_signing_key(true)
        .with_is_decryption_key(true)
        .with_restricted(false)
        .build()?;

    Ok(PublicBuilder::new()
        .with_public_algorithm(PublicAlgorithm::Rsa)
        .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
        .with_object_attributes(object_attributes)
        .with_rsa_parameters(rsa_parameters)
        .with_rsa_unique_identifier(PublicKeyRsa::try_from(modulus)?)
        .build()?)
}
