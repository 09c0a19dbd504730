// SPDX-License-Identifier: MIT

//! Hand-rolled marshalling for the handful of TPM wire structures the
//! envelope codecs persist. The TPM wire format is big-endian;
//! `TPM2B_*` blobs are a u16 length followed by that many bytes.

use crate::error::{Error, Result};

pub const TPM2_ALG_RSASSA: u16 = 0x0014;
pub const TPM2_ALG_RSAPSS: u16 = 0x0016;

pub const TPM2_CC_POLICY_AUTHORIZE: u32 = 0x0000_016a;
pub const TPM2_CC_POLICY_PCR: u32 = 0x0000_017f;

/// The owner hierarchy's persistent handle, the parent of everything this
/// tool seals.
pub const TPM2_RH_OWNER: u32 = 0x4000_0001;

fn truncated() -> Error {
    Error::Other("truncated TPM structure".into())
}

pub fn get_u16(input: &mut &[u8]) -> Result<u16> {
    if input.len() < 2 {
        return Err(truncated());
    }
    let v = u16::from_be_bytes(input[..2].try_into().unwrap());
    *input = &input[2..];
    Ok(v)
}

pub fn get_u32(input: &mut &[u8]) -> Result<u32> {
    if input.len() < 4 {
        return Err(truncated());
    }
    let v = u32::from_be_bytes(input[..4].try_into().unwrap());
    *input = &input[4..];
    Ok(v)
}

pub fn get_bytes<'a>(input: &mut &'a [u8], len: usize) -> Result<&'a [u8]> {
    if input.len() < len {
        return Err(truncated());
    }
    let (head, tail) = input.split_at(len);
    *input = tail;
    Ok(head)
}

/// `TPM2B`: u16 size, then the payload.
pub fn marshal_tpm2b(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + payload.len());
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

pub fn unmarshal_tpm2b(input: &mut &[u8]) -> Result<Vec<u8>> {
    let size = get_u16(input)? as usize;
    Ok(get_bytes(input, size)?.to_vec())
}

/// How many bytes the `TPM2B` at the head of `input` occupies, size field
/// included. Lets a reader split concatenated marshalled structures.
pub fn tpm2b_wire_len(input: &[u8]) -> Result<usize> {
    if input.len() < 2 {
        return Err(truncated());
    }
    let size = u16::from_be_bytes(input[..2].try_into().unwrap()) as usize;
    if input.len() < 2 + size {
        return Err(truncated());
    }
    Ok(2 + size)
}

/// `TPML_PCR_SELECTION`: a u32 count of `TPMS_PCR_SELECTION`, each a u16
/// hash algorithm, a one-byte select size (3 for 24 PCRs) and the select
/// bitmap, least significant PCR first.
pub fn marshal_pcr_selection(selections: &[(u16, u32)]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(selections.len() as u32).to_be_bytes());
    for (alg_id, pcr_mask) in selections {
        out.extend_from_slice(&alg_id.to_be_bytes());
        out.push(3);
        out.extend_from_slice(&pcr_mask.to_le_bytes()[..3]);
    }
    out
}

pub fn unmarshal_pcr_selection(input: &mut &[u8]) -> Result<Vec<(u16, u32)>> {
    let count = get_u32(input)? as usize;
    if count > 16 {
        return Err(Error::Other("implausible PCR selection count".into()));
    }
    let mut selections = Vec::with_capacity(count);
    for _ in 0..count {
        let alg_id = get_u16(input)?;
        let select_size = get_bytes(input, 1)?[0] as usize;
        let select = get_bytes(input, select_size)?;
        let mut pcr_mask = 0u32;
        for (i, byte) in select.iter().enumerate().take(4) {
            pcr_mask |= (*byte as u32) << (8 * i);
        }
        selections.push((alg_id, pcr_mask));
    }
    Ok(selections)
}

/// `TPMT_SIGNATURE` restricted to the RSA signature schemes this tool
/// emits and verifies: scheme, hash algorithm, and the `TPM2B` signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicySignature {
    pub sig_alg: u16,
    pub hash_alg: u16,
    pub signature: Vec<u8>,
}

impl PolicySignature {
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.sig_alg.to_be_bytes());
        out.extend_from_slice(&self.hash_alg.to_be_bytes());
        out.extend_from_slice(&marshal_tpm2b(&self.signature));
        out
    }

    pub fn unmarshal(input: &mut &[u8]) -> Result<PolicySignature> {
        let sig_alg = get_u16(input)?;
        if sig_alg != TPM2_ALG_RSASSA && sig_alg != TPM2_ALG_RSAPSS {
            return Err(Error::Other(format!(
                "unsupported signature algorithm {sig_alg:#x}"
            )));
        }
        let hash_alg = get_u16(input)?;
        let signature = unmarshal_tpm2b(input)?;
        Ok(PolicySignature {
            sig_alg,
            hash_alg,
            signature,
        })
    }
}
