//! Cryptographic primitives for the IPMI session layer.
//!
//! Provides:
//! - The IPMI two's-complement checksum
//! - AES-CBC-128 confidentiality (table 13-20 pad scheme)
//! - HMAC-SHA1 / HMAC-SHA256 with RMCP+ truncation
//! - The IPMI 1.5 MD5 authcode
//! - `SessionKeys`: SIK / K1 / K2 derivation from the RAKP exchange

#![deny(unsafe_code)]

pub mod cbc;

mod keys;

pub use keys::SessionKeys;

use hmac::{Hmac, Mac};

// ─── Checksums and padding ───────────────────────────────────────────────────

/// IPMI header/body checksum: two's complement of the 8-bit sum.
pub fn checksum(data: &[u8]) -> u8 {
    let sum: u8 = data.iter().fold(0u8, |a, &b| a.wrapping_add(b));
    (sum ^ 0xff).wrapping_add(1)
}

/// Confidentiality pad per table 13-20: bytes 0x01, 0x02, … 0xN followed by
/// the pad length N, sized so that payload + pad + length byte is a multiple
/// of 16.
pub fn aes_pad(payload_len: usize) -> Vec<u8> {
    let mut needed = (payload_len + 1) % 16;
    if needed != 0 {
        needed = 16 - needed;
    }
    let mut pad = Vec::with_capacity(needed + 1);
    for v in 1..=needed {
        pad.push(v as u8);
    }
    pad.push(needed as u8);
    pad
}

// ─── HMAC ────────────────────────────────────────────────────────────────────

/// Hash algorithm negotiated for the session.
///
/// Cipher suite 3 uses SHA-1, suite 17 uses SHA-256. The choice fixes both
/// the HMAC output size and the truncated integrity-code length.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HashAlg {
    Sha1,
    Sha256,
}

impl HashAlg {
    /// Full HMAC output length in bytes.
    pub fn mac_len(self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha256 => 32,
        }
    }

    /// Truncated integrity-code length used on the wire (RFC 2404 style).
    pub fn trunc_len(self) -> usize {
        match self {
            Self::Sha1 => 12,
            Self::Sha256 => 16,
        }
    }
}

/// Full-length HMAC over `data` with `key`.
pub fn hmac(alg: HashAlg, key: &[u8], data: &[u8]) -> Vec<u8> {
    match alg {
        HashAlg::Sha1 => {
            let mut mac = Hmac::<sha1::Sha1>::new_from_slice(key).expect("hmac key");
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
        HashAlg::Sha256 => {
            let mut mac = Hmac::<sha2::Sha256>::new_from_slice(key).expect("hmac key");
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
    }
}

/// HMAC truncated to the algorithm's wire length.
pub fn hmac_trunc(alg: HashAlg, key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut out = hmac(alg, key, data);
    out.truncate(alg.trunc_len());
    out
}

// ─── IPMI 1.5 MD5 authcode ───────────────────────────────────────────────────

/// The password exceeds the 16 bytes IPMI 1.5 allows for MD5 authcodes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PasswordTooLong;

impl std::fmt::Display for PasswordTooLong {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "password is too long for IPMI 1.5 (limit 16 bytes)")
    }
}
impl std::error::Error for PasswordTooLong {}

/// IPMI 1.5 MD5 authcode: MD5(password16 ‖ session id ‖ payload ‖ seq ‖
/// password16) with the password zero-padded to 16 bytes.
pub fn md5_authcode(
    password: &[u8],
    session_id: u32,
    sequence: u32,
    payload: &[u8],
) -> Result<[u8; 16], PasswordTooLong> {
    if password.len() > 16 {
        return Err(PasswordTooLong);
    }
    let mut padded = [0u8; 16];
    padded[..password.len()].copy_from_slice(password);

    use md5::{Digest, Md5};
    let mut h = Md5::new();
    h.update(padded);
    h.update(session_id.to_le_bytes());
    h.update(payload);
    h.update(sequence.to_le_bytes());
    h.update(padded);
    Ok(h.finalize().into())
}
