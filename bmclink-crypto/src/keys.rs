//! Session key material derived from the RAKP exchange.

use crate::{hmac, HashAlg};

/// SIK and its derived sub-keys, computed once RAKP2 verifies.
///
/// K1 feeds packet integrity (HMAC key), the first 16 bytes of K2 are the
/// AES-CBC-128 confidentiality key.
#[derive(Clone)]
pub struct SessionKeys {
    alg: HashAlg,
    sik: Vec<u8>,
    k1: Vec<u8>,
    k2: Vec<u8>,
}

impl SessionKeys {
    /// Derive SIK, K1 and K2.
    ///
    /// `kg` is the BMC's additional key when configured, otherwise the
    /// user password. The remaining inputs are the RAKP1/RAKP2 random
    /// values and the privilege byte + user name as sent in RAKP1.
    pub fn derive(
        alg: HashAlg,
        kg: &[u8],
        local_random: &[u8; 16],
        remote_random: &[u8; 16],
        priv_byte: u8,
        userid: &[u8],
    ) -> Self {
        let mut sikdata = Vec::with_capacity(34 + userid.len());
        sikdata.extend_from_slice(local_random);
        sikdata.extend_from_slice(remote_random);
        sikdata.push(priv_byte);
        sikdata.push(userid.len() as u8);
        sikdata.extend_from_slice(userid);
        let sik = hmac(alg, kg, &sikdata);
        // The fill stays 20 bytes regardless of hash width (IPMI 13.32).
        let k1 = hmac(alg, &sik, &[0x01u8; 20]);
        let k2 = hmac(alg, &sik, &[0x02u8; 20]);
        Self { alg, sik, k1, k2 }
    }

    /// The negotiated hash algorithm.
    pub fn alg(&self) -> HashAlg {
        self.alg
    }

    /// The session integrity key itself (verifies RAKP4).
    pub fn sik(&self) -> &[u8] {
        &self.sik
    }

    /// Integrity sub-key used for packet HMACs.
    pub fn k1(&self) -> &[u8] {
        &self.k1
    }

    /// Confidentiality key material.
    pub fn k2(&self) -> &[u8] {
        &self.k2
    }

    /// AES-CBC-128 key: the first 16 bytes of K2.
    pub fn aes_key(&self) -> [u8; 16] {
        let mut key = [0u8; 16];
        key.copy_from_slice(&self.k2[..16]);
        key
    }
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Keep key material out of logs.
        write!(f, "SessionKeys(alg={:?})", self.alg)
    }
}
