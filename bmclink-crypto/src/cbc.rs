//! AES-CBC-128 assembled from raw AES block operations.
//!
//! The RMCP+ confidentiality algorithm (AES-CBC-128) operates on whole
//! blocks; the caller applies the table 13-20 pad ([`crate::aes_pad`])
//! before encrypting and strips it after decrypting.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;

/// Encrypt `data` in place with AES-CBC-128.
///
/// `data` must already be padded to a multiple of 16 bytes.
pub fn cbc_encrypt(key: &[u8; 16], iv: &[u8; 16], data: &mut [u8]) {
    debug_assert_eq!(data.len() % 16, 0);
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut prev = *iv;
    for block in data.chunks_exact_mut(16) {
        for (b, p) in block.iter_mut().zip(prev.iter()) {
            *b ^= p;
        }
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
        prev.copy_from_slice(block);
    }
}

/// Decrypt `data` in place with AES-CBC-128.
///
/// `data` must be a multiple of 16 bytes; the pad is left in place.
pub fn cbc_decrypt(key: &[u8; 16], iv: &[u8; 16], data: &mut [u8]) {
    debug_assert_eq!(data.len() % 16, 0);
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut prev = *iv;
    for block in data.chunks_exact_mut(16) {
        let mut saved = [0u8; 16];
        saved.copy_from_slice(block);
        cipher.decrypt_block(GenericArray::from_mut_slice(block));
        for (b, p) in block.iter_mut().zip(prev.iter()) {
            *b ^= p;
        }
        prev = saved;
    }
}
