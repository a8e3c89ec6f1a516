//! ChaCha20-Poly1305 envelope primitives.
//!
//! The split is bit-exact and shared with device firmware: associated data
//! is the first 11 bytes of the packet header, the nonce is the next 12.
//! Nothing is reordered or padded.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};

/// Bytes of header used as associated data.
pub const AAD_LEN: usize = 11;
/// Bytes of header used as the nonce.
pub const NONCE_LEN: usize = 12;
/// Poly1305 tag appended to every ciphertext.
pub const TAG_LEN: usize = 16;

/// Authentication failed: the key was wrong or the envelope was tampered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("envelope authentication failed")]
pub struct AuthFailure;

/// Encrypt `plaintext`, returning `ciphertext || tag`.
pub fn seal(
    key: &[u8; 32],
    aad: &[u8; AAD_LEN],
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
) -> Vec<u8> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        // Encryption only fails on plaintext sizes beyond the AEAD limit,
        // far larger than any frame.
        .expect("plaintext within AEAD bounds")
}

/// Decrypt and authenticate `ciphertext || tag`.
pub fn open(
    key: &[u8; 32],
    aad: &[u8; AAD_LEN],
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
) -> Result<Vec<u8>, AuthFailure> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| AuthFailure)
}
