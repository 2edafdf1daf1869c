//! Cryptographic primitives used by the Noise handshake, the binary node
//! codec's surrounding protocol, and the credential/pre-key layers.
//!
//! Every primitive in this module either succeeds or returns
//! [`CryptoError`]; callers never attempt to recover from a crypto
//! failure, they propagate it.

mod cipher;
mod kdf;
mod keys;
mod mac;

pub use cipher::{aes_cbc_decrypt, aes_cbc_decrypt_with_iv, aes_cbc_encrypt, aes_cbc_encrypt_with_iv};
pub use kdf::hkdf_expand;
pub use keys::{
    generate_keypair, generate_registration_id, sign_message, signal_public_key, verify_message,
    KeyPair, KEY_BUNDLE_TYPE,
};
pub use mac::{hmac_sha256, hmac_sha512};

use thiserror::Error;

/// Failure of a cryptographic primitive. Always fatal to the caller's
/// current operation; never caught and retried internally.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("cipher initialization failed")]
    CipherInit,
    #[error("ciphertext padding or length invalid")]
    InvalidPadding,
    #[error("input too short for declared format")]
    InputTooShort,
    #[error("hkdf expand failed for requested output length")]
    HkdfExpand,
}
