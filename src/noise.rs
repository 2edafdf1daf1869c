//! Noise_XX_25519_AESGCM_SHA256 handshake state and post-handshake framing.
//!
//! [`HandshakeState`] drives the three-message XX exchange. Once the
//! handshake completes, [`HandshakeState::finish`] splits the chaining key
//! into a [`Transport`] holding independent send/receive [`CipherState`]s;
//! every frame after that point is AEAD-encrypted with a strictly
//! incrementing per-direction nonce.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::crypto::hkdf_expand;

/// Failure of the Noise state machine. Nonce reuse or AEAD authentication
/// failure is always fatal to the session.
#[derive(Debug, Error)]
pub enum NoiseError {
    #[error("cipher error (decryption failed or nonce space exhausted)")]
    Cipher,
    #[error("invalid key material length")]
    InvalidKeyMaterial,
    #[error("operation invalid for current handshake stage")]
    WrongStage,
}

/// Coarse handshake progress, matching the lifecycle described for the
/// connection core: a fresh handshake starts `Uninitialized`, moves to
/// `EphemeralSent` once the client hello goes out, to
/// `HandshakeProcessed` once the server hello has been mixed in, and to
/// `Established` once split into a [`Transport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoiseStage {
    Uninitialized,
    EphemeralSent,
    HandshakeProcessed,
    Established,
}

/// Handshake-phase Noise state: handshake hash and chaining key, plus the
/// single active cipher (if any) used to encrypt/decrypt handshake
/// payloads as the XX pattern progresses.
#[derive(Clone)]
pub struct HandshakeState {
    h: [u8; 32],
    chaining_key: [u8; 32],
    cipher_key: Option<[u8; 32]>,
    nonce: u32,
    stage: NoiseStage,
}

impl HandshakeState {
    /// Creates a new handshake state and mixes the given prologue into the
    /// handshake hash.
    pub fn new(prologue: &[u8]) -> Self {
        let h = initialize_handshake_hash(b"Noise_XX_25519_AESGCM_SHA256");
        let mut state = Self {
            h,
            chaining_key: h,
            cipher_key: None,
            nonce: 0,
            stage: NoiseStage::Uninitialized,
        };
        state.mix_hash(prologue);
        state
    }

    /// Current handshake stage.
    pub fn stage(&self) -> NoiseStage {
        self.stage
    }

    /// Records that the client's ephemeral key has been mixed in and sent.
    pub fn mark_ephemeral_sent(&mut self) {
        self.stage = NoiseStage::EphemeralSent;
    }

    /// Records that the server hello has been fully processed (both DHs
    /// mixed in).
    pub fn mark_handshake_processed(&mut self) {
        self.stage = NoiseStage::HandshakeProcessed;
    }

    /// Mixes arbitrary data (a public key, a ciphertext) into the
    /// handshake hash.
    pub fn mix_hash(&mut self, data: &[u8]) {
        let mut hasher = Sha256::new();
        hasher.update(self.h);
        hasher.update(data);
        self.h.copy_from_slice(&hasher.finalize());
    }

    /// Mixes a new DH output into the chaining key and derives a fresh
    /// handshake cipher key (`MixKey` in the Noise spec).
    pub fn mix_into_key(&mut self, ikm: &[u8]) -> Result<(), NoiseError> {
        let output = hkdf_expand(Some(&self.chaining_key), ikm, &[], 64)
            .map_err(|_| NoiseError::InvalidKeyMaterial)?;
        self.chaining_key.copy_from_slice(&output[..32]);
        let mut cipher_key = [0_u8; 32];
        cipher_key.copy_from_slice(&output[32..]);
        self.cipher_key = Some(cipher_key);
        self.nonce = 0;
        Ok(())
    }

    /// The current handshake hash, used as associated data for handshake
    /// payload encryption.
    pub fn handshake_hash(&self) -> [u8; 32] {
        self.h
    }

    /// Encrypts a handshake payload under the current cipher key (if any)
    /// and mixes the ciphertext into the handshake hash, matching Noise's
    /// `EncryptAndHash`. Before any DH has been mixed in, this is a
    /// passthrough that still updates the hash.
    pub fn encrypt_and_hash(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let ad = self.h;
        let out = match self.cipher_key {
            Some(key) => {
                let ciphertext = aead_encrypt(&key, self.nonce, plaintext, &ad)?;
                self.nonce = self.nonce.wrapping_add(1);
                ciphertext
            }
            None => plaintext.to_vec(),
        };
        self.mix_hash(&out);
        Ok(out)
    }

    /// Decrypts a handshake payload and mixes the ciphertext into the
    /// handshake hash, matching Noise's `DecryptAndHash`.
    pub fn decrypt_and_hash(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let ad = self.h;
        let out = match self.cipher_key {
            Some(key) => aead_decrypt(&key, self.nonce, ciphertext, &ad)?,
            None => ciphertext.to_vec(),
        };
        if self.cipher_key.is_some() {
            self.nonce = self.nonce.wrapping_add(1);
        }
        self.mix_hash(ciphertext);
        Ok(out)
    }

    /// Splits the chaining key into independent send/receive transport
    /// ciphers and marks the handshake `Established`. The handshake's
    /// initiator (always the client in this protocol) sends under the
    /// first derived key and receives under the second.
    pub fn finish(mut self) -> Transport {
        self.stage = NoiseStage::Established;
        let output = hkdf_expand(Some(&self.chaining_key), &[], &[], 64)
            .expect("hkdf expand with fixed output length never fails");
        let mut send_key = [0_u8; 32];
        send_key.copy_from_slice(&output[..32]);
        let mut recv_key = [0_u8; 32];
        recv_key.copy_from_slice(&output[32..]);

        Transport {
            send: CipherState::new(send_key),
            recv: CipherState::new(recv_key),
        }
    }

    /// Same split as [`Self::finish`] but with the two derived keys
    /// swapped, for the responder side of the handshake: what the
    /// initiator sends under the first key, the responder must receive
    /// under it, and vice versa. This crate always plays the initiator in
    /// production; this exists for test harnesses that stand in for the
    /// server end of the handshake.
    pub fn finish_as_responder(mut self) -> Transport {
        self.stage = NoiseStage::Established;
        let output = hkdf_expand(Some(&self.chaining_key), &[], &[], 64)
            .expect("hkdf expand with fixed output length never fails");
        let mut initiator_send_key = [0_u8; 32];
        initiator_send_key.copy_from_slice(&output[..32]);
        let mut initiator_recv_key = [0_u8; 32];
        initiator_recv_key.copy_from_slice(&output[32..]);

        Transport {
            send: CipherState::new(initiator_recv_key),
            recv: CipherState::new(initiator_send_key),
        }
    }
}

/// One direction's AEAD cipher key plus its strictly-incrementing nonce
/// counter.
#[derive(Clone)]
pub struct CipherState {
    key: [u8; 32],
    counter: u32,
}

impl CipherState {
    fn new(key: [u8; 32]) -> Self {
        Self { key, counter: 0 }
    }

    /// Encrypts `plaintext` with the next nonce in sequence.
    pub fn encrypt(&mut self, plaintext: &[u8], ad: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let ciphertext = aead_encrypt(&self.key, self.counter, plaintext, ad)?;
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or(NoiseError::Cipher)?;
        Ok(ciphertext)
    }

    /// Decrypts `ciphertext` with the next nonce in sequence. A reordered
    /// or duplicated frame fails here because the receiver's counter no
    /// longer matches the nonce the sender used.
    pub fn decrypt(&mut self, ciphertext: &[u8], ad: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let plaintext = aead_decrypt(&self.key, self.counter, ciphertext, ad)?;
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or(NoiseError::Cipher)?;
        Ok(plaintext)
    }
}

/// Post-handshake Noise transport: independent send/receive ciphers with
/// their own nonce sequences.
pub struct Transport {
    send: CipherState,
    recv: CipherState,
}

impl Transport {
    /// Encrypts a plaintext application frame (a binary node payload) for
    /// sending. No associated data is used post-handshake.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        self.send.encrypt(plaintext, &[])
    }

    /// Decrypts an inbound application frame.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        self.recv.decrypt(ciphertext, &[])
    }
}

fn aead_encrypt(key: &[u8; 32], counter: u32, plaintext: &[u8], ad: &[u8]) -> Result<Vec<u8>, NoiseError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| NoiseError::Cipher)?;
    let nonce = build_nonce(counter);
    cipher
        .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad: ad })
        .map_err(|_| NoiseError::Cipher)
}

fn aead_decrypt(key: &[u8; 32], counter: u32, ciphertext: &[u8], ad: &[u8]) -> Result<Vec<u8>, NoiseError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| NoiseError::Cipher)?;
    let nonce = build_nonce(counter);
    cipher
        .decrypt(Nonce::from_slice(&nonce), Payload { msg: ciphertext, aad: ad })
        .map_err(|_| NoiseError::Cipher)
}

fn build_nonce(counter: u32) -> [u8; 12] {
    let mut nonce = [0_u8; 12];
    nonce[8..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

fn initialize_handshake_hash(protocol_name: &[u8]) -> [u8; 32] {
    let mut hash = [0_u8; 32];
    if protocol_name.len() <= hash.len() {
        hash[..protocol_name.len()].copy_from_slice(protocol_name);
        return hash;
    }
    hash.copy_from_slice(&Sha256::digest(protocol_name));
    hash
}
