use aes::Aes256;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand_core::{OsRng, RngCore};

use super::CryptoError;

type Encryptor = cbc::Encryptor<Aes256>;
type Decryptor = cbc::Decryptor<Aes256>;

const IV_LEN: usize = 16;

/// Encrypts `plaintext` under AES-256-CBC with a fresh random IV, which is
/// prefixed to the returned ciphertext (`iv || ciphertext`).
pub fn aes_cbc_encrypt(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut iv = [0_u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let ciphertext = aes_cbc_encrypt_with_iv(key, &iv, plaintext)?;
    let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypts a payload produced by [`aes_cbc_encrypt`]: a 16-byte IV
/// followed by the ciphertext.
pub fn aes_cbc_decrypt(key: &[u8; 32], payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if payload.len() < IV_LEN {
        return Err(CryptoError::InputTooShort);
    }
    let (iv, ciphertext) = payload.split_at(IV_LEN);
    aes_cbc_decrypt_with_iv(key, iv, ciphertext)
}

/// Encrypts `plaintext` under AES-256-CBC using an explicit IV. The IV is
/// not stored in the output; the caller is responsible for transporting
/// it out of band.
pub fn aes_cbc_encrypt_with_iv(
    key: &[u8; 32],
    iv: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let encryptor =
        Encryptor::new_from_slices(key, iv).map_err(|_| CryptoError::CipherInit)?;
    Ok(encryptor.encrypt_padded_vec_mut::<cbc::cipher::block_padding::Pkcs7>(plaintext))
}

/// Decrypts a ciphertext produced with an explicit IV (no prefix).
pub fn aes_cbc_decrypt_with_iv(
    key: &[u8; 32],
    iv: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let decryptor =
        Decryptor::new_from_slices(key, iv).map_err(|_| CryptoError::CipherInit)?;
    decryptor
        .decrypt_padded_vec_mut::<cbc::cipher::block_padding::Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::InvalidPadding)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_iv_roundtrip() {
        let key = [7_u8; 32];
        let plaintext = b"media key payload that spans more than one AES block boundary";
        let ciphertext = aes_cbc_encrypt(&key, plaintext).expect("encrypt");
        let decrypted = aes_cbc_decrypt(&key, &ciphertext).expect("decrypt");
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn explicit_iv_roundtrip() {
        let key = [3_u8; 32];
        let iv = [9_u8; 16];
        let plaintext = b"short";
        let ciphertext = aes_cbc_encrypt_with_iv(&key, &iv, plaintext).expect("encrypt");
        let decrypted = aes_cbc_decrypt_with_iv(&key, &iv, &ciphertext).expect("decrypt");
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn decrypt_rejects_truncated_payload() {
        let key = [1_u8; 32];
        assert!(matches!(
            aes_cbc_decrypt(&key, &[0_u8; 4]),
            Err(CryptoError::InputTooShort)
        ));
    }
}
