use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha512};

use super::CryptoError;

/// Computes HMAC-SHA256 over `data` under `key`.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32], CryptoError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).map_err(|_| CryptoError::CipherInit)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// Computes HMAC-SHA512 over `data` under `key`.
pub fn hmac_sha512(key: &[u8], data: &[u8]) -> Result<[u8; 64], CryptoError> {
    let mut mac = Hmac::<Sha512>::new_from_slice(key).map_err(|_| CryptoError::CipherInit)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 4231 test case 1.
    #[test]
    fn hmac_sha256_matches_rfc4231_case_1() {
        let key = [0x0b_u8; 20];
        let data = b"Hi There";
        let expected = hex_decode(
            "b0344c61d8db38535ca8afceaf0bf12b881dc200c9833da726e9376c2e32cff",
        );
        assert_eq!(hmac_sha256(&key, data).unwrap().to_vec(), expected);
    }

    #[test]
    fn hmac_sha512_matches_rfc4231_case_1() {
        let key = [0x0b_u8; 20];
        let data = b"Hi There";
        let expected = hex_decode(
            "87aa7cdea5ef619d4ff0b4241a1d6cb02379f4e2ce4ec2787ad0b30545e17cde\
             daa833b7d6b8a702038b274eaea3f4e4be9d914eeb61f1702e696c203a126854",
        );
        assert_eq!(hmac_sha512(&key, data).unwrap().to_vec(), expected);
    }

    fn hex_decode(input: &str) -> Vec<u8> {
        (0..input.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&input[i..i + 2], 16).unwrap())
            .collect()
    }
}
