use hkdf::Hkdf;
use sha2::Sha256;

use super::CryptoError;

/// HKDF-Expand (RFC 5869) over `ikm`, with an optional `salt` folded in via
/// HKDF-Extract and an optional `info` context string, producing
/// `output_len` bytes.
pub fn hkdf_expand(
    salt: Option<&[u8]>,
    ikm: &[u8],
    info: &[u8],
    output_len: usize,
) -> Result<Vec<u8>, CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    let mut output = vec![0_u8; output_len];
    hk.expand(info, &mut output)
        .map_err(|_| CryptoError::HkdfExpand)?;
    Ok(output)
}
