use curve25519_dalek::{
    constants::ED25519_BASEPOINT_TABLE, edwards::CompressedEdwardsY, montgomery::MontgomeryPoint,
    scalar::Scalar,
};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use x25519_dalek::{PublicKey, StaticSecret};

/// X25519 keypair used for the Noise handshake and identity primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPair {
    /// Public key bytes.
    pub public: [u8; 32],
    /// Private key bytes.
    pub private: [u8; 32],
}

impl KeyPair {
    /// Builds a keypair from a private key seed.
    pub fn from_private(private: [u8; 32]) -> Self {
        let secret = StaticSecret::from(private);
        let public = PublicKey::from(&secret).to_bytes();
        Self { public, private }
    }

    /// Performs X25519 Diffie-Hellman against a peer public key.
    pub fn diffie_hellman(&self, peer_public: &[u8; 32]) -> [u8; 32] {
        let secret = StaticSecret::from(self.private);
        let public = PublicKey::from(*peer_public);
        secret.diffie_hellman(&public).to_bytes()
    }
}

/// Generates a new random X25519 keypair.
pub fn generate_keypair() -> KeyPair {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret).to_bytes();
    KeyPair {
        public,
        private: secret.to_bytes(),
    }
}

/// Generates a 14-bit registration identifier, as used for the account's
/// `registrationId` field.
pub fn generate_registration_id() -> u32 {
    let mut raw = [0_u8; 4];
    OsRng.fill_bytes(&mut raw);
    u32::from_le_bytes(raw) & 0x3FFF
}

/// Prefix byte used when signing/identifying Curve25519 public keys in the
/// Signal key-bundle wire format ("signal pub key").
pub const KEY_BUNDLE_TYPE: u8 = 5;

/// Prepends the Signal key-bundle prefix to a 32-byte public key.
pub fn signal_public_key(public: &[u8; 32]) -> [u8; 33] {
    let mut out = [0_u8; 33];
    out[0] = KEY_BUNDLE_TYPE;
    out[1..].copy_from_slice(public);
    out
}

/// Signs an arbitrary message using the XEdDSA construction over a
/// Curve25519 private key, as used by the Signal protocol.
pub fn sign_message(private: [u8; 32], public: [u8; 32], message: &[u8]) -> [u8; 64] {
    let secret = Scalar::from_bytes_mod_order(private);
    let nonce = hash_to_scalar(&[&private, &public, message]);
    let nonce_point = (&nonce * ED25519_BASEPOINT_TABLE).compress().to_bytes();
    let challenge = hash_to_scalar(&[&nonce_point, &public, message]);
    let s = nonce + challenge * secret;

    let mut out = [0_u8; 64];
    out[..32].copy_from_slice(&nonce_point);
    out[32..].copy_from_slice(&s.to_bytes());
    out
}

/// Verifies a signature over `message`. Accepts both pure Ed25519
/// signatures (used for the reference client's noise certificate chain)
/// and XEdDSA signatures over Curve25519 keys (used for Signal identity
/// and pre-key signatures).
pub fn verify_message(public: [u8; 32], message: &[u8], signature: &[u8]) -> bool {
    if signature.len() != 64 {
        return false;
    }

    if let Ok(verifying_key) = VerifyingKey::from_bytes(&public) {
        if let Ok(sig) = Signature::from_slice(signature) {
            if verifying_key.verify(message, &sig).is_ok() {
                return true;
            }
        }
    }

    let mut r_bytes = [0_u8; 32];
    r_bytes.copy_from_slice(&signature[..32]);
    let Some(r_point) = CompressedEdwardsY(r_bytes).decompress() else {
        return false;
    };

    let mut s_bytes = [0_u8; 32];
    s_bytes.copy_from_slice(&signature[32..]);
    let Some(s) = Option::<Scalar>::from(Scalar::from_canonical_bytes(s_bytes)) else {
        return false;
    };

    let mont = MontgomeryPoint(public);
    let challenge = hash_to_scalar(&[&r_bytes, &public, message]);
    let lhs = &s * ED25519_BASEPOINT_TABLE;
    for sign in [0, 1] {
        let Some(a_point) = mont.to_edwards(sign) else {
            continue;
        };
        let rhs = r_point + (challenge * a_point);
        if lhs == rhs {
            return true;
        }
    }

    false
}

fn hash_to_scalar(parts: &[&[u8]]) -> Scalar {
    let mut hasher = Sha512::new();
    for part in parts {
        hasher.update(part);
    }

    let mut wide = [0_u8; 64];
    wide.copy_from_slice(&hasher.finalize());
    Scalar::from_bytes_mod_order_wide(&wide)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_roundtrip() {
        let keypair = generate_keypair();
        let message = b"pre-key signature payload";
        let signature = sign_message(keypair.private, keypair.public, message);
        assert!(verify_message(keypair.public, message, &signature));
    }

    #[test]
    fn verify_rejects_tampered_message() {
        let keypair = generate_keypair();
        let signature = sign_message(keypair.private, keypair.public, b"original");
        assert!(!verify_message(keypair.public, b"tampered", &signature));
    }

    #[test]
    fn diffie_hellman_is_symmetric() {
        let a = generate_keypair();
        let b = generate_keypair();
        assert_eq!(a.diffie_hellman(&b.public), b.diffie_hellman(&a.public));
    }

    #[test]
    fn signal_public_key_prefixes_version_byte() {
        let keypair = generate_keypair();
        let bundle = signal_public_key(&keypair.public);
        assert_eq!(bundle[0], KEY_BUNDLE_TYPE);
        assert_eq!(&bundle[1..], &keypair.public);
    }

    #[test]
    fn registration_id_fits_14_bits() {
        for _ in 0..32 {
            assert!(generate_registration_id() < 16_384);
        }
    }
}
