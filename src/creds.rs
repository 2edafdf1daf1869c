//! Persistent identity state and the storage trait the core is
//! parameterized over. The core never assumes a backing medium: all
//! reads/writes go through [`CredentialStore`], and credential changes are
//! announced via `creds.update` rather than written back directly by
//! callers.

use std::collections::HashMap;

use async_trait::async_trait;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{generate_keypair, generate_registration_id, sign_message, KeyPair};

#[derive(Debug, Error)]
pub enum CredsError {
    #[error("firstUnuploadedPreKeyId ({first}) exceeds nextPreKeyId ({next})")]
    PreKeyCounterInvariant { first: u32, next: u32 },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("no credentials present in the store")]
    NotFound,
}

/// A signed pre-key record: the keypair plus the identity-key signature
/// over its public half, uploaded to the server's pre-key pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPreKeyRecord {
    pub key_id: u32,
    pub key_pair: KeyPair,
    #[serde(with = "serde_sig64")]
    pub signature: [u8; 64],
}

/// The paired device's own identity, present only once pairing succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeInfo {
    pub jid: String,
    pub name: Option<String>,
}

/// Persistent identity state: the Noise static keypair, the signed
/// identity keypair, registration metadata, and pre-key bookkeeping. The
/// shape a [`CredentialStore`] implementation actually persists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticationCreds {
    pub noise_key: KeyPair,
    pub signed_identity_key: KeyPair,
    pub registration_id: u32,
    pub adv_secret_key: [u8; 32],
    pub signed_pre_key: SignedPreKeyRecord,
    pub next_pre_key_id: u32,
    pub first_unuploaded_pre_key_id: u32,
    pub me: Option<MeInfo>,
}

impl AuthenticationCreds {
    /// Generates a fresh set of credentials for a new, unpaired session.
    pub fn generate() -> Self {
        let noise_key = generate_keypair();
        let signed_identity_key = generate_keypair();
        let signed_pre_key = generate_signed_pre_key(1, &signed_identity_key);

        let mut adv_secret_key = [0_u8; 32];
        OsRng.fill_bytes(&mut adv_secret_key);

        Self {
            noise_key,
            signed_identity_key,
            registration_id: generate_registration_id(),
            adv_secret_key,
            signed_pre_key,
            next_pre_key_id: 1,
            first_unuploaded_pre_key_id: 1,
            me: None,
        }
    }

    /// Checks the pre-key counter invariant: no pre-key can be marked
    /// unuploaded past the next id that hasn't been generated yet.
    pub fn validate(&self) -> Result<(), CredsError> {
        if self.first_unuploaded_pre_key_id > self.next_pre_key_id {
            return Err(CredsError::PreKeyCounterInvariant {
                first: self.first_unuploaded_pre_key_id,
                next: self.next_pre_key_id,
            });
        }
        Ok(())
    }
}

/// `serde` has no built-in impl for `[u8; 64]`; this round-trips it as a
/// byte string instead.
mod serde_sig64 {
    use serde::{de::Error as DeError, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &[u8; 64], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(value)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 64], D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        if bytes.len() != 64 {
            return Err(D::Error::invalid_length(bytes.len(), &"64 bytes"));
        }

        let mut out = [0_u8; 64];
        out.copy_from_slice(&bytes);
        Ok(out)
    }
}

/// Generates a signed pre-key record, signing the public key with the
/// given identity keypair.
pub fn generate_signed_pre_key(key_id: u32, identity_key: &KeyPair) -> SignedPreKeyRecord {
    let key_pair = generate_keypair();
    let signature = sign_message(identity_key.private, identity_key.public, &key_pair.public);
    SignedPreKeyRecord { key_id, key_pair, signature }
}

/// The storage abstraction the connection core is parameterized over.
/// `get`/`set`/`transaction` operate on opaque `(category, id) -> bytes`
/// records (used for the pre-key pool); `load_creds`/`save_creds` are the
/// dedicated credential slot.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, category: &str, ids: &[String]) -> Result<HashMap<String, Vec<u8>>, StoreError>;

    async fn set(&self, category: &str, values: HashMap<String, Vec<u8>>) -> Result<(), StoreError>;

    /// Runs `ops` as a single atomic group of `set` calls: either every
    /// write in the group lands, or none do.
    async fn transaction(&self, ops: Vec<(String, HashMap<String, Vec<u8>>)>) -> Result<(), StoreError>;

    async fn load_creds(&self) -> Result<Option<AuthenticationCreds>, StoreError>;

    async fn save_creds(&self, creds: &AuthenticationCreds) -> Result<(), StoreError>;
}


#[cfg(test)]
mod tests {
    use super::in_memory::InMemoryStore;
    use super::*;

    #[test]
    fn generated_creds_satisfy_the_prekey_invariant() {
        let creds = AuthenticationCreds::generate();
        assert!(creds.validate().is_ok());
    }

    #[test]
    fn validate_rejects_first_unuploaded_past_next() {
        let mut creds = AuthenticationCreds::generate();
        creds.first_unuploaded_pre_key_id = creds.next_pre_key_id + 1;
        assert!(matches!(
            creds.validate(),
            Err(CredsError::PreKeyCounterInvariant { .. })
        ));
    }

    #[test]
    fn signed_pre_key_signature_verifies_against_identity_key() {
        let identity = generate_keypair();
        let record = generate_signed_pre_key(7, &identity);
        assert!(crate::crypto::verify_message(
            identity.public,
            &record.key_pair.public,
            &record.signature
        ));
    }

    #[tokio::test]
    async fn in_memory_store_round_trips_creds_and_prekey_records() {
        let store = InMemoryStore::default();
        assert!(store.load_creds().await.unwrap().is_none());

        let creds = AuthenticationCreds::generate();
        store.save_creds(&creds).await.unwrap();
        let loaded = store.load_creds().await.unwrap().unwrap();
        assert_eq!(loaded.registration_id, creds.registration_id);

        let mut values = HashMap::new();
        values.insert("1".to_string(), vec![1, 2, 3]);
        store.transaction(vec![("pre-key".to_string(), values)]).await.unwrap();

        let fetched = store.get("pre-key", &["1".to_string()]).await.unwrap();
        assert_eq!(fetched.get("1").unwrap(), &vec![1, 2, 3]);
    }
}
