//! Pre-key pool maintenance: generates and uploads fresh Signal pre-keys
//! when the server-side pool runs low.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{
    binary_node::BinaryNode,
    creds::{generate_signed_pre_key, AuthenticationCreds, CredentialStore, StoreError},
    crypto::KeyPair,
};

/// Below this many uploaded-but-unconsumed pre-keys, top up the pool.
pub const MIN_PREKEY_COUNT: u32 = 30;

/// How many fresh pre-keys to generate per top-up.
pub const INITIAL_PREKEY_COUNT: u32 = 30;

/// One freshly generated pre-key awaiting upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreKey {
    pub id: u32,
    pub key_pair: KeyPair,
}

/// Generates `count` pre-keys starting at `creds.next_pre_key_id`,
/// persists them under `pre-key/<id>` inside a single store transaction,
/// and advances `next_pre_key_id`/`first_unuploaded_pre_key_id` on
/// `creds` so an interrupted upload never leaves a gap: either every key
/// lands and the counters move, or neither happens.
pub async fn top_up_pre_keys(
    store: &impl CredentialStore,
    creds: &mut AuthenticationCreds,
    count: u32,
) -> Result<Vec<PreKey>, StoreError> {
    let start_id = creds.next_pre_key_id;
    let mut generated = Vec::with_capacity(count as usize);
    let mut values = HashMap::new();

    for offset in 0..count {
        let id = start_id + offset;
        let key_pair = crate::crypto::generate_keypair();
        values.insert(format!("{id}"), key_pair.public.to_vec());
        generated.push(PreKey { id, key_pair });
    }

    store
        .transaction(vec![("pre-key".to_string(), values)])
        .await?;

    creds.next_pre_key_id = start_id + count;
    creds.first_unuploaded_pre_key_id = creds.next_pre_key_id;
    store.save_creds(creds).await?;

    Ok(generated)
}

/// Tops up the pool only if `uploaded_count` (as reported by the server)
/// has fallen below [`MIN_PREKEY_COUNT`].
pub async fn top_up_if_below_threshold(
    store: &impl CredentialStore,
    creds: &mut AuthenticationCreds,
    uploaded_count: u32,
) -> Result<Option<Vec<PreKey>>, StoreError> {
    if uploaded_count >= MIN_PREKEY_COUNT {
        return Ok(None);
    }
    let generated = top_up_pre_keys(store, creds, INITIAL_PREKEY_COUNT).await?;
    Ok(Some(generated))
}

/// Builds the `iq type=set` node that uploads a batch of pre-keys,
/// including a fresh copy of the signed pre-key and registration id.
pub fn build_upload_node(creds: &AuthenticationCreds, keys: &[PreKey]) -> BinaryNode {
    let key_nodes: Vec<BinaryNode> = keys
        .iter()
        .map(|key| {
            BinaryNode::new("key")
                .with_attr("id", key.id.to_string())
                .with_bytes(key.key_pair.public.to_vec())
        })
        .collect();

    let signed_key_node = BinaryNode::new("skey")
        .with_attr("id", creds.signed_pre_key.key_id.to_string())
        .with_bytes(creds.signed_pre_key.key_pair.public.to_vec());

    let registration_node =
        BinaryNode::new("registration").with_bytes(creds.registration_id.to_be_bytes().to_vec());

    BinaryNode::new("iq")
        .with_attr("type", "set")
        .with_attr("xmlns", "encrypt")
        .with_children(vec![
            BinaryNode::new("list").with_children(key_nodes),
            signed_key_node,
            registration_node,
        ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::creds::in_memory::InMemoryStore;

    #[tokio::test]
    async fn top_up_generates_requested_count_and_advances_counters() {
        let store = InMemoryStore::default();
        let mut creds = AuthenticationCreds::generate();
        let start = creds.next_pre_key_id;

        let generated = top_up_pre_keys(&store, &mut creds, INITIAL_PREKEY_COUNT).await.unwrap();

        assert_eq!(generated.len(), INITIAL_PREKEY_COUNT as usize);
        assert_eq!(creds.next_pre_key_id, start + INITIAL_PREKEY_COUNT);
        assert_eq!(creds.first_unuploaded_pre_key_id, creds.next_pre_key_id);
        assert!(creds.validate().is_ok());

        let first_key = format!("{start}");
        let stored = store.get("pre-key", &[first_key.clone()]).await.unwrap();
        assert_eq!(stored.get(&first_key).unwrap(), &generated[0].key_pair.public.to_vec());
    }

    #[tokio::test]
    async fn threshold_check_skips_top_up_above_minimum() {
        let store = InMemoryStore::default();
        let mut creds = AuthenticationCreds::generate();
        let start_next = creds.next_pre_key_id;

        let result = top_up_if_below_threshold(&store, &mut creds, MIN_PREKEY_COUNT).await.unwrap();
        assert!(result.is_none());
        assert_eq!(creds.next_pre_key_id, start_next);
    }

    #[tokio::test]
    async fn threshold_check_tops_up_below_minimum() {
        let store = InMemoryStore::default();
        let mut creds = AuthenticationCreds::generate();

        let result = top_up_if_below_threshold(&store, &mut creds, MIN_PREKEY_COUNT - 1).await.unwrap();
        assert_eq!(result.unwrap().len(), INITIAL_PREKEY_COUNT as usize);
    }

    #[test]
    fn upload_node_carries_one_key_child_per_generated_prekey() {
        let creds = AuthenticationCreds::generate();
        let keys = vec![
            PreKey { id: 1, key_pair: crate::crypto::generate_keypair() },
            PreKey { id: 2, key_pair: crate::crypto::generate_keypair() },
        ];
        let node = build_upload_node(&creds, &keys);
        let list = node.child("list").unwrap();
        match &list.content {
            Some(crate::binary_node::NodeContent::Nodes(children)) => assert_eq!(children.len(), 2),
            _ => panic!("expected key list"),
        }
    }
}
