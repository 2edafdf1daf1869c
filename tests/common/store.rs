//! A minimal [`CredentialStore`] fixture for integration tests. The
//! crate's own `in_memory::InMemoryStore` is `cfg(test)`-gated to its unit
//! tests, so external test binaries need their own throwaway backend.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use wa_core::{AuthenticationCreds, CredentialStore};

#[derive(Default)]
pub struct TestCredentialStore {
    categories: Mutex<HashMap<String, HashMap<String, Vec<u8>>>>,
    creds: Mutex<Option<AuthenticationCreds>>,
}

#[async_trait]
impl CredentialStore for TestCredentialStore {
    async fn get(
        &self,
        category: &str,
        ids: &[String],
    ) -> Result<HashMap<String, Vec<u8>>, wa_core::creds::StoreError> {
        let categories = self.categories.lock().await;
        let Some(bucket) = categories.get(category) else {
            return Ok(HashMap::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| bucket.get(id).map(|v| (id.clone(), v.clone())))
            .collect())
    }

    async fn set(
        &self,
        category: &str,
        values: HashMap<String, Vec<u8>>,
    ) -> Result<(), wa_core::creds::StoreError> {
        let mut categories = self.categories.lock().await;
        categories.entry(category.to_string()).or_default().extend(values);
        Ok(())
    }

    async fn transaction(
        &self,
        ops: Vec<(String, HashMap<String, Vec<u8>>)>,
    ) -> Result<(), wa_core::creds::StoreError> {
        let mut categories = self.categories.lock().await;
        for (category, values) in ops {
            categories.entry(category).or_default().extend(values);
        }
        Ok(())
    }

    async fn load_creds(&self) -> Result<Option<AuthenticationCreds>, wa_core::creds::StoreError> {
        Ok(self.creds.lock().await.clone())
    }

    async fn save_creds(&self, creds: &AuthenticationCreds) -> Result<(), wa_core::creds::StoreError> {
        *self.creds.lock().await = Some(creds.clone());
        Ok(())
    }
}
