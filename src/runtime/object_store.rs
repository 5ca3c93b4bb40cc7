//! runtime/object_store.rs — blob storage for profiling dumps and
//! exception tracebacks (spec §4.11). Keyed by plain string paths the way
//! the source system keyed S3 objects: `<bucket>/<program_hash>/<block>`
//! for a profiling record, `<bucket>/<program_hash>/EXCEPTION.<block>` for
//! a failure.

use crate::runtime::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(&self, key: &str, bytes: Vec<u8>) -> Result<()>;
    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        InMemoryObjectStore {
            objects: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put_object(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        self.objects.lock().await.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.objects.lock().await.get(key).cloned())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let guard = self.objects.lock().await;
        Ok(guard
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let store = InMemoryObjectStore::new();
        store.put_object("b/h/0", vec![1, 2, 3]).await.unwrap();
        assert_eq!(
            store.get_object("b/h/0").await.unwrap(),
            Some(vec![1, 2, 3])
        );
        assert_eq!(store.get_object("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn list_prefix_finds_program_blocks() {
        let store = InMemoryObjectStore::new();
        store.put_object("b/h/0", vec![0]).await.unwrap();
        store.put_object("b/h/1", vec![1]).await.unwrap();
        store.put_object("b/other/0", vec![2]).await.unwrap();
        let mut keys = store.list_prefix("b/h/").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["b/h/0".to_string(), "b/h/1".to_string()]);
    }
}
