use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{validate_key, Storage};
use crate::error::{Result, SessionError};

/// In-process store, ordered by composite key.
#[derive(Default)]
pub struct MemoryStorage {
    records: RwLock<BTreeMap<Vec<String>, Value>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

fn owned(keys: &[&str]) -> Result<Vec<String>> {
    if keys.is_empty() {
        return Err(SessionError::InvalidArgument("storage keys empty".into()));
    }
    keys.iter()
        .map(|key| validate_key(key).map(|_| key.to_string()))
        .collect()
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn write(&self, keys: &[&str], data: &Value) -> Result<()> {
        let key = owned(keys)?;
        self.records.write().await.insert(key, data.clone());
        Ok(())
    }

    async fn read(&self, keys: &[&str]) -> Result<Option<Value>> {
        let key = owned(keys)?;
        Ok(self.records.read().await.get(&key).cloned())
    }

    async fn list(&self, prefix: &[&str]) -> Result<Vec<String>> {
        let prefix = owned(prefix)?;
        let records = self.records.read().await;
        let mut children: Vec<String> = records
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter(|(key, _)| key.len() == prefix.len() + 1)
            .map(|(key, _)| key[prefix.len()].clone())
            .collect();
        children.dedup();
        Ok(children)
    }

    async fn remove(&self, keys: &[&str]) -> Result<()> {
        let key = owned(keys)?;
        self.records.write().await.remove(&key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn list_returns_direct_children_in_order() {
        let storage = MemoryStorage::new();
        storage.write(&["part", "m1", "p2"], &json!(2)).await.unwrap();
        storage.write(&["part", "m1", "p1"], &json!(1)).await.unwrap();
        storage.write(&["part", "m2", "p3"], &json!(3)).await.unwrap();
        storage.write(&["partial", "x"], &json!(0)).await.unwrap();

        let keys = storage.list(&["part", "m1"]).await.unwrap();
        assert_eq!(keys, vec!["p1", "p2"]);
    }

    #[tokio::test]
    async fn write_is_an_upsert() {
        let storage = MemoryStorage::new();
        storage.write(&["session", "s"], &json!({"v": 1})).await.unwrap();
        storage.write(&["session", "s"], &json!({"v": 2})).await.unwrap();
        assert_eq!(storage.len().await, 1);
        assert_eq!(
            storage.read(&["session", "s"]).await.unwrap(),
            Some(json!({"v": 2}))
        );
    }

    #[tokio::test]
    async fn remove_missing_is_noop() {
        let storage = MemoryStorage::new();
        storage.remove(&["session", "missing"]).await.unwrap();
        assert!(storage.is_empty().await);
    }
}
