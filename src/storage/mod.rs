//! Message Store: durable keyed storage for sessions, messages and parts.
//!
//! Keys are composite paths such as `["message", session_id, message_id]`.
//! Writes are idempotent upserts. `list` returns the child keys directly
//! under a prefix in ascending order.

pub mod file;
pub mod memory;

pub use file::FileStorage;
pub use memory::MemoryStorage;

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Result, SessionError};

#[async_trait]
pub trait Storage: Send + Sync {
    async fn write(&self, keys: &[&str], data: &Value) -> Result<()>;
    async fn read(&self, keys: &[&str]) -> Result<Option<Value>>;
    /// Child keys under `prefix`, ascending.
    async fn list(&self, prefix: &[&str]) -> Result<Vec<String>>;
    /// Remove a record. Removing a missing key is not an error.
    async fn remove(&self, keys: &[&str]) -> Result<()>;
}

pub type SharedStorage = Arc<dyn Storage>;

/// Typed helpers over the JSON storage surface.
#[async_trait]
pub trait StorageExt: Storage {
    async fn write_json<T: Serialize + Sync>(&self, keys: &[&str], record: &T) -> Result<()> {
        let value = serde_json::to_value(record)?;
        self.write(keys, &value).await
    }

    async fn read_json<T: DeserializeOwned + Send>(&self, keys: &[&str]) -> Result<Option<T>> {
        match self.read(keys).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }
}

impl<S: Storage + ?Sized> StorageExt for S {}

pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key == "." || key == ".." || key.contains('/') || key.contains('\\') {
        return Err(SessionError::InvalidArgument(format!(
            "invalid storage key {key}"
        )));
    }
    Ok(())
}
