//! Store-and-forward queues and key-value persistence for the mesh.
//!
//! This crate provides the store-and-forward cache that parks packets for
//! unreachable peers until they reconnect, and the persistence collaborator
//! used for peer identities and channel memberships across restarts, with
//! in-memory and file-based backends.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod store_forward;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),
    /// Invalid operation
    #[error("Invalid operation: {0}")]
    Invalid(String),
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Key-value persistence collaborator
///
/// Last write wins; no transactions.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    /// Read a value
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Write a value, replacing any previous one
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;

    /// Remove a value; missing keys are not an error
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// All entries whose key starts with `prefix`, sorted by key
    async fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError>;
}

/// Read and decode a JSON value
pub async fn load_json<T: DeserializeOwned>(
    store: &dyn PersistenceStore,
    key: &str,
) -> Result<Option<T>, StorageError> {
    match store.get(key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Encode and write a JSON value
pub async fn save_json<T: Serialize + Sync>(
    store: &dyn PersistenceStore,
    key: &str,
    value: &T,
) -> Result<(), StorageError> {
    store.put(key, serde_json::to_vec(value)?).await
}

/// Persistence backend configuration
#[derive(Clone, Debug, Default)]
pub enum StorageMode {
    /// In-memory storage, lost on exit
    #[default]
    InMemory,
    /// JSON map file
    File {
        /// Path of the map file
        path: PathBuf,
    },
}

// Re-export backend implementations
pub use backend::file::FileStore;
pub use backend::mem::MemoryStore;
pub use store_forward::{CachedMessage, StoreForwardCache, StoreForwardConfig};

/// Open a persistence backend from configuration
pub async fn open_store(mode: StorageMode) -> Result<Arc<dyn PersistenceStore>, StorageError> {
    match mode {
        StorageMode::InMemory => Ok(Arc::new(MemoryStore::new())),
        StorageMode::File { path } => Ok(Arc::new(FileStore::open(path).await?)),
    }
}
