//! External result-blob storage adapter. The coordinator never interprets
//! what it stores here — it moves already-encrypted bytes in and out under
//! a uuid key, the same relationship `v6-runtime::ContainerRuntime` has to
//! Docker/Kubernetes.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("blob not found: {0}")]
    NotFound(String),
}

/// Uniform contract over a blob backend. One adapter ships here
/// (`InMemoryBlobStore`); a production deployment would swap in an S3 or
/// GCS-backed implementation behind the same trait.
#[async_trait]
pub trait BlobAdapter: Send + Sync {
    async fn put(&self, bytes: Vec<u8>) -> Uuid;
    async fn get(&self, id: Uuid) -> Result<Vec<u8>, BlobError>;
    async fn delete(&self, id: Uuid) -> Result<(), BlobError>;
}

#[derive(Default)]
pub struct InMemoryBlobStore {
    blobs: RwLock<HashMap<Uuid, Vec<u8>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobAdapter for InMemoryBlobStore {
    async fn put(&self, bytes: Vec<u8>) -> Uuid {
        let id = Uuid::new_v4();
        self.blobs.write().await.insert(id, bytes);
        id
    }

    async fn get(&self, id: Uuid) -> Result<Vec<u8>, BlobError> {
        self.blobs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| BlobError::NotFound(id.to_string()))
    }

    async fn delete(&self, id: Uuid) -> Result<(), BlobError> {
        self.blobs
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| BlobError::NotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let store = InMemoryBlobStore::new();
        let id = store.put(b"ciphertext".to_vec()).await;
        assert_eq!(store.get(id).await.unwrap(), b"ciphertext");
    }

    #[tokio::test]
    async fn get_after_delete_is_not_found() {
        let store = InMemoryBlobStore::new();
        let id = store.put(b"x".to_vec()).await;
        store.delete(id).await.unwrap();
        assert!(matches!(store.get(id).await, Err(BlobError::NotFound(_))));
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let store = InMemoryBlobStore::new();
        assert!(matches!(store.get(Uuid::new_v4()).await, Err(BlobError::NotFound(_))));
    }
}
