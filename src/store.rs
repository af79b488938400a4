//! State Store: the single JSON session document.
//!
//! All operations are whole-document load + mutate + rewrite, serialized
//! behind one mutex so concurrent handlers (a chat message racing a
//! prescription read, say) cannot interleave a read-modify-write.

use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::error::{Result, ServiceError};
use crate::models::SessionDocument;

const SESSION_FILE: &str = "results.json";

pub struct SessionStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl SessionStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: data_dir.as_ref().join(SESSION_FILE),
            lock: Mutex::new(()),
        }
    }

    /// Replace the document wholesale. Used by upload; discards any prior
    /// session including its chat history.
    pub async fn replace(&self, doc: &SessionDocument) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.write(doc).await
    }

    /// Read the current document. A missing file means no session exists
    /// yet, which is a not-found condition for the caller.
    pub async fn load(&self) -> Result<SessionDocument> {
        let _guard = self.lock.lock().await;
        self.read().await
    }

    /// Load, mutate in memory, write back, all under the store lock.
    pub async fn update<F, T>(&self, mutate: F) -> Result<T>
    where
        F: FnOnce(&mut SessionDocument) -> T + Send,
        T: Send,
    {
        let _guard = self.lock.lock().await;
        let mut doc = self.read().await?;
        let out = mutate(&mut doc);
        self.write(&doc).await?;
        Ok(out)
    }

    async fn read(&self) -> Result<SessionDocument> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ServiceError::NotFound("No session found. Upload a report first.".to_string())
            } else {
                ServiceError::Storage(e.to_string())
            }
        })?;
        serde_json::from_slice(&bytes).map_err(|e| ServiceError::Storage(e.to_string()))
    }

    async fn write(&self, doc: &SessionDocument) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ServiceError::Storage(e.to_string()))?;
        }
        let bytes =
            serde_json::to_vec_pretty(doc).map_err(|e| ServiceError::Storage(e.to_string()))?;
        tokio::fs::write(&self.path, bytes)
            .await
            .map_err(|e| ServiceError::Storage(e.to_string()))
    }
}
