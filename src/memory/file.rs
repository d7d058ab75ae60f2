use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{Memory, MemoryError};
use crate::types::Message;

/// One conversation persisted as a JSON array on disk.
pub struct FileMemory {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process.
    lock: Mutex<()>,
}

impl FileMemory {
    /// Memory for `conversation_id` under `dir`, stored as `<id>.json`.
    pub fn new(dir: impl AsRef<Path>, conversation_id: &str) -> Self {
        Self {
            path: dir.as_ref().join(format!("{conversation_id}.json")),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Vec<Message>, MemoryError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(json) => serde_json::from_str(&json)
                .map_err(|e| MemoryError::Serialization(e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(MemoryError::Storage(e.to_string())),
        }
    }
}

#[async_trait]
impl Memory for FileMemory {
    async fn messages(&self) -> Result<Vec<Message>, MemoryError> {
        let _guard = self.lock.lock().await;
        self.load().await
    }

    async fn append(&self, message: Message) -> Result<(), MemoryError> {
        let _guard = self.lock.lock().await;
        let mut messages = self.load().await?;
        messages.push(message);

        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| MemoryError::Storage(e.to_string()))?;
        }
        let json = serde_json::to_string_pretty(&messages)
            .map_err(|e| MemoryError::Serialization(e.to_string()))?;
        tokio::fs::write(&self.path, json)
            .await
            .map_err(|e| MemoryError::Storage(e.to_string()))
    }
}
