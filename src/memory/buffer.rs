use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{Memory, MemoryError};
use crate::types::Message;

/// In-process history, optionally capped to the most recent turns.
#[derive(Debug, Default)]
pub struct ConversationBuffer {
    messages: RwLock<Vec<Message>>,
    max_messages: Option<usize>,
}

impl ConversationBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `max` messages, dropping the oldest first.
    pub fn with_limit(max: usize) -> Self {
        Self {
            messages: RwLock::new(Vec::new()),
            max_messages: Some(max),
        }
    }

    pub async fn len(&self) -> usize {
        self.messages.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.messages.read().await.is_empty()
    }

    pub async fn clear(&self) {
        self.messages.write().await.clear();
    }
}

#[async_trait]
impl Memory for ConversationBuffer {
    async fn messages(&self) -> Result<Vec<Message>, MemoryError> {
        Ok(self.messages.read().await.clone())
    }

    async fn append(&self, message: Message) -> Result<(), MemoryError> {
        let mut messages = self.messages.write().await;
        messages.push(message);
        if let Some(max) = self.max_messages {
            let excess = messages.len().saturating_sub(max);
            messages.drain(..excess);
        }
        Ok(())
    }
}
