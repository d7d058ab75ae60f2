//! Conversation history the completion loop reads from and appends to.

pub mod buffer;
pub mod error;
pub mod file;

use std::sync::Arc;

use async_trait::async_trait;

use crate::types::Message;

pub use buffer::ConversationBuffer;
pub use error::MemoryError;
pub use file::FileMemory;

/// Ordered conversation store. Implementations must return messages in
/// the order they were appended.
#[async_trait]
pub trait Memory: Send + Sync {
    async fn messages(&self) -> Result<Vec<Message>, MemoryError>;

    async fn append(&self, message: Message) -> Result<(), MemoryError>;
}

#[async_trait]
impl<M: Memory + ?Sized> Memory for Arc<M> {
    async fn messages(&self) -> Result<Vec<Message>, MemoryError> {
        (**self).messages().await
    }

    async fn append(&self, message: Message) -> Result<(), MemoryError> {
        (**self).append(message).await
    }
}
