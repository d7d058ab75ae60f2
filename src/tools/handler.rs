use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

/// A tool's execution handler. Callers implement this for each tool.
/// An `Err` is reported back to the model as an error result, never
/// raised to the caller.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, input: &Value) -> Result<String, String>;
}

#[async_trait]
impl<T: ToolHandler + ?Sized> ToolHandler for Arc<T> {
    async fn call(&self, input: &Value) -> Result<String, String> {
        (**self).call(input).await
    }
}
