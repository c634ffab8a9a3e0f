use async_trait::async_trait;

use crate::error::ClientError;

/// Text generation collaborator: translations and assistant replies.
#[async_trait]
pub trait TextService: Send + Sync {
    async fn translate(&self, text: &str, language: &str) -> Result<String, ClientError>;

    /// The assistant's reply to `prompt`, or `None` if it has nothing to say.
    async fn reply(&self, prompt: &str) -> Result<Option<String>, ClientError>;
}
