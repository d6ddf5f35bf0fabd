pub mod openai;
pub mod prepare;

use async_trait::async_trait;

use crate::error::Result;

pub use openai::OpenAiClient;

/// A hosted vision-language model that answers a prompt about one image.
///
/// Implementations classify failures: `AppError::VisionTransient` for
/// rate limits, timeouts and server errors, `AppError::VisionFatal` for
/// anything a retry cannot fix.
#[async_trait]
pub trait VisionClient: Send + Sync {
    /// Send one image with a prompt and return the raw model text.
    async fn complete(&self, image: &[u8], prompt: &str) -> Result<String>;

    fn name(&self) -> &str;
}
