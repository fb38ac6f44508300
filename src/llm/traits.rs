use super::types::ChatTurn;
use std::future::Future;
use std::pin::Pin;

/// Text-generation capability.
///
/// The model behind it is a configuration detail; the pipeline only depends
/// on this request/response contract.
pub trait Generator: Send + Sync {
    /// Provider identifier (e.g. "openai-compatible").
    fn name(&self) -> &str;

    fn generate<'a>(
        &'a self,
        system_prompt: Option<&'a str>,
        turns: &'a [ChatTurn],
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + 'a>>;
}
