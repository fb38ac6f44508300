//! OpenAI-compatible chat-completions provider.

use super::traits::Generator;
use super::types::ChatTurn;
use super::{api_error, build_provider_client};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    temperature: f64,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}

pub struct OpenAiCompatibleGenerator {
    client: reqwest::Client,
    chat_url: String,
    auth_header: Option<String>,
    model: String,
    temperature: f64,
}

impl OpenAiCompatibleGenerator {
    pub fn new(
        base_url: &str,
        api_key: Option<&str>,
        model: &str,
        temperature: f64,
        timeout: Duration,
    ) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            client: build_provider_client(timeout),
            chat_url: format!("{base}/v1/chat/completions"),
            auth_header: api_key.map(|key| format!("Bearer {key}")),
            model: model.to_string(),
            temperature,
        }
    }

    fn build_request(&self, system_prompt: Option<&str>, turns: &[ChatTurn]) -> ChatRequest {
        let capacity = turns.len() + usize::from(system_prompt.is_some());
        let mut messages = Vec::with_capacity(capacity);

        if let Some(sys) = system_prompt {
            messages.push(WireMessage {
                role: "system",
                content: sys.to_string(),
            });
        }
        for turn in turns {
            messages.push(WireMessage {
                role: turn.role.wire_name(),
                content: turn.text.clone(),
            });
        }

        ChatRequest {
            model: self.model.clone(),
            messages,
            temperature: self.temperature,
        }
    }
}

impl Generator for OpenAiCompatibleGenerator {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    fn generate<'a>(
        &'a self,
        system_prompt: Option<&'a str>,
        turns: &'a [ChatTurn],
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + 'a>> {
        Box::pin(async move {
            let request = self.build_request(system_prompt, turns);

            let mut builder = self.client.post(&self.chat_url).json(&request);
            if let Some(auth) = &self.auth_header {
                builder = builder.header("Authorization", auth);
            }

            let response = builder.send().await?;
            if !response.status().is_success() {
                return Err(api_error(self.name(), response).await);
            }

            let parsed: ChatResponse = response.json().await?;
            parsed
                .choices
                .into_iter()
                .next()
                .map(|choice| choice.message.content)
                .ok_or_else(|| anyhow::anyhow!("no choices in {} response", self.name()))
        })
    }
}
