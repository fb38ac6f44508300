pub mod openai;
pub mod reliable;
pub mod traits;
pub mod types;

pub use openai::OpenAiCompatibleGenerator;
pub use reliable::ReliableGenerator;
pub use traits::Generator;
pub use types::{ChatRole, ChatTurn};

use std::time::Duration;

const MAX_API_ERROR_CHARS: usize = 200;

/// Shared reqwest client settings for generation endpoints.
pub fn build_provider_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(timeout)
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Truncate a provider error body to a loggable size, on a char boundary.
pub fn sanitize_api_error(input: &str) -> String {
    if input.chars().count() <= MAX_API_ERROR_CHARS {
        return input.to_string();
    }

    let mut end = MAX_API_ERROR_CHARS;
    while end > 0 && !input.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &input[..end])
}

/// Build a sanitized provider error from a failed HTTP response.
pub async fn api_error(provider: &str, response: reqwest::Response) -> anyhow::Error {
    let status = response.status();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<failed to read provider error body>".to_string());
    let sanitized = sanitize_api_error(&body);
    anyhow::anyhow!("{provider} API error ({status}): {sanitized}")
}
