use super::traits::Generator;
use super::types::ChatTurn;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Check if an error is non-retryable (client errors that won't resolve with retries).
fn is_non_retryable(err: &anyhow::Error) -> bool {
    let msg = err.to_string();
    if is_quota_exhausted(&msg) {
        return true;
    }

    // Check for reqwest status errors (returned by .error_for_status())
    if let Some(reqwest_err) = err.downcast_ref::<reqwest::Error>()
        && let Some(status) = reqwest_err.status()
    {
        let code = status.as_u16();
        // 4xx client errors are non-retryable, except:
        // - 429 Too Many Requests (rate limiting, transient)
        // - 408 Request Timeout (transient)
        return status.is_client_error() && code != 429 && code != 408;
    }
    // String fallback: scan for any 4xx status code in error message
    for word in msg.split(|c: char| !c.is_ascii_digit()) {
        if let Ok(code) = word.parse::<u16>()
            && (400..500).contains(&code)
        {
            return code != 429 && code != 408;
        }
    }
    false
}

fn is_quota_exhausted(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("insufficient_quota")
        || lower.contains("exceeded your current quota")
        || lower.contains("billing")
}

/// Generator wrapper enforcing a per-request timeout and a bounded retry
/// budget on transient failures. A timeout counts as transient; invalid-input
/// rejections fail immediately.
pub struct ReliableGenerator {
    inner: Box<dyn Generator>,
    max_retries: u32,
    base_backoff_ms: u64,
    request_timeout: Duration,
}

impl ReliableGenerator {
    pub fn new(
        inner: Box<dyn Generator>,
        max_retries: u32,
        base_backoff_ms: u64,
        request_timeout: Duration,
    ) -> Self {
        Self {
            inner,
            max_retries,
            base_backoff_ms: base_backoff_ms.max(50),
            request_timeout,
        }
    }
}

impl Generator for ReliableGenerator {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn generate<'a>(
        &'a self,
        system_prompt: Option<&'a str>,
        turns: &'a [ChatTurn],
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + 'a>> {
        Box::pin(async move {
            let mut failures = Vec::new();
            let mut backoff_ms = self.base_backoff_ms;

            for attempt in 0..=self.max_retries {
                let outcome =
                    tokio::time::timeout(self.request_timeout, self.inner.generate(system_prompt, turns))
                        .await;

                let error = match outcome {
                    Ok(Ok(answer)) => {
                        if attempt > 0 {
                            tracing::info!(
                                provider = self.inner.name(),
                                attempt,
                                "generation recovered after retries"
                            );
                        }
                        return Ok(answer);
                    }
                    Ok(Err(e)) => e,
                    Err(_) => anyhow::anyhow!(
                        "generation timed out after {}s",
                        self.request_timeout.as_secs()
                    ),
                };

                let non_retryable = is_non_retryable(&error);
                failures.push(format!(
                    "attempt {}/{}: {error}",
                    attempt + 1,
                    self.max_retries + 1
                ));

                if non_retryable {
                    tracing::warn!(
                        provider = self.inner.name(),
                        "non-retryable generation error, giving up"
                    );
                    break;
                }

                if attempt < self.max_retries {
                    tracing::warn!(
                        provider = self.inner.name(),
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        "generation failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = (backoff_ms.saturating_mul(2)).min(10_000);
                }
            }

            anyhow::bail!(
                "generation failed on {}. Attempts:\n{}",
                self.inner.name(),
                failures.join("\n")
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockGenerator {
        calls: Arc<AtomicUsize>,
        fail_until_attempt: usize,
        response: &'static str,
        error: &'static str,
    }

    impl Generator for MockGenerator {
        fn name(&self) -> &str {
            "mock"
        }

        fn generate<'a>(
            &'a self,
            _system_prompt: Option<&'a str>,
            _turns: &'a [ChatTurn],
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + 'a>> {
            Box::pin(async move {
                let attempt = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt <= self.fail_until_attempt {
                    anyhow::bail!(self.error);
                }
                Ok(self.response.to_string())
            })
        }
    }

    /// First `hang_until_attempt` calls never resolve; later calls answer.
    struct HangingGenerator {
        calls: Arc<AtomicUsize>,
        hang_until_attempt: usize,
    }

    impl Generator for HangingGenerator {
        fn name(&self) -> &str {
            "hanging"
        }

        fn generate<'a>(
            &'a self,
            _system_prompt: Option<&'a str>,
            _turns: &'a [ChatTurn],
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + 'a>> {
            Box::pin(async move {
                let attempt = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt <= self.hang_until_attempt {
                    std::future::pending::<()>().await;
                }
                Ok("late answer".to_string())
            })
        }
    }

    fn turns() -> Vec<ChatTurn> {
        vec![ChatTurn::user("hello")]
    }

    #[tokio::test]
    async fn succeeds_without_retry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let generator = ReliableGenerator::new(
            Box::new(MockGenerator {
                calls: Arc::clone(&calls),
                fail_until_attempt: 0,
                response: "ok",
                error: "boom",
            }),
            2,
            1,
            Duration::from_secs(5),
        );

        let answer = generator.generate(None, &turns()).await.unwrap();
        assert_eq!(answer, "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_then_recovers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let generator = ReliableGenerator::new(
            Box::new(MockGenerator {
                calls: Arc::clone(&calls),
                fail_until_attempt: 1,
                response: "recovered",
                error: "temporary",
            }),
            2,
            1,
            Duration::from_secs(5),
        );

        let answer = generator.generate(None, &turns()).await.unwrap();
        assert_eq!(answer, "recovered");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn two_timeouts_then_success_within_budget() {
        let calls = Arc::new(AtomicUsize::new(0));
        let generator = ReliableGenerator::new(
            Box::new(HangingGenerator {
                calls: Arc::clone(&calls),
                hang_until_attempt: 2,
            }),
            2,
            50,
            Duration::from_millis(100),
        );

        let answer = generator.generate(None, &turns()).await.unwrap();
        assert_eq!(answer, "late answer");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_exhaustion_reports_every_attempt() {
        let calls = Arc::new(AtomicUsize::new(0));
        let generator = ReliableGenerator::new(
            Box::new(HangingGenerator {
                calls: Arc::clone(&calls),
                hang_until_attempt: usize::MAX,
            }),
            2,
            50,
            Duration::from_millis(100),
        );

        let err = generator
            .generate(None, &turns())
            .await
            .expect_err("budget exhausted");
        let msg = err.to_string();
        assert!(msg.contains("attempt 1/3"));
        assert!(msg.contains("attempt 3/3"));
        assert!(msg.contains("timed out"));
        // Budget of 2 retries means exactly 3 calls, never more.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn skips_retries_on_non_retryable_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let generator = ReliableGenerator::new(
            Box::new(MockGenerator {
                calls: Arc::clone(&calls),
                fail_until_attempt: usize::MAX,
                response: "never",
                error: "400 Bad Request",
            }),
            3,
            1,
            Duration::from_secs(5),
        );

        let err = generator.generate(None, &turns()).await.unwrap_err();
        assert!(err.to_string().contains("400 Bad Request"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn non_retryable_detects_common_patterns() {
        // Non-retryable 4xx errors
        assert!(is_non_retryable(&anyhow::anyhow!("400 Bad Request")));
        assert!(is_non_retryable(&anyhow::anyhow!("401 Unauthorized")));
        assert!(is_non_retryable(&anyhow::anyhow!("404 Not Found")));
        // Retryable: 429 Too Many Requests
        assert!(!is_non_retryable(&anyhow::anyhow!("429 Too Many Requests")));
        // Retryable: 408 Request Timeout
        assert!(!is_non_retryable(&anyhow::anyhow!("408 Request Timeout")));
        // Retryable: 5xx server errors
        assert!(!is_non_retryable(&anyhow::anyhow!(
            "500 Internal Server Error"
        )));
        // Retryable: transient errors
        assert!(!is_non_retryable(&anyhow::anyhow!("timeout")));
        assert!(!is_non_retryable(&anyhow::anyhow!("connection reset")));

        assert!(is_non_retryable(&anyhow::anyhow!(
            "{}",
            "API error (429 Too Many Requests): {\"error\":{\"message\":\"You exceeded your current quota\",\"type\":\"insufficient_quota\"}}"
        )));
    }
}
