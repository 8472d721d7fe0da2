//! Poll loop.

use anyhow::Result;
use std::time::Duration;

use crate::client::{PollResult, RuntimeClient};
use crate::config::RuntimeConfig;
use crate::executor::HandlerExecutor;

/// Capped exponential backoff for transport errors.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current: base,
        }
    }

    /// Delay to wait now; doubles the next one up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

/// A worker: polls for work, runs the handler, pushes the result.
pub struct Runtime {
    client: RuntimeClient,
    executor: HandlerExecutor,
    backoff: Backoff,
}

impl Runtime {
    pub fn new(client: RuntimeClient, executor: HandlerExecutor, backoff: Backoff) -> Self {
        Self {
            client,
            executor,
            backoff,
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        let client = RuntimeClient::new(
            &config.runtime_api,
            config.worker_id.clone(),
            config.code_version,
            config.request_timeout,
        );
        let executor = HandlerExecutor::new(
            config.handler_command.clone(),
            config.handler_shell.clone(),
            config.handler_timeout,
        );
        let backoff = Backoff::new(config.retry_base_delay, config.retry_max_delay);
        Self::new(client, executor, backoff)
    }

    /// Run until the emulator tells this worker to stop. Returns the number
    /// of requests handled.
    pub async fn run(mut self) -> Result<u64> {
        let mut handled = 0;
        loop {
            match self.client.poll().await {
                Ok(PollResult::Work(invocation)) => {
                    self.backoff.reset();
                    tracing::debug!(method = %invocation.method, url = %invocation.url, "Received request");

                    let response = self.executor.execute(&invocation).await;
                    self.push_with_retry(&response).await;
                    handled += 1;
                }
                Ok(PollResult::NoWork) => {
                    self.backoff.reset();
                }
                Ok(PollResult::Superseded) => {
                    tracing::warn!("Poll superseded by a newer one from this worker");
                }
                Ok(PollResult::Stop) => {
                    tracing::info!(handled, "Emulator retired this worker; stopping");
                    return Ok(handled);
                }
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    tracing::warn!(
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Poll failed"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Push a result until the emulator accepts it. A push the emulator
    /// ignores still succeeds, so a stale result cannot loop forever.
    async fn push_with_retry(&mut self, response: &worker_pool::InvocationResponse) {
        loop {
            match self.client.push(response).await {
                Ok(()) => {
                    self.backoff.reset();
                    return;
                }
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    tracing::warn!(
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Failed to push result"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use worker_pool::CodeVersion;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_handles_work_then_stops() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/request/w-9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "method": "GET",
                "url": "/greet"
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/request/w-9"))
            .respond_with(ResponseTemplate::new(404))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/request/w-9"))
            .respond_with(ResponseTemplate::new(410))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/response/w-9"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let config = RuntimeConfig {
            worker_id: "w-9".to_string(),
            code_version: CodeVersion::INITIAL,
            runtime_api: server.uri(),
            handler_command: r#"printf 'hello from %s' "$HTTP_URL""#.to_string(),
            ..RuntimeConfig::default()
        };

        let handled = Runtime::from_config(&config).run().await.unwrap();
        assert_eq!(handled, 1);

        let pushes: Vec<_> = server
            .received_requests()
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.method.as_str() == "POST")
            .collect();
        let body: serde_json::Value = serde_json::from_slice(&pushes[0].body).unwrap();
        assert_eq!(body["status"], 200);
        assert_eq!(body["body"], "hello from /greet");
    }
}
