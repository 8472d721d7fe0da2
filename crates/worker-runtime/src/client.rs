//! Runtime API HTTP client.

use anyhow::{bail, Result};
use reqwest::StatusCode;
use std::time::Duration;
use worker_pool::{CodeVersion, Invocation, InvocationResponse};

/// What a poll returned.
#[derive(Debug, Clone, PartialEq)]
pub enum PollResult {
    /// Run this invocation and push the result.
    Work(Invocation),
    /// The poll timed out; poll again.
    NoWork,
    /// A newer poll from this worker replaced this one.
    Superseded,
    /// The emulator told this worker to stop.
    Stop,
}

/// HTTP client for the emulator's runtime API.
#[derive(Clone)]
pub struct RuntimeClient {
    client: reqwest::Client,
    base_url: String,
    worker_id: String,
    code_version: CodeVersion,
}

impl RuntimeClient {
    /// Create a client for one worker.
    pub fn new(
        base_url: &str,
        worker_id: impl Into<String>,
        code_version: CodeVersion,
        request_timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            worker_id: worker_id.into(),
            code_version,
        }
    }

    /// Long-poll for the next invocation.
    pub async fn poll(&self) -> Result<PollResult> {
        let response = self
            .client
            .get(format!("{}/request/{}", self.base_url, self.worker_id))
            .query(&[("version", self.code_version.get())])
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(PollResult::Work(response.json().await?)),
            StatusCode::NOT_FOUND => Ok(PollResult::NoWork),
            StatusCode::CONFLICT => Ok(PollResult::Superseded),
            StatusCode::GONE => Ok(PollResult::Stop),
            status => {
                let body = response.text().await.unwrap_or_default();
                bail!("Unexpected poll status {}: {}", status, body)
            }
        }
    }

    /// Push the result of the invocation this worker is holding.
    pub async fn push(&self, result: &InvocationResponse) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/response/{}", self.base_url, self.worker_id))
            .json(result)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Failed to push result, status {}: {}", status, body);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> RuntimeClient {
        RuntimeClient::new(
            &server.uri(),
            "w-1",
            CodeVersion::new(3),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_poll_maps_status_codes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/request/w-1"))
            .and(query_param("version", "3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "method": "GET",
                "url": "/hello",
                "headers": {"accept": "text/plain"},
                "body": ""
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/request/w-1"))
            .respond_with(ResponseTemplate::new(404))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/request/w-1"))
            .respond_with(ResponseTemplate::new(410))
            .mount(&server)
            .await;

        let client = client(&server);
        match client.poll().await.unwrap() {
            PollResult::Work(invocation) => {
                assert_eq!(invocation.url, "/hello");
                assert_eq!(invocation.headers["accept"], "text/plain");
            }
            other => panic!("expected work, got {other:?}"),
        }
        assert_eq!(client.poll().await.unwrap(), PollResult::NoWork);
        assert_eq!(client.poll().await.unwrap(), PollResult::Stop);
    }

    #[tokio::test]
    async fn test_poll_unexpected_status_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let err = client(&server).poll().await.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_push_sends_result() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/response/w-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "ok"})))
            .expect(1)
            .mount(&server)
            .await;

        client(&server)
            .push(&InvocationResponse::text(200, "done"))
            .await
            .unwrap();

        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body["status"], 200);
        assert_eq!(body["body"], "done");
    }
}
