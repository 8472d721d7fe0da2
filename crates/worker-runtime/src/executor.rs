//! Handler execution.
//!
//! Each invocation runs the handler command once. The invocation JSON is
//! written to the command's stdin. Stdout that is a JSON object with a
//! `status` field is taken as the full response; any other stdout becomes a
//! `200` body. A non-zero exit yields `500` with stderr, a timeout `504`.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time::timeout;
use worker_pool::{Invocation, InvocationResponse};

/// Runs the handler command for one invocation at a time.
#[derive(Debug, Clone)]
pub struct HandlerExecutor {
    command: String,
    shell: String,
    timeout: Duration,
    env: HashMap<String, String>,
}

impl HandlerExecutor {
    pub fn new(command: impl Into<String>, shell: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            shell: shell.into(),
            timeout,
            env: HashMap::new(),
        }
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Run the handler. Failures become error responses, never `Err`.
    pub async fn execute(&self, invocation: &Invocation) -> InvocationResponse {
        let start = std::time::Instant::now();

        let input = match serde_json::to_vec(invocation) {
            Ok(input) => input,
            Err(e) => return InvocationResponse::text(500, format!("Failed to encode request: {e}")),
        };

        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(&self.command)
            .envs(&self.env)
            .env("HTTP_METHOD", &invocation.method)
            .env("HTTP_URL", &invocation.url)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(command = %self.command, error = %e, "Failed to spawn handler");
                return InvocationResponse::text(500, format!("Failed to spawn handler: {e}"));
            }
        };

        // Handlers that ignore stdin must not block on a full pipe
        let stdin = child.stdin.take();
        let stdin_handle = tokio::spawn(async move {
            if let Some(mut stdin) = stdin {
                let _ = stdin.write_all(&input).await;
            }
        });

        let stdout = child.stdout.take();
        let stdout_handle = tokio::spawn(async move {
            let mut output = Vec::new();
            if let Some(mut stdout) = stdout {
                let _ = stdout.read_to_end(&mut output).await;
            }
            output
        });

        let stderr = child.stderr.take();
        let stderr_handle = tokio::spawn(async move {
            let mut output = Vec::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_end(&mut output).await;
            }
            output
        });

        let status = match timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                return InvocationResponse::text(500, format!("Failed to wait for handler: {e}"));
            }
            Err(_) => {
                let _ = child.kill().await;
                stdin_handle.abort();
                tracing::warn!(
                    url = %invocation.url,
                    timeout_secs = self.timeout.as_secs(),
                    "Handler timed out"
                );
                return InvocationResponse::text(504, "Handler timed out");
            }
        };

        let _ = stdin_handle.await;
        let stdout = stdout_handle.await.unwrap_or_default();
        let stderr = stderr_handle.await.unwrap_or_default();
        let duration_ms = start.elapsed().as_millis() as u64;

        if !status.success() {
            let exit_code = status.code().unwrap_or(-1);
            tracing::warn!(url = %invocation.url, exit_code, duration_ms, "Handler failed");
            return InvocationResponse::text(500, String::from_utf8_lossy(&stderr).into_owned());
        }

        let response = parse_output(&stdout);
        tracing::debug!(
            url = %invocation.url,
            status = response.status,
            duration_ms,
            "Handler finished"
        );
        response
    }
}

/// Interpret a successful handler's stdout.
pub fn parse_output(stdout: &[u8]) -> InvocationResponse {
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(stdout) {
        if value.get("status").is_some_and(|s| s.is_u64()) {
            if let Ok(response) = serde_json::from_value::<InvocationResponse>(value) {
                return response;
            }
        } else {
            return InvocationResponse::new(200)
                .with_header("content-type", "application/json")
                .with_body_bytes(stdout);
        }
    }

    match std::str::from_utf8(stdout) {
        Ok(_) => InvocationResponse::new(200)
            .with_header("content-type", "text/plain; charset=utf-8")
            .with_body_bytes(stdout),
        Err(_) => InvocationResponse::new(200)
            .with_header("content-type", "application/octet-stream")
            .with_body_bytes(stdout),
    }
}
