//! Worker runtime configuration.

use anyhow::{Context, Result};
use std::time::Duration;
use worker_pool::CodeVersion;

/// Worker runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Identifier assigned by the emulator.
    pub worker_id: String,

    /// Code version the worker was started with.
    pub code_version: CodeVersion,

    /// Emulator runtime API base URL.
    pub runtime_api: String,

    /// Command run once per request.
    pub handler_command: String,

    /// Shell used to run `handler_command`.
    pub handler_shell: String,

    /// Per-request handler timeout.
    pub handler_timeout: Duration,

    /// HTTP timeout for one poll; must exceed the emulator's pull timeout.
    pub request_timeout: Duration,

    /// First delay after a transport error.
    pub retry_base_delay: Duration,

    /// Cap on the retry delay.
    pub retry_max_delay: Duration,
}

impl RuntimeConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let worker_id = std::env::var("WORKER_ID")
            .unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());

        let code_version = match std::env::var("CODE_VERSION") {
            Ok(value) => value
                .parse()
                .with_context(|| format!("Invalid CODE_VERSION: {value}"))?,
            Err(_) => CodeVersion::INITIAL,
        };

        let runtime_api = std::env::var("RUNTIME_API")
            .unwrap_or_else(|_| "http://127.0.0.1:9001".to_string());

        let handler_command =
            std::env::var("HANDLER_COMMAND").context("HANDLER_COMMAND is not set")?;

        let handler_shell = std::env::var("HANDLER_SHELL").unwrap_or_else(|_| "sh".to_string());

        let handler_timeout_secs: u64 = std::env::var("HANDLER_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);

        let request_timeout_secs: u64 = std::env::var("RUNTIME_REQUEST_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(90);

        Ok(Self {
            worker_id,
            code_version,
            runtime_api: runtime_api.trim_end_matches('/').to_string(),
            handler_command,
            handler_shell,
            handler_timeout: Duration::from_secs(handler_timeout_secs),
            request_timeout: Duration::from_secs(request_timeout_secs),
            ..Self::default()
        })
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_id: uuid::Uuid::new_v4().to_string(),
            code_version: CodeVersion::INITIAL,
            runtime_api: "http://127.0.0.1:9001".to_string(),
            handler_command: "cat".to_string(),
            handler_shell: "sh".to_string(),
            handler_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(90),
            retry_base_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(5),
        }
    }
}
