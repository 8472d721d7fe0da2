//! Application configuration for the function emulator.

use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use worker_pool::PoolConfig;

/// Application configuration loaded from environment variables.
///
/// Environment variables are prefixed with `EMULATOR_`:
/// - `EMULATOR_HOST`: Server bind address (default: "127.0.0.1")
/// - `EMULATOR_PORT`: Server port (default: 9001)
/// - `EMULATOR_MIN_WORKERS` / `EMULATOR_MAX_WORKERS`: Pool sizing (default: 1 / 4)
/// - `EMULATOR_WORKER_COMMAND`: Program started per worker (default: "fn-worker")
/// - `EMULATOR_HANDLER_COMMAND`: Handler command passed to workers
/// - `EMULATOR_BUILD_DIR`: Build output to watch for redeploys (optional)
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Server name for identification
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// Workers kept alive when idle
    #[serde(default = "default_min_workers")]
    pub min_workers: usize,

    /// Upper bound on live workers
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,

    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    #[serde(default = "default_pull_timeout_ms")]
    pub pull_timeout_ms: u64,

    #[serde(default = "default_queue_timeout_ms")]
    pub queue_timeout_ms: u64,

    /// Zero disables the response deadline
    #[serde(default)]
    pub response_timeout_ms: u64,

    #[serde(default = "default_launch_attempts")]
    pub launch_attempts: u32,

    /// Program started for each worker
    #[serde(default = "default_worker_command")]
    pub worker_command: String,

    /// Whitespace-separated arguments for `worker_command`
    #[serde(default)]
    pub worker_args: Option<String>,

    /// Handler command the worker runtime executes per request
    #[serde(default)]
    pub handler_command: Option<String>,

    /// URL workers use to reach this server (derived from host/port if unset)
    #[serde(default)]
    pub runtime_api: Option<String>,

    /// Build output directory; a change redeploys every worker
    #[serde(default)]
    pub build_dir: Option<String>,

    /// Quiet period after the last file event before the tree is rescanned
    /// Quiet period after the last file event before the tree is rescanned
    #[serde(default = "default_watch_debounce_ms")]
    pub watch_debounce_ms: u64,

    /// Largest ingress body accepted
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    9001
}

fn default_server_name() -> String {
    "fn-emulator".to_string()
}

fn default_min_workers() -> usize {
    1
}

fn default_max_workers() -> usize {
    4
}

fn default_health_check_interval_ms() -> u64 {
    1_000
}

fn default_idle_timeout_ms() -> u64 {
    60_000
}

fn default_pull_timeout_ms() -> u64 {
    30_000
}

fn default_queue_timeout_ms() -> u64 {
    30_000
}

fn default_launch_attempts() -> u32 {
    3
}

fn default_worker_command() -> String {
    "fn-worker".to_string()
}

fn default_watch_debounce_ms() -> u64 {
    500
}

fn default_max_body_bytes() -> usize {
    6 * 1024 * 1024
}

impl AppConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables are prefixed with `EMULATOR_`.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("EMULATOR_").from_env::<AppConfig>()
    }

    /// Get the server bind address as a string suitable for `TcpListener::bind`.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Base URL handed to workers as `RUNTIME_API`.
    pub fn runtime_api_url(&self) -> String {
        if let Some(url) = &self.runtime_api {
            return url.trim_end_matches('/').to_string();
        }
        let host = match self.host.as_str() {
            "0.0.0.0" | "::" => "127.0.0.1",
            host => host,
        };
        format!("http://{}:{}", host, self.port)
    }

    pub fn worker_args(&self) -> Vec<String> {
        self.worker_args
            .as_deref()
            .map(|args| args.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }

    pub fn watch_debounce(&self) -> Duration {
        Duration::from_millis(self.watch_debounce_ms)
    }

    /// Pool settings derived from this configuration.
    pub fn pool_config(&self) -> PoolConfig {
        let mut worker_env = HashMap::new();
        if let Some(handler) = &self.handler_command {
            worker_env.insert("HANDLER_COMMAND".to_string(), handler.clone());
        }

        PoolConfig {
            launch_attempts: self.launch_attempts,
            worker_env,
            ..PoolConfig::from_millis(
                self.min_workers,
                self.max_workers,
                self.health_check_interval_ms,
                self.idle_timeout_ms,
                self.pull_timeout_ms,
                self.queue_timeout_ms,
                self.response_timeout_ms,
            )
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            server_name: default_server_name(),
            min_workers: default_min_workers(),
            max_workers: default_max_workers(),
            health_check_interval_ms: default_health_check_interval_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            pull_timeout_ms: default_pull_timeout_ms(),
            queue_timeout_ms: default_queue_timeout_ms(),
            response_timeout_ms: 0,
            launch_attempts: default_launch_attempts(),
            worker_command: default_worker_command(),
            worker_args: None,
            handler_command: None,
            runtime_api: None,
            build_dir: None,
            watch_debounce_ms: default_watch_debounce_ms(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}
