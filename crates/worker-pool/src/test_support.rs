//! Shared helpers for pool tests.

use std::sync::Arc;
use std::time::Duration;

use crate::config::PoolConfig;
use crate::launcher::ManualLauncher;
use crate::pool::WorkerPool;

/// Config with long timeouts so only the ones a test overrides fire.
pub fn test_config(min_size: usize, max_size: usize) -> PoolConfig {
    PoolConfig {
        min_size,
        max_size,
        health_check_interval: Duration::from_secs(1),
        idle_timeout: Duration::from_secs(600),
        pull_timeout: Duration::from_secs(30),
        queue_timeout: Duration::from_secs(30),
        response_timeout: None,
        ..PoolConfig::default()
    }
}

/// Build a started pool backed by a [`ManualLauncher`].
pub async fn pool_with(config: PoolConfig) -> (WorkerPool, Arc<ManualLauncher>) {
    let launcher = Arc::new(ManualLauncher::new());
    let pool = WorkerPool::new(config, launcher.clone()).expect("valid test config");
    pool.start().await.expect("pool starts");
    (pool, launcher)
}

/// Let spawned tasks run until they park. Needs paused time.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
