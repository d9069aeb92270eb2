//! Common test infrastructure for queue integration tests.

#![allow(dead_code)]

use drover_config::RedisConfig;
use drover_queue::{create_pool, QueueManager, QueueStats, RedisJobStore};
use std::time::Duration;
use testcontainers::{runners::AsyncRunner, ContainerAsync};
use testcontainers_modules::redis::Redis;
use uuid::Uuid;

/// Test Redis container wrapper.
///
/// Manages a Redis testcontainer lifecycle and hands out stores with a
/// unique key prefix so tests sharing a server do not see each other.
pub struct TestRedis {
    _container: ContainerAsync<Redis>,
    config: RedisConfig,
}

impl TestRedis {
    /// Starts a fresh Redis container.
    pub async fn new() -> Self {
        let container = Redis::default()
            .start()
            .await
            .expect("Failed to start Redis container");

        let port = container
            .get_host_port_ipv4(6379)
            .await
            .expect("Failed to get Redis port");

        let config = RedisConfig {
            url: format!("redis://127.0.0.1:{}", port),
            pool_size: 8,
            connect_timeout_secs: 5,
        };

        Self {
            _container: container,
            config,
        }
    }

    /// Creates a store over a new pool.
    pub async fn store(&self) -> RedisJobStore {
        let pool = Self::connect_with_retry(&self.config, 30).await;
        RedisJobStore::new(pool, format!("test-{}", Uuid::new_v4()))
    }

    async fn connect_with_retry(config: &RedisConfig, max_attempts: u32) -> deadpool_redis::Pool {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match create_pool(config).await {
                Ok(pool) => return pool,
                Err(e) => {
                    if attempts >= max_attempts {
                        panic!("Failed to connect to Redis after {} attempts: {}", max_attempts, e);
                    }
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }
    }
}

/// Polls a queue's stats until `done` holds or `timeout` elapses, and returns
/// the last snapshot.
pub async fn wait_for_stats<F>(
    manager: &QueueManager,
    queue: &str,
    timeout: Duration,
    done: F,
) -> QueueStats
where
    F: Fn(&QueueStats) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let stats = manager.stats(queue).await.expect("Failed to read stats");
        if done(&stats) || tokio::time::Instant::now() >= deadline {
            return stats;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
