// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Testcontainers setup for Redis.
//!
//! Provides helpers to spin up Redis containers for integration tests.

use history_replicator::resilience::RetryConfig;
use history_replicator::RedisTaskSource;
use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

/// Create a vanilla Redis container (streams-compatible).
///
/// Uses official redis:7 image. Waits for "Ready to accept connections".
pub fn redis_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379)
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));
    docker.run(image)
}

/// Get the Redis URL for a container.
pub fn redis_url(container: &Container<'_, GenericImage>) -> String {
    let port = container.get_host_port_ipv4(6379);
    format!("redis://127.0.0.1:{}", port)
}

/// A remote cluster's replication transport running in a Redis container.
pub struct TestCluster<'a> {
    #[allow(dead_code)] // Kept alive for container lifetime
    container: Container<'a, GenericImage>,
    pub name: String,
    pub redis_url: String,
}

impl<'a> TestCluster<'a> {
    pub fn new(docker: &'a Cli, name: &str) -> Self {
        let container = redis_container(docker);
        let redis_url = redis_url(&container);
        Self {
            container,
            name: name.to_string(),
            redis_url,
        }
    }

    /// Connect a task source to this cluster's Redis.
    pub async fn source(&self, key_prefix: &str) -> RedisTaskSource {
        RedisTaskSource::connect(&self.redis_url, key_prefix, &RetryConfig::testing())
            .await
            .expect("Failed to connect to Redis")
    }

    /// Write a raw stream entry, bypassing the codec.
    pub async fn add_raw_entry(
        &self,
        stream_key: &str,
        task_id: i64,
        payload: &[u8],
        hash: Option<&str>,
    ) -> redis::RedisResult<String> {
        let client = redis::Client::open(self.redis_url.as_str())?;
        let mut conn = client.get_multiplexed_async_connection().await?;

        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream_key)
            .arg(format!("{}-0", task_id))
            .arg("task_id")
            .arg(task_id)
            .arg("payload")
            .arg(payload);
        if let Some(h) = hash {
            cmd.arg("hash").arg(h);
        }
        cmd.query_async(&mut conn).await
    }

    /// Get stream length.
    pub async fn stream_len(&self, stream_key: &str) -> redis::RedisResult<usize> {
        let client = redis::Client::open(self.redis_url.as_str())?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        use redis::AsyncCommands;
        conn.xlen(stream_key).await
    }
}
