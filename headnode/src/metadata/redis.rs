use super::MetadataStore;
use ::redis::{AsyncCommands, aio::MultiplexedConnection};
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::info;
use utilities::result::Result;

/// Metadata client backed by a Redis-compatible store. The connection is
/// multiplexed, clones are cheap and every operation grabs its own handle.
pub struct RedisMetadataStore {
    conn: MultiplexedConnection,
}

impl RedisMetadataStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = ::redis::Client::open(url)
            .map_err(|e| format!("invalid metadata store url {url}: {e}"))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| format!("failed to connect to metadata store at {url}: {e}"))?;
        info!(%url, "connected to metadata store");
        Ok(Self { conn })
    }

    /// Points this instance at a primary. Cluster topology stays with the
    /// operator, we only relay the command.
    pub async fn replicate_from(&self, primary: &str) -> Result<()> {
        let (host, port) = primary.split_once(':').unwrap_or((primary, "6379"));
        let mut conn = self.conn.clone();
        let _: () = ::redis::cmd("REPLICAOF")
            .arg(host)
            .arg(port)
            .query_async(&mut conn)
            .await
            .map_err(|e| format!("REPLICAOF {primary} failed: {e}"))?;
        info!(%primary, "metadata store now replicating");
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for RedisMetadataStore {
    async fn hset_bulk(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.hset_multiple(key, fields).await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.hget(key, field).await?)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        Ok(conn.hgetall(key).await?)
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.hdel(key, field).await?;
        Ok(removed > 0)
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: bool = conn.expire(key, seconds as i64).await?;
        Ok(())
    }
}
