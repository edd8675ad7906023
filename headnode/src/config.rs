use figment::{
    Figment,
    providers::{Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};
use utilities::result::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node_id: String,
    /// heartbeat listener
    pub bind_addr: String,
    /// 0 = one worker per hardware thread
    pub workers: usize,
    pub client_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
    pub max_missed_heartbeats: u32,
    pub replication_factor: usize,
    pub chunk_size: usize,
    pub cluster_servers: Vec<String>,
    /// "local" writes chunks under chunk_root, "tcp" talks to cluster servers
    pub transport: String,
    pub chunk_root: String,
    /// "memory" or "redis"
    pub metadata_backend: String,
    pub redis_url: String,
    /// 0 disables the TTL
    pub metadata_ttl_secs: u64,
    pub log_base: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: "head_0".to_owned(),
            bind_addr: "0.0.0.0:9000".to_owned(),
            workers: 0,
            client_timeout_secs: 60,
            sweep_interval_secs: 30,
            heartbeat_timeout_secs: 60,
            max_missed_heartbeats: 3,
            replication_factor: crate::placement::DEFAULT_REPLICATION_FACTOR,
            chunk_size: crate::placement::DEFAULT_CHUNK_SIZE,
            cluster_servers: vec![
                "127.0.0.1:8080".to_owned(),
                "127.0.0.1:8081".to_owned(),
                "127.0.0.1:8082".to_owned(),
            ],
            transport: "local".to_owned(),
            chunk_root: "./chunks".to_owned(),
            metadata_backend: "redis".to_owned(),
            redis_url: "redis://127.0.0.1:6379".to_owned(),
            metadata_ttl_secs: 3600,
            log_base: "logs".to_owned(),
        }
    }
}

pub fn load(path: Option<String>) -> Result<Config> {
    let path = path
        .or_else(|| std::env::var("CONFIG_PATH").ok())
        .unwrap_or_else(|| "./headnode/config/default.yaml".to_owned());
    let mut figment = Figment::from(Serialized::defaults(Config::default()));
    if std::path::Path::new(&path).exists() {
        figment = figment.merge(Yaml::file(&path));
    }
    figment
        .extract()
        .map_err(|e| format!("invalid head server configuration: {e}").into())
}
