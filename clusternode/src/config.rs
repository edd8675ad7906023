use figment::{
    Figment,
    providers::{Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};
use utilities::result::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server_id: u64,
    pub ip: String,
    /// port the chunk service listens on
    pub port: u16,
    /// where the health checker / head server receives heartbeats
    pub head_addr: String,
    pub heartbeat_interval_ms: u64,
    pub connect_retries: u8,
    pub chunk_root: String,
    pub log_base: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_id: 1,
            ip: "127.0.0.1".to_owned(),
            port: 8080,
            head_addr: "127.0.0.1:9000".to_owned(),
            heartbeat_interval_ms: 1_000,
            connect_retries: 5,
            chunk_root: "./chunks".to_owned(),
            log_base: "logs".to_owned(),
        }
    }
}

pub fn load(path: Option<String>) -> Result<Config> {
    let path = path
        .or_else(|| std::env::var("CONFIG_PATH").ok())
        .unwrap_or_else(|| "./clusternode/config/default.yaml".to_owned());
    let mut figment = Figment::from(Serialized::defaults(Config::default()));
    if std::path::Path::new(&path).exists() {
        figment = figment.merge(Yaml::file(&path));
    }
    figment
        .extract()
        .map_err(|e| format!("invalid cluster server configuration: {e}").into())
}
