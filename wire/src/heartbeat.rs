use std::time::{SystemTime, UNIX_EPOCH};

/// Wall clock stamp carried inside every heartbeat.
#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct Timestamp {
    #[prost(int64, tag = "1")]
    pub seconds: i64,
    #[prost(int32, tag = "2")]
    pub nanos: i32,
}

impl Timestamp {
    pub fn now() -> Self {
        // pre-epoch clocks collapse to zero, the tracker only compares monotonic time anyway
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            seconds: since_epoch.as_secs() as i64,
            nanos: since_epoch.subsec_nanos() as i32,
        }
    }
}

/// Liveness report emitted by a cluster server once per interval.
///
/// Encoded as a tagged prost message so unknown fields from newer senders are
/// skipped on decode. Immutable once built.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Heartbeat {
    #[prost(uint64, tag = "1")]
    pub server_id: u64,
    #[prost(string, tag = "2")]
    pub ip: String,
    #[prost(message, optional, tag = "3")]
    pub timestamp: Option<Timestamp>,
    #[prost(double, tag = "4")]
    pub cpu_usage: f64,
    #[prost(double, tag = "5")]
    pub storage_used: f64,
    #[prost(double, tag = "6")]
    pub storage_total: f64,
    #[prost(double, tag = "7")]
    pub network_bandwidth: f64,
}

impl Heartbeat {
    pub fn validate(&self) -> Result<(), String> {
        if self.timestamp.is_none() {
            return Err("timestamp field is required".to_owned());
        }
        if !(0.0..=100.0).contains(&self.cpu_usage) {
            return Err(format!("cpu_usage {} outside 0..100", self.cpu_usage));
        }
        if self.storage_used < 0.0 || self.storage_total < 0.0 || self.network_bandwidth < 0.0 {
            return Err("resource fields must be non-negative".to_owned());
        }
        if self.storage_used > self.storage_total {
            return Err(format!(
                "storage_used {} exceeds storage_total {}",
                self.storage_used, self.storage_total
            ));
        }
        Ok(())
    }
}
