use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::interval;
use tracing::{Level, info, span, warn};
use utilities::shutdown::Shutdown;
use wire::heartbeat::Heartbeat;

pub type ReplicationTrigger = Box<dyn Fn(u64) + Send + Sync>;

/// Last known state of one cluster server. Entries are never removed so a
/// server that comes back after an outage recovers its history.
#[derive(Debug, Clone)]
pub struct ServerHealth {
    pub server_id: u64,
    pub ip: String,
    pub last_heartbeat: Instant,
    pub cpu_usage: f64,
    pub storage_used: f64,
    pub missed_heartbeats: u32,
    pub is_healthy: bool,
}

impl ServerHealth {
    fn new(server_id: u64, ip: String) -> Self {
        Self {
            server_id,
            ip,
            last_heartbeat: Instant::now(),
            cpu_usage: 0.0,
            storage_used: 0.0,
            missed_heartbeats: 0,
            is_healthy: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub heartbeat_timeout: Duration,
    pub max_missed_heartbeats: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(60),
            max_missed_heartbeats: 3,
        }
    }
}

/// Missed heartbeat accounting per server, with the re-replication hook
/// fired on every healthy to unhealthy edge.
pub struct HealthTracker {
    servers: Mutex<HashMap<u64, ServerHealth>>,
    config: TrackerConfig,
    trigger: Mutex<Option<ReplicationTrigger>>,
}

impl HealthTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            servers: Mutex::new(HashMap::new()),
            config,
            trigger: Mutex::new(None),
        }
    }

    pub fn set_replication_trigger(&self, trigger: ReplicationTrigger) {
        *self.trigger.lock().unwrap() = Some(trigger);
    }

    /// Any valid heartbeat makes the server healthy again and clears its
    /// miss count.
    pub fn on_heartbeat(&self, hb: &Heartbeat) {
        let mut servers = self.servers.lock().unwrap();
        let health = servers
            .entry(hb.server_id)
            .or_insert_with(|| ServerHealth::new(hb.server_id, hb.ip.clone()));
        health.ip = hb.ip.clone();
        health.last_heartbeat = Instant::now();
        health.cpu_usage = hb.cpu_usage;
        health.storage_used = hb.storage_used;
        health.missed_heartbeats = 0;
        if !health.is_healthy {
            health.is_healthy = true;
            info!(server_id = hb.server_id, ip = %hb.ip, "server recovered and marked healthy");
        }
    }

    /// Ages every entry once. Servers crossing the miss limit while healthy
    /// flip to unhealthy and fire the trigger, after the map lock is gone.
    pub fn sweep(&self) {
        let mut newly_unhealthy = Vec::new();
        {
            let mut servers = self.servers.lock().unwrap();
            let now = Instant::now();
            for (server_id, health) in servers.iter_mut() {
                if now.duration_since(health.last_heartbeat) > self.config.heartbeat_timeout {
                    health.missed_heartbeats += 1;
                    if health.missed_heartbeats >= self.config.max_missed_heartbeats
                        && health.is_healthy
                    {
                        health.is_healthy = false;
                        warn!(
                            server_id,
                            missed = health.missed_heartbeats,
                            "server marked unhealthy, triggering re-replication"
                        );
                        newly_unhealthy.push(*server_id);
                    }
                }
            }
        }
        if newly_unhealthy.is_empty() {
            return;
        }
        let trigger = self.trigger.lock().unwrap();
        if let Some(trigger) = trigger.as_ref() {
            for server_id in newly_unhealthy {
                trigger(server_id);
            }
        } else {
            warn!("no re-replication trigger installed, failed servers will stay under-replicated");
        }
    }

    /// Periodic sweep loop, one tick every `sweep_interval`.
    pub fn start(self: &Arc<Self>, sweep_interval: Duration, shutdown: Shutdown) {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(sweep_interval);
            let mut stop = shutdown.subscribe();
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let span = span!(Level::INFO, "health_sweep");
                        let _entered = span.enter();
                        tracker.sweep();
                    }
                    _ = stop.changed() => break,
                }
            }
        });
    }

    pub fn get_server_status(&self) -> Vec<ServerHealth> {
        self.servers.lock().unwrap().values().cloned().collect()
    }

    pub fn get_healthy_servers(&self) -> Vec<u64> {
        self.servers
            .lock()
            .unwrap()
            .values()
            .filter(|h| h.is_healthy)
            .map(|h| h.server_id)
            .collect()
    }

    /// Healthy servers with the address each one last advertised.
    pub fn healthy_server_ips(&self) -> Vec<(u64, String)> {
        self.servers
            .lock()
            .unwrap()
            .values()
            .filter(|h| h.is_healthy)
            .map(|h| (h.server_id, h.ip.clone()))
            .collect()
    }

    pub fn server_ip(&self, server_id: u64) -> Option<String> {
        self.servers
            .lock()
            .unwrap()
            .get(&server_id)
            .map(|h| h.ip.clone())
    }

    pub fn is_server_healthy(&self, server_id: u64) -> bool {
        self.servers
            .lock()
            .unwrap()
            .get(&server_id)
            .map(|h| h.is_healthy)
            .unwrap_or(false)
    }
}

impl crate::receiver::HeartbeatSink for HealthTracker {
    fn on_heartbeat(&self, hb: Heartbeat) {
        HealthTracker::on_heartbeat(self, &hb);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wire::heartbeat::Timestamp;

    fn hb(server_id: u64) -> Heartbeat {
        Heartbeat {
            server_id,
            ip: format!("10.0.0.{server_id}"),
            timestamp: Some(Timestamp::now()),
            cpu_usage: 5.0,
            storage_used: 1.0,
            storage_total: 10.0,
            network_bandwidth: 0.0,
        }
    }

    fn impatient_tracker() -> (Arc<HealthTracker>, Arc<AtomicUsize>, Arc<Mutex<Vec<u64>>>) {
        let tracker = Arc::new(HealthTracker::new(TrackerConfig {
            heartbeat_timeout: Duration::from_nanos(1),
            max_missed_heartbeats: 3,
        }));
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (fired_in, seen_in) = (fired.clone(), seen.clone());
        tracker.set_replication_trigger(Box::new(move |id| {
            fired_in.fetch_add(1, Ordering::SeqCst);
            seen_in.lock().unwrap().push(id);
        }));
        (tracker, fired, seen)
    }

    #[test]
    fn first_heartbeat_creates_a_healthy_entry() {
        let (tracker, _, _) = impatient_tracker();
        tracker.on_heartbeat(&hb(42));
        let status = tracker.get_server_status();
        assert_eq!(status.len(), 1);
        assert!(status[0].is_healthy);
        assert_eq!(status[0].missed_heartbeats, 0);
        assert_eq!(status[0].ip, "10.0.0.42");
        assert!(tracker.is_server_healthy(42));
    }

    #[test]
    fn misses_accumulate_and_fire_the_trigger_once() {
        let (tracker, fired, seen) = impatient_tracker();
        tracker.on_heartbeat(&hb(42));
        std::thread::sleep(Duration::from_millis(2));

        tracker.sweep();
        tracker.sweep();
        assert!(tracker.is_server_healthy(42));
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tracker.sweep();
        let status = &tracker.get_server_status()[0];
        assert!(!status.is_healthy);
        assert_eq!(status.missed_heartbeats, 3);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(*seen.lock().unwrap(), vec![42]);

        // staying down keeps counting but never re-fires
        tracker.sweep();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.get_server_status()[0].missed_heartbeats, 4);
    }

    #[test]
    fn recovery_resets_misses_and_health() {
        let (tracker, fired, _) = impatient_tracker();
        tracker.on_heartbeat(&hb(42));
        std::thread::sleep(Duration::from_millis(2));
        for _ in 0..3 {
            tracker.sweep();
        }
        assert!(!tracker.is_server_healthy(42));

        tracker.on_heartbeat(&hb(42));
        let status = &tracker.get_server_status()[0];
        assert!(status.is_healthy);
        assert_eq!(status.missed_heartbeats, 0);
        assert_eq!(tracker.get_healthy_servers(), vec![42]);

        // a second failure episode fires the trigger again
        std::thread::sleep(Duration::from_millis(2));
        for _ in 0..3 {
            tracker.sweep();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn healthy_listing_excludes_down_servers() {
        let (tracker, _, _) = impatient_tracker();
        tracker.on_heartbeat(&hb(1));
        std::thread::sleep(Duration::from_millis(2));
        for _ in 0..3 {
            tracker.sweep();
        }
        tracker.on_heartbeat(&hb(2));
        let healthy = tracker.healthy_server_ips();
        assert_eq!(healthy, vec![(2, "10.0.0.2".to_owned())]);
        assert_eq!(tracker.server_ip(1), Some("10.0.0.1".to_owned()));
    }
}
