/// Resource sample carried by one heartbeat. Units are by convention:
/// cpu as a percentage, storage in bytes, bandwidth in bytes per second.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceUsage {
    pub cpu_usage: f64,
    pub storage_used: f64,
    pub storage_total: f64,
    pub network_bandwidth: f64,
}

/// Seam for the host sampling collaborator (the /proc scraper lives outside
/// this crate). The sender only needs a snapshot per tick.
pub trait ResourceSampler: Send + Sync {
    fn sample(&self) -> ResourceUsage;
}

/// Fixed values, good enough for nodes where sampling is not wired up and
/// for tests.
#[derive(Debug, Default)]
pub struct StaticSampler {
    usage: ResourceUsage,
}

impl StaticSampler {
    pub fn new(usage: ResourceUsage) -> Self {
        Self { usage }
    }
}

impl ResourceSampler for StaticSampler {
    fn sample(&self) -> ResourceUsage {
        self.usage
    }
}
