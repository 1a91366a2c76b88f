use std::time::Duration;

/// Configuration for the background health monitor.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Interval between probe sweeps over the registry.
    pub probe_interval: Duration,
    /// Upper bound on a single liveness probe.
    pub probe_timeout: Duration,
    /// Consecutive probe failures before a node is marked offline.
    pub offline_threshold: u32,
    /// Smoothing factor for load/queue/duration moving averages.
    pub ema_alpha: f64,
    /// Load percentage at or above which an active node is marked busy.
    pub busy_load_threshold: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            offline_threshold: 3,
            ema_alpha: 0.3,
            busy_load_threshold: 95.0,
        }
    }
}

/// Configuration for batch job monitoring.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Interval between outcome polls while a batch is monitoring.
    pub poll_interval: Duration,
    /// Deadline applied when the caller does not supply one.
    pub default_deadline: Duration,
    /// Minimum aggregate success rate for a batch to complete rather than fail.
    pub success_floor: f64,
    /// Fallback per-item duration estimate used for progress before any
    /// node history exists.
    pub default_item_duration: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            default_deadline: Duration::from_secs(600),
            success_floor: 0.5,
            default_item_duration: Duration::from_millis(500),
        }
    }
}

/// Configuration for the streaming micro-batch pipeline.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Items buffered before a micro-batch is dispatched.
    pub micro_batch_size: usize,
    /// Micro-batches dispatched before the node subset is re-selected.
    pub reselect_after_batches: usize,
    /// Interval between outcome polls for an in-flight micro-batch.
    pub poll_interval: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            micro_batch_size: 50,
            reselect_after_batches: 100,
            poll_interval: Duration::from_millis(200),
        }
    }
}

/// Top-level configuration for the scheduling engine.
#[derive(Debug, Clone, Default)]
pub struct SchedulerConfig {
    pub health: HealthConfig,
    pub batch: BatchConfig,
    pub stream: StreamConfig,
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.batch.poll_interval = interval;
        self
    }

    pub fn with_success_floor(mut self, floor: f64) -> Self {
        self.batch.success_floor = floor;
        self
    }

    pub fn with_micro_batch_size(mut self, size: usize) -> Self {
        self.stream.micro_batch_size = size;
        self
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.health.probe_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_config_default() {
        let cfg = HealthConfig::default();
        assert_eq!(cfg.probe_interval, Duration::from_secs(30));
        assert_eq!(cfg.probe_timeout, Duration::from_secs(5));
        assert_eq!(cfg.offline_threshold, 3);
        assert!((cfg.ema_alpha - 0.3).abs() < f64::EPSILON);
        assert!((cfg.busy_load_threshold - 95.0).abs() < f64::EPSILON);
    }

    #[test]
    fn batch_config_default() {
        let cfg = BatchConfig::default();
        assert_eq!(cfg.poll_interval, Duration::from_secs(2));
        assert_eq!(cfg.default_deadline, Duration::from_secs(600));
        assert!((cfg.success_floor - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn stream_config_default() {
        let cfg = StreamConfig::default();
        assert_eq!(cfg.micro_batch_size, 50);
        assert_eq!(cfg.reselect_after_batches, 100);
    }

    #[test]
    fn scheduler_config_builders() {
        let cfg = SchedulerConfig::new()
            .with_poll_interval(Duration::from_millis(50))
            .with_success_floor(0.75)
            .with_micro_batch_size(8)
            .with_probe_interval(Duration::from_millis(100));
        assert_eq!(cfg.batch.poll_interval, Duration::from_millis(50));
        assert!((cfg.batch.success_floor - 0.75).abs() < f64::EPSILON);
        assert_eq!(cfg.stream.micro_batch_size, 8);
        assert_eq!(cfg.health.probe_interval, Duration::from_millis(100));
    }
}
