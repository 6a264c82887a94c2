//! Configuration - all tunable parameters in one place.
//!
//! Capacity and threshold knobs that depend on the host (thread counts, cache
//! size, memory thresholds, eviction ratios) live in
//! [`PerformanceProfile`](crate::profile::PerformanceProfile). Everything here
//! is host independent and has a sensible default.

use std::time::Duration;

/// Master configuration for the core.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Cache and orchestration behaviour
    pub loader: LoaderConfig,
    /// Priority executor behaviour
    pub executor: ExecutorConfig,
    /// Out-of-process RAW decoding
    pub decoder: DecoderPoolConfig,
}

/// Loader and cache-health configuration
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Entries within current index ± this window are never evicted
    pub protected_window: usize,
    /// How often the memory health check runs
    pub health_check_interval: Duration,
    /// Minimum time between two evictions at the same severity level
    pub cooldowns: EvictionCooldowns,
    /// Maximum decoder results handled per `poll()`
    pub raw_results_per_poll: usize,
    /// Extensions (lowercase, no dot) routed through the RAW strategies
    pub raw_extensions: Vec<&'static str>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            protected_window: 3,
            health_check_interval: Duration::from_secs(30),
            cooldowns: EvictionCooldowns::default(),
            raw_results_per_poll: 8,
            raw_extensions: vec![
                "arw", "cr2", "cr3", "crw", "dng", "erf", "kdc", "mef", "mos", "mrw", "nef",
                "nrw", "orf", "pef", "raf", "rw2", "rwl", "sr2", "srf", "srw", "x3f", "3fr",
                "iiq",
            ],
        }
    }
}

/// Per-level cooldowns. More severe levels may act more often.
#[derive(Debug, Clone, Copy)]
pub struct EvictionCooldowns {
    pub caution: Duration,
    pub warning: Duration,
    pub danger: Duration,
}

impl Default for EvictionCooldowns {
    fn default() -> Self {
        Self {
            caution: Duration::from_secs(120),
            warning: Duration::from_secs(60),
            danger: Duration::from_secs(15),
        }
    }
}

/// Priority executor configuration
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// How long the dispatcher sleeps when all queues are empty
    pub idle_poll_interval: Duration,
    /// Upper bound on waiting for in-flight tasks during shutdown
    pub drain_timeout: Duration,
    /// Worker thread name prefix
    pub thread_name: &'static str,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            idle_poll_interval: Duration::from_millis(1),
            drain_timeout: Duration::from_secs(5),
            thread_name: "photocull-worker",
        }
    }
}

/// RAW decoder pool configuration
#[derive(Debug, Clone)]
pub struct DecoderPoolConfig {
    /// Workers hand a request back instead of decoding above this memory use
    pub severe_memory_percent: f64,
    /// Backoff applied before a handed-back request is queued again
    pub retry: RetryPolicy,
    /// How long a worker gets to exit after the shutdown sentinel
    pub shutdown_grace: Duration,
}

impl Default for DecoderPoolConfig {
    fn default() -> Self {
        Self {
            severe_memory_percent: 95.0,
            retry: RetryPolicy::default(),
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

/// Exponential backoff for requests deferred under memory pressure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub factor: u32,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before re-queueing after the given (1-based) deferral.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let scale = self.factor.max(1).saturating_pow(exponent);
        self.initial_delay
            .checked_mul(scale)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            factor: 2,
            max_delay: Duration::from_secs(4),
        }
    }
}
