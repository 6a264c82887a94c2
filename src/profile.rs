//! Hardware performance profiles.
//!
//! The host is classified once by total RAM into one of six named profiles.
//! Every capacity and threshold knob of the core is read from the active
//! profile; nothing else in the crate hard-codes them.

use crate::error::ProfileError;
use crate::system::{HostStats, SystemProbe};
use std::fmt;
use tracing::{info, warn};

/// Value that scales with the number of physical cores:
/// `min(cap, max(floor, cores / divisor))`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreScaled {
    pub floor: usize,
    pub cap: usize,
    pub divisor: usize,
}

impl CoreScaled {
    pub const fn new(floor: usize, cap: usize, divisor: usize) -> Self {
        Self {
            floor,
            cap,
            divisor,
        }
    }

    pub fn resolve(&self, cores: usize) -> usize {
        (cores / self.divisor.max(1)).max(self.floor).min(self.cap)
    }
}

/// Memory use thresholds, in percent of total RAM.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryThresholds {
    pub caution: f64,
    pub warning: f64,
    pub danger: f64,
}

/// Fraction of the cache evicted at each level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvictionRatios {
    pub caution: f64,
    pub warning: f64,
    pub danger: f64,
}

/// Table row describing one profile before core-count resolution.
#[derive(Debug, Clone, Copy)]
struct ProfileSpec {
    name: &'static str,
    min_ram_gb: f64,
    max_threads: usize,
    decoder_processes: CoreScaled,
    cache_size: usize,
    adjacent_radius: usize,
    priority_radius: usize,
    thresholds: MemoryThresholds,
    ratios: EvictionRatios,
}

/// Ordered from the largest machine down; selection takes the first row
/// whose RAM breakpoint the host meets.
const PROFILES: &[ProfileSpec] = &[
    ProfileSpec {
        name: "dominator",
        min_ram_gb: 90.0,
        max_threads: 16,
        decoder_processes: CoreScaled::new(2, 8, 2),
        cache_size: 250,
        adjacent_radius: 8,
        priority_radius: 4,
        thresholds: MemoryThresholds { caution: 85.0, warning: 92.0, danger: 96.0 },
        ratios: EvictionRatios { caution: 0.10, warning: 0.20, danger: 0.40 },
    },
    ProfileSpec {
        name: "extreme",
        min_ram_gb: 45.0,
        max_threads: 12,
        decoder_processes: CoreScaled::new(2, 6, 3),
        cache_size: 160,
        adjacent_radius: 6,
        priority_radius: 3,
        thresholds: MemoryThresholds { caution: 82.0, warning: 90.0, danger: 95.0 },
        ratios: EvictionRatios { caution: 0.10, warning: 0.25, danger: 0.45 },
    },
    ProfileSpec {
        name: "aggressive",
        min_ram_gb: 30.0,
        max_threads: 10,
        decoder_processes: CoreScaled::new(1, 4, 4),
        cache_size: 100,
        adjacent_radius: 5,
        priority_radius: 3,
        thresholds: MemoryThresholds { caution: 80.0, warning: 88.0, danger: 94.0 },
        ratios: EvictionRatios { caution: 0.15, warning: 0.30, danger: 0.50 },
    },
    ProfileSpec {
        name: "enhanced",
        min_ram_gb: 22.0,
        max_threads: 8,
        decoder_processes: CoreScaled::new(1, 3, 4),
        cache_size: 60,
        adjacent_radius: 4,
        priority_radius: 2,
        thresholds: MemoryThresholds { caution: 78.0, warning: 87.0, danger: 93.0 },
        ratios: EvictionRatios { caution: 0.15, warning: 0.30, danger: 0.50 },
    },
    ProfileSpec {
        name: "balanced",
        min_ram_gb: 12.0,
        max_threads: 6,
        decoder_processes: CoreScaled::new(1, 2, 4),
        cache_size: 40,
        adjacent_radius: 3,
        priority_radius: 2,
        thresholds: MemoryThresholds { caution: 75.0, warning: 85.0, danger: 92.0 },
        ratios: EvictionRatios { caution: 0.20, warning: 0.35, danger: 0.55 },
    },
    ProfileSpec {
        name: "conservative",
        min_ram_gb: 0.0,
        max_threads: 4,
        decoder_processes: CoreScaled::new(1, 2, 4),
        cache_size: 20,
        adjacent_radius: 2,
        priority_radius: 1,
        thresholds: MemoryThresholds { caution: 70.0, warning: 80.0, danger: 88.0 },
        ratios: EvictionRatios { caution: 0.20, warning: 0.40, danger: 0.60 },
    },
];

const FALLBACK_PROFILE: &str = "conservative";

/// Core count assumed when probing failed.
const FALLBACK_CORES: usize = 4;

/// A fully resolved profile: every value is concrete for this host.
#[derive(Debug, Clone, PartialEq)]
pub struct PerformanceProfile {
    pub name: &'static str,
    pub max_threads: usize,
    pub max_decoder_processes: usize,
    pub cache_size: usize,
    pub adjacent_radius: usize,
    pub priority_radius: usize,
    pub thresholds: MemoryThresholds,
    pub ratios: EvictionRatios,
}

impl PerformanceProfile {
    /// Profile by name resolved against the given core count.
    pub fn named(name: &str, physical_cores: usize) -> Result<Self, ProfileError> {
        find_spec(name)
            .map(|spec| resolve(spec, physical_cores))
            .ok_or_else(|| ProfileError::UnknownProfile(name.to_string()))
    }

    /// Names of all known profiles, largest machine first.
    pub fn names() -> impl Iterator<Item = &'static str> {
        PROFILES.iter().map(|p| p.name)
    }
}

/// Scalar returned by [`HardwareProfileManager::get`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProfileValue {
    Count(usize),
    Percent(f64),
    Ratio(f64),
}

impl fmt::Display for ProfileValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProfileValue::Count(n) => write!(f, "{n}"),
            ProfileValue::Percent(p) => write!(f, "{p}%"),
            ProfileValue::Ratio(r) => write!(f, "{r}"),
        }
    }
}

/// Keys accepted by [`HardwareProfileManager::get`].
pub const PROFILE_KEYS: &[&str] = &[
    "max_threads",
    "max_decoder_processes",
    "cache_size",
    "adjacent_preload_radius",
    "priority_preload_radius",
    "memory_caution_percent",
    "memory_warning_percent",
    "memory_danger_percent",
    "eviction_ratio_caution",
    "eviction_ratio_warning",
    "eviction_ratio_danger",
];

/// Selects and serves the active performance profile.
#[derive(Debug, Clone)]
pub struct HardwareProfileManager {
    host: Option<HostStats>,
    active: &'static str,
}

impl HardwareProfileManager {
    /// Probe the host and select a profile. Never fails: a probe error
    /// selects the conservative profile.
    pub fn initialize(probe: &dyn SystemProbe) -> Self {
        match probe.host_stats() {
            Ok(host) => {
                let active = select_profile(host.total_memory_gb());
                info!(
                    profile = active,
                    ram_gb = host.total_memory_gb(),
                    physical_cores = host.physical_cores,
                    "selected performance profile"
                );
                Self {
                    host: Some(host),
                    active,
                }
            }
            Err(err) => {
                warn!(error = %err, "hardware probe failed, using {FALLBACK_PROFILE} profile");
                Self {
                    host: None,
                    active: FALLBACK_PROFILE,
                }
            }
        }
    }

    pub fn host(&self) -> Option<HostStats> {
        self.host
    }

    pub fn active_name(&self) -> &'static str {
        self.active
    }

    /// Override the automatic choice. Unknown names leave the active
    /// profile unchanged.
    pub fn set_profile_manually(&mut self, name: &str) -> Result<(), ProfileError> {
        let spec =
            find_spec(name).ok_or_else(|| ProfileError::UnknownProfile(name.to_string()))?;
        info!(from = self.active, to = spec.name, "performance profile overridden");
        self.active = spec.name;
        Ok(())
    }

    /// Value of `key` for the active profile; core-scaled values are
    /// evaluated against the probed core count.
    pub fn get(&self, key: &str) -> Option<ProfileValue> {
        let p = self.profile();
        let value = match key {
            "max_threads" => ProfileValue::Count(p.max_threads),
            "max_decoder_processes" => ProfileValue::Count(p.max_decoder_processes),
            "cache_size" => ProfileValue::Count(p.cache_size),
            "adjacent_preload_radius" => ProfileValue::Count(p.adjacent_radius),
            "priority_preload_radius" => ProfileValue::Count(p.priority_radius),
            "memory_caution_percent" => ProfileValue::Percent(p.thresholds.caution),
            "memory_warning_percent" => ProfileValue::Percent(p.thresholds.warning),
            "memory_danger_percent" => ProfileValue::Percent(p.thresholds.danger),
            "eviction_ratio_caution" => ProfileValue::Ratio(p.ratios.caution),
            "eviction_ratio_warning" => ProfileValue::Ratio(p.ratios.warning),
            "eviction_ratio_danger" => ProfileValue::Ratio(p.ratios.danger),
            _ => return None,
        };
        Some(value)
    }

    /// The active profile as a typed record.
    pub fn profile(&self) -> PerformanceProfile {
        let cores = self
            .host
            .map(|h| h.physical_cores)
            .unwrap_or(FALLBACK_CORES);
        // `active` is always a name from PROFILES
        let spec = find_spec(self.active).unwrap_or(&PROFILES[PROFILES.len() - 1]);
        resolve(spec, cores)
    }
}

fn find_spec(name: &str) -> Option<&'static ProfileSpec> {
    PROFILES.iter().find(|p| p.name.eq_ignore_ascii_case(name))
}

fn select_profile(ram_gb: f64) -> &'static str {
    PROFILES
        .iter()
        .find(|p| ram_gb >= p.min_ram_gb)
        .map(|p| p.name)
        .unwrap_or(FALLBACK_PROFILE)
}

fn resolve(spec: &ProfileSpec, physical_cores: usize) -> PerformanceProfile {
    PerformanceProfile {
        name: spec.name,
        max_threads: spec.max_threads,
        max_decoder_processes: spec.decoder_processes.resolve(physical_cores),
        cache_size: spec.cache_size,
        adjacent_radius: spec.adjacent_radius,
        priority_radius: spec.priority_radius,
        thresholds: spec.thresholds,
        ratios: spec.ratios,
    }
}
