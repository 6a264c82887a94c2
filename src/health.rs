//! Memory-pressure classification and eviction pacing.

use crate::config::EvictionCooldowns;
use crate::profile::{EvictionRatios, MemoryThresholds};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MemoryLevel {
    None,
    Caution,
    Warning,
    Danger,
}

impl MemoryLevel {
    pub fn classify(percent: f64, thresholds: &MemoryThresholds) -> Self {
        if percent >= thresholds.danger {
            MemoryLevel::Danger
        } else if percent >= thresholds.warning {
            MemoryLevel::Warning
        } else if percent >= thresholds.caution {
            MemoryLevel::Caution
        } else {
            MemoryLevel::None
        }
    }

    fn slot(self) -> Option<usize> {
        match self {
            MemoryLevel::None => None,
            MemoryLevel::Caution => Some(0),
            MemoryLevel::Warning => Some(1),
            MemoryLevel::Danger => Some(2),
        }
    }
}

/// Decision produced by [`EvictionGovernor::assess`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvictionPlan {
    pub level: MemoryLevel,
    pub ratio: f64,
}

impl EvictionPlan {
    /// `ceil(cache_len × ratio)`
    pub fn quota(&self, cache_len: usize) -> usize {
        (cache_len as f64 * self.ratio).ceil() as usize
    }
}

/// Tracks when each level last acted so pressure hovering near a threshold
/// does not cause back-to-back eviction storms.
#[derive(Debug)]
pub struct EvictionGovernor {
    thresholds: MemoryThresholds,
    ratios: EvictionRatios,
    cooldowns: EvictionCooldowns,
    last_action: [Option<Instant>; 3],
}

impl EvictionGovernor {
    pub fn new(
        thresholds: MemoryThresholds,
        ratios: EvictionRatios,
        cooldowns: EvictionCooldowns,
    ) -> Self {
        Self {
            thresholds,
            ratios,
            cooldowns,
            last_action: [None; 3],
        }
    }

    /// Classify `percent` and decide whether to evict now. Recording the
    /// action starts the level's cooldown.
    pub fn assess(&mut self, percent: f64, now: Instant) -> (MemoryLevel, Option<EvictionPlan>) {
        let level = MemoryLevel::classify(percent, &self.thresholds);
        let Some(slot) = level.slot() else {
            return (level, None);
        };

        let cooldown = self.cooldown(level);
        let ready = match self.last_action[slot] {
            Some(last) => now.saturating_duration_since(last) >= cooldown,
            None => true,
        };
        if !ready {
            return (level, None);
        }

        self.last_action[slot] = Some(now);
        let plan = EvictionPlan {
            level,
            ratio: self.ratio(level),
        };
        (level, Some(plan))
    }

    fn cooldown(&self, level: MemoryLevel) -> Duration {
        match level {
            MemoryLevel::Danger => self.cooldowns.danger,
            MemoryLevel::Warning => self.cooldowns.warning,
            _ => self.cooldowns.caution,
        }
    }

    fn ratio(&self, level: MemoryLevel) -> f64 {
        match level {
            MemoryLevel::Danger => self.ratios.danger,
            MemoryLevel::Warning => self.ratios.warning,
            MemoryLevel::Caution => self.ratios.caution,
            MemoryLevel::None => 0.0,
        }
    }
}
