//! Preload planning - what to load around a position, and how urgently.
//!
//! The loader turns these plans into executor submissions. Planning is pure
//! so the ordering rules can be tested without decoding anything.
//!
//! - The focused image always goes first at high priority
//! - Nearby images follow, closer before farther, ahead before behind
//! - A page request is followed by a speculative page for cache warming

use crate::executor::Priority;
use std::cmp::Ordering;
use std::ops::Range;

/// One planned load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadTask {
    pub index: usize,
    pub priority: Priority,
    pub distance: usize,
    /// Whether completion should be announced to the UI
    pub notify: bool,
}

/// Preload radii around the focused image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FocusRadii {
    /// Images this close are loaded at medium priority
    pub priority: usize,
    /// Images this close (but outside `priority`) are loaded at low priority
    pub adjacent: usize,
}

impl FocusRadii {
    pub fn priority_for_distance(&self, distance: usize) -> Option<Priority> {
        match distance {
            0 => Some(Priority::High),
            d if d <= self.priority => Some(Priority::Medium),
            d if d <= self.reach() => Some(Priority::Low),
            _ => None,
        }
    }

    /// Farthest distance that is loaded at all.
    #[inline]
    pub fn reach(&self) -> usize {
        self.priority.max(self.adjacent)
    }
}

/// Build the prioritized load list around `current`, skipping indices for
/// which `is_cached` returns true. The list does not wrap at the ends.
pub fn plan_focus<F>(current: usize, total: usize, radii: FocusRadii, is_cached: F) -> Vec<LoadTask>
where
    F: Fn(usize) -> bool,
{
    if current >= total {
        return Vec::new();
    }

    let mut tasks = Vec::new();
    let mut push = |index: usize, distance: usize| {
        if is_cached(index) {
            return;
        }
        if let Some(priority) = radii.priority_for_distance(distance) {
            tasks.push(LoadTask {
                index,
                priority,
                distance,
                notify: distance == 0,
            });
        }
    };

    push(current, 0);
    for offset in 1..=radii.reach() {
        if current + offset < total {
            push(current + offset, offset);
        }
        if offset <= current {
            push(current - offset, offset);
        }
    }

    // Stable: ahead stays before behind at equal distance
    tasks.sort_by(|a, b| match b.priority.cmp(&a.priority) {
        Ordering::Equal => a.distance.cmp(&b.distance),
        ord => ord,
    });
    tasks
}

/// A page request and the page after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagePlan {
    pub requested: Range<usize>,
    /// Loaded at low priority without notifications
    pub speculative: Range<usize>,
}

pub fn plan_page(start: usize, count: usize, total: usize) -> PagePlan {
    let begin = start.min(total);
    let end = start.saturating_add(count).min(total);
    PagePlan {
        requested: begin..end,
        speculative: end..end.saturating_add(count).min(total),
    }
}
