//! Bounded, access-ordered pixmap cache.
//!
//! Entries are kept in a linked hash map with the least recently used entry
//! at the front. Insertion at capacity and pressure-driven eviction both walk
//! from the front and skip any path the caller marks as protected.
//!
//! The cache itself is not synchronised; the loader keeps it under the same
//! lock as its in-flight set.

use crate::bitmap::Bitmap;
use hashlink::LinkedHashMap;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct PixmapCache {
    entries: LinkedHashMap<PathBuf, Arc<Bitmap>>,
    capacity: usize,
}

impl PixmapCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: LinkedHashMap::new(),
            capacity: capacity.max(1),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Read hit: returns the bitmap and moves it to most recently used.
    pub fn get(&mut self, path: &Path) -> Option<Arc<Bitmap>> {
        self.entries.to_back(path).map(|bitmap| Arc::clone(bitmap))
    }

    /// Look up without touching access order.
    pub fn peek(&self, path: &Path) -> Option<&Arc<Bitmap>> {
        self.entries.get(path)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.contains_key(path)
    }

    /// Insert as most recently used. At capacity the oldest unprotected
    /// entry is evicted first; if every entry is protected the oldest one
    /// goes anyway so the bound holds. Returns the evicted path.
    pub fn insert(
        &mut self,
        path: PathBuf,
        bitmap: Arc<Bitmap>,
        protected: &HashSet<PathBuf>,
    ) -> Option<PathBuf> {
        if self.entries.remove(&path).is_some() {
            self.entries.insert(path, bitmap);
            return None;
        }

        let evicted = if self.entries.len() >= self.capacity {
            let victim = self
                .oldest_unprotected(protected)
                .or_else(|| self.entries.front().map(|(k, _)| k.clone()));
            if let Some(victim) = &victim {
                self.entries.remove(victim);
            }
            victim
        } else {
            None
        };

        self.entries.insert(path, bitmap);
        evicted
    }

    /// Evict up to `count` entries oldest-first, never touching protected
    /// paths. Stops early when only protected entries remain.
    pub fn evict_oldest(&mut self, count: usize, protected: &HashSet<PathBuf>) -> Vec<PathBuf> {
        let victims: Vec<PathBuf> = self
            .entries
            .keys()
            .filter(|path| !protected.contains(*path))
            .take(count)
            .cloned()
            .collect();

        for victim in &victims {
            self.entries.remove(victim);
        }
        victims
    }

    pub fn remove(&mut self, path: &Path) -> Option<Arc<Bitmap>> {
        self.entries.remove(path)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.entries.shrink_to_fit();
    }

    /// Give back table storage left over after evictions.
    pub fn release_storage(&mut self) {
        self.entries.shrink_to_fit();
    }

    /// Paths from least to most recently used.
    pub fn paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.entries.keys()
    }

    /// Bytes held by cached bitmaps.
    pub fn memory_used(&self) -> usize {
        self.entries.values().map(|b| b.memory_size()).sum()
    }

    fn oldest_unprotected(&self, protected: &HashSet<PathBuf>) -> Option<PathBuf> {
        self.entries
            .keys()
            .find(|path| !protected.contains(*path))
            .cloned()
    }
}

/// Paths within `current ± window` of the file list.
pub fn protected_paths(files: &[PathBuf], current: usize, window: usize) -> HashSet<PathBuf> {
    if files.is_empty() {
        return HashSet::new();
    }
    let current = current.min(files.len() - 1);
    let start = current.saturating_sub(window);
    let end = current.saturating_add(window).min(files.len() - 1);
    files[start..=end].iter().cloned().collect()
}
