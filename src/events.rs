//! Notifications raised by the loader for the UI layer.

use crate::bitmap::Bitmap;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub enum LoadEvent {
    /// A requested image is decoded and cached.
    Loaded {
        index: usize,
        bitmap: Arc<Bitmap>,
        path: PathBuf,
    },
    /// A requested image could not be decoded.
    Failed {
        error: String,
        path: PathBuf,
        index: usize,
    },
    /// Full RAW decoding does not work for this file's camera; it will be
    /// served from its embedded preview from now on. Raised once per camera.
    Incompatible { path: PathBuf },
}

impl LoadEvent {
    pub fn path(&self) -> &PathBuf {
        match self {
            LoadEvent::Loaded { path, .. }
            | LoadEvent::Failed { path, .. }
            | LoadEvent::Incompatible { path } => path,
        }
    }

    /// Index in the file list, if the event is about a specific request.
    pub fn index(&self) -> Option<usize> {
        match self {
            LoadEvent::Loaded { index, .. } | LoadEvent::Failed { index, .. } => Some(*index),
            LoadEvent::Incompatible { .. } => None,
        }
    }
}
