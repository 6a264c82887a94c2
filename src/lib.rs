//! photocull - the image-serving core of a photo culling tool.
//!
//! Architecture overview:
//! - Hardware profiles derive every capacity and threshold from RAM and cores
//! - A three-tier priority executor serves what the user is looking at first
//! - A bounded LRU pixmap cache protects the images around the current one
//! - Full RAW development runs in separate decoder worker processes
//! - A periodic health check evicts under memory pressure
//!
//! [`loader::ImageLoader`] ties these together; the UI talks to it and
//! listens for [`events::LoadEvent`]s.

pub mod bitmap;
pub mod cache;
pub mod config;
pub mod decode;
pub mod error;
pub mod events;
pub mod executor;
pub mod health;
pub mod loader;
pub mod preload;
pub mod profile;
pub mod raw_pool;
pub mod system;

pub use bitmap::{Bitmap, BitmapSource};
pub use config::Config;
pub use events::LoadEvent;
pub use executor::{Priority, PriorityExecutor};
pub use loader::{ImageLoader, LoaderStats, RawStrategy};
pub use profile::{HardwareProfileManager, PerformanceProfile};
pub use raw_pool::RawDecoderPool;
