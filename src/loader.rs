//! The image loader: cache, prioritized decoding and memory health.
//!
//! All public methods are called from one control thread. Decodes run on the
//! priority executor; full RAW development is handed back to the control
//! thread and forwarded to the RAW decoder pool, which has a single owner.
//! Cache, in-flight set and file list live under one lock.

use crate::bitmap::{Bitmap, BitmapSource};
use crate::cache::{protected_paths, PixmapCache};
use crate::config::Config;
use crate::decode::{self, Decoder};
use crate::error::{DecodeError, ExecutorError, LoaderError};
use crate::events::LoadEvent;
use crate::executor::{CancelToken, Priority, PriorityExecutor};
use crate::health::{EvictionGovernor, MemoryLevel};
use crate::preload::{self, FocusRadii, PagePlan};
use crate::profile::PerformanceProfile;
use crate::raw_pool::{DecodeResult, RawDecoderPool, WorkerLauncher};
use crate::system::SystemProbe;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How a RAW file is turned into a bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RawStrategy {
    /// Decode the embedded JPEG preview in-process
    Preview,
    /// Full development in a decoder worker
    Decode,
}

impl RawStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            RawStrategy::Preview => "preview",
            RawStrategy::Decode => "decode",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "preview" => Some(RawStrategy::Preview),
            "decode" => Some(RawStrategy::Decode),
            _ => None,
        }
    }
}

/// Snapshot returned by [`ImageLoader::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoaderStats {
    pub files: usize,
    pub cached: usize,
    pub capacity: usize,
    pub cached_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub in_flight: usize,
    pub queued: usize,
    pub raw_pending: usize,
    pub raw_workers: usize,
}

/// Outcome of one health check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthReport {
    pub level: MemoryLevel,
    pub memory_percent: f64,
    pub evicted: usize,
}

/// A decode that has been submitted and not completed yet.
struct Pending {
    notify: bool,
    priority: Priority,
    token: CancelToken,
}

struct CacheState {
    cache: PixmapCache,
    in_flight: HashMap<PathBuf, Pending>,
    files: Arc<Vec<PathBuf>>,
    current_index: usize,
    /// Bumped whenever the file list is replaced
    generation: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

#[derive(Debug, Clone)]
struct LoadJob {
    index: usize,
    path: PathBuf,
    generation: u64,
    strategy: Option<RawStrategy>,
    notify: bool,
    camera: Option<String>,
}

enum Scheduled {
    Cached(Arc<Bitmap>),
    Queued(PathBuf, CancelToken),
    InFlight,
}

/// State shared with decode tasks.
struct Shared {
    state: Mutex<CacheState>,
    decoder: Decoder,
    strategies: Mutex<HashMap<String, RawStrategy>>,
    incompatible_notified: Mutex<HashSet<String>>,
    events: Sender<LoadEvent>,
    raw_dispatch: Sender<LoadJob>,
    counters: Counters,
    protected_window: usize,
}

impl Shared {
    fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    fn emit(&self, event: LoadEvent) {
        // The loader keeps a receiver, so this only fails during teardown.
        let _ = self.events.send(event);
    }

    fn strategy_for(&self, camera: Option<&str>) -> RawStrategy {
        camera
            .and_then(|model| self.strategies.lock().get(model).copied())
            .unwrap_or(RawStrategy::Preview)
    }

    /// Runs on an executor worker.
    fn run_load(self: &Arc<Self>, mut job: LoadJob) {
        if self.generation() != job.generation {
            return;
        }

        let path = job.path.clone();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.decode_in_process(&mut job)));
        match outcome {
            Ok(Some(result)) => self.complete(job, result),
            Ok(None) => {}
            Err(_) => self.complete(job, Err(DecodeError::Panicked(path))),
        }
    }

    /// `None` when the job was handed over for full RAW development.
    fn decode_in_process(&self, job: &mut LoadJob) -> Option<Result<Bitmap, DecodeError>> {
        if !self.decoder.is_raw(&job.path) {
            return Some(self.decoder.decode_standard(&job.path));
        }

        if job.camera.is_none() {
            job.camera = decode::camera_model(&job.path);
        }
        let strategy = job
            .strategy
            .unwrap_or_else(|| self.strategy_for(job.camera.as_deref()));

        match strategy {
            RawStrategy::Preview => Some(self.decoder.extract_preview(&job.path)),
            RawStrategy::Decode => match self.raw_dispatch.send(job.clone()) {
                Ok(()) => None,
                Err(_) => Some(Err(DecodeError::Pool {
                    path: job.path.clone(),
                    reason: "loader is shutting down".into(),
                })),
            },
        }
    }

    /// Runs on the control thread when the pool reports back.
    fn finish_raw(self: &Arc<Self>, executor: &PriorityExecutor, job: LoadJob, result: DecodeResult) {
        match result.outcome {
            Ok(pixels) => {
                let (width, height, channels) = (pixels.width, pixels.height, pixels.channels);
                let outcome = Bitmap::from_channels(
                    pixels.data,
                    width,
                    height,
                    channels,
                    BitmapSource::RawFull,
                )
                .ok_or_else(|| {
                    DecodeError::Raw(format!(
                        "pixel buffer does not match {width}x{height}x{channels}"
                    ))
                });
                self.complete(job, outcome);
            }
            Err(reason) => self.fall_back_to_preview(executor, job, reason),
        }
    }

    /// Full decode failed: serve this camera from previews from now on.
    fn fall_back_to_preview(
        self: &Arc<Self>,
        executor: &PriorityExecutor,
        job: LoadJob,
        reason: String,
    ) {
        if self.generation() != job.generation {
            return;
        }

        let camera = job
            .camera
            .clone()
            .unwrap_or_else(|| job.path.display().to_string());
        if let Some(model) = &job.camera {
            self.strategies
                .lock()
                .insert(model.clone(), RawStrategy::Preview);
        }
        warn!(
            path = %job.path.display(),
            camera = %camera,
            %reason,
            "full RAW decode failed, falling back to embedded preview"
        );
        if self.incompatible_notified.lock().insert(camera) {
            self.emit(LoadEvent::Incompatible {
                path: job.path.clone(),
            });
        }

        let mut fallback = job.clone();
        fallback.strategy = Some(RawStrategy::Preview);
        match spawn_load(self, executor, Priority::High, fallback) {
            // The entry keeps its original token so navigation can still
            // silence it
            Ok(_) => {
                if let Some(pending) = self.state.lock().in_flight.get_mut(&job.path) {
                    pending.priority = Priority::High;
                }
            }
            Err(err) => {
                let path = job.path.clone();
                self.complete(
                    job,
                    Err(DecodeError::Pool {
                        path,
                        reason: err.to_string(),
                    }),
                );
            }
        }
    }

    fn complete(&self, job: LoadJob, outcome: Result<Bitmap, DecodeError>) {
        let mut state = self.state.lock();
        if state.generation != job.generation {
            debug!(path = %job.path.display(), "discarding result for a replaced file list");
            return;
        }
        let notify = state
            .in_flight
            .remove(&job.path)
            .map(|pending| pending.notify)
            .unwrap_or(job.notify);

        match outcome {
            Ok(bitmap) => {
                let bitmap = Arc::new(bitmap);
                let protected =
                    protected_paths(&state.files, state.current_index, self.protected_window);
                if let Some(evicted) =
                    state
                        .cache
                        .insert(job.path.clone(), Arc::clone(&bitmap), &protected)
                {
                    self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                    debug!(path = %evicted.display(), "evicted to make room");
                }
                drop(state);

                debug!(
                    index = job.index,
                    path = %job.path.display(),
                    width = bitmap.width,
                    height = bitmap.height,
                    "image loaded"
                );
                if notify {
                    self.emit(LoadEvent::Loaded {
                        index: job.index,
                        bitmap,
                        path: job.path,
                    });
                }
            }
            Err(error) => {
                drop(state);
                warn!(index = job.index, path = %job.path.display(), %error, "failed to load image");
                if notify {
                    self.emit(LoadEvent::Failed {
                        error: error.to_string(),
                        path: job.path,
                        index: job.index,
                    });
                }
            }
        }
    }
}

fn spawn_load(
    shared: &Arc<Shared>,
    executor: &PriorityExecutor,
    priority: Priority,
    job: LoadJob,
) -> Result<CancelToken, ExecutorError> {
    let task_shared = Arc::clone(shared);
    let handle = executor.submit_with_priority(priority, move || task_shared.run_load(job))?;
    Ok(handle.cancel_token())
}

/// Serves decoded images for an ordered file list.
pub struct ImageLoader {
    shared: Arc<Shared>,
    executor: PriorityExecutor,
    pool: RawDecoderPool,
    raw_rx: Receiver<LoadJob>,
    events_rx: Receiver<LoadEvent>,
    governor: EvictionGovernor,
    probe: Arc<dyn SystemProbe>,
    profile: PerformanceProfile,
    health_check_interval: Duration,
    raw_results_per_poll: usize,
    last_health_check: Instant,
    page_tokens: Vec<(PathBuf, CancelToken)>,
    focus_tokens: Vec<(PathBuf, CancelToken)>,
}

impl ImageLoader {
    pub fn new(
        profile: PerformanceProfile,
        config: &Config,
        probe: Arc<dyn SystemProbe>,
        launcher: &dyn WorkerLauncher,
    ) -> Result<Self, LoaderError> {
        let executor = PriorityExecutor::new(profile.max_threads, &config.executor)?;
        let pool = RawDecoderPool::new(
            profile.max_decoder_processes,
            launcher,
            config.decoder.clone(),
        );

        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let (raw_tx, raw_rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(Shared {
            state: Mutex::new(CacheState {
                cache: PixmapCache::new(profile.cache_size),
                in_flight: HashMap::new(),
                files: Arc::new(Vec::new()),
                current_index: 0,
                generation: 0,
            }),
            decoder: Decoder::new(config.loader.raw_extensions.clone()),
            strategies: Mutex::new(HashMap::new()),
            incompatible_notified: Mutex::new(HashSet::new()),
            events: events_tx,
            raw_dispatch: raw_tx,
            counters: Counters::default(),
            protected_window: config.loader.protected_window,
        });

        let governor =
            EvictionGovernor::new(profile.thresholds, profile.ratios, config.loader.cooldowns);

        info!(
            profile = profile.name,
            cache_size = profile.cache_size,
            threads = executor.workers(),
            raw_workers = pool.live_workers(),
            "image loader ready"
        );

        Ok(Self {
            shared,
            executor,
            pool,
            raw_rx,
            events_rx,
            governor,
            probe,
            profile,
            health_check_interval: config.loader.health_check_interval,
            raw_results_per_poll: config.loader.raw_results_per_poll,
            last_health_check: Instant::now(),
            page_tokens: Vec::new(),
            focus_tokens: Vec::new(),
        })
    }

    /// Receiver for load notifications. All clones share one queue.
    pub fn events(&self) -> Receiver<LoadEvent> {
        self.events_rx.clone()
    }

    pub fn profile(&self) -> &PerformanceProfile {
        &self.profile
    }

    pub fn files(&self) -> Arc<Vec<PathBuf>> {
        Arc::clone(&self.shared.state.lock().files)
    }

    pub fn current_index(&self) -> usize {
        self.shared.state.lock().current_index
    }

    /// Replace the file list. Clears the cache and abandons queued work;
    /// results still in flight for the old list are discarded.
    pub fn set_file_list(&mut self, files: Vec<PathBuf>) {
        for (_, token) in self.page_tokens.drain(..).chain(self.focus_tokens.drain(..)) {
            token.cancel();
        }

        let mut state = self.shared.state.lock();
        state.generation += 1;
        state.files = Arc::new(files);
        state.current_index = 0;
        state.cache.clear();
        state.in_flight.clear();
        info!(files = state.files.len(), "file list replaced");
    }

    pub fn set_current_index(&mut self, index: usize) -> Result<(), LoaderError> {
        let mut state = self.shared.state.lock();
        let len = state.files.len();
        if index >= len {
            return Err(LoaderError::IndexOutOfRange { index, len });
        }
        state.current_index = index;
        Ok(())
    }

    /// Return the image if cached, otherwise queue it at high priority and
    /// return `None`; a [`LoadEvent`] follows when the decode finishes.
    /// `strategy` overrides the camera's RAW strategy for this request.
    pub fn load_image(
        &self,
        index: usize,
        strategy: Option<RawStrategy>,
    ) -> Result<Option<Arc<Bitmap>>, LoaderError> {
        match self.schedule(index, Priority::High, strategy, true)? {
            Scheduled::Cached(bitmap) => {
                self.shared.counters.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(bitmap))
            }
            Scheduled::Queued(..) | Scheduled::InFlight => {
                self.shared.counters.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    /// Make `index` current, load it at high priority and warm its
    /// neighbourhood: the priority radius at medium, the adjacent radius at
    /// low. Neighbour loads queued by the previous focus are abandoned.
    pub fn focus(&mut self, index: usize) -> Result<Option<Arc<Bitmap>>, LoaderError> {
        self.set_current_index(index)?;
        let stale = std::mem::take(&mut self.focus_tokens);
        self.cancel_queued(stale);

        let current = self.load_image(index, None)?;

        let radii = FocusRadii {
            priority: self.profile.priority_radius,
            adjacent: self.profile.adjacent_radius,
        };
        let tasks = {
            let state = self.shared.state.lock();
            preload::plan_focus(index, state.files.len(), radii, |i| {
                i == index || state.cache.contains(&state.files[i])
            })
        };

        for task in tasks {
            if let Scheduled::Queued(path, token) =
                self.schedule(task.index, task.priority, None, task.notify)?
            {
                self.focus_tokens.push((path, token));
            }
        }
        Ok(current)
    }

    /// Load `count` images from `start` with notifications, then warm the
    /// following page silently. Work queued for the previous page that has
    /// not started is cancelled. A different `files` list replaces the
    /// current one first.
    pub fn preload_page(
        &mut self,
        files: &[PathBuf],
        start: usize,
        count: usize,
    ) -> Result<PagePlan, LoaderError> {
        let same_list = self.shared.state.lock().files.as_slice() == files;
        if same_list {
            let stale = std::mem::take(&mut self.page_tokens);
            let cancelled = self.cancel_queued(stale);
            debug!(cancelled, "cancelled previous page");
        } else {
            self.set_file_list(files.to_vec());
        }

        let plan = preload::plan_page(start, count, files.len());
        for index in plan.requested.clone() {
            match self.schedule(index, Priority::Medium, None, true)? {
                Scheduled::Queued(path, token) => self.page_tokens.push((path, token)),
                Scheduled::Cached(bitmap) => self.shared.emit(LoadEvent::Loaded {
                    index,
                    bitmap,
                    path: files[index].clone(),
                }),
                Scheduled::InFlight => {}
            }
        }
        for index in plan.speculative.clone() {
            if let Scheduled::Queued(path, token) =
                self.schedule(index, Priority::Low, None, false)?
            {
                self.page_tokens.push((path, token));
            }
        }

        debug!(
            start,
            count,
            queued = self.page_tokens.len(),
            "page preload submitted"
        );
        Ok(plan)
    }

    /// Queue a decode unless the image is cached or already on its way. A
    /// queued request is moved up if asked for at a higher priority.
    fn schedule(
        &self,
        index: usize,
        priority: Priority,
        strategy: Option<RawStrategy>,
        notify: bool,
    ) -> Result<Scheduled, LoaderError> {
        let mut state = self.shared.state.lock();
        let len = state.files.len();
        let path = state
            .files
            .get(index)
            .cloned()
            .ok_or(LoaderError::IndexOutOfRange { index, len })?;

        if let Some(bitmap) = state.cache.get(&path) {
            return Ok(Scheduled::Cached(bitmap));
        }

        let mut notify = notify;
        if let Some(pending) = state.in_flight.get_mut(&path) {
            pending.notify |= notify;
            if pending.priority >= priority || !pending.token.cancel() {
                return Ok(Scheduled::InFlight);
            }
            notify = pending.notify;
            debug!(index, ?priority, "raising priority of queued load");
        }

        let job = LoadJob {
            index,
            path: path.clone(),
            generation: state.generation,
            strategy,
            notify,
            camera: None,
        };
        // Submission only enqueues; holding the lock keeps the in-flight
        // entry and the task in step.
        let token = match spawn_load(&self.shared, &self.executor, priority, job) {
            Ok(token) => token,
            Err(err) => {
                state.in_flight.remove(&path);
                return Err(err.into());
            }
        };
        state.in_flight.insert(
            path.clone(),
            Pending {
                notify,
                priority,
                token: token.clone(),
            },
        );
        Ok(Scheduled::Queued(path, token))
    }

    /// Cancel tasks that have not started and silence the ones that have:
    /// their results still land in the cache but are no longer announced.
    /// Returns how many were cancelled.
    fn cancel_queued(&self, tokens: Vec<(PathBuf, CancelToken)>) -> usize {
        let mut state = self.shared.state.lock();
        let mut cancelled = 0;
        for (path, token) in tokens {
            if token.cancel() {
                state.in_flight.remove(&path);
                cancelled += 1;
            } else if let Some(pending) = state.in_flight.get_mut(&path) {
                // A later request may own this entry now
                if pending.token.same_task(&token) {
                    pending.notify = false;
                }
            }
        }
        cancelled
    }

    /// Drive the control-thread side: hand pending full RAW decodes to the
    /// pool, deliver up to the configured number of pool results, and run
    /// the health check when it is due. Returns the pool results delivered.
    pub fn poll(&mut self) -> usize {
        self.dispatch_raw();
        let delivered = self.pool.process_results(self.raw_results_per_poll);

        let now = Instant::now();
        if now.saturating_duration_since(self.last_health_check) >= self.health_check_interval {
            self.run_health_check(now);
        }
        delivered
    }

    fn dispatch_raw(&mut self) {
        let generation = self.shared.generation();
        while let Ok(job) = self.raw_rx.try_recv() {
            if job.generation != generation {
                continue;
            }
            let shared = Arc::clone(&self.shared);
            let executor = self.executor.clone();
            let (index, path) = (job.index, job.path.clone());
            let task_id = self.pool.decode_raw(
                path,
                Box::new(move |result: DecodeResult| shared.finish_raw(&executor, job, result)),
            );
            debug!(task_id, index, "dispatched full RAW decode");
        }
    }

    /// Sample memory use and evict under pressure. Protected images (the
    /// current one and its window) are never evicted.
    pub fn run_health_check(&mut self, now: Instant) -> HealthReport {
        self.last_health_check = now;
        let memory_percent = self.probe.memory_percent();
        let (level, plan) = self.governor.assess(memory_percent, now);

        let Some(plan) = plan else {
            return HealthReport {
                level,
                memory_percent,
                evicted: 0,
            };
        };

        let mut state = self.shared.state.lock();
        let quota = plan.quota(state.cache.len());
        let protected = protected_paths(
            &state.files,
            state.current_index,
            self.shared.protected_window,
        );
        let evicted = state.cache.evict_oldest(quota, &protected).len();
        if evicted > 0 {
            state.cache.release_storage();
        }
        let remaining = state.cache.len();
        drop(state);

        self.shared
            .counters
            .evictions
            .fetch_add(evicted as u64, Ordering::Relaxed);

        if evicted < quota {
            warn!(
                ?level,
                memory_percent,
                quota,
                evicted,
                "memory pressure: only protected images left to evict"
            );
        } else {
            info!(?level, memory_percent, evicted, remaining, "evicted images under memory pressure");
        }

        HealthReport {
            level,
            memory_percent,
            evicted,
        }
    }

    pub fn set_camera_strategy(&self, camera: &str, strategy: RawStrategy) {
        self.shared
            .strategies
            .lock()
            .insert(camera.to_string(), strategy);
    }

    pub fn camera_strategy(&self, camera: &str) -> Option<RawStrategy> {
        self.shared.strategies.lock().get(camera).copied()
    }

    /// All per-camera decisions, for the application to persist.
    pub fn camera_strategies(&self) -> HashMap<String, RawStrategy> {
        self.shared.strategies.lock().clone()
    }

    /// Cached image at `index` without touching its recency.
    pub fn cached(&self, index: usize) -> Option<Arc<Bitmap>> {
        let state = self.shared.state.lock();
        let path = state.files.get(index)?;
        state.cache.peek(path).cloned()
    }

    pub fn clear_cache(&self) {
        self.shared.state.lock().cache.clear();
    }

    pub fn stats(&self) -> LoaderStats {
        let state = self.shared.state.lock();
        let counters = &self.shared.counters;
        LoaderStats {
            files: state.files.len(),
            cached: state.cache.len(),
            capacity: state.cache.capacity(),
            cached_bytes: state.cache.memory_used(),
            hits: counters.hits.load(Ordering::Relaxed),
            misses: counters.misses.load(Ordering::Relaxed),
            evictions: counters.evictions.load(Ordering::Relaxed),
            in_flight: state.in_flight.len(),
            queued: self.executor.queued(),
            raw_pending: self.pool.pending_len(),
            raw_workers: self.pool.live_workers(),
        }
    }

    /// Stop the executor and the decoder pool. Safe to call more than once.
    pub fn shutdown(&mut self) {
        if self.executor.is_shut_down() && self.pool.is_shut_down() {
            return;
        }
        for (_, token) in self.page_tokens.drain(..).chain(self.focus_tokens.drain(..)) {
            token.cancel();
        }
        self.executor.shutdown();
        self.pool.shutdown();
        self.shared.state.lock().in_flight.clear();
        info!("image loader shut down");
    }
}

impl Drop for ImageLoader {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::tests::{jpeg_bytes, tiff_header};
    use crate::profile::{EvictionRatios, MemoryThresholds};
    use crate::raw_pool::{DecodedPixels, DeveloperFactory, InProcessLauncher, RawDeveloper};
    use crate::system::{FixedProbe, HostStats};
    use std::fs;
    use std::path::Path;
    use std::thread;
    use tempfile::TempDir;

    const CAMERA: &str = "TEST CAM 1";

    /// Develops every RAW file to a 2x1 white image, except `*_bad.nef`.
    struct Fake;

    impl RawDeveloper for Fake {
        fn develop(&mut self, path: &Path) -> Result<DecodedPixels, String> {
            if path.to_string_lossy().ends_with("_bad.nef") {
                return Err("unsupported camera".into());
            }
            Ok(DecodedPixels {
                width: 2,
                height: 1,
                channels: 3,
                data: vec![255; 6],
            })
        }
    }

    fn profile(cache_size: usize) -> PerformanceProfile {
        PerformanceProfile {
            name: "test",
            max_threads: 2,
            max_decoder_processes: 1,
            cache_size,
            adjacent_radius: 2,
            priority_radius: 1,
            thresholds: MemoryThresholds {
                caution: 70.0,
                warning: 85.0,
                danger: 95.0,
            },
            ratios: EvictionRatios {
                caution: 0.1,
                warning: 0.25,
                danger: 0.5,
            },
        }
    }

    fn probe(percent: f64) -> Arc<FixedProbe> {
        Arc::new(FixedProbe::new(
            HostStats {
                total_memory_bytes: 16 << 30,
                physical_cores: 8,
                logical_cores: 8,
            },
            percent,
        ))
    }

    fn loader(cache_size: usize, health_probe: Arc<FixedProbe>) -> ImageLoader {
        let mut config = Config::default();
        config.loader.health_check_interval = Duration::from_secs(3600);
        config.decoder.shutdown_grace = Duration::from_millis(200);

        let factory: DeveloperFactory = Arc::new(|_slot: usize| {
            Ok(Box::new(Fake) as Box<dyn RawDeveloper>)
        });
        let launcher = InProcessLauncher::new(factory, probe(10.0), 95.0);
        ImageLoader::new(profile(cache_size), &config, health_probe, &launcher).unwrap()
    }

    fn write_png(dir: &TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        image::RgbaImage::from_pixel(2, 2, image::Rgba([10, 20, 30, 255]))
            .save(&path)
            .unwrap();
        path
    }

    fn write_raw(dir: &TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut raw = tiff_header(CAMERA);
        raw.extend_from_slice(&[0u8; 32]);
        raw.extend_from_slice(&jpeg_bytes(8, 6));
        fs::write(&path, raw).unwrap();
        path
    }

    /// Poll until an event arrives.
    fn next_event(loader: &mut ImageLoader, events: &Receiver<LoadEvent>) -> LoadEvent {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            loader.poll();
            if let Ok(event) = events.recv_timeout(Duration::from_millis(5)) {
                return event;
            }
        }
        panic!("no load event within 5s");
    }

    fn wait_until(loader: &mut ImageLoader, mut done: impl FnMut(&ImageLoader) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(&*loader) {
            assert!(Instant::now() < deadline, "condition not met within 5s");
            loader.poll();
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn bitmap() -> Arc<Bitmap> {
        Arc::new(Bitmap::new(vec![0; 4], 1, 1, BitmapSource::Standard))
    }

    #[test]
    fn test_raw_strategy_names() {
        assert_eq!(RawStrategy::from_name("Decode"), Some(RawStrategy::Decode));
        assert_eq!(RawStrategy::from_name("preview"), Some(RawStrategy::Preview));
        assert_eq!(RawStrategy::from_name("thumbnail"), None);
        assert_eq!(
            serde_json::to_string(&RawStrategy::Decode).unwrap(),
            "\"decode\""
        );
    }

    #[test]
    fn test_miss_then_hit() {
        let dir = tempfile::tempdir().unwrap();
        let mut loader = loader(10, probe(10.0));
        let events = loader.events();
        loader.set_file_list(vec![write_png(&dir, "a.png"), write_png(&dir, "b.png")]);

        assert!(loader.load_image(1, None).unwrap().is_none());
        match next_event(&mut loader, &events) {
            LoadEvent::Loaded { index, bitmap, path } => {
                assert_eq!(index, 1);
                assert_eq!(path, dir.path().join("b.png"));
                assert_eq!((bitmap.width, bitmap.height), (2, 2));
            }
            other => panic!("unexpected {other:?}"),
        }

        let hit = loader.load_image(1, None).unwrap().unwrap();
        assert_eq!(hit.pixels[0..4], [10, 20, 30, 255]);

        let stats = loader.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert_eq!(stats.cached, 1);
        assert_eq!(stats.in_flight, 0);
    }

    #[test]
    fn test_decode_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let broken = dir.path().join("broken.png");
        fs::write(&broken, b"definitely not a png").unwrap();

        let mut loader = loader(10, probe(10.0));
        let events = loader.events();
        loader.set_file_list(vec![broken.clone()]);
        loader.load_image(0, None).unwrap();

        match next_event(&mut loader, &events) {
            LoadEvent::Failed { error, path, index } => {
                assert_eq!((path, index), (broken, 0));
                assert!(!error.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(loader.stats().cached, 0);
    }

    #[test]
    fn test_index_out_of_range() {
        let mut loader = loader(10, probe(10.0));
        loader.set_file_list(vec![PathBuf::from("/photos/a.png")]);
        assert!(matches!(
            loader.load_image(3, None),
            Err(LoaderError::IndexOutOfRange { index: 3, len: 1 })
        ));
        assert!(loader.set_current_index(1).is_err());
        assert_eq!(loader.current_index(), 0);
    }

    #[test]
    fn test_danger_evicts_half_oldest_first() {
        let probe = probe(96.0);
        let mut loader = loader(20, probe);
        let files: Vec<PathBuf> = (0..14)
            .map(|i| PathBuf::from(format!("/photos/{i:02}.jpg")))
            .collect();
        loader.set_file_list(files.clone());

        // Current 0 with window 3 protects 0..=3; cache only the other ten
        {
            let mut state = loader.shared.state.lock();
            for path in &files[4..] {
                state.cache.insert(path.clone(), bitmap(), &HashSet::new());
            }
        }

        let report = loader.run_health_check(Instant::now());
        assert_eq!(report.level, MemoryLevel::Danger);
        assert_eq!(report.evicted, 5);

        for (i, path) in files.iter().enumerate().skip(4) {
            let cached = loader.shared.state.lock().cache.contains(path);
            assert_eq!(cached, i >= 9, "file {i}");
        }
        assert_eq!(loader.stats().evictions, 5);
    }

    #[test]
    fn test_health_check_spares_protected_and_cools_down() {
        let probe = probe(96.0);
        let mut loader = loader(20, probe.clone());
        let files: Vec<PathBuf> = (0..10)
            .map(|i| PathBuf::from(format!("/photos/{i}.jpg")))
            .collect();
        loader.set_file_list(files.clone());
        loader.set_current_index(5).unwrap();

        // Protected 2..=8 cached first, so they are the oldest
        {
            let mut state = loader.shared.state.lock();
            for path in files[2..=8].iter().chain([&files[0], &files[9]]) {
                state.cache.insert(path.clone(), bitmap(), &HashSet::new());
            }
        }

        let now = Instant::now();
        let report = loader.run_health_check(now);
        // Quota is ceil(9 * 0.5) = 5 but only two entries are unprotected
        assert_eq!(report.evicted, 2);
        assert_eq!(loader.stats().cached, 7);

        // Same level within its cooldown does nothing
        let report = loader.run_health_check(now + Duration::from_secs(1));
        assert_eq!(report.evicted, 0);

        probe.set_memory_percent(40.0);
        let report = loader.run_health_check(now + Duration::from_secs(3600));
        assert_eq!((report.level, report.evicted), (MemoryLevel::None, 0));
    }

    #[test]
    fn test_raw_preview_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let mut loader = loader(10, probe(10.0));
        let events = loader.events();
        loader.set_file_list(vec![write_raw(&dir, "DSC_0001.nef")]);

        loader.load_image(0, None).unwrap();
        match next_event(&mut loader, &events) {
            LoadEvent::Loaded { bitmap, .. } => {
                assert_eq!(bitmap.source, BitmapSource::RawPreview);
                assert_eq!((bitmap.width, bitmap.height), (8, 6));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_raw_full_decode_for_profiled_camera() {
        let dir = tempfile::tempdir().unwrap();
        let mut loader = loader(10, probe(10.0));
        let events = loader.events();
        loader.set_camera_strategy(CAMERA, RawStrategy::Decode);
        loader.set_file_list(vec![write_raw(&dir, "DSC_0002.nef")]);

        loader.load_image(0, None).unwrap();
        match next_event(&mut loader, &events) {
            LoadEvent::Loaded { bitmap, .. } => {
                assert_eq!(bitmap.source, BitmapSource::RawFull);
                assert_eq!((bitmap.width, bitmap.height), (2, 1));
                assert_eq!(bitmap.pixels, vec![255, 255, 255, 255, 255, 255, 255, 255]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(loader.stats().raw_pending, 0);
    }

    #[test]
    fn test_incompatible_camera_falls_back_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut loader = loader(10, probe(10.0));
        let events = loader.events();
        loader.set_camera_strategy(CAMERA, RawStrategy::Decode);
        let first = write_raw(&dir, "one_bad.nef");
        let second = write_raw(&dir, "two_bad.nef");
        loader.set_file_list(vec![first.clone(), second.clone()]);

        loader.load_image(0, None).unwrap();
        match next_event(&mut loader, &events) {
            LoadEvent::Incompatible { path } => assert_eq!(path, first),
            other => panic!("unexpected {other:?}"),
        }
        match next_event(&mut loader, &events) {
            LoadEvent::Loaded { index, bitmap, .. } => {
                assert_eq!(index, 0);
                assert_eq!(bitmap.source, BitmapSource::RawPreview);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(loader.camera_strategy(CAMERA), Some(RawStrategy::Preview));

        // Forcing a full decode again fails again, but the notice is not repeated
        loader.load_image(1, Some(RawStrategy::Decode)).unwrap();
        match next_event(&mut loader, &events) {
            LoadEvent::Loaded { index, bitmap, .. } => {
                assert_eq!(index, 1);
                assert_eq!(bitmap.source, BitmapSource::RawPreview);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_results_for_replaced_list_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut loader = loader(10, probe(10.0));
        let events = loader.events();
        loader.set_camera_strategy(CAMERA, RawStrategy::Decode);
        let raw = write_raw(&dir, "DSC_0003.nef");
        loader.set_file_list(vec![raw.clone()]);

        loader.load_image(0, None).unwrap();
        // Wait for the executor to hand the job to the control thread
        let deadline = Instant::now() + Duration::from_secs(5);
        while loader.raw_rx.is_empty() {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(1));
        }

        loader.set_file_list(vec![raw]);
        for _ in 0..20 {
            loader.poll();
            thread::sleep(Duration::from_millis(2));
        }
        assert!(events.try_recv().is_err());
        assert_eq!(loader.stats().cached, 0);
    }

    #[test]
    fn test_page_notifies_requested_and_warms_next() {
        let dir = tempfile::tempdir().unwrap();
        let files: Vec<PathBuf> = (0..6)
            .map(|i| write_png(&dir, &format!("{i}.png")))
            .collect();
        let mut loader = loader(20, probe(10.0));
        let events = loader.events();

        let plan = loader.preload_page(&files, 0, 3).unwrap();
        assert_eq!((plan.requested, plan.speculative), (0..3, 3..6));
        wait_until(&mut loader, |l| l.stats().cached == 6);

        let mut notified: Vec<usize> = events.try_iter().filter_map(|e| e.index()).collect();
        notified.sort_unstable();
        assert_eq!(notified, vec![0, 1, 2]);

        // Same page again: everything is cached and reported straight away
        loader.preload_page(&files, 0, 3).unwrap();
        assert_eq!(events.try_iter().count(), 3);
    }

    #[test]
    fn test_leaving_a_page_silences_running_loads() {
        let dir = tempfile::tempdir().unwrap();
        let files: Vec<PathBuf> = (0..6)
            .map(|i| write_raw(&dir, &format!("DSC_{i:04}.nef")))
            .collect();
        let mut loader = loader(20, probe(10.0));
        let events = loader.events();
        loader.set_camera_strategy(CAMERA, RawStrategy::Decode);

        loader.preload_page(&files, 0, 3).unwrap();
        // Every load is past the executor and waiting for the pool
        let deadline = Instant::now() + Duration::from_secs(5);
        while loader.raw_rx.len() < 6 {
            assert!(Instant::now() < deadline, "loads did not reach the pool");
            thread::sleep(Duration::from_millis(1));
        }

        loader.preload_page(&files, 3, 3).unwrap();
        wait_until(&mut loader, |l| l.stats().cached == 6);

        let mut notified: Vec<usize> = events.try_iter().filter_map(|e| e.index()).collect();
        notified.sort_unstable();
        assert_eq!(notified, vec![3, 4, 5]);
    }

    #[test]
    fn test_focus_loads_neighbourhood() {
        let dir = tempfile::tempdir().unwrap();
        let files: Vec<PathBuf> = (0..10)
            .map(|i| write_png(&dir, &format!("{i}.png")))
            .collect();
        let mut loader = loader(20, probe(10.0));
        let events = loader.events();
        loader.set_file_list(files);

        assert!(loader.focus(5).unwrap().is_none());
        assert_eq!(loader.current_index(), 5);

        // Adjacent radius 2 around index 5
        wait_until(&mut loader, |l| (3..=7).all(|i| l.cached(i).is_some()));
        assert!(loader.cached(2).is_none());
        assert!(loader.cached(8).is_none());

        let notified: Vec<usize> = events.try_iter().filter_map(|e| e.index()).collect();
        assert_eq!(notified, vec![5]);

        assert!(loader.focus(5).unwrap().is_some());
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let mut loader = loader(4, probe(10.0));
        loader.shutdown();
        loader.shutdown();
        assert_eq!(loader.stats().raw_workers, 0);
    }
}
