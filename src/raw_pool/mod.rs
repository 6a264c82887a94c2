//! Out-of-process RAW decoding.
//!
//! Each worker slot is served by a link thread on the pool side. Links pull
//! requests from one shared queue, exchange them with their worker and push
//! completions onto one shared output queue. The control thread owns the
//! pending-callback table and drains completions with
//! [`RawDecoderPool::process_results`].

pub mod develop;
pub mod protocol;
pub mod transport;
pub mod worker;

pub use develop::{RawDeveloper, RawloaderDeveloper};
pub use protocol::{DecodeResult, DecodedPixels, TaskId};
pub use transport::{
    ChildProcessLauncher, DeveloperFactory, InProcessLauncher, WorkerKiller, WorkerLauncher,
    WorkerTransport, WORKER_FLAG,
};

use crate::config::DecoderPoolConfig;
use crate::error::PoolError;
use crossbeam_channel::{Receiver, Sender};
use protocol::{DecodeRequest, WorkerReply};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Invoked exactly once with the task's completion.
pub type DecodeCallback = Box<dyn FnOnce(DecodeResult) + Send>;

enum Command {
    Decode(DecodeRequest),
    Stop,
}

/// Everything a link thread needs besides its transport.
struct LinkContext {
    slot: usize,
    input_tx: Sender<Command>,
    input_rx: Receiver<Command>,
    output_tx: Sender<DecodeResult>,
    done_tx: Sender<usize>,
    live: Arc<AtomicUsize>,
    config: DecoderPoolConfig,
}

pub struct RawDecoderPool {
    input_tx: Sender<Command>,
    input_rx: Receiver<Command>,
    output_tx: Sender<DecodeResult>,
    output_rx: Receiver<DecodeResult>,
    done_tx: Sender<usize>,
    done_rx: Receiver<usize>,
    pending: HashMap<TaskId, DecodeCallback>,
    next_task_id: TaskId,
    links: Vec<(usize, JoinHandle<()>)>,
    killers: Vec<WorkerKiller>,
    live: Arc<AtomicUsize>,
    config: DecoderPoolConfig,
    shut_down: bool,
}

impl RawDecoderPool {
    /// Start up to `workers` workers. Slots whose worker fails to start are
    /// skipped, so the pool may come up degraded or with no workers at all.
    pub fn new(workers: usize, launcher: &dyn WorkerLauncher, config: DecoderPoolConfig) -> Self {
        let mut pool = Self::idle(config);
        for slot in 0..workers {
            pool.start_link(slot, launcher);
        }

        let live = pool.live_workers();
        if live < workers {
            warn!(requested = workers, live, "RAW decoder pool running degraded");
        } else {
            info!(workers = live, "RAW decoder pool started");
        }
        pool
    }

    fn idle(config: DecoderPoolConfig) -> Self {
        let (input_tx, input_rx) = crossbeam_channel::unbounded();
        let (output_tx, output_rx) = crossbeam_channel::unbounded();
        let (done_tx, done_rx) = crossbeam_channel::unbounded();
        Self {
            input_tx,
            input_rx,
            output_tx,
            output_rx,
            done_tx,
            done_rx,
            pending: HashMap::new(),
            next_task_id: 1,
            links: Vec::new(),
            killers: Vec::new(),
            live: Arc::new(AtomicUsize::new(0)),
            config,
            shut_down: false,
        }
    }

    fn start_link(&mut self, slot: usize, launcher: &dyn WorkerLauncher) {
        let transport = match launcher.launch(slot) {
            Ok(transport) => transport,
            Err(err) => {
                warn!(slot, error = %err, "decoder worker failed to start, continuing without it");
                return;
            }
        };
        let killer = transport.killer();

        let ctx = LinkContext {
            slot,
            input_tx: self.input_tx.clone(),
            input_rx: self.input_rx.clone(),
            output_tx: self.output_tx.clone(),
            done_tx: self.done_tx.clone(),
            live: Arc::clone(&self.live),
            config: self.config.clone(),
        };

        self.live.fetch_add(1, Ordering::AcqRel);
        // The transport moves into the thread; a spawn failure drops it,
        // which leaves the worker to exit on its closed stdin.
        match thread::Builder::new()
            .name(format!("photocull-raw-{slot}"))
            .spawn(move || run_link(transport, ctx))
        {
            Ok(handle) => {
                self.links.push((slot, handle));
                self.killers.extend(killer);
            }
            Err(err) => {
                self.live.fetch_sub(1, Ordering::AcqRel);
                if let Some(killer) = killer {
                    killer.kill();
                }
                warn!(slot, error = %err, "failed to spawn decoder link thread");
            }
        }
    }

    /// Queue a full decode of `path`. Returns immediately; `callback` runs on
    /// the thread that later calls [`process_results`](Self::process_results).
    pub fn decode_raw(&mut self, path: PathBuf, callback: DecodeCallback) -> TaskId {
        let task_id = self.next_task_id;
        self.next_task_id += 1;
        self.pending.insert(task_id, callback);

        if self.shut_down || self.live_workers() == 0 {
            debug!(task_id, path = %path.display(), "no decoder workers, failing task");
            // Both ends are owned by the pool, so this cannot fail.
            let _ = self
                .output_tx
                .send(DecodeResult::failed(task_id, "no RAW decoder workers available"));
            return task_id;
        }

        debug!(task_id, path = %path.display(), "queued RAW decode");
        let _ = self
            .input_tx
            .send(Command::Decode(DecodeRequest::new(task_id, path)));
        task_id
    }

    /// Deliver up to `max_results` completions to their callbacks. Returns
    /// how many completions were drained.
    pub fn process_results(&mut self, max_results: usize) -> usize {
        if self.live_workers() == 0 {
            self.fail_stranded();
        }

        let mut drained = 0;
        while drained < max_results {
            let Ok(result) = self.output_rx.try_recv() else {
                break;
            };
            drained += 1;
            match self.pending.remove(&result.task_id) {
                Some(callback) => callback(result),
                None => warn!(task_id = result.task_id, "dropping result for unknown decode task"),
            }
        }
        drained
    }

    /// Requests left in the queue after the last worker went away.
    fn fail_stranded(&mut self) {
        while let Ok(command) = self.input_rx.try_recv() {
            if let Command::Decode(request) = command {
                let _ = self.output_tx.send(DecodeResult::failed(
                    request.task_id,
                    "all RAW decoder workers were lost",
                ));
            }
        }
    }

    pub fn live_workers(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Callbacks still waiting for a completion.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Drop queued work, stop every worker and release the channels' contents.
    /// Safe to call more than once.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        let dropped = self
            .input_rx
            .try_iter()
            .filter(|command| matches!(command, Command::Decode(_)))
            .count();
        for _ in &self.links {
            let _ = self.input_tx.send(Command::Stop);
        }

        let mut stopped = HashSet::new();
        let deadline = Instant::now() + self.config.shutdown_grace * 2;
        self.collect_stopped(&mut stopped, deadline);

        if stopped.len() < self.links.len() {
            warn!(
                stuck = self.links.len() - stopped.len(),
                "decoder workers did not stop in time, killing them"
            );
            for killer in &self.killers {
                killer.kill();
            }
            let deadline = Instant::now() + self.config.shutdown_grace;
            self.collect_stopped(&mut stopped, deadline);
        }

        for (slot, handle) in self.links.drain(..) {
            if !stopped.contains(&slot) {
                // Still blocked inside a decode; leave the thread detached.
                continue;
            }
            if handle.join().is_err() {
                warn!(slot, "decoder link thread panicked");
            }
        }

        let abandoned = self.pending.len();
        self.pending.clear();
        self.killers.clear();
        while self.input_rx.try_recv().is_ok() {}
        while self.output_rx.try_recv().is_ok() {}
        info!(dropped, abandoned, "RAW decoder pool shut down");
    }

    fn collect_stopped(&self, stopped: &mut HashSet<usize>, deadline: Instant) {
        while stopped.len() < self.links.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.done_rx.recv_timeout(remaining) {
                Ok(slot) => {
                    stopped.insert(slot);
                }
                Err(_) => break,
            }
        }
    }
}

impl Drop for RawDecoderPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_link(mut transport: Box<dyn WorkerTransport>, ctx: LinkContext) {
    let slot = ctx.slot;
    let lost = serve_link(transport.as_mut(), &ctx);
    if let Some((task_id, reason)) = &lost {
        lose_worker(&ctx, *task_id, reason);
    }

    // Also reaps a worker that broke the protocol or died
    transport.terminate(ctx.config.shutdown_grace);
    if lost.is_none() {
        ctx.live.fetch_sub(1, Ordering::AcqRel);
    }
    let _ = ctx.done_tx.send(slot);
    debug!(slot, "decoder link stopped");
}

/// Feed requests to the worker until told to stop. Returns the task that
/// was in flight when the worker was lost, with the reason.
fn serve_link(
    transport: &mut dyn WorkerTransport,
    ctx: &LinkContext,
) -> Option<(TaskId, String)> {
    let slot = ctx.slot;
    loop {
        let mut request = match ctx.input_rx.recv() {
            Ok(Command::Decode(request)) => request,
            Ok(Command::Stop) | Err(_) => return None,
        };

        match transport.exchange(&request) {
            Ok(WorkerReply::Done(result)) => {
                if ctx.output_tx.send(result).is_err() {
                    return None;
                }
            }
            Ok(WorkerReply::Deferred { memory_percent, .. }) => {
                request.attempt += 1;
                let delay = ctx.config.retry.delay_for(request.attempt);
                debug!(
                    slot,
                    task_id = request.task_id,
                    attempt = request.attempt,
                    memory_percent,
                    delay_ms = delay.as_millis() as u64,
                    "worker deferred decode, requeueing"
                );
                thread::sleep(delay);
                if ctx.input_tx.send(Command::Decode(request)).is_err() {
                    return None;
                }
            }
            // Nothing reached the worker; only this task fails
            Err(PoolError::Encode(reason)) => {
                warn!(slot, task_id = request.task_id, %reason, "cannot send decode request");
                if ctx
                    .output_tx
                    .send(DecodeResult::failed(request.task_id, reason))
                    .is_err()
                {
                    return None;
                }
            }
            Ok(WorkerReply::Ready) => {
                return Some((request.task_id, "unexpected ready message".to_string()))
            }
            Err(err) => return Some((request.task_id, err.to_string())),
        }
    }
}

/// The worker is gone: fail its in-flight task and leave the pool degraded.
fn lose_worker(ctx: &LinkContext, task_id: TaskId, reason: &str) {
    let remaining = ctx.live.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
    warn!(slot = ctx.slot, task_id, reason, remaining, "decoder worker lost");
    let _ = ctx.output_tx.send(DecodeResult::failed(
        task_id,
        format!("decoder worker lost: {reason}"),
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::system::{FixedProbe, HostStats, SystemProbe};
    use std::path::Path;
    use std::time::Duration;

    /// 1x1 pixel whose value is the file name's length.
    struct Fake;

    impl RawDeveloper for Fake {
        fn develop(&mut self, path: &Path) -> Result<DecodedPixels, String> {
            let name = path.file_name().map(|n| n.len()).unwrap_or(0) as u8;
            if path.to_string_lossy().contains("corrupt") {
                return Err("corrupt sensor data".into());
            }
            Ok(DecodedPixels {
                width: 1,
                height: 1,
                channels: 4,
                data: vec![name, name, name, 255],
            })
        }
    }

    fn config() -> DecoderPoolConfig {
        DecoderPoolConfig {
            retry: RetryPolicy {
                initial_delay: Duration::from_millis(5),
                factor: 2,
                max_delay: Duration::from_millis(20),
            },
            shutdown_grace: Duration::from_millis(200),
            ..DecoderPoolConfig::default()
        }
    }

    fn probe(percent: f64) -> Arc<FixedProbe> {
        Arc::new(FixedProbe::new(
            HostStats {
                total_memory_bytes: 16 << 30,
                physical_cores: 8,
                logical_cores: 16,
            },
            percent,
        ))
    }

    fn launcher(probe: Arc<dyn SystemProbe>, failing_slots: &'static [usize]) -> InProcessLauncher {
        let factory: DeveloperFactory = Arc::new(move |slot: usize| {
            if failing_slots.contains(&slot) {
                Err(format!("slot {slot} could not load codecs"))
            } else {
                Ok(Box::new(Fake) as Box<dyn RawDeveloper>)
            }
        });
        InProcessLauncher::new(factory, probe, 95.0)
    }

    fn collector() -> (
        impl Fn() -> DecodeCallback,
        crossbeam_channel::Receiver<DecodeResult>,
    ) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let make = move || {
            let tx = tx.clone();
            Box::new(move |result: DecodeResult| {
                let _ = tx.send(result);
            }) as DecodeCallback
        };
        (make, rx)
    }

    /// Poll the pool until `expected` completions were delivered.
    fn pump(pool: &mut RawDecoderPool, expected: usize) -> usize {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut delivered = 0;
        while delivered < expected && Instant::now() < deadline {
            delivered += pool.process_results(8);
            thread::sleep(Duration::from_millis(2));
        }
        delivered
    }

    #[test]
    fn test_task_ids_strictly_increase() {
        let mut pool = RawDecoderPool::new(1, &launcher(probe(10.0), &[]), config());
        let (callback, _rx) = collector();
        let a = pool.decode_raw(PathBuf::from("a.nef"), callback());
        let b = pool.decode_raw(PathBuf::from("b.nef"), callback());
        let c = pool.decode_raw(PathBuf::from("c.nef"), callback());
        assert!(a < b && b < c);
        pool.shutdown();
    }

    #[test]
    fn test_results_reach_their_callbacks() {
        let mut pool = RawDecoderPool::new(2, &launcher(probe(10.0), &[]), config());
        let (callback, rx) = collector();

        let ok = pool.decode_raw(PathBuf::from("/raw/abc.nef"), callback());
        let bad = pool.decode_raw(PathBuf::from("/raw/corrupt.nef"), callback());
        assert_eq!(pump(&mut pool, 2), 2);
        assert_eq!(pool.pending_len(), 0);

        let mut results: Vec<_> = rx.try_iter().collect();
        results.sort_by_key(|r| r.task_id);
        assert_eq!(results[0].task_id, ok);
        assert_eq!(results[0].outcome.as_ref().unwrap().data, vec![7, 7, 7, 255]);
        assert_eq!(results[1], DecodeResult::failed(bad, "corrupt sensor data"));
        pool.shutdown();
    }

    #[test]
    fn test_correlation_with_permuted_delivery() {
        let mut pool = RawDecoderPool::idle(config());
        // Pretend a worker is attached so requests are queued, not failed.
        pool.live.store(1, Ordering::Release);

        let mut receivers = Vec::new();
        let mut ids = Vec::new();
        for name in ["a.nef", "b.nef", "c.nef"] {
            let (tx, rx) = crossbeam_channel::bounded(1);
            ids.push(pool.decode_raw(
                PathBuf::from(name),
                Box::new(move |r: DecodeResult| {
                    let _ = tx.send(r);
                }),
            ));
            receivers.push(rx);
        }

        for &at in &[2, 0, 1] {
            pool.output_tx
                .send(DecodeResult::failed(ids[at], format!("result {at}")))
                .unwrap();
        }
        assert_eq!(pool.process_results(10), 3);

        for (at, rx) in receivers.iter().enumerate() {
            let result = rx.try_recv().unwrap();
            assert_eq!(result.task_id, ids[at]);
            assert_eq!(result.outcome, Err(format!("result {at}")));
            assert!(rx.try_recv().is_err(), "callback fires once");
        }
        assert_eq!(pool.pending_len(), 0);
        pool.live.store(0, Ordering::Release);
    }

    #[test]
    fn test_process_results_respects_max() {
        let mut pool = RawDecoderPool::idle(config());
        pool.live.store(1, Ordering::Release);
        let (callback, rx) = collector();
        let ids: Vec<_> = (0..5)
            .map(|i| pool.decode_raw(PathBuf::from(format!("{i}.nef")), callback()))
            .collect();
        for id in &ids {
            pool.output_tx.send(DecodeResult::failed(*id, "x")).unwrap();
        }

        assert_eq!(pool.process_results(2), 2);
        assert_eq!(rx.len(), 2);
        assert_eq!(pool.process_results(10), 3);
        assert_eq!(rx.len(), 5);
        pool.live.store(0, Ordering::Release);
    }

    #[test]
    fn test_unknown_task_id_is_dropped() {
        let mut pool = RawDecoderPool::idle(config());
        pool.output_tx.send(DecodeResult::failed(999, "late")).unwrap();
        assert_eq!(pool.process_results(4), 1);
        assert_eq!(pool.pending_len(), 0);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let mut pool = RawDecoderPool::new(2, &launcher(probe(10.0), &[]), config());
        assert_eq!(pool.live_workers(), 2);

        pool.shutdown();
        assert!(pool.is_shut_down());
        assert_eq!(pool.live_workers(), 0);
        pool.shutdown();

        // Requests after shutdown fail instead of hanging
        let (callback, rx) = collector();
        let id = pool.decode_raw(PathBuf::from("late.nef"), callback());
        assert_eq!(pool.process_results(4), 1);
        let result = rx.try_recv().unwrap();
        assert_eq!(result.task_id, id);
        assert!(!result.success());
    }

    #[test]
    fn test_degraded_pool_keeps_working() {
        let mut pool = RawDecoderPool::new(2, &launcher(probe(10.0), &[0]), config());
        assert_eq!(pool.live_workers(), 1);

        let (callback, rx) = collector();
        for name in ["one.nef", "two.nef", "three.nef"] {
            pool.decode_raw(PathBuf::from(name), callback());
        }
        assert_eq!(pump(&mut pool, 3), 3);
        assert!(rx.try_iter().all(|r| r.success()));
        pool.shutdown();
    }

    #[test]
    fn test_zero_workers_fail_immediately() {
        let mut pool = RawDecoderPool::new(2, &launcher(probe(10.0), &[0, 1]), config());
        assert_eq!(pool.live_workers(), 0);

        let (callback, rx) = collector();
        pool.decode_raw(PathBuf::from("a.nef"), callback());
        assert_eq!(pool.process_results(4), 1);
        assert!(!rx.try_recv().unwrap().success());
    }

    #[test]
    fn test_deferred_request_is_retried() {
        let probe = probe(97.0);
        let mut pool = RawDecoderPool::new(1, &launcher(probe.clone(), &[]), config());
        let (callback, rx) = collector();
        pool.decode_raw(PathBuf::from("big.nef"), callback());

        thread::sleep(Duration::from_millis(50));
        assert_eq!(pool.process_results(4), 0, "nothing decodes under severe pressure");
        assert_eq!(pool.pending_len(), 1);

        probe.set_memory_percent(40.0);
        assert_eq!(pump(&mut pool, 1), 1);
        assert!(rx.try_recv().unwrap().success());
        pool.shutdown();
    }

    /// Fails every exchange as if the process had died.
    struct Vanishing {
        terminated: Arc<AtomicUsize>,
    }

    impl WorkerTransport for Vanishing {
        fn exchange(&mut self, _request: &DecodeRequest) -> Result<WorkerReply, PoolError> {
            Err(PoolError::Disconnected)
        }

        fn terminate(&mut self, _grace: Duration) {
            self.terminated.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct VanishingLauncher {
        terminated: Arc<AtomicUsize>,
    }

    impl WorkerLauncher for VanishingLauncher {
        fn launch(&self, _slot: usize) -> Result<Box<dyn WorkerTransport>, PoolError> {
            Ok(Box::new(Vanishing {
                terminated: Arc::clone(&self.terminated),
            }))
        }
    }

    #[test]
    fn test_lost_worker_fails_in_flight_task() {
        let terminated = Arc::new(AtomicUsize::new(0));
        let launcher = VanishingLauncher {
            terminated: Arc::clone(&terminated),
        };
        let mut pool = RawDecoderPool::new(1, &launcher, config());
        let (callback, rx) = collector();
        let id = pool.decode_raw(PathBuf::from("a.nef"), callback());

        assert_eq!(pump(&mut pool, 1), 1);
        let result = rx.try_recv().unwrap();
        assert_eq!(result.task_id, id);
        assert!(result.outcome.unwrap_err().contains("worker lost"));
        assert_eq!(pool.live_workers(), 0);

        // The dead worker is reaped, not just forgotten
        let deadline = Instant::now() + Duration::from_secs(5);
        while terminated.load(Ordering::SeqCst) == 0 {
            assert!(Instant::now() < deadline, "lost worker was never terminated");
            thread::sleep(Duration::from_millis(1));
        }

        // No respawn: the next request fails straight away
        pool.decode_raw(PathBuf::from("b.nef"), callback());
        assert_eq!(pool.process_results(4), 1);
        assert!(!rx.try_recv().unwrap().success());
        pool.shutdown();
        assert_eq!(terminated.load(Ordering::SeqCst), 1);
    }

    /// Refuses to send paths containing "unencodable", decodes the rest.
    struct Picky;

    impl WorkerTransport for Picky {
        fn exchange(&mut self, request: &DecodeRequest) -> Result<WorkerReply, PoolError> {
            if request.path.to_string_lossy().contains("unencodable") {
                return Err(PoolError::Encode("bad path".into()));
            }
            Ok(WorkerReply::Done(DecodeResult {
                task_id: request.task_id,
                outcome: Ok(DecodedPixels {
                    width: 1,
                    height: 1,
                    channels: 1,
                    data: vec![0],
                }),
            }))
        }

        fn terminate(&mut self, _grace: Duration) {}
    }

    struct PickyLauncher;

    impl WorkerLauncher for PickyLauncher {
        fn launch(&self, _slot: usize) -> Result<Box<dyn WorkerTransport>, PoolError> {
            Ok(Box::new(Picky))
        }
    }

    #[test]
    fn test_unencodable_request_fails_only_its_task() {
        let mut pool = RawDecoderPool::new(1, &PickyLauncher, config());
        let (callback, rx) = collector();
        let bad = pool.decode_raw(PathBuf::from("unencodable.nef"), callback());
        let good = pool.decode_raw(PathBuf::from("fine.nef"), callback());

        assert_eq!(pump(&mut pool, 2), 2);
        let mut results: Vec<_> = rx.try_iter().collect();
        results.sort_by_key(|r| r.task_id);
        assert_eq!(results[0], DecodeResult::failed(bad, "bad path"));
        assert_eq!(results[1].task_id, good);
        assert!(results[1].success());
        assert_eq!(pool.live_workers(), 1);
        pool.shutdown();
    }
}
