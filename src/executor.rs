//! Three-tier priority executor on top of a rayon thread pool.
//!
//! Work is queued in three FIFO channels. A single dispatcher thread checks
//! high, then medium, then low and hands one job at a time to the pool, but
//! only while a worker is free. Queued work therefore stays reorderable by
//! priority until a worker can actually take it; work already handed over
//! runs to completion.

use crate::config::ExecutorConfig;
use crate::error::{ExecutorError, TaskError};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Dispatch tier. Higher tiers always leave the queue first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    /// Parse a tier name; anything unrecognised becomes `Low`.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "high" => Priority::High,
            "medium" => Priority::Medium,
            "low" => Priority::Low,
            other => {
                debug!(priority = other, "unknown priority, treating as low");
                Priority::Low
            }
        }
    }

    fn queue_index(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }
}

const QUEUED: u8 = 0;
const RUNNING: u8 = 1;
const CANCELLED: u8 = 2;

/// Lifecycle flag shared by a job and its handle.
#[derive(Debug, Clone)]
struct JobState(Arc<AtomicU8>);

impl JobState {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(QUEUED)))
    }

    fn transition(&self, to: u8) -> bool {
        self.0
            .compare_exchange(QUEUED, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn get(&self) -> u8 {
        self.0.load(Ordering::Acquire)
    }
}

struct Job {
    state: JobState,
    run: Box<dyn FnOnce() + Send>,
}

/// Cancels a queued task without access to its result.
#[derive(Debug, Clone)]
pub struct CancelToken {
    state: JobState,
}

impl CancelToken {
    /// Returns true if the task had not started and will now never run.
    pub fn cancel(&self) -> bool {
        self.state.transition(CANCELLED)
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.get() == CANCELLED
    }

    /// Whether both tokens belong to the same submission.
    pub fn same_task(&self, other: &CancelToken) -> bool {
        Arc::ptr_eq(&self.state.0, &other.state.0)
    }
}

/// Future-like handle to a submitted task.
pub struct TaskHandle<T> {
    result: Receiver<Result<T, TaskError>>,
    token: CancelToken,
}

impl<T> TaskHandle<T> {
    pub fn cancel(&self) -> bool {
        self.token.cancel()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.token.clone()
    }

    /// Whether the task has been handed to a worker.
    pub fn is_started(&self) -> bool {
        self.token.state.get() == RUNNING
    }

    /// Block until the task finishes.
    pub fn wait(self) -> Result<T, TaskError> {
        self.result.recv().unwrap_or(Err(TaskError::Cancelled))
    }
}

struct Shared {
    queues: [(Sender<Job>, Receiver<Job>); 3],
    shutdown: AtomicBool,
    in_flight: AtomicUsize,
    workers: usize,
}

impl Shared {
    fn next_job(&self) -> Option<Job> {
        self.queues.iter().find_map(|(_, rx)| rx.try_recv().ok())
    }

    fn queued(&self) -> usize {
        self.queues.iter().map(|(_, rx)| rx.len()).sum()
    }

    /// Drop everything still queued. Dropping a job closes its result
    /// channel, so waiting handles resolve as cancelled.
    fn drain(&self) -> usize {
        let mut dropped = 0;
        while let Some(job) = self.next_job() {
            if job.state.transition(CANCELLED) {
                dropped += 1;
            }
        }
        dropped
    }
}

/// Priority executor. Cloning yields another handle to the same pool.
#[derive(Clone)]
pub struct PriorityExecutor {
    shared: Arc<Shared>,
    dispatcher: Arc<Mutex<Option<JoinHandle<()>>>>,
    drain_timeout: Duration,
}

impl PriorityExecutor {
    pub fn new(workers: usize, config: &ExecutorConfig) -> Result<Self, ExecutorError> {
        let workers = workers.max(1);
        let prefix = config.thread_name;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(move |i| format!("{prefix}-{i}"))
            .build()?;

        let shared = Arc::new(Shared {
            queues: [
                crossbeam_channel::unbounded(),
                crossbeam_channel::unbounded(),
                crossbeam_channel::unbounded(),
            ],
            shutdown: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            workers,
        });

        let idle = config.idle_poll_interval;
        let dispatcher_shared = Arc::clone(&shared);
        let dispatcher = thread::Builder::new()
            .name(format!("{prefix}-dispatch"))
            .spawn(move || dispatch_loop(dispatcher_shared, pool, idle))
            .map_err(ExecutorError::Dispatcher)?;

        Ok(Self {
            shared,
            dispatcher: Arc::new(Mutex::new(Some(dispatcher))),
            drain_timeout: config.drain_timeout,
        })
    }

    /// Queue `task` at `priority` and return immediately.
    ///
    /// A panic inside the task is caught and reported through the handle.
    pub fn submit_with_priority<T, F>(
        &self,
        priority: Priority,
        task: F,
    ) -> Result<TaskHandle<T>, ExecutorError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(ExecutorError::ShutDown);
        }

        let (tx, rx) = crossbeam_channel::bounded(1);
        let state = JobState::new();
        let job = Job {
            state: state.clone(),
            run: Box::new(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(task))
                    .map_err(|payload| TaskError::Panicked(panic_message(payload)));
                // Receiver may already be gone; nobody is waiting then.
                let _ = tx.send(outcome);
            }),
        };

        self.shared.queues[priority.queue_index()]
            .0
            .send(job)
            .map_err(|_| ExecutorError::ShutDown)?;

        // Shutdown may have drained the queues between the check above and
        // the send; nothing would ever pick this job up.
        if self.shared.shutdown.load(Ordering::Acquire) {
            self.shared.drain();
        }

        Ok(TaskHandle {
            result: rx,
            token: CancelToken { state },
        })
    }

    pub fn workers(&self) -> usize {
        self.shared.workers
    }

    /// Tasks queued but not yet handed to a worker.
    pub fn queued(&self) -> usize {
        self.shared.queued()
    }

    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Stop dispatching and wait for running tasks (up to the drain
    /// timeout). Queued tasks resolve as cancelled. Safe to call twice.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(handle) = self.dispatcher.lock().take() {
            if handle.join().is_err() {
                warn!("executor dispatcher panicked");
            }
        }

        let dropped = self.shared.drain();

        let deadline = Instant::now() + self.drain_timeout;
        while self.in_flight() > 0 {
            if Instant::now() >= deadline {
                warn!(
                    in_flight = self.in_flight(),
                    "executor drain timed out, abandoning running tasks"
                );
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        debug!(dropped, "executor shut down");
    }
}

fn dispatch_loop(shared: Arc<Shared>, pool: rayon::ThreadPool, idle: Duration) {
    while !shared.shutdown.load(Ordering::Acquire) {
        if shared.in_flight.load(Ordering::Acquire) >= shared.workers {
            thread::sleep(idle);
            continue;
        }

        let job = match shared.next_job() {
            Some(job) => job,
            None => {
                thread::sleep(idle);
                continue;
            }
        };

        // Lost the race against cancel()
        if !job.state.transition(RUNNING) {
            continue;
        }

        shared.in_flight.fetch_add(1, Ordering::AcqRel);
        let worker_shared = Arc::clone(&shared);
        pool.spawn(move || {
            (job.run)();
            worker_shared.in_flight.fetch_sub(1, Ordering::AcqRel);
        });
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
