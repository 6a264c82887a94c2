//! How the pool reaches its workers.
//!
//! [`ChildProcessLauncher`] re-executes the current binary with
//! `--decode-worker` and talks to it over pipes. [`InProcessLauncher`] runs
//! the same [`WorkerSession`] on the pool's own link thread, for platforms or
//! tests where spawning processes is not wanted.

use super::develop::RawDeveloper;
use super::protocol::{self, DecodeRequest, Request, WorkerReply};
use super::worker::WorkerSession;
use crate::error::PoolError;
use crate::system::SystemProbe;
use parking_lot::Mutex;
use std::ffi::OsString;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Flag that makes the binary act as a decoder worker.
pub const WORKER_FLAG: &str = "--decode-worker";

/// One connected worker, driven by exactly one link thread.
pub trait WorkerTransport: Send {
    /// Send one request and wait for its reply.
    fn exchange(&mut self, request: &DecodeRequest) -> Result<WorkerReply, PoolError>;

    /// Ask the worker to stop, killing it if it has not exited after `grace`.
    fn terminate(&mut self, grace: Duration);

    /// Handle that can kill the worker from another thread while an
    /// exchange is blocked.
    fn killer(&self) -> Option<WorkerKiller> {
        None
    }
}

/// Starts workers for pool slots.
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, slot: usize) -> Result<Box<dyn WorkerTransport>, PoolError>;
}

/// Force-terminates a worker.
#[derive(Clone)]
pub struct WorkerKiller(Arc<dyn Fn() + Send + Sync>);

impl WorkerKiller {
    pub fn kill(&self) {
        (self.0)()
    }
}

pub struct ChildProcessLauncher {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ChildProcessLauncher {
    pub fn new(program: PathBuf, args: Vec<OsString>) -> Self {
        Self { program, args }
    }

    /// Workers run the current executable in worker mode.
    pub fn current_exe() -> Result<Self, PoolError> {
        let program = std::env::current_exe().map_err(PoolError::Spawn)?;
        Ok(Self::new(program, vec![OsString::from(WORKER_FLAG)]))
    }

    /// Start the process and wait for its ready line.
    fn spawn(&self, slot: usize) -> Result<ChildProcessTransport, PoolError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(PoolError::Spawn)?;

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(PoolError::Init("worker pipes unavailable".into()));
            }
        };

        let mut transport = ChildProcessTransport {
            child: Arc::new(Mutex::new(child)),
            stdin: Some(BufWriter::new(stdin)),
            stdout: BufReader::new(stdout),
        };

        // A worker whose decode stack fails to load exits before this.
        match protocol::read_reply(&mut transport.stdout) {
            Ok(WorkerReply::Ready) => {
                debug!(slot, pid = transport.pid(), "decoder worker process started");
                Ok(transport)
            }
            Ok(other) => {
                transport.kill_now();
                Err(PoolError::Protocol(format!("expected ready, got {other:?}")))
            }
            Err(err) => {
                transport.kill_now();
                Err(PoolError::Init(err.to_string()))
            }
        }
    }
}

impl WorkerLauncher for ChildProcessLauncher {
    fn launch(&self, slot: usize) -> Result<Box<dyn WorkerTransport>, PoolError> {
        Ok(Box::new(self.spawn(slot)?))
    }
}

pub struct ChildProcessTransport {
    child: Arc<Mutex<Child>>,
    stdin: Option<BufWriter<ChildStdin>>,
    stdout: BufReader<ChildStdout>,
}

impl ChildProcessTransport {
    fn pid(&self) -> u32 {
        self.child.lock().id()
    }

    fn kill_now(&mut self) {
        self.stdin = None;
        let mut child = self.child.lock();
        let _ = child.kill();
        let _ = child.wait();
    }
}

impl WorkerTransport for ChildProcessTransport {
    fn exchange(&mut self, request: &DecodeRequest) -> Result<WorkerReply, PoolError> {
        let stdin = self.stdin.as_mut().ok_or(PoolError::Disconnected)?;
        protocol::write_request(
            stdin,
            &Request::Decode {
                task_id: request.task_id,
                path: request.path.clone(),
            },
        )?;
        protocol::read_reply(&mut self.stdout)
    }

    fn terminate(&mut self, grace: Duration) {
        if let Some(mut stdin) = self.stdin.take() {
            // The worker may already be gone; closing the pipe is enough then.
            let _ = protocol::write_request(&mut stdin, &Request::Shutdown);
        }

        let deadline = Instant::now() + grace;
        loop {
            let status = self.child.lock().try_wait();
            match status {
                Ok(Some(_)) => return,
                Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
                _ => break,
            }
        }

        warn!(pid = self.pid(), "decoder worker did not exit in time, killing it");
        self.kill_now();
    }

    fn killer(&self) -> Option<WorkerKiller> {
        let child = Arc::clone(&self.child);
        Some(WorkerKiller(Arc::new(move || {
            let _ = child.lock().kill();
        })))
    }
}

/// Builds the developer for a slot; an error means that worker failed to
/// initialise.
pub type DeveloperFactory =
    Arc<dyn Fn(usize) -> Result<Box<dyn RawDeveloper>, String> + Send + Sync>;

pub struct InProcessLauncher {
    factory: DeveloperFactory,
    probe: Arc<dyn SystemProbe>,
    severe_memory_percent: f64,
}

impl InProcessLauncher {
    pub fn new(
        factory: DeveloperFactory,
        probe: Arc<dyn SystemProbe>,
        severe_memory_percent: f64,
    ) -> Self {
        Self {
            factory,
            probe,
            severe_memory_percent,
        }
    }
}

impl WorkerLauncher for InProcessLauncher {
    fn launch(&self, slot: usize) -> Result<Box<dyn WorkerTransport>, PoolError> {
        let developer = (self.factory)(slot).map_err(PoolError::Init)?;
        let session = WorkerSession::new(
            developer,
            Arc::clone(&self.probe),
            self.severe_memory_percent,
        );
        Ok(Box::new(InProcessTransport { session }))
    }
}

struct InProcessTransport {
    session: WorkerSession,
}

impl WorkerTransport for InProcessTransport {
    fn exchange(&mut self, request: &DecodeRequest) -> Result<WorkerReply, PoolError> {
        Ok(self.session.handle(request.task_id, &request.path))
    }

    fn terminate(&mut self, _grace: Duration) {}
}
