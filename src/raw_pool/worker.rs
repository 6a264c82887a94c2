//! The decode loop that runs inside each worker.
//!
//! The same [`WorkerSession`] backs both out-of-process workers (driven by
//! [`serve`] over stdin/stdout) and in-process workers.

use super::develop::{develop_guarded, RawDeveloper, RawloaderDeveloper};
use super::protocol::{self, DecodeResult, Request, TaskId, WorkerReply};
use crate::config::DecoderPoolConfig;
use crate::error::PoolError;
use crate::system::{SysinfoProbe, SystemProbe};
use std::io::{self, BufRead, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Per-worker decode state. Holds no data between requests.
pub struct WorkerSession {
    developer: Box<dyn RawDeveloper>,
    probe: Arc<dyn SystemProbe>,
    severe_memory_percent: f64,
}

impl WorkerSession {
    pub fn new(
        developer: Box<dyn RawDeveloper>,
        probe: Arc<dyn SystemProbe>,
        severe_memory_percent: f64,
    ) -> Self {
        Self {
            developer,
            probe,
            severe_memory_percent,
        }
    }

    /// Decode one file, or hand it back when memory is too tight.
    pub fn handle(&mut self, task_id: TaskId, path: &Path) -> WorkerReply {
        let memory_percent = self.probe.memory_percent();
        if memory_percent > self.severe_memory_percent {
            debug!(task_id, memory_percent, "deferring decode under memory pressure");
            return WorkerReply::Deferred {
                task_id,
                memory_percent,
            };
        }

        let outcome = develop_guarded(self.developer.as_mut(), path);
        if let Err(error) = &outcome {
            debug!(task_id, path = %path.display(), %error, "RAW decode failed");
        }
        WorkerReply::Done(DecodeResult { task_id, outcome })
    }
}

/// Answer requests until the shutdown sentinel or end of input.
pub fn serve<R: BufRead, W: Write>(
    reader: &mut R,
    writer: &mut W,
    session: &mut WorkerSession,
) -> Result<(), PoolError> {
    loop {
        match protocol::read_request(reader)? {
            None | Some(Request::Shutdown) => return Ok(()),
            Some(Request::Decode { task_id, path }) => {
                let reply = session.handle(task_id, &path);
                protocol::write_reply(writer, &reply)?;
                // Pixel buffer is released as soon as it has been sent.
                drop(reply);
            }
        }
    }
}

/// Entry point for `--decode-worker` processes. Stdout carries the wire
/// protocol; logging must go to stderr.
pub fn run_worker_process(config: &DecoderPoolConfig) -> Result<(), PoolError> {
    let developer = RawloaderDeveloper::initialize().map_err(PoolError::Init)?;
    let probe: Arc<dyn SystemProbe> = Arc::new(SysinfoProbe::new());
    let mut session = WorkerSession::new(Box::new(developer), probe, config.severe_memory_percent);

    let stdin = io::stdin();
    let mut reader = stdin.lock();
    let mut writer = BufWriter::new(io::stdout().lock());

    protocol::write_reply(&mut writer, &WorkerReply::Ready)?;
    info!(pid = std::process::id(), "decoder worker ready");

    let result = serve(&mut reader, &mut writer, &mut session);
    if let Err(err) = &result {
        warn!(error = %err, "decoder worker stopping on error");
    }
    result
}
