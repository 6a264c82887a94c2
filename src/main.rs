//! photocull - headless driver for the image-serving core.
//!
//! Scans a directory, loads one page of images through the loader and prints
//! a JSON summary. The same binary hosts the RAW decoder workers when started
//! with `--decode-worker`.

use clap::Parser;
use photocull::config::Config;
use photocull::decode::{scan_directory, Decoder};
use photocull::raw_pool::{
    self, ChildProcessLauncher, DeveloperFactory, InProcessLauncher, RawDeveloper,
    RawloaderDeveloper, WorkerLauncher,
};
use photocull::system::{SysinfoProbe, SystemProbe};
use photocull::{
    HardwareProfileManager, ImageLoader, LoadEvent, LoaderStats, PerformanceProfile, RawStrategy,
};
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "photocull")]
#[command(about = "Image-serving core of a photo culling tool", long_about = None)]
struct Args {
    #[arg(default_value = ".")]
    directory: PathBuf,

    /// Performance profile to use instead of the detected one
    #[arg(long)]
    profile: Option<String>,

    /// First index of the page to load
    #[arg(long, default_value_t = 0)]
    start: usize,

    /// Number of images in the page
    #[arg(long, default_value_t = 20)]
    count: usize,

    /// Develop RAW files on threads of this process instead of worker processes
    #[arg(long)]
    in_process_raw: bool,

    /// JSON file mapping camera models to "preview" or "decode"; updated on exit
    #[arg(long)]
    strategies: Option<PathBuf>,

    /// Seconds to wait for the page to finish loading
    #[arg(long, default_value_t = 60)]
    timeout: u64,

    /// Run as a RAW decoder worker speaking the pool protocol on stdin/stdout
    #[arg(long = "decode-worker", hide = true)]
    decode_worker: bool,
}

#[derive(Debug, Default, Serialize)]
struct PageSummary {
    profile: &'static str,
    requested: usize,
    loaded: usize,
    failed: usize,
    incompatible: usize,
    elapsed_ms: u64,
    stats: LoaderStats,
}

/// Logs go to stderr: stdout carries the summary, or the wire protocol in
/// worker mode.
fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() {
    let args = Args::parse();
    init_logging();
    let config = Config::default();

    if args.decode_worker {
        if let Err(err) = raw_pool::worker::run_worker_process(&config.decoder) {
            error!(error = %err, "decoder worker failed");
            std::process::exit(1);
        }
        return;
    }

    let dir = args.directory.canonicalize().unwrap_or_else(|_| {
        eprintln!(
            "Error: Cannot access directory '{}'",
            args.directory.display()
        );
        std::process::exit(1);
    });

    if !dir.is_dir() {
        eprintln!("Error: '{}' is not a directory", dir.display());
        std::process::exit(1);
    }

    let decoder = Decoder::new(config.loader.raw_extensions.clone());
    let paths = scan_directory(&dir, &decoder);

    if paths.is_empty() {
        eprintln!(
            "No supported images found in '{}'\nSupported formats: {:?}",
            dir.display(),
            decoder.extensions()
        );
        std::process::exit(1);
    }

    let probe: Arc<dyn SystemProbe> = Arc::new(SysinfoProbe::new());
    let mut profiles = HardwareProfileManager::initialize(probe.as_ref());
    if let Some(name) = &args.profile {
        if let Err(err) = profiles.set_profile_manually(name) {
            eprintln!(
                "Error: {err}\nKnown profiles: {:?}",
                PerformanceProfile::names().collect::<Vec<_>>()
            );
            std::process::exit(1);
        }
    }

    let launcher = raw_launcher(args.in_process_raw, &config, &probe);
    let mut loader = match ImageLoader::new(
        profiles.profile(),
        &config,
        Arc::clone(&probe),
        launcher.as_ref(),
    ) {
        Ok(loader) => loader,
        Err(err) => {
            eprintln!("Error: failed to start image loader: {err}");
            std::process::exit(1);
        }
    };

    if let Some(file) = &args.strategies {
        load_strategies(file, &loader);
    }

    let summary = match run_page(
        &mut loader,
        &paths,
        args.start,
        args.count,
        Duration::from_secs(args.timeout),
    ) {
        Ok(summary) => summary,
        Err(err) => {
            eprintln!("Error: {err}");
            std::process::exit(1);
        }
    };

    if let Some(file) = &args.strategies {
        save_strategies(file, &loader);
    }
    loader.shutdown();

    match serde_json::to_string_pretty(&summary) {
        Ok(json) => println!("{json}"),
        Err(err) => error!(error = %err, "failed to serialize summary"),
    }
}

fn raw_launcher(
    in_process: bool,
    config: &Config,
    probe: &Arc<dyn SystemProbe>,
) -> Box<dyn WorkerLauncher> {
    if !in_process {
        match ChildProcessLauncher::current_exe() {
            Ok(launcher) => return Box::new(launcher),
            Err(err) => warn!(error = %err, "cannot re-execute self, decoding RAW in-process"),
        }
    }

    let factory: DeveloperFactory = Arc::new(|_slot: usize| {
        RawloaderDeveloper::initialize().map(|d| Box::new(d) as Box<dyn RawDeveloper>)
    });
    Box::new(InProcessLauncher::new(
        factory,
        Arc::clone(probe),
        config.decoder.severe_memory_percent,
    ))
}

/// Load the page, make its first image current and wait for every
/// requested image to be reported.
fn run_page(
    loader: &mut ImageLoader,
    paths: &[PathBuf],
    start: usize,
    count: usize,
    timeout: Duration,
) -> Result<PageSummary, photocull::error::LoaderError> {
    let started = Instant::now();
    let events = loader.events();

    let plan = loader.preload_page(paths, start, count)?;
    if !plan.requested.is_empty() {
        loader.focus(plan.requested.start)?;
    }

    let mut summary = PageSummary {
        profile: loader.profile().name,
        requested: plan.requested.len(),
        ..PageSummary::default()
    };

    let deadline = started + timeout;
    while summary.loaded + summary.failed < summary.requested {
        if Instant::now() >= deadline {
            warn!(
                outstanding = summary.requested - summary.loaded - summary.failed,
                "timed out waiting for the page"
            );
            break;
        }

        loader.poll();
        match events.recv_timeout(Duration::from_millis(10)) {
            Ok(LoadEvent::Loaded {
                index,
                bitmap,
                path,
            }) => {
                summary.loaded += 1;
                info!(
                    index,
                    width = bitmap.width,
                    height = bitmap.height,
                    source = ?bitmap.source,
                    path = %path.display(),
                    "loaded"
                );
            }
            Ok(LoadEvent::Failed { error, path, index }) => {
                summary.failed += 1;
                warn!(index, path = %path.display(), %error, "failed");
            }
            Ok(LoadEvent::Incompatible { path }) => {
                summary.incompatible += 1;
                warn!(path = %path.display(), "camera switched to embedded previews");
            }
            Err(_) => {}
        }
    }

    summary.elapsed_ms = started.elapsed().as_millis() as u64;
    summary.stats = loader.stats();
    Ok(summary)
}

fn load_strategies(file: &Path, loader: &ImageLoader) {
    let text = match fs::read_to_string(file) {
        Ok(text) => text,
        // First run: nothing saved yet
        Err(_) => return,
    };
    match serde_json::from_str::<HashMap<String, RawStrategy>>(&text) {
        Ok(strategies) => {
            for (camera, strategy) in &strategies {
                loader.set_camera_strategy(camera, *strategy);
            }
            info!(cameras = strategies.len(), "loaded camera strategies");
        }
        Err(err) => warn!(file = %file.display(), error = %err, "ignoring unreadable camera strategies"),
    }
}

fn save_strategies(file: &Path, loader: &ImageLoader) {
    let result = serde_json::to_string_pretty(&loader.camera_strategies())
        .map_err(|e| e.to_string())
        .and_then(|json| fs::write(file, json).map_err(|e| e.to_string()));
    if let Err(err) = result {
        warn!(file = %file.display(), error = %err, "failed to save camera strategies");
    }
}
