use anyhow::{bail, Context};
use clap::Parser;
use opencv::core::Mat;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use speedcam::worker::VideoJobRunner;
use speedcam::{
    Config, Dispatcher, InMemoryJobStore, JobRecord, JobRecordStore, JobRequest, JobState,
    ReplayTracker, ResourceArbiter, Tracker,
};

#[derive(Parser)]
#[command(
    name = "speedcam",
    about = "Vehicle speed estimation over recorded traffic video",
    version = "0.1.0"
)]
struct Args {
    /// Path to the input video
    #[arg(short, long, required = true)]
    input: PathBuf,

    /// Tracking log produced by the detector (defaults to <input>.tracks.json)
    #[arg(short, long)]
    tracks: Option<PathBuf>,

    /// Site calibration JSON
    #[arg(long)]
    calibration: Option<PathBuf>,

    /// Path to configuration file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Directory for processed videos, overrides the config
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Speed limit in km/h, overrides the config
    #[arg(long)]
    speed_limit: Option<f64>,

    /// Skip speed estimation and draw ids only
    #[arg(long)]
    no_speed: bool,

    /// Route to the accelerated pool when free
    #[arg(long)]
    gpu: bool,

    /// Status poll interval in milliseconds
    #[arg(long, default_value_t = 500)]
    poll_ms: u64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("speedcam=info")),
        )
        .init();

    let args = Args::parse();

    let mut config = if args.config.exists() {
        info!(path = %args.config.display(), "loading configuration");
        Config::from_file(&args.config)
            .with_context(|| format!("loading {}", args.config.display()))?
    } else {
        warn!(path = %args.config.display(), "configuration not found, using defaults");
        Config::default()
    };
    if let Some(dir) = &args.output {
        config.processed_dir = dir.clone();
    }
    if args.gpu {
        config.accelerator_present = true;
    }

    let mut request = JobRequest::from_config(&config);
    if let Some(limit) = args.speed_limit {
        request.speed_limit = limit;
    }
    if args.no_speed {
        request.enable_speed_calculation = false;
    }

    let filename = args
        .input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .context("input path has no file name")?;
    let mut record = JobRecord::new(filename, &args.input);
    if let Some(path) = &args.calibration {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading calibration {}", path.display()))?;
        let value: serde_json::Value =
            serde_json::from_str(&text).context("calibration is not valid JSON")?;
        record = record.with_calibration(value);
    }

    let tracks = args
        .tracks
        .clone()
        .unwrap_or_else(|| args.input.with_extension("tracks.json"));
    let runner = VideoJobRunner::new(config.clone(), move |_job, request, _device| {
        let tracker = ReplayTracker::from_file(&tracks)?
            .with_min_confidence(request.confidence_threshold);
        Ok(Box::new(tracker) as Box<dyn Tracker<Mat>>)
    });

    let store = Arc::new(InMemoryJobStore::new());
    let arbiter = Arc::new(ResourceArbiter::new(
        config.accelerator_present,
        config.lease_ttl(),
    ));
    let mut dispatcher = Dispatcher::start(&config, arbiter, store.clone(), Arc::new(runner))
        .context("starting workers")?;

    let job_id = store.create(record);
    let handle = dispatcher.route(job_id, request)?;
    println!("{}", serde_json::to_string(&handle)?);

    let poll = Duration::from_millis(args.poll_ms.max(10));
    let mut last = None;
    let status = loop {
        let status = dispatcher.status(job_id)?;
        if last.as_ref() != Some(&status) {
            println!("{}", serde_json::to_string(&status)?);
            last = Some(status.clone());
        }
        if status.status.is_terminal() {
            break status;
        }
        thread::sleep(poll);
    };

    println!("{}", serde_json::to_string(&dispatcher.system_status())?);
    dispatcher.shutdown();

    let record = store.get(job_id).context("job record vanished")?;
    match status.status {
        JobState::Completed => {
            if let Some(summary) = &record.summary {
                println!("{}", serde_json::to_string_pretty(summary)?);
            }
            if let Some(path) = &record.output_path {
                info!(output = %path.display(), "processed video written");
            }
            Ok(())
        }
        _ => bail!(
            "job {} failed: {}",
            job_id,
            status.error_message.unwrap_or_else(|| "unknown error".to_string())
        ),
    }
}
