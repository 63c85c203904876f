use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot read video source: {0}")]
    Source(String),

    #[error("cannot write output video: {0}")]
    Sink(String),

    #[error("detector failed: {0}")]
    Detector(String),

    #[error("invalid calibration: {0}")]
    Calibration(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("job exceeded the {}s time limit", .0.as_secs())]
    Timeout(Duration),

    #[error("job cancelled")]
    Cancelled,

    #[error("accelerator not available: {0}")]
    AcceleratorUnavailable(String),

    #[error("job {0} not found")]
    JobNotFound(u64),

    #[error("job {0} is already {1}")]
    InvalidJobState(u64, &'static str),

    #[error("worker queue is closed")]
    QueueClosed,

    #[error("job worker panicked")]
    WorkerPanicked,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "opencv")]
    #[error("OpenCV error: {0}")]
    OpenCv(#[from] opencv::Error),
}

impl Error {
    /// Short text stored on a failed job record and shown to status pollers.
    pub fn user_message(&self) -> String {
        match self {
            Error::Source(_) => "Input video could not be read".to_string(),
            Error::Sink(_) => "Processed video could not be written".to_string(),
            Error::Detector(_) => "Vehicle detection failed".to_string(),
            Error::Calibration(_) => "Calibration data is invalid".to_string(),
            Error::Config(_) => "Processing configuration is invalid".to_string(),
            Error::Timeout(limit) => format!("Processing timed out after {}", human_duration(*limit)),
            Error::Cancelled => "Processing was cancelled".to_string(),
            Error::AcceleratorUnavailable(_) => "GPU became unavailable during processing".to_string(),
            Error::JobNotFound(id) => format!("Video {} not found", id),
            Error::InvalidJobState(_, state) => format!("Video is already {}", state),
            Error::QueueClosed => "Processing queue is shut down".to_string(),
            Error::WorkerPanicked => "Processing worker crashed".to_string(),
            Error::Io(_) | Error::Json(_) => "Internal processing error".to_string(),
            #[cfg(feature = "opencv")]
            Error::OpenCv(_) => "Video processing error".to_string(),
        }
    }
}

/// Whole minutes when the limit is at least one, else seconds or milliseconds.
fn human_duration(limit: Duration) -> String {
    let unit = |n: u128, name: &str| {
        if n == 1 {
            format!("1 {}", name)
        } else {
            format!("{} {}s", n, name)
        }
    };
    let secs = limit.as_secs();
    if secs >= 60 {
        unit(u128::from(secs / 60), "minute")
    } else if secs >= 1 {
        unit(u128::from(secs), "second")
    } else {
        unit(limit.as_millis(), "millisecond")
    }
}
