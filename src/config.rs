use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub enable_speed_calculation: bool,
    /// km/h
    pub speed_limit: f64,
    /// Scale used when no usable calibration exists.
    pub fallback_pixels_per_meter: f64,
    /// Upper bound of the plausible-speed window, km/h. Lower bound is 0 (exclusive).
    pub max_plausible_speed: f64,
    pub progress_every: u64,
    pub durable_every: u64,
    pub task_time_limit_secs: u64,
    pub task_soft_time_limit_secs: u64,
    pub lease_ttl_secs: u64,
    pub lease_renew_secs: u64,
    pub accelerator_present: bool,
    pub accelerator_workers: usize,
    pub general_workers: usize,
    pub ephemeral_ttl_secs: u64,
    pub processed_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.3,
            iou_threshold: 0.7,
            enable_speed_calculation: true,
            speed_limit: 80.0,
            fallback_pixels_per_meter: 25.0,
            max_plausible_speed: 200.0,
            progress_every: 10,
            durable_every: 50,
            task_time_limit_secs: 30 * 60,
            task_soft_time_limit_secs: 25 * 60,
            lease_ttl_secs: 60,
            lease_renew_secs: 15,
            accelerator_present: false,
            accelerator_workers: 1,
            general_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2),
            ephemeral_ttl_secs: 24 * 60 * 60,
            processed_dir: PathBuf::from("processed"),
        }
    }
}

impl Config {
    /// Load from a JSON file. Missing keys take their default.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        let cfg: Config = serde_json::from_str(&data)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.progress_every == 0 || self.durable_every == 0 {
            return Err(Error::Config("progress cadences must be at least 1 frame".into()));
        }
        if self.fallback_pixels_per_meter <= 0.0 {
            return Err(Error::Config("fallback_pixels_per_meter must be positive".into()));
        }
        if self.max_plausible_speed <= 0.0 {
            return Err(Error::Config("max_plausible_speed must be positive".into()));
        }
        if self.lease_renew_secs == 0 || self.lease_renew_secs >= self.lease_ttl_secs {
            return Err(Error::Config("lease_renew_secs must be in (0, lease_ttl_secs)".into()));
        }
        if self.task_soft_time_limit_secs > self.task_time_limit_secs {
            return Err(Error::Config("soft time limit exceeds hard time limit".into()));
        }
        if self.general_workers == 0 {
            return Err(Error::Config("at least one general-purpose worker is required".into()));
        }
        Ok(())
    }

    pub fn task_time_limit(&self) -> Duration {
        Duration::from_secs(self.task_time_limit_secs)
    }

    pub fn task_soft_time_limit(&self) -> Duration {
        Duration::from_secs(self.task_soft_time_limit_secs)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn lease_renew_interval(&self) -> Duration {
        Duration::from_secs(self.lease_renew_secs)
    }

    pub fn ephemeral_ttl(&self) -> Duration {
        Duration::from_secs(self.ephemeral_ttl_secs)
    }

    pub fn output_path_for(&self, filename: &str) -> PathBuf {
        processed_output_path(&self.processed_dir, filename)
    }
}

/// `<dir>/processed_<stem>.mp4`
pub fn processed_output_path(dir: &Path, filename: &str) -> PathBuf {
    let stem = Path::new(filename)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "video".to_string());
    dir.join(format!("processed_{}.mp4", stem))
}
