pub mod analysis;
pub mod arbiter;
pub mod calibration;
pub mod config;
pub mod detection;
pub mod dispatcher;
pub mod error;
pub mod speed;
pub mod stats;
pub mod status;
pub mod trajectory;
pub mod video;
pub mod visualization;
pub mod worker;

// Re-export main types
pub use crate::analysis::{process, AnalysisOptions, CancelFlag};
pub use crate::arbiter::{LeaseGuard, ResourceArbiter};
pub use crate::calibration::CalibrationData;
pub use crate::config::Config;
pub use crate::detection::{Detection, ReplayTracker, Tracker};
pub use crate::dispatcher::{Dispatcher, RouteHandle, SystemStatus};
pub use crate::error::{Error, Result};
pub use crate::speed::SpeedModel;
pub use crate::stats::SummaryStats;
pub use crate::status::{
    DeviceClass, InMemoryJobStore, JobRecord, JobRecordStore, JobState, JobStatusRecord,
};
pub use crate::worker::{JobRequest, JobRunner};
