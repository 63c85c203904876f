use nalgebra::SVector;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

/// A tracked detection for one frame, as handed over by the external
/// detector + multi-object tracker.
#[derive(Debug, Clone)]
pub struct Detection {
    pub track_id: u32,
    pub tlwh: SVector<f32, 4>,
    pub confidence: f32,
    pub class_id: i32,
}

impl Detection {
    pub fn new(track_id: u32, tlwh: SVector<f32, 4>, confidence: f32, class_id: i32) -> Self {
        Self {
            track_id,
            tlwh,
            confidence,
            class_id,
        }
    }

    pub fn tlwh(&self) -> &SVector<f32, 4> {
        &self.tlwh
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    /// Bottom-centre of the box: where the vehicle touches the road.
    pub fn anchor(&self) -> (f32, f32) {
        (self.tlwh[0] + self.tlwh[2] / 2.0, self.tlwh[1] + self.tlwh[3])
    }
}

/// Detector + tracker seam. Output is assumed already confidence/NMS
/// filtered with stable ids.
pub trait Tracker<F> {
    fn detect(&mut self, frame: &F, frame_index: u64) -> Result<Vec<Detection>>;
}

impl<F, T: Tracker<F> + ?Sized> Tracker<F> for Box<T> {
    fn detect(&mut self, frame: &F, frame_index: u64) -> Result<Vec<Detection>> {
        (**self).detect(frame, frame_index)
    }
}

/// One track in a tracking log, `bbox` is `[x, y, w, h]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackLog {
    pub track_id: u32,
    pub bbox: [f32; 4],
    #[serde(default = "default_confidence")]
    pub confidence: f32,
    #[serde(default)]
    pub class_id: i32,
}

fn default_confidence() -> f32 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameLog {
    pub frame_id: u64,
    #[serde(default)]
    pub tracks: Vec<TrackLog>,
}

/// Serves tracker output recorded offline, frame by frame.
///
/// Frames absent from the log produce no detections.
#[derive(Debug, Default)]
pub struct ReplayTracker {
    frames: HashMap<u64, Vec<Detection>>,
    min_confidence: f32,
}

impl ReplayTracker {
    pub fn from_logs(logs: Vec<FrameLog>) -> Self {
        let frames = logs
            .into_iter()
            .map(|log| {
                let dets = log
                    .tracks
                    .into_iter()
                    .map(|t| {
                        Detection::new(
                            t.track_id,
                            SVector::<f32, 4>::from(t.bbox),
                            t.confidence,
                            t.class_id,
                        )
                    })
                    .collect();
                (log.frame_id, dets)
            })
            .collect();
        Self {
            frames,
            min_confidence: 0.0,
        }
    }

    /// Drops logged tracks scored below `threshold`.
    pub fn with_min_confidence(mut self, threshold: f32) -> Self {
        self.min_confidence = threshold;
        self
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Detector(format!("{}: {}", path.as_ref().display(), e)))?;
        let logs: Vec<FrameLog> = serde_json::from_str(&data)
            .map_err(|e| Error::Detector(format!("malformed tracking log: {}", e)))?;
        Ok(Self::from_logs(logs))
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl<F> Tracker<F> for ReplayTracker {
    fn detect(&mut self, _frame: &F, frame_index: u64) -> Result<Vec<Detection>> {
        let mut dets = self.frames.remove(&frame_index).unwrap_or_default();
        dets.retain(|d| d.confidence >= self.min_confidence);
        Ok(dets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anchor_is_bottom_center() {
        let det = Detection::new(7, SVector::<f32, 4>::new(100.0, 50.0, 40.0, 20.0), 0.9, 2);
        assert_eq!(det.anchor(), (120.0, 70.0));
    }

    #[test]
    fn test_replay_tracker_serves_logged_frames() {
        let json = r#"[
            {"frame_id": 0, "tracks": [{"track_id": 3, "bbox": [10, 20, 30, 40], "confidence": 0.8, "class_id": 2}]},
            {"frame_id": 2, "tracks": []}
        ]"#;
        let logs: Vec<FrameLog> = serde_json::from_str(json).unwrap();
        let mut tracker = ReplayTracker::from_logs(logs);
        assert_eq!(tracker.len(), 2);

        let dets = Tracker::<()>::detect(&mut tracker, &(), 0).unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].track_id, 3);
        assert_eq!(dets[0].anchor(), (25.0, 60.0));

        assert!(Tracker::<()>::detect(&mut tracker, &(), 1).unwrap().is_empty());
        assert!(Tracker::<()>::detect(&mut tracker, &(), 2).unwrap().is_empty());
    }

    #[test]
    fn test_replay_tracker_confidence_floor() {
        let logs = vec![FrameLog {
            frame_id: 0,
            tracks: vec![
                TrackLog { track_id: 1, bbox: [0.0, 0.0, 10.0, 10.0], confidence: 0.2, class_id: 2 },
                TrackLog { track_id: 2, bbox: [0.0, 0.0, 10.0, 10.0], confidence: 0.6, class_id: 2 },
            ],
        }];
        let mut tracker = ReplayTracker::from_logs(logs).with_min_confidence(0.3);
        let dets = Tracker::<()>::detect(&mut tracker, &(), 0).unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].track_id, 2);
    }
}
