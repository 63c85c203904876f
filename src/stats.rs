use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Peak accepted speed of one track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedRecord {
    pub track_id: u32,
    pub frame_index: u64,
    pub timestamp_secs: f64,
    pub speed: f64,
    pub is_speeding: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryStats {
    pub vehicle_count: usize,
    pub avg_speed: Option<f64>,
    pub max_speed: Option<f64>,
    pub min_speed: Option<f64>,
    pub total_frames: u64,
    pub processed_frames: u64,
    pub fps: f64,
    /// Seconds.
    pub duration: f64,
    pub speeds_calculated: usize,
    pub speeding_count: usize,
    pub records: Vec<SpeedRecord>,
}

/// Per-run accumulator. Lives for one pass over the video.
#[derive(Debug, Default)]
pub struct FrameStats {
    vehicles: HashSet<u32>,
    speeds: Vec<f64>,
    peaks: BTreeMap<u32, (u64, f64)>,
    frames: u64,
}

impl FrameStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe_track(&mut self, track_id: u32) {
        self.vehicles.insert(track_id);
    }

    /// Callers only pass samples that already passed the plausibility check.
    pub fn add_speed(&mut self, track_id: u32, frame_index: u64, speed: f64) {
        self.speeds.push(speed);
        let peak = self.peaks.entry(track_id).or_insert((frame_index, speed));
        if speed > peak.1 {
            *peak = (frame_index, speed);
        }
    }

    pub fn end_frame(&mut self) {
        self.frames += 1;
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn vehicle_count(&self) -> usize {
        self.vehicles.len()
    }

    pub fn speeds(&self) -> &[f64] {
        &self.speeds
    }

    pub fn finalize(
        self,
        total_frames: u64,
        fps: f64,
        speed_enabled: bool,
        speed_limit: f64,
    ) -> SummaryStats {
        let (avg, max, min) = if speed_enabled && !self.speeds.is_empty() {
            let sum: f64 = self.speeds.iter().sum();
            let max = self.speeds.iter().copied().fold(f64::MIN, f64::max);
            let min = self.speeds.iter().copied().fold(f64::MAX, f64::min);
            (Some(sum / self.speeds.len() as f64), Some(max), Some(min))
        } else {
            (None, None, None)
        };

        let records: Vec<SpeedRecord> = if speed_enabled {
            self.peaks
                .iter()
                .map(|(&track_id, &(frame_index, speed))| SpeedRecord {
                    track_id,
                    frame_index,
                    timestamp_secs: if fps > 0.0 { frame_index as f64 / fps } else { 0.0 },
                    speed,
                    is_speeding: speed > speed_limit,
                })
                .collect()
        } else {
            Vec::new()
        };

        SummaryStats {
            vehicle_count: self.vehicles.len(),
            avg_speed: avg,
            max_speed: max,
            min_speed: min,
            total_frames,
            processed_frames: self.frames,
            fps,
            duration: if fps > 0.0 { total_frames as f64 / fps } else { 0.0 },
            speeds_calculated: if speed_enabled { self.speeds.len() } else { 0 },
            speeding_count: records.iter().filter(|r| r.is_speeding).count(),
            records,
        }
    }
}
