use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::calibration::CalibrationData;
use crate::config::Config;
use crate::detection::Tracker;
use crate::error::{Error, Result};
use crate::speed::{is_plausible, SpeedModel};
use crate::stats::{FrameStats, SummaryStats};
use crate::trajectory::TrajectoryStore;
use crate::video::{FrameSink, FrameSource};
use crate::visualization::{format_label, Canvas, FrameAnnotator, TrackOverlay};

const TIMING_EVERY: u64 = 300;

/// Shared stop request for a running job, checked between frames.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-job knobs for one pass over a video.
#[derive(Debug, Clone)]
pub struct AnalysisOptions {
    pub speed_enabled: bool,
    pub speed_limit: f64,
    pub fallback_pixels_per_meter: f64,
    pub max_plausible_speed: f64,
    /// Frames between progress callbacks.
    pub progress_every: u64,
    pub cancel: CancelFlag,
}

impl AnalysisOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            speed_enabled: config.enable_speed_calculation,
            speed_limit: config.speed_limit,
            fallback_pixels_per_meter: config.fallback_pixels_per_meter,
            max_plausible_speed: config.max_plausible_speed,
            progress_every: config.progress_every.max(1),
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_speed(mut self, enabled: bool, limit: f64) -> Self {
        self.speed_enabled = enabled;
        self.speed_limit = limit;
        self
    }
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Runs detection, trajectory tracking, speed estimation and annotation over
/// every frame of `source`, writing annotated frames to `sink`.
///
/// `progress` receives `(processed_frames, total_frames)` every
/// `options.progress_every` frames; `total_frames` is never smaller than
/// `processed_frames`. Any source, sink or tracker error aborts the run and
/// is returned as is. A raised `options.cancel` stops the run before the
/// next frame is read, with [`Error::Cancelled`]; the sink is not finished.
pub fn process<S, K, T>(
    source: &mut S,
    sink: &mut K,
    tracker: &mut T,
    calibration: Option<&CalibrationData>,
    options: &AnalysisOptions,
    progress: &mut dyn FnMut(u64, u64),
) -> Result<SummaryStats>
where
    S: FrameSource,
    S::Frame: Canvas,
    K: FrameSink<S::Frame>,
    T: Tracker<S::Frame>,
{
    let meta = source.metadata();
    if !(meta.fps.is_finite() && meta.fps > 0.0) {
        return Err(Error::Source(format!("invalid frame rate {}", meta.fps)));
    }
    let fps = meta.fps;

    let model = SpeedModel::select(
        calibration,
        options.speed_enabled,
        options.fallback_pixels_per_meter,
    );
    let annotator = FrameAnnotator::for_resolution(meta.width, meta.height);
    let mut trajectories = TrajectoryStore::new(meta.frames_per_second());
    let mut stats = FrameStats::new();
    let every = options.progress_every.max(1);

    info!(
        fps,
        total_frames = meta.total_frames,
        window = trajectories.capacity(),
        speed_model = model.as_ref().map_or("none", |m| m.kind()),
        "analysis started"
    );

    let started = Instant::now();
    let mut frame_index: u64 = 0;
    let mut detect_time = 0.0;
    let mut render_time = 0.0;

    loop {
        if options.cancel.is_cancelled() {
            warn!(frame = frame_index, "analysis cancelled");
            return Err(Error::Cancelled);
        }
        let Some(frame) = source.next_frame()? else {
            break;
        };

        let t0 = Instant::now();
        let detections = tracker.detect(&frame, frame_index)?;
        detect_time += t0.elapsed().as_secs_f64();

        let t1 = Instant::now();
        let mut labels = Vec::with_capacity(detections.len());
        for det in &detections {
            stats.observe_track(det.track_id);
            let window = trajectories.record(det.track_id, det.anchor(), frame_index);

            let speed = model
                .as_ref()
                .and_then(|m| m.estimate(window, fps))
                .filter(|&kmh| is_plausible(kmh, options.max_plausible_speed));
            if let Some(kmh) = speed {
                stats.add_speed(det.track_id, frame_index, kmh);
            }
            labels.push(format_label(det.track_id, speed));
        }

        let overlays: Vec<TrackOverlay<'_>> = detections
            .iter()
            .zip(labels)
            .map(|(det, label)| TrackOverlay {
                detection: det,
                trail: trajectories.window(det.track_id),
                label,
            })
            .collect();
        let annotated = annotator.annotate(&frame, &overlays)?;
        sink.write_frame(&annotated)?;
        render_time += t1.elapsed().as_secs_f64();

        stats.end_frame();
        frame_index += 1;

        if frame_index % every == 0 {
            progress(frame_index, meta.total_frames.max(frame_index));
        }

        if frame_index % TIMING_EVERY == 0 {
            let n = TIMING_EVERY as f64;
            debug!(
                frame = frame_index,
                detect_ms = detect_time / n * 1000.0,
                render_ms = render_time / n * 1000.0,
                tracks = trajectories.track_count(),
                "loop timing"
            );
            detect_time = 0.0;
            render_time = 0.0;
        }
    }

    sink.finish()?;

    let total_frames = meta.total_frames.max(frame_index);
    let summary = stats.finalize(total_frames, fps, options.speed_enabled, options.speed_limit);
    info!(
        frames = summary.processed_frames,
        vehicles = summary.vehicle_count,
        speeds = summary.speeds_calculated,
        speeding = summary.speeding_count,
        elapsed_s = started.elapsed().as_secs_f64(),
        "analysis finished"
    );
    Ok(summary)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::detection::Detection;
    use crate::video::VideoMetadata;
    use crate::visualization::tests::{Op, RecordingCanvas};
    use approx::assert_relative_eq;
    use nalgebra::SVector;

    pub(crate) struct FakeSource {
        pub(crate) meta: VideoMetadata,
        pub(crate) remaining: u64,
        pub(crate) fail_at: Option<u64>,
        pub(crate) read: u64,
    }

    impl FakeSource {
        pub(crate) fn new(fps: f64, frames: u64, reported_total: u64) -> Self {
            Self {
                meta: VideoMetadata {
                    fps,
                    total_frames: reported_total,
                    width: 1280,
                    height: 720,
                },
                remaining: frames,
                fail_at: None,
                read: 0,
            }
        }
    }

    impl FrameSource for FakeSource {
        type Frame = RecordingCanvas;

        fn metadata(&self) -> VideoMetadata {
            self.meta
        }

        fn next_frame(&mut self) -> Result<Option<RecordingCanvas>> {
            if self.fail_at == Some(self.read) {
                return Err(Error::Source("corrupt frame".into()));
            }
            if self.remaining == 0 {
                return Ok(None);
            }
            self.remaining -= 1;
            self.read += 1;
            Ok(Some(RecordingCanvas::default()))
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeSink {
        pub(crate) frames: Vec<RecordingCanvas>,
        pub(crate) finished: bool,
        /// Rejects the write once this many frames are stored.
        pub(crate) full_at: Option<usize>,
    }

    impl FrameSink<RecordingCanvas> for FakeSink {
        fn write_frame(&mut self, frame: &RecordingCanvas) -> Result<()> {
            if self.full_at == Some(self.frames.len()) {
                return Err(Error::Sink("disk full".into()));
            }
            self.frames.push(frame.clone());
            Ok(())
        }

        fn finish(&mut self) -> Result<()> {
            self.finished = true;
            Ok(())
        }
    }

    /// One vehicle moving down the image `step` px per frame.
    pub(crate) struct LinearTracker {
        pub(crate) step: f32,
    }

    impl Tracker<RecordingCanvas> for LinearTracker {
        fn detect(&mut self, _: &RecordingCanvas, frame_index: u64) -> Result<Vec<Detection>> {
            let y = 100.0 + self.step * frame_index as f32;
            Ok(vec![Detection::new(
                1,
                SVector::<f32, 4>::new(600.0, y, 80.0, 60.0),
                0.9,
                2,
            )])
        }
    }

    /// Gives up at `fail_at`.
    struct CrashingTracker {
        fail_at: u64,
    }

    impl Tracker<RecordingCanvas> for CrashingTracker {
        fn detect(&mut self, _: &RecordingCanvas, frame_index: u64) -> Result<Vec<Detection>> {
            if frame_index == self.fail_at {
                return Err(Error::Detector("model crashed".into()));
            }
            Ok(Vec::new())
        }
    }

    fn labels(frame: &RecordingCanvas) -> Vec<String> {
        frame
            .ops
            .iter()
            .filter_map(|op| match op {
                Op::Text(t) => Some(t.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_empty_video_yields_empty_summary() {
        let mut source = FakeSource::new(30.0, 0, 0);
        let mut sink = FakeSink::default();
        let mut tracker = LinearTracker { step: 1.0 };
        let mut calls = 0;
        let summary = process(
            &mut source,
            &mut sink,
            &mut tracker,
            None,
            &AnalysisOptions::default(),
            &mut |_, _| calls += 1,
        )
        .unwrap();
        assert_eq!(summary.vehicle_count, 0);
        assert_eq!(summary.processed_frames, 0);
        assert!(summary.avg_speed.is_none());
        assert_eq!(calls, 0);
        assert!(sink.finished);
    }

    #[test]
    fn test_fallback_speed_over_constant_motion() {
        // 30 fps, 25 px/m, 10 px per frame => 12 m/s => 43.2 km/h
        let mut source = FakeSource::new(30.0, 60, 60);
        let mut sink = FakeSink::default();
        let mut tracker = LinearTracker { step: 10.0 };
        let summary = process(
            &mut source,
            &mut sink,
            &mut tracker,
            None,
            &AnalysisOptions::default(),
            &mut |_, _| {},
        )
        .unwrap();

        assert_eq!(sink.frames.len(), 60);
        assert_eq!(summary.vehicle_count, 1);
        assert_relative_eq!(summary.max_speed.unwrap(), 43.2, epsilon = 1e-6);
        assert_relative_eq!(summary.min_speed.unwrap(), 43.2, epsilon = 1e-6);
        assert!(summary.speeds_calculated > 0);
        assert_eq!(summary.speeding_count, 0);
        assert_eq!(labels(&sink.frames[0]), vec!["#1", "#1"]);
        assert_eq!(labels(&sink.frames[59]), vec!["#1 43 km/h", "#1 43 km/h"]);
    }

    #[test]
    fn test_implausible_speeds_are_dropped() {
        // 300 px per frame at 25 px/m is 1296 km/h.
        let mut source = FakeSource::new(30.0, 30, 30);
        let mut sink = FakeSink::default();
        let mut tracker = LinearTracker { step: 300.0 };
        let summary = process(
            &mut source,
            &mut sink,
            &mut tracker,
            None,
            &AnalysisOptions::default(),
            &mut |_, _| {},
        )
        .unwrap();
        assert_eq!(summary.speeds_calculated, 0);
        assert!(summary.max_speed.is_none());
        assert_eq!(labels(&sink.frames[29]), vec!["#1", "#1"]);
    }

    #[test]
    fn test_speed_disabled_renders_id_only() {
        let mut source = FakeSource::new(30.0, 40, 40);
        let mut sink = FakeSink::default();
        let mut tracker = LinearTracker { step: 10.0 };
        let options = AnalysisOptions::default().with_speed(false, 80.0);
        let summary =
            process(&mut source, &mut sink, &mut tracker, None, &options, &mut |_, _| {}).unwrap();
        assert!(summary.avg_speed.is_none());
        assert_eq!(summary.vehicle_count, 1);
        assert!(sink.frames.iter().all(|f| labels(f).iter().all(|l| l == "#1")));
    }

    #[test]
    fn test_progress_cadence_and_clamp() {
        // Container claims 20 frames but delivers 35.
        let mut source = FakeSource::new(25.0, 35, 20);
        let mut sink = FakeSink::default();
        let mut tracker = LinearTracker { step: 1.0 };
        let mut seen = Vec::new();
        let summary = process(
            &mut source,
            &mut sink,
            &mut tracker,
            None,
            &AnalysisOptions::default(),
            &mut |done, total| seen.push((done, total)),
        )
        .unwrap();
        assert_eq!(seen, vec![(10, 20), (20, 20), (30, 30)]);
        assert!(seen.iter().all(|(done, total)| done <= total));
        assert_eq!(summary.total_frames, 35);
    }

    #[test]
    fn test_source_error_propagates() {
        let mut source = FakeSource::new(30.0, 50, 50);
        source.fail_at = Some(12);
        let mut sink = FakeSink::default();
        let mut tracker = LinearTracker { step: 1.0 };
        let err = process(
            &mut source,
            &mut sink,
            &mut tracker,
            None,
            &AnalysisOptions::default(),
            &mut |_, _| {},
        )
        .unwrap_err();
        assert!(matches!(err, Error::Source(_)));
        assert!(!sink.finished);
    }

    #[test]
    fn test_sink_error_propagates() {
        let mut source = FakeSource::new(30.0, 50, 50);
        let mut sink = FakeSink {
            full_at: Some(7),
            ..FakeSink::default()
        };
        let mut tracker = LinearTracker { step: 1.0 };
        let err = process(
            &mut source,
            &mut sink,
            &mut tracker,
            None,
            &AnalysisOptions::default(),
            &mut |_, _| {},
        )
        .unwrap_err();
        assert!(matches!(err, Error::Sink(_)));
        assert_eq!(sink.frames.len(), 7);
        assert_eq!(source.read, 8);
        assert!(!sink.finished);
    }

    #[test]
    fn test_detector_error_propagates() {
        let mut source = FakeSource::new(30.0, 50, 50);
        let mut sink = FakeSink::default();
        let mut tracker = CrashingTracker { fail_at: 4 };
        let err = process(
            &mut source,
            &mut sink,
            &mut tracker,
            None,
            &AnalysisOptions::default(),
            &mut |_, _| {},
        )
        .unwrap_err();
        assert!(matches!(err, Error::Detector(_)));
        assert_eq!(sink.frames.len(), 4);
        assert!(!sink.finished);
    }

    #[test]
    fn test_cancel_stops_before_next_frame() {
        let mut source = FakeSource::new(30.0, 50, 50);
        let mut sink = FakeSink::default();
        let mut tracker = LinearTracker { step: 1.0 };
        let cancel = CancelFlag::new();
        let options = AnalysisOptions {
            progress_every: 1,
            ..AnalysisOptions::default()
        }
        .with_cancel(cancel.clone());
        let err = process(&mut source, &mut sink, &mut tracker, None, &options, &mut |done, _| {
            if done == 5 {
                cancel.cancel();
            }
        })
        .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(source.read, 5);
        assert_eq!(sink.frames.len(), 5);
        assert!(!sink.finished);
    }

    #[test]
    fn test_zero_fps_is_rejected() {
        let mut source = FakeSource::new(0.0, 10, 10);
        let mut sink = FakeSink::default();
        let mut tracker = LinearTracker { step: 1.0 };
        let err = process(
            &mut source,
            &mut sink,
            &mut tracker,
            None,
            &AnalysisOptions::default(),
            &mut |_, _| {},
        )
        .unwrap_err();
        assert!(matches!(err, Error::Source(_)));
        assert!(sink.frames.is_empty());
    }
}
