use tracing::{info, warn};

use crate::calibration::{CalibrationData, ViewTransform, Zone};
use crate::trajectory::{TrajectoryPoint, Window};

const MPS_TO_KMH: f64 = 3.6;

/// Fewest points a window needs before a speed is estimated: a quarter
/// second of video, and never less than two.
pub fn min_support(fps: f64) -> f64 {
    (fps / 4.0).max(2.0)
}

fn has_support(points: usize, fps: f64) -> bool {
    (points as f64) >= min_support(fps)
}

/// Whether `speed` (km/h) may enter the aggregated statistics.
pub fn is_plausible(speed: f64, max_speed: f64) -> bool {
    speed.is_finite() && speed > 0.0 && speed < max_speed
}

/// Windowed average over consecutive steps given positions already in
/// meters. Steps with no elapsed frames are skipped; `None` when no time
/// elapsed over the whole window.
fn average_kmh<I>(positions: I, fps: f64) -> Option<f64>
where
    I: IntoIterator<Item = (f64, f64, u64)>,
{
    if !(fps.is_finite() && fps > 0.0) {
        return None;
    }
    let mut iter = positions.into_iter();
    let mut prev = iter.next()?;
    let mut meters = 0.0;
    let mut frames = 0u64;

    for cur in iter {
        if cur.2 > prev.2 {
            meters += (cur.0 - prev.0).hypot(cur.1 - prev.1);
            frames += cur.2 - prev.2;
        }
        prev = cur;
    }

    if frames == 0 {
        return None;
    }
    let seconds = frames as f64 / fps;
    Some(meters / seconds * MPS_TO_KMH)
}

/// Single global scale.
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackSpeedModel {
    pub pixels_per_meter: f64,
}

impl FallbackSpeedModel {
    pub fn new(pixels_per_meter: f64) -> Self {
        Self { pixels_per_meter }
    }

    pub fn estimate(&self, window: &Window, fps: f64) -> Option<f64> {
        if !has_support(window.len(), fps) {
            return None;
        }
        let ppm = self.pixels_per_meter;
        average_kmh(
            window
                .iter()
                .map(|p| (p.x as f64 / ppm, p.y as f64 / ppm, p.frame_index)),
            fps,
        )
    }
}

/// Per-band scales. Only the trailing run of points inside the current
/// point's zone contributes, so a displacement never spans two zones.
#[derive(Debug, Clone, PartialEq)]
pub struct ZonedSpeedModel {
    zones: Vec<Zone>,
}

impl ZonedSpeedModel {
    /// `None` when there is no zone to work with.
    pub fn new(zones: Vec<Zone>) -> Option<Self> {
        if zones.is_empty() {
            None
        } else {
            Some(Self { zones })
        }
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    fn zone_index(&self, y: f32) -> Option<usize> {
        self.zones.iter().position(|z| z.contains(y))
    }

    pub fn estimate(&self, window: &Window, fps: f64) -> Option<f64> {
        if !has_support(window.len(), fps) {
            return None;
        }
        let current = window.latest()?;
        let zone_idx = self.zone_index(current.y)?;

        let mut run: Vec<&TrajectoryPoint> = window
            .iter()
            .rev()
            .take_while(|p| self.zone_index(p.y) == Some(zone_idx))
            .collect();
        if !has_support(run.len(), fps) {
            return None;
        }
        run.reverse();

        let ppm = self.zones[zone_idx].pixels_per_meter;
        average_kmh(
            run.into_iter()
                .map(|p| (p.x as f64 / ppm, p.y as f64 / ppm, p.frame_index)),
            fps,
        )
    }
}

/// Road-plane projection from a four-point calibration.
#[derive(Debug, Clone, PartialEq)]
pub struct PerspectiveSpeedModel {
    transform: ViewTransform,
}

impl PerspectiveSpeedModel {
    pub fn new(transform: ViewTransform) -> Self {
        Self { transform }
    }

    pub fn estimate(&self, window: &Window, fps: f64) -> Option<f64> {
        if !has_support(window.len(), fps) {
            return None;
        }
        let projected: Vec<(f64, f64, u64)> = window
            .iter()
            .filter_map(|p| {
                self.transform
                    .to_meters(p.x, p.y)
                    .map(|(x, y)| (x, y, p.frame_index))
            })
            .collect();
        if !has_support(projected.len(), fps) {
            return None;
        }
        average_kmh(projected, fps)
    }
}

/// Pixel trajectory to km/h, chosen once per job from the calibration shape.
#[derive(Debug, Clone, PartialEq)]
pub enum SpeedModel {
    Zoned(ZonedSpeedModel),
    Fallback(FallbackSpeedModel),
    Perspective(PerspectiveSpeedModel),
}

impl SpeedModel {
    /// `None` when speed calculation is disabled; every other case yields a
    /// model, degrading to the fallback scale rather than failing.
    pub fn select(
        calibration: Option<&CalibrationData>,
        enabled: bool,
        fallback_pixels_per_meter: f64,
    ) -> Option<Self> {
        if !enabled {
            info!("speed calculation disabled");
            return None;
        }
        let fallback = || SpeedModel::Fallback(FallbackSpeedModel::new(fallback_pixels_per_meter));

        let model = match calibration {
            None => {
                warn!("no calibration data, using fallback estimator");
                fallback()
            }
            Some(CalibrationData::Zoned(zones)) => match ZonedSpeedModel::new(zones.clone()) {
                Some(model) => SpeedModel::Zoned(model),
                None => {
                    warn!("calibration has no usable zones, using fallback estimator");
                    fallback()
                }
            },
            Some(CalibrationData::Scalar { pixels_per_meter }) => {
                SpeedModel::Fallback(FallbackSpeedModel::new(*pixels_per_meter))
            }
            Some(CalibrationData::FourPoint(fp)) => match ViewTransform::from_four_point(fp) {
                Some(transform) => SpeedModel::Perspective(PerspectiveSpeedModel::new(transform)),
                None => {
                    warn!("four-point calibration is degenerate, using fallback estimator");
                    fallback()
                }
            },
        };
        info!(model = model.kind(), "speed model selected");
        Some(model)
    }

    pub fn estimate(&self, window: &Window, fps: f64) -> Option<f64> {
        match self {
            SpeedModel::Zoned(m) => m.estimate(window, fps),
            SpeedModel::Fallback(m) => m.estimate(window, fps),
            SpeedModel::Perspective(m) => m.estimate(window, fps),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SpeedModel::Zoned(_) => "zoned",
            SpeedModel::Fallback(_) => "fallback",
            SpeedModel::Perspective(_) => "perspective",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::FourPoint;
    use crate::trajectory::TrajectoryPoint;
    use approx::assert_relative_eq;

    fn window_from(points: &[(f32, f32, u64)], capacity: usize) -> Window {
        let mut window = Window::with_capacity(capacity);
        for &(x, y, f) in points {
            window.push(TrajectoryPoint::new(x, y, f));
        }
        window
    }

    fn zone(name: &str, lo: f32, hi: f32, ppm: f64) -> Zone {
        Zone {
            name: name.to_string(),
            y_range: (lo, hi),
            reference_points: [(0.0, lo), (ppm as f32 * 10.0, lo)],
            real_distance: 10.0,
            pixels_per_meter: ppm,
        }
    }

    #[test]
    fn test_fallback_reference_scenario() {
        // 10 points, 90 px over 9 frames at 30 fps, 25 px/m => 43.2 km/h
        let pts: Vec<(f32, f32, u64)> = (0..10).map(|i| (100.0 + 10.0 * i as f32, 400.0, i)).collect();
        let window = window_from(&pts, 30);
        let speed = FallbackSpeedModel::new(25.0).estimate(&window, 30.0).unwrap();
        assert_relative_eq!(speed, 43.2, epsilon = 1e-6);
    }

    #[test]
    fn test_support_threshold() {
        let model = FallbackSpeedModel::new(25.0);
        // fps 30 needs 7.5 => 8 points
        let seven: Vec<(f32, f32, u64)> = (0..7).map(|i| (i as f32 * 5.0, 0.0, i)).collect();
        assert!(model.estimate(&window_from(&seven, 30), 30.0).is_none());
        let eight: Vec<(f32, f32, u64)> = (0..8).map(|i| (i as f32 * 5.0, 0.0, i)).collect();
        assert!(model.estimate(&window_from(&eight, 30), 30.0).is_some());

        // low fps still needs two points
        let one = [(0.0, 0.0, 0)];
        assert!(model.estimate(&window_from(&one, 4), 4.0).is_none());
        let two = [(0.0, 0.0, 0), (25.0, 0.0, 1)];
        assert_relative_eq!(model.estimate(&window_from(&two, 4), 4.0).unwrap(), 14.4, epsilon = 1e-9);
    }

    #[test]
    fn test_zero_elapsed_frames_rejected() {
        let model = FallbackSpeedModel::new(25.0);
        let same_frame = [(0.0, 0.0, 5), (10.0, 0.0, 5), (20.0, 0.0, 5)];
        assert!(model.estimate(&window_from(&same_frame, 10), 8.0).is_none());
    }

    #[test]
    fn test_zoned_uses_zone_scale() {
        let model = ZonedSpeedModel::new(vec![zone("far", 0.0, 299.0, 10.0), zone("near", 300.0, 720.0, 50.0)]).unwrap();
        // 8 points in "near", 50 px per frame at 10 fps => 1 m/frame => 10 m/s
        let pts: Vec<(f32, f32, u64)> = (0..8).map(|i| (50.0 * i as f32, 500.0, i)).collect();
        let speed = model.estimate(&window_from(&pts, 10), 10.0).unwrap();
        assert_relative_eq!(speed, 36.0, epsilon = 1e-6);
    }

    #[test]
    fn test_zoned_never_mixes_zones() {
        let model = ZonedSpeedModel::new(vec![zone("far", 0.0, 299.0, 10.0), zone("near", 300.0, 720.0, 50.0)]).unwrap();
        // Three huge jumps in "far", then four steady points in "near".
        let mut pts: Vec<(f32, f32, u64)> = vec![(0.0, 100.0, 0), (900.0, 150.0, 1), (0.0, 200.0, 2)];
        pts.extend((3..7).map(|i| (50.0 * i as f32, 400.0, i)));
        let window = window_from(&pts, 10);

        // At 8 fps the run of 4 near points meets support; far points must not leak in.
        let speed = model.estimate(&window, 8.0).unwrap();
        assert_relative_eq!(speed, 8.0 * 3.6, epsilon = 1e-6);

        // At 20 fps the near run (4) is below support (5) even though the window has 7.
        assert!(model.estimate(&window, 20.0).is_none());
    }

    #[test]
    fn test_zoned_outside_all_zones() {
        let model = ZonedSpeedModel::new(vec![zone("near", 300.0, 720.0, 50.0)]).unwrap();
        let pts: Vec<(f32, f32, u64)> = (0..8).map(|i| (10.0 * i as f32, 100.0, i)).collect();
        assert!(model.estimate(&window_from(&pts, 10), 10.0).is_none());
    }

    #[test]
    fn test_empty_zone_list_falls_back() {
        assert!(ZonedSpeedModel::new(vec![]).is_none());
        let model = SpeedModel::select(Some(&CalibrationData::Zoned(vec![])), true, 25.0).unwrap();
        assert_eq!(model, SpeedModel::Fallback(FallbackSpeedModel::new(25.0)));
    }

    #[test]
    fn test_select_variants() {
        assert!(SpeedModel::select(None, false, 25.0).is_none());
        assert_eq!(SpeedModel::select(None, true, 25.0).unwrap().kind(), "fallback");

        let scalar = CalibrationData::Scalar { pixels_per_meter: 40.0 };
        assert_eq!(
            SpeedModel::select(Some(&scalar), true, 25.0),
            Some(SpeedModel::Fallback(FallbackSpeedModel::new(40.0)))
        );

        let zoned = CalibrationData::Zoned(vec![zone("near", 0.0, 720.0, 30.0)]);
        assert_eq!(SpeedModel::select(Some(&zoned), true, 25.0).unwrap().kind(), "zoned");

        let degenerate = CalibrationData::FourPoint(FourPoint {
            points: [(1.0, 1.0); 4],
            reference_distance: 10.0,
            target_width: 25.0,
            target_height: 100.0,
            approximate: false,
        });
        assert_eq!(SpeedModel::select(Some(&degenerate), true, 25.0).unwrap().kind(), "fallback");
    }

    #[test]
    fn test_perspective_measures_road_plane_distance() {
        // Axis-aligned rectangle: 100 px wide, 200 px tall, 20 m long.
        let fp = FourPoint {
            points: [(0.0, 0.0), (100.0, 0.0), (100.0, 200.0), (0.0, 200.0)],
            reference_distance: 20.0,
            target_width: 25.0,
            target_height: 200.0,
            approximate: false,
        };
        let model = SpeedModel::select(Some(&CalibrationData::FourPoint(fp)), true, 25.0).unwrap();
        assert_eq!(model.kind(), "perspective");

        // 10 px per frame down the road = 1 m per frame; at 10 fps => 36 km/h.
        let pts: Vec<(f32, f32, u64)> = (0..6).map(|i| (50.0, 10.0 * i as f32, i)).collect();
        let speed = model.estimate(&window_from(&pts, 10), 10.0).unwrap();
        assert_relative_eq!(speed, 36.0, epsilon = 1e-6);
    }

    #[test]
    fn test_plausibility_window() {
        assert!(!is_plausible(0.0, 200.0));
        assert!(is_plausible(0.1, 200.0));
        assert!(is_plausible(199.9, 200.0));
        assert!(!is_plausible(200.0, 200.0));
        assert!(!is_plausible(f64::NAN, 200.0));
    }
}
