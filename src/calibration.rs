//! Site calibration consumed by the speed models.
//!
//! Three stored shapes are understood:
//!
//! * zoned: `{"calibrated": true, "zones": [{"name", "y_range", "reference_points", "real_distance"}]}`
//! * scalar: `{"pixels_per_meter": 25.0}`
//! * four-point: `{"mode": "four_point", "points": [[x, y]; 4], "reference_distance", ...}`
//!
//! Calibration is authored elsewhere; this module only validates and reads it.

use nalgebra::{Matrix3, SMatrix, SVector, Vector3};
use serde::Deserialize;
use tracing::warn;

use crate::error::{Error, Result};

const DEFAULT_TARGET_WIDTH: f64 = 25.0;

/// A horizontal band of the frame with its own pixels-per-meter scale.
#[derive(Debug, Clone, PartialEq)]
pub struct Zone {
    pub name: String,
    /// Inclusive pixel rows `(min, max)`.
    pub y_range: (f32, f32),
    pub reference_points: [(f32, f32); 2],
    /// Meters spanned by `reference_points`.
    pub real_distance: f64,
    pub pixels_per_meter: f64,
}

impl Zone {
    pub fn contains(&self, y: f32) -> bool {
        y >= self.y_range.0 && y <= self.y_range.1
    }
}

/// Four image points, clockwise from top-left, outlining a road patch of
/// known length.
#[derive(Debug, Clone, PartialEq)]
pub struct FourPoint {
    pub points: [(f64, f64); 4],
    pub reference_distance: f64,
    pub target_width: f64,
    pub target_height: f64,
    pub approximate: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationData {
    Zoned(Vec<Zone>),
    Scalar { pixels_per_meter: f64 },
    FourPoint(FourPoint),
}

#[derive(Debug, Deserialize)]
struct RawZone {
    #[serde(default)]
    name: Option<String>,
    y_range: [f32; 2],
    reference_points: [[f32; 2]; 2],
    real_distance: f64,
    #[serde(default)]
    pixels_per_meter: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawCalibration {
    #[serde(default)]
    calibrated: Option<bool>,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    zones: Option<Vec<RawZone>>,
    #[serde(default)]
    pixels_per_meter: Option<f64>,
    #[serde(default)]
    points: Option<Vec<[f64; 2]>>,
    #[serde(default)]
    reference_distance: Option<f64>,
    #[serde(default)]
    target_width: Option<f64>,
    #[serde(default)]
    target_height: Option<f64>,
    #[serde(default)]
    approximate: bool,
}

impl CalibrationData {
    pub fn from_json(text: &str) -> Result<Option<Self>> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        Self::from_value(&value)
    }

    /// `Ok(None)` means "no usable calibration": null, or explicitly
    /// `"calibrated": false`.
    pub fn from_value(value: &serde_json::Value) -> Result<Option<Self>> {
        if value.is_null() {
            return Ok(None);
        }
        let raw = RawCalibration::deserialize(value)
            .map_err(|e| Error::Calibration(e.to_string()))?;

        if raw.calibrated == Some(false) {
            return Ok(None);
        }

        if raw.mode.as_deref() == Some("four_point") && raw.zones.is_none() {
            return Self::four_point_from_raw(&raw).map(Some);
        }

        if let Some(raw_zones) = raw.zones {
            let zones = raw_zones
                .into_iter()
                .enumerate()
                .filter_map(|(i, z)| zone_from_raw(i, z))
                .collect();
            return Ok(Some(CalibrationData::Zoned(zones)));
        }

        if let Some(pixels_per_meter) = raw.pixels_per_meter {
            if !(pixels_per_meter.is_finite() && pixels_per_meter > 0.0) {
                return Err(Error::Calibration(format!(
                    "pixels_per_meter must be positive, got {}",
                    pixels_per_meter
                )));
            }
            return Ok(Some(CalibrationData::Scalar { pixels_per_meter }));
        }

        Err(Error::Calibration(
            "expected zones, pixels_per_meter or four_point data".into(),
        ))
    }

    fn four_point_from_raw(raw: &RawCalibration) -> Result<Self> {
        let points = raw
            .points
            .as_deref()
            .ok_or_else(|| Error::Calibration("four_point calibration without points".into()))?;
        if points.len() != 4 {
            return Err(Error::Calibration(format!(
                "exactly 4 calibration points are required, got {}",
                points.len()
            )));
        }
        let reference_distance = raw.reference_distance.unwrap_or(0.0);
        if !(reference_distance.is_finite() && reference_distance > 0.0) {
            return Err(Error::Calibration("reference distance must be positive".into()));
        }
        let target_width = raw
            .target_width
            .filter(|w| *w > 0.0)
            .unwrap_or(DEFAULT_TARGET_WIDTH);
        let target_height = raw
            .target_height
            .filter(|h| *h > 0.0)
            .unwrap_or(reference_distance * 10.0);

        Ok(CalibrationData::FourPoint(FourPoint {
            points: [
                (points[0][0], points[0][1]),
                (points[1][0], points[1][1]),
                (points[2][0], points[2][1]),
                (points[3][0], points[3][1]),
            ],
            reference_distance,
            target_width,
            target_height,
            approximate: raw.approximate,
        }))
    }
}

fn zone_from_raw(index: usize, raw: RawZone) -> Option<Zone> {
    let name = raw.name.unwrap_or_else(|| format!("zone_{}", index));
    let [[x1, y1], [x2, y2]] = raw.reference_points;
    let span_px = ((x2 - x1) as f64).hypot((y2 - y1) as f64);

    let pixels_per_meter = match raw.pixels_per_meter {
        Some(ppm) if ppm.is_finite() && ppm > 0.0 => ppm,
        _ if raw.real_distance > 0.0 && span_px > 0.0 => span_px / raw.real_distance,
        _ => {
            warn!(zone = %name, "dropping zone without a derivable scale");
            return None;
        }
    };

    let (lo, hi) = (raw.y_range[0].min(raw.y_range[1]), raw.y_range[0].max(raw.y_range[1]));
    Some(Zone {
        name,
        y_range: (lo, hi),
        reference_points: [(x1, y1), (x2, y2)],
        real_distance: raw.real_distance,
        pixels_per_meter,
    })
}

/// Projective mapping from image pixels onto the calibrated road plane.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewTransform {
    homography: Matrix3<f64>,
    units_per_meter: f64,
}

impl ViewTransform {
    /// Solves the homography taking the four points onto the target
    /// rectangle `(0,0) (w,0) (w,h) (0,h)`. `None` for degenerate input.
    pub fn from_four_point(calib: &FourPoint) -> Option<Self> {
        let (w, h) = (calib.target_width, calib.target_height);
        let target = [(0.0, 0.0), (w, 0.0), (w, h), (0.0, h)];

        let mut a = SMatrix::<f64, 8, 8>::zeros();
        let mut b = SVector::<f64, 8>::zeros();
        for (i, (&(x, y), &(u, v))) in calib.points.iter().zip(target.iter()).enumerate() {
            let r = 2 * i;
            let rows = [
                [x, y, 1.0, 0.0, 0.0, 0.0, -u * x, -u * y],
                [0.0, 0.0, 0.0, x, y, 1.0, -v * x, -v * y],
            ];
            for (dr, row) in rows.iter().enumerate() {
                for (c, coeff) in row.iter().enumerate() {
                    a[(r + dr, c)] = *coeff;
                }
            }
            b[r] = u;
            b[r + 1] = v;
        }

        let hv = a.lu().solve(&b)?;
        if hv.iter().any(|c| !c.is_finite()) {
            return None;
        }
        let homography = Matrix3::new(hv[0], hv[1], hv[2], hv[3], hv[4], hv[5], hv[6], hv[7], 1.0);

        Some(Self {
            homography,
            units_per_meter: h / calib.reference_distance,
        })
    }

    /// Maps a pixel to road-plane meters.
    pub fn to_meters(&self, x: f32, y: f32) -> Option<(f64, f64)> {
        let p = self.homography * Vector3::new(x as f64, y as f64, 1.0);
        if p.z.abs() < 1e-12 {
            return None;
        }
        Some((
            p.x / p.z / self.units_per_meter,
            p.y / p.z / self.units_per_meter,
        ))
    }
}
