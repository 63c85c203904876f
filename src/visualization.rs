use crate::detection::Detection;
use crate::error::Result;
use crate::trajectory::Window;

/// RGB.
pub type Color = (u8, u8, u8);

const COLORS: &[Color] = &[
    (255, 0, 0),   // Red
    (0, 255, 0),   // Green
    (0, 0, 255),   // Blue
    (255, 255, 0), // Yellow
    (255, 0, 255), // Magenta
    (0, 255, 255), // Cyan
];

const OUTLINE: Color = (0, 0, 0);

pub fn color_for(track_id: u32) -> Color {
    COLORS[track_id as usize % COLORS.len()]
}

/// Drawing surface the annotator renders onto. Implementations draw on
/// `self`; the annotator always works on a clone of the input frame.
pub trait Canvas: Clone {
    fn draw_rect(&mut self, tl: (i32, i32), br: (i32, i32), color: Color, thickness: i32) -> Result<()>;

    fn draw_line(&mut self, from: (i32, i32), to: (i32, i32), color: Color, thickness: i32) -> Result<()>;

    /// `origin` is the bottom-left corner of the text.
    fn draw_text(
        &mut self,
        text: &str,
        origin: (i32, i32),
        scale: f64,
        color: Color,
        thickness: i32,
    ) -> Result<()>;
}

/// `#<id>` or `#<id> <speed> km/h`, speed truncated to whole km/h.
pub fn format_label(track_id: u32, speed: Option<f64>) -> String {
    match speed {
        Some(kmh) => format!("#{} {} km/h", track_id, kmh.trunc() as i64),
        None => format!("#{}", track_id),
    }
}

/// What to draw for one detection this frame.
pub struct TrackOverlay<'a> {
    pub detection: &'a Detection,
    pub trail: Option<&'a Window>,
    pub label: String,
}

/// Renders traces, boxes and labels. Holds only style, no per-run state.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameAnnotator {
    pub thickness: i32,
    pub text_scale: f64,
}

impl FrameAnnotator {
    /// Line thickness and text scale proportional to the frame size.
    pub fn for_resolution(width: u32, height: u32) -> Self {
        let min_dim = width.min(height);
        let thickness = if min_dim < 1080 { 2 } else { 4 };
        let text_scale = (min_dim as f64 * 1e-3).max(0.4);
        Self {
            thickness,
            text_scale,
        }
    }

    pub fn annotate<F: Canvas>(&self, frame: &F, overlays: &[TrackOverlay<'_>]) -> Result<F> {
        let mut out = frame.clone();

        for overlay in overlays {
            if let Some(trail) = overlay.trail {
                let color = color_for(overlay.detection.track_id);
                let points: Vec<(i32, i32)> = trail.iter().map(|p| (p.x as i32, p.y as i32)).collect();
                for pair in points.windows(2) {
                    out.draw_line(pair[0], pair[1], color, self.thickness)?;
                }
            }
        }

        for overlay in overlays {
            let tlwh = overlay.detection.tlwh();
            let tl = (tlwh[0] as i32, tlwh[1] as i32);
            let br = ((tlwh[0] + tlwh[2]) as i32, (tlwh[1] + tlwh[3]) as i32);
            out.draw_rect(tl, br, color_for(overlay.detection.track_id), self.thickness)?;
        }

        for overlay in overlays {
            let (ax, ay) = overlay.detection.anchor();
            // Rough centring; glyphs are ~20 px wide at scale 1.0.
            let half_width = (overlay.label.len() as f64 * 10.0 * self.text_scale) as i32;
            let origin = (ax as i32 - half_width, ay as i32 + (20.0 * self.text_scale) as i32);
            let color = color_for(overlay.detection.track_id);
            out.draw_text(&overlay.label, origin, self.text_scale, OUTLINE, self.thickness + 2)?;
            out.draw_text(&overlay.label, origin, self.text_scale, color, self.thickness)?;
        }

        Ok(out)
    }
}

#[cfg(feature = "opencv")]
mod cv {
    use opencv::{
        core::{Mat, Point, Rect, Scalar},
        imgproc,
        prelude::*,
    };

    use super::{Canvas, Color};
    use crate::error::Result;

    // Mat frames are BGR.
    fn scalar(color: Color) -> Scalar {
        Scalar::new(color.2 as f64, color.1 as f64, color.0 as f64, 0.0)
    }

    impl Canvas for Mat {
        fn draw_rect(&mut self, tl: (i32, i32), br: (i32, i32), color: Color, thickness: i32) -> Result<()> {
            let rect = Rect::new(tl.0, tl.1, br.0 - tl.0, br.1 - tl.1);
            imgproc::rectangle(self, rect, scalar(color), thickness, imgproc::LINE_8, 0)?;
            Ok(())
        }

        fn draw_line(&mut self, from: (i32, i32), to: (i32, i32), color: Color, thickness: i32) -> Result<()> {
            imgproc::line(
                self,
                Point::new(from.0, from.1),
                Point::new(to.0, to.1),
                scalar(color),
                thickness,
                imgproc::LINE_AA,
                0,
            )?;
            Ok(())
        }

        fn draw_text(
            &mut self,
            text: &str,
            origin: (i32, i32),
            scale: f64,
            color: Color,
            thickness: i32,
        ) -> Result<()> {
            imgproc::put_text(
                self,
                text,
                Point::new(origin.0, origin.1),
                imgproc::FONT_HERSHEY_SIMPLEX,
                scale,
                scalar(color),
                thickness,
                imgproc::LINE_8,
                false,
            )?;
            Ok(())
        }
    }
}
