use num_traits::cast::ToPrimitive;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoMetadata {
    pub fps: f64,
    /// As reported by the container; may be 0 or approximate.
    pub total_frames: u64,
    pub width: u32,
    pub height: u32,
}

impl VideoMetadata {
    /// Frames in one second of video, the trajectory window length.
    pub fn frames_per_second(&self) -> usize {
        self.fps.round().to_usize().unwrap_or(0).max(1)
    }
}

/// Decoded frames, in presentation order.
pub trait FrameSource {
    type Frame;

    fn metadata(&self) -> VideoMetadata;

    /// `Ok(None)` at end of stream.
    fn next_frame(&mut self) -> Result<Option<Self::Frame>>;
}

pub trait FrameSink<F> {
    fn write_frame(&mut self, frame: &F) -> Result<()>;

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(feature = "opencv")]
pub use self::cv::{VideoFileSink, VideoFileSource};

#[cfg(feature = "opencv")]
mod cv {
    use opencv::{
        core::{Mat, Size},
        prelude::*,
        videoio::{self, VideoCapture, VideoWriter},
    };
    use std::fs;
    use std::path::Path;
    use tracing::info;

    use super::{FrameSink, FrameSource, VideoMetadata};
    use crate::error::{Error, Result};

    pub struct VideoFileSource {
        cap: VideoCapture,
        meta: VideoMetadata,
    }

    impl VideoFileSource {
        pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
            let path = path.as_ref();
            let cap = VideoCapture::from_file(&path.to_string_lossy(), videoio::CAP_ANY)?;
            if !cap.is_opened()? {
                return Err(Error::Source(format!("failed to open {}", path.display())));
            }

            let fps = cap.get(videoio::CAP_PROP_FPS)?;
            if !(fps.is_finite() && fps > 0.0) {
                return Err(Error::Source(format!("{} reports no frame rate", path.display())));
            }
            let meta = VideoMetadata {
                fps,
                total_frames: cap.get(videoio::CAP_PROP_FRAME_COUNT)?.max(0.0) as u64,
                width: cap.get(videoio::CAP_PROP_FRAME_WIDTH)?.max(0.0) as u32,
                height: cap.get(videoio::CAP_PROP_FRAME_HEIGHT)?.max(0.0) as u32,
            };
            info!(
                path = %path.display(),
                width = meta.width,
                height = meta.height,
                fps = meta.fps,
                total_frames = meta.total_frames,
                "opened video"
            );
            Ok(Self { cap, meta })
        }
    }

    impl FrameSource for VideoFileSource {
        type Frame = Mat;

        fn metadata(&self) -> VideoMetadata {
            self.meta
        }

        fn next_frame(&mut self) -> Result<Option<Mat>> {
            let mut frame = Mat::default();
            if !self.cap.read(&mut frame)? || frame.empty() {
                return Ok(None);
            }
            Ok(Some(frame))
        }
    }

    pub struct VideoFileSink {
        writer: VideoWriter,
    }

    impl VideoFileSink {
        pub fn create<P: AsRef<Path>>(path: P, meta: &VideoMetadata) -> Result<Self> {
            let path = path.as_ref();
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let fourcc = VideoWriter::fourcc('m', 'p', '4', 'v')?;
            let writer = VideoWriter::new(
                &path.to_string_lossy(),
                fourcc,
                meta.fps,
                Size::new(meta.width as i32, meta.height as i32),
                true,
            )?;
            if !writer.is_opened()? {
                return Err(Error::Sink(format!("failed to open writer for {}", path.display())));
            }
            Ok(Self { writer })
        }
    }

    impl FrameSink<Mat> for VideoFileSink {
        fn write_frame(&mut self, frame: &Mat) -> Result<()> {
            self.writer.write(frame)?;
            Ok(())
        }

        fn finish(&mut self) -> Result<()> {
            self.writer.release()?;
            Ok(())
        }
    }
}
