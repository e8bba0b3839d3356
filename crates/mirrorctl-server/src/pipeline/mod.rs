//! Capture→encode pipeline: bounded input queue, input/output worker
//! threads, and the trait seams for the capture backend and the hardware
//! H.264 encoder (both external collaborators).

mod synthetic;
mod worker;

#[cfg(feature = "gst-x11-backend")]
mod capture_x11;
#[cfg(feature = "gst-x11-backend")]
mod gst_encoder;

pub use synthetic::{SyntheticEncoder, SyntheticSource};
pub use worker::{ControlOp, Pipeline, PipelineEvent};

#[cfg(feature = "gst-x11-backend")]
pub use capture_x11::X11Capture;
#[cfg(feature = "gst-x11-backend")]
pub use gst_encoder::GstEncoder;

use std::time::Duration;

use crate::error::ServerError;

/// One raw captured frame, queued for encoding.
#[derive(Clone)]
pub struct CapturedFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub capture_ts_us: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Bgra,
    Bgrx,
}

/// One encoded access unit emitted by the encoder's output path.
#[derive(Debug, Clone)]
pub struct EncodedUnit {
    pub data: Vec<u8>,
    pub pts: u64,
    pub dts: u64,
    pub is_keyframe: bool,
    pub is_config: bool,
}

pub trait FrameSource: Send {
    fn next_frame(&mut self, timeout: Duration) -> Result<Option<CapturedFrame>, ServerError>;
    fn width(&self) -> u32;
    fn height(&self) -> u32;
}

pub trait VideoEncoder: Send {
    fn submit(&mut self, frame: CapturedFrame, timeout: Duration) -> Result<(), ServerError>;
    fn poll_encoded(&mut self, timeout: Duration) -> Result<Option<EncodedUnit>, ServerError>;
    fn set_bitrate(&mut self, kbps: u32) -> Result<(), ServerError>;
    fn set_framerate(&mut self, fps: u32) -> Result<(), ServerError>;
    fn set_keyframe_interval(&mut self, frames: u32) -> Result<(), ServerError>;
    fn request_keyframe(&mut self) -> Result<(), ServerError>;
    fn flush(&mut self) -> Result<(), ServerError>;
}
