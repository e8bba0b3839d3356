//! Always-available `FrameSource`/`VideoEncoder` test doubles. These never
//! touch X11 or GStreamer, so the pipeline's concurrency and control-op
//! behavior can be exercised without the `gst-x11-backend` feature.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::{CapturedFrame, EncodedUnit, FrameSource, PixelFormat, VideoEncoder};
use crate::error::ServerError;

/// Generates solid-color BGRA frames at a fixed size, paced to roughly the
/// requested frame interval.
pub struct SyntheticSource {
    width: u32,
    height: u32,
    frame_number: u64,
    last_emit: Instant,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32, _fps: u32) -> Self {
        Self {
            width,
            height,
            frame_number: 0,
            last_emit: Instant::now() - Duration::from_secs(1),
        }
    }
}

impl FrameSource for SyntheticSource {
    fn next_frame(&mut self, timeout: Duration) -> Result<Option<CapturedFrame>, ServerError> {
        let elapsed = self.last_emit.elapsed();
        if elapsed < timeout {
            std::thread::sleep(timeout - elapsed);
        }
        self.last_emit = Instant::now();
        self.frame_number += 1;
        let shade = (self.frame_number % 256) as u8;
        let data = vec![shade; (self.width * self.height * 4) as usize];
        Ok(Some(CapturedFrame {
            data,
            width: self.width,
            height: self.height,
            pixel_format: PixelFormat::Bgra,
            capture_ts_us: self.frame_number * 1000,
        }))
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }
}

/// Treats each submitted frame as one access unit, without real H.264
/// encoding. Every `keyframe_interval`-th unit is flagged as a keyframe; the
/// first submission always emits a synthetic codec-config unit first, the
/// way a real encoder would emit SPS/PPS before the first picture.
pub struct SyntheticEncoder {
    keyframe_interval: u32,
    count: u32,
    pending: VecDeque<EncodedUnit>,
    sent_config: bool,
    bitrate_kbps: u32,
    fps: u32,
}

impl SyntheticEncoder {
    pub fn new(keyframe_interval: u32) -> Self {
        Self {
            keyframe_interval: keyframe_interval.max(1),
            count: 0,
            pending: VecDeque::new(),
            sent_config: false,
            bitrate_kbps: 4000,
            fps: 30,
        }
    }
}

impl VideoEncoder for SyntheticEncoder {
    fn submit(&mut self, frame: CapturedFrame, _timeout: Duration) -> Result<(), ServerError> {
        if !self.sent_config {
            self.pending.push_back(EncodedUnit {
                data: vec![0x00, 0x00, 0x00, 0x01, 0x67],
                pts: frame.capture_ts_us,
                dts: frame.capture_ts_us,
                is_keyframe: false,
                is_config: true,
            });
            self.sent_config = true;
        }

        self.count += 1;
        let is_keyframe = self.count % self.keyframe_interval == 1;
        self.pending.push_back(EncodedUnit {
            data: frame.data,
            pts: frame.capture_ts_us,
            dts: frame.capture_ts_us,
            is_keyframe,
            is_config: false,
        });
        Ok(())
    }

    fn poll_encoded(&mut self, _timeout: Duration) -> Result<Option<EncodedUnit>, ServerError> {
        Ok(self.pending.pop_front())
    }

    fn set_bitrate(&mut self, kbps: u32) -> Result<(), ServerError> {
        self.bitrate_kbps = kbps;
        Ok(())
    }

    fn set_framerate(&mut self, fps: u32) -> Result<(), ServerError> {
        self.fps = fps;
        Ok(())
    }

    fn set_keyframe_interval(&mut self, frames: u32) -> Result<(), ServerError> {
        self.keyframe_interval = frames.max(1);
        Ok(())
    }

    fn request_keyframe(&mut self) -> Result<(), ServerError> {
        self.count = 0;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), ServerError> {
        self.pending.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_submission_yields_config_then_keyframe() {
        let mut enc = SyntheticEncoder::new(3);
        let frame = CapturedFrame {
            data: vec![1, 2, 3],
            width: 4,
            height: 4,
            pixel_format: PixelFormat::Bgra,
            capture_ts_us: 10,
        };
        enc.submit(frame, Duration::from_millis(1)).unwrap();

        let config = enc.poll_encoded(Duration::from_millis(1)).unwrap().unwrap();
        assert!(config.is_config);

        let unit = enc.poll_encoded(Duration::from_millis(1)).unwrap().unwrap();
        assert!(!unit.is_config);
        assert!(unit.is_keyframe);
    }

    #[test]
    fn request_keyframe_resets_cadence() {
        let mut enc = SyntheticEncoder::new(2);
        let frame = |ts| CapturedFrame {
            data: vec![0],
            width: 1,
            height: 1,
            pixel_format: PixelFormat::Bgra,
            capture_ts_us: ts,
        };
        enc.submit(frame(1), Duration::from_millis(1)).unwrap();
        enc.poll_encoded(Duration::from_millis(1)).unwrap(); // config
        enc.poll_encoded(Duration::from_millis(1)).unwrap(); // keyframe #1

        enc.submit(frame(2), Duration::from_millis(1)).unwrap();
        let second = enc.poll_encoded(Duration::from_millis(1)).unwrap().unwrap();
        assert!(!second.is_keyframe);

        enc.request_keyframe().unwrap();
        enc.submit(frame(3), Duration::from_millis(1)).unwrap();
        let after_request = enc.poll_encoded(Duration::from_millis(1)).unwrap().unwrap();
        assert!(after_request.is_keyframe);
    }
}
