//! Decoder harness (spec.md §4.10): drives an external H.264 decoder behind
//! a trait seam, tracks rolling statistics, and escalates to a terminal
//! state after too many consecutive decode errors.
//!
//! The harness's rolling-stats/escalation logic has no direct teacher
//! analogue (the teacher streams to a browser, which decodes in WebRTC) but
//! follows the style of the teacher's `abr.rs` loop: periodic snapshot,
//! simple counters, a `tracing::debug!` summary rather than a full metrics
//! pipeline.

use std::time::Instant;

use crate::error::DecodeError;

pub const MAX_DECODE_ERRORS: u32 = 10;
pub const STATS_UPDATE_INTERVAL_FRAMES: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputPixelFormat {
    /// Packed 24-bit RGB, 3 bytes per pixel, row-major.
    Rgb24,
}

#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub pixel_format: OutputPixelFormat,
    pub pts: u64,
}

/// External collaborator seam (spec.md §1): the decoder library itself is
/// out of scope, only this contract is specified.
pub trait H264Decoder: Send {
    fn decode(&mut self, au: &[u8], is_keyframe: bool) -> Result<Option<DecodedImage>, DecodeError>;
    fn reset(&mut self) -> Result<(), DecodeError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecoderStatsSnapshot {
    pub frame_count: u64,
    pub error_count: u64,
    pub average_fps: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HarnessState {
    Running,
    Error,
}

pub struct TargetGeometry {
    pub width: u32,
    pub height: u32,
    pub pixel_format: OutputPixelFormat,
}

impl Default for TargetGeometry {
    fn default() -> Self {
        Self { width: 1080, height: 1920, pixel_format: OutputPixelFormat::Rgb24 }
    }
}

/// Wraps a [`H264Decoder`] with the spec'd stats/error-escalation/
/// auto-resize behavior. One harness per device connection.
pub struct DecoderHarness {
    decoder: Box<dyn H264Decoder>,
    target: TargetGeometry,
    auto_resize: bool,
    resized: bool,
    state: HarnessState,
    consecutive_errors: u32,
    frame_count: u64,
    error_count: u64,
    window_start: Instant,
    frames_since_window: u64,
    average_fps: f64,
    on_stats: Option<Box<dyn FnMut(DecoderStatsSnapshot) + Send>>,
}

impl DecoderHarness {
    pub fn new(decoder: Box<dyn H264Decoder>, target: TargetGeometry, auto_resize: bool) -> Self {
        Self {
            decoder,
            target,
            auto_resize,
            resized: false,
            state: HarnessState::Running,
            consecutive_errors: 0,
            frame_count: 0,
            error_count: 0,
            window_start: Instant::now(),
            frames_since_window: 0,
            average_fps: 0.0,
            on_stats: None,
        }
    }

    /// Registers the single stats-update observer (spec.md §9:
    /// "single-producer" callback registration in place of reflecting a
    /// UI-framework signal/slot system into this domain model).
    pub fn on_stats_update(&mut self, callback: Box<dyn FnMut(DecoderStatsSnapshot) + Send>) {
        self.on_stats = Some(callback);
    }

    pub fn target(&self) -> (u32, u32) {
        (self.target.width, self.target.height)
    }

    /// Primes the decoder with a cached `VIDEO_CONFIG` blob. Decode errors
    /// while priming are tolerated: a config blob may not itself be a full
    /// access unit, and the first real `VIDEO_DATA` unit will retry.
    pub fn prime(&mut self, config: &[u8]) {
        let _ = self.decoder.decode(config, false);
    }

    /// Feeds one access unit through the decoder. Returns the decoded image
    /// when one was produced, `None` when the decoder consumed the unit
    /// without emitting a picture yet (e.g. still waiting on its first
    /// keyframe), and `Err(DecodeError::Terminal)` once the harness has
    /// escalated past [`MAX_DECODE_ERRORS`] consecutive failures.
    pub fn submit(&mut self, au: &[u8], is_keyframe: bool) -> Result<Option<DecodedImage>, DecodeError> {
        if self.state == HarnessState::Error {
            return Err(DecodeError::Terminal);
        }

        match self.decoder.decode(au, is_keyframe) {
            Ok(Some(mut image)) => {
                self.consecutive_errors = 0;
                self.frame_count += 1;
                self.frames_since_window += 1;
                self.tick_stats();

                if self.auto_resize && !self.resized {
                    self.target.width = image.width;
                    self.target.height = image.height;
                    self.resized = true;
                }
                image.pixel_format = self.target.pixel_format;
                Ok(Some(image))
            }
            Ok(None) => {
                self.consecutive_errors = 0;
                Ok(None)
            }
            Err(e) => {
                self.error_count += 1;
                self.consecutive_errors += 1;
                if self.consecutive_errors >= MAX_DECODE_ERRORS {
                    self.state = HarnessState::Error;
                    tracing::error!(
                        consecutive_errors = self.consecutive_errors,
                        "decoder exceeded consecutive-error budget, escalating to terminal state"
                    );
                    return Err(DecodeError::Terminal);
                }
                Err(e)
            }
        }
    }

    fn tick_stats(&mut self) {
        if self.frames_since_window < STATS_UPDATE_INTERVAL_FRAMES {
            return;
        }
        let elapsed = self.window_start.elapsed().as_secs_f64().max(f64::EPSILON);
        self.average_fps = self.frames_since_window as f64 / elapsed;
        self.frames_since_window = 0;
        self.window_start = Instant::now();

        let snapshot = self.stats();
        tracing::debug!(
            frame_count = snapshot.frame_count,
            error_count = snapshot.error_count,
            average_fps = snapshot.average_fps,
            "decoder stats"
        );
        if let Some(cb) = self.on_stats.as_mut() {
            cb(snapshot);
        }
    }

    pub fn stats(&self) -> DecoderStatsSnapshot {
        DecoderStatsSnapshot {
            frame_count: self.frame_count,
            error_count: self.error_count,
            average_fps: self.average_fps,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state == HarnessState::Error
    }

    pub fn reset(&mut self) -> Result<(), DecodeError> {
        self.decoder.reset()?;
        self.state = HarnessState::Running;
        self.consecutive_errors = 0;
        self.resized = false;
        Ok(())
    }
}

/// Always-available test double: treats the whole access unit as already
/// "decoded", emitting a flat-gray image at the target size. Mirrors the
/// server-side `SyntheticEncoder`'s role of letting the bounded-queue/
/// fan-out tests run without a real codec.
pub struct SyntheticDecoder {
    width: u32,
    height: u32,
}

impl SyntheticDecoder {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl H264Decoder for SyntheticDecoder {
    fn decode(&mut self, au: &[u8], _is_keyframe: bool) -> Result<Option<DecodedImage>, DecodeError> {
        if au.is_empty() {
            return Ok(None);
        }
        let size = (self.width * self.height * 3) as usize;
        Ok(Some(DecodedImage {
            data: vec![128u8; size],
            width: self.width,
            height: self.height,
            pixel_format: OutputPixelFormat::Rgb24,
            pts: 0,
        }))
    }

    fn reset(&mut self) -> Result<(), DecodeError> {
        Ok(())
    }
}

#[cfg(feature = "openh264-backend")]
pub mod openh264_backend {
    use super::{DecodeError, DecodedImage, H264Decoder, OutputPixelFormat};
    use openh264::decoder::{Decoder, DecoderConfig};
    use openh264::formats::YUVSource;

    /// Default decoder: wraps Cisco's `openh264` safe Rust binding, the
    /// same "accept access units, emit raw frames" contract this harness
    /// specifies, behind the `openh264-backend` feature — named after the
    /// server side's `gst-x11-backend` gate.
    pub struct OpenH264Decoder {
        inner: Decoder,
    }

    impl OpenH264Decoder {
        pub fn new() -> Result<Self, DecodeError> {
            let inner = Decoder::with_config(DecoderConfig::default())
                .map_err(|e| DecodeError::BackendFailed(e.to_string()))?;
            Ok(Self { inner })
        }
    }

    impl H264Decoder for OpenH264Decoder {
        fn decode(&mut self, au: &[u8], _is_keyframe: bool) -> Result<Option<DecodedImage>, DecodeError> {
            let yuv = self
                .inner
                .decode(au)
                .map_err(|e| DecodeError::BackendFailed(e.to_string()))?;
            let Some(yuv) = yuv else {
                return Ok(None);
            };
            let (width, height) = yuv.dimensions();
            let mut rgb = vec![0u8; width * height * 3];
            yuv.write_rgb8(&mut rgb);
            Ok(Some(DecodedImage {
                data: rgb,
                width: width as u32,
                height: height as u32,
                pixel_format: OutputPixelFormat::Rgb24,
                pts: 0,
            }))
        }

        fn reset(&mut self) -> Result<(), DecodeError> {
            self.inner = Decoder::with_config(DecoderConfig::default())
                .map_err(|e| DecodeError::BackendFailed(e.to_string()))?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysErrors;
    impl H264Decoder for AlwaysErrors {
        fn decode(&mut self, _au: &[u8], _is_keyframe: bool) -> Result<Option<DecodedImage>, DecodeError> {
            Err(DecodeError::BackendFailed("boom".into()))
        }
        fn reset(&mut self) -> Result<(), DecodeError> {
            Ok(())
        }
    }

    #[test]
    fn synthetic_decoder_emits_a_frame_for_nonempty_input() {
        let mut harness = DecoderHarness::new(Box::new(SyntheticDecoder::new(64, 64)), TargetGeometry::default(), false);
        let out = harness.submit(&[1, 2, 3], true).unwrap();
        assert!(out.is_some());
        assert_eq!(harness.stats().frame_count, 1);
    }

    #[test]
    fn escalates_to_terminal_after_max_consecutive_errors() {
        let mut harness = DecoderHarness::new(Box::new(AlwaysErrors), TargetGeometry::default(), false);
        for _ in 0..MAX_DECODE_ERRORS - 1 {
            assert!(harness.submit(&[1], false).is_err());
            assert!(!harness.is_terminal());
        }
        let last = harness.submit(&[1], false);
        assert!(matches!(last, Err(DecodeError::Terminal)));
        assert!(harness.is_terminal());
        // Once terminal, every further submit short-circuits to Terminal.
        assert!(matches!(harness.submit(&[1], false), Err(DecodeError::Terminal)));
    }

    #[test]
    fn a_success_resets_the_consecutive_error_counter() {
        struct FlakyThenGood {
            calls: u32,
        }
        impl H264Decoder for FlakyThenGood {
            fn decode(&mut self, _au: &[u8], _is_keyframe: bool) -> Result<Option<DecodedImage>, DecodeError> {
                self.calls += 1;
                if self.calls <= MAX_DECODE_ERRORS - 1 {
                    Err(DecodeError::BackendFailed("flaky".into()))
                } else {
                    Ok(Some(DecodedImage {
                        data: vec![],
                        width: 1,
                        height: 1,
                        pixel_format: OutputPixelFormat::Rgb24,
                        pts: 0,
                    }))
                }
            }
            fn reset(&mut self) -> Result<(), DecodeError> {
                Ok(())
            }
        }
        let mut harness =
            DecoderHarness::new(Box::new(FlakyThenGood { calls: 0 }), TargetGeometry::default(), false);
        for _ in 0..MAX_DECODE_ERRORS - 1 {
            assert!(harness.submit(&[1], false).is_err());
        }
        assert!(harness.submit(&[1], true).unwrap().is_some());
        assert!(!harness.is_terminal());
        // another full error budget is available after the reset
        for _ in 0..MAX_DECODE_ERRORS - 1 {
            assert!(harness.submit(&[1], false).is_err());
            assert!(!harness.is_terminal());
        }
    }

    #[test]
    fn auto_resize_adopts_first_frames_native_size() {
        let mut harness = DecoderHarness::new(Box::new(SyntheticDecoder::new(320, 240)), TargetGeometry::default(), true);
        assert_eq!(harness.target(), (1080, 1920));
        harness.submit(&[1], true).unwrap();
        assert_eq!(harness.target(), (320, 240));
    }

    #[test]
    fn reset_clears_terminal_state() {
        let mut harness = DecoderHarness::new(Box::new(AlwaysErrors), TargetGeometry::default(), false);
        for _ in 0..MAX_DECODE_ERRORS {
            let _ = harness.submit(&[1], false);
        }
        assert!(harness.is_terminal());
        harness.reset().unwrap();
        assert!(!harness.is_terminal());
    }
}
