//! GStreamer-backed H.264 encoder, wrapped behind [`VideoEncoder`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use gstreamer::prelude::*;
use gstreamer::{self as gst, ClockTime, ElementFactory, FlowError};
use gstreamer_app::{AppSink, AppSinkCallbacks, AppSrc};
use tracing::{debug, info, warn};

use super::{CapturedFrame, EncodedUnit, VideoEncoder};
use crate::error::ServerError;
use crate::h264::h264_contains_idr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EncoderBackend {
    Nvidia,
    VaApi,
    Software,
}

pub struct GstEncoder {
    pipeline: gst::Pipeline,
    appsrc: AppSrc,
    encoded_rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    _bus_watch: gst::bus::BusWatchGuard,
    pipeline_error: Arc<AtomicBool>,
    sent_config: bool,
}

impl GstEncoder {
    pub fn new(
        width: u32,
        height: u32,
        framerate: u32,
        bitrate_kbps: u32,
        preferred_encoder: Option<&str>,
    ) -> Result<Self, ServerError> {
        gst::init().map_err(|e| ServerError::EncoderFailed(format!("gst init: {e}")))?;

        let (backend, encoder_name) = detect_encoder(preferred_encoder)?;
        info!(?backend, encoder_name, width, height, framerate, bitrate_kbps, "creating encoder pipeline");

        let pipeline = gst::Pipeline::new();

        let format = match backend {
            EncoderBackend::Nvidia => "BGRA",
            _ => "BGRx",
        };
        let appsrc_elem = ElementFactory::make("appsrc")
            .name("src")
            .build()
            .map_err(|e| ServerError::EncoderFailed(format!("create appsrc: {e}")))?;

        let caps = gst::Caps::builder("video/x-raw")
            .field("format", format)
            .field("width", width as i32)
            .field("height", height as i32)
            .field("framerate", gst::Fraction::new(framerate as i32, 1))
            .build();

        let appsrc = appsrc_elem
            .dynamic_cast::<AppSrc>()
            .map_err(|_| ServerError::EncoderFailed("cast to AppSrc failed".into()))?;
        appsrc.set_caps(Some(&caps));
        appsrc.set_is_live(true);
        appsrc.set_format(gst::Format::Time);
        appsrc.set_property("block", false);
        appsrc.set_property("max-bytes", 0u64);
        appsrc.set_property("min-latency", 0i64);
        appsrc.set_property("max-latency", 0i64);

        let encoder = build_encoder_element(backend, &encoder_name, bitrate_kbps)?;

        let profile_caps = gst::Caps::builder("video/x-h264")
            .field("profile", "constrained-baseline")
            .build();
        let capsfilter = ElementFactory::make("capsfilter")
            .property("caps", &profile_caps)
            .build()
            .map_err(|e| ServerError::EncoderFailed(format!("create capsfilter: {e}")))?;

        let parser = ElementFactory::make("h264parse")
            .property_from_str("config-interval", "-1")
            .build()
            .map_err(|e| ServerError::EncoderFailed(format!("create h264parse: {e}")))?;

        let parse_caps = gst::Caps::builder("video/x-h264")
            .field("stream-format", "byte-stream")
            .field("alignment", "au")
            .build();
        let parse_capsfilter = ElementFactory::make("capsfilter")
            .name("parse-caps")
            .property("caps", &parse_caps)
            .build()
            .map_err(|e| ServerError::EncoderFailed(format!("create parse capsfilter: {e}")))?;

        let appsink_elem = ElementFactory::make("appsink")
            .name("sink")
            .property("sync", false)
            .property("async", false)
            .property("emit-signals", true)
            .property("max-buffers", 1u32)
            .property("drop", true)
            .build()
            .map_err(|e| ServerError::EncoderFailed(format!("create appsink: {e}")))?;

        let appsink = appsink_elem
            .dynamic_cast::<AppSink>()
            .map_err(|_| ServerError::EncoderFailed("cast to AppSink failed".into()))?;

        let (encoded_tx, encoded_rx) = mpsc::channel::<Vec<u8>>();
        appsink.set_callbacks(
            AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| FlowError::Eos)?;
                    let buffer = sample.buffer().ok_or(FlowError::Error)?;
                    let map = buffer.map_readable().map_err(|_| FlowError::Error)?;
                    let _ = encoded_tx.send(map.to_vec());
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        match backend {
            EncoderBackend::Nvidia => {
                pipeline
                    .add_many([
                        appsrc.upcast_ref(),
                        &encoder,
                        &parser,
                        &parse_capsfilter,
                        appsink.upcast_ref(),
                    ])
                    .map_err(|e| ServerError::EncoderFailed(format!("add elements: {e}")))?;
                gst::Element::link_many([
                    appsrc.upcast_ref(),
                    &encoder,
                    &parser,
                    &parse_capsfilter,
                    appsink.upcast_ref(),
                ])
                .map_err(|e| ServerError::EncoderFailed(format!("link pipeline: {e}")))?;
            }
            _ => {
                let convert = ElementFactory::make("videoconvert")
                    .build()
                    .map_err(|e| ServerError::EncoderFailed(format!("create videoconvert: {e}")))?;
                pipeline
                    .add_many([
                        appsrc.upcast_ref(),
                        &convert,
                        &encoder,
                        &capsfilter,
                        &parser,
                        &parse_capsfilter,
                        appsink.upcast_ref(),
                    ])
                    .map_err(|e| ServerError::EncoderFailed(format!("add elements: {e}")))?;
                gst::Element::link_many([
                    appsrc.upcast_ref(),
                    &convert,
                    &encoder,
                    &capsfilter,
                    &parser,
                    &parse_capsfilter,
                    appsink.upcast_ref(),
                ])
                .map_err(|e| ServerError::EncoderFailed(format!("link pipeline: {e}")))?;
            }
        }

        let pipeline_error = Arc::new(AtomicBool::new(false));
        let pipeline_error_flag = Arc::clone(&pipeline_error);
        let bus = pipeline
            .bus()
            .ok_or_else(|| ServerError::EncoderFailed("pipeline has no bus".into()))?;
        let _bus_watch = bus
            .add_watch(move |_, msg| {
                use gst::MessageView;
                match msg.view() {
                    MessageView::Error(err) => {
                        tracing::error!(error = %err.error(), debug = ?err.debug(), "encoder pipeline error");
                        pipeline_error_flag.store(true, Ordering::Relaxed);
                    }
                    MessageView::Warning(w) => {
                        tracing::warn!(warning = %w.error(), "encoder pipeline warning");
                    }
                    _ => {}
                }
                gst::glib::ControlFlow::Continue
            })
            .map_err(|e| ServerError::EncoderFailed(format!("add bus watch: {e}")))?;

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| ServerError::EncoderFailed(format!("set Playing: {e}")))?;

        Ok(Self {
            pipeline,
            appsrc,
            encoded_rx: Mutex::new(encoded_rx),
            _bus_watch,
            pipeline_error,
            sent_config: false,
        })
    }

    fn bitrate_property_element(&self) -> Option<gst::Element> {
        for name in ["vah264enc0", "x264enc0", "nvh264enc0"] {
            if let Some(e) = self.pipeline.by_name(name) {
                return Some(e);
            }
        }
        self.pipeline.iterate_elements().into_iter().flatten().find(|elem| {
            elem.factory()
                .map(|f| f.name().contains("264enc"))
                .unwrap_or(false)
        })
    }
}

impl VideoEncoder for GstEncoder {
    fn submit(&mut self, frame: CapturedFrame, _timeout: Duration) -> Result<(), ServerError> {
        if self.pipeline_error.load(Ordering::Relaxed) {
            return Err(ServerError::EncoderFailed("pipeline is in error state".into()));
        }
        let mut buffer = gst::Buffer::from_mut_slice(frame.data);
        {
            let buffer_mut = buffer.get_mut().expect("freshly-created buffer has unique ownership");
            buffer_mut.set_pts(ClockTime::from_useconds(frame.capture_ts_us));
        }
        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| ServerError::EncoderFailed(format!("push buffer: {e}")))?;
        Ok(())
    }

    fn poll_encoded(&mut self, timeout: Duration) -> Result<Option<EncodedUnit>, ServerError> {
        let rx = self.encoded_rx.lock().unwrap_or_else(|e| e.into_inner());
        match rx.recv_timeout(timeout) {
            Ok(data) => {
                let is_keyframe = h264_contains_idr(&data);
                let is_config = !self.sent_config && !is_keyframe;
                if is_config {
                    self.sent_config = true;
                }
                Ok(Some(EncodedUnit {
                    pts: 0,
                    dts: 0,
                    is_keyframe,
                    is_config,
                    data,
                }))
            }
            Err(mpsc::RecvTimeoutError::Timeout) => Ok(None),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(ServerError::EncoderFailed("encoder pipeline disconnected".into()))
            }
        }
    }

    fn set_bitrate(&mut self, kbps: u32) -> Result<(), ServerError> {
        match self.bitrate_property_element() {
            Some(elem) => {
                elem.set_property("bitrate", kbps);
                debug!(kbps, "bitrate updated");
                Ok(())
            }
            None => Err(ServerError::EncoderFailed("no encoder element found".into())),
        }
    }

    fn set_framerate(&mut self, fps: u32) -> Result<(), ServerError> {
        if let Some(src) = self.pipeline.by_name("src") {
            let caps = gst::Caps::builder("video/x-raw")
                .field("framerate", gst::Fraction::new(fps as i32, 1))
                .build();
            src.set_property("caps", &caps);
        }
        Ok(())
    }

    fn set_keyframe_interval(&mut self, frames: u32) -> Result<(), ServerError> {
        if let Some(elem) = self.bitrate_property_element() {
            elem.set_property("key-int-max", frames);
        }
        Ok(())
    }

    fn request_keyframe(&mut self) -> Result<(), ServerError> {
        let event = gstreamer_video::UpstreamForceKeyUnitEvent::builder()
            .all_headers(true)
            .build();
        self.appsrc.send_event(event);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), ServerError> {
        let rx = self.encoded_rx.lock().unwrap_or_else(|e| e.into_inner());
        while rx.try_recv().is_ok() {}
        Ok(())
    }
}

impl Drop for GstEncoder {
    fn drop(&mut self) {
        let _ = self.appsrc.end_of_stream();
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

fn can_instantiate(name: &str) -> bool {
    match ElementFactory::make(name).build() {
        Ok(elem) => {
            let _ = elem.set_state(gst::State::Null);
            true
        }
        Err(_) => false,
    }
}

fn detect_encoder(preferred: Option<&str>) -> Result<(EncoderBackend, String), ServerError> {
    if let Some(pref) = preferred {
        let backend = match pref {
            "nvh264enc" => EncoderBackend::Nvidia,
            "vah264enc" => EncoderBackend::VaApi,
            "x264enc" => EncoderBackend::Software,
            other => {
                return Err(ServerError::InvalidParams(format!(
                    "unknown encoder '{other}', expected nvh264enc, vah264enc, or x264enc"
                )))
            }
        };
        if can_instantiate(pref) {
            info!(encoder = pref, "using preferred encoder");
            return Ok((backend, pref.to_string()));
        }
        warn!(encoder = pref, "preferred encoder unavailable, falling back to auto-detect");
    }

    let candidates = [
        (EncoderBackend::Nvidia, "nvh264enc"),
        (EncoderBackend::VaApi, "vah264enc"),
        (EncoderBackend::Software, "x264enc"),
    ];
    for (backend, name) in candidates {
        if can_instantiate(name) {
            info!(encoder = name, "found working encoder");
            return Ok((backend, name.to_string()));
        }
    }

    Err(ServerError::EncoderFailed(
        "no H.264 encoder found; install gstreamer-plugins-good/bad/ugly".into(),
    ))
}

fn build_encoder_element(
    backend: EncoderBackend,
    name: &str,
    bitrate_kbps: u32,
) -> Result<gst::Element, ServerError> {
    let elem = match backend {
        EncoderBackend::Nvidia => ElementFactory::make(name)
            .property_from_str("preset", "low-latency-hq")
            .property_from_str("rc-mode", "cbr-ld-hq")
            .property("bitrate", bitrate_kbps)
            .property("gop-size", i32::MAX)
            .property("zerolatency", true)
            .property("rc-lookahead", 0u32)
            .property("bframes", 0u32)
            .build()
            .map_err(|e| ServerError::EncoderFailed(format!("create nvh264enc: {e}")))?,
        EncoderBackend::VaApi => ElementFactory::make(name)
            .property_from_str("rate-control", "cbr")
            .property("bitrate", bitrate_kbps)
            .property("target-usage", 7u32)
            .property("key-int-max", 60u32)
            .build()
            .map_err(|e| ServerError::EncoderFailed(format!("create vah264enc: {e}")))?,
        EncoderBackend::Software => ElementFactory::make(name)
            .property_from_str("tune", "zerolatency")
            .property_from_str("speed-preset", "ultrafast")
            .property("bitrate", bitrate_kbps)
            .property("key-int-max", 30u32)
            .property("bframes", 0u32)
            .build()
            .map_err(|e| ServerError::EncoderFailed(format!("create x264enc: {e}")))?,
    };
    Ok(elem)
}
