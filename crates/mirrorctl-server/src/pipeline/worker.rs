use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::{CapturedFrame, EncodedUnit, FrameSource, VideoEncoder};
use crate::error::ServerError;

/// A non-blocking bounded queue: `enqueue` drops the incoming item and
/// reports the drop rather than blocking the producer.
struct BoundedQueue<T> {
    inner: Mutex<VecDeque<T>>,
    not_empty: Condvar,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            not_empty: Condvar::new(),
            capacity,
        }
    }

    /// Returns `true` if the item was enqueued, `false` if the queue was
    /// full and the item was dropped.
    fn enqueue(&self, item: T) -> bool {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if guard.len() >= self.capacity {
            return false;
        }
        guard.push_back(item);
        self.not_empty.notify_one();
        true
    }

    fn dequeue(&self, timeout: Duration) -> Option<T> {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let (mut guard, _) = self
            .not_empty
            .wait_timeout_while(guard, timeout, |q| q.is_empty())
            .unwrap_or_else(|e| e.into_inner());
        guard.pop_front()
    }
}

/// Runtime control operations accepted by the pipeline while it is running.
#[derive(Debug, Clone)]
pub enum ControlOp {
    SetBitrate(u32),
    SetFramerate(u32),
    SetKeyframeInterval(u32),
    RequestKeyframe,
    Flush,
}

/// Events the pipeline raises for the owning session to forward as packets.
pub enum PipelineEvent {
    Encoded(EncodedUnit),
}

/// Orchestrates a [`FrameSource`] and a [`VideoEncoder`] across an input
/// worker and an output worker, connected by a bounded, drop-on-full queue.
pub struct Pipeline {
    input_handle: Option<JoinHandle<()>>,
    output_handle: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
    control_tx: Sender<ControlOp>,
    dropped_frames: Arc<AtomicU64>,
    event_rx: Receiver<PipelineEvent>,
}

const FRAME_BUFFER_WAIT: Duration = Duration::from_millis(10);

impl Pipeline {
    pub fn start(
        mut source: Box<dyn FrameSource>,
        mut encoder: Box<dyn VideoEncoder>,
        queue_capacity: usize,
        target_fps: u32,
    ) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let dropped_frames = Arc::new(AtomicU64::new(0));
        let queue = Arc::new(BoundedQueue::<CapturedFrame>::new(queue_capacity));
        let (control_tx, control_rx) = mpsc::channel::<ControlOp>();
        let (event_tx, event_rx) = mpsc::channel::<PipelineEvent>();

        let frame_interval = Duration::from_millis(1000 / target_fps.max(1) as u64);

        let input_handle = {
            let running = Arc::clone(&running);
            let queue = Arc::clone(&queue);
            let dropped_frames = Arc::clone(&dropped_frames);
            std::thread::Builder::new()
                .name("pipeline-capture-in".into())
                .spawn(move || {
                    while running.load(Ordering::Relaxed) {
                        match source.next_frame(frame_interval) {
                            Ok(Some(frame)) => {
                                if !queue.enqueue(frame) {
                                    dropped_frames.fetch_add(1, Ordering::Relaxed);
                                }
                            }
                            Ok(None) => {}
                            Err(e) => {
                                warn!(error = %e, "capture failed, dropping frame");
                                dropped_frames.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                })
                .expect("spawn capture input worker")
        };

        let output_handle = {
            let running = Arc::clone(&running);
            let queue = Arc::clone(&queue);
            std::thread::Builder::new()
                .name("pipeline-encode-out".into())
                .spawn(move || {
                    let mut last_enqueued_at = Instant::now();
                    while running.load(Ordering::Relaxed) {
                        if let Ok(op) = control_rx.try_recv() {
                            apply_control_op(encoder.as_mut(), op);
                        }

                        if let Some(frame) = queue.dequeue(FRAME_BUFFER_WAIT) {
                            last_enqueued_at = Instant::now();
                            if let Err(e) = encoder.submit(frame, Duration::from_millis(10)) {
                                // Re-submission is only worthwhile within one frame
                                // interval; past that the frame is stale.
                                if last_enqueued_at.elapsed() < frame_interval {
                                    debug!(error = %e, "encoder busy, will retry next sweep");
                                } else {
                                    warn!(error = %e, "dropping stale frame after encoder busy");
                                }
                            }
                        }

                        match encoder.poll_encoded(Duration::from_millis(10)) {
                            Ok(Some(unit)) => {
                                let _ = event_tx.send(PipelineEvent::Encoded(unit));
                            }
                            Ok(None) => {}
                            Err(e) => warn!(error = %e, "encoder poll failed"),
                        }
                    }
                })
                .expect("spawn encode output worker")
        };

        Self {
            input_handle: Some(input_handle),
            output_handle: Some(output_handle),
            running,
            control_tx,
            dropped_frames,
            event_rx,
        }
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    pub fn send_control(&self, op: ControlOp) -> Result<(), ServerError> {
        self.control_tx
            .send(op)
            .map_err(|_| ServerError::NotRunning)
    }

    /// Non-blocking poll for the next encoded unit raised by the output
    /// worker; the session forwards it to the fan-out hub.
    pub fn try_recv_event(&self) -> Option<PipelineEvent> {
        self.event_rx.try_recv().ok()
    }

    pub fn stop(mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(h) = self.input_handle.take() {
            let _ = h.join();
        }
        if let Some(h) = self.output_handle.take() {
            let _ = h.join();
        }
    }
}

fn apply_control_op(encoder: &mut dyn VideoEncoder, op: ControlOp) {
    let result = match op {
        ControlOp::SetBitrate(kbps) => encoder.set_bitrate(kbps),
        ControlOp::SetFramerate(fps) => encoder.set_framerate(fps),
        ControlOp::SetKeyframeInterval(frames) => encoder.set_keyframe_interval(frames),
        ControlOp::RequestKeyframe => encoder.request_keyframe(),
        ControlOp::Flush => encoder.flush(),
    };
    if let Err(e) = result {
        warn!(error = %e, "control operation failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{SyntheticEncoder, SyntheticSource};

    #[test]
    fn bounded_queue_drops_when_full() {
        let q = BoundedQueue::<u32>::new(2);
        assert!(q.enqueue(1));
        assert!(q.enqueue(2));
        assert!(!q.enqueue(3), "third enqueue should be dropped");
        assert_eq!(q.dequeue(Duration::from_millis(1)), Some(1));
        assert_eq!(q.dequeue(Duration::from_millis(1)), Some(2));
        assert_eq!(q.dequeue(Duration::from_millis(1)), None);
    }

    #[test]
    fn pipeline_produces_keyframe_then_drains() {
        let source = Box::new(SyntheticSource::new(64, 64, 10));
        let encoder = Box::new(SyntheticEncoder::new(5));
        let pipeline = Pipeline::start(source, encoder, 10, 30);

        std::thread::sleep(Duration::from_millis(200));

        let mut saw_any = false;
        for _ in 0..50 {
            if pipeline.try_recv_event().is_some() {
                saw_any = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(saw_any, "expected at least one encoded unit within the deadline");
        pipeline.stop();
    }
}
