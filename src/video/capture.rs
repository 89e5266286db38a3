//! Video capture pipeline
//!
//! A capturer runs one background thread that pulls raw samples from its
//! frame feed, converts them to I420, rescales to the negotiated output
//! size, and hands the result to the outbound sink. Conversion buffers
//! are reallocated only when the source or output size changes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use crate::video::convert::{self, I420Buffer};
use crate::video::frame::{CameraSample, ElementType};

/// Bounded wait for one frame receive; also the capturer's stop latency
pub const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Provider of raw frames plus the output size negotiated for them
pub trait FrameFeed: Send + Sync {
    fn next_frame(&self, timeout: Duration) -> Option<(CameraSample, u32, u32)>;
}

/// Consumer of converted frames
pub trait FrameSink: Send + Sync {
    fn on_frame(&self, frame: OutputFrame);
}

/// A planar frame ready for the outbound video pipeline
#[derive(Debug, Clone)]
pub struct OutputFrame {
    pub buffer: I420Buffer,
    /// Monotonic capture timestamp
    pub timestamp: Duration,
    /// Rotation in degrees; always zero for vehicle cameras
    pub rotation: u32,
}

/// A capture format hint; the pipeline imposes no preference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureFormat {
    pub width: u32,
    pub height: u32,
}

/// Background frame acquisition for one session
pub struct VideoCapturer {
    feed: Arc<dyn FrameFeed>,
    sink: Arc<dyn FrameSink>,
    running: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl VideoCapturer {
    pub fn new(feed: Arc<dyn FrameFeed>, sink: Arc<dyn FrameSink>) -> Self {
        Self {
            feed,
            sink,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    /// Spawn the capture thread. Starting while running is a logged
    /// no-op; a stale thread handle means a previous run leaked and is a
    /// programming error.
    pub fn start(&mut self) {
        info!("video capturer starting");
        if self.is_running() {
            error!("start called when the capturer is already running");
            return;
        }
        if self.thread.is_some() {
            panic!("VideoCapturer started twice without an intervening stop");
        }

        self.running.store(true, Ordering::Release);
        let worker = CaptureWorker {
            feed: self.feed.clone(),
            sink: self.sink.clone(),
            running: self.running.clone(),
        };
        self.thread = Some(thread::spawn(move || worker.run()));
    }

    /// Signal the loop to exit and wait for the thread to join. Stop
    /// latency is bounded by one receive timeout.
    pub fn stop(&mut self) {
        info!("video capturer stopping");
        if !self.is_running() {
            error!("stop called when the capturer is already stopped");
            return;
        }

        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_screencast(&self) -> bool {
        false
    }

    /// Supported fourcc preferences; empty defers to the pipeline default
    pub fn preferred_fourccs(&self) -> Vec<[u8; 4]> {
        Vec::new()
    }

    /// Best matching capture format; `None` defers to the pipeline default
    pub fn best_capture_format(&self, _desired: CaptureFormat) -> Option<CaptureFormat> {
        None
    }
}

impl Drop for VideoCapturer {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

struct CaptureWorker {
    feed: Arc<dyn FrameFeed>,
    sink: Arc<dyn FrameSink>,
    running: Arc<AtomicBool>,
}

impl CaptureWorker {
    fn run(&self) {
        let epoch = Instant::now();
        let mut unscaled: Option<I420Buffer> = None;
        let mut scaled: Option<I420Buffer> = None;

        while self.running.load(Ordering::Acquire) {
            self.capture_one(epoch, &mut unscaled, &mut scaled);
        }
        debug!("capture loop exited");
    }

    fn capture_one(
        &self,
        epoch: Instant,
        unscaled: &mut Option<I420Buffer>,
        scaled: &mut Option<I420Buffer>,
    ) {
        let Some((sample, output_width, output_height)) = self.feed.next_frame(RECV_TIMEOUT)
        else {
            return;
        };

        if sample.element_type != ElementType::UnsignedByte {
            error!(
                "expected camera sample with unsigned byte elements, got {}",
                sample.element_type
            );
            return;
        }

        let unscaled_buf = ensure_buffer(unscaled, sample.width, sample.height);
        if let Err(e) = convert::convert_to_i420(&sample, unscaled_buf) {
            error!("cannot convert {} camera sample: {}", sample.format, e);
            return;
        }
        debug!(
            "received a {}x{} {} frame",
            sample.width, sample.height, sample.format
        );

        let buffer = if sample.width != output_width || sample.height != output_height {
            let scaled_buf = ensure_buffer(scaled, output_width, output_height);
            convert::scale_i420(unscaled_buf, scaled_buf);
            scaled_buf.clone()
        } else {
            unscaled_buf.clone()
        };

        self.sink.on_frame(OutputFrame {
            buffer,
            timestamp: epoch.elapsed(),
            rotation: 0,
        });
    }
}

fn ensure_buffer(slot: &mut Option<I420Buffer>, width: u32, height: u32) -> &mut I420Buffer {
    if slot
        .as_ref()
        .is_some_and(|buf| buf.width() != width || buf.height() != height)
    {
        *slot = None;
    }
    slot.get_or_insert_with(|| I420Buffer::new(width, height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::frame::PixelFormat;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    struct ScriptedFeed {
        frames: Mutex<VecDeque<CameraSample>>,
        output: (u32, u32),
    }

    impl ScriptedFeed {
        fn new(frames: Vec<CameraSample>, output: (u32, u32)) -> Arc<Self> {
            Arc::new(Self {
                frames: Mutex::new(frames.into()),
                output,
            })
        }
    }

    impl FrameFeed for ScriptedFeed {
        fn next_frame(&self, timeout: Duration) -> Option<(CameraSample, u32, u32)> {
            match self.frames.lock().pop_front() {
                Some(sample) => Some((sample, self.output.0, self.output.1)),
                None => {
                    thread::sleep(timeout);
                    None
                }
            }
        }
    }

    #[derive(Default)]
    struct CollectSink {
        frames: Mutex<Vec<OutputFrame>>,
    }

    impl FrameSink for CollectSink {
        fn on_frame(&self, frame: OutputFrame) {
            self.frames.lock().push(frame);
        }
    }

    fn gray(width: u32, height: u32, value: u8) -> CameraSample {
        CameraSample::packed(
            width,
            height,
            PixelFormat::Luminance,
            Bytes::from(vec![value; (width * height) as usize]),
        )
    }

    fn wait_for_frames(sink: &CollectSink, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while sink.frames.lock().len() < count && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn converts_and_scales_to_the_negotiated_size() {
        let feed = ScriptedFeed::new(vec![gray(1280, 720, 50)], (640, 360));
        let sink = Arc::new(CollectSink::default());
        let mut capturer = VideoCapturer::new(feed, sink.clone());

        capturer.start();
        wait_for_frames(&sink, 1);
        capturer.stop();

        let frames = sink.frames.lock();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].buffer.width(), 640);
        assert_eq!(frames[0].buffer.height(), 360);
        assert_eq!(frames[0].rotation, 0);
        assert!(frames[0].buffer.y_plane().iter().all(|&v| v == 50));
    }

    #[test]
    fn equal_sizes_skip_the_scaling_path() {
        let feed = ScriptedFeed::new(vec![gray(640, 360, 90)], (640, 360));
        let sink = Arc::new(CollectSink::default());
        let mut capturer = VideoCapturer::new(feed, sink.clone());

        capturer.start();
        wait_for_frames(&sink, 1);
        capturer.stop();

        let frames = sink.frames.lock();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].buffer.width(), 640);
        assert!(frames[0].buffer.y_plane().iter().all(|&v| v == 90));
        assert!(frames[0].buffer.u_plane().iter().all(|&v| v == 128));
    }

    #[test]
    fn skips_samples_with_wrong_element_type() {
        let mut bad = gray(64, 64, 10);
        bad.element_type = ElementType::UnsignedShort;
        let feed = ScriptedFeed::new(vec![bad, gray(64, 64, 20)], (64, 64));
        let sink = Arc::new(CollectSink::default());
        let mut capturer = VideoCapturer::new(feed, sink.clone());

        capturer.start();
        wait_for_frames(&sink, 1);
        capturer.stop();

        let frames = sink.frames.lock();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].buffer.y_plane().iter().all(|&v| v == 20));
    }

    #[test]
    fn skips_unsupported_pixel_formats() {
        let unsupported = CameraSample::packed(
            4,
            4,
            PixelFormat::Yuyv,
            Bytes::from(vec![0u8; 4 * 4 * 2]),
        );
        let feed = ScriptedFeed::new(vec![unsupported, gray(4, 4, 30)], (4, 4));
        let sink = Arc::new(CollectSink::default());
        let mut capturer = VideoCapturer::new(feed, sink.clone());

        capturer.start();
        wait_for_frames(&sink, 1);
        capturer.stop();

        let frames = sink.frames.lock();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].buffer.y_plane().iter().all(|&v| v == 30));
    }

    #[test]
    fn double_start_is_a_logged_noop() {
        let feed = ScriptedFeed::new(vec![], (64, 64));
        let sink = Arc::new(CollectSink::default());
        let mut capturer = VideoCapturer::new(feed, sink);

        capturer.start();
        assert!(capturer.is_running());
        capturer.start();
        assert!(capturer.is_running());
        capturer.stop();
        assert!(!capturer.is_running());
    }

    #[test]
    fn stop_when_stopped_is_a_logged_noop() {
        let feed = ScriptedFeed::new(vec![], (64, 64));
        let sink = Arc::new(CollectSink::default());
        let mut capturer = VideoCapturer::new(feed, sink);

        capturer.stop();
        assert!(!capturer.is_running());
    }

    #[test]
    fn capability_queries_impose_no_preference() {
        let feed = ScriptedFeed::new(vec![], (64, 64));
        let sink = Arc::new(CollectSink::default());
        let capturer = VideoCapturer::new(feed, sink);

        assert!(!capturer.is_screencast());
        assert!(capturer.preferred_fourccs().is_empty());
        assert!(capturer
            .best_capture_format(CaptureFormat {
                width: 1920,
                height: 1080
            })
            .is_none());
    }
}
