//! Outbound video track
//!
//! Wraps the engine's sample track and bridges it to the capture thread:
//! the capturer pushes converted frames into a bounded channel from its
//! blocking loop, and an async writer hands them to the engine. A full
//! channel drops the frame so the capture thread never waits on the
//! engine.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;
use webrtc::api::media_engine::MIME_TYPE_H264;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::video::capture::{FrameSink, OutputFrame};

/// Frames buffered between the capture thread and the engine writer
const FRAME_QUEUE_DEPTH: usize = 4;

/// Nominal frame duration reported to the engine
const FRAME_DURATION: Duration = Duration::from_millis(33);

/// One session's outbound video track
pub struct VideoTrack {
    track: Arc<TrackLocalStaticSample>,
    frame_tx: mpsc::Sender<OutputFrame>,
}

impl VideoTrack {
    /// Create the track and spawn its sample writer
    pub fn new(conn_id: &str) -> Self {
        let capability = RTCRtpCodecCapability {
            mime_type: MIME_TYPE_H264.to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                .to_string(),
            rtcp_feedback: vec![],
        };
        let track = Arc::new(TrackLocalStaticSample::new(
            capability,
            conn_id.to_string(),
            format!("{conn_id}-stream"),
        ));

        let (frame_tx, mut frame_rx) = mpsc::channel::<OutputFrame>(FRAME_QUEUE_DEPTH);

        let writer = track.clone();
        tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                let sample = Sample {
                    data: Bytes::copy_from_slice(frame.buffer.as_bytes()),
                    duration: FRAME_DURATION,
                    ..Default::default()
                };
                if let Err(e) = writer.write_sample(&sample).await {
                    debug!("write_sample failed (no peer yet?): {}", e);
                }
            }
            debug!("video track writer stopped");
        });

        Self { track, frame_tx }
    }

    /// The engine-side track to add to the peer connection
    pub fn local_track(&self) -> Arc<TrackLocalStaticSample> {
        self.track.clone()
    }

    /// A sink handle for the capture pipeline
    pub fn sink(&self) -> TrackSink {
        TrackSink {
            frame_tx: self.frame_tx.clone(),
        }
    }
}

/// Capture-side handle feeding the track writer
#[derive(Clone)]
pub struct TrackSink {
    frame_tx: mpsc::Sender<OutputFrame>,
}

impl FrameSink for TrackSink {
    fn on_frame(&self, frame: OutputFrame) {
        match self.frame_tx.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("video track writer lagging, dropping frame");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("video track writer gone, dropping frame");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::convert::I420Buffer;

    #[tokio::test]
    async fn sink_accepts_frames_and_drops_overflow() {
        let track = VideoTrack::new("conn-1");
        let sink = track.sink();

        for _ in 0..32 {
            sink.on_frame(OutputFrame {
                buffer: I420Buffer::new(16, 16),
                timestamp: Duration::from_millis(1),
                rotation: 0,
            });
        }
        // the writer drains the queue without a connected peer
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn track_id_matches_connection() {
        use webrtc::track::track_local::TrackLocal;
        let track = VideoTrack::new("conn-9");
        assert_eq!(track.local_track().id(), "conn-9");
    }
}
