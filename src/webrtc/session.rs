//! Per-viewer negotiation session
//!
//! A `Session` owns one peer connection and the live frame source feeding
//! it. Negotiation is driven imperatively (`create_offer`,
//! `set_remote_description`, `add_ice_candidate`) while engine events are
//! routed to the registered handler set; absent handlers are silent
//! no-ops. The frame source can be swapped while streaming: `connect`
//! installs the new subscription as pending, and `next_frame` promotes it
//! at the next frame boundary.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;

use crate::error::Result;
use crate::source::{FrameSource, SourceConnector, SourceError};
use crate::video::capture::FrameFeed;
use crate::video::frame::CameraSample;

/// Which half of the offer/answer round a local description belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

impl std::fmt::Display for SdpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SdpKind::Offer => write!(f, "offer"),
            SdpKind::Answer => write!(f, "answer"),
        }
    }
}

/// Negotiation state as exposed to handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalAnswer,
    HaveRemoteAnswer,
    Closed,
}

/// A locally discovered ICE candidate
#[derive(Debug, Clone)]
pub struct LocalCandidate {
    pub sdp_mid: String,
    pub sdp_mline_index: u16,
    pub candidate: String,
}

/// Identifies one frame source and the output size negotiated for it
#[derive(Debug, Clone)]
pub struct StreamDescriptor {
    pub address: String,
    pub topic: String,
    pub output_width: u32,
    pub output_height: u32,
}

type SdpCreatedHandler = Box<dyn Fn(SdpKind, String) + Send + Sync>;
type SdpFailureHandler = Box<dyn Fn(String) + Send + Sync>;
type IceCandidateHandler = Box<dyn Fn(LocalCandidate) + Send + Sync>;
type SignalingChangeHandler = Box<dyn Fn(SignalingState) + Send + Sync>;
type StateLogHandler = Box<dyn Fn(String) + Send + Sync>;
type TrackAddedHandler = Box<dyn Fn(String) + Send + Sync>;
type DataChannelHandler = Box<dyn Fn(String) + Send + Sync>;
type VoidHandler = Box<dyn Fn() + Send + Sync>;

/// Event routing table: one optional handler per event kind.
///
/// Owned by the session and registered with the engine once per peer
/// connection; engine callbacks hold the table, not the session, so a
/// torn-down session leaves no dangling back-reference.
#[derive(Default)]
struct SessionHandlers {
    sdp_created: Mutex<Option<SdpCreatedHandler>>,
    sdp_failed: Mutex<Option<SdpFailureHandler>>,
    ice_candidate: Mutex<Option<IceCandidateHandler>>,
    signaling_change: Mutex<Option<SignalingChangeHandler>>,
    ice_connection_change: Mutex<Option<StateLogHandler>>,
    ice_gathering_change: Mutex<Option<StateLogHandler>>,
    renegotiation_needed: Mutex<Option<VoidHandler>>,
    track_added: Mutex<Option<TrackAddedHandler>>,
    data_channel: Mutex<Option<DataChannelHandler>>,
    closed: Mutex<Option<VoidHandler>>,
}

impl SessionHandlers {
    fn fire_sdp_created(&self, kind: SdpKind, sdp: String) {
        if let Some(handler) = self.sdp_created.lock().as_ref() {
            handler(kind, sdp);
        }
    }

    fn fire_sdp_failed(&self, error: String) {
        if let Some(handler) = self.sdp_failed.lock().as_ref() {
            handler(error);
        }
    }

    fn fire_ice_candidate(&self, candidate: LocalCandidate) {
        if let Some(handler) = self.ice_candidate.lock().as_ref() {
            handler(candidate);
        }
    }

    fn fire_signaling_change(&self, state: SignalingState) {
        if let Some(handler) = self.signaling_change.lock().as_ref() {
            handler(state);
        }
    }

    fn fire_ice_connection_change(&self, state: String) {
        if let Some(handler) = self.ice_connection_change.lock().as_ref() {
            handler(state);
        }
    }

    fn fire_ice_gathering_change(&self, state: String) {
        if let Some(handler) = self.ice_gathering_change.lock().as_ref() {
            handler(state);
        }
    }

    fn fire_renegotiation_needed(&self) {
        if let Some(handler) = self.renegotiation_needed.lock().as_ref() {
            handler();
        }
    }

    fn fire_track_added(&self, id: String) {
        if let Some(handler) = self.track_added.lock().as_ref() {
            handler(id);
        }
    }

    fn fire_data_channel(&self, label: String) {
        if let Some(handler) = self.data_channel.lock().as_ref() {
            handler(label);
        }
    }

    fn fire_closed(&self) {
        if let Some(handler) = self.closed.lock().as_ref() {
            handler();
        }
    }
}

#[derive(Default)]
struct SourceSlots {
    current: Option<Box<dyn FrameSource>>,
    pending: Option<Box<dyn FrameSource>>,
}

/// One viewer's negotiation and frame-delivery context
pub struct Session {
    /// Connection id, used for routing and logging
    label: String,
    connector: Arc<dyn SourceConnector>,
    handlers: Arc<SessionHandlers>,
    connection: Mutex<Option<Arc<RTCPeerConnection>>>,
    sources: Mutex<SourceSlots>,
    output_width: AtomicU32,
    output_height: AtomicU32,
}

impl Session {
    pub fn new(label: impl Into<String>, connector: Arc<dyn SourceConnector>) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            connector,
            handlers: Arc::new(SessionHandlers::default()),
            connection: Mutex::new(None),
            sources: Mutex::new(SourceSlots::default()),
            output_width: AtomicU32::new(0),
            output_height: AtomicU32::new(0),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Output size most recently requested by the viewer
    pub fn output_size(&self) -> (u32, u32) {
        (
            self.output_width.load(Ordering::Acquire),
            self.output_height.load(Ordering::Acquire),
        )
    }

    pub fn on_sdp_created(&self, handler: impl Fn(SdpKind, String) + Send + Sync + 'static) {
        *self.handlers.sdp_created.lock() = Some(Box::new(handler));
    }

    pub fn on_sdp_failed(&self, handler: impl Fn(String) + Send + Sync + 'static) {
        *self.handlers.sdp_failed.lock() = Some(Box::new(handler));
    }

    pub fn on_ice_candidate(&self, handler: impl Fn(LocalCandidate) + Send + Sync + 'static) {
        *self.handlers.ice_candidate.lock() = Some(Box::new(handler));
    }

    pub fn on_signaling_change(&self, handler: impl Fn(SignalingState) + Send + Sync + 'static) {
        *self.handlers.signaling_change.lock() = Some(Box::new(handler));
    }

    pub fn on_ice_connection_change(&self, handler: impl Fn(String) + Send + Sync + 'static) {
        *self.handlers.ice_connection_change.lock() = Some(Box::new(handler));
    }

    pub fn on_ice_gathering_change(&self, handler: impl Fn(String) + Send + Sync + 'static) {
        *self.handlers.ice_gathering_change.lock() = Some(Box::new(handler));
    }

    pub fn on_renegotiation_needed(&self, handler: impl Fn() + Send + Sync + 'static) {
        *self.handlers.renegotiation_needed.lock() = Some(Box::new(handler));
    }

    pub fn on_track_added(&self, handler: impl Fn(String) + Send + Sync + 'static) {
        *self.handlers.track_added.lock() = Some(Box::new(handler));
    }

    pub fn on_data_channel(&self, handler: impl Fn(String) + Send + Sync + 'static) {
        *self.handlers.data_channel.lock() = Some(Box::new(handler));
    }

    pub fn on_closed(&self, handler: impl Fn() + Send + Sync + 'static) {
        *self.handlers.closed.lock() = Some(Box::new(handler));
    }

    /// Attach the peer connection and route its events to the handler set.
    /// Called once per session, before `create_offer`.
    pub fn attach_connection(&self, pc: Arc<RTCPeerConnection>) {
        let handlers = self.handlers.clone();
        let label = self.label.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let handlers = handlers.clone();
            let label = label.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => handlers.fire_ice_candidate(LocalCandidate {
                        sdp_mid: init.sdp_mid.unwrap_or_default(),
                        sdp_mline_index: init.sdp_mline_index.unwrap_or(0),
                        candidate: init.candidate,
                    }),
                    Err(e) => error!("{}: failed to serialize ICE candidate: {}", label, e),
                }
            })
        }));

        let handlers = self.handlers.clone();
        pc.on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
            let handlers = handlers.clone();
            Box::pin(async move {
                let mapped = match state {
                    RTCSignalingState::Stable => SignalingState::Stable,
                    RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
                    RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
                    RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalAnswer,
                    RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemoteAnswer,
                    RTCSignalingState::Closed => SignalingState::Closed,
                    _ => return,
                };
                handlers.fire_signaling_change(mapped);
            })
        }));

        let handlers = self.handlers.clone();
        pc.on_ice_connection_state_change(Box::new(move |state| {
            let handlers = handlers.clone();
            Box::pin(async move {
                handlers.fire_ice_connection_change(format!("{state:?}"));
            })
        }));

        let handlers = self.handlers.clone();
        pc.on_ice_gathering_state_change(Box::new(move |state| {
            let handlers = handlers.clone();
            Box::pin(async move {
                handlers.fire_ice_gathering_change(format!("{state:?}"));
            })
        }));

        let handlers = self.handlers.clone();
        pc.on_negotiation_needed(Box::new(move || {
            let handlers = handlers.clone();
            Box::pin(async move {
                handlers.fire_renegotiation_needed();
            })
        }));

        let handlers = self.handlers.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let handlers = handlers.clone();
            Box::pin(async move {
                handlers.fire_track_added(track.id());
            })
        }));

        let handlers = self.handlers.clone();
        pc.on_data_channel(Box::new(move |channel| {
            let handlers = handlers.clone();
            Box::pin(async move {
                handlers.fire_data_channel(channel.label().to_string());
            })
        }));

        *self.connection.lock() = Some(pc);
    }

    fn connection(&self) -> Option<Arc<RTCPeerConnection>> {
        self.connection.lock().clone()
    }

    /// Request a local offer. Must only be called after a peer connection
    /// is attached, and at most once per negotiation round.
    pub async fn create_offer(&self) {
        let pc = self
            .connection()
            .expect("create_offer called before a peer connection was attached");

        let offer = match pc.create_offer(None).await {
            Ok(offer) => offer,
            Err(e) => {
                error!("{}: failed to create offer: {}", self.label, e);
                self.handlers.fire_sdp_failed(e.to_string());
                return;
            }
        };

        let sdp = offer.sdp.clone();
        if let Err(e) = pc.set_local_description(offer).await {
            error!("{}: failed to set local offer: {}", self.label, e);
            self.handlers.fire_sdp_failed(e.to_string());
            return;
        }

        info!("{}: set local description", self.label);
        self.handlers.fire_sdp_created(SdpKind::Offer, sdp);
    }

    /// Apply a remote offer or answer. Parse failures stall the round
    /// without mutating state; the peer is expected to resend.
    pub async fn set_remote_description(&self, kind: SdpKind, sdp: &str) {
        let desc = match kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp.to_string()),
            SdpKind::Answer => RTCSessionDescription::answer(sdp.to_string()),
        };
        let desc = match desc {
            Ok(desc) => desc,
            Err(e) => {
                error!("{}: error parsing remote SDP: {}", self.label, e);
                return;
            }
        };

        let Some(pc) = self.connection() else {
            error!("{}: received remote {} with no peer connection", self.label, kind);
            return;
        };

        if let Err(e) = pc.set_remote_description(desc).await {
            error!("{}: error applying remote {}: {}", self.label, kind, e);
            return;
        }

        if kind == SdpKind::Offer {
            let answer = match pc.create_answer(None).await {
                Ok(answer) => answer,
                Err(e) => {
                    error!("{}: failed to create answer: {}", self.label, e);
                    self.handlers.fire_sdp_failed(e.to_string());
                    return;
                }
            };
            let sdp = answer.sdp.clone();
            if let Err(e) = pc.set_local_description(answer).await {
                error!("{}: failed to set local answer: {}", self.label, e);
                self.handlers.fire_sdp_failed(e.to_string());
                return;
            }
            self.handlers.fire_sdp_created(SdpKind::Answer, sdp);
        }
    }

    /// Add one remote candidate; failures are dropped, the peer resends
    /// distinct candidates as they are discovered.
    pub async fn add_ice_candidate(&self, mid: &str, mline_index: u16, candidate: &str) {
        let Some(pc) = self.connection() else {
            warn!("{}: received ICE candidate with no peer connection", self.label);
            return;
        };

        let init = RTCIceCandidateInit {
            candidate: candidate.to_string(),
            sdp_mid: Some(mid.to_string()),
            sdp_mline_index: Some(mline_index),
            username_fragment: None,
        };
        if let Err(e) = pc.add_ice_candidate(init).await {
            warn!("{}: error adding remote candidate: {}", self.label, e);
        }
    }

    /// Switch the video source for this session. The subscription is
    /// created before the lock is taken because connecting can block on a
    /// network round trip; the lock is held only to move the pointer.
    pub fn connect(&self, stream: &StreamDescriptor) -> Result<()> {
        let source = self.connector.connect(&stream.address, &stream.topic)?;

        let mut slots = self.sources.lock();
        slots.pending = Some(source);
        self.output_width.store(stream.output_width, Ordering::Release);
        self.output_height.store(stream.output_height, Ordering::Release);
        debug!(
            "{}: source switched to {} topic {} at {}x{}",
            self.label, stream.address, stream.topic, stream.output_width, stream.output_height
        );
        Ok(())
    }

    /// Pull the next frame, promoting any pending source first. Called
    /// only from the capture thread. The receive happens with no lock
    /// held so `connect` stays responsive.
    pub fn next_frame(&self, timeout: Duration) -> Option<(CameraSample, u32, u32)> {
        let mut source = {
            let mut slots = self.sources.lock();
            if let Some(next) = slots.pending.take() {
                slots.current = Some(next);
            }
            slots.current.take()?
        };

        let received = source.recv_timeout(timeout);

        {
            // connect() only ever writes the pending slot, so the current
            // slot is still ours to restore
            let mut slots = self.sources.lock();
            slots.current = Some(source);
        }

        match received {
            Ok(sample) => Some((
                sample,
                self.output_width.load(Ordering::Acquire),
                self.output_height.load(Ordering::Acquire),
            )),
            Err(SourceError::Timeout) => {
                warn!("{}: timed out while waiting for frame", self.label);
                None
            }
            Err(e) => {
                warn!("{}: frame receive failed: {}", self.label, e);
                None
            }
        }
    }

    /// Close the peer connection and notify the closed handler
    pub async fn close_connection(&self) {
        info!("{}: closing", self.label);
        if let Some(pc) = self.connection() {
            if let Err(e) = pc.close().await {
                warn!("{}: error closing peer connection: {}", self.label, e);
            }
            self.handlers.fire_closed();
        }
    }
}

impl FrameFeed for Session {
    fn next_frame(&self, timeout: Duration) -> Option<(CameraSample, u32, u32)> {
        Session::next_frame(self, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{FramePublisher, TcpSourceConnector};
    use crate::video::frame::PixelFormat;
    use bytes::Bytes;

    fn sample(value: u8) -> CameraSample {
        CameraSample::packed(4, 4, PixelFormat::Luminance, Bytes::from(vec![value; 16]))
    }

    fn publisher() -> (FramePublisher, String) {
        let publisher = FramePublisher::bind("tcp://127.0.0.1:0").unwrap();
        let addr = format!("tcp://{}", publisher.local_addr().unwrap());
        (publisher, addr)
    }

    fn descriptor(addr: &str, width: u32, height: u32) -> StreamDescriptor {
        StreamDescriptor {
            address: addr.to_string(),
            topic: "camera".to_string(),
            output_width: width,
            output_height: height,
        }
    }

    #[test]
    fn frames_follow_the_latest_connected_source() {
        let session = Session::new("abc", Arc::new(TcpSourceConnector));
        let (mut pub_a, addr_a) = publisher();
        let (mut pub_b, addr_b) = publisher();

        session.connect(&descriptor(&addr_a, 640, 360)).unwrap();
        pub_a.publish("camera", &sample(1));
        let (frame, w, h) = session.next_frame(Duration::from_millis(500)).unwrap();
        assert_eq!(frame.data[0], 1);
        assert_eq!((w, h), (640, 360));

        // swap sources mid-stream; the pending source takes over at the
        // next frame boundary
        session.connect(&descriptor(&addr_b, 320, 180)).unwrap();
        pub_a.publish("camera", &sample(2));
        pub_b.publish("camera", &sample(3));
        let (frame, w, h) = session.next_frame(Duration::from_millis(500)).unwrap();
        assert_eq!(frame.data[0], 3);
        assert_eq!((w, h), (320, 180));
    }

    #[test]
    fn next_frame_times_out_without_frames() {
        let session = Session::new("abc", Arc::new(TcpSourceConnector));
        let (mut publisher, addr) = publisher();
        session.connect(&descriptor(&addr, 640, 360)).unwrap();
        publisher.publish("other-topic", &sample(1));

        assert!(session.next_frame(Duration::from_millis(50)).is_none());
    }

    #[test]
    fn next_frame_without_source_is_none() {
        let session = Session::new("abc", Arc::new(TcpSourceConnector));
        assert!(session.next_frame(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn connect_propagates_failures() {
        let session = Session::new("abc", Arc::new(TcpSourceConnector));
        assert!(session.connect(&descriptor("tcp://127.0.0.1:1", 640, 360)).is_err());
    }

    #[tokio::test]
    #[should_panic(expected = "create_offer called before a peer connection was attached")]
    async fn create_offer_without_connection_panics() {
        let session = Session::new("abc", Arc::new(TcpSourceConnector));
        session.create_offer().await;
    }

    #[tokio::test]
    async fn close_without_connection_is_a_noop() {
        let session = Session::new("abc", Arc::new(TcpSourceConnector));
        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let observed = fired.clone();
        session.on_closed(move || observed.store(true, Ordering::Release));

        session.close_connection().await;
        assert!(!fired.load(Ordering::Acquire));
    }
}
