//! Session registry and protocol bridge
//!
//! Fans in/out between the control-channel protocol and per-session
//! negotiation: inbound video requests create or retarget sessions,
//! inbound SDP answers and ICE candidates are routed by connection id,
//! and each session's negotiation events are serialized into outbound
//! vehicle messages through a single emit sink.
//!
//! The registry is only mutated from the control-channel task; the async
//! mutex around it makes the multi-step session creation appear atomic
//! to concurrent lookups.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::WebRtcOptions;
use crate::error::{GatewayError, Result};
use crate::protocol::{IceCandidateMessage, SdpRequest, SdpStatus, VehicleMessage};
use crate::source::SourceConnector;
use crate::video::capture::VideoCapturer;
use crate::webrtc::engine::RtcEngine;
use crate::webrtc::session::{SdpKind, Session, SignalingState, StreamDescriptor};
use crate::webrtc::track::VideoTrack;

type EmitHandler = Box<dyn Fn(VehicleMessage) + Send + Sync>;

struct SessionEntry {
    session: Arc<Session>,
    capturer: VideoCapturer,
}

/// Registry of live sessions keyed by connection id
pub struct Signaler {
    engine: RtcEngine,
    connector: Arc<dyn SourceConnector>,
    sessions: Mutex<HashMap<String, SessionEntry>>,
    emit: SyncMutex<Option<EmitHandler>>,
}

impl Signaler {
    pub fn new(opts: &WebRtcOptions, connector: Arc<dyn SourceConnector>) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            engine: RtcEngine::new(opts)?,
            connector,
            sessions: Mutex::new(HashMap::new()),
            emit: SyncMutex::new(None),
        }))
    }

    /// Set the single sink for every message the signaler produces
    pub fn on_emit(&self, handler: impl Fn(VehicleMessage) + Send + Sync + 'static) {
        *self.emit.lock() = Some(Box::new(handler));
    }

    fn emit(&self, msg: VehicleMessage) {
        match self.emit.lock().as_ref() {
            Some(handler) => handler(msg),
            None => warn!("no emit handler registered with signaler, dropping message"),
        }
    }

    /// Number of live sessions
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Start or retarget the video stream for one connection id
    pub async fn handle_video_request(self: &Arc<Self>, conn_id: &str, stream: StreamDescriptor) {
        info!("received video request for {}", conn_id);

        let mut sessions = self.sessions.lock().await;
        if let Some(entry) = sessions.get(conn_id) {
            info!("session for {} already exists, updating video source", conn_id);
            let session = entry.session.clone();
            drop(sessions);
            // the connect blocks on a network round trip, keep it off the
            // runtime workers
            let joined =
                tokio::task::spawn_blocking(move || session.connect(&stream)).await;
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("failed to retarget session {}: {}", conn_id, e),
                Err(e) => error!("source connect task for {} failed: {}", conn_id, e),
            }
            return;
        }

        info!("no session for {} yet, creating new session", conn_id);
        match self.create_session(conn_id, stream).await {
            Ok(entry) => {
                sessions.insert(conn_id.to_string(), entry);
                info!("session {} added", conn_id);
            }
            Err(e) => error!("failed to create session for {}: {}", conn_id, e),
        }
    }

    async fn create_session(
        self: &Arc<Self>,
        conn_id: &str,
        stream: StreamDescriptor,
    ) -> Result<SessionEntry> {
        let session = Session::new(conn_id, self.connector.clone());

        {
            let session = session.clone();
            tokio::task::spawn_blocking(move || session.connect(&stream))
                .await
                .map_err(|e| GatewayError::WebRtc(format!("source connect task failed: {e}")))??;
        }

        // negotiation events become outbound protocol messages; the weak
        // reference keeps the registry from owning itself through the
        // session handlers
        let signaler = Arc::downgrade(self);
        let conn = conn_id.to_string();
        session.on_sdp_created(move |kind, sdp| {
            let Some(signaler) = signaler.upgrade() else { return };
            info!("created {} for {}", kind, conn);
            signaler.emit(VehicleMessage::sdp_request(SdpRequest {
                connection_id: conn.clone(),
                status: match kind {
                    SdpKind::Offer => SdpStatus::Offered,
                    SdpKind::Answer => SdpStatus::Answered,
                },
                sdp,
            }));
        });

        let signaler = Arc::downgrade(self);
        let conn = conn_id.to_string();
        session.on_ice_candidate(move |candidate| {
            let Some(signaler) = signaler.upgrade() else { return };
            debug!("created ICE candidate for {}", conn);
            signaler.emit(VehicleMessage::ice_candidate(IceCandidateMessage {
                connection_id: conn.clone(),
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: i32::from(candidate.sdp_mline_index),
                candidate: candidate.candidate,
            }));
        });

        let conn = conn_id.to_string();
        session.on_signaling_change(move |state| match state {
            SignalingState::Stable => info!("connection {} is now stable", conn),
            SignalingState::Closed => info!("connection {} is now closed", conn),
            SignalingState::HaveLocalOffer => info!("connection {} now has a local offer", conn),
            SignalingState::HaveRemoteOffer => info!("connection {} now has a remote offer", conn),
            SignalingState::HaveLocalAnswer => info!("connection {} now has a local answer", conn),
            SignalingState::HaveRemoteAnswer => {
                info!("connection {} now has a remote answer", conn)
            }
        });

        debug!("creating video track for {}", conn_id);
        let track = VideoTrack::new(conn_id);

        debug!("creating peer connection for {}", conn_id);
        let pc = self.engine.new_peer_connection().await?;
        pc.add_track(track.local_track())
            .await
            .map_err(|e| GatewayError::WebRtc(format!("failed to add video track: {e}")))?;
        session.attach_connection(pc);

        let mut capturer = VideoCapturer::new(session.clone(), Arc::new(track.sink()));
        capturer.start();

        debug!("creating offer for {}", conn_id);
        session.create_offer().await;

        Ok(SessionEntry { session, capturer })
    }

    /// Apply a remote SDP answer to the matching session
    pub async fn handle_sdp_request(&self, msg: &SdpRequest) {
        info!("received SDP request for {}", msg.connection_id);

        let sessions = self.sessions.lock().await;
        let Some(entry) = sessions.get(&msg.connection_id) else {
            warn!(
                "received SDP request with unknown connection id: {}",
                msg.connection_id
            );
            return;
        };

        if msg.sdp.is_empty() {
            error!("received SDP request with empty sdp");
            return;
        }

        let session = entry.session.clone();
        drop(sessions);
        session.set_remote_description(SdpKind::Answer, &msg.sdp).await;
    }

    /// Apply a remote ICE candidate to the matching session
    pub async fn handle_ice_candidate(&self, msg: &IceCandidateMessage) {
        info!("received ICE candidate for {}", msg.connection_id);

        let sessions = self.sessions.lock().await;
        let Some(entry) = sessions.get(&msg.connection_id) else {
            warn!(
                "received ICE candidate with unknown connection id: {}",
                msg.connection_id
            );
            return;
        };

        if msg.sdp_mline_index == -1 {
            warn!("received ICE candidate with mlineindex=-1");
            return;
        }
        if msg.sdp_mid.is_empty() {
            error!("received ICE candidate with empty MID");
            return;
        }
        if msg.candidate.is_empty() {
            error!("received ICE candidate with empty candidate");
            return;
        }

        let session = entry.session.clone();
        drop(sessions);
        session
            .add_ice_candidate(&msg.sdp_mid, msg.sdp_mline_index as u16, &msg.candidate)
            .await;
    }

    /// Tear down one session: join its capture thread, then close the
    /// peer connection
    pub async fn close_session(&self, conn_id: &str) {
        let entry = self.sessions.lock().await.remove(conn_id);
        let Some(entry) = entry else {
            debug!("close requested for unknown session {}", conn_id);
            return;
        };

        info!("closing session {}", conn_id);
        let entry = tokio::task::spawn_blocking(move || {
            let mut entry = entry;
            entry.capturer.stop();
            entry
        })
        .await;

        match entry {
            Ok(entry) => entry.session.close_connection().await,
            Err(e) => error!("capture stop for {} failed: {}", conn_id, e),
        }
    }

    /// Tear down every session (process shutdown)
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        for id in ids {
            self.close_session(&id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{FramePublisher, TcpSourceConnector};
    use std::sync::mpsc;

    fn options() -> WebRtcOptions {
        WebRtcOptions {
            stun_servers: vec![],
            turn_servers: vec![],
            min_udp_port: 41000,
            max_udp_port: 41999,
        }
    }

    fn publisher() -> (FramePublisher, String) {
        let publisher = FramePublisher::bind("tcp://127.0.0.1:0").unwrap();
        let addr = format!("tcp://{}", publisher.local_addr().unwrap());
        (publisher, addr)
    }

    fn descriptor(addr: &str) -> StreamDescriptor {
        StreamDescriptor {
            address: addr.to_string(),
            topic: "camera".to_string(),
            output_width: 640,
            output_height: 360,
        }
    }

    fn wired_signaler() -> (Arc<Signaler>, mpsc::Receiver<VehicleMessage>) {
        let signaler = Signaler::new(&options(), Arc::new(TcpSourceConnector)).unwrap();
        let (tx, rx) = mpsc::channel();
        signaler.on_emit(move |msg| {
            let _ = tx.send(msg);
        });
        (signaler, rx)
    }

    #[tokio::test]
    async fn video_request_creates_one_session_and_offers_first() {
        let (signaler, rx) = wired_signaler();
        let (_publisher, addr) = publisher();

        signaler.handle_video_request("abc", descriptor(&addr)).await;
        assert_eq!(signaler.session_count().await, 1);

        // the local offer is emitted before any ICE candidate for this
        // connection
        let first = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        let offer = first.sdp_request.expect("expected an SDP offer first");
        assert_eq!(offer.connection_id, "abc");
        assert_eq!(offer.status, SdpStatus::Offered);
        assert!(!offer.sdp.is_empty());

        signaler.shutdown().await;
        assert_eq!(signaler.session_count().await, 0);
    }

    #[tokio::test]
    async fn repeated_video_request_reuses_the_session() {
        let (signaler, _rx) = wired_signaler();
        let (_publisher_a, addr_a) = publisher();
        let (_publisher_b, addr_b) = publisher();

        signaler.handle_video_request("abc", descriptor(&addr_a)).await;
        signaler.handle_video_request("abc", descriptor(&addr_b)).await;

        assert_eq!(signaler.session_count().await, 1);
        signaler.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_connection_ids_are_dropped() {
        let (signaler, _rx) = wired_signaler();

        signaler
            .handle_sdp_request(&SdpRequest {
                connection_id: "ghost".into(),
                status: SdpStatus::Answered,
                sdp: "v=0".into(),
            })
            .await;

        signaler
            .handle_ice_candidate(&IceCandidateMessage {
                connection_id: "ghost".into(),
                sdp_mid: "0".into(),
                sdp_mline_index: 0,
                candidate: "candidate".into(),
            })
            .await;

        assert_eq!(signaler.session_count().await, 0);
    }

    #[tokio::test]
    async fn malformed_signaling_messages_do_not_tear_down_the_session() {
        let (signaler, _rx) = wired_signaler();
        let (_publisher, addr) = publisher();
        signaler.handle_video_request("abc", descriptor(&addr)).await;

        // empty SDP
        signaler
            .handle_sdp_request(&SdpRequest {
                connection_id: "abc".into(),
                status: SdpStatus::Answered,
                sdp: String::new(),
            })
            .await;
        // unparsable SDP
        signaler
            .handle_sdp_request(&SdpRequest {
                connection_id: "abc".into(),
                status: SdpStatus::Answered,
                sdp: "not an sdp".into(),
            })
            .await;
        // invalid candidates, each rejected by a distinct check
        for candidate in [
            IceCandidateMessage {
                connection_id: "abc".into(),
                sdp_mid: "0".into(),
                sdp_mline_index: -1,
                candidate: "candidate".into(),
            },
            IceCandidateMessage {
                connection_id: "abc".into(),
                sdp_mid: String::new(),
                sdp_mline_index: 0,
                candidate: "candidate".into(),
            },
            IceCandidateMessage {
                connection_id: "abc".into(),
                sdp_mid: "0".into(),
                sdp_mline_index: 0,
                candidate: String::new(),
            },
        ] {
            signaler.handle_ice_candidate(&candidate).await;
        }

        assert_eq!(signaler.session_count().await, 1);
        signaler.shutdown().await;
    }
}
