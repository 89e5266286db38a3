//! Control channel to the backend
//!
//! Maintains the single WebSocket connection carrying typed command and
//! signaling traffic. The client dials
//! `<backend>/api/v1/ws/vehicle/<vehicleId>/register`, announces its
//! cameras once per successful open, dispatches every populated field of
//! each inbound envelope, and confirms every message that carries an id.
//! A closed connection is redialed immediately; a connection that cannot
//! be established at all is fatal, the control channel is load-bearing.

use std::sync::Arc;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::COOKIE;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::config::{CameraRole, ConnectionOptions, VideoSourceConfig};
use crate::encode;
use crate::error::{GatewayError, Result};
use crate::protocol::{
    BackendMessage, ConfirmationStatus, DockCommand, ErrorStateResetCommand, ExposureCommand,
    JoystickCommand, Manifest, PointAndGoCommand, ResetExposureCommand, StopCommand, Telemetry,
    TurnInPlaceCommand, VehicleMessage, VideoRequest,
};
use crate::video::frame::CameraSample;
use crate::webrtc::{Signaler, StreamDescriptor};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Handler<T> = Mutex<Option<Box<dyn Fn(T) + Send + Sync>>>;

#[derive(Default)]
struct CommandHandlers {
    joystick: Handler<JoystickCommand>,
    point_and_go: Handler<PointAndGoCommand>,
    dock: Handler<DockCommand>,
    stop: Handler<StopCommand>,
    turn_in_place: Handler<TurnInPlaceCommand>,
    error_reset: Handler<ErrorStateResetCommand>,
    exposure: Handler<ExposureCommand>,
    reset_exposure: Handler<ResetExposureCommand>,
}

/// The persistent backend connection
pub struct ControlChannelClient {
    opts: Arc<ConnectionOptions>,
    signaler: Arc<Signaler>,
    handlers: CommandHandlers,
    outbound_tx: mpsc::UnboundedSender<VehicleMessage>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<VehicleMessage>>>,
}

impl ControlChannelClient {
    /// Create the client and wire the signaler's emissions into the
    /// outbound queue
    pub fn new(opts: Arc<ConnectionOptions>, signaler: Arc<Signaler>) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let client = Arc::new(Self {
            opts,
            signaler: signaler.clone(),
            handlers: CommandHandlers::default(),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
        });

        let outbound = client.outbound_tx.clone();
        signaler.on_emit(move |msg| {
            debug!("sending out message from signaler");
            if outbound.send(msg).is_err() {
                warn!("control channel gone, dropping signaler message");
            }
        });

        client
    }

    pub fn on_joystick(&self, handler: impl Fn(JoystickCommand) + Send + Sync + 'static) {
        *self.handlers.joystick.lock() = Some(Box::new(handler));
    }

    pub fn on_point_and_go(&self, handler: impl Fn(PointAndGoCommand) + Send + Sync + 'static) {
        *self.handlers.point_and_go.lock() = Some(Box::new(handler));
    }

    pub fn on_docking_requested(&self, handler: impl Fn(DockCommand) + Send + Sync + 'static) {
        *self.handlers.dock.lock() = Some(Box::new(handler));
    }

    pub fn on_stop_requested(&self, handler: impl Fn(StopCommand) + Send + Sync + 'static) {
        *self.handlers.stop.lock() = Some(Box::new(handler));
    }

    pub fn on_turn_in_place_requested(
        &self,
        handler: impl Fn(TurnInPlaceCommand) + Send + Sync + 'static,
    ) {
        *self.handlers.turn_in_place.lock() = Some(Box::new(handler));
    }

    pub fn on_error_state_reset(
        &self,
        handler: impl Fn(ErrorStateResetCommand) + Send + Sync + 'static,
    ) {
        *self.handlers.error_reset.lock() = Some(Box::new(handler));
    }

    pub fn on_exposure(&self, handler: impl Fn(ExposureCommand) + Send + Sync + 'static) {
        *self.handlers.exposure.lock() = Some(Box::new(handler));
    }

    pub fn on_reset_exposure(
        &self,
        handler: impl Fn(ResetExposureCommand) + Send + Sync + 'static,
    ) {
        *self.handlers.reset_exposure.lock() = Some(Box::new(handler));
    }

    /// Queue one outbound envelope
    pub fn send_message(&self, msg: VehicleMessage) -> bool {
        if self.outbound_tx.send(msg).is_err() {
            warn!("outbound queue closed, dropping message");
            return false;
        }
        true
    }

    /// Send one typed telemetry payload
    pub fn send(&self, payload: Telemetry) -> bool {
        self.send_message(VehicleMessage::telemetry(payload))
    }

    /// Acknowledge one inbound message id
    pub fn send_confirmation(&self, message_id: &str, status: ConfirmationStatus) -> bool {
        self.send_message(VehicleMessage::confirmation(message_id, status))
    }

    /// Encode and send one still frame; encode failures drop the frame
    pub fn send_still_image(&self, sample: &CameraSample) -> bool {
        match encode::encode_jpeg(sample, self.opts.jpeg_quality) {
            Ok(image) => self.send_message(VehicleMessage::frame(image)),
            Err(e) => {
                warn!("failed to encode frame, discarding: {}", e);
                false
            }
        }
    }

    fn send_manifest(&self) -> bool {
        let manifest = Manifest {
            cameras: self
                .opts
                .video_sources
                .iter()
                .map(|video| video.camera.clone())
                .collect(),
        };
        self.send_message(VehicleMessage::manifest(manifest))
    }

    fn registration_url(&self) -> String {
        format!(
            "{}/api/v1/ws/vehicle/{}/register",
            self.opts.backend_address, self.opts.vehicle_id
        )
    }

    /// Connect and serve until shut down. Dial failures are fatal and
    /// propagate; a closed connection is redialed immediately.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut outbound_rx = self
            .outbound_rx
            .lock()
            .take()
            .ok_or_else(|| GatewayError::Control("run called twice".into()))?;

        loop {
            // messages produced while disconnected are dropped, never
            // retried against the new connection
            let mut dropped = 0usize;
            while outbound_rx.try_recv().is_ok() {
                dropped += 1;
            }
            if dropped > 0 {
                warn!("dropped {} outbound messages while disconnected", dropped);
            }

            let ws = self.dial().await?;
            info!("control channel open");
            self.send_manifest();
            self.serve(ws, &mut outbound_rx).await;
            info!("control channel closed, reconnecting...");
        }
    }

    async fn dial(&self) -> Result<WsStream> {
        let url = self.registration_url();
        info!("dialing {}", url);

        let mut request = url
            .clone()
            .into_client_request()
            .map_err(|e| GatewayError::Control(format!("websocket initialization error: {e}")))?;

        if self.opts.auth_token.is_empty() {
            warn!("not sending any auth token to backend");
        } else {
            let cookie = HeaderValue::from_str(&format!("auth={}", self.opts.auth_token))
                .map_err(|e| GatewayError::Control(format!("invalid auth token: {e}")))?;
            request.headers_mut().insert(COOKIE, cookie);
        }

        let (ws, _) = connect_async(request).await.map_err(|e| {
            GatewayError::Control(format!(
                "unable to open websocket connection to backend: {e}"
            ))
        })?;
        Ok(ws)
    }

    async fn serve(
        &self,
        ws: WsStream,
        outbound_rx: &mut mpsc::UnboundedReceiver<VehicleMessage>,
    ) {
        let (mut sink, mut stream): (SplitSink<WsStream, Message>, SplitStream<WsStream>) =
            ws.split();

        loop {
            tokio::select! {
                outbound = outbound_rx.recv() => {
                    let Some(msg) = outbound else { return };
                    match serde_json::to_vec(&msg) {
                        Ok(payload) => {
                            debug!("serialized vehicle message to {} bytes", payload.len());
                            if let Err(e) = sink.send(Message::Binary(payload)).await {
                                warn!("error sending message to websocket: {}", e);
                                return;
                            }
                        }
                        Err(e) => error!("failed to serialize vehicle message: {}", e),
                    }
                }
                inbound = stream.next() => {
                    match inbound {
                        Some(Ok(Message::Binary(payload))) => self.handle_message(&payload).await,
                        Some(Ok(Message::Text(payload))) => self.handle_message(payload.as_bytes()).await,
                        Some(Ok(Message::Close(_))) => {
                            info!("backend closed the control channel");
                            return;
                        }
                        // pings are answered by the library
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("control channel receive error: {}", e);
                            return;
                        }
                        None => return,
                    }
                }
            }
        }
    }

    /// Dispatch every populated field of one inbound envelope, then
    /// confirm the message id if present
    async fn handle_message(&self, payload: &[u8]) {
        let msg: BackendMessage = match serde_json::from_slice(payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("could not parse message: {}", e);
                return;
            }
        };

        if let Some(cmd) = msg.joystick {
            if let Some(handler) = self.handlers.joystick.lock().as_ref() {
                handler(cmd);
            }
        }
        if let Some(cmd) = msg.point_and_go {
            if let Some(handler) = self.handlers.point_and_go.lock().as_ref() {
                handler(cmd);
            }
        }
        if let Some(cmd) = msg.dock {
            if let Some(handler) = self.handlers.dock.lock().as_ref() {
                handler(cmd);
            }
        }
        if let Some(cmd) = msg.stop {
            if let Some(handler) = self.handlers.stop.lock().as_ref() {
                handler(cmd);
            }
        }
        if let Some(cmd) = msg.turn_in_place {
            if let Some(handler) = self.handlers.turn_in_place.lock().as_ref() {
                handler(cmd);
            }
        }
        if let Some(cmd) = msg.error_reset {
            if let Some(handler) = self.handlers.error_reset.lock().as_ref() {
                handler(cmd);
            }
        }
        if let Some(cmd) = msg.exposure {
            if let Some(handler) = self.handlers.exposure.lock().as_ref() {
                handler(cmd);
            }
        }
        if let Some(cmd) = msg.reset_exposure {
            if let Some(handler) = self.handlers.reset_exposure.lock().as_ref() {
                handler(cmd);
            }
        }
        if let Some(request) = msg.video_request {
            self.handle_video_request(request).await;
        }
        if let Some(request) = msg.sdp_request {
            self.signaler.handle_sdp_request(&request).await;
        }
        if let Some(candidate) = msg.ice_candidate {
            self.signaler.handle_ice_candidate(&candidate).await;
        }

        // for now just acknowledge all commands immediately
        if !msg.id.is_empty() {
            info!("confirming message {}...", msg.id);
            self.send_confirmation(&msg.id, ConfirmationStatus::Success);
        }
    }

    async fn handle_video_request(&self, request: VideoRequest) {
        info!("received video request for camera {}", request.camera);

        if self.opts.video_sources.is_empty() {
            error!("ignoring video request because no cameras are registered");
            return;
        }

        let video = match self.find_video_source(&request.camera) {
            Some(video) => video,
            None => {
                warn!("camera {} not found, falling back to default", request.camera);
                &self.opts.video_sources[0]
            }
        };

        let stream = StreamDescriptor {
            address: video.source.address.clone(),
            topic: video.source.topic.clone(),
            output_width: request.width,
            output_height: request.height,
        };
        self.signaler
            .handle_video_request(&request.connection_id, stream)
            .await;
    }

    fn find_video_source(&self, name: &str) -> Option<&VideoSourceConfig> {
        if let Some(video) = self
            .opts
            .video_sources
            .iter()
            .find(|video| video.camera.name == name)
        {
            return Some(video);
        }

        // TODO: drop the alias lookup once the frontend stops hard-coding
        // camera names
        match name {
            "front" => self.find_video_source_by_role(CameraRole::FrontFisheye),
            "rear" => self.find_video_source_by_role(CameraRole::RearFisheye),
            _ => None,
        }
    }

    fn find_video_source_by_role(&self, role: CameraRole) -> Option<&VideoSourceConfig> {
        self.opts
            .video_sources
            .iter()
            .find(|video| video.camera.role == role)
    }
}
