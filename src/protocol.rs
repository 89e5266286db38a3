//! Control-channel protocol envelopes
//!
//! Messages are JSON documents carried in binary WebSocket frames. Both
//! directions use an envelope struct of optional fields: the backend may
//! populate several command fields in one inbound envelope and every
//! populated field is dispatched, while outbound envelopes populate
//! exactly one field via the constructor helpers below.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::config::CameraConfig;

/// Inbound envelope from the backend
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendMessage {
    /// Message id; non-empty ids are confirmed exactly once
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub joystick: Option<JoystickCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub point_and_go: Option<PointAndGoCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dock: Option<DockCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_in_place: Option<TurnInPlaceCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reset: Option<ErrorStateResetCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exposure: Option<ExposureCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_exposure: Option<ResetExposureCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_request: Option<VideoRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_request: Option<SdpRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ice_candidate: Option<IceCandidateMessage>,
}

/// Outbound envelope to the backend
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VehicleMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<Manifest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation: Option<Confirmation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame: Option<CompressedImage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_request: Option<SdpRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ice_candidate: Option<IceCandidateMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gps: Option<GpsTelemetry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docking_observation: Option<DockingObservation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docking_status: Option<DockingStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detection: Option<BoxDetection>,
}

impl VehicleMessage {
    pub fn manifest(manifest: Manifest) -> Self {
        Self {
            manifest: Some(manifest),
            ..Default::default()
        }
    }

    pub fn confirmation(message_id: impl Into<String>, status: ConfirmationStatus) -> Self {
        Self {
            confirmation: Some(Confirmation {
                message_id: message_id.into(),
                status,
            }),
            ..Default::default()
        }
    }

    pub fn frame(image: CompressedImage) -> Self {
        Self {
            frame: Some(image),
            ..Default::default()
        }
    }

    pub fn sdp_request(request: SdpRequest) -> Self {
        Self {
            sdp_request: Some(request),
            ..Default::default()
        }
    }

    pub fn ice_candidate(candidate: IceCandidateMessage) -> Self {
        Self {
            ice_candidate: Some(candidate),
            ..Default::default()
        }
    }

    pub fn telemetry(payload: Telemetry) -> Self {
        let mut msg = Self::default();
        match payload {
            Telemetry::Gps(gps) => msg.gps = Some(gps),
            Telemetry::DockingObservation(obs) => msg.docking_observation = Some(obs),
            Telemetry::DockingStatus(status) => msg.docking_status = Some(status),
            Telemetry::Detection(det) => msg.detection = Some(det),
        }
        msg
    }
}

/// Typed telemetry payloads accepted by `ControlChannelClient::send`
#[derive(Debug, Clone)]
pub enum Telemetry {
    Gps(GpsTelemetry),
    DockingObservation(DockingObservation),
    DockingStatus(DockingStatus),
    Detection(BoxDetection),
}

/// Joystick driving command
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JoystickCommand {
    pub linear_velocity: f64,
    pub angular_velocity: f64,
}

/// Point-and-go target in viewer image coordinates
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PointAndGoCommand {
    pub x: f64,
    pub y: f64,
}

/// Request to dock at a station
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockCommand {
    #[serde(default)]
    pub station: String,
}

/// Immediate stop
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StopCommand {}

/// Rotate in place by the given angle (radians, positive is left)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnInPlaceCommand {
    pub angle: f64,
}

/// Clear a latched error state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorStateResetCommand {}

/// Manual exposure override for one camera
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExposureCommand {
    pub camera: String,
    pub exposure: f64,
}

/// Return one camera to auto exposure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResetExposureCommand {
    pub camera: String,
}

/// Viewer request for video from a named camera
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VideoRequest {
    pub connection_id: String,
    pub camera: String,
    pub width: u32,
    pub height: u32,
}

/// SDP exchange message (offers outbound, answers inbound)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdpRequest {
    pub connection_id: String,
    pub status: SdpStatus,
    pub sdp: String,
}

/// Position of an SDP message in the offer/answer round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpStatus {
    Offered,
    Answered,
}

/// One trickled ICE candidate
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IceCandidateMessage {
    pub connection_id: String,
    pub sdp_mid: String,
    /// Index of the media line; -1 marks an invalid candidate from
    /// legacy frontends and is rejected before reaching the engine
    pub sdp_mline_index: i32,
    pub candidate: String,
}

/// Acknowledgement of one inbound message id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Confirmation {
    pub message_id: String,
    pub status: ConfirmationStatus,
}

/// Confirmation outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmationStatus {
    Success,
    Failure,
}

/// Camera list sent once per control-channel open
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    pub cameras: Vec<CameraConfig>,
}

/// A single encoded still frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressedImage {
    pub width: u32,
    pub height: u32,
    pub encoding: ImageEncoding,
    #[serde(with = "base64_bytes")]
    pub content: Bytes,
}

/// Still-frame encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageEncoding {
    Jpeg,
}

/// GPS fix forwarded to the backend
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GpsTelemetry {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
}

/// Relative observation of the docking target
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockingObservation {
    pub station: String,
    pub range: f64,
    pub bearing: f64,
}

/// Progress of a docking maneuver
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockingStatus {
    pub station: String,
    pub docked: bool,
}

/// Camera-aligned box detection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BoxDetection {
    pub camera: String,
    pub label: String,
    pub confidence: f64,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
