//! Gateway configuration
//!
//! Options are loaded once at startup from a TOML file and are read-only
//! afterwards. A malformed configuration aborts the process before any
//! connection is attempted.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

/// Options for the backend connection and the streaming stack
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionOptions {
    /// Backend base address, e.g. `ws://backend.example.com:8080`
    pub backend_address: String,
    /// Vehicle identity used in the registration URL
    pub vehicle_id: String,
    /// Auth token attached as a cookie; empty means unauthenticated
    #[serde(default)]
    pub auth_token: String,
    /// Quality used when encoding still frames (1-100)
    pub jpeg_quality: u32,
    /// Negotiation server and port configuration
    pub webrtc: WebRtcOptions,
    /// Cameras available for streaming, in manifest order
    pub video_sources: Vec<VideoSourceConfig>,
}

/// ICE servers and the local UDP port restriction
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebRtcOptions {
    /// STUN server addresses (`host:port`)
    #[serde(default)]
    pub stun_servers: Vec<StunServerConfig>,
    /// TURN relay servers with credentials
    #[serde(default)]
    pub turn_servers: Vec<TurnServerConfig>,
    /// Lower bound of the UDP port range used for ICE candidates
    pub min_udp_port: u16,
    /// Upper bound of the UDP port range used for ICE candidates
    pub max_udp_port: u16,
}

/// STUN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StunServerConfig {
    /// Server address (`host:port`)
    pub address: String,
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// Server address (`host:port`)
    pub address: String,
    /// Username for TURN authentication
    pub username: String,
    /// Credential for TURN authentication
    pub password: String,
}

/// One named camera with its subscribe endpoint and default output size
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoSourceConfig {
    pub camera: CameraConfig,
    pub source: SourceConfig,
}

/// Camera identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Device name, matched exactly against video requests
    pub name: String,
    /// Role used by the legacy front/rear alias lookup
    pub role: CameraRole,
}

/// Camera role on the vehicle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraRole {
    FrontFisheye,
    RearFisheye,
    DockForward,
    Panorama,
}

/// Subscribe endpoint plus the default output resolution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Subscribe address, e.g. `tcp://127.0.0.1:5563`
    pub address: String,
    /// Topic filter on the bus
    pub topic: String,
    /// Default output width when a request does not override it
    pub output_width: u32,
    /// Default output height when a request does not override it
    pub output_height: u32,
}

impl ConnectionOptions {
    /// Load and validate options from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let opts: ConnectionOptions = toml::from_str(&raw)
            .map_err(|e| GatewayError::Config(format!("cannot parse {}: {}", path.display(), e)))?;
        opts.validate()?;
        Ok(opts)
    }

    /// Sanity-check the options; any violation is fatal at startup
    pub fn validate(&self) -> Result<()> {
        if self.backend_address.is_empty() {
            return Err(GatewayError::Config("backend_address is empty".into()));
        }
        if self.vehicle_id.is_empty() {
            return Err(GatewayError::Config("vehicle_id is empty".into()));
        }
        if self.jpeg_quality == 0 || self.jpeg_quality > 100 {
            return Err(GatewayError::Config(format!(
                "jpeg_quality must be 1-100, got {}",
                self.jpeg_quality
            )));
        }
        if self.webrtc.min_udp_port == 0 || self.webrtc.max_udp_port == 0 {
            return Err(GatewayError::Config("UDP port range is unset".into()));
        }
        if self.webrtc.min_udp_port > self.webrtc.max_udp_port {
            return Err(GatewayError::Config(format!(
                "UDP port range is inverted: {}-{}",
                self.webrtc.min_udp_port, self.webrtc.max_udp_port
            )));
        }
        if self.video_sources.is_empty() {
            return Err(GatewayError::Config("no video sources configured".into()));
        }
        for video in &self.video_sources {
            if video.camera.name.is_empty() {
                return Err(GatewayError::Config("video source with empty camera name".into()));
            }
            if video.source.address.is_empty() || video.source.topic.is_empty() {
                return Err(GatewayError::Config(format!(
                    "camera {} has an empty subscribe address or topic",
                    video.camera.name
                )));
            }
            if video.source.output_width == 0 || video.source.output_height == 0 {
                return Err(GatewayError::Config(format!(
                    "camera {} has a zero default output size",
                    video.camera.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
backend_address = "ws://backend.example.com:8080"
vehicle_id = "vehicle-7"
auth_token = "secret"
jpeg_quality = 80

[webrtc]
min_udp_port = 10000
max_udp_port = 10100

[[webrtc.stun_servers]]
address = "stun.example.com:3478"

[[webrtc.turn_servers]]
address = "turn.example.com:3478"
username = "user"
password = "pass"

[[video_sources]]
camera = { name = "fisheye-front", role = "front_fisheye" }
source = { address = "tcp://127.0.0.1:5563", topic = "camera.front", output_width = 1280, output_height = 720 }

[[video_sources]]
camera = { name = "fisheye-rear", role = "rear_fisheye" }
source = { address = "tcp://127.0.0.1:5564", topic = "camera.rear", output_width = 640, output_height = 360 }
"#;

    fn sample() -> ConnectionOptions {
        toml::from_str(SAMPLE).unwrap()
    }

    #[test]
    fn parses_full_config() {
        let opts = sample();
        assert_eq!(opts.vehicle_id, "vehicle-7");
        assert_eq!(opts.video_sources.len(), 2);
        assert_eq!(opts.webrtc.stun_servers[0].address, "stun.example.com:3478");
        assert_eq!(opts.video_sources[1].camera.role, CameraRole::RearFisheye);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let opts = ConnectionOptions::load(file.path()).unwrap();
        assert_eq!(opts.backend_address, "ws://backend.example.com:8080");
    }

    #[test]
    fn rejects_empty_vehicle_id() {
        let mut opts = sample();
        opts.vehicle_id.clear();
        assert!(opts.validate().is_err());
    }

    #[test]
    fn rejects_zero_jpeg_quality() {
        let mut opts = sample();
        opts.jpeg_quality = 0;
        assert!(opts.validate().is_err());
    }

    #[test]
    fn rejects_inverted_port_range() {
        let mut opts = sample();
        opts.webrtc.min_udp_port = 20000;
        opts.webrtc.max_udp_port = 10000;
        assert!(opts.validate().is_err());
    }

    #[test]
    fn rejects_missing_video_sources() {
        let mut opts = sample();
        opts.video_sources.clear();
        assert!(opts.validate().is_err());
    }

    #[test]
    fn rejects_zero_output_size() {
        let mut opts = sample();
        opts.video_sources[0].source.output_width = 0;
        assert!(opts.validate().is_err());
    }
}
