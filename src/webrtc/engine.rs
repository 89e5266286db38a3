//! Media engine facade
//!
//! Builds the webrtc API object once and hands out peer connections
//! configured with the gateway's ICE servers and UDP port restriction.
//! Construction happens once at startup and the engine must outlive every
//! session created through it.

use std::sync::Arc;

use tracing::info;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::RTCPeerConnection;

use crate::config::WebRtcOptions;
use crate::error::{GatewayError, Result};

/// Factory for peer connections
pub struct RtcEngine {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl RtcEngine {
    /// Build the engine from the configured ICE servers and port range
    pub fn new(opts: &WebRtcOptions) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| GatewayError::WebRtc(format!("failed to register codecs: {e}")))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| GatewayError::WebRtc(format!("failed to register interceptors: {e}")))?;

        let mut setting_engine = SettingEngine::default();
        info!("UDP port range: {}-{}", opts.min_udp_port, opts.max_udp_port);
        let ephemeral = EphemeralUDP::new(opts.min_udp_port, opts.max_udp_port)
            .map_err(|e| GatewayError::WebRtc(format!("invalid UDP port range: {e}")))?;
        setting_engine.set_udp_network(UDPNetwork::Ephemeral(ephemeral));

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        Ok(Self {
            api,
            ice_servers: build_ice_servers(opts),
        })
    }

    /// Create one peer connection with the engine's configuration
    pub async fn new_peer_connection(&self) -> Result<Arc<RTCPeerConnection>> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = self
            .api
            .new_peer_connection(config)
            .await
            .map_err(|e| GatewayError::WebRtc(format!("failed to create peer connection: {e}")))?;
        Ok(Arc::new(pc))
    }
}

fn build_ice_servers(opts: &WebRtcOptions) -> Vec<RTCIceServer> {
    let mut servers = Vec::new();

    for stun in &opts.stun_servers {
        servers.push(RTCIceServer {
            urls: vec![format!("stun:{}", stun.address)],
            ..Default::default()
        });
    }

    for turn in &opts.turn_servers {
        let url = format!("turn:{}?transport=tcp", turn.address);
        info!("adding turn server: {}", url);
        servers.push(RTCIceServer {
            urls: vec![url],
            username: turn.username.clone(),
            credential: turn.password.clone(),
            ..Default::default()
        });
    }

    servers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{StunServerConfig, TurnServerConfig};

    fn options() -> WebRtcOptions {
        WebRtcOptions {
            stun_servers: vec![StunServerConfig {
                address: "stun.example.com:3478".into(),
            }],
            turn_servers: vec![TurnServerConfig {
                address: "turn.example.com:3478".into(),
                username: "user".into(),
                password: "pass".into(),
            }],
            min_udp_port: 50000,
            max_udp_port: 50100,
        }
    }

    #[test]
    fn builds_stun_and_turn_urls() {
        let servers = build_ice_servers(&options());
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].urls, vec!["stun:stun.example.com:3478"]);
        assert_eq!(servers[1].urls, vec!["turn:turn.example.com:3478?transport=tcp"]);
        assert_eq!(servers[1].username, "user");
    }

    #[tokio::test]
    async fn creates_peer_connections() {
        let engine = RtcEngine::new(&options()).unwrap();
        let pc = engine.new_peer_connection().await.unwrap();
        pc.close().await.unwrap();
    }

    #[test]
    fn rejects_inverted_port_range() {
        let mut opts = options();
        opts.min_udp_port = 60000;
        opts.max_udp_port = 50000;
        assert!(RtcEngine::new(&opts).is_err());
    }
}
