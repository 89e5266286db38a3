//! teleop-gateway - Teleoperation video-streaming gateway
//!
//! Relays live camera frames from the vehicle's publish/subscribe bus to a
//! remote operator's browser over WebRTC, while a persistent control channel
//! carries signaling and command traffic to and from the backend.

pub mod config;
pub mod control;
pub mod encode;
pub mod error;
pub mod protocol;
pub mod source;
pub mod video;
pub mod webrtc;

pub use error::{GatewayError, Result};
