//! WebRTC streaming module
//!
//! Bridges the control-channel signaling protocol and the media engine:
//!
//! ```text
//! camera bus ──> FrameSource ──> VideoCapturer ──> VideoTrack ──> engine
//!                                    ^
//! backend ──> Signaler ──> Session ──┘
//!                 ^            |
//!                 └── events ──┘
//! ```
//!
//! The heavy engine types stay inside this module; only SDP strings,
//! candidate tuples, and light state enums cross its boundary.

pub mod engine;
pub mod session;
pub mod signaler;
pub mod track;

pub use engine::RtcEngine;
pub use session::{LocalCandidate, SdpKind, Session, SignalingState, StreamDescriptor};
pub use signaler::Signaler;
pub use track::VideoTrack;
