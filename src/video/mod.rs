//! Video frame types, color conversion, and the capture pipeline

pub mod capture;
pub mod convert;
pub mod frame;

pub use capture::{FrameSink, OutputFrame, VideoCapturer};
pub use convert::I420Buffer;
pub use frame::{CameraSample, ElementType, PixelFormat};
