//! Raw camera sample data structures and their wire codec
//!
//! Samples travel over the pub/sub bus as length-prefixed binary frames:
//! a fixed header (width, height, stride, format tag, element type tag)
//! followed by the pixel payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{GatewayError, Result};

/// Pixel layout of a camera sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Single-channel grayscale, 1 byte per pixel
    Luminance,
    /// Packed RGB, 3 bytes per pixel
    Rgb,
    /// Packed RGBA, 4 bytes per pixel
    Rgba,
    /// Packed YUV 4:2:2, 2 bytes per pixel; published by some cameras
    /// but not accepted by the streaming pipeline
    Yuyv,
}

impl PixelFormat {
    /// Bytes per pixel for this format
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Luminance => 1,
            PixelFormat::Rgb => 3,
            PixelFormat::Rgba => 4,
            PixelFormat::Yuyv => 2,
        }
    }

    fn to_tag(self) -> u8 {
        match self {
            PixelFormat::Luminance => 0,
            PixelFormat::Rgb => 1,
            PixelFormat::Rgba => 2,
            PixelFormat::Yuyv => 3,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(PixelFormat::Luminance),
            1 => Ok(PixelFormat::Rgb),
            2 => Ok(PixelFormat::Rgba),
            3 => Ok(PixelFormat::Yuyv),
            other => Err(GatewayError::Video(format!("unknown pixel format tag {other}"))),
        }
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PixelFormat::Luminance => write!(f, "luminance"),
            PixelFormat::Rgb => write!(f, "rgb"),
            PixelFormat::Rgba => write!(f, "rgba"),
            PixelFormat::Yuyv => write!(f, "yuyv"),
        }
    }
}

/// Element type of the pixel channels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    UnsignedByte,
    UnsignedShort,
    Float,
}

impl ElementType {
    fn to_tag(self) -> u8 {
        match self {
            ElementType::UnsignedByte => 0,
            ElementType::UnsignedShort => 1,
            ElementType::Float => 2,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(ElementType::UnsignedByte),
            1 => Ok(ElementType::UnsignedShort),
            2 => Ok(ElementType::Float),
            other => Err(GatewayError::Video(format!("unknown element type tag {other}"))),
        }
    }
}

impl std::fmt::Display for ElementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElementType::UnsignedByte => write!(f, "u8"),
            ElementType::UnsignedShort => write!(f, "u16"),
            ElementType::Float => write!(f, "f32"),
        }
    }
}

/// One raw frame as published on the camera bus
#[derive(Debug, Clone)]
pub struct CameraSample {
    pub width: u32,
    pub height: u32,
    /// Bytes per row; at least `width * bytes_per_pixel`
    pub stride: u32,
    pub format: PixelFormat,
    pub element_type: ElementType,
    pub data: Bytes,
}

/// Header size of the wire encoding
const HEADER_LEN: usize = 4 + 4 + 4 + 1 + 1;

impl CameraSample {
    /// Create a packed sample (stride equals width * bytes per pixel)
    pub fn packed(width: u32, height: u32, format: PixelFormat, data: Bytes) -> Self {
        Self {
            width,
            height,
            stride: width * format.bytes_per_pixel() as u32,
            format,
            element_type: ElementType::UnsignedByte,
            data,
        }
    }

    /// Serialize to the bus wire format
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.data.len());
        buf.put_u32(self.width);
        buf.put_u32(self.height);
        buf.put_u32(self.stride);
        buf.put_u8(self.format.to_tag());
        buf.put_u8(self.element_type.to_tag());
        buf.extend_from_slice(&self.data);
        buf.freeze()
    }

    /// Deserialize from the bus wire format
    pub fn decode(mut buf: Bytes) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(GatewayError::Video(format!(
                "camera sample too short: {} bytes",
                buf.len()
            )));
        }
        let width = buf.get_u32();
        let height = buf.get_u32();
        let stride = buf.get_u32();
        let format = PixelFormat::from_tag(buf.get_u8())?;
        let element_type = ElementType::from_tag(buf.get_u8())?;

        let min_len = stride as usize * height as usize;
        if buf.len() < min_len {
            return Err(GatewayError::Video(format!(
                "camera sample payload truncated: {} bytes for {}x{} stride {}",
                buf.len(),
                width,
                height,
                stride
            )));
        }

        Ok(Self {
            width,
            height,
            stride,
            format,
            element_type,
            data: buf,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_preserves_fields() {
        let data = Bytes::from(vec![7u8; 4 * 2 * 3]);
        let sample = CameraSample::packed(4, 2, PixelFormat::Rgb, data);
        let decoded = CameraSample::decode(sample.encode()).unwrap();
        assert_eq!(decoded.width, 4);
        assert_eq!(decoded.height, 2);
        assert_eq!(decoded.stride, 12);
        assert_eq!(decoded.format, PixelFormat::Rgb);
        assert_eq!(decoded.element_type, ElementType::UnsignedByte);
        assert_eq!(decoded.data.len(), 24);
    }

    #[test]
    fn decode_rejects_short_buffer() {
        assert!(CameraSample::decode(Bytes::from_static(&[0, 1, 2])).is_err());
    }

    #[test]
    fn decode_rejects_unknown_format_tag() {
        let mut sample = CameraSample::packed(1, 1, PixelFormat::Luminance, Bytes::from(vec![0u8]));
        sample.stride = 1;
        let mut wire = BytesMut::from(&sample.encode()[..]);
        wire[12] = 99;
        assert!(CameraSample::decode(wire.freeze()).is_err());
    }

    #[test]
    fn decode_rejects_truncated_payload() {
        let sample = CameraSample::packed(10, 10, PixelFormat::Rgba, Bytes::from(vec![0u8; 10]));
        assert!(CameraSample::decode(sample.encode()).is_err());
    }

    #[test]
    fn bytes_per_pixel_matches_format() {
        assert_eq!(PixelFormat::Luminance.bytes_per_pixel(), 1);
        assert_eq!(PixelFormat::Rgb.bytes_per_pixel(), 3);
        assert_eq!(PixelFormat::Rgba.bytes_per_pixel(), 4);
    }
}
