//! JPEG encoding of still frames for the control channel

use bytes::Bytes;

use crate::error::{GatewayError, Result};
use crate::protocol::{CompressedImage, ImageEncoding};
use crate::video::frame::{CameraSample, PixelFormat};

/// Encode one raw sample as a JPEG still at the given quality (1-100)
pub fn encode_jpeg(sample: &CameraSample, quality: u32) -> Result<CompressedImage> {
    let (format, subsamp) = match sample.format {
        PixelFormat::Luminance => (turbojpeg::PixelFormat::GRAY, turbojpeg::Subsamp::Gray),
        PixelFormat::Rgb => (turbojpeg::PixelFormat::RGB, turbojpeg::Subsamp::Sub2x2),
        PixelFormat::Rgba => (turbojpeg::PixelFormat::RGBA, turbojpeg::Subsamp::Sub2x2),
        other => {
            return Err(GatewayError::Encode(format!(
                "cannot encode camera sample with format {other}"
            )))
        }
    };

    let needed = sample.stride as usize * sample.height as usize;
    if sample.data.len() < needed {
        return Err(GatewayError::Encode(format!(
            "sample payload is {} bytes, need {}",
            sample.data.len(),
            needed
        )));
    }

    let image = turbojpeg::Image {
        pixels: &sample.data[..],
        width: sample.width as usize,
        pitch: sample.stride as usize,
        height: sample.height as usize,
        format,
    };

    let jpeg = turbojpeg::compress(image, quality.min(100) as i32, subsamp)
        .map_err(|e| GatewayError::Encode(format!("jpeg compression failed: {e}")))?;

    Ok(CompressedImage {
        width: sample.width,
        height: sample.height,
        encoding: ImageEncoding::Jpeg,
        content: Bytes::from(jpeg.to_vec()),
    })
}
