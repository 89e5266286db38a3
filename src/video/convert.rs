//! Planar YUV buffers and color space conversion
//!
//! Camera samples arrive as grayscale, RGB, or RGBA and are converted to
//! I420 (BT.601 studio swing) before being handed to the video track.
//! Scaling is bilinear, done per plane.

use crate::error::{GatewayError, Result};
use crate::video::frame::{CameraSample, PixelFormat};

/// I420 buffer with separate Y, U, V planes
#[derive(Debug, Clone)]
pub struct I420Buffer {
    /// Raw buffer containing all planes
    data: Vec<u8>,
    width: u32,
    height: u32,
    /// U plane offset (Y plane always starts at 0)
    u_offset: usize,
    /// V plane offset
    v_offset: usize,
}

impl I420Buffer {
    /// Allocate a buffer for the given frame size
    pub fn new(width: u32, height: u32) -> Self {
        let y_size = width as usize * height as usize;
        let chroma_size = Self::chroma_width_for(width) * Self::chroma_height_for(height);

        Self {
            data: vec![0u8; y_size + chroma_size * 2],
            width,
            height,
            u_offset: y_size,
            v_offset: y_size + chroma_size,
        }
    }

    fn chroma_width_for(width: u32) -> usize {
        (width as usize + 1) / 2
    }

    fn chroma_height_for(height: u32) -> usize {
        (height as usize + 1) / 2
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Width of the subsampled chroma planes
    pub fn chroma_width(&self) -> usize {
        Self::chroma_width_for(self.width)
    }

    /// Height of the subsampled chroma planes
    pub fn chroma_height(&self) -> usize {
        Self::chroma_height_for(self.height)
    }

    pub fn y_plane(&self) -> &[u8] {
        &self.data[..self.u_offset]
    }

    pub fn y_plane_mut(&mut self) -> &mut [u8] {
        let end = self.u_offset;
        &mut self.data[..end]
    }

    pub fn u_plane(&self) -> &[u8] {
        &self.data[self.u_offset..self.v_offset]
    }

    pub fn u_plane_mut(&mut self) -> &mut [u8] {
        let (start, end) = (self.u_offset, self.v_offset);
        &mut self.data[start..end]
    }

    pub fn v_plane(&self) -> &[u8] {
        &self.data[self.v_offset..]
    }

    pub fn v_plane_mut(&mut self) -> &mut [u8] {
        let start = self.v_offset;
        &mut self.data[start..]
    }

    /// All planes as one contiguous slice (Y, then U, then V)
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

fn check_sample(sample: &CameraSample, out: &I420Buffer, bpp: usize) -> Result<()> {
    if sample.width != out.width() || sample.height != out.height() {
        return Err(GatewayError::Video(format!(
            "sample is {}x{} but buffer is {}x{}",
            sample.width,
            sample.height,
            out.width(),
            out.height()
        )));
    }
    if (sample.stride as usize) < sample.width as usize * bpp {
        return Err(GatewayError::Video(format!(
            "stride {} too small for {} pixels of {} bytes",
            sample.stride, sample.width, bpp
        )));
    }
    let needed = sample.stride as usize * sample.height as usize;
    if sample.data.len() < needed {
        return Err(GatewayError::Video(format!(
            "sample payload is {} bytes, need {}",
            sample.data.len(),
            needed
        )));
    }
    Ok(())
}

/// Expand a grayscale sample into I420: luma copied, chroma neutral
pub fn luminance_to_i420(sample: &CameraSample, out: &mut I420Buffer) -> Result<()> {
    check_sample(sample, out, 1)?;

    let width = sample.width as usize;
    let stride = sample.stride as usize;
    for (row, dst) in out.y_plane_mut().chunks_exact_mut(width).enumerate() {
        let start = row * stride;
        dst.copy_from_slice(&sample.data[start..start + width]);
    }

    out.u_plane_mut().fill(128);
    out.v_plane_mut().fill(128);
    Ok(())
}

/// Convert a packed RGB sample into I420
pub fn rgb_to_i420(sample: &CameraSample, out: &mut I420Buffer) -> Result<()> {
    rgbx_to_i420(sample, out, 3)
}

/// Convert a packed RGBA sample into I420, dropping alpha
pub fn rgba_to_i420(sample: &CameraSample, out: &mut I420Buffer) -> Result<()> {
    rgbx_to_i420(sample, out, 4)
}

// BT.601 studio-swing coefficients, the same fixed-point form libyuv uses.
fn rgb_to_y(r: i32, g: i32, b: i32) -> u8 {
    (((66 * r + 129 * g + 25 * b + 128) >> 8) + 16) as u8
}

fn rgb_to_u(r: i32, g: i32, b: i32) -> u8 {
    (((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128) as u8
}

fn rgb_to_v(r: i32, g: i32, b: i32) -> u8 {
    (((112 * r - 94 * g - 18 * b + 128) >> 8) + 128) as u8
}

fn rgbx_to_i420(sample: &CameraSample, out: &mut I420Buffer, bpp: usize) -> Result<()> {
    check_sample(sample, out, bpp)?;

    let width = sample.width as usize;
    let height = sample.height as usize;
    let stride = sample.stride as usize;
    let src = &sample.data;

    for (row, dst) in out.y_plane_mut().chunks_exact_mut(width).enumerate() {
        let line = &src[row * stride..];
        for (x, y_out) in dst.iter_mut().enumerate() {
            let p = x * bpp;
            *y_out = rgb_to_y(line[p] as i32, line[p + 1] as i32, line[p + 2] as i32);
        }
    }

    // Chroma from the average of each 2x2 block, clamped at the edges.
    let chroma_width = out.chroma_width();
    let chroma_height = out.chroma_height();
    for cy in 0..chroma_height {
        for cx in 0..chroma_width {
            let mut r = 0i32;
            let mut g = 0i32;
            let mut b = 0i32;
            let mut n = 0i32;
            for dy in 0..2 {
                let y = (cy * 2 + dy).min(height - 1);
                for dx in 0..2 {
                    let x = (cx * 2 + dx).min(width - 1);
                    let p = y * stride + x * bpp;
                    r += src[p] as i32;
                    g += src[p + 1] as i32;
                    b += src[p + 2] as i32;
                    n += 1;
                }
            }
            r /= n;
            g /= n;
            b /= n;
            out.u_plane_mut()[cy * chroma_width + cx] = rgb_to_u(r, g, b);
            out.v_plane_mut()[cy * chroma_width + cx] = rgb_to_v(r, g, b);
        }
    }
    Ok(())
}

/// Bilinear rescale of one I420 buffer into another
pub fn scale_i420(src: &I420Buffer, dst: &mut I420Buffer) {
    let (dw, dh) = (dst.width() as usize, dst.height() as usize);
    scale_plane(
        src.y_plane(),
        src.width() as usize,
        src.height() as usize,
        dw,
        dh,
        dst.y_plane_mut(),
    );
    let (sw, sh) = (src.chroma_width(), src.chroma_height());
    let (dw, dh) = (dst.chroma_width(), dst.chroma_height());
    scale_plane(src.u_plane(), sw, sh, dw, dh, dst.u_plane_mut());
    scale_plane(src.v_plane(), sw, sh, dw, dh, dst.v_plane_mut());
}

// 16.16 fixed-point bilinear interpolation with corner alignment.
fn scale_plane(src: &[u8], sw: usize, sh: usize, dw: usize, dh: usize, dst: &mut [u8]) {
    if sw == dw && sh == dh {
        dst[..sw * sh].copy_from_slice(&src[..sw * sh]);
        return;
    }

    let x_step = if dw > 1 { (((sw - 1) as u64) << 16) / (dw - 1) as u64 } else { 0 };
    let y_step = if dh > 1 { (((sh - 1) as u64) << 16) / (dh - 1) as u64 } else { 0 };

    for dy in 0..dh {
        let sy = dy as u64 * y_step;
        let y0 = (sy >> 16) as usize;
        let y1 = (y0 + 1).min(sh - 1);
        let fy = (sy & 0xFFFF) as u32;

        for dx in 0..dw {
            let sx = dx as u64 * x_step;
            let x0 = (sx >> 16) as usize;
            let x1 = (x0 + 1).min(sw - 1);
            let fx = (sx & 0xFFFF) as u32;

            let p00 = src[y0 * sw + x0] as u32;
            let p01 = src[y0 * sw + x1] as u32;
            let p10 = src[y1 * sw + x0] as u32;
            let p11 = src[y1 * sw + x1] as u32;

            let top = (p00 * (0x10000 - fx) + p01 * fx) >> 16;
            let bottom = (p10 * (0x10000 - fx) + p11 * fx) >> 16;
            dst[dy * dw + dx] = ((top * (0x10000 - fy) + bottom * fy) >> 16) as u8;
        }
    }
}

/// Convert a sample into the buffer according to its pixel format
pub fn convert_to_i420(sample: &CameraSample, out: &mut I420Buffer) -> Result<()> {
    match sample.format {
        PixelFormat::Luminance => luminance_to_i420(sample, out),
        PixelFormat::Rgb => rgb_to_i420(sample, out),
        PixelFormat::Rgba => rgba_to_i420(sample, out),
        other => Err(GatewayError::Video(format!(
            "unsupported camera sample format {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn gray_sample(width: u32, height: u32, value: u8) -> CameraSample {
        CameraSample::packed(
            width,
            height,
            PixelFormat::Luminance,
            Bytes::from(vec![value; (width * height) as usize]),
        )
    }

    #[test]
    fn solid_gray_becomes_luma_with_neutral_chroma() {
        let sample = gray_sample(8, 6, 77);
        let mut out = I420Buffer::new(8, 6);
        luminance_to_i420(&sample, &mut out).unwrap();

        assert!(out.y_plane().iter().all(|&v| v == 77));
        assert!(out.u_plane().iter().all(|&v| v == 128));
        assert!(out.v_plane().iter().all(|&v| v == 128));
    }

    #[test]
    fn white_rgb_maps_to_studio_swing_peak() {
        let data = Bytes::from(vec![255u8; 4 * 4 * 3]);
        let sample = CameraSample::packed(4, 4, PixelFormat::Rgb, data);
        let mut out = I420Buffer::new(4, 4);
        rgb_to_i420(&sample, &mut out).unwrap();

        assert!(out.y_plane().iter().all(|&v| v == 235));
        assert!(out.u_plane().iter().all(|&v| v == 128));
        assert!(out.v_plane().iter().all(|&v| v == 128));
    }

    #[test]
    fn rgba_ignores_alpha() {
        let mut rgb = Vec::new();
        let mut rgba = Vec::new();
        for i in 0..(4 * 4) {
            let (r, g, b) = (i as u8 * 3, 200 - i as u8, i as u8);
            rgb.extend_from_slice(&[r, g, b]);
            rgba.extend_from_slice(&[r, g, b, 9]);
        }
        let mut from_rgb = I420Buffer::new(4, 4);
        let mut from_rgba = I420Buffer::new(4, 4);
        rgb_to_i420(
            &CameraSample::packed(4, 4, PixelFormat::Rgb, Bytes::from(rgb)),
            &mut from_rgb,
        )
        .unwrap();
        rgba_to_i420(
            &CameraSample::packed(4, 4, PixelFormat::Rgba, Bytes::from(rgba)),
            &mut from_rgba,
        )
        .unwrap();

        assert_eq!(from_rgb.as_bytes(), from_rgba.as_bytes());
    }

    #[test]
    fn conversion_rejects_truncated_payload() {
        let sample = CameraSample {
            data: Bytes::from(vec![0u8; 10]),
            ..gray_sample(8, 8, 0)
        };
        let mut out = I420Buffer::new(8, 8);
        assert!(luminance_to_i420(&sample, &mut out).is_err());
    }

    #[test]
    fn conversion_rejects_mismatched_dimensions() {
        let sample = gray_sample(8, 8, 0);
        let mut out = I420Buffer::new(4, 4);
        assert!(luminance_to_i420(&sample, &mut out).is_err());
    }

    #[test]
    fn respects_row_stride() {
        // 2 meaningful pixels per row, 2 bytes padding
        let mut data = Vec::new();
        for _ in 0..2 {
            data.extend_from_slice(&[50, 60, 0, 0]);
        }
        let sample = CameraSample {
            width: 2,
            height: 2,
            stride: 4,
            format: PixelFormat::Luminance,
            element_type: crate::video::frame::ElementType::UnsignedByte,
            data: Bytes::from(data),
        };
        let mut out = I420Buffer::new(2, 2);
        luminance_to_i420(&sample, &mut out).unwrap();
        assert_eq!(out.y_plane(), &[50, 60, 50, 60]);
    }

    #[test]
    fn scale_same_size_is_a_copy() {
        let sample = gray_sample(6, 4, 90);
        let mut src = I420Buffer::new(6, 4);
        luminance_to_i420(&sample, &mut src).unwrap();
        let mut dst = I420Buffer::new(6, 4);
        scale_i420(&src, &mut dst);
        assert_eq!(src.as_bytes(), dst.as_bytes());
    }

    #[test]
    fn scale_preserves_solid_color() {
        let sample = gray_sample(64, 48, 123);
        let mut src = I420Buffer::new(64, 48);
        luminance_to_i420(&sample, &mut src).unwrap();
        let mut dst = I420Buffer::new(32, 18);
        scale_i420(&src, &mut dst);
        assert!(dst.y_plane().iter().all(|&v| v == 123));
        assert!(dst.u_plane().iter().all(|&v| v == 128));
    }

    #[test]
    fn scale_keeps_corner_values() {
        let mut src = I420Buffer::new(4, 4);
        src.y_plane_mut().fill(10);
        src.y_plane_mut()[0] = 200;
        let mut dst = I420Buffer::new(8, 8);
        scale_i420(&src, &mut dst);
        assert_eq!(dst.y_plane()[0], 200);
        assert_eq!(dst.y_plane()[8 * 8 - 1], 10);
    }

    #[test]
    fn odd_dimensions_round_chroma_up() {
        let buf = I420Buffer::new(5, 3);
        assert_eq!(buf.chroma_width(), 3);
        assert_eq!(buf.chroma_height(), 2);
        assert_eq!(buf.len(), 5 * 3 + 3 * 2 * 2);
    }
}
