// SPDX-License-Identifier: GPL-3.0-only
//! CPU pixel format conversion for capture sources
//!
//! Everything downstream of a source works on RGBA, so sources convert on
//! the capture thread before delivery.

/// Convert YUYV (YUV 4:2:2) to RGBA
///
/// YUYV format: Y0 U0 Y1 V0 - each 4-byte group encodes 2 pixels.
/// `stride` is the source row length in bytes.
pub fn yuyv_to_rgba(data: &[u8], width: u32, height: u32, stride: u32) -> Vec<u8> {
    packed_422_to_rgba(data, width, height, stride, [0, 1, 2, 3])
}

/// Convert UYVY (YUV 4:2:2) to RGBA
///
/// UYVY format: U0 Y0 V0 Y1 - each 4-byte group encodes 2 pixels.
pub fn uyvy_to_rgba(data: &[u8], width: u32, height: u32, stride: u32) -> Vec<u8> {
    packed_422_to_rgba(data, width, height, stride, [1, 0, 3, 2])
}

/// Shared 4:2:2 unpacking; `order` gives the byte offsets of Y0, U, Y1, V
fn packed_422_to_rgba(
    data: &[u8],
    width: u32,
    height: u32,
    stride: u32,
    order: [usize; 4],
) -> Vec<u8> {
    let width = width as usize;
    let height = height as usize;
    let stride = (stride as usize).max(width * 2);
    let mut rgba = Vec::with_capacity(width * height * 4);

    for row in 0..height {
        let start = row * stride;
        let Some(line) = data.get(start..start + width * 2) else {
            // Short buffer: pad the rest of the frame with black
            rgba.resize(width * height * 4, 0);
            break;
        };

        for (pair, chunk) in line.chunks_exact(4).enumerate() {
            let (y0, u, y1, v) = (
                chunk[order[0]],
                chunk[order[1]],
                chunk[order[2]],
                chunk[order[3]],
            );

            for (i, luma) in [y0, y1].into_iter().enumerate() {
                if pair * 2 + i >= width {
                    break;
                }
                let (r, g, b) = yuv_to_rgb(luma, u, v);
                rgba.extend_from_slice(&[r, g, b, 255]);
            }
        }
    }

    rgba
}

/// Convert packed RGB24 to RGBA
pub fn rgb_to_rgba(rgb: &[u8]) -> Vec<u8> {
    let mut rgba = Vec::with_capacity(rgb.len() / 3 * 4);
    for px in rgb.chunks_exact(3) {
        rgba.extend_from_slice(&[px[0], px[1], px[2], 255]);
    }
    rgba
}

/// Decode an MJPEG frame into RGBA
pub fn mjpeg_to_rgba(data: &[u8]) -> Result<(u32, u32, Vec<u8>), image::ImageError> {
    let decoded = image::load_from_memory_with_format(data, image::ImageFormat::Jpeg)?;
    let rgba = decoded.to_rgba8();
    let (width, height) = rgba.dimensions();
    Ok((width, height, rgba.into_raw()))
}

/// Convert YUV (BT.601) to RGB
pub fn yuv_to_rgb(y: u8, u: u8, v: u8) -> (u8, u8, u8) {
    let y = y as f32;
    let u = u as f32 - 128.0;
    let v = v as f32 - 128.0;

    let r = (y + 1.402 * v).clamp(0.0, 255.0) as u8;
    let g = (y - 0.344136 * u - 0.714136 * v).clamp(0.0, 255.0) as u8;
    let b = (y + 1.772 * u).clamp(0.0, 255.0) as u8;

    (r, g, b)
}

/// BT.601 luma of an RGB pixel
pub fn luma(r: u8, g: u8, b: u8) -> u8 {
    ((r as u32 * 299 + g as u32 * 587 + b as u32 * 114) / 1000) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_grey_pixels() {
        // Two pixels with neutral chroma: Y0=16, Y1=235
        let data = [16u8, 128, 235, 128];
        let rgba = yuyv_to_rgba(&data, 2, 1, 4);
        assert_eq!(rgba, vec![16, 16, 16, 255, 235, 235, 235, 255]);
    }

    #[test]
    fn test_uyvy_matches_yuyv_reordered() {
        let yuyv = [100u8, 90, 150, 170];
        let uyvy = [90u8, 100, 170, 150];
        assert_eq!(
            yuyv_to_rgba(&yuyv, 2, 1, 4),
            uyvy_to_rgba(&uyvy, 2, 1, 4)
        );
    }

    #[test]
    fn test_yuyv_respects_stride_and_short_buffers() {
        // 2x2 frame with 2 bytes of padding per row, second row missing
        let data = [50u8, 128, 60, 128, 0, 0];
        let rgba = yuyv_to_rgba(&data, 2, 2, 6);
        assert_eq!(rgba.len(), 16);
        assert_eq!(&rgba[0..4], &[50, 50, 50, 255]);
        assert_eq!(&rgba[8..16], &[0; 8]);
    }

    #[test]
    fn test_rgb_to_rgba() {
        assert_eq!(rgb_to_rgba(&[1, 2, 3, 4, 5, 6]), vec![1, 2, 3, 255, 4, 5, 6, 255]);
    }

    #[test]
    fn test_luma_extremes() {
        assert_eq!(luma(0, 0, 0), 0);
        assert_eq!(luma(255, 255, 255), 255);
    }
}
