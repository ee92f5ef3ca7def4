//! Decoded video frames.
//!
//! A `Frame` is an owned, tightly packed RGB8 buffer. Frames are transient:
//! they live for one sampling cycle and are only written to disk by the alert
//! dispatcher, as a JPEG snapshot.

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, GenericImageView};

const SNAPSHOT_JPEG_QUALITY: u8 = 90;
const OVERLAY_THICKNESS: u32 = 2;
const MARKER_RADIUS: i64 = 3;

#[derive(Clone)]
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    /// Wrap packed RGB8 pixels. Fails if the buffer does not match the dimensions.
    pub fn from_rgb(data: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = (width as usize) * (height as usize) * 3;
        if data.len() != expected {
            return Err(anyhow!(
                "rgb buffer is {} bytes, expected {} for {}x{}",
                data.len(),
                expected,
                width,
                height
            ));
        }
        Ok(Self {
            data,
            width,
            height,
        })
    }

    /// Solid-colour frame; used by synthetic sources.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let mut data = Vec::with_capacity((width * height * 3) as usize);
        for _ in 0..(width * height) {
            data.extend_from_slice(&rgb);
        }
        Self {
            data,
            width,
            height,
        }
    }

    pub fn from_jpeg(bytes: &[u8]) -> Result<Self> {
        let image = image::load_from_memory(bytes).context("decode jpeg")?;
        let (width, height) = image.dimensions();
        let rgb = image.into_rgb8();
        Ok(Self {
            data: rgb.into_raw(),
            width,
            height,
        })
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn to_jpeg(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut out, SNAPSHOT_JPEG_QUALITY);
        encoder
            .encode(&self.data, self.width, self.height, ExtendedColorType::Rgb8)
            .context("encode jpeg")?;
        Ok(out)
    }

    /// Burn a rectangle outline into the frame. Coordinates are in pixels and
    /// are clamped to the frame bounds.
    pub fn draw_rect(&mut self, x1: f32, y1: f32, x2: f32, y2: f32, rgb: [u8; 3]) {
        if self.width == 0 || self.height == 0 {
            return;
        }
        let max_x = (self.width - 1) as f32;
        let max_y = (self.height - 1) as f32;
        let left = x1.min(x2).clamp(0.0, max_x) as u32;
        let right = x1.max(x2).clamp(0.0, max_x) as u32;
        let top = y1.min(y2).clamp(0.0, max_y) as u32;
        let bottom = y1.max(y2).clamp(0.0, max_y) as u32;

        for t in 0..OVERLAY_THICKNESS {
            for x in left..=right {
                self.put_pixel(x, top.saturating_add(t).min(bottom), rgb);
                self.put_pixel(x, bottom.saturating_sub(t).max(top), rgb);
            }
            for y in top..=bottom {
                self.put_pixel(left.saturating_add(t).min(right), y, rgb);
                self.put_pixel(right.saturating_sub(t).max(left), y, rgb);
            }
        }
    }

    /// Burn a filled square centred on a point. Points outside the frame are
    /// ignored rather than clamped onto the border.
    pub fn draw_marker(&mut self, x: f32, y: f32, rgb: [u8; 3]) {
        if !(x.is_finite() && y.is_finite()) || x < 0.0 || y < 0.0 {
            return;
        }
        let (cx, cy) = (x as i64, y as i64);
        let (w, h) = (self.width as i64, self.height as i64);
        if cx >= w || cy >= h {
            return;
        }
        for py in (cy - MARKER_RADIUS).max(0)..=(cy + MARKER_RADIUS).min(h - 1) {
            for px in (cx - MARKER_RADIUS).max(0)..=(cx + MARKER_RADIUS).min(w - 1) {
                self.put_pixel(px as u32, py as u32, rgb);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        let offset = ((y as usize) * (self.width as usize) + x as usize) * 3;
        self.data
            .get(offset..offset + 3)
            .map(|px| [px[0], px[1], px[2]])
    }

    fn put_pixel(&mut self, x: u32, y: u32, rgb: [u8; 3]) {
        let offset = ((y as usize) * (self.width as usize) + x as usize) * 3;
        if let Some(px) = self.data.get_mut(offset..offset + 3) {
            px.copy_from_slice(&rgb);
        }
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}
