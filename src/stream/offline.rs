//! Offline placeholder frames
//!
//! When the source goes silent the coordinator keeps the stream alive with
//! a synthetic "no signal" JPEG. Rendering happens once per geometry and is
//! cached; at steady state going offline costs one map lookup per refresh.

use std::collections::HashMap;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

/// Renders and caches placeholder JPEGs per geometry
#[derive(Debug)]
pub struct OfflinePlaceholder {
    quality: u8,
    cache: HashMap<(u32, u32), Bytes>,
}

impl OfflinePlaceholder {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
            cache: HashMap::new(),
        }
    }

    /// Placeholder for the given geometry, rendered on first use
    pub fn get(&mut self, width: u32, height: u32) -> Bytes {
        let width = width.max(16);
        let height = height.max(16);
        if let Some(jpeg) = self.cache.get(&(width, height)) {
            return jpeg.clone();
        }
        let jpeg = render(width, height, self.quality);
        self.cache.insert((width, height), jpeg.clone());
        jpeg
    }

    pub fn cached_geometries(&self) -> usize {
        self.cache.len()
    }
}

/// Dark field with a lighter center band and a thin border, enough for a
/// viewer to tell "no signal" from a frozen picture
fn render(width: u32, height: u32, quality: u8) -> Bytes {
    let w = width as usize;
    let h = height as usize;
    let mut rgb = vec![0u8; w * h * 3];

    let band_top = h / 2 - h / 8;
    let band_bottom = h / 2 + h / 8;

    for y in 0..h {
        for x in 0..w {
            let i = (y * w + x) * 3;
            let border = x == 0 || y == 0 || x == w - 1 || y == h - 1;
            let (r, g, b) = if border {
                (0x60, 0x60, 0x60)
            } else if y >= band_top && y < band_bottom {
                (0x58, 0x20, 0x20)
            } else {
                (0x18, 0x18, 0x18)
            };
            rgb[i] = r;
            rgb[i + 1] = g;
            rgb[i + 2] = b;
        }
    }

    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality)
        .encode(&rgb, width, height, ExtendedColorType::Rgb8)
        .expect("placeholder geometry is always encodable");
    Bytes::from(out)
}
