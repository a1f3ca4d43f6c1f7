//! Thumbnail extraction: crop a detection's bounding box out of the frame,
//! pad it, clamp it and encode it as a base64 JPEG for storage and transport.
//!
//! This is a boundary that must never fail upwards: malformed boxes, boxes
//! clamped down to nothing and codec errors all degrade to `None`.

use base64::{engine::general_purpose, Engine as _};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use std::io::Cursor;

/// Padding added on each side of the box, as a fraction of its extent.
const PADDING_RATIO: f32 = 0.15;

/// Crops `bbox` (`[x1, y1, x2, y2]`) out of `frame` with 15% padding per
/// side, clamped to the frame bounds, and returns it as a base64-encoded
/// JPEG at the given quality. Returns `None` for malformed boxes, zero-area
/// crops and encoder failures.
pub fn extract(frame: &RgbImage, bbox: Option<&[f32]>, quality: u8) -> Option<String> {
    let bbox = match bbox {
        Some(b) if b.len() == 4 => b,
        _ => return None,
    };

    let (x1, y1, x2, y2) = (
        bbox[0] as i64,
        bbox[1] as i64,
        bbox[2] as i64,
        bbox[3] as i64,
    );

    let pad_w = ((x2 - x1) as f32 * PADDING_RATIO) as i64;
    let pad_h = ((y2 - y1) as f32 * PADDING_RATIO) as i64;

    let (width, height) = (frame.width() as i64, frame.height() as i64);
    let x1 = (x1 - pad_w).clamp(0, width);
    let y1 = (y1 - pad_h).clamp(0, height);
    let x2 = (x2 + pad_w).clamp(0, width);
    let y2 = (y2 + pad_h).clamp(0, height);

    if x2 <= x1 || y2 <= y1 {
        return None;
    }

    let crop = image::imageops::crop_imm(
        frame,
        x1 as u32,
        y1 as u32,
        (x2 - x1) as u32,
        (y2 - y1) as u32,
    )
    .to_image();

    encode_jpeg(&crop, quality).map(|bytes| general_purpose::STANDARD.encode(bytes))
}

fn encode_jpeg(crop: &RgbImage, quality: u8) -> Option<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut buffer, quality);
    match crop.write_with_encoder(encoder) {
        Ok(()) => Some(buffer.into_inner()),
        Err(e) => {
            log::error!("Failed to encode thumbnail crop: {}", e);
            None
        }
    }
}
