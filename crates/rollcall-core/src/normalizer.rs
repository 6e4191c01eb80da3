//! Crop, orient and resize a located face into a canonical square patch.

use crate::types::{Frame, Patch, Region, View};
use thiserror::Error;

pub const CANONICAL_SIZE: u32 = 200;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("invalid region {region:?} for {width}x{height} frame")]
    InvalidRegion {
        region: Region,
        width: u32,
        height: u32,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct SampleNormalizer {
    size: u32,
}

impl Default for SampleNormalizer {
    fn default() -> Self {
        Self::new(CANONICAL_SIZE)
    }
}

impl SampleNormalizer {
    pub fn new(size: u32) -> Self {
        Self { size: size.max(1) }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Produce the canonical patch for `region`.
    ///
    /// `profile_left` crops are mirrored so every stored profile faces the
    /// same way; `profile_right` regions already come from a mirrored pass.
    pub fn normalize(&self, frame: &Frame, region: &Region) -> Result<Patch, NormalizeError> {
        let in_bounds = region.width > 0
            && region.height > 0
            && region.x.checked_add(region.width).is_some_and(|r| r <= frame.width)
            && region.y.checked_add(region.height).is_some_and(|b| b <= frame.height);
        if !in_bounds {
            return Err(NormalizeError::InvalidRegion {
                region: *region,
                width: frame.width,
                height: frame.height,
            });
        }

        let mut crop = crop(frame, region);
        if region.view == View::ProfileLeft {
            crop = crop.mirrored();
        }

        let data = resize_bilinear(&crop.data, crop.width as usize, crop.height as usize, self.size as usize);
        Ok(Patch {
            data,
            size: self.size,
        })
    }
}

fn crop(frame: &Frame, region: &Region) -> Frame {
    let w = frame.width as usize;
    let (x0, y0) = (region.x as usize, region.y as usize);
    let (cw, ch) = (region.width as usize, region.height as usize);

    let mut data = Vec::with_capacity(cw * ch);
    for y in y0..y0 + ch {
        data.extend_from_slice(&frame.data[y * w + x0..y * w + x0 + cw]);
    }
    Frame {
        data,
        width: region.width,
        height: region.height,
    }
}

/// Resize to `out × out` with half-pixel-centred bilinear sampling.
///
/// When no scaling is needed every sample lands on a source pixel, so the
/// output equals the input exactly.
fn resize_bilinear(src: &[u8], width: usize, height: usize, out: usize) -> Vec<u8> {
    let scale_x = width as f32 / out as f32;
    let scale_y = height as f32 / out as f32;
    let mut resized = vec![0u8; out * out];

    for y in 0..out {
        let src_y = (y as f32 + 0.5) * scale_y - 0.5;
        let y0 = (src_y.floor() as i32).clamp(0, height as i32 - 1) as usize;
        let y1 = (y0 + 1).min(height - 1);
        let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

        for x in 0..out {
            let src_x = (x as f32 + 0.5) * scale_x - 0.5;
            let x0 = (src_x.floor() as i32).clamp(0, width as i32 - 1) as usize;
            let x1 = (x0 + 1).min(width - 1);
            let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

            let tl = src[y0 * width + x0] as f32;
            let tr = src[y0 * width + x1] as f32;
            let bl = src[y1 * width + x0] as f32;
            let br = src[y1 * width + x1] as f32;

            let val = tl * (1.0 - fx) * (1.0 - fy)
                + tr * fx * (1.0 - fy)
                + bl * (1.0 - fx) * fy
                + br * fx * fy;

            resized[y * out + x] = val.round().clamp(0.0, 255.0) as u8;
        }
    }

    resized
}
