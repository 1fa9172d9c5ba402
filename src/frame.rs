//! Camera frame isolation.
//!
//! `FaceFrame` is an opaque container for one captured camera frame. Pixel
//! bytes are private, zeroized on drop, and the type is neither `Clone` nor
//! serialisable: frames flow into a face detector and only descriptors and
//! landmarks flow out.

use anyhow::{anyhow, Result};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

pub struct FaceFrame {
    pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Capture time on the monitor clock.
    pub captured_at_ms: u64,
}

impl FaceFrame {
    pub fn new(pixels: Vec<u8>, width: u32, height: u32, captured_at_ms: u64) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(anyhow!("frame dimensions must be non-zero"));
        }
        if pixels.is_empty() {
            return Err(anyhow!("frame has no pixel data"));
        }
        Ok(Self {
            pixels,
            width,
            height,
            captured_at_ms,
        })
    }

    /// Read-only pixel access for detector backends. Backends must not retain
    /// the slice beyond the `detect` call.
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Non-invertible digest of the frame content.
    pub fn content_hash(&self) -> [u8; 32] {
        Sha256::digest(&self.pixels).into()
    }

    pub fn is_blank(&self) -> bool {
        self.pixels.iter().all(|b| *b == 0)
    }
}

impl Drop for FaceFrame {
    fn drop(&mut self) {
        self.pixels.zeroize();
    }
}

impl std::fmt::Debug for FaceFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaceFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("captured_at_ms", &self.captured_at_ms)
            .finish_non_exhaustive()
    }
}
