//! Pre-Rendered Frame Value Types
//!
//! Frames arrive already decoded and rendered to the device pixel format;
//! this crate never touches image containers or compositing. A [`KeyFrame`]
//! is therefore just the opaque bytes the device accepts for one key, and a
//! [`BackgroundFrame`] is one such tile per key, in logical row-major order.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// On-wire encoding of a key image, as required by the device
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameEncoding {
    /// Uncompressed BMP (older deck generations)
    Bmp,
    /// JPEG (current deck generations)
    Jpeg,
}

/// Per-key image format metadata reported by the device surface
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageFormat {
    /// Key image width in pixels
    pub width: u16,
    /// Key image height in pixels
    pub height: u16,
    /// Encoding the device expects
    pub encoding: FrameEncoding,
}

/// One pre-rendered frame for a single key, in device format
///
/// Frames are shared between the task store, the scheduler, and UI mirrors
/// via `Arc<KeyFrame>`; dropping the last reference frees the decoded bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyFrame {
    bytes: Vec<u8>,
}

impl KeyFrame {
    /// Wrap device-format bytes as a frame
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// The raw device-format bytes
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Length of the encoded frame in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the frame is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Approximate heap footprint, used by memory diagnostics
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        std::mem::size_of::<Self>() + self.bytes.capacity()
    }
}

/// One full-grid frame of a background video: one tile per key
///
/// Tiles are in *logical* row-major order; the scheduler maps each tile to
/// its physical slot when pushing.
#[derive(Clone, Debug)]
pub struct BackgroundFrame {
    tiles: Vec<Arc<KeyFrame>>,
}

impl BackgroundFrame {
    /// Build a grid frame from per-key tiles in logical order
    #[must_use]
    pub fn new(tiles: Vec<Arc<KeyFrame>>) -> Self {
        Self { tiles }
    }

    /// The tile for a given logical key, if present
    #[must_use]
    pub fn tile(&self, key: usize) -> Option<&Arc<KeyFrame>> {
        self.tiles.get(key)
    }

    /// All tiles in logical order
    #[must_use]
    pub fn tiles(&self) -> &[Arc<KeyFrame>] {
        &self.tiles
    }

    /// Number of tiles in this frame
    #[must_use]
    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    /// Whether the frame holds no tiles
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// Approximate heap footprint across all tiles
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.tiles.iter().map(|t| t.size_bytes()).sum()
    }
}
