//! Device Write Seam and Exclusive-Access Wrapper
//!
//! The concrete device (HID deck, virtual on-screen deck) lives outside this
//! crate. It reaches the scheduler through the [`KeySurface`] trait, wrapped
//! in a [`SharedSurface`] so that one tick's writes hold the device lock and
//! can never interleave with teardown by the owning application.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::frame::{ImageFormat, KeyFrame};
use crate::geometry::KeyLayout;

/// Errors surfaced by device writes
///
/// These are *transient* from the scheduler's point of view: a failed write is
/// logged and the tick continues with the next task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SurfaceError {
    /// The device is closed or momentarily disconnected
    #[error("surface is closed")]
    Closed,
    /// A single frame write failed
    #[error("write to physical key {physical} failed: {reason}")]
    WriteFailed {
        /// Physical slot the write targeted
        physical: usize,
        /// Device-reported reason
        reason: String,
    },
}

/// Static metadata for one attached control surface
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurfaceInfo {
    /// Key grid in physical orientation
    pub layout: KeyLayout,
    /// Per-key image format the device accepts
    pub format: ImageFormat,
}

/// The device write seam implemented by the owning application
///
/// Implementations take *physical* indices; the scheduler performs the
/// logical-to-physical transform before calling in. Writes for one tick are
/// serialized through the surrounding [`SharedSurface`] lock.
pub trait KeySurface: Send {
    /// Whether the device is currently open and accepting writes
    fn is_open(&self) -> bool;

    /// Push one pre-rendered frame to a physical key slot
    ///
    /// # Errors
    ///
    /// Returns a [`SurfaceError`] when the device rejects the write; the
    /// scheduler treats this as transient and moves on.
    fn write_key(&mut self, physical: usize, frame: &KeyFrame) -> Result<(), SurfaceError>;
}

/// Exclusive-access handle to a surface
///
/// The scheduler holds this lock for the duration of one tick's writes and
/// releases it before sleeping, so producers and teardown are never starved
/// across ticks.
pub type SharedSurface<S> = Arc<tokio::sync::Mutex<S>>;

/// Wrap a surface for shared exclusive access
pub fn shared<S: KeySurface>(surface: S) -> SharedSurface<S> {
    Arc::new(tokio::sync::Mutex::new(surface))
}
