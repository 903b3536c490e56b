//! Physical Key Reports Translated to Logical Events
//!
//! Devices report key-press state as an array in *physical* order. Action
//! dispatch works on *logical* keys, so reports pass through the rotation
//! transform first, then get diffed against the previous report to produce
//! edge events.

use crate::geometry::{GeometryError, KeyMapper};

/// An edge-triggered key event in logical coordinates
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyEvent {
    /// Key transitioned from released to pressed
    Pressed {
        /// Logical key index
        key: usize,
    },
    /// Key transitioned from pressed to released
    Released {
        /// Logical key index
        key: usize,
    },
}

/// Re-express a physical-order key-state report in logical order
///
/// # Errors
///
/// Returns [`GeometryError::LengthMismatch`] when the report length does not
/// match the surface's key count.
pub fn logical_key_states(
    mapper: KeyMapper,
    physical_states: &[bool],
) -> Result<Vec<bool>, GeometryError> {
    mapper.reorder_by_rotation(physical_states)
}

/// Diff two logical-order reports into edge events, ascending by key
#[must_use]
pub fn diff_key_states(previous: &[bool], current: &[bool]) -> Vec<KeyEvent> {
    previous
        .iter()
        .zip(current)
        .enumerate()
        .filter_map(|(key, (&was, &is))| match (was, is) {
            (false, true) => Some(KeyEvent::Pressed { key }),
            (true, false) => Some(KeyEvent::Released { key }),
            _ => None,
        })
        .collect()
}
