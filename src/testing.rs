//! Shared Test Surfaces
//!
//! Mock device implementations used by unit and integration tests. Shipped
//! as a normal module so downstream applications can drive their own logic
//! against a recording device without real hardware.

use std::collections::HashSet;
use std::sync::Arc;

use crate::frame::KeyFrame;
use crate::surface::{KeySurface, SurfaceError};

/// An in-memory surface that records every successful write
///
/// Supports closing (all writes rejected with [`SurfaceError::Closed`]) and
/// per-slot failure injection for exercising transient render errors.
#[derive(Debug, Default)]
pub struct RecordingSurface {
    key_count: usize,
    open: bool,
    failing: HashSet<usize>,
    writes: Vec<(usize, Arc<KeyFrame>)>,
}

impl RecordingSurface {
    /// Create an open surface with `key_count` physical slots
    #[must_use]
    pub fn new(key_count: usize) -> Self {
        Self {
            key_count,
            open: true,
            failing: HashSet::new(),
            writes: Vec::new(),
        }
    }

    /// Make writes to one physical slot fail
    #[must_use]
    pub fn failing_on(mut self, physical: usize) -> Self {
        self.failing.insert(physical);
        self
    }

    /// Simulate device disconnect
    pub fn close(&mut self) {
        self.open = false;
    }

    /// Every successful write so far, in order: (physical slot, frame)
    #[must_use]
    pub fn writes(&self) -> &[(usize, Arc<KeyFrame>)] {
        &self.writes
    }

    /// Successful writes targeting one physical slot, in order
    #[must_use]
    pub fn writes_to(&self, physical: usize) -> Vec<Arc<KeyFrame>> {
        self.writes
            .iter()
            .filter(|(slot, _)| *slot == physical)
            .map(|(_, frame)| Arc::clone(frame))
            .collect()
    }

    /// Forget recorded writes
    pub fn reset(&mut self) {
        self.writes.clear();
    }
}

impl KeySurface for RecordingSurface {
    fn is_open(&self) -> bool {
        self.open
    }

    fn write_key(&mut self, physical: usize, frame: &KeyFrame) -> Result<(), SurfaceError> {
        if !self.open {
            return Err(SurfaceError::Closed);
        }
        if physical >= self.key_count {
            return Err(SurfaceError::WriteFailed {
                physical,
                reason: "slot outside layout".to_string(),
            });
        }
        if self.failing.contains(&physical) {
            return Err(SurfaceError::WriteFailed {
                physical,
                reason: "injected failure".to_string(),
            });
        }
        self.writes.push((physical, Arc::new(frame.clone())));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_surface_records_and_rejects() {
        let mut surface = RecordingSurface::new(4).failing_on(2);
        let frame = KeyFrame::new(vec![1]);

        surface.write_key(0, &frame).unwrap();
        assert!(matches!(
            surface.write_key(2, &frame),
            Err(SurfaceError::WriteFailed { physical: 2, .. })
        ));
        assert!(matches!(
            surface.write_key(9, &frame),
            Err(SurfaceError::WriteFailed { physical: 9, .. })
        ));
        assert_eq!(surface.writes().len(), 1);
        assert_eq!(surface.writes_to(0).len(), 1);

        surface.close();
        assert!(!surface.is_open());
        assert_eq!(surface.write_key(0, &frame), Err(SurfaceError::Closed));
    }
}
