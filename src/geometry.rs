//! Key Layout, Rotation, and Coordinate Transforms
//!
//! The application addresses keys in *logical* row-major order, independent of
//! how the device sits on the desk. The device itself reports and accepts
//! *physical* indices. This module provides the total, mutually inverse
//! transforms between the two for every supported quarter-turn rotation.
//!
//! # Design
//!
//! `physical_to_logical` is not a second hand-written formula family: it is
//! derived from `logical_to_physical` by applying the *inverse* rotation over
//! the *transposed* layout. Both directions therefore flow from a single
//! rotation parameter and cannot drift apart.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from layout construction and coordinate transforms
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GeometryError {
    /// A rotation value outside {0, 90, 180, 270} was supplied
    #[error("invalid rotation {degrees}° (supported: 0, 90, 180, 270)")]
    InvalidRotation {
        /// The rejected rotation in degrees
        degrees: u16,
    },
    /// A key index outside the layout was supplied
    #[error("key index {index} out of range for {count}-key layout")]
    KeyOutOfRange {
        /// The rejected index
        index: usize,
        /// Number of keys in the layout
        count: usize,
    },
    /// A layout with zero rows or columns was supplied
    #[error("layout must have at least one row and one column (got {rows}x{cols})")]
    EmptyLayout {
        /// Requested rows
        rows: u8,
        /// Requested columns
        cols: u8,
    },
    /// A list did not match the layout's key count
    #[error("expected {expected} entries for this layout, got {actual}")]
    LengthMismatch {
        /// The layout's key count
        expected: usize,
        /// The supplied length
        actual: usize,
    },
}

/// Quarter-turn rotation of the physical device relative to logical addressing
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Rotation {
    /// No rotation; logical and physical indices coincide
    #[default]
    Deg0,
    /// Rotated 90° clockwise
    Deg90,
    /// Rotated 180°
    Deg180,
    /// Rotated 270° clockwise
    Deg270,
}

impl Rotation {
    /// The rotation value in degrees
    #[must_use]
    pub fn degrees(self) -> u16 {
        match self {
            Self::Deg0 => 0,
            Self::Deg90 => 90,
            Self::Deg180 => 180,
            Self::Deg270 => 270,
        }
    }

    /// The rotation that undoes this one
    #[must_use]
    pub fn inverse(self) -> Self {
        match self {
            Self::Deg0 => Self::Deg0,
            Self::Deg90 => Self::Deg270,
            Self::Deg180 => Self::Deg180,
            Self::Deg270 => Self::Deg90,
        }
    }

    /// Whether this rotation swaps the grid's rows and columns
    #[must_use]
    pub fn is_quarter_turn(self) -> bool {
        matches!(self, Self::Deg90 | Self::Deg270)
    }
}

impl TryFrom<u16> for Rotation {
    type Error = GeometryError;

    /// Parse a rotation from degrees, rejecting anything but the four
    /// supported values. Persisted settings may carry arbitrary integers;
    /// an unsupported value is a configuration error, never a silent default.
    fn try_from(degrees: u16) -> Result<Self, Self::Error> {
        match degrees {
            0 => Ok(Self::Deg0),
            90 => Ok(Self::Deg90),
            180 => Ok(Self::Deg180),
            270 => Ok(Self::Deg270),
            other => Err(GeometryError::InvalidRotation { degrees: other }),
        }
    }
}

impl std::fmt::Display for Rotation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}°", self.degrees())
    }
}

/// Key grid dimensions in *physical* orientation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyLayout {
    rows: u8,
    cols: u8,
}

impl KeyLayout {
    /// Create a layout, rejecting degenerate grids
    ///
    /// # Errors
    ///
    /// Returns [`GeometryError::EmptyLayout`] if either dimension is zero.
    pub fn new(rows: u8, cols: u8) -> Result<Self, GeometryError> {
        if rows == 0 || cols == 0 {
            return Err(GeometryError::EmptyLayout { rows, cols });
        }
        Ok(Self { rows, cols })
    }

    /// Number of rows (physical orientation)
    #[must_use]
    pub fn rows(&self) -> u8 {
        self.rows
    }

    /// Number of columns (physical orientation)
    #[must_use]
    pub fn cols(&self) -> u8 {
        self.cols
    }

    /// Total number of keys
    #[must_use]
    pub fn key_count(&self) -> usize {
        usize::from(self.rows) * usize::from(self.cols)
    }

    /// The layout with rows and columns swapped
    #[must_use]
    pub fn transposed(&self) -> Self {
        Self {
            rows: self.cols,
            cols: self.rows,
        }
    }
}

impl std::fmt::Display for KeyLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.rows, self.cols)
    }
}

/// Rotation-aware transform between logical and physical key indices
///
/// Both directions are total over `[0, rows·cols)` and are exact inverses of
/// each other for every rotation:
///
/// ```
/// use deckgrid::geometry::{KeyLayout, KeyMapper, Rotation};
///
/// let mapper = KeyMapper::new(KeyLayout::new(3, 5).unwrap(), Rotation::Deg90);
/// assert_eq!(mapper.logical_to_physical(0).unwrap(), 10);
/// assert_eq!(mapper.physical_to_logical(10).unwrap(), 0);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyMapper {
    layout: KeyLayout,
    rotation: Rotation,
}

impl KeyMapper {
    /// Create a mapper for the given physical layout and rotation
    #[must_use]
    pub fn new(layout: KeyLayout, rotation: Rotation) -> Self {
        Self { layout, rotation }
    }

    /// The physical layout this mapper transforms over
    #[must_use]
    pub fn layout(&self) -> KeyLayout {
        self.layout
    }

    /// The active rotation
    #[must_use]
    pub fn rotation(&self) -> Rotation {
        self.rotation
    }

    /// Map a logical key index to the device's physical index
    ///
    /// # Errors
    ///
    /// Returns [`GeometryError::KeyOutOfRange`] for indices outside the layout.
    pub fn logical_to_physical(&self, index: usize) -> Result<usize, GeometryError> {
        let count = self.layout.key_count();
        if index >= count {
            return Err(GeometryError::KeyOutOfRange { index, count });
        }
        let rows = usize::from(self.layout.rows);
        let cols = usize::from(self.layout.cols);
        Ok(match self.rotation {
            Rotation::Deg0 => index,
            Rotation::Deg90 => (rows - 1 - (index % rows)) * cols + index / rows,
            Rotation::Deg180 => count - 1 - index,
            Rotation::Deg270 => (index % rows) * cols + (cols - 1 - index / rows),
        })
    }

    /// Map a device-reported physical index back to the logical index
    ///
    /// Derived from [`Self::logical_to_physical`]: the inverse rotation
    /// applied over the transposed layout. Quarter turns swap the grid's
    /// effective dimensions; 0° and 180° are dimension-agnostic.
    ///
    /// # Errors
    ///
    /// Returns [`GeometryError::KeyOutOfRange`] for indices outside the layout.
    pub fn physical_to_logical(&self, index: usize) -> Result<usize, GeometryError> {
        self.inverse().logical_to_physical(index)
    }

    /// The mapper performing the exact inverse transform
    #[must_use]
    fn inverse(&self) -> Self {
        let layout = if self.rotation.is_quarter_turn() {
            self.layout.transposed()
        } else {
            self.layout
        };
        Self {
            layout,
            rotation: self.rotation.inverse(),
        }
    }

    /// Re-express a physical-order list in logical order
    ///
    /// Device-reported key-press-state arrays arrive in physical order; the
    /// result places `physical[logical_to_physical(j)]` at logical position
    /// `j`, so it can be dispatched against logical key bindings.
    ///
    /// # Errors
    ///
    /// Returns [`GeometryError::LengthMismatch`] if the list's length differs
    /// from the layout's key count.
    pub fn reorder_by_rotation<T: Clone>(&self, physical: &[T]) -> Result<Vec<T>, GeometryError> {
        let count = self.layout.key_count();
        if physical.len() != count {
            return Err(GeometryError::LengthMismatch {
                expected: count,
                actual: physical.len(),
            });
        }
        let mut logical = Vec::with_capacity(count);
        for j in 0..count {
            // logical_to_physical cannot fail here: j < count by construction
            let p = self.logical_to_physical(j)?;
            logical.push(physical[p].clone());
        }
        Ok(logical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const ALL_ROTATIONS: [Rotation; 4] = [
        Rotation::Deg0,
        Rotation::Deg90,
        Rotation::Deg180,
        Rotation::Deg270,
    ];

    fn layout(rows: u8, cols: u8) -> KeyLayout {
        KeyLayout::new(rows, cols).unwrap()
    }

    #[test]
    fn test_rotation_try_from() {
        assert_eq!(Rotation::try_from(0).unwrap(), Rotation::Deg0);
        assert_eq!(Rotation::try_from(90).unwrap(), Rotation::Deg90);
        assert_eq!(Rotation::try_from(180).unwrap(), Rotation::Deg180);
        assert_eq!(Rotation::try_from(270).unwrap(), Rotation::Deg270);
        assert!(matches!(
            Rotation::try_from(45),
            Err(GeometryError::InvalidRotation { degrees: 45 })
        ));
        assert!(Rotation::try_from(360).is_err());
    }

    #[test]
    fn test_rotation_inverse_pairs() {
        for rotation in ALL_ROTATIONS {
            assert_eq!(rotation.inverse().inverse(), rotation);
        }
        assert_eq!(Rotation::Deg90.inverse(), Rotation::Deg270);
        assert_eq!(Rotation::Deg180.inverse(), Rotation::Deg180);
    }

    #[test]
    fn test_empty_layout_rejected() {
        assert!(matches!(
            KeyLayout::new(0, 5),
            Err(GeometryError::EmptyLayout { .. })
        ));
        assert!(KeyLayout::new(3, 0).is_err());
    }

    #[test]
    fn test_identity_at_zero_degrees() {
        let mapper = KeyMapper::new(layout(4, 8), Rotation::Deg0);
        for i in 0..32 {
            assert_eq!(mapper.logical_to_physical(i).unwrap(), i);
            assert_eq!(mapper.physical_to_logical(i).unwrap(), i);
        }
    }

    #[test]
    fn test_round_trip_all_rotations() {
        for (rows, cols) in [(3, 5), (2, 4), (4, 8), (1, 6), (5, 1)] {
            for rotation in ALL_ROTATIONS {
                let mapper = KeyMapper::new(layout(rows, cols), rotation);
                for i in 0..mapper.layout().key_count() {
                    let p = mapper.logical_to_physical(i).unwrap();
                    assert_eq!(
                        mapper.physical_to_logical(p).unwrap(),
                        i,
                        "round trip failed for {rows}x{cols} at {rotation}, index {i}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_mapping_is_bijective() {
        for rotation in ALL_ROTATIONS {
            let mapper = KeyMapper::new(layout(3, 5), rotation);
            let mut seen = vec![false; 15];
            for i in 0..15 {
                let p = mapper.logical_to_physical(i).unwrap();
                assert!(!seen[p], "duplicate physical index {p} at {rotation}");
                seen[p] = true;
            }
            assert!(seen.iter().all(|&s| s));
        }
    }

    #[test]
    fn test_concrete_scenario_3x5_at_90() {
        // R=3, C=5, rotation 90°: l2p(0) = (3-1-0)*5 + 0 = 10
        let mapper = KeyMapper::new(layout(3, 5), Rotation::Deg90);
        assert_eq!(mapper.logical_to_physical(0).unwrap(), 10);
        assert_eq!(mapper.physical_to_logical(10).unwrap(), 0);
    }

    #[test]
    fn test_180_reverses() {
        let mapper = KeyMapper::new(layout(2, 3), Rotation::Deg180);
        assert_eq!(mapper.logical_to_physical(0).unwrap(), 5);
        assert_eq!(mapper.logical_to_physical(5).unwrap(), 0);
        assert_eq!(mapper.logical_to_physical(2).unwrap(), 3);
    }

    #[test]
    fn test_out_of_range_rejected() {
        let mapper = KeyMapper::new(layout(3, 5), Rotation::Deg90);
        assert!(matches!(
            mapper.logical_to_physical(15),
            Err(GeometryError::KeyOutOfRange {
                index: 15,
                count: 15
            })
        ));
        assert!(mapper.physical_to_logical(15).is_err());
    }

    #[test]
    fn test_reorder_matches_indexing() {
        for rotation in ALL_ROTATIONS {
            let mapper = KeyMapper::new(layout(3, 5), rotation);
            let physical: Vec<usize> = (0..15).collect();
            let logical = mapper.reorder_by_rotation(&physical).unwrap();
            for (j, value) in logical.iter().enumerate() {
                assert_eq!(*value, mapper.logical_to_physical(j).unwrap());
            }
            // Bijective: every physical value appears exactly once
            let mut sorted = logical.clone();
            sorted.sort_unstable();
            assert_eq!(sorted, physical);
        }
    }

    #[test]
    fn test_reorder_length_mismatch() {
        let mapper = KeyMapper::new(layout(3, 5), Rotation::Deg90);
        let short = vec![false; 10];
        assert!(matches!(
            mapper.reorder_by_rotation(&short),
            Err(GeometryError::LengthMismatch {
                expected: 15,
                actual: 10
            })
        ));
    }
}
