//! Mapping between raw coordinates and integer cell indices.

use pixelwar_types::{CellCoord, CoordinatePair};

use crate::config::GridConfig;

/// Deterministic raw-coordinate/cell-index mapping.
///
/// `quantize` computes `floor((raw + epsilon) / size)` per axis; the epsilon
/// pushes values sitting exactly on a boundary (or a hair below it after
/// floating-point error) into the upper cell. `dequantize` returns the cell's
/// canonical corner `cell * size`. Every component that snaps shares one
/// instance built from the single [`GridConfig`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridQuantizer {
    size: f64,
    epsilon: f64,
}

impl GridQuantizer {
    /// Build a quantizer from the grid configuration.
    pub const fn new(config: &GridConfig) -> Self {
        Self {
            size: config.size,
            epsilon: config.epsilon,
        }
    }

    /// Cell edge length.
    pub const fn size(&self) -> f64 {
        self.size
    }

    /// Cell containing the raw coordinate `(raw_x, raw_y)`.
    pub fn quantize(&self, raw_x: f64, raw_y: f64) -> CellCoord {
        CellCoord::new(self.axis(raw_x), self.axis(raw_y))
    }

    /// Cell containing `pair`.
    pub fn quantize_pair(&self, pair: CoordinatePair) -> CellCoord {
        self.quantize(pair.x(), pair.y())
    }

    /// Canonical corner coordinate of `cell`.
    #[allow(clippy::cast_precision_loss)]
    pub fn dequantize(&self, cell: CellCoord) -> CoordinatePair {
        CoordinatePair(cell.x as f64 * self.size, cell.y as f64 * self.size)
    }

    /// Snap a raw coordinate to its cell's canonical corner.
    pub fn snap(&self, pair: CoordinatePair) -> (CellCoord, CoordinatePair) {
        let cell = self.quantize_pair(pair);
        (cell, self.dequantize(cell))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn axis(&self, raw: f64) -> i64 {
        // `as` saturates on overflow and maps NaN to 0; callers validate
        // finiteness before snapping.
        ((raw + self.epsilon) / self.size).floor() as i64
    }
}
