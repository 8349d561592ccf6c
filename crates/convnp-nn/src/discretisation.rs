// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Uniform one-dimensional grids for the functional representation.
//!
//! The grid is derived from the inputs of the whole batch at once so that
//! every batch element shares the same grid, and it is rebuilt on every call.

use convnp_core::error::{self, Result};
use convnp_core::Tensor;
use ndarray::{Array1, IxDyn};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Equally spaced grid laid out as `(len, 1, 1)` so it broadcasts against
/// any batch.
#[derive(Clone, Debug)]
pub struct Grid {
    lower: f64,
    spacing: f64,
    points: Tensor,
}

impl Grid {
    pub fn lower(&self) -> f64 {
        self.lower
    }

    pub fn upper(&self) -> f64 {
        self.lower + self.spacing * (self.len().saturating_sub(1)) as f64
    }

    pub fn spacing(&self) -> f64 {
        self.spacing
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Grid locations as an untracked `(len, 1, 1)` tensor.
    pub fn points(&self) -> &Tensor {
        &self.points
    }
}

/// Discretisation at a fixed density with a margin around the data and a
/// point count aligned to a multiple.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct UniformDiscretisation1d {
    pub points_per_unit: f64,
    pub margin: f64,
    pub multiple: usize,
}

impl UniformDiscretisation1d {
    pub fn new(points_per_unit: f64, margin: f64, multiple: usize) -> Result<Self> {
        let discretisation = Self {
            points_per_unit,
            margin,
            multiple,
        };
        discretisation.validate()?;
        Ok(discretisation)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.points_per_unit > 0.0) || !self.points_per_unit.is_finite() {
            return Err(error::invalid(
                "discretisation.points_per_unit",
                format!("must be positive and finite, got {}", self.points_per_unit),
            ));
        }
        if !(self.margin >= 0.0) || !self.margin.is_finite() {
            return Err(error::invalid(
                "discretisation.margin",
                format!("must be non-negative and finite, got {}", self.margin),
            ));
        }
        if self.multiple == 0 {
            return Err(error::invalid("discretisation.multiple", "must be at least 1"));
        }
        Ok(())
    }

    /// Number of points covering `span` at the configured density, rounded
    /// up to the alignment multiple.
    pub fn num_points(&self, span: f64) -> usize {
        // Absorb rounding noise such as 6.0 * 5.0 = 30.000000000000004.
        let intervals = (span * self.points_per_unit - 1e-9).ceil().max(0.0) as usize;
        let count = intervals + 1;
        count.div_ceil(self.multiple) * self.multiple
    }

    /// Builds the grid covering `[min - margin, max + margin]` over every
    /// value of every input tensor.
    pub fn grid(&self, inputs: &[&Tensor]) -> Result<Grid> {
        self.validate()?;
        let mut lower = f64::INFINITY;
        let mut upper = f64::NEG_INFINITY;
        for input in inputs {
            let data = input.borrow_data();
            if data.iter().any(|value| !value.is_finite()) {
                return Err(error::invalid(
                    "discretisation.inputs",
                    "input locations must be finite",
                ));
            }
            lower = data.iter().copied().fold(lower, f64::min);
            upper = data.iter().copied().fold(upper, f64::max);
        }
        if lower > upper {
            return Err(error::invalid(
                "discretisation.inputs",
                "cannot discretise an empty set of locations",
            ));
        }
        let lower = lower - self.margin;
        let upper = upper + self.margin;
        let spacing = 1.0 / self.points_per_unit;
        let len = self.num_points(upper - lower);
        let values = Array1::from_shape_fn(len, |i| lower + spacing * i as f64);
        let points = values
            .into_shape(IxDyn(&[len, 1, 1]))
            .map_err(|err| error::shape(format!("discretisation: {err}")))?;
        debug!(lower, upper, len, spacing, "built discretisation grid");
        Ok(Grid {
            lower,
            spacing,
            points: Tensor::from_array(points),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn locations(values: &[f64]) -> Tensor {
        Tensor::from_shape_vec(&[values.len(), 1, 1], values.to_vec()).unwrap()
    }

    #[test]
    fn grid_covers_margin_at_exact_spacing() {
        let discretisation = UniformDiscretisation1d::new(5.0, 1.0, 4).unwrap();
        let grid = discretisation.grid(&[&locations(&[-2.0, 0.5, 2.0])]).unwrap();
        assert_abs_diff_eq!(grid.lower(), -3.0);
        assert!(grid.upper() >= 3.0 - 1e-9);
        assert_eq!(grid.len() % 4, 0);
        assert_eq!(grid.len(), 32);
        let points = grid.points().to_vec();
        for pair in points.windows(2) {
            assert_abs_diff_eq!(pair[1] - pair[0], 0.2, epsilon = 1e-12);
        }
    }

    #[test]
    fn grid_spans_all_inputs_of_the_batch() {
        let discretisation = UniformDiscretisation1d::new(4.0, 0.0, 1).unwrap();
        let context = Tensor::from_shape_vec(&[2, 1, 2], vec![0.0, 1.0, 0.5, -1.0]).unwrap();
        let target = locations(&[2.0]);
        let grid = discretisation.grid(&[&context, &target]).unwrap();
        assert_abs_diff_eq!(grid.lower(), -1.0);
        assert_eq!(grid.len(), 13);
        assert_abs_diff_eq!(grid.upper(), 2.0, epsilon = 1e-12);
        assert_eq!(grid.points().shape(), vec![13, 1, 1]);
    }

    #[test]
    fn count_is_deterministic_and_aligned() {
        let discretisation = UniformDiscretisation1d::new(5.0, 1.0, 8).unwrap();
        assert_eq!(discretisation.num_points(6.0), 32);
        let unaligned = UniformDiscretisation1d::new(5.0, 1.0, 1).unwrap();
        assert_eq!(unaligned.num_points(6.0), 31);
        assert_eq!(unaligned.num_points(0.0), 1);
    }

    #[test]
    fn rejects_invalid_settings_and_inputs() {
        assert!(UniformDiscretisation1d::new(0.0, 1.0, 1).is_err());
        assert!(UniformDiscretisation1d::new(1.0, -1.0, 1).is_err());
        assert!(UniformDiscretisation1d::new(1.0, 1.0, 0).is_err());
        let discretisation = UniformDiscretisation1d::new(1.0, 0.0, 1).unwrap();
        assert!(discretisation.grid(&[]).is_err());
        assert!(discretisation.grid(&[&locations(&[f64::NAN])]).is_err());
    }
}
