// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use convnp_core::backend::ExecContext;
use convnp_core::error::{self, Result};
use convnp_core::{ops, Tensor};
use serde::{Deserialize, Serialize};

/// How a set of values is reduced along one axis.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolingPolicy {
    #[default]
    Mean,
    Sum,
}

impl PoolingPolicy {
    /// Reduces `axis`, keeping it with size one.
    pub fn pool(&self, ctx: &ExecContext, x: &Tensor, axis: usize) -> Result<Tensor> {
        let shape = x.shape();
        let Some(&count) = shape.get(axis) else {
            return Err(error::shape(format!(
                "pooling: axis {axis} out of range for shape {shape:?}"
            )));
        };
        if count == 0 {
            return Err(error::shape("pooling: cannot pool an empty axis"));
        }
        let total = ops::sum(ctx, x, &[axis], true)?;
        match self {
            PoolingPolicy::Sum => Ok(total),
            PoolingPolicy::Mean => ops::scale(ctx, &total, 1.0 / count as f64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_and_sum_keep_the_axis() {
        let ctx = ExecContext::cpu();
        let x = Tensor::from_shape_vec(&[1, 1, 1, 4], vec![1.0, 2.0, 3.0, 6.0]).unwrap();
        let mean = PoolingPolicy::Mean.pool(&ctx, &x, 3).unwrap();
        let sum = PoolingPolicy::Sum.pool(&ctx, &x, 3).unwrap();
        assert_eq!(mean.shape(), vec![1, 1, 1, 1]);
        assert_eq!(mean.to_vec(), vec![3.0]);
        assert_eq!(sum.to_vec(), vec![12.0]);
        assert!(PoolingPolicy::Mean.pool(&ctx, &x, 4).is_err());
    }

    #[test]
    fn parses_from_config_strings() {
        let policy: PoolingPolicy = serde_json::from_str("\"sum\"").unwrap();
        assert_eq!(policy, PoolingPolicy::Sum);
    }
}
