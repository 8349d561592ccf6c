// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use convnp_core::error::{self, Result};
use convnp_core::Tensor;

/// One training or evaluation task: a context set to condition on and a
/// target set to predict.
///
/// Locations are `(n, 1, batch)` and outputs `(n, y_channels, batch)`.
#[derive(Clone, Debug)]
pub struct Batch {
    pub x_context: Tensor,
    pub y_context: Tensor,
    pub x_target: Tensor,
    pub y_target: Tensor,
}

fn check_pair(label: &str, x: &Tensor, y: &Tensor) -> Result<(usize, usize, usize)> {
    let (xs, ys) = (x.shape(), y.shape());
    if xs.len() != 3 || xs[1] != 1 {
        return Err(error::shape(format!(
            "{label} inputs must be (n, 1, batch), got {xs:?}"
        )));
    }
    if ys.len() != 3 || ys[0] != xs[0] || ys[2] != xs[2] {
        return Err(error::shape(format!(
            "{label} outputs {ys:?} do not match inputs {xs:?}"
        )));
    }
    Ok((xs[0], ys[1], xs[2]))
}

impl Batch {
    pub fn new(x_context: Tensor, y_context: Tensor, x_target: Tensor, y_target: Tensor) -> Result<Self> {
        let (_, context_channels, context_batch) = check_pair("context", &x_context, &y_context)?;
        let (num_targets, target_channels, target_batch) = check_pair("target", &x_target, &y_target)?;
        if num_targets == 0 {
            return Err(error::invalid("batch.targets", "need at least one target point"));
        }
        if context_channels != target_channels || context_batch != target_batch {
            return Err(error::shape(format!(
                "context has {context_channels} channels x {context_batch} tasks, \
                 targets have {target_channels} x {target_batch}"
            )));
        }
        Ok(Self {
            x_context,
            y_context,
            x_target,
            y_target,
        })
    }

    pub fn num_context(&self) -> usize {
        self.x_context.shape()[0]
    }

    pub fn num_targets(&self) -> usize {
        self.x_target.shape()[0]
    }

    pub fn y_channels(&self) -> usize {
        self.y_target.shape()[1]
    }

    pub fn batch_size(&self) -> usize {
        self.x_target.shape()[2]
    }
}

/// Source of training batches, typically sampling functions from a
/// stochastic process.
pub trait DataGenerator {
    fn generate(&mut self) -> Result<Batch>;

    /// Draws `count` batches in sequence.
    fn epoch(&mut self, count: usize) -> Result<Vec<Batch>> {
        (0..count).map(|_| self.generate()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_shapes() {
        let ok = Batch::new(
            Tensor::zeros(&[3, 1, 2]),
            Tensor::zeros(&[3, 1, 2]),
            Tensor::zeros(&[5, 1, 2]),
            Tensor::zeros(&[5, 1, 2]),
        )
        .unwrap();
        assert_eq!((ok.num_context(), ok.num_targets(), ok.batch_size()), (3, 5, 2));

        assert!(Batch::new(
            Tensor::zeros(&[3, 1, 2]),
            Tensor::zeros(&[3, 1, 2]),
            Tensor::zeros(&[5, 1, 2]),
            Tensor::zeros(&[5, 1, 3]),
        )
        .is_err());
        assert!(Batch::new(
            Tensor::zeros(&[3, 2, 2]),
            Tensor::zeros(&[3, 1, 2]),
            Tensor::zeros(&[5, 1, 2]),
            Tensor::zeros(&[5, 1, 2]),
        )
        .is_err());
    }
}
