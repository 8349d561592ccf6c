// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use convnp_core::backend::ExecContext;
use convnp_core::error::{self, Result};
use convnp_core::{ops, Tensor};
use rand::Rng;

use crate::noise::expand_trailing;

/// Axis holding independent latent samples.
pub const SAMPLE_AXIS: usize = 3;

/// Diagonal Gaussian over the latent channels at every grid point, shaped
/// `(grid, latent_channels, batch)`.
#[derive(Clone, Debug)]
pub struct LatentDistribution {
    pub mean: Tensor,
    pub variance: Tensor,
}

impl LatentDistribution {
    /// Draws `num_samples` reparameterised samples laid out as
    /// `(grid, latent_channels, batch, num_samples)`.
    pub fn sample<R: Rng>(&self, ctx: &ExecContext, num_samples: usize, rng: &mut R) -> Result<Tensor> {
        if num_samples == 0 {
            return Err(error::invalid("latent.num_samples", "must be at least 1"));
        }
        let mut shape = self.mean.shape();
        if shape.len() != 3 {
            return Err(error::shape(format!(
                "latent distribution must be (grid, channels, batch), got {shape:?}"
            )));
        }
        shape.push(num_samples);
        let noise = ops::standard_normal(&shape, rng)?;
        let mean = expand_trailing(ctx, &self.mean, 4)?;
        let variance = expand_trailing(ctx, &self.variance, 4)?;
        ops::reparam_sample(ctx, &mean, &variance, &noise)
    }

    /// `KL(self ‖ other)` summed over grid points and channels, one value per
    /// batch element.
    pub fn kl(&self, ctx: &ExecContext, other: &LatentDistribution) -> Result<Tensor> {
        if self.mean.shape() != other.mean.shape() {
            return Err(error::shape(format!(
                "kl: distributions live on different grids: {:?} vs {:?}",
                self.mean.shape(),
                other.mean.shape()
            )));
        }
        let pointwise = ops::kl_divergence(ctx, &self.mean, &self.variance, &other.mean, &other.variance)?;
        ops::sum(ctx, &pointwise, &[0, 1], false)
    }
}
