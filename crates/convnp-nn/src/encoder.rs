// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Functional encoders: context sets to grid representations.

use convnp_core::backend::ExecContext;
use convnp_core::error::{self, Result};
use convnp_core::{ops, Tensor};
use rand::Rng;
use tracing::trace;

use crate::discretisation::{Grid, UniformDiscretisation1d};
use crate::latent::LatentDistribution;
use crate::layers::{ConvStack, StackGeometry};
use crate::module::{Module, Parameter};
use crate::noise::split_mean_variance;
use crate::setconv::SetConv;

/// Encoding of a context set on the grid. The density channel is kept apart
/// from the signal so consumers have to place it explicitly.
#[derive(Clone, Debug)]
pub struct FunctionalRepresentation {
    /// Kernel mass `(grid, 1, batch)`; never negative.
    pub density: Tensor,
    /// Density-normalised values `(grid, y_channels, batch)`.
    pub signal: Tensor,
}

impl FunctionalRepresentation {
    pub fn grid_len(&self) -> usize {
        self.density.shape()[0]
    }

    pub fn signal_channels(&self) -> usize {
        self.signal.shape()[1]
    }

    /// `(grid, 1 + y_channels, batch)` with the density in channel 0.
    pub fn stacked(&self, ctx: &ExecContext) -> Result<Tensor> {
        ops::repeat_cat(ctx, &[&self.density, &self.signal], 1)
    }
}

/// Discretises the union of context and target locations and set-convolves
/// the context onto the resulting grid.
#[derive(Debug)]
pub struct SetConvEncoder {
    discretisation: UniformDiscretisation1d,
    set_conv: SetConv,
}

impl SetConvEncoder {
    pub fn new(name: &str, discretisation: UniformDiscretisation1d, y_channels: usize) -> Result<Self> {
        discretisation.validate()?;
        let initial_scale = 2.0 / discretisation.points_per_unit;
        Ok(Self {
            discretisation,
            set_conv: SetConv::new(&format!("{name}::set_conv"), y_channels, initial_scale, true)?,
        })
    }

    pub fn discretisation(&self) -> &UniformDiscretisation1d {
        &self.discretisation
    }

    pub fn y_channels(&self) -> usize {
        self.set_conv.channels()
    }

    pub fn grid(&self, x_context: &Tensor, x_target: &Tensor) -> Result<Grid> {
        self.discretisation.grid(&[x_context, x_target])
    }

    /// Encodes `(x_context, y_context)` on an already computed grid.
    pub fn encode_on(
        &self,
        ctx: &ExecContext,
        grid: &Grid,
        x_context: &Tensor,
        y_context: &Tensor,
    ) -> Result<FunctionalRepresentation> {
        let encoded = self.set_conv.forward(ctx, x_context, y_context, grid.points())?;
        let density = ops::narrow(ctx, &encoded, 1, 0, 1)?;
        let signal = ops::narrow(ctx, &encoded, 1, 1, self.set_conv.channels())?;
        trace!(grid = grid.len(), shape = ?encoded.shape(), "encoded context set");
        Ok(FunctionalRepresentation { density, signal })
    }

    /// Builds the grid for this call and encodes the context onto it.
    pub fn encode(
        &self,
        ctx: &ExecContext,
        x_context: &Tensor,
        y_context: &Tensor,
        x_target: &Tensor,
    ) -> Result<(Grid, FunctionalRepresentation)> {
        let grid = self.grid(x_context, x_target)?;
        let representation = self.encode_on(ctx, &grid, x_context, y_context)?;
        Ok((grid, representation))
    }
}

impl Module for SetConvEncoder {
    fn visit_parameters(&self, visitor: &mut dyn FnMut(&Parameter) -> Result<()>) -> Result<()> {
        self.set_conv.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> Result<()>,
    ) -> Result<()> {
        self.set_conv.visit_parameters_mut(visitor)
    }
}

/// Distributional head turning a representation into a diagonal Gaussian
/// over latent channels on the grid.
#[derive(Debug)]
pub struct LatentAggregator {
    convs: ConvStack,
    latent_channels: usize,
}

impl LatentAggregator {
    pub fn new<R: Rng>(
        name: &str,
        y_channels: usize,
        latent_channels: usize,
        geometry: StackGeometry,
        rng: &mut R,
    ) -> Result<Self> {
        if latent_channels == 0 {
            return Err(error::invalid("latent.channels", "must be positive"));
        }
        Ok(Self {
            convs: ConvStack::new(
                &format!("{name}::convs"),
                1 + y_channels,
                2 * latent_channels,
                geometry,
                rng,
            )?,
            latent_channels,
        })
    }

    pub fn latent_channels(&self) -> usize {
        self.latent_channels
    }

    pub fn forward(
        &self,
        ctx: &ExecContext,
        representation: &FunctionalRepresentation,
    ) -> Result<LatentDistribution> {
        let hidden = self.convs.forward(ctx, &representation.stacked(ctx)?)?;
        let (mean, variance) = split_mean_variance(ctx, &hidden)?;
        Ok(LatentDistribution { mean, variance })
    }
}

impl Module for LatentAggregator {
    fn visit_parameters(&self, visitor: &mut dyn FnMut(&Parameter) -> Result<()>) -> Result<()> {
        self.convs.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> Result<()>,
    ) -> Result<()> {
        self.convs.visit_parameters_mut(visitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn sample_context() -> (Tensor, Tensor, Tensor) {
        let x_context = Tensor::from_shape_vec(&[3, 1, 2], vec![-1.0, 0.0, 0.0, 0.5, 1.0, 1.5]).unwrap();
        let y_context = Tensor::from_shape_vec(&[3, 1, 2], vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6]).unwrap();
        let x_target = Tensor::from_shape_vec(&[2, 1, 2], vec![-2.0, 0.0, 2.0, 1.0]).unwrap();
        (x_context, y_context, x_target)
    }

    #[test]
    fn representation_keeps_density_separate() {
        let ctx = ExecContext::cpu();
        let discretisation = UniformDiscretisation1d::new(4.0, 0.5, 2).unwrap();
        let encoder = SetConvEncoder::new("encoder", discretisation, 1).unwrap();
        let (xc, yc, xt) = sample_context();
        let (grid, rep) = encoder.encode(&ctx, &xc, &yc, &xt).unwrap();
        assert_eq!(rep.density.shape(), vec![grid.len(), 1, 2]);
        assert_eq!(rep.signal.shape(), vec![grid.len(), 1, 2]);
        assert!(rep.density.to_vec().iter().all(|d| *d >= 0.0));
        let stacked = rep.stacked(&ctx).unwrap();
        assert_eq!(stacked.shape(), vec![grid.len(), 2, 2]);
        assert_eq!(grid.lower(), -2.5);
    }

    #[test]
    fn latent_head_produces_positive_variances() {
        let ctx = ExecContext::cpu();
        let mut rng = StdRng::seed_from_u64(11);
        let discretisation = UniformDiscretisation1d::new(4.0, 0.5, 1).unwrap();
        let encoder = SetConvEncoder::new("encoder", discretisation, 1).unwrap();
        let geometry = StackGeometry {
            receptive_field: 1.0,
            points_per_unit: 4.0,
            num_layers: 2,
            num_channels: 4,
        };
        let head = LatentAggregator::new("latent", 1, 3, geometry, &mut rng).unwrap();
        let (xc, yc, xt) = sample_context();
        let (grid, rep) = encoder.encode(&ctx, &xc, &yc, &xt).unwrap();
        let dist = head.forward(&ctx, &rep).unwrap();
        assert_eq!(dist.mean.shape(), vec![grid.len(), 3, 2]);
        assert!(dist.variance.to_vec().iter().all(|v| *v > 0.0));
    }
}
