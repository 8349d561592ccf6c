// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! RBF set convolution between two one-dimensional point sets.

use convnp_core::backend::ExecContext;
use convnp_core::error::{self, Result};
use convnp_core::{ops, Tensor};
use ndarray::{ArrayD, IxDyn};

use crate::module::{Module, Parameter};

/// Keeps the normalisation finite where no source point carries mass.
pub const DENSITY_EPSILON: f64 = 1e-8;

/// Kernel-weighted aggregation from source points onto target points.
///
/// Locations are `(n, 1, batch)`; values are `(n, channels, batch...)` and
/// may carry extra trailing axes (e.g. latent samples), which pass through.
/// Every channel has its own learnable length scale stored in log space.
///
/// With `density` set a constant channel is prepended to the values before
/// aggregation. The result then holds the kernel mass in channel 0 and the
/// signal channels divided by that mass.
#[derive(Debug)]
pub struct SetConv {
    log_scales: Parameter,
    channels: usize,
    density: bool,
}

impl SetConv {
    /// `channels` counts the value channels; the density channel is extra.
    pub fn new(name: &str, channels: usize, initial_scale: f64, density: bool) -> Result<Self> {
        if channels == 0 {
            return Err(error::invalid("set_conv.channels", "must be positive"));
        }
        if !(initial_scale > 0.0) || !initial_scale.is_finite() {
            return Err(error::invalid(
                "set_conv.initial_scale",
                format!("must be positive, got {initial_scale}"),
            ));
        }
        let kernel_channels = channels + usize::from(density);
        let log_scales = ArrayD::from_elem(IxDyn(&[kernel_channels]), initial_scale.ln());
        Ok(Self {
            log_scales: Parameter::new(format!("{name}::log_scales"), log_scales),
            channels,
            density,
        })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Channels produced by [`SetConv::forward`].
    pub fn out_channels(&self) -> usize {
        self.channels + usize::from(self.density)
    }

    pub fn has_density(&self) -> bool {
        self.density
    }

    /// Current length scales (one per output channel).
    pub fn scales(&self) -> Vec<f64> {
        self.log_scales.value().to_vec().into_iter().map(f64::exp).collect()
    }

    /// Squared distances `(targets, sources, batch)` between two location sets.
    pub fn squared_distances(ctx: &ExecContext, sources: &Tensor, targets: &Tensor) -> Result<Tensor> {
        let diff = ops::sub(ctx, targets, &ops::batched_transpose(ctx, sources)?)?;
        ops::square(ctx, &diff)
    }

    pub fn forward(
        &self,
        ctx: &ExecContext,
        x_source: &Tensor,
        y_source: &Tensor,
        x_target: &Tensor,
    ) -> Result<Tensor> {
        for (label, x) in [("source", x_source), ("target", x_target)] {
            let shape = x.shape();
            if shape.len() != 3 || shape[1] != 1 {
                return Err(error::shape(format!(
                    "set_conv: {label} locations must be (n, 1, batch), got {shape:?}"
                )));
            }
        }
        let y_shape = y_source.shape();
        if y_shape.len() < 3 || y_shape[0] != x_source.shape()[0] || y_shape[1] != self.channels {
            return Err(error::shape(format!(
                "set_conv: values {y_shape:?} do not match {} source points with {} channels",
                x_source.shape()[0],
                self.channels
            )));
        }
        let extra = y_shape.len() - 3;

        let values = if self.density {
            let mut ones_shape = vec![1usize; y_shape.len()];
            ones_shape[0] = y_shape[0];
            let ones = Tensor::ones(&ones_shape);
            ops::repeat_cat(ctx, &[&ones, y_source], 1)?
        } else {
            y_source.clone()
        };
        let channels = self.out_channels();

        // (targets, sources, 1, batch, 1...)
        let dists = Self::squared_distances(ctx, x_source, x_target)?;
        let d_shape = dists.shape();
        let mut kernel_shape = vec![d_shape[0], d_shape[1], 1, d_shape[2]];
        kernel_shape.resize(4 + extra, 1);
        let dists = ops::reshape(ctx, &dists, &kernel_shape)?;

        // (1, 1, channels, 1, 1...)
        let mut scale_shape = vec![1, 1, channels, 1];
        scale_shape.resize(4 + extra, 1);
        let scales = ops::reshape(ctx, &ops::exp(ctx, self.log_scales.value())?, &scale_shape)?;
        let scaled = ops::div(ctx, &dists, &ops::square(ctx, &scales)?)?;
        let weights = ops::exp(ctx, &ops::scale(ctx, &scaled, -0.5)?)?;

        // (1, sources, channels, batch...)
        let mut value_shape = vec![1];
        value_shape.extend(values.shape());
        let values = ops::reshape(ctx, &values, &value_shape)?;
        let out = ops::sum(ctx, &ops::mul(ctx, &weights, &values)?, &[1], false)?;

        if !self.density {
            return Ok(out);
        }
        let density = ops::narrow(ctx, &out, 1, 0, 1)?;
        let signal = ops::narrow(ctx, &out, 1, 1, self.channels)?;
        let signal = ops::div(ctx, &signal, &ops::add_scalar(ctx, &density, DENSITY_EPSILON)?)?;
        ops::repeat_cat(ctx, &[&density, &signal], 1)
    }
}

impl Module for SetConv {
    fn visit_parameters(&self, visitor: &mut dyn FnMut(&Parameter) -> Result<()>) -> Result<()> {
        visitor(&self.log_scales)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> Result<()>,
    ) -> Result<()> {
        visitor(&mut self.log_scales)
    }
}
