// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Reparameterised Gaussian sampling.
//!
//! The draw is split into an independent noise source ([`standard_normal`])
//! and a deterministic affine map `mean + sqrt(var) · noise` that carries its
//! own reverse rule.

use ndarray::{ArrayD, Zip};
use rand::Rng;
use rand_distr::StandardNormal;

use super::{apply_one, broadcast_shape, broadcast_view, unbroadcast, Operation};
use crate::backend::ExecContext;
use crate::error::Result;
use crate::Tensor;

#[derive(Debug)]
struct ReparamSample;

impl Operation for ReparamSample {
    fn name(&self) -> &'static str {
        "reparam_sample"
    }

    fn forward(&self, _ctx: &ExecContext, inputs: &[&ArrayD<f64>]) -> Result<Vec<ArrayD<f64>>> {
        let (mean, var, noise) = (inputs[0], inputs[1], inputs[2]);
        let shape = broadcast_shape(&broadcast_shape(mean.shape(), var.shape())?, noise.shape())?;
        let out = Zip::from(&broadcast_view(mean, &shape)?)
            .and(&broadcast_view(var, &shape)?)
            .and(&broadcast_view(noise, &shape)?)
            .map_collect(|m, v, e| m + v.sqrt() * e);
        Ok(vec![out])
    }

    fn backward(
        &self,
        _ctx: &ExecContext,
        inputs: &[ArrayD<f64>],
        _outputs: &[ArrayD<f64>],
        grads: &[ArrayD<f64>],
    ) -> Result<Vec<Option<ArrayD<f64>>>> {
        let g = &grads[0];
        let var = broadcast_view(&inputs[1], g.shape())?;
        let noise = broadcast_view(&inputs[2], g.shape())?;
        let gvar = Zip::from(g)
            .and(&var)
            .and(&noise)
            .map_collect(|g, v, e| g * e / (2.0 * v.sqrt()));
        let gnoise = Zip::from(g).and(&var).map_collect(|g, v| g * v.sqrt());
        Ok(vec![
            Some(unbroadcast(g.clone(), inputs[0].shape())),
            Some(unbroadcast(gvar, inputs[1].shape())),
            Some(unbroadcast(gnoise, inputs[2].shape())),
        ])
    }
}

/// `mean + sqrt(var) · noise`, differentiable in all three arguments.
pub fn reparam_sample(ctx: &ExecContext, mean: &Tensor, var: &Tensor, noise: &Tensor) -> Result<Tensor> {
    apply_one(ctx, ReparamSample, &[mean, var, noise])
}

/// Untracked tensor of independent standard normal draws.
pub fn standard_normal<R: Rng>(shape: &[usize], rng: &mut R) -> Result<Tensor> {
    let len: usize = shape.iter().product();
    let values: Vec<f64> = (0..len).map(|_| rng.sample(StandardNormal)).collect();
    Tensor::from_shape_vec(shape, values)
}
