// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Convolutional decoder: grid features to a predictive distribution at the
//! target locations.

use convnp_core::backend::ExecContext;
use convnp_core::error::{self, Result};
use convnp_core::{ops, Tensor};
use ndarray::{ArrayD, IxDyn};
use rand::Rng;
use tracing::debug;

use crate::discretisation::Grid;
use crate::layers::{ConvStack, StackGeometry};
use crate::module::{Module, Parameter};
use crate::noise::{
    expand_trailing, positive_variance, split_mean_variance, AmortisedNoise, NoiseKind,
    RidgeSchedule,
};
use crate::pooling::PoolingPolicy;
use crate::setconv::SetConv;

/// Predictive distribution over the target outputs.
#[derive(Clone, Debug)]
pub enum Prediction {
    /// Independent Gaussians; mean and variance share one shape.
    Diagonal { mean: Tensor, variance: Tensor },
    /// Joint Gaussian per batch element: mean `(n, 1, batch)`, covariance
    /// `(n, n, batch)`.
    Correlated { mean: Tensor, covariance: Tensor },
}

impl Prediction {
    pub fn mean(&self) -> &Tensor {
        match self {
            Prediction::Diagonal { mean, .. } | Prediction::Correlated { mean, .. } => mean,
        }
    }

    /// Marginal variances, shaped like the mean.
    pub fn variance(&self, ctx: &ExecContext) -> Result<Tensor> {
        match self {
            Prediction::Diagonal { variance, .. } => Ok(variance.clone()),
            Prediction::Correlated { covariance, .. } => {
                let shape = covariance.shape();
                let n = shape[0];
                let mut eye_shape = vec![1usize; shape.len()];
                eye_shape[0] = n;
                eye_shape[1] = n;
                let eye = ArrayD::from_shape_fn(IxDyn(&eye_shape), |index| {
                    if index[0] == index[1] {
                        1.0
                    } else {
                        0.0
                    }
                });
                let masked = ops::mul(ctx, covariance, &Tensor::from_array(eye))?;
                ops::sum(ctx, &masked, &[1], true)
            }
        }
    }

    /// Log-likelihood of `y` summed over points and channels. The result has
    /// the mean's shape without its two leading axes.
    pub fn log_likelihood(&self, ctx: &ExecContext, y: &Tensor) -> Result<Tensor> {
        match self {
            Prediction::Diagonal { mean, variance } => {
                let y = expand_trailing(ctx, y, mean.ndim())?;
                let pointwise = ops::gaussian_logpdf(ctx, &y, mean, variance)?;
                ops::sum(ctx, &pointwise, &[0, 1], false)
            }
            Prediction::Correlated { mean, covariance } => {
                ops::mv_gaussian_logpdf(ctx, y, mean, covariance)
            }
        }
    }

    /// Drops a trailing axis of size one, e.g. after pooling latent samples.
    pub fn squeeze_trailing(self, ctx: &ExecContext) -> Result<Self> {
        let squeeze = |t: &Tensor| -> Result<Tensor> {
            let mut shape = t.shape();
            if shape.len() > 3 && shape.last() == Some(&1) {
                shape.pop();
                ops::reshape(ctx, t, &shape)
            } else {
                Ok(t.clone())
            }
        };
        Ok(match self {
            Prediction::Diagonal { mean, variance } => Prediction::Diagonal {
                mean: squeeze(&mean)?,
                variance: squeeze(&variance)?,
            },
            Prediction::Correlated { mean, covariance } => Prediction::Correlated {
                mean: squeeze(&mean)?,
                covariance: squeeze(&covariance)?,
            },
        })
    }
}

/// `x` such that `softplus(x) = value`.
pub fn inverse_softplus(value: f64) -> f64 {
    value + (-(-value).exp_m1()).ln()
}

#[derive(Debug)]
enum NoiseHead {
    Fixed {
        raw: Parameter,
    },
    Amortised(AmortisedNoise),
    Heteroscedastic,
    Correlated {
        rank: usize,
        raw: Parameter,
        ridge: RidgeSchedule,
        ridge_value: f64,
    },
}

/// Hyperparameters of a [`Decoder`].
#[derive(Clone, Copy, Debug)]
pub struct DecoderOptions {
    /// Channels of the grid features fed to the stack.
    pub in_channels: usize,
    pub y_channels: usize,
    /// Channels of the encoder representation the amortised head summarises.
    pub summary_channels: usize,
    pub noise: NoiseKind,
    pub ridge: RidgeSchedule,
    pub pooling: PoolingPolicy,
    pub geometry: StackGeometry,
    /// Starting length scale of the output set convolution.
    pub initial_scale: f64,
    /// Starting variance of the fixed and correlated heads.
    pub initial_noise: f64,
}

/// Conv stack over the grid, set convolution onto the targets and a noise
/// head that turns the result into a [`Prediction`].
#[derive(Debug)]
pub struct Decoder {
    convs: ConvStack,
    set_conv: SetConv,
    head: NoiseHead,
    y_channels: usize,
}

impl Decoder {
    pub fn new<R: Rng>(name: &str, options: DecoderOptions, rng: &mut R) -> Result<Self> {
        options.noise.validate(options.y_channels)?;
        if !(options.initial_noise > 0.0) {
            return Err(error::invalid(
                "decoder.initial_noise",
                format!("must be positive, got {}", options.initial_noise),
            ));
        }
        let head_channels = options.noise.head_channels(options.y_channels);
        let convs = ConvStack::new(
            &format!("{name}::convs"),
            options.in_channels,
            head_channels,
            options.geometry,
            rng,
        )?;
        let set_conv = SetConv::new(
            &format!("{name}::set_conv"),
            head_channels,
            options.initial_scale,
            false,
        )?;
        let raw_noise = inverse_softplus(options.initial_noise);
        let head = match options.noise {
            NoiseKind::Fixed => NoiseHead::Fixed {
                raw: Parameter::new(
                    format!("{name}::noise"),
                    ArrayD::from_elem(IxDyn(&[1, options.y_channels]), raw_noise),
                ),
            },
            NoiseKind::Amortised => NoiseHead::Amortised(AmortisedNoise::new(
                &format!("{name}::noise"),
                options.summary_channels,
                options.geometry.num_channels,
                options.y_channels,
                options.pooling,
                rng,
            )?),
            NoiseKind::Heteroscedastic => NoiseHead::Heteroscedastic,
            NoiseKind::Correlated { rank } => {
                options.ridge.validate()?;
                NoiseHead::Correlated {
                    rank,
                    raw: Parameter::new(
                        format!("{name}::noise"),
                        ArrayD::from_elem(IxDyn(&[1]), raw_noise),
                    ),
                    ridge: options.ridge,
                    ridge_value: options.ridge.value(0),
                }
            }
        };
        Ok(Self {
            convs,
            set_conv,
            head,
            y_channels: options.y_channels,
        })
    }

    pub fn y_channels(&self) -> usize {
        self.y_channels
    }

    /// Ridge currently added to correlated covariances.
    pub fn ridge(&self) -> Option<f64> {
        match &self.head {
            NoiseHead::Correlated { ridge_value, .. } => Some(*ridge_value),
            _ => None,
        }
    }

    pub fn set_epoch(&mut self, epoch: usize) {
        if let NoiseHead::Correlated {
            ridge, ridge_value, ..
        } = &mut self.head
        {
            *ridge_value = ridge.value(epoch);
            debug!(epoch, ridge = *ridge_value, "updated covariance ridge");
        }
    }

    /// Decodes `(grid, in_channels, batch...)` features onto `x_target`.
    /// `summary` is the encoder representation consumed by amortised noise.
    pub fn forward(
        &self,
        ctx: &ExecContext,
        features: &Tensor,
        grid: &Grid,
        x_target: &Tensor,
        summary: &Tensor,
    ) -> Result<Prediction> {
        let hidden = self.convs.forward(ctx, features)?;
        let out = self.set_conv.forward(ctx, grid.points(), &hidden, x_target)?;
        let rank = out.ndim();
        match &self.head {
            NoiseHead::Heteroscedastic => {
                let (mean, variance) = split_mean_variance(ctx, &out)?;
                Ok(Prediction::Diagonal { mean, variance })
            }
            NoiseHead::Fixed { raw } => {
                let variance = expand_trailing(ctx, &positive_variance(ctx, raw.value())?, rank)?;
                let variance = ops::broadcast_to(ctx, &variance, &out.shape())?;
                Ok(Prediction::Diagonal {
                    mean: out,
                    variance,
                })
            }
            NoiseHead::Amortised(head) => {
                let variance = expand_trailing(ctx, &head.forward(ctx, summary)?, rank)?;
                let variance = ops::broadcast_to(ctx, &variance, &out.shape())?;
                Ok(Prediction::Diagonal {
                    mean: out,
                    variance,
                })
            }
            NoiseHead::Correlated {
                rank: factor_rank,
                raw,
                ridge_value,
                ..
            } => {
                let mean = ops::narrow(ctx, &out, 1, 0, 1)?;
                let factor = ops::narrow(ctx, &out, 1, 1, *factor_rank)?;
                let low_rank = ops::batched_mul(ctx, &factor, &ops::batched_transpose(ctx, &factor)?)?;
                let low_rank = ops::scale(ctx, &low_rank, 1.0 / *factor_rank as f64)?;
                let noise = ops::add_scalar(ctx, &positive_variance(ctx, raw.value())?, *ridge_value)?;
                let mut diag_shape = out.shape();
                diag_shape.remove(1);
                let noise = ops::diagonal(ctx, &ops::broadcast_to(ctx, &noise, &diag_shape)?)?;
                let covariance = ops::add(ctx, &low_rank, &noise)?;
                Ok(Prediction::Correlated { mean, covariance })
            }
        }
    }
}

impl Module for Decoder {
    fn visit_parameters(&self, visitor: &mut dyn FnMut(&Parameter) -> Result<()>) -> Result<()> {
        self.convs.visit_parameters(visitor)?;
        self.set_conv.visit_parameters(visitor)?;
        match &self.head {
            NoiseHead::Fixed { raw } | NoiseHead::Correlated { raw, .. } => visitor(raw),
            NoiseHead::Amortised(head) => head.visit_parameters(visitor),
            NoiseHead::Heteroscedastic => Ok(()),
        }
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> Result<()>,
    ) -> Result<()> {
        self.convs.visit_parameters_mut(visitor)?;
        self.set_conv.visit_parameters_mut(visitor)?;
        match &mut self.head {
            NoiseHead::Fixed { raw } | NoiseHead::Correlated { raw, .. } => visitor(raw),
            NoiseHead::Amortised(head) => head.visit_parameters_mut(visitor),
            NoiseHead::Heteroscedastic => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discretisation::UniformDiscretisation1d;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn options(noise: NoiseKind) -> DecoderOptions {
        DecoderOptions {
            in_channels: 2,
            y_channels: 1,
            summary_channels: 2,
            noise,
            ridge: RidgeSchedule::Constant { value: 1e-3 },
            pooling: PoolingPolicy::Mean,
            geometry: StackGeometry {
                receptive_field: 1.0,
                points_per_unit: 4.0,
                num_layers: 2,
                num_channels: 4,
            },
            initial_scale: 0.5,
            initial_noise: 0.1,
        }
    }

    fn decode(noise: NoiseKind) -> Prediction {
        let ctx = ExecContext::cpu();
        let mut rng = StdRng::seed_from_u64(9);
        let decoder = Decoder::new("decoder", options(noise), &mut rng).unwrap();
        let targets = Tensor::from_shape_vec(&[3, 1, 2], vec![-0.5, 0.0, 0.25, 0.5, 0.75, 1.0]).unwrap();
        let grid = UniformDiscretisation1d::new(4.0, 0.5, 1)
            .unwrap()
            .grid(&[&targets])
            .unwrap();
        let features = Tensor::ones(&[grid.len(), 2, 2]);
        decoder.forward(&ctx, &features, &grid, &targets, &features).unwrap()
    }

    #[test]
    fn inverse_softplus_round_trips() {
        for value in [1e-3, 0.1, 1.0, 20.0] {
            let raw = inverse_softplus(value);
            let back = (1.0 + raw.exp()).ln();
            assert_abs_diff_eq!(back, value, epsilon = 1e-10);
        }
    }

    #[test]
    fn diagonal_heads_give_positive_variances() {
        let ctx = ExecContext::cpu();
        for noise in [NoiseKind::Fixed, NoiseKind::Amortised, NoiseKind::Heteroscedastic] {
            let prediction = decode(noise);
            assert_eq!(prediction.mean().shape(), vec![3, 1, 2]);
            let variance = prediction.variance(&ctx).unwrap();
            assert_eq!(variance.shape(), vec![3, 1, 2]);
            assert!(variance.to_vec().iter().all(|v| *v > 0.0), "{noise:?}");
        }
    }

    #[test]
    fn fixed_noise_is_shared_by_every_point() {
        let ctx = ExecContext::cpu();
        let variance = decode(NoiseKind::Fixed).variance(&ctx).unwrap().to_vec();
        for v in &variance {
            assert_abs_diff_eq!(*v, 0.1, epsilon = 1e-12);
        }
    }

    #[test]
    fn correlated_head_builds_a_valid_covariance() {
        let ctx = ExecContext::cpu();
        let prediction = decode(NoiseKind::Correlated { rank: 2 });
        let Prediction::Correlated { mean, covariance } = &prediction else {
            panic!("expected a correlated prediction");
        };
        assert_eq!(mean.shape(), vec![3, 1, 2]);
        assert_eq!(covariance.shape(), vec![3, 3, 2]);
        let cov = covariance.data();
        for b in 0..2 {
            for i in 0..3 {
                assert!(cov[[i, i, b]] >= 0.1);
                for j in 0..3 {
                    assert_abs_diff_eq!(cov[[i, j, b]], cov[[j, i, b]], epsilon = 1e-12);
                }
            }
        }
        let y = Tensor::zeros(&[3, 1, 2]);
        let ll = prediction.log_likelihood(&ctx, &y).unwrap();
        assert_eq!(ll.shape(), vec![2]);
        assert!(ll.to_vec().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn ridge_follows_the_epoch() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut opts = options(NoiseKind::Correlated { rank: 1 });
        opts.ridge = RidgeSchedule::InverseEpoch {
            initial: 1.0,
            floor: 0.0,
        };
        let mut decoder = Decoder::new("decoder", opts, &mut rng).unwrap();
        assert_eq!(decoder.ridge(), Some(1.0));
        decoder.set_epoch(3);
        assert_eq!(decoder.ridge(), Some(0.25));
    }
}
