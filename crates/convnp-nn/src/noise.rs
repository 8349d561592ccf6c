// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Output noise parameterisations and the positivity transform.

use convnp_core::backend::ExecContext;
use convnp_core::error::{self, Result};
use convnp_core::{ops, Tensor};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::layers::Conv1d;
use crate::module::{Module, Parameter};
use crate::pooling::PoolingPolicy;

/// How the decoder parameterises its output variance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NoiseKind {
    /// One learned variance per output channel shared by every point.
    Fixed,
    /// Variance predicted from a pooled summary of the encoding.
    Amortised,
    /// Mean and variance predicted per output point.
    #[default]
    Heteroscedastic,
    /// Low-rank plus diagonal covariance across the target points.
    Correlated { rank: usize },
}

impl NoiseKind {
    /// Channels the decoder stack has to produce for `y_channels` outputs.
    pub fn head_channels(&self, y_channels: usize) -> usize {
        match self {
            NoiseKind::Fixed | NoiseKind::Amortised => y_channels,
            NoiseKind::Heteroscedastic => 2 * y_channels,
            NoiseKind::Correlated { rank } => 1 + rank,
        }
    }

    pub fn validate(&self, y_channels: usize) -> Result<()> {
        if let NoiseKind::Correlated { rank } = self {
            if *rank == 0 {
                return Err(error::invalid("noise.rank", "must be positive"));
            }
            if y_channels != 1 {
                return Err(error::invalid(
                    "noise.kind",
                    format!("correlated noise models one output channel, got {y_channels}"),
                ));
            }
        }
        Ok(())
    }
}

/// Ridge added to the diagonal of a correlated covariance, as a function of
/// the training epoch.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "schedule", rename_all = "snake_case")]
pub enum RidgeSchedule {
    Constant { value: f64 },
    /// `max(initial * rate^epoch, floor)`
    Exponential { initial: f64, rate: f64, floor: f64 },
    /// `max(initial / (1 + epoch), floor)`
    InverseEpoch { initial: f64, floor: f64 },
}

impl Default for RidgeSchedule {
    fn default() -> Self {
        RidgeSchedule::Exponential {
            initial: 1e-2,
            rate: 0.5,
            floor: 1e-6,
        }
    }
}

impl RidgeSchedule {
    pub fn value(&self, epoch: usize) -> f64 {
        match *self {
            RidgeSchedule::Constant { value } => value,
            RidgeSchedule::Exponential {
                initial,
                rate,
                floor,
            } => (initial * rate.powi(epoch.min(i32::MAX as usize) as i32)).max(floor),
            RidgeSchedule::InverseEpoch { initial, floor } => {
                (initial / (1.0 + epoch as f64)).max(floor)
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let ok = match *self {
            RidgeSchedule::Constant { value } => value >= 0.0 && value.is_finite(),
            RidgeSchedule::Exponential {
                initial,
                rate,
                floor,
            } => initial >= 0.0 && (0.0..=1.0).contains(&rate) && floor >= 0.0,
            RidgeSchedule::InverseEpoch { initial, floor } => initial >= 0.0 && floor >= 0.0,
        };
        if ok {
            Ok(())
        } else {
            Err(error::invalid("noise.ridge", format!("invalid schedule {self:?}")))
        }
    }
}

/// Maps raw network output to a strictly positive variance.
pub fn positive_variance(ctx: &ExecContext, raw: &Tensor) -> Result<Tensor> {
    ops::softplus(ctx, raw)
}

/// Splits the channel axis into a mean half and a positive variance half.
pub fn split_mean_variance(ctx: &ExecContext, x: &Tensor) -> Result<(Tensor, Tensor)> {
    let (mean, raw) = ops::split(ctx, x, 1)?;
    Ok((mean, positive_variance(ctx, &raw)?))
}

/// Appends singleton axes until `x` has `rank` axes.
pub fn expand_trailing(ctx: &ExecContext, x: &Tensor, rank: usize) -> Result<Tensor> {
    let mut shape = x.shape();
    if shape.len() >= rank {
        return Ok(x.clone());
    }
    shape.resize(rank, 1);
    ops::reshape(ctx, x, &shape)
}

/// Small pointwise network predicting one variance per output channel from
/// the pooled encoder representation.
#[derive(Debug)]
pub struct AmortisedNoise {
    hidden: Conv1d,
    output: Conv1d,
    pooling: PoolingPolicy,
}

impl AmortisedNoise {
    pub fn new<R: Rng>(
        name: &str,
        in_channels: usize,
        hidden_channels: usize,
        y_channels: usize,
        pooling: PoolingPolicy,
        rng: &mut R,
    ) -> Result<Self> {
        Ok(Self {
            hidden: Conv1d::new(&format!("{name}::hidden"), in_channels, hidden_channels, 1, rng)?,
            output: Conv1d::new(&format!("{name}::output"), hidden_channels, y_channels, 1, rng)?,
            pooling,
        })
    }

    /// `(grid, channels, batch)` representation to a `(1, y_channels, batch)`
    /// variance.
    pub fn forward(&self, ctx: &ExecContext, representation: &Tensor) -> Result<Tensor> {
        let summary = self.pooling.pool(ctx, representation, 0)?;
        let hidden = ops::relu(ctx, &self.hidden.forward(ctx, &summary)?)?;
        positive_variance(ctx, &self.output.forward(ctx, &hidden)?)
    }
}

impl Module for AmortisedNoise {
    fn visit_parameters(&self, visitor: &mut dyn FnMut(&Parameter) -> Result<()>) -> Result<()> {
        self.hidden.visit_parameters(visitor)?;
        self.output.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> Result<()>,
    ) -> Result<()> {
        self.hidden.visit_parameters_mut(visitor)?;
        self.output.visit_parameters_mut(visitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn split_yields_positive_variances() {
        let ctx = ExecContext::cpu();
        let raw = Tensor::from_shape_vec(&[2, 2, 1], vec![0.3, -800.0, 1.0, 50.0]).unwrap();
        let (mean, var) = split_mean_variance(&ctx, &raw).unwrap();
        assert_eq!(mean.to_vec(), vec![0.3, 1.0]);
        assert!(var.to_vec().iter().all(|v| *v > 0.0));
        let odd = Tensor::zeros(&[2, 3, 1]);
        assert!(split_mean_variance(&ctx, &odd).is_err());
    }

    #[test]
    fn ridge_schedules_decay_to_their_floor() {
        let constant = RidgeSchedule::Constant { value: 1e-3 };
        assert_eq!(constant.value(10), 1e-3);
        let exponential = RidgeSchedule::Exponential {
            initial: 1.0,
            rate: 0.5,
            floor: 0.1,
        };
        assert_eq!(exponential.value(0), 1.0);
        assert_eq!(exponential.value(2), 0.25);
        assert_eq!(exponential.value(20), 0.1);
        let inverse = RidgeSchedule::InverseEpoch {
            initial: 1.0,
            floor: 0.0,
        };
        assert_eq!(inverse.value(3), 0.25);
        assert!(RidgeSchedule::Constant { value: -1.0 }.validate().is_err());
    }

    #[test]
    fn head_channels_follow_the_noise_kind() {
        assert_eq!(NoiseKind::Fixed.head_channels(2), 2);
        assert_eq!(NoiseKind::Heteroscedastic.head_channels(2), 4);
        assert_eq!(NoiseKind::Correlated { rank: 3 }.head_channels(1), 4);
        assert!(NoiseKind::Correlated { rank: 3 }.validate(2).is_err());
        let parsed: NoiseKind = serde_json::from_str(r#"{"kind":"correlated","rank":2}"#).unwrap();
        assert_eq!(parsed, NoiseKind::Correlated { rank: 2 });
    }

    #[test]
    fn amortised_noise_is_uniform_over_the_grid() {
        let ctx = ExecContext::cpu();
        let mut rng = StdRng::seed_from_u64(3);
        let head = AmortisedNoise::new("noise", 3, 4, 2, PoolingPolicy::Mean, &mut rng).unwrap();
        let var = head.forward(&ctx, &Tensor::ones(&[9, 3, 5])).unwrap();
        assert_eq!(var.shape(), vec![1, 2, 5]);
        assert!(var.to_vec().iter().all(|v| *v > 0.0));
        assert_eq!(head.num_parameters().unwrap(), 3 * 4 + 4 + 4 * 2 + 2);
    }
}
