// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Likelihood objectives and the losses built from them.
//!
//! Every objective is produced per batch element; losses average over the
//! batch and normalise by the number of target points.

mod nll;

use convnp_core::backend::ExecContext;
use convnp_core::error::{self, Result};
use convnp_core::{ops, Tensor};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::data::Batch;
use crate::latent::LatentDistribution;
use crate::model::NeuralProcess;

pub use nll::NegativeLogLikelihood;

/// Training objective of a neural process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Objective {
    /// Exact log-likelihood of a deterministic model.
    Exact,
    /// Log-likelihood averaged over samples from the context-only latent.
    MonteCarlo { num_samples: usize },
    /// Importance-weighted bound with the context-only latent as proposal.
    ImportanceWeighted { num_samples: usize },
    /// Evidence lower bound with a posterior from context and targets.
    Elbo { num_samples: usize },
}

impl Objective {
    pub fn num_samples(&self) -> Option<usize> {
        match *self {
            Objective::Exact => None,
            Objective::MonteCarlo { num_samples }
            | Objective::ImportanceWeighted { num_samples }
            | Objective::Elbo { num_samples } => Some(num_samples),
        }
    }

    pub fn is_latent(&self) -> bool {
        !matches!(self, Objective::Exact)
    }

    pub fn validate(&self) -> Result<()> {
        match self.num_samples() {
            Some(0) => Err(error::invalid("objective.num_samples", "must be at least 1")),
            _ => Ok(()),
        }
    }
}

fn check_sample_axis(label: &'static str, log_likelihoods: &Tensor) -> Result<usize> {
    let shape = log_likelihoods.shape();
    match shape.as_slice() {
        [_, samples] if *samples > 0 => Ok(*samples),
        _ => Err(error::shape(format!(
            "{label}: expected (batch, samples) log-likelihoods, got {shape:?}"
        ))),
    }
}

/// Plain Monte Carlo estimate: the mean of per-sample log-likelihoods.
pub fn monte_carlo(ctx: &ExecContext, log_likelihoods: &Tensor) -> Result<Tensor> {
    let samples = check_sample_axis("monte_carlo", log_likelihoods)?;
    let total = ops::sum(ctx, log_likelihoods, &[1], false)?;
    ops::scale(ctx, &total, 1.0 / samples as f64)
}

/// `log (1/S) Σ_s p(y | z_s)`, evaluated stably in log space.
pub fn importance_weighted(ctx: &ExecContext, log_likelihoods: &Tensor) -> Result<Tensor> {
    let samples = check_sample_axis("importance_weighted", log_likelihoods)?;
    let pooled = ops::logsumexp(ctx, log_likelihoods, &[1])?;
    let batch = log_likelihoods.shape()[0];
    let pooled = ops::reshape(ctx, &pooled, &[batch])?;
    ops::add_scalar(ctx, &pooled, -(samples as f64).ln())
}

/// Reconstruction term minus `KL(posterior ‖ prior)`.
pub fn elbo(
    ctx: &ExecContext,
    log_likelihoods: &Tensor,
    posterior: &LatentDistribution,
    prior: &LatentDistribution,
) -> Result<Tensor> {
    let reconstruction = monte_carlo(ctx, log_likelihoods)?;
    let kl = posterior.kl(ctx, prior)?;
    ops::sub(ctx, &reconstruction, &kl)
}

/// Averages a per-batch objective and turns it into a loss per target point.
pub fn normalised_loss(ctx: &ExecContext, objective: &Tensor, num_targets: usize) -> Result<Tensor> {
    let batch = objective.len();
    if batch == 0 || num_targets == 0 {
        return Err(error::shape("cannot normalise an empty objective"));
    }
    let total = ops::sum(ctx, objective, &[], false)?;
    ops::scale(ctx, &total, -1.0 / (batch * num_targets) as f64)
}

/// Loss over a neural process and a batch. Gradients flow through the tape,
/// so only the forward pass is needed.
pub trait Loss {
    fn forward<M: NeuralProcess + ?Sized>(
        &mut self,
        ctx: &ExecContext,
        model: &M,
        batch: &Batch,
        rng: &mut StdRng,
    ) -> Result<Tensor>;
}
