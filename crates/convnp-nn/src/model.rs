// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Convolutional conditional and latent neural processes.

use convnp_config::determinism::rng_from_optional;
use convnp_core::backend::ExecContext;
use convnp_core::error::{self, Result};
use convnp_core::{ops, Tensor};
use rand::rngs::StdRng;
use tracing::{debug, info};

use crate::config::{ModelConfig, ModelKind};
use crate::data::Batch;
use crate::decoder::{Decoder, DecoderOptions, Prediction};
use crate::discretisation::Grid;
use crate::encoder::{FunctionalRepresentation, LatentAggregator, SetConvEncoder};
use crate::latent::{LatentDistribution, SAMPLE_AXIS};
use crate::loss::{elbo, importance_weighted, monte_carlo, Objective};
use crate::module::{Module, Parameter};
use crate::noise::expand_trailing;

/// Maps a context set and target locations to a predictive distribution.
pub trait NeuralProcess: Module {
    fn config(&self) -> &ModelConfig;

    /// Predictive distribution at `x_target` with the shapes of the model
    /// call: `(num_targets, y_channels, batch)`.
    fn predict(
        &self,
        ctx: &ExecContext,
        x_context: &Tensor,
        y_context: &Tensor,
        x_target: &Tensor,
        rng: &mut StdRng,
    ) -> Result<Prediction>;

    /// Objective value per batch element, shaped `(batch)`.
    fn objective(
        &self,
        ctx: &ExecContext,
        batch: &Batch,
        objective: Objective,
        rng: &mut StdRng,
    ) -> Result<Tensor>;

    /// Informs epoch-dependent parts (e.g. the covariance ridge).
    fn set_epoch(&mut self, _epoch: usize) {}
}

fn decoder_options(config: &ModelConfig, in_channels: usize) -> DecoderOptions {
    DecoderOptions {
        in_channels,
        y_channels: config.y_channels,
        summary_channels: 1 + config.y_channels,
        noise: config.noise,
        ridge: config.ridge,
        pooling: config.pooling,
        geometry: config.geometry(),
        initial_scale: 2.0 / config.points_per_unit,
        initial_noise: config.initial_noise,
    }
}

fn unsupported(model: &str, objective: Objective) -> convnp_core::Error {
    error::invalid(
        "objective",
        format!("{model} cannot be trained with {objective:?}"),
    )
}

/// Deterministic model: set-conv encoder, conv decoder.
#[derive(Debug)]
pub struct ConvCnp {
    config: ModelConfig,
    encoder: SetConvEncoder,
    decoder: Decoder,
}

impl ConvCnp {
    pub fn new(config: ModelConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = rng_from_optional(config.seed, "convnp.conv_cnp");
        let encoder = SetConvEncoder::new("encoder", config.discretisation(), config.y_channels)?;
        let decoder = Decoder::new(
            "decoder",
            decoder_options(&config, 1 + config.y_channels),
            &mut rng,
        )?;
        let model = Self {
            config,
            encoder,
            decoder,
        };
        info!(
            parameters = model.num_parameters()?,
            noise = ?model.config.noise,
            "built convolutional conditional neural process"
        );
        Ok(model)
    }

    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }
}

impl Module for ConvCnp {
    fn visit_parameters(&self, visitor: &mut dyn FnMut(&Parameter) -> Result<()>) -> Result<()> {
        self.encoder.visit_parameters(visitor)?;
        self.decoder.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> Result<()>,
    ) -> Result<()> {
        self.encoder.visit_parameters_mut(visitor)?;
        self.decoder.visit_parameters_mut(visitor)
    }
}

impl NeuralProcess for ConvCnp {
    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn predict(
        &self,
        ctx: &ExecContext,
        x_context: &Tensor,
        y_context: &Tensor,
        x_target: &Tensor,
        _rng: &mut StdRng,
    ) -> Result<Prediction> {
        let (grid, representation) = self.encoder.encode(ctx, x_context, y_context, x_target)?;
        let features = representation.stacked(ctx)?;
        self.decoder.forward(ctx, &features, &grid, x_target, &features)
    }

    fn objective(
        &self,
        ctx: &ExecContext,
        batch: &Batch,
        objective: Objective,
        rng: &mut StdRng,
    ) -> Result<Tensor> {
        if objective != Objective::Exact {
            return Err(unsupported("ConvCnp", objective));
        }
        let prediction = self.predict(ctx, &batch.x_context, &batch.y_context, &batch.x_target, rng)?;
        prediction.log_likelihood(ctx, &batch.y_target)
    }

    fn set_epoch(&mut self, epoch: usize) {
        self.decoder.set_epoch(epoch);
    }
}

/// Latent-variable model: the encoder emits a Gaussian over latent channels
/// on the grid, samples of which are decoded together with the density.
#[derive(Debug)]
pub struct ConvNp {
    config: ModelConfig,
    encoder: SetConvEncoder,
    latent: LatentAggregator,
    decoder: Decoder,
}

impl ConvNp {
    pub fn new(config: ModelConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = rng_from_optional(config.seed, "convnp.conv_np");
        let encoder = SetConvEncoder::new("encoder", config.discretisation(), config.y_channels)?;
        let latent = LatentAggregator::new(
            "latent",
            config.y_channels,
            config.latent_channels,
            config.geometry(),
            &mut rng,
        )?;
        let decoder = Decoder::new(
            "decoder",
            decoder_options(&config, 1 + config.latent_channels),
            &mut rng,
        )?;
        let model = Self {
            config,
            encoder,
            latent,
            decoder,
        };
        info!(
            parameters = model.num_parameters()?,
            latent_channels = model.config.latent_channels,
            pooling = ?model.config.pooling,
            "built convolutional latent neural process"
        );
        Ok(model)
    }

    /// Latent distribution given `(x, y)` on `grid`, with the representation
    /// it was computed from.
    pub fn latent_distribution(
        &self,
        ctx: &ExecContext,
        grid: &Grid,
        x: &Tensor,
        y: &Tensor,
    ) -> Result<(FunctionalRepresentation, LatentDistribution)> {
        let representation = self.encoder.encode_on(ctx, grid, x, y)?;
        let distribution = self.latent.forward(ctx, &representation)?;
        Ok((representation, distribution))
    }

    /// Decodes `(grid, latent_channels, batch, samples)` latent samples. The
    /// density channel of `representation` is placed first.
    pub fn decode(
        &self,
        ctx: &ExecContext,
        representation: &FunctionalRepresentation,
        samples: &Tensor,
        grid: &Grid,
        x_target: &Tensor,
    ) -> Result<Prediction> {
        let density = expand_trailing(ctx, &representation.density, samples.ndim())?;
        let features = ops::repeat_cat(ctx, &[&density, samples], 1)?;
        let summary = representation.stacked(ctx)?;
        self.decoder.forward(ctx, &features, grid, x_target, &summary)
    }

    /// Per-sample log-likelihoods `(batch, samples)` of the targets under
    /// latents drawn from `distribution`.
    fn sample_log_likelihoods(
        &self,
        ctx: &ExecContext,
        conditioning: &Conditioning,
        distribution: &LatentDistribution,
        batch: &Batch,
        num_samples: usize,
        rng: &mut StdRng,
    ) -> Result<Tensor> {
        let samples = distribution.sample(ctx, num_samples, rng)?;
        let prediction = self.decode(
            ctx,
            &conditioning.representation,
            &samples,
            &conditioning.grid,
            &batch.x_target,
        )?;
        prediction.log_likelihood(ctx, &batch.y_target)
    }
}

/// Context encoding shared by every estimator of one objective evaluation.
struct Conditioning {
    grid: Grid,
    representation: FunctionalRepresentation,
}

impl Module for ConvNp {
    fn visit_parameters(&self, visitor: &mut dyn FnMut(&Parameter) -> Result<()>) -> Result<()> {
        self.encoder.visit_parameters(visitor)?;
        self.latent.visit_parameters(visitor)?;
        self.decoder.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> Result<()>,
    ) -> Result<()> {
        self.encoder.visit_parameters_mut(visitor)?;
        self.latent.visit_parameters_mut(visitor)?;
        self.decoder.visit_parameters_mut(visitor)
    }
}

impl NeuralProcess for ConvNp {
    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn predict(
        &self,
        ctx: &ExecContext,
        x_context: &Tensor,
        y_context: &Tensor,
        x_target: &Tensor,
        rng: &mut StdRng,
    ) -> Result<Prediction> {
        let grid = self.encoder.grid(x_context, x_target)?;
        let (representation, prior) = self.latent_distribution(ctx, &grid, x_context, y_context)?;
        let samples = prior.sample(ctx, self.config.num_samples, rng)?;
        let pooled = self.config.pooling.pool(ctx, &samples, SAMPLE_AXIS)?;
        self.decode(ctx, &representation, &pooled, &grid, x_target)?
            .squeeze_trailing(ctx)
    }

    fn objective(
        &self,
        ctx: &ExecContext,
        batch: &Batch,
        objective: Objective,
        rng: &mut StdRng,
    ) -> Result<Tensor> {
        objective.validate()?;
        let grid = self.encoder.grid(&batch.x_context, &batch.x_target)?;
        let (representation, prior) =
            self.latent_distribution(ctx, &grid, &batch.x_context, &batch.y_context)?;
        let conditioning = Conditioning {
            grid,
            representation,
        };
        match objective {
            Objective::Exact => Err(unsupported("ConvNp", objective)),
            Objective::MonteCarlo { num_samples } => {
                let lls =
                    self.sample_log_likelihoods(ctx, &conditioning, &prior, batch, num_samples, rng)?;
                monte_carlo(ctx, &lls)
            }
            Objective::ImportanceWeighted { num_samples } => {
                let lls =
                    self.sample_log_likelihoods(ctx, &conditioning, &prior, batch, num_samples, rng)?;
                importance_weighted(ctx, &lls)
            }
            Objective::Elbo { num_samples } => {
                let x_all = ops::repeat_cat(ctx, &[&batch.x_context, &batch.x_target], 0)?;
                let y_all = ops::repeat_cat(ctx, &[&batch.y_context, &batch.y_target], 0)?;
                let (_, posterior) =
                    self.latent_distribution(ctx, &conditioning.grid, &x_all, &y_all)?;
                debug!(num_samples, grid = conditioning.grid.len(), "evaluating elbo");
                let lls = self.sample_log_likelihoods(
                    ctx,
                    &conditioning,
                    &posterior,
                    batch,
                    num_samples,
                    rng,
                )?;
                elbo(ctx, &lls, &posterior, &prior)
            }
        }
    }

    fn set_epoch(&mut self, epoch: usize) {
        self.decoder.set_epoch(epoch);
    }
}

/// Builds the architecture named by `config.kind`.
pub fn build_model(config: ModelConfig) -> Result<Box<dyn NeuralProcess>> {
    Ok(match config.kind {
        ModelKind::Deterministic => Box::new(ConvCnp::new(config)?),
        ModelKind::Latent => Box::new(ConvNp::new(config)?),
    })
}
