// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use convnp_config::LayeredConfig;
use convnp_core::backend::ExecContext;
use convnp_core::error::{self, Error, Result};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::data::{Batch, DataGenerator};
use crate::loss::{Loss, NegativeLogLikelihood, Objective};
use crate::model::NeuralProcess;

/// Settings of the `trainer` configuration section.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainerConfig {
    pub learning_rate: f64,
    pub steps_per_epoch: usize,
    /// Overrides the model's default objective.
    pub objective: Option<Objective>,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-2,
            steps_per_epoch: 64,
            objective: None,
        }
    }
}

impl TrainerConfig {
    pub fn from_layered(config: &LayeredConfig) -> Result<Self> {
        let parsed: Option<TrainerConfig> = config
            .section(&["trainer"])
            .map_err(|err| Error::Serialization(format!("trainer section: {err}")))?;
        for (field, layer) in config.overrides("trainer") {
            info!(field, ?layer, "trainer setting overridden");
        }
        Ok(parsed.unwrap_or_default())
    }
}

/// Loss and gradient norm observed by one update.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StepReport {
    pub loss: f64,
    pub gradient_norm: f64,
}

/// Gradient descent driver: one backward pass and one parameter update per
/// batch, with an epoch counter feeding epoch-dependent model parts.
#[derive(Debug)]
pub struct Trainer {
    learning_rate: f64,
    loss: NegativeLogLikelihood,
    epoch: usize,
    steps: usize,
}

impl Trainer {
    pub fn new(learning_rate: f64, objective: Objective) -> Result<Self> {
        if !(learning_rate > 0.0) || !learning_rate.is_finite() {
            return Err(error::invalid(
                "trainer.learning_rate",
                format!("must be positive, got {learning_rate}"),
            ));
        }
        Ok(Self {
            learning_rate,
            loss: NegativeLogLikelihood::new(objective)?,
            epoch: 0,
            steps: 0,
        })
    }

    /// Trainer for `model` using the configured or the model's default objective.
    pub fn from_config<M: NeuralProcess + ?Sized>(config: &TrainerConfig, model: &M) -> Result<Self> {
        let objective = config
            .objective
            .unwrap_or_else(|| model.config().default_objective());
        Self::new(config.learning_rate, objective)
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn objective(&self) -> Objective {
        self.loss.objective()
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Clears accumulated gradients.
    pub fn zero<M: NeuralProcess + ?Sized>(&self, model: &mut M) -> Result<()> {
        model.zero_grad()
    }

    /// Moves to `epoch` and lets the model update epoch-dependent state.
    pub fn begin_epoch<M: NeuralProcess + ?Sized>(&mut self, model: &mut M, epoch: usize) {
        self.epoch = epoch;
        model.set_epoch(epoch);
        info!(epoch, "starting epoch");
    }

    /// Loss on `batch` without touching the parameters.
    pub fn evaluate<M: NeuralProcess + ?Sized>(
        &mut self,
        ctx: &ExecContext,
        model: &M,
        batch: &Batch,
        rng: &mut StdRng,
    ) -> Result<f64> {
        self.loss.forward(ctx, model, batch, rng)?.item()
    }

    /// One gradient descent update on `batch`.
    pub fn step<M: NeuralProcess + ?Sized>(
        &mut self,
        ctx: &ExecContext,
        model: &mut M,
        batch: &Batch,
        rng: &mut StdRng,
    ) -> Result<StepReport> {
        self.zero(model)?;
        let loss = self.loss.forward(ctx, &*model, batch, rng)?;
        let value = loss.item()?;
        if !value.is_finite() {
            warn!(step = self.steps, loss = value, "non-finite loss, aborting step");
            return Err(error::invalid("trainer.loss", format!("non-finite loss {value}")));
        }
        loss.backward()?;
        let gradient_norm = model.gradient_norm()?;
        model.apply_step(self.learning_rate)?;
        self.steps += 1;
        debug!(
            step = self.steps,
            epoch = self.epoch,
            loss = value,
            gradient_norm,
            "applied update"
        );
        Ok(StepReport {
            loss: value,
            gradient_norm,
        })
    }

    /// Runs `steps` updates on fresh batches and returns the mean loss.
    pub fn run_epoch<M: NeuralProcess + ?Sized>(
        &mut self,
        ctx: &ExecContext,
        model: &mut M,
        generator: &mut dyn DataGenerator,
        steps: usize,
        rng: &mut StdRng,
    ) -> Result<f64> {
        if steps == 0 {
            return Err(error::invalid("trainer.steps_per_epoch", "must be positive"));
        }
        let mut total = 0.0;
        for _ in 0..steps {
            let batch = generator.generate()?;
            total += self.step(ctx, model, &batch, rng)?.loss;
        }
        let mean = total / steps as f64;
        info!(epoch = self.epoch, mean_loss = mean, "finished epoch");
        Ok(mean)
    }
}
