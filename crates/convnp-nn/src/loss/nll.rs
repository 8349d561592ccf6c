// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use convnp_core::backend::ExecContext;
use convnp_core::error::Result;
use convnp_core::Tensor;
use rand::rngs::StdRng;

use super::{normalised_loss, Loss, Objective};
use crate::data::Batch;
use crate::model::NeuralProcess;

/// Negated objective averaged over the batch and normalised per target point.
#[derive(Clone, Copy, Debug)]
pub struct NegativeLogLikelihood {
    objective: Objective,
}

impl NegativeLogLikelihood {
    pub fn new(objective: Objective) -> Result<Self> {
        objective.validate()?;
        Ok(Self { objective })
    }

    pub fn objective(&self) -> Objective {
        self.objective
    }
}

impl Loss for NegativeLogLikelihood {
    fn forward<M: NeuralProcess + ?Sized>(
        &mut self,
        ctx: &ExecContext,
        model: &M,
        batch: &Batch,
        rng: &mut StdRng,
    ) -> Result<Tensor> {
        let objective = model.objective(ctx, batch, self.objective, rng)?;
        normalised_loss(ctx, &objective, batch.num_targets())
    }
}
