// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

#![allow(dead_code)]

use convnp_nn::{Batch, DataGenerator, ModelConfig, ModelKind, NoiseKind, Result, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Tasks drawn from `y = sin(x)` with inputs uniform on `[-2, 2]`.
pub struct SineGenerator {
    rng: StdRng,
    pub batch_size: usize,
    pub num_context: usize,
    pub num_target: usize,
}

impl SineGenerator {
    pub fn new(seed: u64, batch_size: usize, num_context: usize, num_target: usize) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            batch_size,
            num_context,
            num_target,
        }
    }

    fn locations(&mut self, n: usize) -> Vec<f64> {
        (0..n * self.batch_size)
            .map(|_| self.rng.gen_range(-2.0..2.0))
            .collect()
    }
}

impl DataGenerator for SineGenerator {
    fn generate(&mut self) -> Result<Batch> {
        let (nc, nt, b) = (self.num_context, self.num_target, self.batch_size);
        let xc = self.locations(nc);
        let xt = self.locations(nt);
        let yc: Vec<f64> = xc.iter().map(|x| x.sin()).collect();
        let yt: Vec<f64> = xt.iter().map(|x| x.sin()).collect();
        Batch::new(
            Tensor::from_shape_vec(&[nc, 1, b], xc)?,
            Tensor::from_shape_vec(&[nc, 1, b], yc)?,
            Tensor::from_shape_vec(&[nt, 1, b], xt)?,
            Tensor::from_shape_vec(&[nt, 1, b], yt)?,
        )
    }
}

/// Small architecture that keeps the tests fast.
pub fn small_config(kind: ModelKind, noise: NoiseKind) -> ModelConfig {
    ModelConfig {
        kind,
        noise,
        points_per_unit: 8.0,
        margin: 0.5,
        receptive_field: 1.0,
        num_layers: 2,
        num_channels: 8,
        latent_channels: 4,
        num_samples: 3,
        seed: Some(17),
        ..ModelConfig::default()
    }
}
