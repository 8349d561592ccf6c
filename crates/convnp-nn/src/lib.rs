// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Convolutional conditional and latent neural processes built on the
//! `convnp-core` tensor primitives.
//!
//! A context set is discretised onto a uniform grid by an RBF set
//! convolution, processed by a convolutional decoder, and set-convolved back
//! onto the target locations to give a predictive Gaussian.

pub mod config;
pub mod data;
pub mod decoder;
pub mod discretisation;
pub mod encoder;
pub mod io;
pub mod latent;
pub mod layers;
pub mod loss;
pub mod model;
pub mod module;
pub mod noise;
pub mod pooling;
pub mod setconv;
pub mod trainer;

pub use config::{ModelConfig, ModelKind};
pub use convnp_core::{Error, ExecContext, Result, Tensor};
pub use data::{Batch, DataGenerator};
pub use decoder::{Decoder, DecoderOptions, Prediction};
pub use discretisation::{Grid, UniformDiscretisation1d};
pub use encoder::{FunctionalRepresentation, LatentAggregator, SetConvEncoder};
pub use latent::LatentDistribution;
pub use layers::{Conv1d, ConvStack, StackGeometry};
pub use loss::{Loss, NegativeLogLikelihood, Objective};
pub use model::{build_model, ConvCnp, ConvNp, NeuralProcess};
pub use module::{Module, Parameter};
pub use noise::{NoiseKind, RidgeSchedule};
pub use pooling::PoolingPolicy;
pub use setconv::SetConv;
pub use trainer::{StepReport, Trainer, TrainerConfig};
