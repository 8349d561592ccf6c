// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use convnp_config::LayeredConfig;
use convnp_core::error::{self, Error, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::discretisation::UniformDiscretisation1d;
use crate::layers::StackGeometry;
use crate::loss::Objective;
use crate::noise::{NoiseKind, RidgeSchedule};
use crate::pooling::PoolingPolicy;

/// Deterministic or latent-variable architecture.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    #[default]
    Deterministic,
    Latent,
}

/// Hyperparameters of a convolutional neural process, read from the `model`
/// section of the layered configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelConfig {
    pub kind: ModelKind,
    pub y_channels: usize,
    pub points_per_unit: f64,
    pub margin: f64,
    /// Grid sizes are rounded up to a multiple of this.
    pub multiple: usize,
    pub receptive_field: f64,
    pub num_layers: usize,
    pub num_channels: usize,
    pub latent_channels: usize,
    /// Latent samples drawn per prediction and per objective evaluation.
    pub num_samples: usize,
    pub noise: NoiseKind,
    pub ridge: RidgeSchedule,
    pub pooling: PoolingPolicy,
    pub initial_noise: f64,
    /// Seed for parameter initialisation; the determinism layer decides when
    /// unset.
    pub seed: Option<u64>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            kind: ModelKind::Deterministic,
            y_channels: 1,
            points_per_unit: 32.0,
            margin: 0.1,
            multiple: 1,
            receptive_field: 2.0,
            num_layers: 4,
            num_channels: 16,
            latent_channels: 16,
            num_samples: 5,
            noise: NoiseKind::Heteroscedastic,
            ridge: RidgeSchedule::default(),
            pooling: PoolingPolicy::Mean,
            initial_noise: 0.1,
            seed: None,
        }
    }
}

impl ModelConfig {
    pub fn validate(&self) -> Result<()> {
        self.discretisation().validate()?;
        self.geometry().kernel_size()?;
        let positive = [
            ("model.y_channels", self.y_channels),
            ("model.num_channels", self.num_channels),
            ("model.latent_channels", self.latent_channels),
            ("model.num_samples", self.num_samples),
        ];
        for (label, value) in positive {
            if value == 0 {
                return Err(error::invalid(label, "must be positive"));
            }
        }
        if !(self.initial_noise > 0.0) || !self.initial_noise.is_finite() {
            return Err(error::invalid(
                "model.initial_noise",
                format!("must be positive, got {}", self.initial_noise),
            ));
        }
        self.noise.validate(self.y_channels)?;
        self.ridge.validate()?;
        if self.kind == ModelKind::Latent && matches!(self.noise, NoiseKind::Correlated { .. }) {
            return Err(error::invalid(
                "model.noise",
                "correlated noise is only available for deterministic models",
            ));
        }
        Ok(())
    }

    pub fn discretisation(&self) -> UniformDiscretisation1d {
        UniformDiscretisation1d {
            points_per_unit: self.points_per_unit,
            margin: self.margin,
            multiple: self.multiple,
        }
    }

    pub fn geometry(&self) -> StackGeometry {
        StackGeometry {
            receptive_field: self.receptive_field,
            points_per_unit: self.points_per_unit,
            num_layers: self.num_layers,
            num_channels: self.num_channels,
        }
    }

    /// Objective a model of this kind trains with unless told otherwise.
    pub fn default_objective(&self) -> Objective {
        match self.kind {
            ModelKind::Deterministic => Objective::Exact,
            ModelKind::Latent => Objective::ImportanceWeighted {
                num_samples: self.num_samples,
            },
        }
    }

    /// Reads and validates the `model` section; missing sections fall back to
    /// the defaults.
    pub fn from_layered(config: &LayeredConfig) -> Result<Self> {
        let parsed: Option<ModelConfig> = config
            .section(&["model"])
            .map_err(|err| Error::Serialization(format!("model section: {err}")))?;
        let parsed = parsed.unwrap_or_default();
        parsed.validate()?;
        for (field, layer) in config.overrides("model") {
            info!(field, ?layer, "model hyperparameter overridden");
        }
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_are_valid() {
        let config = ModelConfig::default();
        config.validate().unwrap();
        assert_eq!(config.default_objective(), Objective::Exact);
    }

    #[test]
    fn reads_the_model_section() {
        let layered = LayeredConfig::from_value(json!({
            "model": {
                "kind": "latent",
                "points_per_unit": 8.0,
                "num_layers": 2,
                "pooling": "sum",
                "noise": {"kind": "fixed"},
                "ridge": {"schedule": "constant", "value": 0.001}
            }
        }));
        let config = ModelConfig::from_layered(&layered).unwrap();
        assert_eq!(config.kind, ModelKind::Latent);
        assert_eq!(config.points_per_unit, 8.0);
        assert_eq!(config.pooling, PoolingPolicy::Sum);
        assert_eq!(config.noise, NoiseKind::Fixed);
        assert_eq!(config.ridge, RidgeSchedule::Constant { value: 0.001 });
        assert_eq!(config.num_channels, 16);
        assert_eq!(
            config.default_objective(),
            Objective::ImportanceWeighted { num_samples: 5 }
        );
    }

    #[test]
    fn missing_section_uses_defaults() {
        let layered = LayeredConfig::from_value(json!({}));
        assert_eq!(ModelConfig::from_layered(&layered).unwrap(), ModelConfig::default());
    }

    #[test]
    fn rejects_invalid_values() {
        let layered = LayeredConfig::from_value(json!({"model": {"margin": -1.0}}));
        assert!(ModelConfig::from_layered(&layered).is_err());
        let layered = LayeredConfig::from_value(json!({"model": {"unknown": 1}}));
        assert!(matches!(
            ModelConfig::from_layered(&layered),
            Err(Error::Serialization(_))
        ));
        let config = ModelConfig {
            kind: ModelKind::Latent,
            noise: NoiseKind::Correlated { rank: 2 },
            ..ModelConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
