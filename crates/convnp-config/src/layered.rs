// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Stacked configuration files: a base TOML file, a site TOML file and a
//! per-run JSON file, merged key by key with later layers winning.
//!
//! Every leaf remembers the layer that last wrote it, so callers can report
//! which hyperparameters a site or run file overrode.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::debug;

/// Stage of the stack a value came from, in merge order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConfigLayer {
    Base,
    Site,
    Run,
}

impl ConfigLayer {
    pub const ALL: [ConfigLayer; 3] = [ConfigLayer::Base, ConfigLayer::Site, ConfigLayer::Run];

    fn env_var(self) -> &'static str {
        match self {
            ConfigLayer::Base => "CONVNP_CONFIG_BASE",
            ConfigLayer::Site => "CONVNP_CONFIG_SITE",
            ConfigLayer::Run => "CONVNP_CONFIG_RUN",
        }
    }

    fn default_file(self) -> &'static str {
        match self {
            ConfigLayer::Base => "base.toml",
            ConfigLayer::Site => "site.toml",
            ConfigLayer::Run => "run.json",
        }
    }

    fn slot(self) -> usize {
        self as usize
    }
}

/// One optional file per layer. Files ending in `.json` are parsed as JSON,
/// everything else as TOML.
#[derive(Clone, Debug, Default)]
pub struct ConfigLayering {
    files: [Option<PathBuf>; 3],
}

impl ConfigLayering {
    /// Looks up `CONVNP_CONFIG_{BASE,SITE,RUN}`, falling back to the default
    /// file names under `CONVNP_CONFIG_ROOT` (or `~/.convnp`). Files that do
    /// not exist are left out.
    pub fn discover() -> Self {
        let root = std::env::var_os("CONVNP_CONFIG_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(default_root);
        let mut layering = Self::default();
        for layer in ConfigLayer::ALL {
            let path = std::env::var_os(layer.env_var())
                .map(PathBuf::from)
                .unwrap_or_else(|| root.join(layer.default_file()));
            if path.exists() {
                layering.files[layer.slot()] = Some(path);
            }
        }
        layering
    }

    pub fn with_layer<P: Into<PathBuf>>(mut self, layer: ConfigLayer, path: P) -> Self {
        self.files[layer.slot()] = Some(path.into());
        self
    }

    pub fn with_base<P: Into<PathBuf>>(self, path: P) -> Self {
        self.with_layer(ConfigLayer::Base, path)
    }

    pub fn with_site<P: Into<PathBuf>>(self, path: P) -> Self {
        self.with_layer(ConfigLayer::Site, path)
    }

    pub fn with_run<P: Into<PathBuf>>(self, path: P) -> Self {
        self.with_layer(ConfigLayer::Run, path)
    }

    pub fn path(&self, layer: ConfigLayer) -> Option<&Path> {
        self.files[layer.slot()].as_deref()
    }
}

fn default_root() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".convnp"))
        .unwrap_or_else(|| PathBuf::from("."))
}

#[derive(Debug, thiserror::Error)]
pub enum LayeredConfigError {
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse TOML {path:?}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to parse JSON {path:?}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Merged view over the configured layers.
#[derive(Clone, Debug, Default)]
pub struct LayeredConfig {
    value: Value,
    origins: BTreeMap<String, ConfigLayer>,
}

impl LayeredConfig {
    /// Reads and merges the layers in base, site, run order. Layers whose
    /// file is missing are skipped.
    pub fn load(layering: ConfigLayering) -> Result<Self, LayeredConfigError> {
        let mut config = LayeredConfig {
            value: Value::Object(Map::new()),
            origins: BTreeMap::new(),
        };
        for layer in ConfigLayer::ALL {
            let Some(path) = layering.path(layer) else {
                continue;
            };
            if !path.exists() {
                continue;
            }
            let parsed = read_layer(path)?;
            let mut prefix = Vec::new();
            overlay(&mut config.value, parsed, layer, &mut prefix, &mut config.origins);
            debug!(?layer, path = %path.display(), "applied configuration layer");
        }
        Ok(config)
    }

    /// Configuration held entirely in memory; every leaf counts as base.
    pub fn from_value(value: Value) -> Self {
        let mut config = LayeredConfig::default();
        overlay(&mut config.value, value, ConfigLayer::Base, &mut Vec::new(), &mut config.origins);
        config
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Typed view of the section at `path`, or `None` when it is absent.
    pub fn section<T>(&self, path: &[&str]) -> Result<Option<T>, serde_json::Error>
    where
        T: DeserializeOwned,
    {
        let node = path
            .iter()
            .try_fold(&self.value, |node, key| node.as_object()?.get(*key));
        node.map(|node| serde_json::from_value(node.clone())).transpose()
    }

    /// Layer that last wrote the dotted leaf `path`.
    pub fn origin(&self, path: &str) -> Option<ConfigLayer> {
        self.origins.get(path).copied()
    }

    /// Leaves under `section` written by the site or run layer, with the
    /// section prefix stripped.
    pub fn overrides(&self, section: &str) -> Vec<(&str, ConfigLayer)> {
        let prefix = format!("{section}.");
        self.origins
            .iter()
            .filter(|(_, layer)| **layer > ConfigLayer::Base)
            .filter_map(|(path, layer)| Some((path.strip_prefix(&prefix)?, *layer)))
            .collect()
    }
}

fn read_layer(path: &Path) -> Result<Value, LayeredConfigError> {
    let text = fs::read_to_string(path).map_err(|source| LayeredConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let json = |source| LayeredConfigError::Json {
        path: path.to_path_buf(),
        source,
    };
    if path.extension().is_some_and(|ext| ext == "json") {
        return serde_json::from_str(&text).map_err(json);
    }
    let table: toml::Value = toml::from_str(&text).map_err(|source| LayeredConfigError::Toml {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::to_value(table).map_err(json)
}

/// Writes `src` over `dest`. Tables merge recursively; any other value
/// replaces the slot and drops the origins recorded beneath it.
fn overlay(
    dest: &mut Value,
    src: Value,
    layer: ConfigLayer,
    path: &mut Vec<String>,
    origins: &mut BTreeMap<String, ConfigLayer>,
) {
    match src {
        Value::Object(table) => {
            if !dest.is_object() {
                forget_below(path, origins);
                *dest = Value::Object(Map::new());
            }
            let Value::Object(dest_table) = dest else {
                return;
            };
            for (key, value) in table {
                path.push(key.clone());
                let slot = dest_table.entry(key).or_insert(Value::Null);
                overlay(slot, value, layer, path, origins);
                path.pop();
            }
        }
        leaf => {
            forget_below(path, origins);
            *dest = leaf;
            if !path.is_empty() {
                origins.insert(path.join("."), layer);
            }
        }
    }
}

fn forget_below(path: &[String], origins: &mut BTreeMap<String, ConfigLayer>) {
    if path.is_empty() {
        origins.clear();
        return;
    }
    let joined = path.join(".");
    let nested = format!("{joined}.");
    origins.retain(|key, _| key != &joined && !key.starts_with(&nested));
}
