// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use convnp_core::{Error, Result, Tensor};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::module::Module;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredTensor {
    shape: Vec<usize>,
    data: Vec<f64>,
}

impl StoredTensor {
    fn from_tensor(tensor: &Tensor) -> StoredTensor {
        StoredTensor {
            shape: tensor.shape(),
            data: tensor.to_vec(),
        }
    }

    fn into_tensor(self) -> Result<Tensor> {
        Tensor::from_shape_vec(&self.shape, self.data)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ModuleSnapshot {
    parameters: BTreeMap<String, StoredTensor>,
}

fn snapshot_from_state(state: &HashMap<String, Tensor>) -> ModuleSnapshot {
    let parameters = state
        .iter()
        .map(|(name, tensor)| (name.clone(), StoredTensor::from_tensor(tensor)))
        .collect();
    ModuleSnapshot { parameters }
}

fn from_snapshot(snapshot: ModuleSnapshot) -> Result<HashMap<String, Tensor>> {
    let mut state = HashMap::new();
    for (name, tensor) in snapshot.parameters {
        state.insert(name, tensor.into_tensor()?);
    }
    Ok(state)
}

fn serde_error(err: impl ToString) -> Error {
    Error::Serialization(err.to_string())
}

pub fn save_json<M: Module + ?Sized, P: AsRef<Path>>(module: &M, path: P) -> Result<()> {
    let state = module.state_dict()?;
    save_state_dict_json(&state, path)
}

pub fn load_json<M: Module + ?Sized, P: AsRef<Path>>(module: &mut M, path: P) -> Result<()> {
    let state = load_state_dict_json(path)?;
    module.load_state_dict(&state)
}

pub fn save_state_dict_json<P: AsRef<Path>>(state: &HashMap<String, Tensor>, path: P) -> Result<()> {
    let snapshot = snapshot_from_state(state);
    let file = File::create(path.as_ref())?;
    let writer = BufWriter::new(file);
    serde_json::to_writer_pretty(writer, &snapshot).map_err(serde_error)?;
    info!(path = %path.as_ref().display(), parameters = state.len(), "saved checkpoint");
    Ok(())
}

pub fn load_state_dict_json<P: AsRef<Path>>(path: P) -> Result<HashMap<String, Tensor>> {
    let file = File::open(path.as_ref())?;
    let reader = BufReader::new(file);
    let snapshot: ModuleSnapshot = serde_json::from_reader(reader).map_err(serde_error)?;
    let state = from_snapshot(snapshot)?;
    info!(path = %path.as_ref().display(), parameters = state.len(), "loaded checkpoint");
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::setconv::SetConv;

    #[test]
    fn json_round_trip_restores_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("set_conv.json");
        let original = SetConv::new("enc", 2, 0.5, true).unwrap();
        save_json(&original, &path).unwrap();

        let mut restored = SetConv::new("enc", 2, 3.0, true).unwrap();
        load_json(&mut restored, &path).unwrap();
        for (got, want) in restored.scales().iter().zip(original.scales()) {
            approx::assert_relative_eq!(*got, want, max_relative = 1e-12);
        }
    }

    #[test]
    fn loading_reports_missing_and_misshapen_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut state = HashMap::new();
        state.insert("other::log_scales".to_string(), Tensor::zeros(&[3]));
        save_state_dict_json(&state, &path).unwrap();
        let mut layer = SetConv::new("enc", 2, 1.0, true).unwrap();
        assert!(matches!(
            load_json(&mut layer, &path),
            Err(Error::MissingParameter { .. })
        ));

        state.insert("enc::log_scales".to_string(), Tensor::zeros(&[5]));
        save_state_dict_json(&state, &path).unwrap();
        assert!(load_json(&mut layer, &path).is_err());
    }

    #[test]
    fn malformed_files_are_serialization_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{\"parameters\": 3}").unwrap();
        assert!(matches!(
            load_state_dict_json(&path),
            Err(Error::Serialization(_))
        ));
        assert!(matches!(
            load_state_dict_json(dir.path().join("absent.json")),
            Err(Error::Io(_))
        ));
    }
}
