//! Stage parameter persistence (save/load) via safetensors.
//!
//! Every variable in the quantizer's `VarMap` is written under its name, so
//! stage `i` is stored as `stages.{i}.bias` plus `stages.{i}.output.*`.
//! Loading counts the stored stages, grows the stage list to match, and
//! restores values in place, so existing stage tensors keep their identity.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use candle_core::{Device, Module, Tensor, Var};
use candle_nn::VarMap;
use tracing::{info, warn};

use super::encoder::StagedResidualQuantizer;
use super::types::{stage_prefix, OutputLayerFactory};
use crate::config::QuantizerConfig;
use crate::error::{QuantizerError, QuantizerResult};
use crate::loss::ReconstructionLoss;

fn persistence_error(path: &Path, message: impl Into<String>) -> QuantizerError {
    QuantizerError::PersistenceError {
        path: path.display().to_string(),
        message: message.into(),
    }
}

/// Number of stages stored in `tensors`, requiring indices `0..n` without gaps.
fn stored_stage_count(path: &Path, tensors: &HashMap<String, Tensor>) -> QuantizerResult<usize> {
    let indices: BTreeSet<usize> = tensors
        .keys()
        .filter_map(|name| {
            name.strip_prefix("stages.")?
                .strip_suffix(".bias")?
                .parse::<usize>()
                .ok()
        })
        .collect();

    for (expected, &found) in indices.iter().enumerate() {
        if expected != found {
            return Err(persistence_error(
                path,
                format!("stage {} missing before stored stage {}", expected, found),
            ));
        }
    }
    Ok(indices.len())
}

/// Pair every variable in `var_map` with its stored value, checking names,
/// shapes and dtypes before anything is written.
fn staged_restores(
    path: &Path,
    var_map: &VarMap,
    tensors: &HashMap<String, Tensor>,
) -> QuantizerResult<Vec<(String, Var, Tensor)>> {
    let data = var_map
        .data()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let mut names: Vec<&String> = data.keys().collect();
    names.sort();

    let mut restores = Vec::with_capacity(names.len());
    for name in names {
        let var = &data[name];
        let stored = tensors
            .get(name)
            .ok_or_else(|| persistence_error(path, format!("missing parameter {}", name)))?;
        if stored.dims() != var.dims() {
            return Err(persistence_error(
                path,
                format!(
                    "parameter {} stored with shape {:?}, expected {:?}",
                    name,
                    stored.dims(),
                    var.dims()
                ),
            ));
        }
        let value = stored
            .to_dtype(var.dtype())
            .map_err(|e| persistence_error(path, format!("failed to convert {}: {}", name, e)))?;
        restores.push((name.clone(), var.clone(), value));
    }
    Ok(restores)
}

impl StagedResidualQuantizer {
    /// Save every parameter in the quantizer's `VarMap` to a safetensors file.
    ///
    /// # Errors
    ///
    /// - `QuantizerError::PersistenceError` if writing fails
    pub fn save(&self, path: impl AsRef<Path>) -> QuantizerResult<()> {
        let path = path.as_ref();
        self.var_map
            .save(path)
            .map_err(|e| persistence_error(path, format!("failed to write parameters: {}", e)))?;

        info!(
            target: "quantizer::persistence",
            path = %path.display(),
            stages = self.num_stages(),
            "Saved quantizer parameters"
        );
        Ok(())
    }

    /// Restore stage parameters from a safetensors file written by [`save`](Self::save).
    ///
    /// Stages missing from the quantizer are added with `factory` before the
    /// values are copied in. Existing stages keep their tensors; only their
    /// values change. Every parameter is checked against the file before the
    /// first value is written, and on error the quantizer is left as it was.
    ///
    /// # Errors
    ///
    /// - `QuantizerError::PersistenceError` if the file cannot be read, stores
    ///   fewer stages than the quantizer has, has gaps in its stage indices, or
    ///   lacks a parameter the quantizer holds or stores it with another shape
    /// - `QuantizerError::ShapeMismatch` if a stored bias does not match
    ///   `(options, *shape)`
    pub fn load_stages(
        &mut self,
        path: impl AsRef<Path>,
        factory: &mut impl OutputLayerFactory,
    ) -> QuantizerResult<()> {
        let path = path.as_ref();
        let tensors = candle_core::safetensors::load(path, self.device())
            .map_err(|e| persistence_error(path, format!("failed to read parameters: {}", e)))?;

        let stored = stored_stage_count(path, &tensors)?;
        if stored < self.num_stages() {
            return Err(persistence_error(
                path,
                format!(
                    "file stores {} stages, quantizer already has {}",
                    stored,
                    self.num_stages()
                ),
            ));
        }

        let mut expected = vec![self.options()];
        expected.extend_from_slice(self.shape());
        for index in 0..stored {
            let name = format!("{}.bias", stage_prefix(index));
            let actual = tensors[&name].dims();
            if actual != expected.as_slice() {
                return Err(QuantizerError::ShapeMismatch {
                    expected,
                    actual: actual.to_vec(),
                });
            }
        }

        let current = self.num_stages();
        if stored > current {
            warn!(
                target: "quantizer::persistence",
                path = %path.display(),
                current,
                stored,
                "Adding stages to match persisted parameters"
            );
            if let Err(e) = self.add_stages(stored - current, factory) {
                self.truncate_stages(current);
                return Err(e);
            }
        }

        let restores = match staged_restores(path, &self.var_map, &tensors) {
            Ok(restores) => restores,
            Err(e) => {
                self.truncate_stages(current);
                return Err(e);
            }
        };
        for (name, var, value) in restores {
            var.set(&value).map_err(|e| {
                persistence_error(path, format!("failed to restore {}: {}", name, e))
            })?;
        }

        info!(
            target: "quantizer::persistence",
            path = %path.display(),
            stages = stored,
            "Loaded quantizer parameters"
        );
        Ok(())
    }

    /// Build a quantizer from a saved parameter file.
    ///
    /// `config.num_stages` is ignored; the stage count comes from the file.
    pub fn load(
        config: &QuantizerConfig,
        base: Arc<dyn Module + Send + Sync>,
        loss: Arc<dyn ReconstructionLoss>,
        factory: &mut impl OutputLayerFactory,
        path: impl AsRef<Path>,
        device: &Device,
    ) -> QuantizerResult<Self> {
        let mut quantizer = Self::new(config, base, loss, device)?;
        quantizer.load_stages(path, factory)?;
        Ok(quantizer)
    }
}
