//! Staged residual quantizer implementation.
//!
//! `StagedResidualQuantizer` owns the stage list and drives the stage loop
//! shared by encode and decode:
//! - Encoding a batch to `(batch, num_stages)` codes plus its reconstruction
//! - Decoding codes back to the same reconstruction
//! - Chunked reconstruction to bound peak memory

use std::fmt;
use std::sync::Arc;

use candle_core::{DType, Device, Module, Tensor, Var};
use candle_nn::{Init, VarBuilder, VarMap};
use tracing::debug;

use super::types::{stage_prefix, OutputLayerFactory, Stage};
use crate::codes::Codes;
use crate::config::QuantizerConfig;
use crate::error::{QuantizerError, QuantizerResult};
use crate::loss::ReconstructionLoss;

/// Greedy multi-stage residual vector quantizer.
///
/// # Parameters
///
/// Every stage parameter is created through the quantizer's [`VarMap`]:
/// `stages.{i}.bias` (zero-initialised, shape `(options, *shape)`) and the
/// output layer's parameters under `stages.{i}.output`. An external training
/// loop optimises them through [`trainable_vars`](Self::trainable_vars); the
/// quantizer itself never mutates them.
///
/// # Thread Safety
///
/// The quantizer is `Send + Sync`. Encode and decode only read parameters and
/// can run from several threads at once.
pub struct StagedResidualQuantizer {
    shape: Vec<usize>,
    options: usize,
    base: Arc<dyn Module + Send + Sync>,
    loss: Arc<dyn ReconstructionLoss>,
    stages: Vec<Stage>,
    pub(super) var_map: VarMap,
    device: Device,
    dtype: DType,
    reconstruct_batch_size: Option<usize>,
}

impl StagedResidualQuantizer {
    /// Create a quantizer with no stages and a fresh parameter map.
    ///
    /// `config.num_stages` is ignored here; see [`from_config`](Self::from_config).
    ///
    /// # Errors
    ///
    /// - `QuantizerError::ConfigError` if the configuration is invalid
    pub fn new(
        config: &QuantizerConfig,
        base: Arc<dyn Module + Send + Sync>,
        loss: Arc<dyn ReconstructionLoss>,
        device: &Device,
    ) -> QuantizerResult<Self> {
        Self::with_var_map(config, base, loss, VarMap::new(), device)
    }

    /// Create a quantizer that registers its stage parameters in `var_map`.
    ///
    /// Use this when the base transform's parameters already live in a
    /// `VarMap`, so one optimiser and one file cover everything.
    ///
    /// # Errors
    ///
    /// - `QuantizerError::ConfigError` if the configuration is invalid
    pub fn with_var_map(
        config: &QuantizerConfig,
        base: Arc<dyn Module + Send + Sync>,
        loss: Arc<dyn ReconstructionLoss>,
        var_map: VarMap,
        device: &Device,
    ) -> QuantizerResult<Self> {
        config.validate()?;

        Ok(Self {
            shape: config.shape.clone(),
            options: config.options,
            base,
            loss,
            stages: Vec::new(),
            var_map,
            device: device.clone(),
            dtype: DType::F32,
            reconstruct_batch_size: config.reconstruct_batch_size,
        })
    }

    /// Create a quantizer and add `config.num_stages` stages from `factory`.
    pub fn from_config(
        config: &QuantizerConfig,
        base: Arc<dyn Module + Send + Sync>,
        loss: Arc<dyn ReconstructionLoss>,
        factory: &mut impl OutputLayerFactory,
        device: &Device,
    ) -> QuantizerResult<Self> {
        let mut quantizer = Self::new(config, base, loss, device)?;
        quantizer.add_stages(config.num_stages, factory)?;
        Ok(quantizer)
    }

    // =========================================================================
    // STAGE MANAGEMENT
    // =========================================================================

    /// Append a stage and return its index.
    ///
    /// The output layer comes from `factory`; the bias starts at zero.
    /// Existing stages and their indices are untouched. On error no
    /// parameter of the new stage stays in the `VarMap`.
    ///
    /// # Errors
    ///
    /// - `QuantizerError::TensorError` if the factory or bias allocation fails
    pub fn add_stage(&mut self, factory: &mut impl OutputLayerFactory) -> QuantizerResult<usize> {
        let index = self.stages.len();
        let vb = VarBuilder::from_varmap(&self.var_map, self.dtype, &self.device)
            .pp(stage_prefix(index));

        let built = factory
            .build(vb.pp("output"))
            .map_err(|e| QuantizerError::tensor("build stage output layer", e))
            .and_then(|layer| {
                vb.get_with_hints(self.candidate_shape(None), "bias", Init::Const(0.0))
                    .map(|bias| (layer, bias))
                    .map_err(|e| QuantizerError::tensor("allocate stage bias", e))
            });
        let (output_layer, bias) = match built {
            Ok(parts) => parts,
            Err(e) => {
                self.truncate_stages(index);
                return Err(e);
            }
        };

        self.stages.push(Stage {
            index,
            output_layer,
            bias,
        });

        debug!(
            target: "quantizer::stage",
            stage = index,
            options = self.options,
            shape = ?self.shape,
            "Added quantizer stage"
        );

        Ok(index)
    }

    /// Append `count` stages built by `factory`.
    pub fn add_stages(
        &mut self,
        count: usize,
        factory: &mut impl OutputLayerFactory,
    ) -> QuantizerResult<()> {
        for _ in 0..count {
            self.add_stage(factory)?;
        }
        Ok(())
    }

    /// Drop every stage from `len` on, along with all `stages.{i}.*`
    /// parameters with `i >= len`, including ones a failed factory call left
    /// behind.
    pub(super) fn truncate_stages(&mut self, len: usize) {
        self.stages.truncate(len);
        let mut data = self
            .var_map
            .data()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        data.retain(|name, _| {
            name.strip_prefix("stages.")
                .and_then(|rest| rest.split('.').next())
                .and_then(|index| index.parse::<usize>().ok())
                .map_or(true, |index| index < len)
        });
    }

    /// Number of stages, always the length of the stage list.
    #[inline]
    #[must_use]
    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    #[inline]
    #[must_use]
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    #[inline]
    #[must_use]
    pub fn stage(&self, index: usize) -> Option<&Stage> {
        self.stages.get(index)
    }

    /// Every variable in the parameter map, for an external optimiser.
    ///
    /// Includes base transform parameters when the map is shared through
    /// [`with_var_map`](Self::with_var_map).
    #[must_use]
    pub fn trainable_vars(&self) -> Vec<Var> {
        self.var_map.all_vars()
    }

    /// Named parameters of one stage, sorted by name.
    ///
    /// Returns an empty list for an index with no stage.
    #[must_use]
    pub fn stage_parameters(&self, index: usize) -> Vec<(String, Var)> {
        let prefix = format!("{}.", stage_prefix(index));
        let data = self
            .var_map
            .data()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut params: Vec<(String, Var)> = data
            .iter()
            .filter(|(name, _)| name.starts_with(&prefix))
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));
        params
    }

    #[inline]
    #[must_use]
    pub fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    #[inline]
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Codebook size: candidates per stage.
    #[inline]
    #[must_use]
    pub fn options(&self) -> usize {
        self.options
    }

    #[inline]
    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    #[inline]
    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    // =========================================================================
    // STAGE LOOP
    // =========================================================================

    /// Candidate reconstructions of stage `index` for every batch item.
    ///
    /// Computes `running[:, None] + output_layer(base(running)) + bias`.
    ///
    /// # Arguments
    ///
    /// * `index` - Stage index, must be `< num_stages()`
    /// * `running` - Running reconstruction `(batch, *shape)`
    ///
    /// # Returns
    ///
    /// Tensor of shape `(batch, options, *shape)`.
    ///
    /// # Panics
    ///
    /// Panics if `index >= num_stages()`.
    ///
    /// # Errors
    ///
    /// - `QuantizerError::OutputShapeMismatch` if the output layer returns the wrong shape
    /// - `QuantizerError::TensorError` if a tensor operation fails
    pub fn apply_stage(&self, index: usize, running: &Tensor) -> QuantizerResult<Tensor> {
        assert!(
            index < self.stages.len(),
            "stage index {} out of range for {} stages",
            index,
            self.stages.len()
        );
        let stage = &self.stages[index];
        let batch = running
            .dim(0)
            .map_err(|e| QuantizerError::tensor("read batch dimension", e))?;

        let base_output = self
            .base
            .forward(running)
            .map_err(|e| QuantizerError::tensor("base transform", e))?;
        let layer_output = stage
            .output_layer
            .forward(&base_output)
            .map_err(|e| QuantizerError::tensor("stage output layer", e))?;

        let expected = self.candidate_shape(Some(batch));
        if layer_output.dims() != expected.as_slice() {
            return Err(QuantizerError::OutputShapeMismatch {
                stage: index,
                expected,
                actual: layer_output.dims().to_vec(),
            });
        }

        let residuals = layer_output
            .broadcast_add(&stage.bias)
            .map_err(|e| QuantizerError::tensor("add stage bias", e))?;
        running
            .unsqueeze(1)
            .and_then(|r| r.broadcast_add(&residuals))
            .map_err(|e| QuantizerError::tensor("add residuals", e))
    }

    /// Encode a batch and return its codes with the final reconstruction.
    ///
    /// # Arguments
    ///
    /// * `inputs` - Tensor of shape `(batch, *shape)`, batch >= 1
    ///
    /// # Returns
    ///
    /// `(codes, reconstruction)`: codes of shape `(batch, num_stages)` and the
    /// reconstruction of shape `(batch, *shape)`. With zero stages the codes
    /// are empty and the reconstruction is all zeros.
    ///
    /// # Errors
    ///
    /// - `QuantizerError::ShapeMismatch` if `inputs` is not `(batch, *shape)`
    /// - `QuantizerError::EmptyBatch` if the batch is empty
    /// - `QuantizerError::NonFiniteLoss` if the loss returns NaN or infinity
    pub fn encode_with_reconstruction(&self, inputs: &Tensor) -> QuantizerResult<(Codes, Tensor)> {
        let inputs = self.prepare_inputs(inputs)?;
        let batch = inputs.dims()[0];

        debug!(
            target: "quantizer::encode",
            batch,
            stages = self.stages.len(),
            options = self.options,
            "Encoding batch"
        );

        let mut running = self.zeros(batch)?;
        let mut columns = Vec::with_capacity(self.stages.len());
        for index in 0..self.stages.len() {
            let candidates = self.apply_stage(index, &running)?;
            let losses = self
                .loss
                .pairwise(&candidates, &inputs)
                .map_err(|e| QuantizerError::tensor("reconstruction loss", e))?;
            let selected = self.select_lowest(index, batch, &losses)?;
            running = self.gather(&candidates, &selected)?;
            columns.push(selected);
        }

        Ok((Codes::from_stage_columns(batch, &columns), running))
    }

    /// Encode a batch to codes only.
    pub fn encode(&self, inputs: &Tensor) -> QuantizerResult<Codes> {
        self.encode_with_reconstruction(inputs).map(|(codes, _)| codes)
    }

    /// Reconstruct a batch from its codes.
    ///
    /// Runs the same stage loop as encode, selecting the stored digit instead
    /// of evaluating the loss.
    ///
    /// # Returns
    ///
    /// Reconstruction of shape `(batch, *shape)`.
    ///
    /// # Errors
    ///
    /// - `QuantizerError::StageCountMismatch` if codes have the wrong number of stages
    /// - `QuantizerError::CodeOutOfRange` if a digit is not in `[0, options)`
    /// - `QuantizerError::EmptyBatch` if codes hold no items
    pub fn decode(&self, codes: &Codes) -> QuantizerResult<Tensor> {
        let (batch, num_stages) = codes.shape();
        if num_stages != self.stages.len() {
            return Err(QuantizerError::StageCountMismatch {
                expected: self.stages.len(),
                actual: num_stages,
            });
        }
        if batch == 0 {
            return Err(QuantizerError::EmptyBatch);
        }
        for (item, row) in codes.rows().enumerate() {
            if let Some((stage, &code)) = row
                .iter()
                .enumerate()
                .find(|(_, &code)| code as usize >= self.options)
            {
                return Err(QuantizerError::CodeOutOfRange {
                    item,
                    stage,
                    code,
                    options: self.options,
                });
            }
        }

        debug!(
            target: "quantizer::decode",
            batch,
            stages = num_stages,
            "Decoding codes"
        );

        let mut running = self.zeros(batch)?;
        for index in 0..num_stages {
            let candidates = self.apply_stage(index, &running)?;
            let selected: Vec<u32> = codes.rows().map(|row| row[index]).collect();
            running = self.gather(&candidates, &selected)?;
        }
        Ok(running)
    }

    /// Reconstruct a batch from a `(batch, num_stages)` integer code tensor.
    pub fn decode_tensor(&self, codes: &Tensor) -> QuantizerResult<Tensor> {
        self.decode(&Codes::from_tensor(codes)?)
    }

    /// Encode and return only the reconstruction.
    ///
    /// With `batch_size = Some(k)` the batch is encoded in consecutive chunks
    /// of at most `k` items and the reconstructions are concatenated in
    /// order. The result equals the unchunked call.
    ///
    /// # Errors
    ///
    /// - `QuantizerError::InvalidBatchSize` if `batch_size == Some(0)`
    /// - any error of [`encode_with_reconstruction`](Self::encode_with_reconstruction)
    pub fn reconstruct(&self, inputs: &Tensor, batch_size: Option<usize>) -> QuantizerResult<Tensor> {
        let chunk = match batch_size {
            None => return self.encode_with_reconstruction(inputs).map(|(_, recon)| recon),
            Some(0) => return Err(QuantizerError::InvalidBatchSize { batch_size: 0 }),
            Some(chunk) => chunk,
        };

        let inputs = self.prepare_inputs(inputs)?;
        let batch = inputs.dims()[0];
        let mut parts = Vec::with_capacity(batch.div_ceil(chunk));
        let mut start = 0;
        while start < batch {
            let len = chunk.min(batch - start);
            let part = inputs
                .narrow(0, start, len)
                .map_err(|e| QuantizerError::tensor("split batch", e))?;
            parts.push(self.encode_with_reconstruction(&part)?.1);
            start += len;
        }

        debug!(
            target: "quantizer::encode",
            batch,
            chunk,
            chunks = parts.len(),
            "Reconstructed batch in chunks"
        );

        Tensor::cat(&parts, 0).map_err(|e| QuantizerError::tensor("concatenate chunks", e))
    }

    /// [`reconstruct`](Self::reconstruct) with the configured
    /// `reconstruct_batch_size`.
    pub fn reconstruct_default(&self, inputs: &Tensor) -> QuantizerResult<Tensor> {
        self.reconstruct(inputs, self.reconstruct_batch_size)
    }

    // =========================================================================
    // HELPERS
    // =========================================================================

    /// `(options, *shape)`, or `(batch, options, *shape)` with a batch.
    fn candidate_shape(&self, batch: Option<usize>) -> Vec<usize> {
        let mut dims = Vec::with_capacity(self.shape.len() + 2);
        dims.extend(batch);
        dims.push(self.options);
        dims.extend_from_slice(&self.shape);
        dims
    }

    fn batch_shape(&self, batch: usize) -> Vec<usize> {
        let mut dims = Vec::with_capacity(self.shape.len() + 1);
        dims.push(batch);
        dims.extend_from_slice(&self.shape);
        dims
    }

    fn item_len(&self) -> usize {
        self.shape.iter().product()
    }

    fn zeros(&self, batch: usize) -> QuantizerResult<Tensor> {
        Tensor::zeros(self.batch_shape(batch), self.dtype, &self.device)
            .map_err(|e| QuantizerError::tensor("allocate running reconstruction", e))
    }

    /// Validate `(batch, *shape)` and move inputs to the quantizer's device and dtype.
    fn prepare_inputs(&self, inputs: &Tensor) -> QuantizerResult<Tensor> {
        let dims = inputs.dims();
        if dims.len() != self.shape.len() + 1 || dims[1..] != self.shape[..] {
            return Err(QuantizerError::ShapeMismatch {
                expected: self.shape.clone(),
                actual: dims.get(1..).unwrap_or(&[]).to_vec(),
            });
        }
        if dims[0] == 0 {
            return Err(QuantizerError::EmptyBatch);
        }
        inputs
            .to_device(&self.device)
            .and_then(|t| t.to_dtype(self.dtype))
            .map_err(|e| QuantizerError::tensor("prepare inputs", e))
    }

    /// Per-row argmin of a `(batch, options)` loss matrix; lowest index wins ties.
    fn select_lowest(&self, stage: usize, batch: usize, losses: &Tensor) -> QuantizerResult<Vec<u32>> {
        if losses.dims() != [batch, self.options].as_slice() {
            return Err(QuantizerError::TensorError {
                operation: "reconstruction loss".to_string(),
                message: format!(
                    "expected loss matrix {:?}, got {:?}",
                    [batch, self.options],
                    losses.dims()
                ),
            });
        }
        let rows = losses
            .to_dtype(DType::F32)
            .and_then(|l| l.to_vec2::<f32>())
            .map_err(|e| QuantizerError::tensor("read loss matrix", e))?;

        rows.iter()
            .enumerate()
            .map(|(item, row)| {
                let mut best = 0usize;
                let mut best_value = f32::INFINITY;
                for (candidate, &value) in row.iter().enumerate() {
                    if !value.is_finite() {
                        return Err(QuantizerError::NonFiniteLoss {
                            stage,
                            item,
                            candidate,
                            value,
                        });
                    }
                    if candidate == 0 || value < best_value {
                        best = candidate;
                        best_value = value;
                    }
                }
                Ok(best as u32)
            })
            .collect()
    }

    /// Pick `candidates[item, selected[item]]` for every item.
    fn gather(&self, candidates: &Tensor, selected: &[u32]) -> QuantizerResult<Tensor> {
        let batch = selected.len();
        let flat: Vec<i64> = selected
            .iter()
            .enumerate()
            .map(|(item, &code)| (item * self.options + code as usize) as i64)
            .collect();

        let indices = Tensor::from_vec(flat, batch, candidates.device())
            .map_err(|e| QuantizerError::tensor("build gather indices", e))?;
        candidates
            .reshape((batch * self.options, self.item_len()))
            .and_then(|c| c.index_select(&indices, 0))
            .and_then(|picked| picked.reshape(self.batch_shape(batch)))
            .map_err(|e| QuantizerError::tensor("gather selected candidates", e))
    }
}

impl fmt::Debug for StagedResidualQuantizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagedResidualQuantizer")
            .field("shape", &self.shape)
            .field("options", &self.options)
            .field("stages", &self.stages)
            .field("device", &self.device)
            .field("dtype", &self.dtype)
            .field("reconstruct_batch_size", &self.reconstruct_batch_size)
            .finish_non_exhaustive()
    }
}
