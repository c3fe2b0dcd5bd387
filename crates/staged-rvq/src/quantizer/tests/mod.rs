//! Tests for the staged residual quantizer.
//!
//! Test modules:
//! - `stage_tests` - Stage creation, identity, apply_stage
//! - `encode_tests` - Candidate selection, shapes, input validation
//! - `decode_tests` - Decode consistency and code validation
//! - `reconstruct_tests` - Chunked reconstruction
//! - `persistence_tests` - Parameter save/load
//! - `training_tests` - Gradient flow to stage parameters


use std::sync::Arc;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{VarBuilder, VarMap};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::config::QuantizerConfig;
use crate::layers::{FlattenProjection, LinearOutputFactory};
use crate::loss::SquaredError;
use crate::quantizer::{StageLayer, StagedResidualQuantizer};

/// Base transform feature width used by the linear test quantizers.
pub(super) const FEATURES: usize = 8;

pub(super) fn batch_dims(batch: usize, shape: &[usize]) -> Vec<usize> {
    let mut dims = vec![batch];
    dims.extend_from_slice(shape);
    dims
}

/// Uniform `[-1, 1)` inputs of shape `(batch, *shape)` from a fixed seed.
pub(super) fn seeded_inputs(batch: usize, shape: &[usize], seed: u64) -> Tensor {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let len = batch * shape.iter().product::<usize>();
    let data: Vec<f32> = (0..len).map(|_| rng.gen_range(-1.0..1.0)).collect();
    Tensor::from_vec(data, batch_dims(batch, shape), &Device::Cpu).unwrap()
}

pub(super) fn flat_values(tensor: &Tensor) -> Vec<f32> {
    tensor.flatten_all().unwrap().to_vec1::<f32>().unwrap()
}

/// Linear base transform with its parameters in a separate map.
pub(super) fn linear_base(shape: &[usize]) -> Arc<dyn Module + Send + Sync> {
    let base_vars = VarMap::new();
    let vb = VarBuilder::from_varmap(&base_vars, DType::F32, &Device::Cpu);
    Arc::new(FlattenProjection::new(shape, FEATURES, vb.pp("base")).unwrap())
}

pub(super) fn linear_quantizer_with_base(
    base: Arc<dyn Module + Send + Sync>,
    shape: &[usize],
    options: usize,
    stages: usize,
) -> StagedResidualQuantizer {
    let config = QuantizerConfig::new(shape.to_vec(), options).with_num_stages(stages);
    let mut factory = LinearOutputFactory::new(FEATURES, options, shape).unwrap();
    StagedResidualQuantizer::from_config(
        &config,
        base,
        Arc::new(SquaredError),
        &mut factory,
        &Device::Cpu,
    )
    .unwrap()
}

/// Quantizer with a linear base and `stages` randomly initialised linear stages.
pub(super) fn linear_quantizer(
    shape: &[usize],
    options: usize,
    stages: usize,
) -> StagedResidualQuantizer {
    linear_quantizer_with_base(linear_base(shape), shape, options, stages)
}

/// Base transform that only flattens each item.
pub(super) fn identity_base() -> Arc<dyn Module + Send + Sync> {
    Arc::new(|x: &Tensor| x.flatten_from(1))
}

/// Output layer that ignores its input and returns `values` `(options, *shape)`
/// for every batch item.
pub(super) fn fixed_residuals(values: Tensor) -> StageLayer {
    Box::new(move |x: &Tensor| {
        let dims = batch_dims(x.dim(0)?, values.dims());
        values.unsqueeze(0)?.broadcast_as(dims)?.contiguous()
    })
}

/// Quantizer whose stage `i` proposes the fixed residuals `stage_values[i]`.
pub(super) fn fixed_quantizer(
    shape: &[usize],
    options: usize,
    stage_values: Vec<Tensor>,
) -> StagedResidualQuantizer {
    let config = QuantizerConfig::new(shape.to_vec(), options);
    let count = stage_values.len();
    let mut remaining = stage_values.into_iter();
    let mut factory = move |_vb: VarBuilder<'static>| -> candle_core::Result<StageLayer> {
        let values = remaining
            .next()
            .ok_or_else(|| candle_core::Error::Msg("no fixed stage left".to_string()))?;
        Ok(fixed_residuals(values))
    };

    let mut quantizer = StagedResidualQuantizer::new(
        &config,
        identity_base(),
        Arc::new(SquaredError),
        &Device::Cpu,
    )
    .unwrap();
    quantizer.add_stages(count, &mut factory).unwrap();
    quantizer
}
