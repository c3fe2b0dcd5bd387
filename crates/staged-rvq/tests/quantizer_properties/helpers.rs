//! Test data and quantizer builders (real layers, seeded data).

use std::sync::{Arc, Once};

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{VarBuilder, VarMap};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use staged_rvq::layers::{FlattenProjection, LinearOutputFactory};
use staged_rvq::loss::SquaredError;
use staged_rvq::{QuantizerConfig, StagedResidualQuantizer};

pub const FEATURES: usize = 16;

static TRACING: Once = Once::new();

/// Route quantizer logs to the test output; filter with `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Inputs drawn from a mixture of two clusters so that stages have structure
/// to find.
pub fn clustered_inputs(batch: usize, shape: &[usize], seed: u64) -> Tensor {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let item_len: usize = shape.iter().product();
    let mut data = Vec::with_capacity(batch * item_len);
    for _ in 0..batch {
        let center = if rng.gen_bool(0.5) { 0.75f32 } else { -0.75 };
        for _ in 0..item_len {
            data.push(center + rng.gen_range(-0.25f32..0.25));
        }
    }
    let mut dims = vec![batch];
    dims.extend_from_slice(shape);
    Tensor::from_vec(data, dims, &Device::Cpu).expect("Valid input tensor")
}

pub fn values(tensor: &Tensor) -> Vec<f32> {
    tensor
        .flatten_all()
        .and_then(|t| t.to_vec1::<f32>())
        .expect("Readable f32 tensor")
}

pub fn base_for(shape: &[usize]) -> Arc<dyn Module + Send + Sync> {
    let base_vars = VarMap::new();
    let vb = VarBuilder::from_varmap(&base_vars, DType::F32, &Device::Cpu);
    Arc::new(FlattenProjection::new(shape, FEATURES, vb.pp("base")).expect("Valid base"))
}

pub fn quantizer_with_base(
    config: &QuantizerConfig,
    base: Arc<dyn Module + Send + Sync>,
) -> StagedResidualQuantizer {
    let mut factory = LinearOutputFactory::new(FEATURES, config.options, &config.shape)
        .expect("Valid factory");
    StagedResidualQuantizer::from_config(
        config,
        base,
        Arc::new(SquaredError),
        &mut factory,
        &Device::Cpu,
    )
    .expect("Valid quantizer")
}

pub fn quantizer(config: &QuantizerConfig) -> StagedResidualQuantizer {
    quantizer_with_base(config, base_for(&config.shape))
}

pub fn mse(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .and_then(|d| d.sqr())
        .and_then(|d| d.mean_all())
        .and_then(|d| d.to_scalar::<f32>())
        .expect("Computable mse")
}
