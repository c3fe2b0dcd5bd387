//! Staged residual vector quantization on Candle tensors.
//!
//! This crate compresses batches of fixed-shape tensors into short sequences
//! of small integer codes, one digit per stage, and reconstructs an
//! approximation from the codes alone. Each stage proposes `options`
//! candidate reconstructions from the current one; encode keeps the candidate
//! closest to the input, decode keeps the stored digit.
//!
//! # Architecture
//!
//! - **quantizer**: `StagedResidualQuantizer`, stages, persistence
//! - **codes**: `Codes`, the `(batch, num_stages)` digit matrix
//! - **loss**: Reconstruction losses that rank candidates
//! - **layers**: Linear base transform and stage output layers
//! - **config**: TOML configuration with environment overrides
//! - **error**: `QuantizerError` and `QuantizerResult`
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use candle_core::{DType, Device, Tensor};
//! use candle_nn::{VarBuilder, VarMap};
//! use staged_rvq::layers::{FlattenProjection, LinearOutputFactory};
//! use staged_rvq::loss::SquaredError;
//! use staged_rvq::{QuantizerConfig, QuantizerResult, StagedResidualQuantizer};
//!
//! fn example() -> QuantizerResult<()> {
//!     let device = Device::Cpu;
//!     let config = QuantizerConfig::new(vec![4], 8).with_num_stages(3);
//!
//!     let base_vars = VarMap::new();
//!     let vb = VarBuilder::from_varmap(&base_vars, DType::F32, &device);
//!     let base = FlattenProjection::new(&config.shape, 16, vb.pp("base"))?;
//!     let mut factory = LinearOutputFactory::new(16, config.options, &config.shape)?;
//!
//!     let quantizer = StagedResidualQuantizer::from_config(
//!         &config,
//!         Arc::new(base),
//!         Arc::new(SquaredError),
//!         &mut factory,
//!         &device,
//!     )?;
//!
//!     let inputs = Tensor::ones((2, 4), DType::F32, &device)?;
//!     let (codes, reconstruction) = quantizer.encode_with_reconstruction(&inputs)?;
//!     assert_eq!(codes.shape(), (2, 3));
//!     assert_eq!(reconstruction.dims(), &[2, 4]);
//!
//!     let decoded = quantizer.decode(&codes)?;
//!     assert_eq!(decoded.to_vec2::<f32>()?, reconstruction.to_vec2::<f32>()?);
//!     Ok(())
//! }
//! # example().unwrap();
//! ```

pub mod codes;
pub mod config;
pub mod error;
pub mod layers;
pub mod loss;
pub mod quantizer;

// Re-exports for convenience
pub use codes::Codes;
pub use config::QuantizerConfig;
pub use error::{QuantizerError, QuantizerResult};
pub use loss::{AbsoluteError, PairwiseFn, ReconstructionLoss, SquaredError};
pub use quantizer::{stage_prefix, OutputLayerFactory, Stage, StageLayer, StagedResidualQuantizer};
