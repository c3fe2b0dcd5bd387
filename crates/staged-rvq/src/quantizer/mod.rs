//! Staged residual vector quantizer.
//!
//! Compresses a batch of fixed-shape tensors into one small integer digit per
//! stage and reconstructs an approximation from those digits alone.
//!
//! # Algorithm
//!
//! 1. Start from an all-zero running reconstruction
//! 2. For each stage, run the shared base transform on the running
//!    reconstruction and the stage's output layer on that, add the stage bias,
//!    and add the result to the running reconstruction: one candidate per
//!    codebook entry
//! 3. Encode picks the candidate with the lowest loss against the input
//!    (lowest index on ties); decode picks the stored digit
//! 4. The picked candidate becomes the running reconstruction
//!
//! Encode and decode share steps 1, 2 and 4, so decoding the codes of an input
//! reproduces the reconstruction computed while encoding it, stage by stage.
//!
//! # Module Organization
//!
//! - `types` - `Stage`, output layer factory trait, parameter naming
//! - `encoder` - `StagedResidualQuantizer` and the shared stage loop
//! - `persistence` - Stage parameter save/load via safetensors
//! - `tests` - Test suite

pub mod encoder;
mod persistence;
pub mod types;

#[cfg(test)]
mod tests;

pub use encoder::StagedResidualQuantizer;
pub use types::{stage_prefix, OutputLayerFactory, Stage, StageLayer};
