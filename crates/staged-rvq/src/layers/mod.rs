//! Reference base transform and stage output layers.
//!
//! The quantizer treats both as injected collaborators; these are the plain
//! linear versions used when a caller has nothing more specific.
//!
//! ```text
//! running reconstruction (batch, *shape)
//!        |
//!        v
//!   [FlattenProjection] ---> (batch, features)   shared by every stage
//!        |
//!        v
//!   [LinearOutputLayer] ---> (batch, options, *shape)   one per stage
//! ```


use candle_core::{Module, Result, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::error::{QuantizerError, QuantizerResult};
use crate::quantizer::{OutputLayerFactory, StageLayer};

fn check_nonzero(name: &str, value: usize) -> QuantizerResult<()> {
    if value == 0 {
        return Err(QuantizerError::ConfigError {
            message: format!("{} must be > 0", name),
        });
    }
    Ok(())
}

/// Base transform: flatten each item, project to `features`, then tanh.
#[derive(Debug, Clone)]
pub struct FlattenProjection {
    linear: Linear,
    in_features: usize,
    out_features: usize,
}

impl FlattenProjection {
    /// Create the projection, registering `weight` and `bias` under `vb`.
    ///
    /// # Errors
    ///
    /// - `QuantizerError::ConfigError` if the shape is empty or a size is 0
    /// - `QuantizerError::TensorError` if parameter allocation fails
    pub fn new(shape: &[usize], features: usize, vb: VarBuilder) -> QuantizerResult<Self> {
        let in_features: usize = shape.iter().product();
        if shape.is_empty() {
            return Err(QuantizerError::ConfigError {
                message: "shape must have at least one dimension".to_string(),
            });
        }
        check_nonzero("input size", in_features)?;
        check_nonzero("features", features)?;

        let linear = candle_nn::linear(in_features, features, vb)
            .map_err(|e| QuantizerError::tensor("allocate base projection", e))?;

        Ok(Self {
            linear,
            in_features,
            out_features: features,
        })
    }

    #[inline]
    #[must_use]
    pub fn in_features(&self) -> usize {
        self.in_features
    }

    #[inline]
    #[must_use]
    pub fn out_features(&self) -> usize {
        self.out_features
    }
}

impl Module for FlattenProjection {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.linear.forward(&xs.flatten_from(1)?)?.tanh()
    }
}

/// Stage output layer: Linear `features -> options * item_len`, reshaped to
/// `(batch, options, *shape)`.
#[derive(Debug, Clone)]
pub struct LinearOutputLayer {
    linear: Linear,
    options: usize,
    shape: Vec<usize>,
}

impl LinearOutputLayer {
    /// Create the layer, registering `weight` and `bias` under `vb`.
    pub fn new(
        features: usize,
        options: usize,
        shape: &[usize],
        vb: VarBuilder,
    ) -> Result<Self> {
        let item_len: usize = shape.iter().product();
        let linear = candle_nn::linear(features, options * item_len, vb)?;
        Ok(Self {
            linear,
            options,
            shape: shape.to_vec(),
        })
    }
}

impl Module for LinearOutputLayer {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let batch = xs.dim(0)?;
        let mut out_shape = Vec::with_capacity(self.shape.len() + 2);
        out_shape.push(batch);
        out_shape.push(self.options);
        out_shape.extend_from_slice(&self.shape);
        self.linear.forward(xs)?.reshape(out_shape)
    }
}

/// Builds a fresh [`LinearOutputLayer`] for every stage.
#[derive(Debug, Clone)]
pub struct LinearOutputFactory {
    features: usize,
    options: usize,
    shape: Vec<usize>,
}

impl LinearOutputFactory {
    /// # Errors
    ///
    /// - `QuantizerError::ConfigError` if any size is 0
    pub fn new(features: usize, options: usize, shape: &[usize]) -> QuantizerResult<Self> {
        check_nonzero("features", features)?;
        check_nonzero("options", options)?;
        check_nonzero("item size", shape.iter().product())?;
        Ok(Self {
            features,
            options,
            shape: shape.to_vec(),
        })
    }
}

impl OutputLayerFactory for LinearOutputFactory {
    fn build(&mut self, vb: VarBuilder<'static>) -> Result<StageLayer> {
        let layer = LinearOutputLayer::new(self.features, self.options, &self.shape, vb)?;
        Ok(Box::new(layer))
    }
}
