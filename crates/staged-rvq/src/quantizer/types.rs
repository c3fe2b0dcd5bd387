//! Stage types and the output layer factory contract.

use std::fmt;

use candle_core::{Module, Result, Tensor};
use candle_nn::VarBuilder;

/// A stage output layer: maps base-transform output `(batch, features)` to
/// candidate residuals `(batch, options, *shape)`.
pub type StageLayer = Box<dyn Module + Send + Sync>;

/// Parameter name prefix of stage `index`.
///
/// Stage parameters live under `stages.{index}.bias` and
/// `stages.{index}.output.*` for as long as the quantizer exists.
#[must_use]
pub fn stage_prefix(index: usize) -> String {
    format!("stages.{}", index)
}

/// Produces a fresh, independently parameterised output layer per stage.
///
/// The `VarBuilder` is scoped to `stages.{index}.output`; every parameter the
/// layer creates through it becomes trainable state of the quantizer.
pub trait OutputLayerFactory {
    fn build(&mut self, vb: VarBuilder<'static>) -> Result<StageLayer>;
}

impl<F> OutputLayerFactory for F
where
    F: FnMut(VarBuilder<'static>) -> Result<StageLayer>,
{
    fn build(&mut self, vb: VarBuilder<'static>) -> Result<StageLayer> {
        self(vb)
    }
}

/// One round of residual quantization.
pub struct Stage {
    pub(crate) index: usize,
    pub(crate) output_layer: StageLayer,
    /// `(options, *shape)`, backed by a variable in the quantizer's `VarMap`.
    pub(crate) bias: Tensor,
}

impl Stage {
    /// Position of this stage in the stage loop.
    #[inline]
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Learned bias added to every candidate residual.
    #[inline]
    #[must_use]
    pub fn bias(&self) -> &Tensor {
        &self.bias
    }

    #[inline]
    #[must_use]
    pub fn output_layer(&self) -> &(dyn Module + Send + Sync) {
        self.output_layer.as_ref()
    }

    /// Parameter name prefix, see [`stage_prefix`].
    #[must_use]
    pub fn prefix(&self) -> String {
        stage_prefix(self.index)
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("index", &self.index)
            .field("bias_shape", &self.bias.dims())
            .finish_non_exhaustive()
    }
}
