//! Core error types for the staged residual quantizer.

use thiserror::Error;

/// Error type for every fallible quantizer operation.
///
/// # Error Categories
///
/// | Category | Variants | Recovery Strategy |
/// |----------|----------|-------------------|
/// | Input | ShapeMismatch, EmptyBatch, InvalidBatchSize | Fix caller input |
/// | Codes | StageCountMismatch, CodeOutOfRange | Fix or discard the code sequence |
/// | Collaborator | OutputShapeMismatch, NonFiniteLoss | Fix the output layer or loss function |
/// | Configuration | ConfigError | Fix configuration |
/// | Persistence | PersistenceError | Fix the file or stage factory |
/// | Tensor | TensorError | Inspect the candle error message |
///
/// Nothing here is transient: every operation is a deterministic computation,
/// so no variant is worth retrying unchanged.
#[derive(Debug, Error)]
pub enum QuantizerError {
    // === Input Errors ===
    /// Input tensor does not have the configured per-item shape.
    #[error("Shape mismatch: expected per-item shape {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Input batch holds no items.
    #[error("Empty batch: at least one item is required")]
    EmptyBatch,

    /// Chunk size passed to `reconstruct` is zero.
    #[error("Invalid batch size: {batch_size} (must be > 0)")]
    InvalidBatchSize { batch_size: usize },

    // === Code Errors ===
    /// Code sequence length does not match the number of stages.
    #[error("Stage count mismatch: quantizer has {expected} stages, codes have {actual}")]
    StageCountMismatch { expected: usize, actual: usize },

    /// A code digit falls outside `[0, options)`.
    #[error("Code out of range at item {item}, stage {stage}: {code} (options: {options})")]
    CodeOutOfRange {
        item: usize,
        stage: usize,
        code: u32,
        options: usize,
    },

    /// Tensor cannot be read as a `(batch, num_stages)` code sequence.
    #[error("Invalid code tensor: {message}")]
    InvalidCodeTensor { message: String },

    // === Collaborator Errors ===
    /// Stage output layer produced a tensor of the wrong shape.
    #[error("Output layer of stage {stage} produced {actual:?}, expected {expected:?}")]
    OutputShapeMismatch {
        stage: usize,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Loss function returned NaN or infinity.
    #[error("Non-finite loss at stage {stage}, item {item}, candidate {candidate}: {value}")]
    NonFiniteLoss {
        stage: usize,
        item: usize,
        candidate: usize,
        value: f32,
    },

    // === Configuration Errors ===
    /// Configuration file invalid or missing required fields.
    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    // === Persistence Errors ===
    /// Stored parameters do not describe a stage list this quantizer can restore.
    #[error("Persistence error for {path}: {message}")]
    PersistenceError { path: String, message: String },

    // === Tensor Errors ===
    /// Candle tensor operation failed.
    #[error("Tensor operation failed for {operation}: {message}")]
    TensorError { operation: String, message: String },
}

impl QuantizerError {
    /// Wrap a candle error with the name of the operation that failed.
    pub(crate) fn tensor(operation: &str, err: candle_core::Error) -> Self {
        QuantizerError::TensorError {
            operation: operation.to_string(),
            message: err.to_string(),
        }
    }
}

impl From<candle_core::Error> for QuantizerError {
    fn from(err: candle_core::Error) -> Self {
        QuantizerError::TensorError {
            operation: "candle".to_string(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for quantizer operations.
pub type QuantizerResult<T> = Result<T, QuantizerError>;
