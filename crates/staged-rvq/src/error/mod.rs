//! Error types for the staged residual quantizer.

mod types;


pub use types::{QuantizerError, QuantizerResult};
