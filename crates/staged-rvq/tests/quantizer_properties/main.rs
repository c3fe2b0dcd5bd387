//! Quantizer Property Tests - End-to-end behaviour through the public API
//!
//! This test file verifies:
//! 1. Decode reproduces the encode reconstruction bit for bit
//! 2. Chunked reconstruction equals unchunked reconstruction
//! 3. Stage identity survives stage growth, training, and reload
//! 4. Per-item loss never rises when a stage can keep the reconstruction
//!
//! # Invariants
//! - Codes have shape (batch, num_stages), every digit < options
//! - Reconstructions have shape (batch, *shape)
//! - Zero stages encode to empty codes and an all-zero reconstruction

mod helpers;

mod chunking;
mod config_driven;
mod round_trip;
