//! Chunked reconstruction tests.

use super::helpers::*;
use staged_rvq::{QuantizerConfig, QuantizerError};

#[test]
fn test_every_chunk_size_matches_unchunked() {
    init_tracing();
    let config = QuantizerConfig::new(vec![4, 2], 8).with_num_stages(4);
    let quantizer = quantizer(&config);
    let inputs = clustered_inputs(9, &[4, 2], 11);
    let expected = values(&quantizer.reconstruct(&inputs, None).expect("Reconstruct succeeds"));

    for chunk in 1..=10 {
        let chunked = quantizer
            .reconstruct(&inputs, Some(chunk))
            .expect("Chunked reconstruct succeeds");
        assert_eq!(chunked.dims(), &[9, 4, 2]);
        for (a, e) in values(&chunked).iter().zip(&expected) {
            assert!((a - e).abs() <= 1e-5, "chunk {}: {} vs {}", chunk, a, e);
        }
    }

    println!("[PASS] Chunked reconstruction matches for chunk sizes 1..=10");
}

#[test]
fn test_zero_chunk_is_rejected() {
    let config = QuantizerConfig::new(vec![4], 8).with_num_stages(1);
    let quantizer = quantizer(&config);
    let inputs = clustered_inputs(3, &[4], 2);

    let err = quantizer
        .reconstruct(&inputs, Some(0))
        .expect_err("Zero chunk must fail");
    assert!(matches!(err, QuantizerError::InvalidBatchSize { batch_size: 0 }));
}
