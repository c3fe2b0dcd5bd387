//! Encode/decode round trip tests.

use super::helpers::*;
use staged_rvq::{Codes, QuantizerConfig, QuantizerError};

/// Decode must rebuild exactly the reconstruction encode returned.
#[test]
fn test_round_trip_is_bit_exact() {
    init_tracing();
    for (shape, options, stages) in [
        (vec![8], 16, 4),
        (vec![3, 4], 8, 3),
        (vec![2, 2, 2], 4, 5),
    ] {
        let config = QuantizerConfig::new(shape.clone(), options).with_num_stages(stages);
        let quantizer = quantizer(&config);
        let inputs = clustered_inputs(12, &shape, 7);

        let (codes, recon) = quantizer
            .encode_with_reconstruction(&inputs)
            .expect("Encode succeeds");
        let decoded = quantizer.decode(&codes).expect("Decode succeeds");

        let recon_bits: Vec<u32> = values(&recon).iter().map(|v| v.to_bits()).collect();
        let decoded_bits: Vec<u32> = values(&decoded).iter().map(|v| v.to_bits()).collect();
        assert_eq!(recon_bits, decoded_bits, "shape {:?}", shape);
    }

    println!("[PASS] Decode reproduces encode reconstruction bit for bit");
}

#[test]
fn test_codes_survive_serialization() {
    let config = QuantizerConfig::new(vec![6], 8).with_num_stages(3);
    let quantizer = quantizer(&config);
    let inputs = clustered_inputs(5, &[6], 3);
    let (codes, recon) = quantizer
        .encode_with_reconstruction(&inputs)
        .expect("Encode succeeds");

    let json = serde_json::to_string(&codes).expect("Serializable codes");
    let restored: Codes = serde_json::from_str(&json).expect("Deserializable codes");

    assert_eq!(restored, codes);
    assert_eq!(
        values(&quantizer.decode(&restored).expect("Decode succeeds")),
        values(&recon)
    );
}

#[test]
fn test_zero_stage_quantizer() {
    let config = QuantizerConfig::new(vec![2, 3], 4);
    let quantizer = quantizer(&config);
    let inputs = clustered_inputs(4, &[2, 3], 1);

    let (codes, recon) = quantizer
        .encode_with_reconstruction(&inputs)
        .expect("Encode succeeds");
    assert_eq!(codes.shape(), (4, 0));
    assert!(values(&recon).iter().all(|&v| v == 0.0));
    assert!(values(&quantizer.decode(&codes).expect("Decode succeeds"))
        .iter()
        .all(|&v| v == 0.0));
}

#[test]
fn test_codes_from_other_quantizer_are_rejected() {
    let short = quantizer(&QuantizerConfig::new(vec![4], 8).with_num_stages(2));
    let long = quantizer(&QuantizerConfig::new(vec![4], 8).with_num_stages(3));
    let codes = short
        .encode(&clustered_inputs(2, &[4], 5))
        .expect("Encode succeeds");

    assert!(matches!(
        long.decode(&codes),
        Err(QuantizerError::StageCountMismatch {
            expected: 3,
            actual: 2
        })
    ));
}

#[test]
fn test_truncated_payload_never_reaches_decode() {
    let config = QuantizerConfig::new(vec![4], 8).with_num_stages(2);
    let quantizer = quantizer(&config);
    let codes = quantizer
        .encode(&clustered_inputs(3, &[4], 13))
        .expect("Encode succeeds");

    let mut json: serde_json::Value = serde_json::to_value(&codes).expect("Serializable codes");
    json["digits"] = serde_json::json!([0]);
    assert!(serde_json::from_value::<Codes>(json).is_err());
}
