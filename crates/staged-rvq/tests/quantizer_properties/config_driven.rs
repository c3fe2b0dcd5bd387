//! Config file, environment override, and persistence workflow tests.

use std::io::Write;
use std::sync::Arc;

use candle_core::Device;
use serial_test::serial;
use staged_rvq::layers::LinearOutputFactory;
use staged_rvq::loss::SquaredError;
use staged_rvq::{QuantizerConfig, StagedResidualQuantizer};
use tempfile::{NamedTempFile, TempDir};

use super::helpers::*;

const CONFIG: &str = r#"
shape = [2, 4]
options = 8
num_stages = 3
reconstruct_batch_size = 4
"#;

#[test]
fn test_quantizer_from_config_file() {
    let mut file = NamedTempFile::new().expect("Temp file");
    file.write_all(CONFIG.as_bytes()).expect("Write config");

    let config = QuantizerConfig::from_file(file.path()).expect("Valid config file");
    let quantizer = quantizer(&config);
    assert_eq!(quantizer.num_stages(), 3);
    assert_eq!(quantizer.shape(), &[2, 4]);

    let inputs = clustered_inputs(10, &[2, 4], 29);
    let chunked = quantizer.reconstruct_default(&inputs).expect("Reconstruct succeeds");
    assert_eq!(chunked.dims(), &[10, 2, 4]);
}

#[test]
#[serial]
fn test_env_overrides_stage_count() {
    std::env::set_var("RVQ_NUM_STAGES", "5");
    let config = QuantizerConfig::from_toml_str(CONFIG)
        .expect("Valid config")
        .with_env_overrides();
    std::env::remove_var("RVQ_NUM_STAGES");

    assert_eq!(config.num_stages, 5);
    assert_eq!(quantizer(&config).num_stages(), 5);
}

#[test]
fn test_save_and_load_workflow() {
    init_tracing();
    let dir = TempDir::new().expect("Temp dir");
    let path = dir.path().join("rvq.safetensors");
    let config = QuantizerConfig::from_toml_str(CONFIG).expect("Valid config");
    let base = base_for(&config.shape);

    let original = quantizer_with_base(&config, base.clone());
    original.save(&path).expect("Save succeeds");

    let inputs = clustered_inputs(6, &config.shape, 37);
    let (codes, recon) = original
        .encode_with_reconstruction(&inputs)
        .expect("Encode succeeds");

    // A stored parameter file decides the stage count.
    let fresh = config.clone().with_num_stages(0);
    let mut factory = LinearOutputFactory::new(FEATURES, fresh.options, &fresh.shape)
        .expect("Valid factory");
    let restored = StagedResidualQuantizer::load(
        &fresh,
        base,
        Arc::new(SquaredError),
        &mut factory,
        &path,
        &Device::Cpu,
    )
    .expect("Load succeeds");

    assert_eq!(restored.num_stages(), 3);
    assert_eq!(values(&restored.decode(&codes).expect("Decode succeeds")), values(&recon));
    assert!(mse(&recon, &inputs).is_finite());

    println!("[PASS] Saved quantizer decodes codes from the original");
}
