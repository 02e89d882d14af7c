use std::io::Write;

use pyni_runtime::{AbiWindow, RuntimeConfig, LATEST_VERSION};

#[test]
fn defaults_offer_every_version() {
    let config = RuntimeConfig::default();
    assert!(!config.debug);
    assert_eq!(config.offered_versions, (1..=LATEST_VERSION).collect::<Vec<_>>());
    assert_eq!(config.abi_window, AbiWindow::new(0, 1));
    config.validate().expect("valid");
    assert_eq!(config.offer().versions.len(), LATEST_VERSION as usize);
}

#[test]
fn toml_fills_missing_fields_with_defaults() {
    let config = RuntimeConfig::from_toml_str(
        r#"
        debug = true
        offered_versions = [1, 3]

        [abi_window]
        major = 0
        minor = 1
        "#,
    )
    .expect("parse");
    assert!(config.debug);
    assert_eq!(config.offered_versions, vec![1, 3]);
    assert_eq!(config.context_quarantine, RuntimeConfig::default().context_quarantine);
}

#[test]
fn invalid_values_are_config_errors() {
    for input in [
        "offered_versions = []",
        "offered_versions = [0]",
        "offered_versions = [9]",
        "max_struct_version = 0",
        "context_quarantine = 0",
        "buffer_quarantine = 0",
        "diagnostics_limit = 0",
    ] {
        let err = RuntimeConfig::from_toml_str(input).expect_err(input);
        assert_eq!(err.info().code, "pyni.config_invalid", "{input}");
    }
    let err = RuntimeConfig::from_toml_str("debug = \"loud\"").expect_err("type");
    assert_eq!(err.info().code, "pyni.config_parse");
}

#[test]
fn debug_override_values() {
    let base = RuntimeConfig::default();
    assert!(base.clone().apply_debug_override(Some("1")).debug);
    assert!(base.clone().apply_debug_override(Some(" ON ")).debug);
    assert!(!RuntimeConfig::debug().apply_debug_override(Some("off")).debug);
    assert!(RuntimeConfig::debug().apply_debug_override(Some("maybe")).debug);
    assert!(!base.apply_debug_override(None).debug);
}

#[test]
fn loads_from_a_file() {
    let mut file = tempfile::NamedTempFile::new().expect("tempfile");
    writeln!(file, "debug = true\nbuffer_quarantine = 4").expect("write");
    let config = RuntimeConfig::load(file.path()).expect("load");
    assert!(config.debug);
    assert_eq!(config.buffer_quarantine, 4);

    let missing = file.path().with_extension("missing");
    let err = RuntimeConfig::load(&missing).expect_err("missing");
    assert_eq!(err.info().code, "pyni.config_io");
    assert!(err.info().context.contains_key("path"));
}

#[test]
fn config_round_trips_through_json() {
    let config = RuntimeConfig::debug().with_offered_versions([2, 3]);
    let json = serde_json::to_string(&config).expect("json");
    let back: RuntimeConfig = serde_json::from_str(&json).expect("parse");
    assert_eq!(back, config);
}
