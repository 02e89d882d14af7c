use std::io::Write;
use std::path::{Path, PathBuf};

use pyni_core::LayoutKind;
use pyni_host::{
    compute_manifest_hash, from_json_slice, load_extension_manifest, resolve_library_path,
    to_canonical_json_bytes, ExtensionManifest,
};

fn manifest() -> ExtensionManifest {
    ExtensionManifest {
        name: "fastmath".into(),
        version: "0.3.1".into(),
        library: PathBuf::from("libfastmath.so"),
        requested_vtable_version: 2,
        layout: LayoutKind::Universal,
        license: "MIT".into(),
        description: Some("vectorised helpers".into()),
    }
}

#[test]
fn manifest_roundtrip_is_stable() {
    let manifest = manifest();
    manifest.validate().expect("valid manifest");
    let toml = toml::to_string(&manifest).expect("serialize");
    let parsed: ExtensionManifest = toml::from_str(&toml).expect("parse");
    assert_eq!(manifest, parsed);
    let bytes = to_canonical_json_bytes(&manifest).expect("json");
    let parsed_json: ExtensionManifest = from_json_slice(&bytes).expect("roundtrip");
    assert_eq!(parsed_json, manifest);
    assert_eq!(
        compute_manifest_hash(&manifest).expect("hash"),
        compute_manifest_hash(&parsed).expect("hash")
    );
}

#[test]
fn canonical_json_sorts_keys() {
    let bytes = to_canonical_json_bytes(&manifest()).expect("json");
    let text = String::from_utf8(bytes).expect("utf8");
    let description = text.find("\"description\"").expect("description");
    let version = text.find("\"version\"").expect("version");
    assert!(description < version);
    assert!(text.contains("\"layout\":\"universal\""));
}

#[test]
fn layout_defaults_to_universal() {
    let parsed: ExtensionManifest = toml::from_str(
        r#"
        name = "plain"
        version = "1.0.0"
        library = "libplain.so"
        requested_vtable_version = 1
        license = "MIT"
        "#,
    )
    .expect("parse");
    assert_eq!(parsed.layout, LayoutKind::Universal);
    assert_eq!(parsed.description, None);
}

#[test]
fn incomplete_manifests_are_rejected() {
    let cases: [(fn(&mut ExtensionManifest), &str); 5] = [
        (|m| m.name = " ".into(), "pyni_host.manifest_name"),
        (|m| m.version.clear(), "pyni_host.manifest_version"),
        (|m| m.library = PathBuf::new(), "pyni_host.manifest_library"),
        (|m| m.requested_vtable_version = 0, "pyni_host.manifest_vtable_version"),
        (|m| m.license.clear(), "pyni_host.manifest_license"),
    ];
    for (break_it, code) in cases {
        let mut manifest = manifest();
        break_it(&mut manifest);
        let err = manifest.validate().expect_err(code);
        assert_eq!(err.info().code, code);
    }
}

#[test]
fn manifests_load_from_disk() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("extension.toml");
    let mut file = std::fs::File::create(&path).expect("create");
    file.write_all(toml::to_string(&manifest()).expect("toml").as_bytes())
        .expect("write");

    let loaded = load_extension_manifest(&path).expect("load");
    assert_eq!(loaded, manifest());
    assert_eq!(
        resolve_library_path(&path, &loaded),
        dir.path().join("libfastmath.so")
    );

    let mut absolute = loaded.clone();
    absolute.library = dir.path().join("elsewhere.so");
    assert_eq!(resolve_library_path(&path, &absolute), absolute.library);
    assert_eq!(
        resolve_library_path(Path::new("extension.toml"), &loaded),
        PathBuf::from("libfastmath.so")
    );
}

#[test]
fn unreadable_manifests_report_their_path() {
    let dir = tempfile::tempdir().expect("tempdir");
    let missing = dir.path().join("missing.toml");
    let err = load_extension_manifest(&missing).expect_err("missing");
    assert_eq!(err.info().code, "pyni_host.read_manifest");

    let broken = dir.path().join("broken.toml");
    std::fs::write(&broken, "name = 3").expect("write");
    let err = load_extension_manifest(&broken).expect_err("broken");
    assert_eq!(err.info().code, "pyni_host.parse_manifest");
    assert!(err.info().context.contains_key("path"));

    let invalid = dir.path().join("invalid.toml");
    let mut manifest = manifest();
    manifest.license.clear();
    std::fs::write(&invalid, toml::to_string(&manifest).expect("toml")).expect("write");
    let err = load_extension_manifest(&invalid).expect_err("invalid");
    assert_eq!(err.info().code, "pyni_host.manifest_license");
}
