use std::path::PathBuf;

use pitrac_builder::config::{self, BuildConfig};
use pitrac_builder::packages::PackageTable;

fn repo_config(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../configs")
        .join(name)
}

#[test]
fn shipped_config_matches_builtin_table() {
    let doc = config::load(&repo_config("pitrac.toml")).expect("load");
    let cfg = BuildConfig::from_doc(&doc).expect("config");
    assert_eq!(cfg.architecture, "arm64");
    assert_eq!(cfg.builder.timeout_secs, Some(5400));
    assert_eq!(cfg.builder.env.get("DOCKER_BUILDKIT").map(String::as_str), Some("1"));

    let builtin = PackageTable::builtin();
    let shipped: Vec<_> = cfg.packages.iter().collect();
    let expected: Vec<_> = builtin.iter().collect();
    assert_eq!(shipped, expected);

    // root_dir is relative to the config file's directory.
    assert!(cfg.workspace.root.join("configs/pitrac.toml").is_file());
    assert_eq!(
        cfg.workspace.fingerprint_dir(),
        cfg.workspace.root.join("build/fingerprints")
    );
}

#[test]
fn missing_config_file_is_a_config_error() {
    let err = config::load(&repo_config("does-not-exist.toml")).unwrap_err();
    assert!(matches!(err, pitrac_builder::Error::Config(_)));
}
