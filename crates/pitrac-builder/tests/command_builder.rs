#![cfg(unix)]

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use pitrac_builder::builder::CommandBuilder;
use pitrac_builder::config::{BuildConfig, ConfigDoc};
use pitrac_builder::executor::{ChannelSink, ExecCtx, ExecEvent, ExecOptions};
use pitrac_builder::pipeline;
use pitrac_builder::workspace::WorkspacePaths;
use pitrac_builder::{Error, Result};

fn config(root: &Path, command: &str) -> BuildConfig {
    let src = format!(
        r#"
[builder]
command = ["sh", "-c", {command:?}]
env = {{ PITRAC_TEST = "1" }}

[[packages]]
name = "lgpio"
version = "0.2.2"
sources = ["packages/lgpio"]
"#
    );
    let doc = ConfigDoc {
        path: "<mem>".into(),
        value: toml::from_str(&src).expect("valid toml"),
    };
    let mut cfg = BuildConfig::from_doc(&doc).expect("config");
    cfg.workspace = WorkspacePaths::rooted_at(root).expect("workspace");
    fs::create_dir_all(root.join("packages/lgpio")).unwrap();
    fs::write(root.join("packages/lgpio/Dockerfile"), "FROM debian\n").unwrap();
    cfg
}

fn run(cfg: &BuildConfig, timeout: Option<Duration>) -> (Result<()>, Vec<ExecEvent>) {
    let builder = Arc::new(
        CommandBuilder::from_config(&cfg.builder, cfg.workspace.root.clone()).expect("builder"),
    );
    let (tx, rx) = mpsc::channel();
    let ctx = ExecCtx::new(false, Arc::new(ChannelSink::new(tx)));
    let mut cache = pipeline::open_cache(cfg).expect("cache");
    let opts = ExecOptions {
        max_parallel: 1,
        build_timeout: timeout,
    };
    let res = pipeline::run(cfg, &[], builder, &mut cache, &ctx, &opts).map(|_| ());
    (res, rx.try_iter().collect())
}

#[test]
fn command_template_produces_the_artifact() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = config(
        tmp.path(),
        r#"echo "building $PITRAC_PACKAGE $PITRAC_TEST"; touch "{artifacts}/{package}_{version}_{arch}.deb""#,
    );
    let (res, events) = run(&cfg, None);
    res.unwrap();
    assert!(tmp.path().join("out/arm64/lgpio_0.2.2_arm64.deb").is_file());
    assert!(events.iter().any(|ev| matches!(
        ev,
        ExecEvent::BuildLog { package, line } if package == "lgpio" && line == "building lgpio 1"
    )));

    let (res, events) = run(&cfg, None);
    res.unwrap();
    assert!(!events.iter().any(|ev| matches!(ev, ExecEvent::BuildStarted { .. })));
}

#[test]
fn nonzero_exit_is_a_build_failure() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = config(tmp.path(), "echo 'no space left' >&2; exit 2");
    let (res, events) = run(&cfg, None);
    let err = res.unwrap_err();
    assert!(matches!(err, Error::BuildFailed { ref package, .. } if package == "lgpio"));
    assert!(events.iter().any(|ev| matches!(
        ev,
        ExecEvent::BuildLog { line, .. } if line == "no space left"
    )));
    assert!(!tmp.path().join("build/fingerprints/lgpio.hash").exists());
}

#[test]
fn timed_out_command_is_killed() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = config(tmp.path(), "sleep 30; touch \"{artifacts}/lgpio.deb\"");
    let start = Instant::now();
    let (res, _) = run(&cfg, Some(Duration::from_millis(200)));
    let err = res.unwrap_err();
    assert!(matches!(err, Error::BuildTimedOut { ref package, .. } if package == "lgpio"));
    assert!(start.elapsed() < Duration::from_secs(10));
    assert!(!tmp.path().join("build/fingerprints/lgpio.hash").exists());
}
