use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::artifacts::ArtifactDir;
use crate::builder::Builder;
use crate::cache::{FileBackend, FingerprintCache};
use crate::config::BuildConfig;
use crate::dirty::{DirtyCheck, DirtyReason, Expansion};
use crate::error::Result;
use crate::executor::{
    BuildJob, ExecCtx, ExecOptions, RunReport, execute_schedule, execute_schedule_parallel,
};
use crate::packages::{PackageTable, ensure_supported_arch};
use crate::planner;

/// Validates the target, creates the workspace dirs and loads the on-disk cache.
pub fn open_cache(cfg: &BuildConfig) -> Result<FingerprintCache> {
    ensure_supported_arch(&cfg.architecture)?;
    cfg.workspace.ensure_dirs(&cfg.architecture)?;
    let backend = FileBackend::new(cfg.workspace.fingerprint_dir());
    Ok(FingerprintCache::load(Box::new(backend)))
}

/// Versions are resolved once per run so a date version stays stable across
/// every build it feeds.
pub fn resolve_versions(table: &PackageTable, now: DateTime<Local>) -> BTreeMap<String, String> {
    table
        .iter()
        .map(|p| (p.name.clone(), p.version.resolve(now)))
        .collect()
}

#[derive(Debug, Clone)]
pub struct Plan {
    pub expansion: Expansion,
    pub order: Vec<String>,
}

/// Expands the request with dirty packages and orders the result. No builds.
pub fn plan(cfg: &BuildConfig, requested: &[String], cache: &FingerprintCache) -> Result<Plan> {
    ensure_supported_arch(&cfg.architecture)?;
    let artifacts = ArtifactDir::new(cfg.workspace.artifact_dir(&cfg.architecture));
    let check = DirtyCheck {
        workspace: &cfg.workspace,
        artifacts: &artifacts,
    };
    let expansion = check.expand(&cfg.packages, requested, cache)?;
    let order = planner::schedule(&cfg.packages, &expansion.candidates)?;
    tracing::info!(
        requested = ?expansion.requested,
        auto_added = ?expansion.auto_added,
        order = ?order,
        "build plan ready"
    );
    Ok(Plan { expansion, order })
}

#[derive(Debug, Clone)]
pub struct Outcome {
    pub plan: Plan,
    pub report: RunReport,
}

/// Plans and executes one scheduling run.
pub fn run(
    cfg: &BuildConfig,
    requested: &[String],
    builder: Arc<dyn Builder>,
    cache: &mut FingerprintCache,
    ctx: &ExecCtx,
    opts: &ExecOptions,
) -> Result<Outcome> {
    let plan = plan(cfg, requested, cache)?;
    let versions = resolve_versions(&cfg.packages, Local::now());
    let artifacts = ArtifactDir::new(cfg.workspace.artifact_dir(&cfg.architecture));
    let job = BuildJob {
        table: &cfg.packages,
        check: DirtyCheck {
            workspace: &cfg.workspace,
            artifacts: &artifacts,
        },
        architecture: &cfg.architecture,
        versions: &versions,
        builder,
    };
    let report = if opts.max_parallel > 1 {
        execute_schedule_parallel(&job, &plan.order, cache, ctx, opts)?
    } else {
        execute_schedule(&job, &plan.order, cache, ctx, opts)?
    };
    Ok(Outcome { plan, report })
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusRow {
    pub package: String,
    pub version: String,
    pub reason: DirtyReason,
    pub cached: Option<String>,
    pub current: String,
    pub artifacts: Vec<String>,
}

/// Per-package evaluation against the cache as it stands, in table order.
pub fn status(cfg: &BuildConfig, cache: &FingerprintCache) -> Result<Vec<StatusRow>> {
    ensure_supported_arch(&cfg.architecture)?;
    let artifacts = ArtifactDir::new(cfg.workspace.artifact_dir(&cfg.architecture));
    let check = DirtyCheck {
        workspace: &cfg.workspace,
        artifacts: &artifacts,
    };
    let versions = resolve_versions(&cfg.packages, Local::now());
    let mut rows = Vec::with_capacity(cfg.packages.len());
    for pkg in cfg.packages.iter() {
        let eval = check.evaluate(pkg, cache)?;
        rows.push(StatusRow {
            package: pkg.name.clone(),
            version: versions.get(&pkg.name).cloned().unwrap_or_default(),
            reason: eval.reason,
            cached: cache.get(&pkg.name).map(str::to_string),
            current: eval.fingerprint,
            artifacts: artifacts
                .matching(&pkg.name)
                .iter()
                .filter_map(|p| p.file_name())
                .map(|n| n.to_string_lossy().into_owned())
                .collect(),
        });
    }
    Ok(rows)
}
