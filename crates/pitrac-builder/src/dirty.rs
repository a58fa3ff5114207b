use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;

use crate::artifacts::ArtifactDir;
use crate::cache::FingerprintCache;
use crate::error::Result;
use crate::fingerprint::fingerprint;
use crate::packages::{PackageSpec, PackageTable};
use crate::workspace::WorkspacePaths;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DirtyReason {
    NoCacheEntry,
    FingerprintChanged,
    ArtifactMissing,
    Clean,
}

impl DirtyReason {
    pub fn is_dirty(self) -> bool {
        self != Self::Clean
    }
}

impl fmt::Display for DirtyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NoCacheEntry => "no_cache_entry",
            Self::FingerprintChanged => "fingerprint_changed",
            Self::ArtifactMissing => "artifact_missing",
            Self::Clean => "clean",
        })
    }
}

#[derive(Debug, Clone)]
pub struct Evaluation {
    pub reason: DirtyReason,
    /// Fingerprint computed for this evaluation; recorded after a successful build.
    pub fingerprint: String,
}

/// Everything the detector reads: sources on disk, the cache, the artifact dir.
pub struct DirtyCheck<'a> {
    pub workspace: &'a WorkspacePaths,
    pub artifacts: &'a ArtifactDir,
}

impl DirtyCheck<'_> {
    pub fn evaluate(&self, pkg: &PackageSpec, cache: &FingerprintCache) -> Result<Evaluation> {
        let current = fingerprint(pkg, self.workspace, cache)?;
        let reason = match cache.get(&pkg.name) {
            None => DirtyReason::NoCacheEntry,
            Some(cached) if cached != current => DirtyReason::FingerprintChanged,
            Some(_) if !self.artifacts.has_artifact(&pkg.name) => DirtyReason::ArtifactMissing,
            Some(_) => DirtyReason::Clean,
        };
        Ok(Evaluation {
            reason,
            fingerprint: current,
        })
    }

    pub fn needs_rebuild(&self, pkg: &PackageSpec, cache: &FingerprintCache) -> Result<bool> {
        Ok(self.evaluate(pkg, cache)?.reason.is_dirty())
    }

    /// Adds every independently dirty package to the requested set.
    ///
    /// This is one pass over the table against the cache as it stands now. A
    /// dependent of an unrequested dirty package is not pulled in: its
    /// fingerprint only moves once the dependency's cache entry is rewritten,
    /// so it shows up as dirty on the following run.
    pub fn expand(
        &self,
        table: &PackageTable,
        requested: &[String],
        cache: &FingerprintCache,
    ) -> Result<Expansion> {
        let mut wanted = BTreeSet::new();
        for name in requested {
            table.require(name)?;
            wanted.insert(name.clone());
        }

        let mut auto_added = Vec::new();
        for pkg in table.iter() {
            if wanted.contains(&pkg.name) {
                continue;
            }
            let eval = self.evaluate(pkg, cache)?;
            if eval.reason.is_dirty() {
                tracing::info!(package = %pkg.name, reason = %eval.reason, "adding dirty package");
                auto_added.push(pkg.name.clone());
            }
        }

        let mut candidates = wanted.clone();
        candidates.extend(auto_added.iter().cloned());
        Ok(Expansion {
            requested: wanted,
            auto_added,
            candidates,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct Expansion {
    pub requested: BTreeSet<String>,
    /// Dirty packages pulled in without being requested, in table order.
    pub auto_added: Vec<String>,
    pub candidates: BTreeSet<String>,
}
