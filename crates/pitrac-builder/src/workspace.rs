use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

fn default_root_dir() -> String {
    ".".into()
}

fn default_build_dir() -> String {
    "build".into()
}

fn default_out_dir() -> String {
    "out".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    #[serde(default = "default_root_dir")]
    pub root_dir: String,
    #[serde(default = "default_build_dir")]
    pub build_dir: String,
    #[serde(default = "default_out_dir")]
    pub out_dir: String,
    #[serde(default)]
    pub paths: BTreeMap<String, String>,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            build_dir: default_build_dir(),
            out_dir: default_out_dir(),
            paths: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    pub root: PathBuf,
    pub build_dir: PathBuf,
    pub out_dir: PathBuf,
    pub named_dirs: BTreeMap<String, PathBuf>,
}

impl WorkspacePaths {
    /// Lays out a workspace rooted at `root` with the default dir names.
    pub fn rooted_at(root: &Path) -> Result<Self> {
        Self::from_config(root, &WorkspaceConfig::default())
    }

    pub fn from_config(base: &Path, cfg: &WorkspaceConfig) -> Result<Self> {
        let root = join_user_path(base, &cfg.root_dir)?;
        let build_dir = join_workspace_dir(&root, &cfg.build_dir)?;
        let out_dir = join_workspace_dir(&root, &cfg.out_dir)?;

        let mut named_dirs = BTreeMap::new();
        named_dirs.insert("root".to_string(), root.clone());
        named_dirs.insert("build".to_string(), build_dir.clone());
        named_dirs.insert("out".to_string(), out_dir.clone());
        for (name, raw) in &cfg.paths {
            let key = name.trim();
            if key.is_empty()
                || !key
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            {
                return Err(Error::config(format!(
                    "workspace.paths key '{name}' is invalid (allowed: a-zA-Z0-9_-)"
                )));
            }
            if named_dirs.contains_key(key) {
                return Err(Error::config(format!(
                    "workspace.paths key '{key}' is reserved"
                )));
            }
            named_dirs.insert(key.to_string(), join_user_path(&root, raw)?);
        }
        // Package sources default to `<root>/sources` for upstream checkouts.
        named_dirs
            .entry("sources".to_string())
            .or_insert_with(|| root.join("sources"));

        Ok(Self {
            root,
            build_dir,
            out_dir,
            named_dirs,
        })
    }

    /// Resolves a package source path:
    /// - `@alias/rest` expands from the named dirs
    /// - absolute paths are used as-is
    /// - anything else is relative to the workspace root
    pub fn resolve(&self, raw: &str) -> Result<PathBuf> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::config("empty path"));
        }
        if let Some(after_at) = raw.strip_prefix('@') {
            let (alias, rest) = match after_at.split_once('/') {
                Some((a, r)) => (a, r),
                None => (after_at, ""),
            };
            let base = self.named_dirs.get(alias).ok_or_else(|| {
                let known = self.named_dirs.keys().cloned().collect::<Vec<_>>();
                Error::config(format!(
                    "unknown path alias '@{alias}' in '{raw}' (known: {})",
                    known.join(", ")
                ))
            })?;
            return Ok(if rest.is_empty() {
                base.clone()
            } else {
                base.join(rest)
            });
        }
        let pb = PathBuf::from(raw);
        Ok(if pb.is_absolute() { pb } else { self.root.join(pb) })
    }

    pub fn fingerprint_dir(&self) -> PathBuf {
        self.build_dir.join("fingerprints")
    }

    pub fn artifact_dir(&self, arch: &str) -> PathBuf {
        self.out_dir.join(arch)
    }

    pub fn ensure_dirs(&self, arch: &str) -> Result<()> {
        for dir in [self.fingerprint_dir(), self.artifact_dir(arch)] {
            fs::create_dir_all(&dir).map_err(|e| {
                Error::msg(format!("failed to create dir {}: {e}", dir.display()))
            })?;
        }
        Ok(())
    }
}

fn join_user_path(base: &Path, raw: &str) -> Result<PathBuf> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(Error::config("empty workspace path"));
    }
    let pb = PathBuf::from(raw);
    Ok(if pb.is_absolute() { pb } else { base.join(pb) })
}

fn join_workspace_dir(root: &Path, raw: &str) -> Result<PathBuf> {
    if Path::new(raw.trim())
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(Error::config(format!(
            "invalid workspace dir '{raw}' (contains '..')"
        )));
    }
    join_user_path(root, raw)
}
