use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde::de::DeserializeOwned;
use toml::Value;

use crate::error::{Error, Result};
use crate::packages::{PackageConfig, PackageTable, SUPPORTED_ARCH};
use crate::workspace::{WorkspaceConfig, WorkspacePaths};

/// Default builder: a buildx invocation that exports the package's
/// `/out` stage straight into the artifact directory.
pub const DEFAULT_BUILD_COMMAND: &[&str] = &[
    "docker",
    "buildx",
    "build",
    "--platform",
    "linux/{arch}",
    "--build-arg",
    "VERSION={version}",
    "--build-arg",
    "ARCH={arch}",
    "--file",
    "{root}/packages/{package}/Dockerfile",
    "--output",
    "type=local,dest={artifacts}",
    "{root}",
];

#[derive(Debug, Clone)]
pub struct ConfigDoc {
    pub path: PathBuf,
    pub value: Value,
}

impl ConfigDoc {
    pub fn empty() -> Self {
        Self {
            path: PathBuf::from("<builtin>"),
            value: Value::Table(Default::default()),
        }
    }

    pub fn value_path(&self, path: &str) -> Option<&Value> {
        let mut cur = &self.value;
        for seg in path.trim().split('.').filter(|s| !s.is_empty()) {
            cur = cur.as_table()?.get(seg)?;
        }
        Some(cur)
    }

    pub fn deserialize_path<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let Some(v) = self.value_path(path) else {
            return Ok(None);
        };
        let parsed = v
            .clone()
            .try_into()
            .map_err(|e| Error::config(format!("failed to deserialize '{path}': {e}")))?;
        Ok(Some(parsed))
    }

    /// Directory that relative workspace paths hang off.
    pub fn base_dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() && self.path.is_file() => p.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

pub fn load(path: &Path) -> Result<ConfigDoc> {
    let data = fs::read_to_string(path)
        .map_err(|e| Error::config(format!("failed to read {}: {e}", path.display())))?;
    let value: Value = toml::from_str(&data)
        .map_err(|e| Error::config(format!("TOML parse error in {}: {e}", path.display())))?;
    Ok(ConfigDoc {
        path: path.to_path_buf(),
        value,
    })
}

fn default_arch() -> String {
    SUPPORTED_ARCH.into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BuildMeta {
    #[serde(default = "default_arch")]
    pub architecture: String,
}

impl Default for BuildMeta {
    fn default() -> Self {
        Self {
            architecture: default_arch(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub timeout_secs: Option<u64>,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            command: DEFAULT_BUILD_COMMAND.iter().map(|s| s.to_string()).collect(),
            env: BTreeMap::new(),
            timeout_secs: None,
        }
    }
}

/// Fully resolved build definition.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub architecture: String,
    pub workspace: WorkspacePaths,
    pub builder: BuilderConfig,
    pub packages: PackageTable,
}

impl BuildConfig {
    pub fn from_doc(doc: &ConfigDoc) -> Result<Self> {
        let meta: BuildMeta = doc.deserialize_path("build")?.unwrap_or_default();
        let ws_cfg: WorkspaceConfig = doc.deserialize_path("workspace")?.unwrap_or_default();
        let builder: BuilderConfig = doc.deserialize_path("builder")?.unwrap_or_default();
        if builder.command.is_empty() {
            return Err(Error::config("builder.command is empty"));
        }

        let packages = match doc.deserialize_path::<Vec<PackageConfig>>("packages")? {
            Some(entries) => PackageTable::from_config(&entries)?,
            None => PackageTable::builtin(),
        };

        let workspace = WorkspacePaths::from_config(&doc.base_dir(), &ws_cfg)?;
        Ok(Self {
            architecture: meta.architecture.trim().to_string(),
            workspace,
            builder,
            packages,
        })
    }

    pub fn builtin() -> Result<Self> {
        Self::from_doc(&ConfigDoc::empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(src: &str) -> ConfigDoc {
        ConfigDoc {
            path: "inline.toml".into(),
            value: toml::from_str(src).expect("valid toml"),
        }
    }

    #[test]
    fn empty_doc_uses_builtin_table() {
        let cfg = BuildConfig::builtin().expect("builtin");
        assert_eq!(cfg.architecture, "arm64");
        assert_eq!(cfg.packages.len(), 5);
        assert_eq!(cfg.builder.command[0], "docker");
    }

    #[test]
    fn packages_keep_declared_order() {
        let cfg = BuildConfig::from_doc(&doc(
            r#"
[builder]
command = ["./build.sh", "{package}"]
timeout_secs = 60

[[packages]]
name = "zeta"
version = "1.0"
sources = ["z"]

[[packages]]
name = "alpha"
version = "date"
deps = ["zeta"]
"#,
        ))
        .expect("cfg");
        let names: Vec<_> = cfg.packages.names().collect();
        assert_eq!(names, ["zeta", "alpha"]);
        assert_eq!(cfg.builder.timeout_secs, Some(60));
    }

    #[test]
    fn rejects_missing_version() {
        let err = BuildConfig::from_doc(&doc(
            r#"
[[packages]]
name = "zeta"
"#,
        ))
        .unwrap_err();
        assert!(err.to_string().contains("has no version"), "{err}");
    }
}
