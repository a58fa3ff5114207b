use std::collections::BTreeSet;
use std::sync::OnceLock;

use chrono::{DateTime, Local};
use regex::Regex;
use serde::Deserialize;

use crate::error::{Error, Result};

pub const SUPPORTED_ARCH: &str = "arm64";

/// How a package's version string is produced at schedule time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionSpec {
    Fixed(String),
    /// Date-derived (`YYYY.MM.DD`), used for the application package.
    Date,
}

impl VersionSpec {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("date") {
            return Ok(Self::Date);
        }
        if !version_re().is_match(raw) {
            return Err(Error::config(format!(
                "invalid version '{raw}' (expected a Debian upstream version or \"date\")"
            )));
        }
        Ok(Self::Fixed(raw.to_string()))
    }

    pub fn resolve(&self, now: DateTime<Local>) -> String {
        match self {
            Self::Fixed(v) => v.clone(),
            Self::Date => now.format("%Y.%m.%d").to_string(),
        }
    }
}

fn version_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9][A-Za-z0-9.+~-]*$").expect("static regex"))
}

fn name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9.+-]*$").expect("static regex"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSpec {
    pub name: String,
    pub version: VersionSpec,
    /// Files or directories whose content decides whether the package is dirty.
    pub sources: Vec<String>,
    pub deps: Vec<String>,
}

impl PackageSpec {
    pub fn new(name: &str, version: VersionSpec, sources: &[&str], deps: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            version,
            sources: sources.iter().map(|s| s.to_string()).collect(),
            deps: deps.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PackageConfig {
    pub name: String,
    pub version: Option<String>,
    pub sources: Vec<String>,
    pub deps: Vec<String>,
}

/// Immutable package table. Iteration order is declaration order, which is
/// also the scheduler's tie-break order.
#[derive(Debug, Clone, Default)]
pub struct PackageTable {
    packages: Vec<PackageSpec>,
}

impl PackageTable {
    /// Builds a table without validating dependency names, so callers (and
    /// tests) can describe graphs the scheduler must reject.
    pub fn new(packages: Vec<PackageSpec>) -> Result<Self> {
        let mut seen = BTreeSet::new();
        for p in &packages {
            if !seen.insert(p.name.as_str()) {
                return Err(Error::config(format!("duplicate package '{}'", p.name)));
            }
        }
        Ok(Self { packages })
    }

    /// The five packages shipped for the Raspberry Pi 5 image.
    pub fn builtin() -> Self {
        let fixed = |v: &str| VersionSpec::Fixed(v.to_string());
        Self {
            packages: vec![
                PackageSpec::new("lgpio", fixed("0.2.2"), &["packages/lgpio"], &[]),
                PackageSpec::new("msgpack", fixed("6.1.0"), &["packages/msgpack"], &[]),
                PackageSpec::new("activemq", fixed("3.9.5"), &["packages/activemq"], &[]),
                PackageSpec::new("opencv", fixed("4.11.0"), &["packages/opencv"], &[]),
                PackageSpec::new(
                    "pitrac",
                    VersionSpec::Date,
                    &["packages/pitrac", "@sources/pitrac"],
                    &["lgpio", "msgpack", "activemq", "opencv"],
                ),
            ],
        }
    }

    pub fn from_config(entries: &[PackageConfig]) -> Result<Self> {
        if entries.is_empty() {
            return Err(Error::config("[[packages]] is empty"));
        }
        let mut packages = Vec::with_capacity(entries.len());
        for e in entries {
            let name = e.name.trim();
            if !name_re().is_match(name) {
                return Err(Error::config(format!(
                    "invalid package name '{}' (allowed: a-z0-9.+-)",
                    e.name
                )));
            }
            let version = match e.version.as_deref() {
                Some(v) => VersionSpec::parse(v)?,
                None => {
                    return Err(Error::config(format!("package '{name}' has no version")));
                }
            };
            let sources = e
                .sources
                .iter()
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(ToOwned::to_owned)
                .collect();
            let deps = e.deps.iter().map(|d| d.trim().to_string()).collect();
            packages.push(PackageSpec {
                name: name.to_string(),
                version,
                sources,
                deps,
            });
        }
        let table = Self::new(packages)?;
        table.validate_deps()?;
        Ok(table)
    }

    /// Every dependency must name a package in the table.
    pub fn validate_deps(&self) -> Result<()> {
        for p in &self.packages {
            for d in &p.deps {
                if self.get(d).is_none() {
                    return Err(Error::UnknownPackage(d.clone()));
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&PackageSpec> {
        self.packages.iter().find(|p| p.name == name)
    }

    pub fn require(&self, name: &str) -> Result<&PackageSpec> {
        self.get(name)
            .ok_or_else(|| Error::UnknownPackage(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PackageSpec> {
        self.packages.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.packages.iter().map(|p| p.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

pub fn ensure_supported_arch(arch: &str) -> Result<()> {
    if arch == SUPPORTED_ARCH {
        Ok(())
    } else {
        Err(Error::UnsupportedArchitecture(arch.to_string()))
    }
}
