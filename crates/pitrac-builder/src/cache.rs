use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

/// Persistence for `package -> fingerprint` records.
///
/// `read_all` never fails: unreadable or malformed records are reported and
/// skipped, which makes the affected package look unbuilt.
pub trait CacheBackend: Send {
    fn read_all(&self) -> BTreeMap<String, String>;
    fn write(&self, package: &str, fingerprint: &str) -> Result<()>;
}

/// One `<package>.hash` file per package holding a single `package=hash` line.
#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entry_path(&self, package: &str) -> PathBuf {
        self.dir.join(format!("{package}.hash"))
    }

    fn read_entry(path: &Path, package: &str) -> Option<String> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "unreadable fingerprint record; treating as absent");
                return None;
            }
        };
        let line = raw.lines().map(str::trim).find(|l| !l.is_empty())?;
        let parsed = line
            .split_once('=')
            .map(|(k, v)| (k.trim(), v.trim()))
            .filter(|(k, v)| {
                *k == package && !v.is_empty() && v.chars().all(|c| c.is_ascii_hexdigit())
            });
        match parsed {
            Some((_, hash)) => Some(hash.to_ascii_lowercase()),
            None => {
                tracing::warn!(path = %path.display(), "malformed fingerprint record; treating as absent");
                None
            }
        }
    }
}

impl CacheBackend for FileBackend {
    fn read_all(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        let rd = match fs::read_dir(&self.dir) {
            Ok(rd) => rd,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(dir = %self.dir.display(), error = %e, "cannot list fingerprint cache");
                }
                return out;
            }
        };
        for entry in rd.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("hash") {
                continue;
            }
            let Some(package) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Some(hash) = Self::read_entry(&path, package) {
                out.insert(package.to_string(), hash);
            }
        }
        out
    }

    fn write(&self, package: &str, fingerprint: &str) -> Result<()> {
        let fail = |reason: String| Error::CacheWrite {
            package: package.to_string(),
            reason,
        };
        fs::create_dir_all(&self.dir)
            .map_err(|e| fail(format!("create {}: {e}", self.dir.display())))?;
        // Temp file in the same dir so the rename is a same-filesystem replace.
        let mut tmp = tempfile::Builder::new()
            .prefix(&format!(".{package}."))
            .suffix(".tmp")
            .tempfile_in(&self.dir)
            .map_err(|e| fail(format!("temp file in {}: {e}", self.dir.display())))?;
        writeln!(tmp, "{package}={fingerprint}")
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| fail(format!("write temp record: {e}")))?;
        let dest = self.entry_path(package);
        tmp.persist(&dest)
            .map_err(|e| fail(format!("replace {}: {}", dest.display(), e.error)))?;
        Ok(())
    }
}

/// In-memory backend; clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    entries: Arc<Mutex<BTreeMap<String, String>>>,
}

impl MemoryBackend {
    pub fn with_entries(entries: BTreeMap<String, String>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(entries)),
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.entries.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

impl CacheBackend for MemoryBackend {
    fn read_all(&self) -> BTreeMap<String, String> {
        self.snapshot()
    }

    fn write(&self, package: &str, fingerprint: &str) -> Result<()> {
        let mut g = self.entries.lock().map_err(|_| Error::CacheWrite {
            package: package.to_string(),
            reason: "memory cache poisoned".into(),
        })?;
        g.insert(package.to_string(), fingerprint.to_string());
        Ok(())
    }
}

/// Cache view for one scheduling run: everything is read once up front and
/// each successful build writes through to the backend.
pub struct FingerprintCache {
    backend: Box<dyn CacheBackend>,
    entries: BTreeMap<String, String>,
}

impl std::fmt::Debug for FingerprintCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FingerprintCache")
            .field("entries", &self.entries)
            .finish_non_exhaustive()
    }
}

impl FingerprintCache {
    pub fn load(backend: Box<dyn CacheBackend>) -> Self {
        let entries = backend.read_all();
        tracing::debug!(entries = entries.len(), "loaded fingerprint cache");
        Self { backend, entries }
    }

    pub fn get(&self, package: &str) -> Option<&str> {
        self.entries.get(package).map(String::as_str)
    }

    /// Persists first; the in-memory view only changes once the record is durable.
    pub fn record(&mut self, package: &str, fingerprint: &str) -> Result<()> {
        self.backend.write(package, fingerprint)?;
        self.entries
            .insert(package.to_string(), fingerprint.to_string());
        Ok(())
    }

    pub fn entries(&self) -> &BTreeMap<String, String> {
        &self.entries
    }
}
