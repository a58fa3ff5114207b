use std::fs;
use std::io::{ErrorKind, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::cache::FingerprintCache;
use crate::error::{Error, Result};
use crate::packages::PackageSpec;
use crate::workspace::WorkspacePaths;

/// Fingerprint of a package: its source paths in declared order, followed by
/// the *cached* fingerprints of its direct dependencies.
///
/// Dependencies are never recomputed here, so a dependent only observes an
/// upstream change once that upstream's cache entry has been rewritten.
pub fn fingerprint(
    pkg: &PackageSpec,
    ws: &WorkspacePaths,
    cache: &FingerprintCache,
) -> Result<String> {
    let mut hasher = Sha256::new();
    for raw in &pkg.sources {
        let path = ws.resolve(raw)?;
        hasher.update(path_contribution(&path)?.as_bytes());
    }
    for dep in &pkg.deps {
        if let Some(fp) = cache.get(dep) {
            hasher.update(fp.as_bytes());
        }
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hash contribution of one source path. Missing paths contribute nothing.
pub fn path_contribution(path: &Path) -> Result<String> {
    let meta = match fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(String::new()),
        Err(e) => {
            return Err(Error::msg(format!("failed to stat {}: {e}", path.display())));
        }
    };
    if meta.is_dir() {
        hash_dir(path)
    } else {
        hash_file(path)
    }
}

pub fn hash_file(path: &Path) -> Result<String> {
    let mut f = match fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(String::new()),
        Err(e) => {
            return Err(Error::msg(format!("failed to open {}: {e}", path.display())));
        }
    };
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = f
            .read(&mut buf)
            .map_err(|e| Error::msg(format!("failed to read {}: {e}", path.display())))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Order-independent directory digest: per-file digests are sorted before
/// being combined, so listing order never matters.
pub fn hash_dir(root: &Path) -> Result<String> {
    let mut digests = Vec::<String>::new();
    let walker = walkdir::WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || e.file_name() != ".git");

    for entry in walker {
        let entry = entry.map_err(|e| Error::msg(format!("walkdir error: {e}")))?;
        let ft = entry.file_type();
        if ft.is_file() {
            digests.push(hash_file(entry.path())?);
        } else if ft.is_symlink() {
            let target = fs::read_link(entry.path()).map_err(|e| {
                Error::msg(format!(
                    "failed to read link {}: {e}",
                    entry.path().display()
                ))
            })?;
            let mut hasher = Sha256::new();
            hasher.update(target.to_string_lossy().as_bytes());
            digests.push(hex::encode(hasher.finalize()));
        }
    }

    digests.sort();
    let mut hasher = Sha256::new();
    for d in &digests {
        hasher.update(d.as_bytes());
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryBackend;
    use crate::packages::VersionSpec;

    fn write(p: &Path, body: &str) {
        fs::create_dir_all(p.parent().expect("parent")).expect("mkdir");
        fs::write(p, body).expect("write");
    }

    #[test]
    fn directory_hash_ignores_creation_and_listing_order() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let a = tmp.path().join("a");
        let b = tmp.path().join("b");

        write(&a.join("Dockerfile"), "FROM debian:bookworm\n");
        write(&a.join("debian/control"), "Package: opencv\n");
        write(&a.join("debian/rules"), "#!/usr/bin/make -f\n");

        write(&b.join("debian/rules"), "#!/usr/bin/make -f\n");
        write(&b.join("debian/control"), "Package: opencv\n");
        write(&b.join("Dockerfile"), "FROM debian:bookworm\n");

        assert_eq!(hash_dir(&a).unwrap(), hash_dir(&b).unwrap());

        write(&b.join("Dockerfile"), "FROM debian:trixie\n");
        assert_ne!(hash_dir(&a).unwrap(), hash_dir(&b).unwrap());
    }

    #[test]
    fn git_metadata_is_not_hashed() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let d = tmp.path().join("src");
        write(&d.join("main.cpp"), "int main() {}\n");
        let before = hash_dir(&d).unwrap();
        write(&d.join(".git/HEAD"), "ref: refs/heads/main\n");
        assert_eq!(before, hash_dir(&d).unwrap());
    }

    #[test]
    fn missing_paths_contribute_nothing() {
        let tmp = tempfile::tempdir().expect("tempdir");
        assert_eq!(path_contribution(&tmp.path().join("nope")).unwrap(), "");
    }

    #[test]
    fn dependency_cache_entries_feed_the_fingerprint() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let ws = WorkspacePaths::rooted_at(tmp.path()).expect("ws");
        write(&tmp.path().join("packages/app/Dockerfile"), "FROM scratch\n");
        let app = PackageSpec::new("app", VersionSpec::Date, &["packages/app"], &["lib"]);

        let mut cache = FingerprintCache::load(Box::new(MemoryBackend::default()));
        let without_dep = fingerprint(&app, &ws, &cache).unwrap();
        cache.record("lib", "1111").unwrap();
        let with_dep = fingerprint(&app, &ws, &cache).unwrap();
        cache.record("lib", "2222").unwrap();
        let changed_dep = fingerprint(&app, &ws, &cache).unwrap();

        assert_ne!(without_dep, with_dep);
        assert_ne!(with_dep, changed_dep);
        assert_eq!(changed_dep, fingerprint(&app, &ws, &cache).unwrap());
    }
}
