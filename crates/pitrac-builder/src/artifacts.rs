use std::fs;
use std::path::{Path, PathBuf};

/// Architecture-scoped artifact directory (`<out>/<arch>`).
///
/// Only used as an existence check; artifact contents are never verified.
#[derive(Debug, Clone)]
pub struct ArtifactDir {
    dir: PathBuf,
}

impl ArtifactDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Entries whose file name starts with the package name (`<package>*`).
    pub fn matching(&self, package: &str) -> Vec<PathBuf> {
        let Ok(rd) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut out: Vec<PathBuf> = rd
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with(package))
            .map(|e| e.path())
            .collect();
        out.sort();
        out
    }

    pub fn has_artifact(&self, package: &str) -> bool {
        !self.matching(package).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_match_scoped_to_arch_dir() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let arm = tmp.path().join("arm64");
        fs::create_dir_all(&arm).unwrap();
        fs::write(arm.join("opencv_4.11.0_arm64.deb"), b"deb").unwrap();
        fs::write(tmp.path().join("lgpio_0.2.2_arm64.deb"), b"deb").unwrap();

        let dir = ArtifactDir::new(&arm);
        assert!(dir.has_artifact("opencv"));
        assert!(!dir.has_artifact("lgpio"));
        assert_eq!(dir.matching("opencv").len(), 1);
        assert!(!ArtifactDir::new(tmp.path().join("amd64")).has_artifact("opencv"));
    }
}
