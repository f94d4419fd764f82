use crate::errors::HarnessError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Disk access for harness config files and call transcripts.
pub trait FileSystem: Send + Sync {
    fn read_to_string(&self, path: &Path) -> Result<String, HarnessError>;
    /// Replace `path` with `contents`, creating parent directories.
    fn write_string(&self, path: &Path, contents: &str) -> Result<(), HarnessError>;
}

pub struct ProductionFileSystem;

impl FileSystem for ProductionFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, HarnessError> {
        std::fs::read_to_string(path)
            .map_err(|e| HarnessError::Io(format!("{}: {e}", path.display())))
    }

    fn write_string(&self, path: &Path, contents: &str) -> Result<(), HarnessError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| HarnessError::Io(e.to_string()))?;
        }
        std::fs::write(path, contents)
            .map_err(|e| HarnessError::Io(format!("{}: {e}", path.display())))
    }
}

/// In-memory files keyed by path. Paths registered with `fail_path` error on
/// every access.
#[derive(Default, Clone)]
pub struct FakeFileSystem {
    files: Arc<Mutex<HashMap<PathBuf, String>>>,
    failing: Arc<Mutex<HashMap<PathBuf, HarnessError>>>,
}

impl FakeFileSystem {
    pub fn with_file(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        let fs = Self::default();
        fs.files
            .lock()
            .expect("files lock")
            .insert(path.into(), contents.into());
        fs
    }

    pub fn fail_path(&self, path: impl Into<PathBuf>, error: HarnessError) {
        self.failing
            .lock()
            .expect("failing lock")
            .insert(path.into(), error);
    }

    pub fn contents(&self, path: &Path) -> Option<String> {
        self.files.lock().expect("files lock").get(path).cloned()
    }

    fn check(&self, path: &Path) -> Result<(), HarnessError> {
        match self.failing.lock().expect("failing lock").get(path) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

impl FileSystem for FakeFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, HarnessError> {
        self.check(path)?;
        self.contents(path)
            .ok_or_else(|| HarnessError::Io(format!("missing file {}", path.display())))
    }

    fn write_string(&self, path: &Path, contents: &str) -> Result<(), HarnessError> {
        self.check(path)?;
        self.files
            .lock()
            .expect("files lock")
            .insert(path.to_path_buf(), contents.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{FakeFileSystem, FileSystem, ProductionFileSystem};
    use crate::errors::HarnessError;
    use std::path::Path;

    #[test]
    fn fake_file_system_fails_only_registered_paths() {
        let fs = FakeFileSystem::with_file("/harness.toml", "[datastore]\n");
        fs.fail_path("/locked/calls.jsonl", HarnessError::Io("read-only".to_string()));

        assert_eq!(
            fs.write_string(Path::new("/locked/calls.jsonl"), "{}\n"),
            Err(HarnessError::Io("read-only".to_string()))
        );
        assert!(fs.contents(Path::new("/locked/calls.jsonl")).is_none());
        assert_eq!(
            fs.read_to_string(Path::new("/harness.toml")).expect("read"),
            "[datastore]\n"
        );
        assert!(matches!(
            fs.read_to_string(Path::new("/other.toml")),
            Err(HarnessError::Io(message)) if message.contains("/other.toml")
        ));
    }

    #[test]
    fn production_file_system_creates_parent_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("transcripts").join("calls.jsonl");
        ProductionFileSystem
            .write_string(&path, "{\"seq\":0}\n")
            .expect("write");
        assert_eq!(
            ProductionFileSystem.read_to_string(&path).expect("read"),
            "{\"seq\":0}\n"
        );
    }
}
