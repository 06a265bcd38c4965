//! File system utils for the deployment registry.

use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::Context;
use fs2::FileExt;
use serde::{Serialize, de::DeserializeOwned};

const LOCK_FILE: &str = ".lock";

/// Exclusive or shared advisory lock on a directory, released on drop.
#[derive(Debug)]
pub struct DirLock {
    file: File,
    path: PathBuf,
}

impl Drop for DirLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(err = ?e, path = %self.path.display(), "Failed to release lock");
        }
    }
}

/// Reads and writes JSON artifacts under one directory.
///
/// Writes go through a temporary file and a rename, so a reader never sees a
/// partially written artifact even if the process dies mid-write.
#[derive(Debug, Clone)]
pub struct ArtifactPersister {
    root: PathBuf,
}

impl ArtifactPersister {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Create the directory if it doesn't exist.
    pub fn ensure_dir(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("Failed to create directory {}", self.root.display()))?;
        tracing::trace!(path = %self.root.display(), "Ensured directory");
        Ok(())
    }

    /// Block until the directory lock is held exclusively.
    pub fn lock_exclusive(&self) -> anyhow::Result<DirLock> {
        self.lock(true)
    }

    /// Block until the directory lock is held in shared mode.
    pub fn lock_shared(&self) -> anyhow::Result<DirLock> {
        self.lock(false)
    }

    fn lock(&self, exclusive: bool) -> anyhow::Result<DirLock> {
        self.ensure_dir()?;
        let path = self.root.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open lock file {}", path.display()))?;

        if exclusive {
            FileExt::lock_exclusive(&file)
        } else {
            FileExt::lock_shared(&file)
        }
        .with_context(|| format!("Failed to lock {}", path.display()))?;

        Ok(DirLock { file, path })
    }

    /// Atomically replace `name` with `content`.
    pub fn write_atomic(&self, name: &str, content: &[u8]) -> anyhow::Result<()> {
        self.ensure_dir()?;
        let target = self.root.join(name);
        let tmp = self.root.join(format!(".{name}.tmp"));

        {
            let mut file = File::create(&tmp)
                .with_context(|| format!("Failed to create {}", tmp.display()))?;
            file.write_all(content)
                .with_context(|| format!("Failed to write {}", tmp.display()))?;
            file.sync_all()
                .with_context(|| format!("Failed to sync {}", tmp.display()))?;
        }

        fs::rename(&tmp, &target).with_context(|| {
            format!("Failed to move {} to {}", tmp.display(), target.display())
        })?;

        tracing::trace!(path = %target.display(), bytes = content.len(), "Wrote file");
        Ok(())
    }

    pub fn write_json<T: Serialize>(&self, name: &str, value: &T) -> anyhow::Result<()> {
        let content = serde_json::to_vec_pretty(value)
            .with_context(|| format!("Failed to serialize {name}"))?;
        self.write_atomic(name, &content)
    }

    pub fn read_string(&self, name: &str) -> anyhow::Result<Option<String>> {
        let path = self.root.join(name);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    /// Read and parse `name`, `None` if it doesn't exist.
    pub fn read_json<T: DeserializeOwned>(&self, name: &str) -> anyhow::Result<Option<T>> {
        let Some(content) = self.read_string(name)? else {
            return Ok(None);
        };
        let value = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", self.root.join(name).display()))?;
        Ok(Some(value))
    }

    /// Names of the visible `.json` files in the directory, sorted.
    pub fn list_json(&self) -> anyhow::Result<Vec<String>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read directory {}", self.root.display()));
            }
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.ends_with(".json") && !name.starts_with('.') {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Remove `name`, ignoring files that are already gone.
    pub fn remove(&self, name: &str) -> anyhow::Result<()> {
        let path = self.root.join(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
        }
    }
}
