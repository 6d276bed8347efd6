/*!
 * Source Staging
 * Materializes source text as an executable script in a private temp directory
 */

use crate::core::errors::{SandboxError, SandboxResult};
use crate::core::limits::{INSTANCE_DIR_PREFIX, SCRIPT_FILE_NAME, STAGING_DIR_PREFIX};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use tempfile::{Builder, TempDir};
use tracing::{debug, warn};

/// Private per-instance base directory
///
/// Removed when dropped or when `close` is called.
#[derive(Debug)]
pub struct InstanceDir {
    dir: Option<TempDir>,
    path: PathBuf,
}

impl InstanceDir {
    /// Create `sandboxer-<backend>-XXXX` under `parent`, or the OS temp dir
    pub fn create(backend: &str, parent: Option<&Path>) -> SandboxResult<Self> {
        let prefix = format!("{}{}-", INSTANCE_DIR_PREFIX, backend);
        let mut builder = Builder::new();
        builder.prefix(&prefix);
        let dir = match parent {
            Some(parent) => builder.tempdir_in(parent),
            None => builder.tempdir(),
        }
        .map_err(|e| SandboxError::StageFailure(format!("create instance dir: {}", e)))?;

        let path = dir.path().to_path_buf();
        debug!(path = %path.display(), "created instance directory");
        Ok(Self {
            dir: Some(dir),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stage `source` into a fresh per-call directory
    pub fn stage(&self, source: &str) -> SandboxResult<StagedSource> {
        StagedSource::create(&self.path, source)
    }

    /// Write a file directly in the instance directory
    pub fn write_file(&self, name: &str, contents: &[u8], mode: u32) -> SandboxResult<PathBuf> {
        let path = self.path.join(name);
        write_with_mode(&path, contents, mode)?;
        Ok(path)
    }

    /// Remove the directory; idempotent
    pub fn close(&mut self) -> SandboxResult<()> {
        match self.dir.take() {
            Some(dir) => dir.close().map_err(|e| {
                SandboxError::CleanupFailure(format!("{}: {}", self.path.display(), e))
            }),
            None => Ok(()),
        }
    }
}

/// Instance directory owned by a sandbox instance and released by `clear`
#[derive(Debug)]
pub struct InstanceSlot {
    inner: Mutex<Option<InstanceDir>>,
}

impl InstanceSlot {
    pub fn new(dir: InstanceDir) -> Self {
        Self {
            inner: Mutex::new(Some(dir)),
        }
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.inner.lock().as_ref().map(|dir| dir.path().to_path_buf())
    }

    pub fn stage(&self, source: &str) -> SandboxResult<StagedSource> {
        match self.inner.lock().as_ref() {
            Some(dir) => dir.stage(source),
            None => Err(SandboxError::InvalidState(
                "instance directory already released".to_string(),
            )),
        }
    }

    /// Fresh empty directory inside the instance directory
    pub fn scratch_dir(&self, prefix: &str) -> SandboxResult<TempDir> {
        let base = self.path().ok_or_else(|| {
            SandboxError::InvalidState("instance directory already released".to_string())
        })?;
        Builder::new()
            .prefix(prefix)
            .tempdir_in(base)
            .map_err(|e| SandboxError::StageFailure(format!("create scratch dir: {}", e)))
    }

    /// Remove the directory; idempotent
    pub fn close(&self) -> SandboxResult<()> {
        let taken = self.inner.lock().take();
        match taken {
            Some(mut dir) => dir.close(),
            None => Ok(()),
        }
    }
}

/// One staged script
///
/// The directory is removed by `cleanup` or, failing that, on drop.
#[derive(Debug)]
pub struct StagedSource {
    dir: TempDir,
    script: PathBuf,
}

impl StagedSource {
    pub fn create(base: &Path, source: &str) -> SandboxResult<Self> {
        let dir = Builder::new()
            .prefix(STAGING_DIR_PREFIX)
            .tempdir_in(base)
            .map_err(|e| SandboxError::StageFailure(format!("create staging dir: {}", e)))?;

        let script = dir.path().join(SCRIPT_FILE_NAME);
        write_with_mode(&script, source.as_bytes(), 0o755)?;
        debug!(dir = %dir.path().display(), bytes = source.len(), "staged source");

        Ok(Self { dir, script })
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn script_path(&self) -> &Path {
        &self.script
    }

    /// Remove the staging directory, logging instead of failing
    ///
    /// Staging removal must never mask the outcome of the run it served.
    pub fn cleanup(self) {
        release_dir(self.dir);
    }
}

/// Remove a per-call directory, logging instead of failing
pub fn release_dir(dir: TempDir) {
    let path = dir.path().to_path_buf();
    if let Err(e) = dir.close() {
        let err = SandboxError::CleanupFailure(format!("{}: {}", path.display(), e));
        warn!(error = %err, "failed to remove per-call directory");
    }
}

fn write_with_mode(path: &Path, contents: &[u8], mode: u32) -> SandboxResult<()> {
    std::fs::write(path, contents)
        .map_err(|e| SandboxError::StageFailure(format!("write {}: {}", path.display(), e)))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(|e| {
            SandboxError::StageFailure(format!("chmod {}: {}", path.display(), e))
        })?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    Ok(())
}
