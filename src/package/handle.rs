// src/package/handle.rs

//! Runtime package handles and the work directory they materialize into

use super::{PackageConfig, PackageIdentity};
use crate::error::{Error, Result};
use crate::exec::CommandRunner;
use crate::oci::{Descriptor, Manifest, OciLayout, archive, media_types};
use fs2::FileExt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

/// Scoped scratch directory for one top-level operation
///
/// Everything extracted during the operation lives below it and is removed
/// when the value is dropped, on success and failure alike.
#[derive(Debug)]
pub struct WorkDir {
    dir: TempDir,
}

impl WorkDir {
    pub fn new() -> Result<Self> {
        let dir = tempfile::Builder::new().prefix("bolt-").tempdir()?;
        debug!("Created work directory {}", dir.path().display());
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Take the exclusive lock for `key`, blocking until it is free
    ///
    /// The lock is released when the guard is dropped.
    pub fn lock(&self, key: &str) -> Result<KeyLock> {
        KeyLock::acquire(self.path(), key)
    }
}

/// Guard for an exclusive `<dir>/<key>.lock` file lock
///
/// The lock is advisory and shared by every process that takes the same
/// key in the same directory.
#[derive(Debug)]
pub struct KeyLock {
    file: File,
}

impl KeyLock {
    /// Block until the lock for `key` in `dir` is ours
    pub fn acquire(dir: &Path, key: &str) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let file = File::create(dir.join(format!("{}.lock", key)))?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }
}

impl Drop for KeyLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Where a package's content comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageSource {
    /// A `.bolt` archive, extracted into the work directory on first use
    Archive(PathBuf),
    /// An already-extracted package layout
    Directory(PathBuf),
    /// The package currently being built; it has a config and no content
    Recipe,
}

/// A package resolved for one operation
///
/// The config and manifest are read when the handle is built; content layers
/// are extracted on demand.
#[derive(Debug, Clone)]
pub struct Package {
    config: PackageConfig,
    source: PackageSource,
    layout: Option<OciLayout>,
    manifest: Option<Manifest>,
}

impl Package {
    /// Open a `.bolt` archive, extracting it into `<work>/<full_name>`
    ///
    /// Extraction happens once per work directory; later calls reuse the
    /// extracted layout.
    pub fn from_archive(archive_path: &Path, full_name: &str, work: &WorkDir) -> Result<Self> {
        let target = work.path().join(full_name);
        {
            let _lock = work.lock(full_name)?;
            if !target.exists() {
                info!("Extracting {}", archive_path.display());
                archive::populate_once(&target, |partial| archive::unzip(archive_path, partial))?;
            }
        }

        let mut package = Self::from_directory(&target)?;
        package.source = PackageSource::Archive(archive_path.to_path_buf());
        Ok(package)
    }

    /// Open an extracted package layout
    pub fn from_directory(dir: &Path) -> Result<Self> {
        let layout = OciLayout::new(dir);
        let manifest = layout.manifest()?;
        let config = PackageConfig::load(&layout.blob_path(&manifest.config.digest))?;

        Ok(Self {
            config,
            source: PackageSource::Directory(dir.to_path_buf()),
            layout: Some(layout),
            manifest: Some(manifest),
        })
    }

    /// Handle for a package known only by its config
    pub fn from_config(config: PackageConfig) -> Self {
        Self {
            config,
            source: PackageSource::Recipe,
            layout: None,
            manifest: None,
        }
    }

    pub fn config(&self) -> &PackageConfig {
        &self.config
    }

    pub fn identity(&self) -> &PackageIdentity {
        self.config.identity()
    }

    pub fn full_name(&self) -> String {
        self.config.full_name()
    }

    pub fn dependencies(&self) -> &[PackageIdentity] {
        self.config.dependencies()
    }

    pub fn source(&self) -> &PackageSource {
        &self.source
    }

    /// The extracted layout, absent for recipe packages
    pub fn layout(&self) -> Option<&OciLayout> {
        self.layout.as_ref()
    }

    pub fn manifest(&self) -> Option<&Manifest> {
        self.manifest.as_ref()
    }

    /// Descriptor of the package's own content layer
    pub fn content_layer(&self) -> Option<&Descriptor> {
        self.manifest.as_ref().and_then(Manifest::content_layer)
    }

    /// Path of the content layer blob
    pub fn content_path(&self) -> Option<PathBuf> {
        let layout = self.layout.as_ref()?;
        let layer = self.content_layer()?;
        Some(layout.blob_path(&layer.digest))
    }

    /// Unpack the content layer into `<work>/<full_name>-layer`
    ///
    /// Extraction happens once per work directory. Plain layers are unpacked
    /// natively, verity-protected erofs images through `fsck.erofs`.
    pub fn layer_dir(&self, work: &WorkDir, runner: &dyn CommandRunner) -> Result<PathBuf> {
        let (Some(layer), Some(image)) = (self.content_layer(), self.content_path()) else {
            return Err(Error::ManifestNotFound(self.config.path().to_path_buf()));
        };

        let key = format!("{}-layer", self.full_name());
        let target = work.path().join(&key);
        let _lock = work.lock(&key)?;
        if target.exists() {
            return Ok(target);
        }

        debug!("Extracting {} layer {}", self.full_name(), layer.digest);
        match layer.media_type.as_str() {
            media_types::LAYER_TAR_GZIP => {
                archive::populate_once(&target, |partial| archive::extract_tar(&image, partial))?;
            }
            media_types::LAYER_EROFS_DMVERITY => {
                archive::populate_once(&target, |partial| {
                    let extract_arg = format!("--extract={}", partial.display());
                    runner.run(
                        "fsck.erofs",
                        &["--preserve-perms", &extract_arg, &image.to_string_lossy()],
                    )?;
                    fs::metadata(partial)?;
                    Ok(())
                })?;
            }
            other => return Err(Error::UnsupportedLayerMediaType(other.to_string())),
        }

        Ok(target)
    }
}
