// src/package/store.rs

//! Package lookup
//!
//! The resolver and both composers only ever see the `PackageProvider`
//! trait; where packages actually come from is decided by the caller.

use super::{Package, WorkDir};
use crate::config::Settings;
use crate::error::Result;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Answers "which package is `<id>+<version>`?"
pub trait PackageProvider {
    /// Look up a package by full name
    ///
    /// `Ok(None)` means the provider has no such package; errors are reserved
    /// for packages that exist but cannot be read.
    fn lookup(&self, full_name: &str) -> Result<Option<Package>>;
}

/// Directory of built `.bolt` archives on the build host
///
/// The store is the nearest `bolts` directory found walking up from the start
/// directory.
pub struct LocalStore<'a> {
    path: Option<PathBuf>,
    extension: String,
    work: &'a WorkDir,
}

impl<'a> LocalStore<'a> {
    /// Locate the store starting at `start`
    ///
    /// A missing store is not an error; every lookup then comes back empty.
    pub fn discover(start: &Path, settings: &Settings, work: &'a WorkDir) -> Result<Self> {
        let mut dir = start.canonicalize()?;
        let mut path = None;

        for _ in 0..settings.max_search_depth {
            let candidate = dir.join(&settings.store_dir_name);
            if candidate.is_dir() {
                path = Some(candidate);
                break;
            }
            match dir.parent() {
                Some(parent) => dir = parent.to_path_buf(),
                None => break,
            }
        }

        match &path {
            Some(path) => debug!("Using package store {}", path.display()),
            None => debug!(
                "No {} directory found above {}",
                settings.store_dir_name,
                start.display()
            ),
        }

        Ok(Self {
            path,
            extension: settings.package_extension.clone(),
            work,
        })
    }

    /// Use `path` as the store directly
    pub fn at(path: impl Into<PathBuf>, settings: &Settings, work: &'a WorkDir) -> Self {
        Self {
            path: Some(path.into()),
            extension: settings.package_extension.clone(),
            work,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Archive path a full name maps to
    pub fn archive_path(&self, full_name: &str) -> Option<PathBuf> {
        self.path
            .as_ref()
            .map(|dir| dir.join(format!("{}.{}", full_name, self.extension)))
    }
}

impl PackageProvider for LocalStore<'_> {
    fn lookup(&self, full_name: &str) -> Result<Option<Package>> {
        match self.archive_path(full_name) {
            Some(archive) if archive.is_file() => {
                Package::from_archive(&archive, full_name, self.work).map(Some)
            }
            _ => Ok(None),
        }
    }
}

/// Packages already unpacked on a deployment target, one directory each
#[derive(Debug, Clone)]
pub struct DeployedStore {
    dir: PathBuf,
}

impl DeployedStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.packages_dir.clone())
    }
}

impl PackageProvider for DeployedStore {
    fn lookup(&self, full_name: &str) -> Result<Option<Package>> {
        let dir = self.dir.join(full_name);
        if !dir.join("index.json").is_file() {
            return Ok(None);
        }
        Package::from_directory(&dir).map(Some)
    }
}

/// Lookup used while building: the target comes from its recipe, everything
/// else from the local store
pub struct BuildProvider<'a> {
    target: Package,
    store: LocalStore<'a>,
}

impl<'a> BuildProvider<'a> {
    pub fn new(target: Package, store: LocalStore<'a>) -> Self {
        Self { target, store }
    }

    pub fn target(&self) -> &Package {
        &self.target
    }
}

impl PackageProvider for BuildProvider<'_> {
    fn lookup(&self, full_name: &str) -> Result<Option<Package>> {
        if full_name == self.target.full_name() {
            return Ok(Some(self.target.clone()));
        }
        self.store.lookup(full_name)
    }
}
