// src/deploy/mod.rs

//! Deploy-time composition
//!
//! A deployed package's closure is mounted layer by layer and unioned into a
//! runtime bundle: the target's own files shadow those of its dependencies,
//! and a writable upper layer catches everything the container writes.

pub mod bundle;
pub mod mount;
pub mod platform;

pub use bundle::Bundle;
pub use mount::{LayerMounter, MountEntry};
pub use platform::{PlatformCapability, PlatformRegistry, detect_platform};

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::exec::CommandRunner;
use crate::oci::{archive, media_types};
use crate::package::{DeployedStore, KeyLock, Package, PackageProvider, WorkDir};
use crate::resolver;
use crate::verity::VerityInfo;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Mounts package layers and assembles bundles on a deployment target
pub struct DeployComposer<'r> {
    settings: &'r Settings,
    runner: &'r dyn CommandRunner,
    mounter: LayerMounter<'r>,
}

impl<'r> DeployComposer<'r> {
    pub fn new(settings: &'r Settings, runner: &'r dyn CommandRunner) -> Self {
        Self {
            settings,
            runner,
            mounter: LayerMounter::new(runner, settings),
        }
    }

    /// Make a package's content layer available at its mount directory
    ///
    /// Repeated calls find the layer already in place and do nothing.
    /// erofs images are mounted, through dm-verity when the layer carries
    /// verity annotations and the toolchain is installed. tar+gzip layers are
    /// unpacked into the mount directory instead. The mount check and the
    /// mount happen under `<mounts>/<full name>.lock`.
    pub fn mount_layer(&self, package: &Package) -> Result<PathBuf> {
        let full_name = package.full_name();
        let dir = self.settings.mount_dir(&full_name);
        let (Some(layer), Some(image)) = (package.content_layer(), package.content_path()) else {
            return Err(Error::ManifestNotFound(package.config().path().to_path_buf()));
        };
        let _lock = KeyLock::acquire(&self.settings.mounts_dir, &full_name)?;

        match layer.media_type.as_str() {
            media_types::LAYER_EROFS_DMVERITY => {
                if self.mounter.is_mounted(&dir) {
                    debug!("{} already mounted at {}", full_name, dir.display());
                    return Ok(dir);
                }
                self.mounter.ensure_dir(&dir)?;

                match VerityInfo::from_annotations(&layer.annotations) {
                    Some(info) if self.mounter.verity_available() => {
                        self.mounter.mount_verity(&full_name, &image, &info, &dir)?;
                    }
                    Some(_) => {
                        warn!(
                            "{} and/or {} not found, mounting {} without dm-verity",
                            self.settings.veritysetup.display(),
                            self.settings.dmsetup.display(),
                            full_name
                        );
                        self.mounter.mount(&image, &dir)?;
                    }
                    None => self.mounter.mount(&image, &dir)?,
                }
            }
            media_types::LAYER_TAR_GZIP => {
                if dir.exists() {
                    debug!("{} already unpacked at {}", full_name, dir.display());
                    return Ok(dir);
                }
                archive::populate_once(&dir, |staging| archive::extract_tar(&image, staging))?;
                info!("Unpacked {} at {}", full_name, dir.display());
            }
            other => return Err(Error::UnsupportedLayerMediaType(other.to_string())),
        }

        Ok(dir)
    }

    /// Assemble the runtime bundle for the last package of `closure`
    ///
    /// `closure` is in resolver order, dependencies first. The overlay is
    /// checked and mounted under `<bundles>/<full name>.lock`.
    pub fn compose(
        &self,
        closure: &[Package],
        platform: Option<&dyn PlatformCapability>,
    ) -> Result<Bundle> {
        let target = closure
            .last()
            .ok_or_else(|| Error::PackageNotFound(String::new()))?;
        let name = target.full_name();

        let mut config = bundle::runtime_config_template();
        let mut lower_dirs = Vec::with_capacity(closure.len());
        for package in closure {
            if let Some(entry_point) = package.config().entry_point() {
                bundle::push_process_arg(&mut config, entry_point);
            }
            lower_dirs.push(self.mount_layer(package)?);
        }

        if let Some(platform) = platform {
            debug!("Applying platform {} to {}", platform.id(), name);
            platform.update_bundle_config(self.runner, &mut config)?;
        }

        // overlayfs takes lowerdir most significant first
        lower_dirs.reverse();

        let dir = self.settings.bundle_dir(&name);
        let rootfs = dir.join("rootfs");
        {
            let _lock = KeyLock::acquire(&self.settings.bundles_dir, &name)?;
            if self.mounter.is_mounted(&rootfs) {
                debug!("Bundle rootfs {} already mounted", rootfs.display());
            } else {
                let upper = dir.join("rw/upper");
                let work = dir.join("rw/work");
                for path in [&rootfs, &upper, &work] {
                    self.mounter.ensure_dir(path)?;
                }
                self.mounter
                    .mount_overlay(&lower_dirs, &upper, &work, &rootfs)?;
            }
        }

        let config_path = dir.join("config.json");
        self.runner
            .write_file(&config_path, &serde_json::to_vec_pretty(&config)?)
            .map_err(|e| Error::BlobWriteFailure {
                path: config_path.clone(),
                reason: e.to_string(),
            })?;
        info!("Bundle for {} ready at {}", name, dir.display());

        Ok(Bundle {
            name,
            dir,
            rootfs,
            lower_dirs,
            config,
        })
    }

    /// Bundle rootfs mounts that stack on `full_name`'s layer, including the
    /// package's own bundle
    pub fn dependent_bundles(&self, full_name: &str) -> Result<Vec<PathBuf>> {
        let mount_dir = self.settings.mount_dir(full_name);
        let own_rootfs = self.settings.bundle_dir(full_name).join("rootfs");

        let mut bundles: Vec<PathBuf> = self
            .mounter
            .mount_table()?
            .into_iter()
            .filter(|entry| entry.target.starts_with(&self.settings.bundles_dir))
            .filter(|entry| entry.target == own_rootfs || entry.lower_dirs().contains(&mount_dir))
            .map(|entry| entry.target)
            .collect();
        bundles.dedup();
        Ok(bundles)
    }

    /// Unmount a package's content layer and every bundle built on it
    ///
    /// Bundles go first so the layer is no longer busy when it is unmounted.
    pub fn teardown(&self, full_name: &str) -> Result<()> {
        for rootfs in self.dependent_bundles(full_name)? {
            let name = rootfs
                .parent()
                .and_then(Path::file_name)
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            let _lock = KeyLock::acquire(&self.settings.bundles_dir, &name)?;
            self.mounter.unmount(&rootfs)?;
        }

        let _lock = KeyLock::acquire(&self.settings.mounts_dir, full_name)?;
        let mount_dir = self.settings.mount_dir(full_name);
        if self.mounter.is_mounted(&mount_dir) {
            self.mounter.unmount(&mount_dir)?;
        }

        if self.mounter.has_verity_device(full_name) {
            let package = DeployedStore::from_settings(self.settings)
                .lookup(full_name)?
                .ok_or_else(|| Error::PackageNotFound(full_name.to_string()))?;
            let image = package
                .content_path()
                .ok_or_else(|| Error::ManifestNotFound(package.config().path().to_path_buf()))?;
            self.mounter.release_verity(full_name, &image)?;
        }

        info!("Tore down {}", full_name);
        Ok(())
    }
}

/// Resolve a deployed package and assemble its bundle
///
/// Starting the container is left to an OCI runtime pointed at the
/// returned bundle directory.
pub fn deploy(
    full_name: &str,
    settings: &Settings,
    runner: &dyn CommandRunner,
    registry: &PlatformRegistry,
) -> Result<Bundle> {
    let store = DeployedStore::from_settings(settings);
    let closure = resolver::resolve(full_name, &store)?;
    info!(
        "Deploying {} using {}",
        full_name,
        closure
            .iter()
            .map(Package::full_name)
            .collect::<Vec<_>>()
            .join(", ")
    );

    let platform = match detect_platform(runner) {
        Some(id) => {
            debug!(
                "Registered platforms: {}",
                registry.ids().collect::<Vec<_>>().join(", ")
            );
            Some(registry.get(&id)?)
        }
        None => {
            warn!("Cannot detect platform type, no platform adjustments applied");
            None
        }
    };

    DeployComposer::new(settings, runner).compose(&closure, platform)
}

/// Unpack a `<full name>.bolt` archive into the deployed-package directory
///
/// The previous installation's layer is torn down first, together with the
/// bundles that use it, and a stale unpacked tar+gzip layer is dropped so the
/// next deploy picks up the new content. Returns the installed full name.
pub fn install(archive_path: &Path, settings: &Settings, runner: &dyn CommandRunner) -> Result<String> {
    let extension = format!(".{}", settings.package_extension);
    let full_name = archive_path
        .file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.strip_suffix(extension.as_str()))
        .filter(|name| !name.is_empty())
        .ok_or_else(|| Error::NotAPackageArchive(archive_path.to_path_buf()))?
        .to_string();

    let work = WorkDir::new()?;
    let package = Package::from_archive(archive_path, &full_name, &work)?;
    if package.full_name() != full_name {
        return Err(Error::IdentityMismatch {
            requested: full_name,
            found: package.full_name(),
        });
    }

    let composer = DeployComposer::new(settings, runner);
    composer.teardown(&full_name)?;

    let mount_dir = settings.mount_dir(&full_name);
    {
        let _lock = KeyLock::acquire(&settings.mounts_dir, &full_name)?;
        if mount_dir.exists() && !composer.mounter.is_mounted(&mount_dir) {
            fs::remove_dir_all(&mount_dir)?;
        }
    }

    let package_dir = settings.package_dir(&full_name);
    if package_dir.exists() {
        fs::remove_dir_all(&package_dir)?;
    }
    fs::create_dir_all(&settings.packages_dir)?;
    archive::populate_once(&package_dir, |staging| archive::unzip(archive_path, staging))?;

    info!("Installed {} into {}", full_name, package_dir.display());
    Ok(full_name)
}
