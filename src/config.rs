// src/config.rs

//! Runtime settings
//!
//! A single `Settings` value is built by the caller and passed by reference
//! into every operation that needs it. Nothing in the library reads ambient
//! global state.

use std::path::PathBuf;

/// Name of the directory holding built package archives
pub const PACKAGE_STORE_DIR: &str = "bolts";

/// How many parent directories are searched for stores and recipes
pub const MAX_SEARCH_DEPTH: usize = 100;

/// File extension of package archives
pub const PACKAGE_EXTENSION: &str = "bolt";

/// Where packages are unpacked on a deployment target
pub const DEPLOYED_PACKAGES_DIR: &str = "/data/bolt/packages";

/// Where package content layers are mounted on a deployment target
pub const DEPLOYED_MOUNTS_DIR: &str = "/data/bolt/mounts";

/// Where runtime bundles are assembled on a deployment target
pub const DEPLOYED_BUNDLES_DIR: &str = "/data/bolt/bundles";

const VERITYSETUP_PATH: &str = "/usr/sbin/veritysetup";
const DMSETUP_PATH: &str = "/usr/sbin/dmsetup";

/// Settings threaded through pack, make and deploy operations
#[derive(Debug, Clone)]
pub struct Settings {
    /// Directory name searched for when locating the local package store
    pub store_dir_name: String,
    /// Upper bound on parent-directory walks
    pub max_search_depth: usize,
    /// Archive extension, without the dot
    pub package_extension: String,
    /// Directory of unpacked packages on the deployment target
    pub packages_dir: PathBuf,
    /// Directory of per-package layer mount points
    pub mounts_dir: PathBuf,
    /// Directory of per-package runtime bundles
    pub bundles_dir: PathBuf,
    /// veritysetup binary used for binding and opening verity devices
    pub veritysetup: PathBuf,
    /// dmsetup binary used for probing and removing verity devices
    pub dmsetup: PathBuf,
    /// Produce integrity-bound images when packing
    pub require_integrity: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            store_dir_name: PACKAGE_STORE_DIR.to_string(),
            max_search_depth: MAX_SEARCH_DEPTH,
            package_extension: PACKAGE_EXTENSION.to_string(),
            packages_dir: PathBuf::from(DEPLOYED_PACKAGES_DIR),
            mounts_dir: PathBuf::from(DEPLOYED_MOUNTS_DIR),
            bundles_dir: PathBuf::from(DEPLOYED_BUNDLES_DIR),
            veritysetup: PathBuf::from(VERITYSETUP_PATH),
            dmsetup: PathBuf::from(DMSETUP_PATH),
            require_integrity: true,
        }
    }
}

impl Settings {
    /// Point all deployment directories below one root
    pub fn with_deploy_root(mut self, root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        self.packages_dir = root.join("packages");
        self.mounts_dir = root.join("mounts");
        self.bundles_dir = root.join("bundles");
        self
    }

    /// File name of the archive for a package full name
    pub fn archive_name(&self, full_name: &str) -> String {
        format!("{}.{}", full_name, self.package_extension)
    }

    /// Directory an unpacked package lives in on the deployment target
    pub fn package_dir(&self, full_name: &str) -> PathBuf {
        self.packages_dir.join(full_name)
    }

    /// Mount point of a package's content layer
    pub fn mount_dir(&self, full_name: &str) -> PathBuf {
        self.mounts_dir.join(full_name)
    }

    /// Runtime bundle directory of a package
    pub fn bundle_dir(&self, full_name: &str) -> PathBuf {
        self.bundles_dir.join(full_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.store_dir_name, "bolts");
        assert_eq!(settings.max_search_depth, 100);
        assert!(settings.require_integrity);
        assert_eq!(
            settings.mount_dir("app+1.0"),
            PathBuf::from("/data/bolt/mounts/app+1.0")
        );
    }

    #[test]
    fn test_with_deploy_root() {
        let settings = Settings::default().with_deploy_root("/tmp/target");
        assert_eq!(
            settings.package_dir("base+1.0"),
            PathBuf::from("/tmp/target/packages/base+1.0")
        );
        assert_eq!(
            settings.bundle_dir("base+1.0"),
            PathBuf::from("/tmp/target/bundles/base+1.0")
        );
        assert_eq!(settings.archive_name("base+1.0"), "base+1.0.bolt");
    }
}
