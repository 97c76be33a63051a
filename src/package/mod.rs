// src/package/mod.rs

//! Package identity, configuration and lookup
//!
//! A package is known everywhere by its full name, `<id>+<version>`. This
//! module holds the metadata model, the runtime handle that materializes a
//! package in a work directory, and the stores that answer lookups.

pub mod config;
pub mod handle;
pub mod recipe;
pub mod store;

pub use config::{PackageConfig, PackageType};
pub use handle::{KeyLock, Package, PackageSource, WorkDir};
pub use recipe::{BuildRecipe, RecipeStore};
pub use store::{BuildProvider, DeployedStore, LocalStore, PackageProvider};

use std::fmt;

/// Exact identity of a package
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PackageIdentity {
    pub id: String,
    pub version: String,
}

impl PackageIdentity {
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
        }
    }

    /// Canonical lookup key
    ///
    /// No escaping is applied, so an id containing `+` can collide with
    /// another id/version split of the same string.
    pub fn full_name(&self) -> String {
        format!("{}+{}", self.id, self.version)
    }
}

impl fmt::Display for PackageIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.id, self.version)
    }
}
