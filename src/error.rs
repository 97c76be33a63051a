// src/error.rs

use std::path::PathBuf;
use thiserror::Error;

/// Core error types for bolt
///
/// Every variant is terminal to the top-level operation that raised it. The
/// library never catches its own errors; reporting is left to the caller.
#[derive(Error, Debug)]
pub enum Error {
    /// Package config file does not exist
    #[error("Package config not found: {}", .0.display())]
    ConfigNotFound(PathBuf),

    /// Package config exists but is malformed
    #[error("Invalid package config {}: {reason}", path.display())]
    ConfigInvalid { path: PathBuf, reason: String },

    /// The package lookup returned nothing for a full name
    #[error("Required {0} package not found")]
    PackageNotFound(String),

    /// The store entry under a full name carries a config for another package
    #[error("Package name does not match package config: {requested} vs {found}")]
    IdentityMismatch { requested: String, found: String },

    /// Two paths in the dependency graph require different versions of one id
    #[error("Multiple packages depend on different versions of the same package {id}: {first} vs {second}")]
    VersionConflict {
        id: String,
        first: String,
        second: String,
    },

    /// The dependency graph loops back on itself
    #[error("Circular dependency detected: {}", .0.join(" -> "))]
    CyclicDependency(Vec<String>),

    /// index.json holds no package manifest
    #[error("Package manifest not found in {}", .0.display())]
    ManifestNotFound(PathBuf),

    /// A content layer has a media type we cannot extract or mount
    #[error("Not supported layer type: {0}")]
    UnsupportedLayerMediaType(String),

    /// The integrity tool ran but its output lacks the root hash or salt
    #[error("Integrity tool output is missing the {0}")]
    IntegrityToolOutputMissing(&'static str),

    /// A blob could not be stored
    #[error("Failed to write blob {}: {reason}", path.display())]
    BlobWriteFailure { path: PathBuf, reason: String },

    /// A layer without a dm-verity binding was about to be packed while
    /// integrity is required
    #[error("Integrity is required but {0} would be packed without dm-verity")]
    IntegrityRequired(String),

    /// A file handed to install is not a `<full name>.bolt` archive
    #[error("Not a package archive: {}", .0.display())]
    NotAPackageArchive(PathBuf),

    /// A layer or overlay mount failed
    #[error("Failed to mount {}: {reason}", target.display())]
    MountFailure { target: PathBuf, reason: String },

    /// No capability is registered for the detected platform
    #[error("Platform {0} is not supported")]
    UnsupportedPlatform(String),

    /// Digest string is not `algo:hex`
    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    /// Build recipe is malformed or has nothing to build
    #[error("Invalid build recipe: {0}")]
    InvalidRecipe(String),

    /// An external tool exited unsuccessfully
    #[error("{program} failed ({status}): {stderr}")]
    ToolFailed {
        program: String,
        status: String,
        stderr: String,
    },

    /// Zip container errors
    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    /// JSON (de)serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using bolt's Error type
pub type Result<T> = std::result::Result<T, Error>;
