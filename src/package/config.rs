// src/package/config.rs

//! Package metadata (`package.json` / the config blob)

use super::PackageIdentity;
use crate::error::{Error, Result};
use serde_json::Value;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Role of a package in a layer stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageType {
    Base,
    Runtime,
    Application,
}

impl PackageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageType::Base => "base",
            PackageType::Runtime => "runtime",
            PackageType::Application => "application",
        }
    }

    /// Title annotation of the content layer for this package type
    pub fn image_title(&self) -> &'static str {
        match self {
            PackageType::Base => "base.tar.gz",
            PackageType::Runtime => "runtime.tar.gz",
            PackageType::Application => "package.tar.gz",
        }
    }
}

impl FromStr for PackageType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "base" => Ok(PackageType::Base),
            "runtime" => Ok(PackageType::Runtime),
            "application" => Ok(PackageType::Application),
            other => Err(format!("unknown packageType \"{}\"", other)),
        }
    }
}

impl fmt::Display for PackageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated package configuration
///
/// Immutable once loaded. The raw JSON document is kept so that fields this
/// model does not interpret survive a pack.
#[derive(Debug, Clone)]
pub struct PackageConfig {
    identity: PackageIdentity,
    version_name: String,
    name: String,
    package_type: PackageType,
    dependencies: Vec<PackageIdentity>,
    entry_point: Option<String>,
    path: PathBuf,
    raw: Value,
}

impl PackageConfig {
    /// Read and validate a config file
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::ConfigNotFound(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };

        let raw: Value = serde_json::from_slice(&bytes).map_err(|e| Error::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        Self::from_value(raw, path)
    }

    /// Like `load`, but a missing file is `Ok(None)`
    ///
    /// A file that exists and is malformed is still an error.
    pub fn try_load(path: &Path) -> Result<Option<Self>> {
        match Self::load(path) {
            Ok(config) => Ok(Some(config)),
            Err(Error::ConfigNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Validate an already-parsed document
    pub fn from_value(raw: Value, path: &Path) -> Result<Self> {
        let invalid = |reason: String| Error::ConfigInvalid {
            path: path.to_path_buf(),
            reason,
        };

        let object = raw
            .as_object()
            .ok_or_else(|| invalid("config is not a JSON object".to_string()))?;

        let required = |field: &str| -> Result<String> {
            match object.get(field) {
                Some(Value::String(value)) => Ok(value.clone()),
                Some(_) => Err(invalid(format!("field \"{}\" must be a string", field))),
                None => Err(invalid(format!("missing field \"{}\"", field))),
            }
        };

        let id = required("id")?;
        let version = required("version")?;
        let version_name = required("versionName")?;
        let name = required("name")?;
        let package_type = required("packageType")?
            .parse::<PackageType>()
            .map_err(invalid)?;

        let dependencies = match object.get("dependencies") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Object(map)) => map
                .iter()
                .map(|(dep_id, dep_version)| match dep_version {
                    Value::String(v) => Ok(PackageIdentity::new(dep_id.clone(), v.clone())),
                    _ => Err(invalid(format!(
                        "dependency \"{}\" must map to a version string",
                        dep_id
                    ))),
                })
                .collect::<Result<Vec<_>>>()?,
            Some(_) => return Err(invalid("field \"dependencies\" must be an object".to_string())),
        };

        let entry_point = match object.get("entryPoint") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(_) => return Err(invalid("field \"entryPoint\" must be a string".to_string())),
        };

        Ok(Self {
            identity: PackageIdentity::new(id, version),
            version_name,
            name,
            package_type,
            dependencies,
            entry_point,
            path: path.to_path_buf(),
            raw,
        })
    }

    pub fn identity(&self) -> &PackageIdentity {
        &self.identity
    }

    pub fn id(&self) -> &str {
        &self.identity.id
    }

    pub fn version(&self) -> &str {
        &self.identity.version
    }

    pub fn full_name(&self) -> String {
        self.identity.full_name()
    }

    pub fn version_name(&self) -> &str {
        &self.version_name
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn package_type(&self) -> PackageType {
        self.package_type
    }

    /// Exact-version dependencies, in declaration order
    pub fn dependencies(&self) -> &[PackageIdentity] {
        &self.dependencies
    }

    pub fn entry_point(&self) -> Option<&str> {
        self.entry_point.as_deref()
    }

    /// File the config was read from
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }
}
