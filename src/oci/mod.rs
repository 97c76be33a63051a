// src/oci/mod.rs

//! Content-addressed package layout
//!
//! Packages are OCI image layouts: an `oci-layout` marker, an `index.json`
//! and digest-addressed blobs. This module holds the document types and the
//! identifying constants; `layout` implements the on-disk store and
//! `archive` the tar/zip plumbing around it.

pub mod archive;
pub mod layout;

pub use layout::OciLayout;

use crate::error::{Error, Result};
use serde::de::Deserializer;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Read};
use std::str::FromStr;

/// Media types, artifact type and annotation keys of the package format
pub mod media_types {
    pub const IMAGE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
    pub const IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    pub const IMAGE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
    pub const IMAGE_LAYER_TAR: &str = "application/vnd.oci.image.layer.v1.tar";
    pub const IMAGE_LAYER_TAR_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
    pub const PACKAGE_ARTIFACT: &str = "application/vnd.rdk.package+type";
    pub const PACKAGE_CONFIG: &str = "application/vnd.rdk.package.config.v1+json";
    pub const LAYER_TAR_GZIP: &str = "application/vnd.rdk.package.content.layer.v1.tar+gzip";
    pub const LAYER_EROFS_DMVERITY: &str =
        "application/vnd.rdk.package.content.layer.v1.erofs+dmverity";

    pub const ANNOTATION_TITLE: &str = "org.opencontainers.image.title";
    pub const ANNOTATION_ROOT_HASH: &str = "org.rdk.package.content.dmverity.roothash";
    pub const ANNOTATION_HASH_OFFSET: &str = "org.rdk.package.content.dmverity.offset";
    pub const ANNOTATION_SALT: &str = "org.rdk.package.content.dmverity.salt";
}

/// Contents of the `oci-layout` marker file
pub const OCI_LAYOUT_MARKER: &str = r#"{"imageLayoutVersion": "1.0.0"}"#;

/// A content digest in `algorithm:hex` form
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    algorithm: String,
    hex: String,
}

impl Digest {
    /// SHA-256 digest of a byte slice
    pub fn sha256(bytes: &[u8]) -> Self {
        Self {
            algorithm: "sha256".to_string(),
            hex: hex::encode(Sha256::digest(bytes)),
        }
    }

    /// SHA-256 digest of everything a reader yields, with the byte count
    pub fn sha256_reader<R: Read>(mut reader: R) -> io::Result<(Self, u64)> {
        let mut hasher = Sha256::new();
        let size = io::copy(&mut reader, &mut hasher)?;
        let digest = Self {
            algorithm: "sha256".to_string(),
            hex: hex::encode(hasher.finalize()),
        };
        Ok((digest, size))
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }
}

impl FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (algorithm, hex) = s
            .split_once(':')
            .ok_or_else(|| Error::InvalidDigest(s.to_string()))?;

        let valid_algorithm = !algorithm.is_empty()
            && algorithm
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
        let valid_hex = !hex.is_empty()
            && hex
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));

        if !valid_algorithm || !valid_hex {
            return Err(Error::InvalidDigest(s.to_string()));
        }

        Ok(Self {
            algorithm: algorithm.to_string(),
            hex: hex.to_string(),
        })
    }
}

impl TryFrom<String> for Digest {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.to_string()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

/// Generic reference to a blob
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
    #[serde(
        default,
        skip_serializing_if = "BTreeMap::is_empty",
        deserialize_with = "deserialize_annotations"
    )]
    pub annotations: BTreeMap<String, String>,
}

impl Descriptor {
    pub fn new(media_type: impl Into<String>, digest: Digest, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest,
            size,
            annotations: BTreeMap::new(),
        }
    }

    /// Add an annotation, replacing any previous value under the key
    pub fn with_annotation(mut self, key: &str, value: impl Into<String>) -> Self {
        self.annotations.insert(key.to_string(), value.into());
        self
    }
}

/// Annotation values are strings, but older packers wrote the verity offset
/// as a JSON number
fn deserialize_annotations<'de, D>(
    deserializer: D,
) -> std::result::Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<String, serde_json::Value>::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(key, value)| match value {
            serde_json::Value::String(s) => Ok((key, s)),
            serde_json::Value::Number(n) => Ok((key, n.to_string())),
            serde_json::Value::Bool(b) => Ok((key, b.to_string())),
            other => Err(serde::de::Error::custom(format!(
                "annotation {} must be a string, got {}",
                key, other
            ))),
        })
        .collect()
}

/// Metadata document listing a config blob and content layers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
}

impl Manifest {
    /// Manifest of a package with one config blob and one content layer
    pub fn for_package(config: Descriptor, content: Descriptor) -> Self {
        Self {
            schema_version: 2,
            media_type: media_types::IMAGE_MANIFEST.to_string(),
            artifact_type: Some(media_types::PACKAGE_ARTIFACT.to_string()),
            config,
            layers: vec![content],
        }
    }

    /// Whether this manifest carries the package identifying triple
    pub fn is_package_manifest(&self) -> bool {
        self.media_type == media_types::IMAGE_MANIFEST
            && self.artifact_type.as_deref() == Some(media_types::PACKAGE_ARTIFACT)
            && self.config.media_type == media_types::PACKAGE_CONFIG
    }

    /// The package's own content layer, always the last one
    pub fn content_layer(&self) -> Option<&Descriptor> {
        self.layers.last()
    }
}

/// Multi-manifest index document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: String,
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
}

impl ImageIndex {
    pub fn new(manifests: Vec<Descriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: media_types::IMAGE_INDEX.to_string(),
            manifests,
        }
    }
}

/// `index.json` is either a real index or, for single-manifest packages, the
/// manifest itself
#[derive(Debug, Clone, PartialEq)]
pub enum IndexDocument {
    Index(ImageIndex),
    Manifest(Manifest),
}

impl IndexDocument {
    /// Classify a parsed `index.json`
    ///
    /// Documents that are neither an index nor a manifest yield `None`.
    pub fn from_value(value: serde_json::Value) -> Option<Self> {
        let media_type = value.get("mediaType").and_then(|v| v.as_str());
        if media_type == Some(media_types::IMAGE_INDEX) || value.get("manifests").is_some() {
            return serde_json::from_value(value).ok().map(IndexDocument::Index);
        }
        serde_json::from_value(value).ok().map(IndexDocument::Manifest)
    }
}

impl Serialize for IndexDocument {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        match self {
            IndexDocument::Index(index) => index.serialize(serializer),
            IndexDocument::Manifest(manifest) => manifest.serialize(serializer),
        }
    }
}
