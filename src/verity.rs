// src/verity.rs

//! Integrity binding of filesystem images
//!
//! A dm-verity hash tree is appended to the image in place, right after its
//! last data byte. The root hash, salt and the offset at which the tree
//! starts are carried as annotations on the content-layer descriptor, which
//! together with the blob is everything a verifier needs.

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::exec::CommandRunner;
use crate::oci::media_types;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Verification parameters of an integrity-bound image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerityInfo {
    pub root_hash: String,
    /// Absent on packages produced before the salt was recorded
    pub salt: Option<String>,
    pub hash_offset: u64,
}

impl VerityInfo {
    /// Read verity parameters from layer annotations
    ///
    /// Returns `None` unless both root hash and a numeric offset are present.
    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> Option<Self> {
        let root_hash = annotations.get(media_types::ANNOTATION_ROOT_HASH)?;
        let hash_offset = annotations
            .get(media_types::ANNOTATION_HASH_OFFSET)?
            .trim()
            .parse()
            .ok()?;

        Some(Self {
            root_hash: root_hash.clone(),
            salt: annotations.get(media_types::ANNOTATION_SALT).cloned(),
            hash_offset,
        })
    }

    /// Annotations describing this binding
    pub fn to_annotations(&self) -> BTreeMap<String, String> {
        let mut annotations = BTreeMap::new();
        annotations.insert(
            media_types::ANNOTATION_ROOT_HASH.to_string(),
            self.root_hash.clone(),
        );
        annotations.insert(
            media_types::ANNOTATION_HASH_OFFSET.to_string(),
            self.hash_offset.to_string(),
        );
        if let Some(salt) = &self.salt {
            annotations.insert(media_types::ANNOTATION_SALT.to_string(), salt.clone());
        }
        annotations
    }
}

/// Extract root hash and salt from `veritysetup format` output
pub fn parse_format_output(output: &str) -> Result<(String, String)> {
    let field = |label: &str| {
        output.lines().find_map(|line| {
            let (key, value) = line.split_once(':')?;
            let value = value.trim();
            (key.trim() == label && !value.is_empty()).then(|| value.to_string())
        })
    };

    let root_hash = field("Root hash").ok_or(Error::IntegrityToolOutputMissing("root hash"))?;
    let salt = field("Salt").ok_or(Error::IntegrityToolOutputMissing("salt"))?;
    Ok((root_hash, salt))
}

/// Appends hash trees with `veritysetup`
#[derive(Debug, Clone)]
pub struct VerityTool {
    program: PathBuf,
}

impl VerityTool {
    pub fn new(settings: &Settings) -> Self {
        Self {
            program: settings.veritysetup.clone(),
        }
    }

    /// Append a hash tree to `image` and return its verification parameters
    ///
    /// The image is modified in place; the offset recorded is the image size
    /// before the tree was appended.
    pub fn bind(&self, runner: &dyn CommandRunner, image: &Path) -> Result<VerityInfo> {
        let hash_offset = fs::metadata(image)?.len();
        let image_arg = image.to_string_lossy();
        let offset_arg = format!("--hash-offset={}", hash_offset);

        let output = runner.run(
            &self.program.to_string_lossy(),
            &["format", &image_arg, &image_arg, &offset_arg],
        )?;
        let (root_hash, salt) = parse_format_output(&output)?;

        info!(
            "Bound {} with root hash {} at offset {}",
            image.display(),
            root_hash,
            hash_offset
        );

        Ok(VerityInfo {
            root_hash,
            salt: Some(salt),
            hash_offset,
        })
    }
}
