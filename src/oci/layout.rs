// src/oci/layout.rs

//! On-disk content-addressed blob store
//!
//! Blobs live at `blobs/<algorithm>/<hex>` below the layout root. Identical
//! bytes always land at the same path, so a blob that is already present is
//! never rewritten and independent writers of the same content converge.
//! Callers must not modify a blob file after it has been imported.

use super::{Descriptor, Digest, IndexDocument, Manifest, OCI_LAYOUT_MARKER, media_types};
use crate::error::{Error, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const INDEX_FILE: &str = "index.json";
const LAYOUT_FILE: &str = "oci-layout";

/// An OCI image layout directory
#[derive(Debug, Clone)]
pub struct OciLayout {
    root: PathBuf,
}

impl OciLayout {
    /// Open a layout rooted at `root` without touching the filesystem
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the layout skeleton: marker file and blob directory
    ///
    /// Safe to call on an existing layout.
    pub fn init(root: impl Into<PathBuf>) -> Result<Self> {
        let layout = Self::new(root);
        fs::create_dir_all(layout.root.join("blobs").join("sha256"))?;
        fs::write(layout.root.join(LAYOUT_FILE), OCI_LAYOUT_MARKER)?;
        debug!("Initialized OCI layout at {}", layout.root.display());
        Ok(layout)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    /// Deterministic location of a blob: `blobs/<algo>/<hex>`
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root
            .join("blobs")
            .join(digest.algorithm())
            .join(digest.hex())
    }

    /// Read a blob's bytes
    pub fn read_blob(&self, descriptor: &Descriptor) -> Result<Vec<u8>> {
        Ok(fs::read(self.blob_path(&descriptor.digest))?)
    }

    /// Read a blob and parse it as JSON
    pub fn read_json<T: DeserializeOwned>(&self, descriptor: &Descriptor) -> Result<T> {
        let file = File::open(self.blob_path(&descriptor.digest))?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    /// Store bytes under their SHA-256 digest
    ///
    /// Returns a descriptor carrying only digest and size; the caller sets
    /// media type and annotations.
    pub fn write_blob(&self, bytes: &[u8]) -> Result<Descriptor> {
        let digest = Digest::sha256(bytes);
        let path = self.blob_path(&digest);

        if !path.exists() {
            self.write_atomically(&path, |file| {
                io::Write::write_all(file, bytes)?;
                Ok(())
            })?;
            debug!("Stored blob {} ({} bytes)", digest, bytes.len());
        }

        Ok(Descriptor::new("", digest, bytes.len() as u64))
    }

    /// Serialize a value as JSON and store it as a blob
    pub fn write_json<T: Serialize>(&self, value: &T, media_type: &str) -> Result<Descriptor> {
        let bytes = serde_json::to_vec_pretty(value)?;
        let mut descriptor = self.write_blob(&bytes)?;
        descriptor.media_type = media_type.to_string();
        Ok(descriptor)
    }

    /// Move a file into the store under its SHA-256 digest
    ///
    /// The file is hashed while streaming and renamed into place, falling
    /// back to copy-and-delete across filesystems.
    pub fn import_file(&self, source: &Path) -> Result<Descriptor> {
        let (digest, size) = Digest::sha256_reader(BufReader::new(File::open(source)?))?;
        let path = self.blob_path(&digest);

        if path.exists() {
            fs::remove_file(source)?;
        } else {
            self.ensure_blob_dir(&path)?;
            move_file(source, &path).map_err(|e| Error::BlobWriteFailure {
                path: path.clone(),
                reason: e.to_string(),
            })?;
            debug!("Imported {} as blob {}", source.display(), digest);
        }

        Ok(Descriptor::new("", digest, size))
    }

    /// Read and classify `index.json`
    pub fn read_index(&self) -> Result<IndexDocument> {
        let file = File::open(self.index_path())?;
        let value: serde_json::Value = serde_json::from_reader(BufReader::new(file))?;
        IndexDocument::from_value(value).ok_or_else(|| Error::ManifestNotFound(self.root.clone()))
    }

    /// Replace `index.json`
    pub fn write_index(&self, index: &IndexDocument) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(index)?;
        let path = self.index_path();
        self.write_atomically(&path, |file| {
            io::Write::write_all(file, &bytes)?;
            Ok(())
        })
    }

    /// Locate the package manifest of this layout
    ///
    /// A multi-manifest index is scanned for the first manifest that carries
    /// the package triple; a bare manifest is accepted when it carries the
    /// triple itself.
    pub fn manifest(&self) -> Result<Manifest> {
        match self.read_index()? {
            IndexDocument::Index(index) => {
                for entry in &index.manifests {
                    if entry.media_type != media_types::IMAGE_MANIFEST {
                        continue;
                    }
                    let manifest: Manifest = self.read_json(entry)?;
                    if manifest.is_package_manifest() && !manifest.layers.is_empty() {
                        return Ok(manifest);
                    }
                }
            }
            IndexDocument::Manifest(manifest) => {
                if manifest.is_package_manifest() && !manifest.layers.is_empty() {
                    return Ok(manifest);
                }
            }
        }

        Err(Error::ManifestNotFound(self.root.clone()))
    }

    /// Delete every blob not reachable from `index.json`
    ///
    /// Returns the digests that were removed. A manifest that cannot be read
    /// fails the whole collection before anything is deleted, and an index
    /// entry that is not an image manifest (a nested index, say) leaves the
    /// layout untouched.
    pub fn gc(&self) -> Result<Vec<Digest>> {
        let mut live = BTreeSet::new();

        match self.read_index()? {
            IndexDocument::Index(index) => {
                for entry in &index.manifests {
                    if entry.media_type != media_types::IMAGE_MANIFEST {
                        warn!(
                            "Not collecting {}: index references {} {}",
                            self.root.display(),
                            entry.media_type,
                            entry.digest
                        );
                        return Ok(Vec::new());
                    }
                    live.insert(entry.digest.clone());
                    let manifest: Manifest = self.read_json(entry)?;
                    mark_manifest(&manifest, &mut live);
                }
            }
            IndexDocument::Manifest(manifest) => mark_manifest(&manifest, &mut live),
        }

        let mut removed = Vec::new();
        let blobs_dir = self.root.join("blobs");
        if !blobs_dir.exists() {
            return Ok(removed);
        }

        for algorithm_dir in fs::read_dir(&blobs_dir)? {
            let algorithm_dir = algorithm_dir?;
            if !algorithm_dir.file_type()?.is_dir() {
                continue;
            }
            let algorithm = algorithm_dir.file_name().to_string_lossy().to_string();

            for blob in fs::read_dir(algorithm_dir.path())? {
                let blob = blob?;
                let name = blob.file_name().to_string_lossy().to_string();
                let Ok(digest) = format!("{}:{}", algorithm, name).parse::<Digest>() else {
                    continue;
                };
                if !live.contains(&digest) {
                    fs::remove_file(blob.path())?;
                    removed.push(digest);
                }
            }
        }

        info!(
            "Garbage collected {} unreferenced blob(s) in {}",
            removed.len(),
            self.root.display()
        );
        Ok(removed)
    }

    fn ensure_blob_dir(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::BlobWriteFailure {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    /// Write through a temporary sibling file and rename it into place
    fn write_atomically<F>(&self, path: &Path, write: F) -> Result<()>
    where
        F: FnOnce(&mut File) -> io::Result<()>,
    {
        self.ensure_blob_dir(path)?;
        let parent = path.parent().unwrap_or(&self.root);

        let to_failure = |e: io::Error| Error::BlobWriteFailure {
            path: path.to_path_buf(),
            reason: e.to_string(),
        };

        let mut temp = tempfile::NamedTempFile::new_in(parent).map_err(to_failure)?;
        write(temp.as_file_mut()).map_err(to_failure)?;
        temp.persist(path).map_err(|e| to_failure(e.error))?;
        Ok(())
    }
}

fn mark_manifest(manifest: &Manifest, live: &mut BTreeSet<Digest>) {
    live.insert(manifest.config.digest.clone());
    for layer in &manifest.layers {
        live.insert(layer.digest.clone());
    }
}

/// Rename, or copy and delete when source and target are on different
/// filesystems
pub(crate) fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
        Err(e) => Err(e),
    }
}
