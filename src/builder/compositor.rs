// src/builder/compositor.rs

//! Build-time layer flattening
//!
//! Snapshots are merged in order into one working tree; a path present in
//! several snapshots ends up with the content of the last one. Each merge is
//! also recorded as a layer of an image in the compositor's own OCI layout,
//! and `finish` replaces that layer stack with the single flattened layer.

use crate::error::Result;
use crate::oci::{Descriptor, ImageIndex, IndexDocument, Manifest, OciLayout, archive, media_types};
use std::fs;
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

/// Flattens an ordered sequence of filesystem snapshots into one layer
#[derive(Debug)]
pub struct LayerCompositor {
    root: PathBuf,
    layout: OciLayout,
    rootfs: PathBuf,
    layers: Vec<Descriptor>,
}

impl LayerCompositor {
    /// Set up an image layout and an empty bundle rootfs below `root`
    pub fn new(root: &Path) -> Result<Self> {
        let layout = OciLayout::init(root.join("oci"))?;
        let rootfs = root.join("bundle").join("rootfs");
        fs::create_dir_all(&rootfs)?;

        let compositor = Self {
            root: root.to_path_buf(),
            layout,
            rootfs,
            layers: Vec::new(),
        };
        compositor.write_image()?;
        Ok(compositor)
    }

    /// The working tree merged so far
    pub fn rootfs(&self) -> &Path {
        &self.rootfs
    }

    pub fn layout(&self) -> &OciLayout {
        &self.layout
    }

    /// Merge `snapshot` on top of the working tree
    pub fn merge(&mut self, snapshot: &Path) -> Result<()> {
        info!("Merging {}", snapshot.display());
        sync_tree(snapshot, &self.rootfs)?;

        let staged = self.root.join("layer.tar.gz");
        archive::archive_dir(snapshot, &staged)?;
        let mut layer = self.layout.import_file(&staged)?;
        layer.media_type = media_types::LAYER_TAR_GZIP.to_string();
        self.layers.push(layer);
        self.write_image()
    }

    /// Turn the working tree into one tar.gz layer and copy it to `output`
    ///
    /// Intermediate layers are garbage-collected from the layout.
    pub fn finish(mut self, output: &Path) -> Result<Descriptor> {
        let staged = self.root.join("flattened.tar.gz");
        archive::archive_dir(&self.rootfs, &staged)?;
        let mut layer = self.layout.import_file(&staged)?;
        layer.media_type = media_types::LAYER_TAR_GZIP.to_string();

        self.layers = vec![layer.clone()];
        self.write_image()?;
        let removed = self.layout.gc()?;
        debug!("Dropped {} intermediate blob(s)", removed.len());

        fs::copy(self.layout.blob_path(&layer.digest), output)?;
        info!("Flattened layer {} written to {}", layer.digest, output.display());
        Ok(layer)
    }

    /// Point `index.json` at a manifest listing the current layers
    fn write_image(&self) -> Result<()> {
        let config = self.layout.write_json(&serde_json::json!({}), media_types::IMAGE_CONFIG)?;
        let manifest = Manifest {
            schema_version: 2,
            media_type: media_types::IMAGE_MANIFEST.to_string(),
            artifact_type: None,
            config,
            layers: self.layers.clone(),
        };
        let entry = self
            .layout
            .write_json(&manifest, media_types::IMAGE_MANIFEST)?;
        self.layout
            .write_index(&IndexDocument::Index(ImageIndex::new(vec![entry])))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Dir,
    File,
    Symlink,
    Other,
}

fn kind_of(file_type: fs::FileType) -> Kind {
    if file_type.is_dir() {
        Kind::Dir
    } else if file_type.is_file() {
        Kind::File
    } else if file_type.is_symlink() {
        Kind::Symlink
    } else {
        Kind::Other
    }
}

/// Copy `source` over `dest`, source entries winning
///
/// Directories are created, regular files replaced and symlinks recreated.
/// A destination entry whose type differs from the source entry at the same
/// path is removed first. Destination-only entries are kept. Permissions,
/// including setuid and setgid bits, and extended attributes are copied;
/// ownership is copied where the process is allowed to.
pub(crate) fn sync_tree(source: &Path, dest: &Path) -> Result<()> {
    sync_tree_filtered(source, dest, |_| true)
}

/// `sync_tree` restricted to the entries whose path relative to `source`
/// passes `include`
pub(crate) fn sync_tree_filtered<F>(source: &Path, dest: &Path, include: F) -> Result<()>
where
    F: Fn(&Path) -> bool,
{
    let mut directories = Vec::new();

    for entry in WalkDir::new(source).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        if !include(relative) {
            continue;
        }
        let target = dest.join(relative);
        let metadata = entry.path().symlink_metadata()?;
        let kind = kind_of(metadata.file_type());

        if let Ok(existing) = target.symlink_metadata() {
            let existing_kind = kind_of(existing.file_type());
            if existing_kind != kind || kind != Kind::Dir {
                remove_entry(&target, existing_kind)?;
            }
        }

        match kind {
            Kind::Dir => {
                fs::create_dir_all(&target)?;
                directories.push((entry.path().to_path_buf(), target, metadata));
            }
            Kind::File => {
                fs::copy(entry.path(), &target)?;
                // chown clears setuid/setgid, so the mode goes on afterwards
                copy_owner(&target, &metadata)?;
                copy_xattrs(entry.path(), &target)?;
                set_mode(&target, &metadata)?;
            }
            Kind::Symlink => {
                std::os::unix::fs::symlink(fs::read_link(entry.path())?, &target)?;
                copy_owner(&target, &metadata)?;
                copy_xattrs(entry.path(), &target)?;
            }
            Kind::Other => {
                debug!("Skipping special file {}", entry.path().display());
            }
        }
    }

    // Modes are applied last so read-only directories can still be filled.
    for (source_dir, directory, metadata) in directories.iter().rev() {
        copy_owner(directory, metadata)?;
        copy_xattrs(source_dir, directory)?;
        set_mode(directory, metadata)?;
    }

    Ok(())
}

fn remove_entry(path: &Path, kind: Kind) -> io::Result<()> {
    match kind {
        Kind::Dir => fs::remove_dir_all(path),
        _ => fs::remove_file(path),
    }
}

fn set_mode(path: &Path, metadata: &fs::Metadata) -> io::Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(metadata.mode() & 0o7777))
}

/// Copy extended attributes onto `target` without following symlinks
///
/// Attributes the process may not set are skipped: `trusted.*` and
/// `security.*` when unprivileged, anything on a filesystem without xattrs.
fn copy_xattrs(source: &Path, target: &Path) -> io::Result<()> {
    for (name, value) in archive::read_xattrs(source)? {
        match xattr::set(target, &name, &value) {
            Ok(()) => {}
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::PermissionDenied | io::ErrorKind::Unsupported
                ) =>
            {
                debug!("Skipping xattr {:?} on {}: {}", name, target.display(), e);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Copy uid/gid onto `path` without following symlinks
///
/// EPERM is ignored: unprivileged builds keep the invoking user's ownership.
fn copy_owner(path: &Path, metadata: &fs::Metadata) -> io::Result<()> {
    match std::os::unix::fs::lchown(path, Some(metadata.uid()), Some(metadata.gid())) {
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn snapshot(root: &Path, files: &[(&str, &str)]) -> PathBuf {
        fs::create_dir_all(root).unwrap();
        for (path, content) in files {
            let path = root.join(path);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
        root.to_path_buf()
    }

    #[test]
    fn test_later_snapshot_wins() {
        let temp_dir = TempDir::new().unwrap();
        let l1 = snapshot(
            &temp_dir.path().join("l1"),
            &[("etc/os-release", "base"), ("etc/hosts", "l1"), ("lib/a.so", "a")],
        );
        let l2 = snapshot(
            &temp_dir.path().join("l2"),
            &[("etc/hosts", "l2"), ("lib/b.so", "b")],
        );
        let l3 = snapshot(
            &temp_dir.path().join("l3"),
            &[("etc/os-release", "app"), ("etc/hosts", "l3")],
        );

        let mut compositor = LayerCompositor::new(&temp_dir.path().join("work")).unwrap();
        for layer in [&l1, &l2, &l3] {
            compositor.merge(layer).unwrap();
        }

        let rootfs = compositor.rootfs();
        assert_eq!(fs::read_to_string(rootfs.join("etc/os-release")).unwrap(), "app");
        assert_eq!(fs::read_to_string(rootfs.join("etc/hosts")).unwrap(), "l3");
        assert_eq!(fs::read_to_string(rootfs.join("lib/a.so")).unwrap(), "a");
        assert_eq!(fs::read_to_string(rootfs.join("lib/b.so")).unwrap(), "b");
    }

    #[test]
    fn test_type_change_replaces_entry() {
        let temp_dir = TempDir::new().unwrap();
        let l1 = snapshot(&temp_dir.path().join("l1"), &[("opt/data/file", "x")]);
        let l2 = snapshot(&temp_dir.path().join("l2"), &[("opt/data", "now a file")]);
        let l3 = temp_dir.path().join("l3");
        fs::create_dir_all(l3.join("opt")).unwrap();
        std::os::unix::fs::symlink("/usr/share/data", l3.join("opt/link")).unwrap();
        snapshot(&temp_dir.path().join("l2"), &[("opt/link", "plain")]);

        let dest = temp_dir.path().join("dest");
        sync_tree(&l1, &dest).unwrap();
        sync_tree(&l2, &dest).unwrap();
        assert_eq!(
            fs::read_to_string(dest.join("opt/data")).unwrap(),
            "now a file"
        );
        assert!(dest.join("opt/link").is_file());

        sync_tree(&l3, &dest).unwrap();
        assert_eq!(
            fs::read_link(dest.join("opt/link")).unwrap(),
            Path::new("/usr/share/data")
        );
        assert!(dest.join("opt/data").is_file());
    }

    #[test]
    fn test_modes_are_copied() {
        let temp_dir = TempDir::new().unwrap();
        let source = snapshot(&temp_dir.path().join("src"), &[("bin/tool", "#!/bin/sh")]);
        fs::set_permissions(source.join("bin/tool"), fs::Permissions::from_mode(0o750)).unwrap();
        fs::set_permissions(source.join("bin"), fs::Permissions::from_mode(0o711)).unwrap();

        let dest = temp_dir.path().join("dest");
        sync_tree(&source, &dest).unwrap();

        let file_mode = fs::metadata(dest.join("bin/tool")).unwrap().mode();
        let dir_mode = fs::metadata(dest.join("bin")).unwrap().mode();
        assert_eq!(file_mode & 0o777, 0o750);
        assert_eq!(dir_mode & 0o777, 0o711);
    }

    #[test]
    fn test_setuid_bit_survives_merge() {
        let temp_dir = TempDir::new().unwrap();
        let source = snapshot(&temp_dir.path().join("src"), &[("usr/bin/su", "su")]);
        fs::set_permissions(source.join("usr/bin/su"), fs::Permissions::from_mode(0o4755))
            .unwrap();

        let dest = temp_dir.path().join("dest");
        sync_tree(&source, &dest).unwrap();

        let mode = fs::metadata(dest.join("usr/bin/su")).unwrap().mode();
        assert_eq!(mode & 0o7777, 0o4755);
    }

    #[test]
    fn test_xattrs_are_copied() {
        let temp_dir = TempDir::new().unwrap();
        let source = snapshot(&temp_dir.path().join("src"), &[("etc/motd", "hi")]);
        if xattr::set(source.join("etc/motd"), "user.bolt.layer", b"base").is_err() {
            // No user xattrs on this filesystem
            return;
        }

        let dest = temp_dir.path().join("dest");
        sync_tree(&source, &dest).unwrap();
        assert_eq!(
            xattr::get(dest.join("etc/motd"), "user.bolt.layer").unwrap(),
            Some(b"base".to_vec())
        );
    }

    #[test]
    fn test_filtered_sync_copies_selected_entries() {
        let temp_dir = TempDir::new().unwrap();
        let source = snapshot(
            &temp_dir.path().join("src"),
            &[("etc/hosts", "hosts"), ("etc/motd", "motd")],
        );

        let dest = temp_dir.path().join("dest");
        sync_tree_filtered(&source, &dest, |path| path != Path::new("etc/motd")).unwrap();
        assert_eq!(fs::read_to_string(dest.join("etc/hosts")).unwrap(), "hosts");
        assert!(!dest.join("etc/motd").exists());
    }

    #[test]
    fn test_finish_collects_intermediate_layers() {
        let temp_dir = TempDir::new().unwrap();
        let l1 = snapshot(&temp_dir.path().join("l1"), &[("a", "1")]);
        let l2 = snapshot(&temp_dir.path().join("l2"), &[("b", "2")]);

        let mut compositor = LayerCompositor::new(&temp_dir.path().join("work")).unwrap();
        compositor.merge(&l1).unwrap();
        compositor.merge(&l2).unwrap();
        let layout = compositor.layout().clone();
        let intermediate: Vec<_> = match layout.read_index().unwrap() {
            IndexDocument::Index(index) => {
                let manifest: Manifest = layout.read_json(&index.manifests[0]).unwrap();
                manifest.layers
            }
            IndexDocument::Manifest(_) => panic!("expected an image index"),
        };
        assert_eq!(intermediate.len(), 2);

        let output = temp_dir.path().join("layer.tgz");
        let layer = compositor.finish(&output).unwrap();

        for stale in &intermediate {
            assert!(!layout.blob_path(&stale.digest).exists());
        }
        assert!(layout.blob_path(&layer.digest).exists());

        let extracted = temp_dir.path().join("extracted");
        archive::extract_tar(&output, &extracted).unwrap();
        assert_eq!(fs::read_to_string(extracted.join("a")).unwrap(), "1");
        assert_eq!(fs::read_to_string(extracted.join("b")).unwrap(), "2");
    }
}
