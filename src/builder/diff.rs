// src/builder/diff.rs

//! Layer diffing between two OCI images
//!
//! Both images are unpacked, their layers applied in order with OCI
//! whiteouts honoured, and every entry of the top rootfs that is new or
//! differs from the bottom one is written as a tar.gz layer. Entries only the
//! bottom has are not recorded.

use super::compositor::{sync_tree, sync_tree_filtered};
use crate::error::{Error, Result};
use crate::oci::{Digest, IndexDocument, Manifest, OciLayout, archive, media_types};
use crate::package::WorkDir;
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Write the layer that turns `bottom`'s rootfs into `top`'s to `output`
///
/// Both inputs are OCI image layouts packed as tar or tar.gz archives.
pub fn diff(bottom: &Path, top: &Path, output: &Path) -> Result<()> {
    let work = WorkDir::new()?;
    let bottom_rootfs = unpack_image(bottom, &work.path().join("bottom"))?;
    let top_rootfs = unpack_image(top, &work.path().join("top"))?;

    let changed = changed_paths(&bottom_rootfs, &top_rootfs)?;
    debug!("{} entries differ between the images", changed.len());

    let staged = work.path().join("diff");
    fs::create_dir_all(&staged)?;
    sync_tree_filtered(&top_rootfs, &staged, |path| changed.contains(path))?;
    archive::archive_dir(&staged, output)?;

    info!(
        "Diff of {} over {} written to {}",
        top.display(),
        bottom.display(),
        output.display()
    );
    Ok(())
}

/// Unpack an image archive below `dir` and apply its layers
///
/// Returns the rootfs directory.
fn unpack_image(image: &Path, dir: &Path) -> Result<PathBuf> {
    let layout = OciLayout::new(dir.join("oci"));
    archive::extract_tar(image, layout.root())?;
    let manifest = image_manifest(&layout)?;

    let rootfs = dir.join("rootfs");
    fs::create_dir_all(&rootfs)?;
    for (i, layer) in manifest.layers.iter().enumerate() {
        match layer.media_type.as_str() {
            media_types::IMAGE_LAYER_TAR
            | media_types::IMAGE_LAYER_TAR_GZIP
            | media_types::LAYER_TAR_GZIP => {}
            other => return Err(Error::UnsupportedLayerMediaType(other.to_string())),
        }
        let layer_dir = dir.join(format!("layer-{}", i));
        archive::extract_tar(&layout.blob_path(&layer.digest), &layer_dir)?;
        apply_whiteouts(&layer_dir, &rootfs)?;
        sync_tree(&layer_dir, &rootfs)?;
        debug!("Applied layer {} of {}", layer.digest, image.display());
    }

    Ok(rootfs)
}

/// The image manifest of a layout: the first manifest an index lists, or a
/// bare manifest in `index.json`
fn image_manifest(layout: &OciLayout) -> Result<Manifest> {
    match layout.read_index()? {
        IndexDocument::Index(index) => {
            let entry = index
                .manifests
                .iter()
                .find(|entry| entry.media_type == media_types::IMAGE_MANIFEST)
                .ok_or_else(|| Error::ManifestNotFound(layout.root().to_path_buf()))?;
            layout.read_json(entry)
        }
        IndexDocument::Manifest(manifest) => Ok(manifest),
    }
}

/// Apply the whiteout markers of `layer` to `rootfs` and drop the markers
///
/// `.wh.<name>` deletes `<name>`; `.wh..wh..opq` empties its directory so
/// only the layer's own entries remain.
fn apply_whiteouts(layer: &Path, rootfs: &Path) -> Result<()> {
    let markers: Vec<PathBuf> = WalkDir::new(layer)
        .min_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(WHITEOUT_PREFIX))
        })
        .map(|entry| entry.into_path())
        .collect();

    for marker in markers {
        let relative = marker
            .strip_prefix(layer)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let parent = rootfs.join(relative.parent().unwrap_or(Path::new("")));
        let name = marker
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default();

        if name == OPAQUE_WHITEOUT {
            if parent.is_dir() {
                for child in fs::read_dir(&parent)? {
                    remove_path(&child?.path())?;
                }
            }
        } else {
            remove_path(&parent.join(&name[WHITEOUT_PREFIX.len()..]))?;
        }
        fs::remove_file(&marker)?;
    }
    Ok(())
}

fn remove_path(path: &Path) -> io::Result<()> {
    match path.symlink_metadata() {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Relative paths of `top` entries that are missing from or differ in
/// `bottom`, together with all of their ancestors
fn changed_paths(bottom: &Path, top: &Path) -> Result<BTreeSet<PathBuf>> {
    let mut changed = BTreeSet::new();

    for entry in WalkDir::new(top).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(top)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        if changed.contains(relative) {
            continue;
        }
        if entry_differs(entry.path(), &bottom.join(relative))? {
            changed.extend(relative.ancestors().map(Path::to_path_buf));
        }
    }

    Ok(changed)
}

/// Whether `new` differs from `old` in type, mode, ownership, device number,
/// link target, content or extended attributes
///
/// Modification times are ignored.
fn entry_differs(new: &Path, old: &Path) -> Result<bool> {
    let new_meta = new.symlink_metadata()?;
    let old_meta = match old.symlink_metadata() {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e.into()),
    };

    if new_meta.mode() != old_meta.mode()
        || new_meta.uid() != old_meta.uid()
        || new_meta.gid() != old_meta.gid()
        || new_meta.rdev() != old_meta.rdev()
    {
        return Ok(true);
    }

    let file_type = new_meta.file_type();
    if file_type.is_symlink() && fs::read_link(new)? != fs::read_link(old)? {
        return Ok(true);
    }
    if file_type.is_file()
        && (new_meta.len() != old_meta.len() || content_digest(new)? != content_digest(old)?)
    {
        return Ok(true);
    }

    Ok(archive::read_xattrs(new)? != archive::read_xattrs(old)?)
}

fn content_digest(path: &Path) -> io::Result<Digest> {
    Digest::sha256_reader(BufReader::new(File::open(path)?)).map(|(digest, _)| digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::{Descriptor, ImageIndex};
    use std::os::unix::fs::PermissionsExt;
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

    /// Pack an OCI image whose layers are the given snapshot directories
    fn write_image(dir: &Path, name: &str, layers: &[&Path]) -> PathBuf {
        let layout = OciLayout::init(dir.join(format!("{}-layout", name))).unwrap();
        let mut descriptors = Vec::new();
        for (i, layer) in layers.iter().enumerate() {
            let staged = dir.join(format!("{}-layer-{}.tar.gz", name, i));
            archive::archive_dir(layer, &staged).unwrap();
            let mut descriptor = layout.import_file(&staged).unwrap();
            descriptor.media_type = media_types::IMAGE_LAYER_TAR_GZIP.to_string();
            descriptors.push(descriptor);
        }
        let config = layout
            .write_json(&serde_json::json!({}), media_types::IMAGE_CONFIG)
            .unwrap();
        let manifest = Manifest {
            schema_version: 2,
            media_type: media_types::IMAGE_MANIFEST.to_string(),
            artifact_type: None,
            config,
            layers: descriptors,
        };
        let entry = layout
            .write_json(&manifest, media_types::IMAGE_MANIFEST)
            .unwrap();
        layout
            .write_index(&IndexDocument::Index(ImageIndex::new(vec![entry])))
            .unwrap();

        let image = dir.join(format!("{}.tar.gz", name));
        archive::archive_dir(layout.root(), &image).unwrap();
        image
    }

    #[test]
    fn test_diff_keeps_new_and_changed_entries() {
        let temp_dir = TempDir::new().unwrap();
        let base = snapshot(
            &temp_dir.path().join("base"),
            &[
                ("etc/os-release", "base"),
                ("etc/hosts", "127.0.0.1"),
                ("usr/lib/libc.so", "libc"),
            ],
        );
        let app = snapshot(
            &temp_dir.path().join("app"),
            &[("etc/os-release", "app"), ("opt/app/bin", "#!/bin/sh")],
        );
        let bottom = write_image(temp_dir.path(), "bottom", &[&base]);
        let top = write_image(temp_dir.path(), "top", &[&base, &app]);

        let output = temp_dir.path().join("diff.tar.gz");
        diff(&bottom, &top, &output).unwrap();

        let unpacked = temp_dir.path().join("unpacked");
        archive::extract_tar(&output, &unpacked).unwrap();
        assert_eq!(
            fs::read_to_string(unpacked.join("etc/os-release")).unwrap(),
            "app"
        );
        assert_eq!(
            fs::read_to_string(unpacked.join("opt/app/bin")).unwrap(),
            "#!/bin/sh"
        );
        assert!(!unpacked.join("etc/hosts").exists());
        assert!(!unpacked.join("usr").exists());
    }

    #[test]
    fn test_diff_records_mode_change() {
        let temp_dir = TempDir::new().unwrap();
        let base = snapshot(
            &temp_dir.path().join("base"),
            &[("usr/bin/tool", "tool"), ("usr/bin/other", "other")],
        );
        fs::set_permissions(base.join("usr/bin/tool"), fs::Permissions::from_mode(0o644))
            .unwrap();
        let bottom = write_image(temp_dir.path(), "bottom", &[&base]);

        fs::set_permissions(base.join("usr/bin/tool"), fs::Permissions::from_mode(0o755))
            .unwrap();
        let top = write_image(temp_dir.path(), "top", &[&base]);

        let output = temp_dir.path().join("diff.tar.gz");
        diff(&bottom, &top, &output).unwrap();

        let unpacked = temp_dir.path().join("unpacked");
        archive::extract_tar(&output, &unpacked).unwrap();
        let mode = fs::metadata(unpacked.join("usr/bin/tool")).unwrap().mode();
        assert_eq!(mode & 0o777, 0o755);
        assert!(!unpacked.join("usr/bin/other").exists());
    }

    #[test]
    fn test_whiteouts_hide_lower_entries() {
        let temp_dir = TempDir::new().unwrap();
        let base = snapshot(
            &temp_dir.path().join("base"),
            &[
                ("etc/hosts", "127.0.0.1"),
                ("var/cache/a", "a"),
                ("var/cache/b", "b"),
            ],
        );
        let upper = snapshot(
            &temp_dir.path().join("upper"),
            &[
                ("etc/.wh.hosts", ""),
                ("var/cache/.wh..wh..opq", ""),
                ("var/cache/c", "c"),
            ],
        );
        let image = write_image(temp_dir.path(), "image", &[&base, &upper]);

        let rootfs = unpack_image(&image, &temp_dir.path().join("unpacked")).unwrap();
        assert!(!rootfs.join("etc/hosts").exists());
        assert!(!rootfs.join("etc/.wh.hosts").exists());
        assert!(!rootfs.join("var/cache/a").exists());
        assert!(!rootfs.join("var/cache/.wh..wh..opq").exists());
        assert_eq!(fs::read_to_string(rootfs.join("var/cache/c")).unwrap(), "c");
    }

    #[test]
    fn test_unsupported_layer_media_type() {
        let temp_dir = TempDir::new().unwrap();
        let base = snapshot(&temp_dir.path().join("base"), &[("etc/hosts", "x")]);
        let image = write_image(temp_dir.path(), "image", &[&base]);

        let layout_dir = temp_dir.path().join("image-layout");
        let layout = OciLayout::new(&layout_dir);
        let IndexDocument::Index(index) = layout.read_index().unwrap() else {
            panic!("expected an index");
        };
        let mut manifest: Manifest = layout.read_json(&index.manifests[0]).unwrap();
        manifest.layers[0].media_type = "application/vnd.oci.image.layer.v1.tar+zstd".to_string();
        let entry: Descriptor = layout
            .write_json(&manifest, media_types::IMAGE_MANIFEST)
            .unwrap();
        layout
            .write_index(&IndexDocument::Index(ImageIndex::new(vec![entry])))
            .unwrap();
        fs::remove_file(&image).unwrap();
        archive::archive_dir(&layout_dir, &image).unwrap();

        let result = diff(&image, &image, &temp_dir.path().join("out.tar.gz"));
        assert!(matches!(result, Err(Error::UnsupportedLayerMediaType(_))));
    }
}
