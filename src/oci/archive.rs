// src/oci/archive.rs

//! Tar, gzip and zip plumbing around package layouts
//!
//! Package archives are zip files holding an OCI layout; content layers and
//! filesystem snapshots travel as tar or tar.gz streams.

use crate::error::Result;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;
use zip::ZipArchive;
use zip::write::SimpleFileOptions;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// PAX record prefix carrying an extended attribute
const PAX_XATTR_PREFIX: &str = "SCHILY.xattr.";

/// Whether the process runs with an effective uid of 0
///
/// Only a privileged process can hand out arbitrary ownership or set
/// `trusted.*` and `security.*` attributes; everyone else extracts
/// rootless, as the invoking user.
pub(crate) fn running_as_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Extended attributes of `path` itself, sorted by name
///
/// Symlinks are not followed. Filesystems without xattr support report none.
pub(crate) fn read_xattrs(path: &Path) -> io::Result<Vec<(OsString, Vec<u8>)>> {
    let names = match xattr::list(path) {
        Ok(names) => names,
        Err(e) if e.kind() == io::ErrorKind::Unsupported => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut attributes = Vec::new();
    for name in names {
        if let Some(value) = xattr::get(path, &name)? {
            attributes.push((name, value));
        }
    }
    attributes.sort();
    Ok(attributes)
}

/// Whether a file starts with the gzip magic bytes
pub fn is_gzip(path: &Path) -> Result<bool> {
    let mut magic = [0u8; 2];
    let mut file = File::open(path)?;
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(magic == GZIP_MAGIC),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Unpack a tar or tar.gz archive into `dest`
///
/// Compression is detected from the file content, not the name. Modes and
/// mtimes are always restored; ownership and extended attributes only when
/// running as root.
pub fn extract_tar(archive_path: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)?;
    let file = BufReader::new(File::open(archive_path)?);

    let reader: Box<dyn Read> = if is_gzip(archive_path)? {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };

    let privileged = running_as_root();
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_preserve_ownerships(privileged);
    archive.set_unpack_xattrs(privileged);
    archive.unpack(dest)?;

    debug!(
        "Extracted {} into {}",
        archive_path.display(),
        dest.display()
    );
    Ok(())
}

/// Write the contents of `dir` as a tar.gz archive at `output`
///
/// Entries are stored relative to `dir` in name order; symlinks are archived
/// as links. Extended attributes travel as `SCHILY.xattr.*` PAX records.
/// Sockets are skipped.
pub fn archive_dir(dir: &Path, output: &Path) -> Result<()> {
    let file = BufWriter::new(File::create(output)?);
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        if entry.file_type().is_socket() {
            debug!("Skipping socket {}", entry.path().display());
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(dir)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let name = if relative.as_os_str().is_empty() {
            Path::new(".")
        } else {
            relative
        };

        let xattrs = read_xattrs(entry.path())?;
        if !xattrs.is_empty() {
            let records: Vec<(String, &[u8])> = xattrs
                .iter()
                .map(|(key, value)| {
                    (
                        format!("{}{}", PAX_XATTR_PREFIX, key.to_string_lossy()),
                        value.as_slice(),
                    )
                })
                .collect();
            builder.append_pax_extensions(
                records.iter().map(|(key, value)| (key.as_str(), *value)),
            )?;
        }

        if entry.file_type().is_dir() {
            builder.append_dir(name, entry.path())?;
        } else {
            builder.append_path_with_name(entry.path(), name)?;
        }
    }

    let encoder = builder.into_inner()?;
    encoder.finish()?;

    debug!("Archived {} into {}", dir.display(), output.display());
    Ok(())
}

/// Gzip-compress a file
pub fn gzip_file(source: &Path, output: &Path) -> Result<()> {
    let mut input = BufReader::new(File::open(source)?);
    let mut encoder = GzEncoder::new(BufWriter::new(File::create(output)?), Compression::default());
    io::copy(&mut input, &mut encoder)?;
    encoder.finish()?;
    Ok(())
}

/// Write a tar archive with no entries
pub fn write_empty_tar(output: &Path) -> Result<()> {
    let mut builder = tar::Builder::new(File::create(output)?);
    builder.finish()?;
    Ok(())
}

/// Zip every file below `dir` into `output`
///
/// Entry names are relative to `dir`; unix permissions are carried over.
pub fn zip_dir(dir: &Path, output: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut writer = zip::ZipWriter::new(BufWriter::new(File::create(output)?));

    for entry in WalkDir::new(dir).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(dir)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let name = relative.to_string_lossy().to_string();
        let mode = entry.metadata().map_err(io::Error::from)?.permissions().mode();
        let options = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .unix_permissions(mode & 0o7777);

        if entry.file_type().is_dir() {
            writer.add_directory(name, options)?;
        } else if entry.file_type().is_file() {
            writer.start_file(name, options)?;
            io::copy(&mut File::open(entry.path())?, &mut writer)?;
        }
    }

    writer.finish()?;
    debug!("Zipped {} into {}", dir.display(), output.display());
    Ok(())
}

/// Extract a zip archive into `dest`
///
/// Entries whose names would escape `dest` are skipped.
pub fn unzip(archive_path: &Path, dest: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut archive = ZipArchive::new(BufReader::new(File::open(archive_path)?))?;
    fs::create_dir_all(dest)?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let Some(relative) = entry.enclosed_name() else {
            continue;
        };
        let target = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut output = File::create(&target)?;
        io::copy(&mut entry, &mut output)?;

        if let Some(mode) = entry.unix_mode() {
            fs::set_permissions(&target, fs::Permissions::from_mode(mode))?;
        }
    }

    debug!(
        "Unzipped {} into {}",
        archive_path.display(),
        dest.display()
    );
    Ok(())
}

/// Populate `target` through a sibling staging directory, then rename it
/// into place
///
/// A failed `populate` never leaves `target` behind, so an existing `target`
/// is always complete.
pub fn populate_once<F>(target: &Path, populate: F) -> Result<()>
where
    F: FnOnce(&Path) -> Result<()>,
{
    let mut staging = target.as_os_str().to_owned();
    staging.push(".partial");
    let staging = PathBuf::from(staging);
    if staging.exists() {
        fs::remove_dir_all(&staging)?;
    }

    if let Err(e) = populate(&staging) {
        let _ = fs::remove_dir_all(&staging);
        return Err(e);
    }

    fs::rename(&staging, target)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::{MetadataExt, PermissionsExt};
    use tempfile::TempDir;

    fn sample_tree(root: &Path) {
        fs::create_dir_all(root.join("usr/bin")).unwrap();
        fs::write(root.join("usr/bin/tool"), b"#!/bin/sh\n").unwrap();
        fs::set_permissions(root.join("usr/bin/tool"), fs::Permissions::from_mode(0o755)).unwrap();
        fs::write(root.join("README"), b"hello").unwrap();
        std::os::unix::fs::symlink("usr/bin/tool", root.join("tool")).unwrap();
    }

    #[test]
    fn test_archive_dir_keeps_modes_and_links() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("source");
        let target = temp_dir.path().join("target");
        let archive = temp_dir.path().join("layer.tar.gz");
        sample_tree(&source);

        archive_dir(&source, &archive).unwrap();
        assert!(is_gzip(&archive).unwrap());
        extract_tar(&archive, &target).unwrap();

        assert_eq!(fs::read(target.join("README")).unwrap(), b"hello");
        let mode = fs::metadata(target.join("usr/bin/tool"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);
        assert_eq!(
            fs::read_link(target.join("tool")).unwrap(),
            Path::new("usr/bin/tool")
        );
    }

    #[test]
    fn test_extract_keeps_owner_when_privileged() {
        let temp_dir = TempDir::new().unwrap();
        let archive = temp_dir.path().join("owned.tar");
        {
            let mut builder = tar::Builder::new(File::create(&archive).unwrap());
            let mut header = tar::Header::new_gnu();
            header.set_size(5);
            header.set_mode(0o4755);
            header.set_uid(1234);
            header.set_gid(1234);
            header.set_cksum();
            builder
                .append_data(&mut header, "usr/bin/su", &b"su su"[..])
                .unwrap();
            builder.finish().unwrap();
        }

        let target = temp_dir.path().join("out");
        extract_tar(&archive, &target).unwrap();

        let metadata = fs::metadata(target.join("usr/bin/su")).unwrap();
        assert_eq!(metadata.mode() & 0o7777, 0o4755);
        if running_as_root() {
            assert_eq!(metadata.uid(), 1234);
            assert_eq!(metadata.gid(), 1234);
        }
    }

    #[test]
    fn test_archive_dir_records_xattrs() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("source");
        sample_tree(&source);
        if xattr::set(source.join("README"), "user.bolt.origin", b"base").is_err() {
            // No user xattrs on this filesystem
            return;
        }

        let archive = temp_dir.path().join("layer.tar.gz");
        archive_dir(&source, &archive).unwrap();

        let mut reader = tar::Archive::new(GzDecoder::new(File::open(&archive).unwrap()));
        let mut found = None;
        for entry in reader.entries().unwrap() {
            let mut entry = entry.unwrap();
            if entry.path().unwrap() != Path::new("README") {
                continue;
            }
            for extension in entry.pax_extensions().unwrap().unwrap() {
                let extension = extension.unwrap();
                if extension.key().unwrap() == "SCHILY.xattr.user.bolt.origin" {
                    found = Some(extension.value_bytes().to_vec());
                }
            }
        }
        assert_eq!(found, Some(b"base".to_vec()));
        assert_eq!(
            read_xattrs(&source.join("README")).unwrap(),
            vec![(OsString::from("user.bolt.origin"), b"base".to_vec())]
        );
    }

    #[test]
    fn test_extract_plain_tar() {
        let temp_dir = TempDir::new().unwrap();
        let archive = temp_dir.path().join("content.tar");
        {
            let mut builder = tar::Builder::new(File::create(&archive).unwrap());
            let mut header = tar::Header::new_gnu();
            header.set_size(4);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, "etc/motd", &b"motd"[..])
                .unwrap();
            builder.finish().unwrap();
        }

        assert!(!is_gzip(&archive).unwrap());
        let target = temp_dir.path().join("out");
        extract_tar(&archive, &target).unwrap();
        assert_eq!(fs::read(target.join("etc/motd")).unwrap(), b"motd");
    }

    #[test]
    fn test_empty_tar_extracts_to_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let archive = temp_dir.path().join("empty.tar");
        write_empty_tar(&archive).unwrap();

        let target = temp_dir.path().join("out");
        extract_tar(&archive, &target).unwrap();
        assert_eq!(fs::read_dir(&target).unwrap().count(), 0);
    }

    #[test]
    fn test_zip_dir_then_unzip() {
        let temp_dir = TempDir::new().unwrap();
        let layout = temp_dir.path().join("layout");
        fs::create_dir_all(layout.join("blobs/sha256")).unwrap();
        fs::write(layout.join("oci-layout"), b"{}").unwrap();
        fs::write(layout.join("blobs/sha256/abcd"), b"blob").unwrap();

        let archive = temp_dir.path().join("app+1.0.bolt");
        zip_dir(&layout, &archive).unwrap();

        let target = temp_dir.path().join("extracted");
        unzip(&archive, &target).unwrap();
        assert_eq!(fs::read(target.join("oci-layout")).unwrap(), b"{}");
        assert_eq!(fs::read(target.join("blobs/sha256/abcd")).unwrap(), b"blob");
    }

    #[test]
    fn test_populate_once_cleans_up_failures() {
        let temp_dir = TempDir::new().unwrap();
        let target = temp_dir.path().join("layer");

        let result = populate_once(&target, |staging| {
            fs::create_dir_all(staging)?;
            Err(io::Error::other("boom").into())
        });
        assert!(result.is_err());
        assert!(!target.exists());
        assert!(!temp_dir.path().join("layer.partial").exists());

        populate_once(&target, |staging| {
            fs::create_dir_all(staging)?;
            fs::write(staging.join("file"), "ok")?;
            Ok(())
        })
        .unwrap();
        assert_eq!(fs::read_to_string(target.join("file")).unwrap(), "ok");
    }

    #[test]
    fn test_gzip_file() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("content.tar");
        write_empty_tar(&source).unwrap();
        let output = temp_dir.path().join("content.tar.gz");

        gzip_file(&source, &output).unwrap();
        assert!(is_gzip(&output).unwrap());
    }
}
