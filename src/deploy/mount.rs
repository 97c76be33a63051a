// src/deploy/mount.rs

//! Mount plumbing on the deployment target
//!
//! Every operation goes through the `CommandRunner`, so the mounts happen
//! wherever the runner executes.

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::exec::CommandRunner;
use crate::verity::VerityInfo;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const MOUNT_TABLE: &str = "/proc/mounts";

/// One line of the mount table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub target: PathBuf,
    pub fstype: String,
    pub options: String,
}

impl MountEntry {
    /// Lower directories of an overlay mount, most significant first
    pub fn lower_dirs(&self) -> Vec<PathBuf> {
        self.options
            .split(',')
            .find_map(|option| option.strip_prefix("lowerdir="))
            .map(|dirs| dirs.split(':').map(PathBuf::from).collect())
            .unwrap_or_default()
    }
}

/// Parse mount table text in `/proc/mounts` format
///
/// Octal escapes (`\040` for a space) are decoded; short lines are skipped.
pub fn parse_mount_table(text: &str) -> Vec<MountEntry> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            Some(MountEntry {
                source: unescape(fields.next()?),
                target: PathBuf::from(unescape(fields.next()?)),
                fstype: unescape(fields.next()?),
                options: unescape(fields.next()?),
            })
        })
        .collect()
}

fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let octal = bytes.get(i + 1..i + 4).filter(|digits| {
            bytes[i] == b'\\' && digits.iter().all(|digit| (b'0'..=b'7').contains(digit))
        });
        match octal {
            Some(digits) => {
                let value = digits
                    .iter()
                    .fold(0u32, |acc, digit| acc * 8 + u32::from(digit - b'0'));
                decoded.push(value as u8);
                i += 4;
            }
            None => {
                decoded.push(bytes[i]);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

pub struct LayerMounter<'r> {
    runner: &'r dyn CommandRunner,
    veritysetup: PathBuf,
    dmsetup: PathBuf,
}

impl<'r> LayerMounter<'r> {
    pub fn new(runner: &'r dyn CommandRunner, settings: &Settings) -> Self {
        Self {
            runner,
            veritysetup: settings.veritysetup.clone(),
            dmsetup: settings.dmsetup.clone(),
        }
    }

    pub fn is_mounted(&self, dir: &Path) -> bool {
        self.runner
            .succeeds("mountpoint", &["-q", &dir.to_string_lossy()])
    }

    /// Current mounts where the runner executes
    pub fn mount_table(&self) -> Result<Vec<MountEntry>> {
        let text = self.runner.read_file(Path::new(MOUNT_TABLE))?;
        Ok(parse_mount_table(&text))
    }

    pub fn ensure_dir(&self, dir: &Path) -> Result<()> {
        self.runner.run("mkdir", &["-p", &dir.to_string_lossy()])?;
        Ok(())
    }

    /// Whether both verity tools are installed
    pub fn verity_available(&self) -> bool {
        self.runner.file_exists(&self.veritysetup) && self.runner.file_exists(&self.dmsetup)
    }

    /// Mount a filesystem image without integrity checking
    pub fn mount(&self, image: &Path, dir: &Path) -> Result<()> {
        self.runner
            .run("mount", &[&image.to_string_lossy(), &dir.to_string_lossy()])
            .map_err(|e| mount_failure(dir, e))?;
        info!("Mounted {} at {}", image.display(), dir.display());
        Ok(())
    }

    /// Mount an image through a dm-verity device named `name`
    ///
    /// The hash tree lives in the same file after the data, at
    /// `info.hash_offset`.
    pub fn mount_verity(
        &self,
        name: &str,
        image: &Path,
        info: &VerityInfo,
        dir: &Path,
    ) -> Result<()> {
        let loop_device = self
            .runner
            .run("losetup", &["-f", "--show", &image.to_string_lossy()])
            .map_err(|e| mount_failure(dir, e))?
            .trim()
            .to_string();
        if loop_device.is_empty() {
            return Err(Error::MountFailure {
                target: dir.to_path_buf(),
                reason: format!("no loop device attached to {}", image.display()),
            });
        }

        let offset = info.hash_offset.to_string();
        self.runner
            .run(
                &self.veritysetup.to_string_lossy(),
                &[
                    "open",
                    &loop_device,
                    name,
                    &loop_device,
                    "--hash-offset",
                    &offset,
                    &info.root_hash,
                ],
            )
            .map_err(|e| mount_failure(dir, e))?;

        let mapped = format!("/dev/mapper/{}", name);
        self.runner
            .run("mount", &[&mapped, &dir.to_string_lossy()])
            .map_err(|e| mount_failure(dir, e))?;
        info!(
            "Mounted {} at {} with root hash {}",
            image.display(),
            dir.display(),
            info.root_hash
        );
        Ok(())
    }

    /// Union `lower` (most significant first) under a writable upper layer
    pub fn mount_overlay(
        &self,
        lower: &[PathBuf],
        upper: &Path,
        work: &Path,
        target: &Path,
    ) -> Result<()> {
        let lower: Vec<String> = lower
            .iter()
            .map(|dir| dir.to_string_lossy().to_string())
            .collect();
        let options = format!(
            "lowerdir={},upperdir={},workdir={}",
            lower.join(":"),
            upper.display(),
            work.display()
        );
        self.runner
            .run(
                "mount",
                &["-t", "overlay", "overlay", "-o", &options, &target.to_string_lossy()],
            )
            .map_err(|e| mount_failure(target, e))?;
        info!("Mounted overlay at {}", target.display());
        Ok(())
    }

    pub fn unmount(&self, dir: &Path) -> Result<()> {
        self.runner
            .run("umount", &[&dir.to_string_lossy()])
            .map_err(|e| mount_failure(dir, e))?;
        debug!("Unmounted {}", dir.display());
        Ok(())
    }

    pub fn has_verity_device(&self, name: &str) -> bool {
        self.runner
            .succeeds(&self.dmsetup.to_string_lossy(), &["status", name])
    }

    /// Remove the verity device `name` and detach the loop devices backing
    /// `image`
    pub fn release_verity(&self, name: &str, image: &Path) -> Result<()> {
        self.runner
            .run(&self.dmsetup.to_string_lossy(), &["remove", name])?;
        self.detach_loops(image)
    }

    /// Detach every loop device attached to `image`
    ///
    /// `losetup -j` prints one `<device>: [...]: (<file>)` line per device.
    pub fn detach_loops(&self, image: &Path) -> Result<()> {
        let listing = self
            .runner
            .run("losetup", &["-j", &image.to_string_lossy()])?;
        for device in listing.lines().filter_map(|line| line.split(':').next()) {
            let device = device.trim();
            if device.is_empty() {
                continue;
            }
            self.runner.run("losetup", &["-d", device])?;
            debug!("Detached {} from {}", device, image.display());
        }
        Ok(())
    }
}

fn mount_failure(target: &Path, error: Error) -> Error {
    Error::MountFailure {
        target: target.to_path_buf(),
        reason: error.to_string(),
    }
}
