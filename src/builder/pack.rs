// src/builder/pack.rs

//! Packing a config and a content archive into a `.bolt` package

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::exec::CommandRunner;
use crate::oci::{IndexDocument, Manifest, OciLayout, archive, media_types};
use crate::package::{PackageConfig, WorkDir};
use crate::verity::VerityTool;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::info;

/// On-disk format of the content layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    /// lz4-compressed erofs image with an appended dm-verity hash tree
    Erofs,
    /// The content archive itself, gzip-compressed
    TarGzip,
}

impl ImageFormat {
    /// Integrity-bound images whenever the settings require integrity
    pub fn for_settings(settings: &Settings) -> Self {
        if settings.require_integrity {
            ImageFormat::Erofs
        } else {
            ImageFormat::TarGzip
        }
    }
}

impl FromStr for ImageFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "erofs" => Ok(ImageFormat::Erofs),
            "tar-gzip" => Ok(ImageFormat::TarGzip),
            other => Err(format!("unknown image format: {}", other)),
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageFormat::Erofs => f.write_str("erofs"),
            ImageFormat::TarGzip => f.write_str("tar-gzip"),
        }
    }
}

/// Build `<out_dir>/<id>+<version>.bolt` from a package config and a tar or
/// tar.gz content archive
///
/// Returns the path of the written archive. While `settings` require
/// integrity, only dm-verity bound erofs layers are packed.
pub fn pack(
    config_path: &Path,
    content: &Path,
    out_dir: &Path,
    format: ImageFormat,
    settings: &Settings,
    runner: &dyn CommandRunner,
) -> Result<PathBuf> {
    let config = PackageConfig::load(config_path)?;
    if settings.require_integrity && format != ImageFormat::Erofs {
        return Err(Error::IntegrityRequired(config.full_name()));
    }
    fs::metadata(content)?;

    let work = WorkDir::new()?;
    let layout = OciLayout::init(work.path().join("layout"))?;

    let mut config_descriptor = layout
        .write_blob(&fs::read(config_path)?)?
        .with_annotation(media_types::ANNOTATION_TITLE, "package.json");
    config_descriptor.media_type = media_types::PACKAGE_CONFIG.to_string();

    let gzipped = archive::is_gzip(content)?;
    let mut layer = match format {
        ImageFormat::Erofs => {
            let image = work.path().join("content.erofs");
            let image_arg = image.to_string_lossy().to_string();
            let content_arg = content.to_string_lossy().to_string();
            let mut args = vec!["-zlz4", "--all-root", "--tar"];
            if gzipped {
                args.push("--gzip");
            }
            args.push(&image_arg);
            args.push(&content_arg);
            runner.run("mkfs.erofs", &args)?;

            let verity = VerityTool::new(settings).bind(runner, &image)?;
            let mut layer = layout.import_file(&image)?;
            layer.media_type = media_types::LAYER_EROFS_DMVERITY.to_string();
            layer.annotations.extend(verity.to_annotations());
            layer
        }
        ImageFormat::TarGzip => {
            let staged = work.path().join("content.tar.gz");
            if gzipped {
                fs::copy(content, &staged)?;
            } else {
                archive::gzip_file(content, &staged)?;
            }
            let mut layer = layout.import_file(&staged)?;
            layer.media_type = media_types::LAYER_TAR_GZIP.to_string();
            layer
        }
    };
    layer.annotations.insert(
        media_types::ANNOTATION_TITLE.to_string(),
        config.package_type().image_title().to_string(),
    );

    let manifest = Manifest::for_package(config_descriptor, layer);
    layout.write_index(&IndexDocument::Manifest(manifest))?;

    fs::create_dir_all(out_dir)?;
    let output = out_dir.join(settings.archive_name(&config.full_name()));
    if output.exists() {
        fs::remove_file(&output)?;
    }
    archive::zip_dir(layout.root(), &output).map_err(|e| match e {
        Error::Io(io) => Error::BlobWriteFailure {
            path: output.clone(),
            reason: io.to_string(),
        },
        other => other,
    })?;

    info!(
        "Prepared {} from {} and {}",
        output.display(),
        config_path.display(),
        content.display()
    );
    Ok(output)
}
