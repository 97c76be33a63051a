// src/builder/mod.rs

//! Build pipeline
//!
//! `make` finds a recipe, resolves the target's dependency closure from the
//! local store, flattens the dependency layers and the target's own files
//! into one layer, and packs the result. `pack` is the last step on its own.
//! `diff` extracts the layer separating two OCI images.

pub mod compositor;
pub mod diff;
pub mod pack;

pub use compositor::LayerCompositor;
pub use diff::diff;
pub use pack::{ImageFormat, pack};

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::exec::CommandRunner;
use crate::oci::archive;
use crate::package::{BuildProvider, LocalStore, Package, RecipeStore, WorkDir};
use crate::resolver;
use std::path::{Path, PathBuf};
use tracing::info;

/// Build the package described by `<alias>.bolt.json` into `out_dir`
///
/// Returns the path of the written archive.
pub fn make(
    alias: &str,
    start_dir: &Path,
    out_dir: &Path,
    format: ImageFormat,
    settings: &Settings,
    runner: &dyn CommandRunner,
) -> Result<PathBuf> {
    let recipe = RecipeStore::new(settings.max_search_depth)
        .find(start_dir, alias)?
        .ok_or_else(|| Error::ConfigNotFound(PathBuf::from(format!("{}.bolt.json", alias))))?;
    let full_name = recipe.config.full_name();
    info!("Making {} from {}", full_name, recipe.path.display());

    let work = WorkDir::new()?;

    let content = if let Some(rootfs) = &recipe.direct.rootfs {
        let store = LocalStore::discover(start_dir, settings, &work)?;
        let provider = BuildProvider::new(Package::from_config(recipe.config.clone()), store);
        let mut closure = resolver::resolve(&full_name, &provider)?;
        closure.pop();

        if closure.is_empty() {
            if rootfs.is_dir() {
                let content = work.path().join(format!("{}-rootfs.tgz", full_name));
                archive::archive_dir(rootfs, &content)?;
                content
            } else {
                rootfs.clone()
            }
        } else {
            let mut compositor = LayerCompositor::new(&work.path().join(&full_name))?;
            for package in &closure {
                compositor.merge(&package.layer_dir(&work, runner)?)?;
            }

            let own_files = if rootfs.is_dir() {
                rootfs.clone()
            } else {
                let extracted = work.path().join(format!("{}-rootfs", full_name));
                archive::extract_tar(rootfs, &extracted)?;
                extracted
            };
            compositor.merge(&own_files)?;

            let content = work.path().join(format!("{}-layer.tgz", full_name));
            compositor.finish(&content)?;
            content
        }
    } else if recipe.direct.empty {
        let content = work.path().join("empty.tar");
        archive::write_empty_tar(&content)?;
        content
    } else {
        return Err(Error::InvalidRecipe(format!(
            "no instructions to make {}",
            alias
        )));
    };

    pack(recipe.config.path(), &content, out_dir, format, settings, runner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testing::FakeRunner;
    use crate::package::PackageProvider;
    use crate::package::handle::testing::write_layout;
    use std::fs;
    use tempfile::TempDir;

    fn write_recipe(
        dir: &Path,
        alias: &str,
        id: &str,
        dependencies: serde_json::Value,
        direct: serde_json::Value,
    ) {
        let config = serde_json::json!({
            "id": id,
            "version": "1.0",
            "versionName": "1.0",
            "name": id,
            "packageType": "application",
            "dependencies": dependencies
        });
        fs::write(dir.join(format!("{}.json", alias)), config.to_string()).unwrap();
        let recipe = serde_json::json!({"config": format!("{}.json", alias), "direct": direct});
        fs::write(dir.join(format!("{}.bolt.json", alias)), recipe.to_string()).unwrap();
    }

    fn settings() -> Settings {
        Settings {
            require_integrity: false,
            ..Settings::default()
        }
    }

    #[test]
    fn test_make_empty_package() {
        let temp_dir = TempDir::new().unwrap();
        write_recipe(
            temp_dir.path(),
            "app",
            "app",
            serde_json::json!({}),
            serde_json::json!({"empty": true}),
        );

        let out_dir = temp_dir.path().join("out");
        let output = make(
            "app",
            temp_dir.path(),
            &out_dir,
            ImageFormat::TarGzip,
            &settings(),
            &FakeRunner::default(),
        )
        .unwrap();
        assert_eq!(output, out_dir.join("app+1.0.bolt"));
    }

    #[test]
    fn test_make_flattens_dependencies() {
        let temp_dir = TempDir::new().unwrap();
        let store = temp_dir.path().join("bolts");
        fs::create_dir_all(&store).unwrap();
        for (id, dependencies, files) in [
            (
                "base",
                vec![],
                vec![("etc/os-release", "base"), ("etc/issue", "base")],
            ),
            (
                "runtime",
                vec![("base", "1.0")],
                vec![("usr/lib/libruntime.so", "rt"), ("etc/issue", "runtime")],
            ),
        ] {
            let scratch = TempDir::new().unwrap();
            write_layout(scratch.path(), id, "1.0", &dependencies, &files);
            archive::zip_dir(scratch.path(), &store.join(format!("{}+1.0.bolt", id))).unwrap();
        }

        let rootfs = temp_dir.path().join("rootfs");
        fs::create_dir_all(rootfs.join("usr/bin")).unwrap();
        fs::write(rootfs.join("usr/bin/app"), "app").unwrap();
        write_recipe(
            temp_dir.path(),
            "app",
            "app",
            serde_json::json!({"runtime": "1.0"}),
            serde_json::json!({"rootfs": "rootfs"}),
        );

        let out_dir = temp_dir.path().join("out");
        let output = make(
            "app",
            temp_dir.path(),
            &out_dir,
            ImageFormat::TarGzip,
            &settings(),
            &FakeRunner::default(),
        )
        .unwrap();

        let work = WorkDir::new().unwrap();
        let store = LocalStore::at(&out_dir, &settings(), &work);
        let package = store.lookup("app+1.0").unwrap().unwrap();
        assert_eq!(output, out_dir.join("app+1.0.bolt"));
        assert_eq!(package.manifest().unwrap().layers.len(), 1);

        let layer_dir = package.layer_dir(&work, &FakeRunner::default()).unwrap();
        let read = |path: &str| fs::read_to_string(layer_dir.join(path)).unwrap();
        assert_eq!(read("etc/os-release"), "base");
        assert_eq!(read("etc/issue"), "runtime");
        assert_eq!(read("usr/lib/libruntime.so"), "rt");
        assert_eq!(read("usr/bin/app"), "app");
    }

    #[test]
    fn test_make_without_instructions() {
        let temp_dir = TempDir::new().unwrap();
        write_recipe(
            temp_dir.path(),
            "app",
            "app",
            serde_json::json!({}),
            serde_json::json!({}),
        );

        let result = make(
            "app",
            temp_dir.path(),
            temp_dir.path(),
            ImageFormat::TarGzip,
            &settings(),
            &FakeRunner::default(),
        );
        assert!(matches!(result, Err(Error::InvalidRecipe(_))));
    }

    #[test]
    fn test_make_missing_dependency() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir_all(temp_dir.path().join("rootfs")).unwrap();
        write_recipe(
            temp_dir.path(),
            "app",
            "app",
            serde_json::json!({"base": "9.9"}),
            serde_json::json!({"rootfs": "rootfs"}),
        );

        let result = make(
            "app",
            temp_dir.path(),
            temp_dir.path(),
            ImageFormat::TarGzip,
            &settings(),
            &FakeRunner::default(),
        );
        assert!(matches!(result, Err(Error::PackageNotFound(name)) if name == "base+9.9"));
    }
}
