// src/package/recipe.rs

//! Build recipes (`<alias>.bolt.json`)
//!
//! A recipe names the package config of the package to build and says where
//! its own filesystem contribution comes from.

use super::PackageConfig;
use crate::error::{Error, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const RECIPE_SUFFIX: &str = ".bolt.json";
const RECIPE_SUBDIR: &str = "package-configs";

#[derive(Debug, Deserialize)]
struct RecipeFile {
    config: Option<PathBuf>,
    #[serde(default)]
    direct: Option<DirectInstructions>,
}

/// Instructions for producing the package's own content
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DirectInstructions {
    /// Ship an empty content layer
    #[serde(default)]
    pub empty: bool,
    /// Directory or tar/tar.gz archive with the package's files
    #[serde(default)]
    pub rootfs: Option<PathBuf>,
}

/// A located and validated build recipe
#[derive(Debug, Clone)]
pub struct BuildRecipe {
    pub alias: String,
    /// The recipe file itself
    pub path: PathBuf,
    pub config: PackageConfig,
    pub direct: DirectInstructions,
}

impl BuildRecipe {
    /// Parse a recipe file
    ///
    /// Relative `config` and `rootfs` paths are resolved against the
    /// directory holding the recipe. Returns `Ok(None)` when the referenced
    /// package config does not exist.
    pub fn load(alias: &str, path: &Path) -> Result<Option<Self>> {
        let recipe: RecipeFile = serde_json::from_slice(&fs::read(path)?)
            .map_err(|e| Error::InvalidRecipe(format!("{}: {}", path.display(), e)))?;

        let Some(config_path) = recipe.config else {
            return Ok(None);
        };

        let base = path.parent().unwrap_or(Path::new("."));
        let Some(config) = PackageConfig::try_load(&base.join(config_path))? else {
            return Ok(None);
        };

        let mut direct = recipe.direct.unwrap_or_default();
        direct.rootfs = direct.rootfs.map(|rootfs| base.join(rootfs));

        Ok(Some(Self {
            alias: alias.to_string(),
            path: path.to_path_buf(),
            config,
            direct,
        }))
    }
}

/// Locates recipes by walking up the directory tree
#[derive(Debug, Clone)]
pub struct RecipeStore {
    max_depth: usize,
}

impl RecipeStore {
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }

    /// Find the recipe for `alias`, starting in `start` and moving up
    ///
    /// Each level checks `<dir>/<alias>.bolt.json`, then
    /// `<dir>/package-configs/<alias>.bolt.json`.
    pub fn find(&self, start: &Path, alias: &str) -> Result<Option<BuildRecipe>> {
        let file_name = format!("{}{}", alias, RECIPE_SUFFIX);
        let mut dir = start.canonicalize()?;

        for _ in 0..self.max_depth {
            for candidate in [
                dir.join(&file_name),
                dir.join(RECIPE_SUBDIR).join(&file_name),
            ] {
                if candidate.is_file() {
                    debug!("Checking recipe {}", candidate.display());
                    if let Some(recipe) = BuildRecipe::load(alias, &candidate)? {
                        return Ok(Some(recipe));
                    }
                }
            }

            match dir.parent() {
                Some(parent) => dir = parent.to_path_buf(),
                None => break,
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_SEARCH_DEPTH;
    use tempfile::TempDir;

    fn write_config(path: &Path, id: &str) {
        let config = serde_json::json!({
            "id": id,
            "version": "1.0",
            "versionName": "1.0",
            "name": id,
            "packageType": "application"
        });
        fs::write(path, config.to_string()).unwrap();
    }

    #[test]
    fn test_find_in_parent_package_configs() {
        let temp_dir = TempDir::new().unwrap();
        let configs = temp_dir.path().join("package-configs");
        fs::create_dir_all(&configs).unwrap();
        write_config(&configs.join("app.json"), "com.example.app");
        fs::write(
            configs.join("app.bolt.json"),
            r#"{"config": "app.json", "direct": {"rootfs": "rootfs"}}"#,
        )
        .unwrap();

        let nested = temp_dir.path().join("build/tmp");
        fs::create_dir_all(&nested).unwrap();

        let recipe = RecipeStore::new(MAX_SEARCH_DEPTH)
            .find(&nested, "app")
            .unwrap()
            .unwrap();
        assert_eq!(recipe.config.full_name(), "com.example.app+1.0");
        assert_eq!(
            recipe.direct.rootfs,
            Some(configs.canonicalize().unwrap().join("rootfs"))
        );
        assert!(!recipe.direct.empty);
    }

    #[test]
    fn test_recipe_without_existing_config_is_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let inner = temp_dir.path().join("inner");
        fs::create_dir_all(&inner).unwrap();
        fs::write(inner.join("app.bolt.json"), r#"{"config": "missing.json"}"#).unwrap();

        write_config(&temp_dir.path().join("app.json"), "com.example.outer");
        fs::write(
            temp_dir.path().join("app.bolt.json"),
            r#"{"config": "app.json", "direct": {"empty": true}}"#,
        )
        .unwrap();

        let recipe = RecipeStore::new(MAX_SEARCH_DEPTH)
            .find(&inner, "app")
            .unwrap()
            .unwrap();
        assert_eq!(recipe.config.id(), "com.example.outer");
        assert!(recipe.direct.empty);
    }

    #[test]
    fn test_malformed_recipe() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("app.bolt.json"), "[1, 2").unwrap();
        assert!(matches!(
            RecipeStore::new(MAX_SEARCH_DEPTH).find(temp_dir.path(), "app"),
            Err(Error::InvalidRecipe(_))
        ));
    }

    #[test]
    fn test_search_depth_is_bounded() {
        let temp_dir = TempDir::new().unwrap();
        write_config(&temp_dir.path().join("app.json"), "com.example.app");
        fs::write(temp_dir.path().join("app.bolt.json"), r#"{"config": "app.json"}"#).unwrap();
        let nested = temp_dir.path().join("a/b/c");
        fs::create_dir_all(&nested).unwrap();

        assert!(RecipeStore::new(2).find(&nested, "app").unwrap().is_none());
        assert!(RecipeStore::new(4).find(&nested, "app").unwrap().is_some());
    }
}
