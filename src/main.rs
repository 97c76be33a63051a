// src/main.rs

use anyhow::Result;
use bolt::builder::{self, ImageFormat};
use bolt::config::Settings;
use bolt::deploy::{self, DeployComposer, PlatformRegistry};
use bolt::exec::LocalRunner;
use bolt::package::{BuildProvider, LocalStore, Package, RecipeStore, WorkDir};
use bolt::resolver;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "bolt")]
#[command(author, version, about = "Build, resolve and deploy layered bolt packages", long_about = None)]
struct Cli {
    /// Log debug output, including every external command
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pack a package config and a content archive into a package
    Pack {
        /// Package configuration (package.json)
        config: PathBuf,
        /// Content as a tar or tar.gz archive
        content: PathBuf,
        /// Directory the package is written to
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
        /// Content layer format (erofs or tar-gzip) [default: erofs, or
        /// tar-gzip with --no-integrity]
        #[arg(short, long)]
        format: Option<ImageFormat>,
        /// Allow content layers without dm-verity
        #[arg(long)]
        no_integrity: bool,
    },
    /// Build a package from its <alias>.bolt.json recipe
    Make {
        /// Recipe alias
        alias: String,
        /// Directory the recipe and package store searches start from
        #[arg(short = 'C', long, default_value = ".")]
        directory: PathBuf,
        /// Directory the package is written to
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
        /// Content layer format (erofs or tar-gzip) [default: erofs, or
        /// tar-gzip with --no-integrity]
        #[arg(short, long)]
        format: Option<ImageFormat>,
        /// Allow content layers without dm-verity
        #[arg(long)]
        no_integrity: bool,
    },
    /// Print the dependency closure of a package, dependencies first
    Resolve {
        /// Package full name (<id>+<version>) or recipe alias
        name: String,
        /// Directory the package store search starts from
        #[arg(short = 'C', long, default_value = ".")]
        directory: PathBuf,
        /// Package store to use instead of searching for one
        #[arg(long, value_name = "DIR")]
        store: Option<PathBuf>,
    },
    /// Write the layer separating two OCI images
    Diff {
        /// Bottom image (OCI layout as tar or tar.gz)
        bottom: PathBuf,
        /// Top image (OCI layout as tar or tar.gz)
        top: PathBuf,
        /// Where the tar.gz layer is written
        layer: PathBuf,
    },
    /// Install a package archive into the deployed-package directory
    Install {
        /// Package archive (<id>+<version>.bolt)
        archive: PathBuf,
        /// Root of the packages, mounts and bundles directories
        #[arg(long)]
        root: Option<PathBuf>,
    },
    /// Mount a deployed package and its dependencies into a runtime bundle
    Deploy {
        /// Package full name (<id>+<version>)
        name: String,
        /// Root of the packages, mounts and bundles directories
        #[arg(long)]
        root: Option<PathBuf>,
    },
    /// Unmount a deployed package's content layer and the bundles using it
    Teardown {
        /// Package full name (<id>+<version>)
        name: String,
        /// Root of the packages, mounts and bundles directories
        #[arg(long)]
        root: Option<PathBuf>,
    },
}

fn build_settings(no_integrity: bool) -> Settings {
    let mut settings = Settings::default();
    if no_integrity {
        settings.require_integrity = false;
    }
    settings
}

fn deploy_settings(root: Option<PathBuf>) -> Settings {
    match root {
        Some(root) => Settings::default().with_deploy_root(root),
        None => Settings::default(),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    let runner = LocalRunner;

    match cli.command {
        Commands::Pack {
            config,
            content,
            output,
            format,
            no_integrity,
        } => {
            let settings = build_settings(no_integrity);
            let format = format.unwrap_or_else(|| ImageFormat::for_settings(&settings));
            let path = builder::pack(&config, &content, &output, format, &settings, &runner)?;
            println!("{}", path.display());
            Ok(())
        }
        Commands::Make {
            alias,
            directory,
            output,
            format,
            no_integrity,
        } => {
            let settings = build_settings(no_integrity);
            let format = format.unwrap_or_else(|| ImageFormat::for_settings(&settings));
            let path = builder::make(&alias, &directory, &output, format, &settings, &runner)?;
            println!("{}", path.display());
            Ok(())
        }
        Commands::Resolve {
            name,
            directory,
            store,
        } => {
            let settings = Settings::default();
            let work = WorkDir::new()?;
            let store = match store {
                Some(path) if path.is_dir() => LocalStore::at(path, &settings, &work),
                Some(path) => anyhow::bail!("Package store {} is not a directory", path.display()),
                None => LocalStore::discover(&directory, &settings, &work)?,
            };

            // A recipe alias resolves its config against the store
            let recipe = RecipeStore::new(settings.max_search_depth)
                .find(&directory, &name)?;
            let closure = match recipe {
                Some(recipe) => {
                    let full_name = recipe.config.full_name();
                    let provider = BuildProvider::new(Package::from_config(recipe.config), store);
                    resolver::resolve(&full_name, &provider)?
                }
                None => resolver::resolve(&name, &store)?,
            };

            for package in &closure {
                println!("{}", package.full_name());
            }
            Ok(())
        }
        Commands::Diff { bottom, top, layer } => {
            builder::diff(&bottom, &top, &layer)?;
            println!("{}", layer.display());
            Ok(())
        }
        Commands::Install { archive, root } => {
            let settings = deploy_settings(root);
            let full_name = deploy::install(&archive, &settings, &runner)?;
            println!("{}", settings.package_dir(&full_name).display());
            Ok(())
        }
        Commands::Deploy { name, root } => {
            let settings = deploy_settings(root);
            let registry = PlatformRegistry::new();
            let bundle = deploy::deploy(&name, &settings, &runner, &registry)?;

            info!(
                "Start with: crun run --bundle={} {}",
                bundle.dir.display(),
                bundle.name
            );
            println!("{}", bundle.dir.display());
            Ok(())
        }
        Commands::Teardown { name, root } => {
            let settings = deploy_settings(root);
            DeployComposer::new(&settings, &runner).teardown(&name)?;
            Ok(())
        }
    }
}
