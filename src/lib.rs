// src/lib.rs

//! Bolt package tooling
//!
//! Builds, resolves and deploys self-contained packages distributed as
//! content-addressed archives with exact-version dependencies.
//!
//! # Architecture
//!
//! - Packages: zip archives holding an OCI layout with one config blob and
//!   one content layer
//! - Resolution: a single depth-first resolver over any `PackageProvider`,
//!   shared by build and deploy
//! - Build: dependency layers are flattened into one layer, later packages
//!   overriding earlier ones
//! - Deploy: layers are mounted (through dm-verity when bound) and unioned
//!   with overlayfs, the target package's files on top

pub mod builder;
pub mod config;
pub mod deploy;
mod error;
pub mod exec;
pub mod oci;
pub mod package;
pub mod resolver;
pub mod verity;

pub use error::{Error, Result};
