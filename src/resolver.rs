// src/resolver.rs

//! Dependency closure computation
//!
//! Depth-first, post-order walk from the target package. Every id may appear
//! at exactly one version across the whole graph; there is no range solving
//! and no backtracking. The result lists dependencies before dependents with
//! the target last, and siblings in each config's declaration order.

use crate::error::{Error, Result};
use crate::package::{Package, PackageProvider};
use std::collections::HashMap;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

struct Node {
    version: String,
    mark: Mark,
    package: Option<Package>,
}

/// Walk state over an arena of nodes indexed by package id
struct Walk<'p> {
    provider: &'p dyn PackageProvider,
    nodes: Vec<Node>,
    by_id: HashMap<String, usize>,
    order: Vec<usize>,
    /// Full names on the current DFS path, for cycle reports
    path: Vec<String>,
}

impl Walk<'_> {
    fn visit(&mut self, full_name: &str) -> Result<()> {
        let package = self
            .provider
            .lookup(full_name)?
            .ok_or_else(|| Error::PackageNotFound(full_name.to_string()))?;

        if package.full_name() != full_name {
            return Err(Error::IdentityMismatch {
                requested: full_name.to_string(),
                found: package.full_name(),
            });
        }

        debug!("Found {} in {:?}", full_name, package.source());

        let id = package.identity().id.clone();
        let version = package.identity().version.clone();

        if let Some(&index) = self.by_id.get(&id) {
            let node = &self.nodes[index];
            if node.version != version {
                return Err(Error::VersionConflict {
                    id,
                    first: node.version.clone(),
                    second: version,
                });
            }
            if node.mark == Mark::InProgress {
                let start = self
                    .path
                    .iter()
                    .position(|name| name == full_name)
                    .unwrap_or(0);
                let mut cycle = self.path[start..].to_vec();
                cycle.push(full_name.to_string());
                return Err(Error::CyclicDependency(cycle));
            }
            warn!(
                "Multiple packages depend on the same package {}",
                full_name
            );
            return Ok(());
        }

        let dependencies: Vec<String> = package
            .dependencies()
            .iter()
            .map(|dependency| dependency.full_name())
            .collect();

        let index = self.nodes.len();
        self.nodes.push(Node {
            version,
            mark: Mark::InProgress,
            package: Some(package),
        });
        self.by_id.insert(id, index);
        self.path.push(full_name.to_string());

        for dependency in &dependencies {
            self.visit(dependency)?;
        }

        self.path.pop();
        self.nodes[index].mark = Mark::Done;
        self.order.push(index);
        debug!("Resolved {}", full_name);
        Ok(())
    }
}

/// Compute the ordered dependency closure of `target`
pub fn resolve(target: &str, provider: &dyn PackageProvider) -> Result<Vec<Package>> {
    let mut walk = Walk {
        provider,
        nodes: Vec::new(),
        by_id: HashMap::new(),
        order: Vec::new(),
        path: Vec::new(),
    };
    walk.visit(target)?;

    let Walk {
        mut nodes, order, ..
    } = walk;
    Ok(order
        .into_iter()
        .filter_map(|index| nodes[index].package.take())
        .collect())
}
