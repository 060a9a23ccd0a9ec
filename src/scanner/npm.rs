use super::{parent_dir_name, ManifestKind, ManifestParser};
use crate::error::ScanError;
use crate::model::{Ecosystem, Inventory, Project};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;

/// Parser for `package-lock.json`, lockfile versions 1 through 3.
pub struct PackageLockParser;

#[derive(Deserialize)]
struct PackageLock {
    name: Option<String>,
    #[serde(default)]
    packages: BTreeMap<String, LockPackage>,
    #[serde(default)]
    dependencies: BTreeMap<String, LockDependency>,
}

// v2/v3 entries, keyed by install path.
#[derive(Deserialize)]
struct LockPackage {
    version: Option<String>,
}

// v1 entries, nested by dependency tree.
#[derive(Deserialize)]
struct LockDependency {
    version: Option<String>,
    #[serde(default)]
    dependencies: BTreeMap<String, LockDependency>,
}

const NODE_MODULES: &str = "node_modules/";

/// Reduces an install path like `node_modules/a/node_modules/@s/b` to `@s/b`.
/// Paths outside `node_modules` (the root, workspace folders) yield `None`.
fn package_name_from_path(key: &str) -> Option<&str> {
    let index = key.rfind(NODE_MODULES)?;
    Some(&key[index + NODE_MODULES.len()..]).filter(|name| !name.is_empty())
}

/// Shallow install paths first, so hoisted versions win over nested ones.
fn inventory_from_packages(packages: &BTreeMap<String, LockPackage>) -> Inventory {
    let mut entries: Vec<_> = packages.iter().collect();
    entries.sort_by_key(|(key, _)| key.matches(NODE_MODULES).count());

    let mut inventory = Inventory::new();
    for (key, package) in entries {
        let Some(name) = package_name_from_path(key) else {
            continue;
        };
        let Some(version) = package.version.as_deref().filter(|v| !v.is_empty()) else {
            continue;
        };
        inventory
            .entry(name.to_string())
            .or_insert_with(|| version.to_string());
    }
    inventory
}

/// Flattens the v1 tree breadth first so hoisted versions win over
/// nested ones.
fn inventory_from_dependencies(dependencies: &BTreeMap<String, LockDependency>) -> Inventory {
    let mut inventory = Inventory::new();
    let mut queue: VecDeque<&BTreeMap<String, LockDependency>> = VecDeque::from([dependencies]);

    while let Some(level) = queue.pop_front() {
        for (name, dependency) in level {
            if let Some(version) = dependency.version.as_deref().filter(|v| !v.is_empty()) {
                inventory
                    .entry(name.clone())
                    .or_insert_with(|| version.to_string());
            }
            if !dependency.dependencies.is_empty() {
                queue.push_back(&dependency.dependencies);
            }
        }
    }
    inventory
}

#[async_trait]
impl ManifestParser for PackageLockParser {
    fn kind(&self) -> ManifestKind {
        ManifestKind::PackageLock
    }

    fn parse_content(
        &self,
        content: &str,
        path: &Path,
        service_name: &str,
    ) -> Result<Project, ScanError> {
        let lock: PackageLock = serde_json::from_str(content)
            .map_err(|e| ScanError::manifest(path, format!("invalid JSON: {}", e)))?;

        let inventory = if lock.packages.is_empty() {
            inventory_from_dependencies(&lock.dependencies)
        } else {
            inventory_from_packages(&lock.packages)
        };

        let name = lock
            .name
            .filter(|n| !n.is_empty())
            .or_else(|| parent_dir_name(path))
            .unwrap_or_else(|| service_name.to_string());

        Ok(Project::new(service_name, name, Ecosystem::Npm, path).with_inventory(inventory))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(content: &str) -> Result<Project, ScanError> {
        PackageLockParser.parse_content(content, Path::new("web/storefront/package-lock.json"), "web")
    }

    #[test]
    fn test_lockfile_v3_packages() {
        let content = r#"{
            "name": "storefront",
            "lockfileVersion": 3,
            "packages": {
                "": { "name": "storefront", "version": "2.0.0" },
                "node_modules/left-pad": { "version": "1.0.0" },
                "node_modules/@babel/core": { "version": "7.24.0" },
                "node_modules/express/node_modules/qs": { "version": "6.5.0" },
                "node_modules/qs": { "version": "6.11.0" },
                "node_modules/linked": { "resolved": "../linked", "link": true }
            }
        }"#;
        let project = parse(content).unwrap();

        assert_eq!(project.name, "storefront");
        assert_eq!(project.ecosystem, Ecosystem::Npm);
        assert_eq!(project.inventory.len(), 3);
        assert_eq!(project.inventory["left-pad"], "1.0.0");
        assert_eq!(project.inventory["@babel/core"], "7.24.0");
        assert_eq!(project.inventory["qs"], "6.11.0");
        assert!(!project.inventory.contains_key("linked"));
    }

    #[test]
    fn test_lockfile_v1_nested_dependencies() {
        let content = r#"{
            "lockfileVersion": 1,
            "dependencies": {
                "express": {
                    "version": "4.17.1",
                    "dependencies": {
                        "qs": { "version": "6.7.0" },
                        "debug": { "version": "2.6.9" }
                    }
                },
                "qs": { "version": "6.11.0" }
            }
        }"#;
        let project = parse(content).unwrap();

        // No name in the lockfile: falls back to the directory.
        assert_eq!(project.name, "storefront");
        assert_eq!(project.inventory.len(), 3);
        assert_eq!(project.inventory["qs"], "6.11.0");
        assert_eq!(project.inventory["debug"], "2.6.9");
    }

    #[test]
    fn test_empty_lockfile_has_empty_inventory() {
        let project = parse(r#"{ "name": "empty", "lockfileVersion": 3, "packages": { "": {} } }"#)
            .unwrap();
        assert!(project.inventory.is_empty());
    }

    #[test]
    fn test_invalid_json_is_manifest_error() {
        assert!(matches!(
            parse("{ not json").unwrap_err(),
            ScanError::Manifest { .. }
        ));
    }

    #[test]
    fn test_package_name_from_path() {
        assert_eq!(package_name_from_path("node_modules/a"), Some("a"));
        assert_eq!(
            package_name_from_path("node_modules/a/node_modules/@s/b"),
            Some("@s/b")
        );
        assert_eq!(package_name_from_path("packages/workspace-a"), None);
        assert_eq!(package_name_from_path(""), None);
    }
}
