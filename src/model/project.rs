use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Package name to version, as read from one manifest.
///
/// Versions are opaque strings in the ecosystem's own format. An empty
/// version or `"0.0.0"` means the version is unknown or unpinned.
pub type Inventory = BTreeMap<String, String>;

/// Version sentinel used by manifests that do not pin a version.
pub const UNPINNED_VERSION: &str = "0.0.0";

/// Returns true if `version` names a concrete version worth sending to
/// the advisory source.
pub fn is_pinned(version: &str) -> bool {
    let version = version.trim();
    !version.is_empty() && version != UNPINNED_VERSION
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Ecosystem {
    Nuget,
    Npm,
    GoModule,
}

impl Ecosystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            Ecosystem::Nuget => "nuget",
            Ecosystem::Npm => "npm",
            Ecosystem::GoModule => "go-module",
        }
    }

    /// The ecosystem name understood by the advisory source.
    pub fn advisory_name(&self) -> &'static str {
        match self {
            Ecosystem::Nuget => "nuget",
            Ecosystem::Npm => "npm",
            Ecosystem::GoModule => "go",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Ecosystem::Nuget => "NuGet",
            Ecosystem::Npm => "npm",
            Ecosystem::GoModule => "Go",
        }
    }
}

impl std::fmt::Display for Ecosystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Ecosystem-specific build target information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FrameworkInfo {
    /// `TargetFramework` / `TargetFrameworks` of a .NET project.
    Dotnet {
        target: Option<String>,
        targets: Option<String>,
    },
    /// `go` directive of a module file.
    Go { version: String },
}

impl FrameworkInfo {
    /// Human-readable framework label, preferring the single target.
    pub fn label(&self) -> Option<String> {
        match self {
            FrameworkInfo::Dotnet { target, targets } => non_empty(target)
                .or_else(|| non_empty(targets))
                .map(str::to_string),
            FrameworkInfo::Go { version } => Some(format!("go {}", version)),
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// One manifest's worth of packages, ready to be resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub service_name: String,
    pub name: String,
    pub ecosystem: Ecosystem,
    pub inventory: Inventory,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub framework: Option<FrameworkInfo>,
    pub manifest_path: PathBuf,
}

impl Project {
    pub fn new(
        service_name: impl Into<String>,
        name: impl Into<String>,
        ecosystem: Ecosystem,
        manifest_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            name: name.into(),
            ecosystem,
            inventory: Inventory::new(),
            framework: None,
            manifest_path: manifest_path.into(),
        }
    }

    pub fn with_inventory(mut self, inventory: Inventory) -> Self {
        self.inventory = inventory;
        self
    }

    pub fn with_framework(mut self, framework: FrameworkInfo) -> Self {
        self.framework = Some(framework);
        self
    }

    pub fn framework_label(&self) -> Option<String> {
        self.framework.as_ref().and_then(FrameworkInfo::label)
    }

    /// Checks the fields a project needs before it can be scanned.
    ///
    /// Only .NET projects have a required field: at least one of the
    /// single- or multi-target framework properties.
    pub fn validate(&self) -> Result<(), crate::error::ScanError> {
        if self.ecosystem == Ecosystem::Nuget && self.framework_label().is_none() {
            return Err(crate::error::ScanError::Validation {
                project: self.name.clone(),
                reason: "no TargetFramework or TargetFrameworks found".to_string(),
            });
        }
        Ok(())
    }
}
