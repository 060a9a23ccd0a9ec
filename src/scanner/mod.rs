//! Manifest discovery and parsing.
//!
//! This module provides the [`ManifestParser`] trait, one parser per
//! supported manifest type, and the [`Discoverer`] that walks a directory
//! tree and turns every recognised manifest into a [`Project`].
//!
//! # Supported Manifests
//!
//! | Kind | File | Ecosystem |
//! |------|------|-----------|
//! | [`ManifestKind::Csproj`] | `*.csproj` | NuGet |
//! | [`ManifestKind::PackageLock`] | `package-lock.json` | npm |
//! | [`ManifestKind::GoMod`] | `go.mod` | Go modules |
//!
//! # Example
//!
//! ```no_run
//! use deepscan::scanner::Discoverer;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), deepscan::error::ScanError> {
//!     let projects = Discoverer::new()
//!         .discover("./services".as_ref(), &CancellationToken::new())
//!         .await?;
//!     for project in projects {
//!         println!("{}/{}: {} packages", project.service_name, project.name, project.inventory.len());
//!     }
//!     Ok(())
//! }
//! ```

mod csproj;
mod discover;
mod gomod;
mod npm;

pub use csproj::CsprojParser;
pub use discover::{service_name_for, Discoverer};
pub use gomod::GoModParser;
pub use npm::PackageLockParser;

use crate::error::ScanError;
use crate::model::{Ecosystem, Project};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

/// A manifest type recognised by file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManifestKind {
    Csproj,
    PackageLock,
    GoMod,
}

impl ManifestKind {
    pub const ALL: [ManifestKind; 3] = [
        ManifestKind::Csproj,
        ManifestKind::PackageLock,
        ManifestKind::GoMod,
    ];

    /// Classifies `path` by its file name; `None` for anything unsupported.
    pub fn classify(path: &Path) -> Option<Self> {
        let file_name = path.file_name()?.to_str()?;
        if file_name.to_ascii_lowercase().ends_with(".csproj") {
            Some(ManifestKind::Csproj)
        } else if file_name == "package-lock.json" {
            Some(ManifestKind::PackageLock)
        } else if file_name == "go.mod" {
            Some(ManifestKind::GoMod)
        } else {
            None
        }
    }

    pub fn ecosystem(&self) -> Ecosystem {
        match self {
            ManifestKind::Csproj => Ecosystem::Nuget,
            ManifestKind::PackageLock => Ecosystem::Npm,
            ManifestKind::GoMod => Ecosystem::GoModule,
        }
    }
}

/// Turns one manifest file into a [`Project`].
#[async_trait]
pub trait ManifestParser: Send + Sync {
    /// The manifest type this parser handles.
    fn kind(&self) -> ManifestKind;

    /// Parses manifest text. `path` is only used for naming and errors.
    fn parse_content(
        &self,
        content: &str,
        path: &Path,
        service_name: &str,
    ) -> Result<Project, ScanError>;

    /// Reads and parses the manifest at `path`.
    async fn parse(&self, path: &Path, service_name: &str) -> Result<Project, ScanError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ScanError::io(path, &e))?;
        self.parse_content(&content, path, service_name)
    }
}

/// Returns the built-in parser for `kind`.
pub fn parser_for(kind: ManifestKind) -> Arc<dyn ManifestParser> {
    match kind {
        ManifestKind::Csproj => Arc::new(CsprojParser),
        ManifestKind::PackageLock => Arc::new(PackageLockParser),
        ManifestKind::GoMod => Arc::new(GoModParser),
    }
}

/// Name of the directory holding `path`, used when a manifest names no
/// project of its own.
fn parent_dir_name(path: &Path) -> Option<String> {
    path.parent()?
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(
            ManifestKind::classify(Path::new("svc/Billing.Api.csproj")),
            Some(ManifestKind::Csproj)
        );
        assert_eq!(
            ManifestKind::classify(Path::new("LEGACY.CSPROJ")),
            Some(ManifestKind::Csproj)
        );
        assert_eq!(
            ManifestKind::classify(Path::new("web/package-lock.json")),
            Some(ManifestKind::PackageLock)
        );
        assert_eq!(
            ManifestKind::classify(Path::new("api/go.mod")),
            Some(ManifestKind::GoMod)
        );
        assert_eq!(ManifestKind::classify(Path::new("web/package.json")), None);
        assert_eq!(ManifestKind::classify(Path::new("api/go.sum")), None);
        assert_eq!(ManifestKind::classify(Path::new("README.md")), None);
    }

    #[test]
    fn test_parser_for_matches_kind() {
        for kind in ManifestKind::ALL {
            assert_eq!(parser_for(kind).kind(), kind);
        }
    }
}
