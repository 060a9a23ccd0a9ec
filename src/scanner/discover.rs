use super::{parser_for, ManifestKind, ManifestParser};
use crate::error::ScanError;
use crate::model::Project;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use walkdir::{DirEntry, WalkDir};

/// Directories never descended into.
const SKIPPED_DIRS: &[&str] = &["node_modules", ".git"];

/// Paths buffered between the directory walk and the parse dispatcher.
const WALK_BUFFER: usize = 64;

/// Service a manifest belongs to: the first directory below `root` on the
/// way to the manifest, or `root_name` for manifests directly in `root`.
pub fn service_name_for(root: &Path, manifest: &Path, root_name: &str) -> String {
    let relative = manifest.strip_prefix(root).unwrap_or(manifest);
    let mut components = relative
        .components()
        .filter(|c| matches!(c, Component::Normal(_)));

    match (components.next(), components.next()) {
        (Some(first), Some(_)) => first.as_os_str().to_string_lossy().into_owned(),
        _ => root_name.to_string(),
    }
}

fn is_skipped_dir(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| SKIPPED_DIRS.contains(&name))
}

/// Walks `root` and sends every recognised manifest down `tx`. Runs on a
/// blocking thread; stops early when `cancel` fires or the receiver is
/// gone.
fn walk_manifests(
    root: &Path,
    tx: &mpsc::Sender<(PathBuf, ManifestKind)>,
    cancel: &CancellationToken,
) {
    let entries = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| !is_skipped_dir(entry));

    for entry in entries {
        if cancel.is_cancelled() {
            return;
        }
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(error = %err, "skipping unreadable directory entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(kind) = ManifestKind::classify(entry.path()) {
            if tx.blocking_send((entry.into_path(), kind)).is_err() {
                return;
            }
        }
    }
}

/// Finds manifests under a root directory and parses them concurrently.
#[derive(Clone)]
pub struct Discoverer {
    parsers: HashMap<ManifestKind, Arc<dyn ManifestParser>>,
}

impl Default for Discoverer {
    fn default() -> Self {
        Self::new()
    }
}

impl Discoverer {
    /// A discoverer using the built-in parser for every manifest kind.
    pub fn new() -> Self {
        Self {
            parsers: ManifestKind::ALL
                .into_iter()
                .map(|kind| (kind, parser_for(kind)))
                .collect(),
        }
    }

    /// Replaces the parser for the parser's own manifest kind.
    pub fn with_parser(mut self, parser: Arc<dyn ManifestParser>) -> Self {
        self.parsers.insert(parser.kind(), parser);
        self
    }

    /// Returns one [`Project`] per manifest under `root`, ordered by
    /// manifest path.
    ///
    /// The walk runs on a blocking thread and hands each manifest to its
    /// own parse task as soon as it is found. The first parse failure
    /// aborts discovery: outstanding parses are aborted, the walk is
    /// stopped, and that failure is returned.
    pub async fn discover(
        &self,
        root: &Path,
        cancel: &CancellationToken,
    ) -> Result<Vec<Project>, ScanError> {
        let root = tokio::fs::canonicalize(root)
            .await
            .map_err(|e| ScanError::io(root, &e))?;
        if !root.is_dir() {
            return Err(ScanError::Io {
                path: root,
                reason: "not a directory".to_string(),
            });
        }
        let root_name = root
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| root.display().to_string());

        // Stops the walk whenever this function returns.
        let walk_cancel = cancel.child_token();
        let _walk_guard = walk_cancel.clone().drop_guard();

        let (tx, mut rx) = mpsc::channel(WALK_BUFFER);
        let walk_root = root.clone();
        let walker =
            tokio::task::spawn_blocking(move || walk_manifests(&walk_root, &tx, &walk_cancel));

        let mut tasks: JoinSet<Result<Project, ScanError>> = JoinSet::new();
        let mut projects = Vec::new();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ScanError::Cancelled),
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    projects.push(joined??);
                }
                found = rx.recv() => {
                    let Some((path, kind)) = found else { break };
                    let Some(parser) = self.parsers.get(&kind).cloned() else { continue };
                    let service = service_name_for(&root, &path, &root_name);
                    tracing::debug!(path = %path.display(), ?kind, %service, "found manifest");
                    tasks.spawn(async move { parser.parse(&path, &service).await });
                }
            }
        }

        while let Some(joined) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ScanError::Cancelled),
            joined = tasks.join_next() => joined,
        } {
            projects.push(joined??);
        }
        walker.await?;

        projects.sort_by(|a, b| a.manifest_path.cmp(&b.manifest_path));
        tracing::info!(root = %root.display(), projects = projects.len(), "discovery finished");
        Ok(projects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Ecosystem;
    use async_trait::async_trait;
    use std::fs;
    use tempfile::TempDir;

    const CSPROJ: &str = r#"<Project Sdk="Microsoft.NET.Sdk">
  <PropertyGroup><TargetFramework>net8.0</TargetFramework></PropertyGroup>
  <ItemGroup><PackageReference Include="Dapper" Version="2.0.0" /></ItemGroup>
</Project>"#;

    const LOCKFILE: &str = r#"{
  "name": "storefront",
  "lockfileVersion": 3,
  "packages": { "": {}, "node_modules/left-pad": { "version": "1.0.0" } }
}"#;

    fn write(root: &Path, relative: &str, content: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "billing/src/Billing.Api.csproj", CSPROJ);
        write(dir.path(), "web/package-lock.json", LOCKFILE);
        write(dir.path(), "web/node_modules/dep/package-lock.json", LOCKFILE);
        write(dir.path(), "gateway/go.mod", "module github.com/acme/gateway\n");
        write(dir.path(), "go.mod", "module github.com/acme/root\n");
        write(dir.path(), "web/README.md", "# storefront");
        write(dir.path(), ".git/config", "[core]");
        dir
    }

    #[test]
    fn test_service_name_for() {
        let root = Path::new("/repo");
        assert_eq!(
            service_name_for(root, Path::new("/repo/billing/src/App.csproj"), "repo"),
            "billing"
        );
        assert_eq!(service_name_for(root, Path::new("/repo/go.mod"), "repo"), "repo");
    }

    #[tokio::test]
    async fn test_discover_finds_supported_manifests() {
        let dir = tree();
        let projects = Discoverer::new()
            .discover(dir.path(), &CancellationToken::new())
            .await
            .unwrap();

        let mut found: Vec<_> = projects
            .iter()
            .map(|p| (p.service_name.clone(), p.name.clone(), p.ecosystem))
            .collect();
        found.sort();

        let root_name = dir
            .path()
            .canonicalize()
            .unwrap()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .into_owned();
        let mut expected = vec![
            ("billing".to_string(), "Billing.Api".to_string(), Ecosystem::Nuget),
            ("web".to_string(), "storefront".to_string(), Ecosystem::Npm),
            (
                "gateway".to_string(),
                "github.com/acme/gateway".to_string(),
                Ecosystem::GoModule,
            ),
            (root_name, "github.com/acme/root".to_string(), Ecosystem::GoModule),
        ];
        expected.sort();
        assert_eq!(found, expected);
    }

    #[tokio::test]
    async fn test_empty_inventory_is_kept() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "tool/go.mod", "module example.com/tool\n");

        let projects = Discoverer::new()
            .discover(dir.path(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(projects.len(), 1);
        assert!(projects[0].inventory.is_empty());
    }

    #[tokio::test]
    async fn test_parse_failure_aborts_discovery() {
        let dir = tree();
        write(dir.path(), "broken/package-lock.json", "{ not json");

        let err = Discoverer::new()
            .discover(dir.path(), &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            ScanError::Manifest { path, .. } => assert!(path.ends_with("broken/package-lock.json")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_missing_root_is_io_error() {
        let dir = TempDir::new().unwrap();
        let err = Discoverer::new()
            .discover(&dir.path().join("missing"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::Io { .. }));
    }

    struct StalledParser;

    #[async_trait]
    impl ManifestParser for StalledParser {
        fn kind(&self) -> ManifestKind {
            ManifestKind::GoMod
        }

        fn parse_content(&self, _: &str, _: &Path, _: &str) -> Result<Project, ScanError> {
            unreachable!()
        }

        async fn parse(&self, _path: &Path, _service: &str) -> Result<Project, ScanError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_cancellation_stops_discovery() {
        let dir = tree();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = Discoverer::new()
            .with_parser(Arc::new(StalledParser))
            .discover(dir.path(), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
