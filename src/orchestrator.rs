//! Per-project scanning under two failure policies.
//!
//! - [`Orchestrator::scan_root`] - one materialized tree, all or nothing.
//!   The first failing project cancels its siblings and the whole scan
//!   returns that project's error.
//! - [`Orchestrator::scan_all`] - every discovered project independently.
//!   Each project yields exactly one [`ScanOutcome`] and a failure never
//!   cancels siblings.
//!
//! Both modes share one semaphore-bounded worker pool, so at most
//! `max_concurrent` projects are talking to the advisory source at once.

use crate::checker::{assign_risk_scores, BatchPlanner};
use crate::config::IgnoreConfig;
use crate::error::ScanError;
use crate::model::{
    FailedProject, Project, ProjectScan, ScanOutcome, ScanReport, ScannedPackage,
};
use crate::scanner::Discoverer;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::{Id, JoinSet};
use tokio_util::sync::CancellationToken;

/// Projects resolving advisories at once unless configured otherwise.
pub const DEFAULT_MAX_CONCURRENT_PROJECTS: usize = 2;

/// Everything one project task needs, cheap to clone into each task.
#[derive(Clone)]
struct ProjectWorker {
    planner: BatchPlanner,
    ignore: Arc<IgnoreConfig>,
    limit: Arc<Semaphore>,
}

impl ProjectWorker {
    /// Validates and resolves one project. `Ok(None)` means there was
    /// nothing to query.
    async fn scan(
        &self,
        project: &Project,
        cancel: &CancellationToken,
    ) -> Result<Option<ProjectScan>, ScanError> {
        project.validate()?;

        let inventory = self.ignore.filter_inventory(&project.inventory);
        if inventory.is_empty() {
            tracing::debug!(service = %project.service_name, project = %project.name, "no packages to query, skipping");
            return Ok(None);
        }

        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ScanError::Cancelled),
            permit = self.limit.acquire() => permit.map_err(|_| ScanError::Cancelled)?,
        };

        tracing::info!(
            service = %project.service_name,
            project = %project.name,
            ecosystem = %project.ecosystem,
            packages = inventory.len(),
            "scanning project"
        );
        let mut packages = self
            .planner
            .resolve(project.ecosystem, &inventory, cancel)
            .await?;

        packages.retain(|package| !self.ignore.should_ignore_advisory(&package.advisory_id));
        assign_risk_scores(&mut packages);
        for package in &mut packages {
            package.service_name = project.service_name.clone();
            package.project_name = project.name.clone();
        }

        Ok(Some(ProjectScan::new(project, packages)))
    }
}

/// Drives discovery and per-project resolution.
pub struct Orchestrator {
    discoverer: Discoverer,
    planner: BatchPlanner,
    ignore: Arc<IgnoreConfig>,
    max_concurrent: usize,
}

impl Orchestrator {
    pub fn new(discoverer: Discoverer, planner: BatchPlanner) -> Self {
        Self {
            discoverer,
            planner,
            ignore: Arc::new(IgnoreConfig::default()),
            max_concurrent: DEFAULT_MAX_CONCURRENT_PROJECTS,
        }
    }

    /// Caps how many projects resolve advisories at the same time.
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    pub fn with_ignore(mut self, ignore: IgnoreConfig) -> Self {
        self.ignore = Arc::new(ignore);
        self
    }

    fn worker(&self) -> ProjectWorker {
        ProjectWorker {
            planner: self.planner.clone(),
            ignore: Arc::clone(&self.ignore),
            limit: Arc::new(Semaphore::new(self.max_concurrent)),
        }
    }

    /// Discovers and scans one root, failing as a whole on the first
    /// project error.
    pub async fn scan_root(
        &self,
        root: &Path,
        cancel: &CancellationToken,
    ) -> Result<ScanReport, ScanError> {
        let projects = self.discoverer.discover(root, cancel).await?;
        let scans = self.scan_projects(projects, cancel).await?;
        Ok(ScanReport::from_outcomes(
            scans.into_iter().map(ScanOutcome::Success),
        ))
    }

    /// [`scan_root`](Self::scan_root), flattened to the advisories found.
    pub async fn discover_and_scan_root(
        &self,
        root: &Path,
        cancel: &CancellationToken,
    ) -> Result<Vec<ScannedPackage>, ScanError> {
        Ok(self.scan_root(root, cancel).await?.packages())
    }

    /// Discovers every project under `root` and scans each independently.
    ///
    /// Only a discovery failure fails the call; project failures are
    /// reported in [`ScanReport::failed`].
    pub async fn scan_all(
        &self,
        root: &Path,
        cancel: &CancellationToken,
    ) -> Result<ScanReport, ScanError> {
        let projects = self.discoverer.discover(root, cancel).await?;
        Ok(self.scan_each(projects, cancel).await)
    }

    /// Fail-fast scan of already discovered projects.
    ///
    /// Projects with nothing to query produce no entry. On the first
    /// failure the remaining tasks are cancelled and their results
    /// discarded; the error is wrapped with the failing project's identity.
    /// An outer cancellation is returned as [`ScanError::Cancelled`].
    pub async fn scan_projects(
        &self,
        projects: Vec<Project>,
        cancel: &CancellationToken,
    ) -> Result<Vec<ProjectScan>, ScanError> {
        let group = cancel.child_token();
        let _group_guard = group.clone().drop_guard();
        let worker = self.worker();
        let results: Arc<Mutex<Vec<ProjectScan>>> = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = JoinSet::new();
        let mut identities: HashMap<Id, (String, String)> = HashMap::new();

        for project in projects {
            let worker = worker.clone();
            let group = group.clone();
            let results = Arc::clone(&results);
            let identity = (project.service_name.clone(), project.name.clone());

            let handle = tasks.spawn(async move {
                match worker.scan(&project, &group).await {
                    Ok(Some(scan)) => {
                        results.lock().await.push(scan);
                        Ok(())
                    }
                    Ok(None) => Ok(()),
                    Err(err) => Err(err.for_project(&project.service_name, &project.name)),
                }
            });
            identities.insert(handle.id(), identity);
        }

        while let Some(joined) = tasks.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(join_err) => {
                    let (service, project) = identities
                        .remove(&join_err.id())
                        .unwrap_or_default();
                    Err(ScanError::from(join_err).for_project(service, project))
                }
            };

            if let Err(err) = result {
                group.cancel();
                tasks.shutdown().await;
                if cancel.is_cancelled() {
                    return Err(ScanError::Cancelled);
                }
                tracing::warn!(error = %err, "project scan failed, cancelled remaining projects");
                return Err(err);
            }
        }

        let scans = std::mem::take(&mut *results.lock().await);
        Ok(scans)
    }

    /// Collect-all scan of already discovered projects.
    ///
    /// Every project yields exactly one outcome over a completion channel;
    /// panicked tasks become failures too. The channel is drained only
    /// after every task has been joined.
    pub async fn scan_each(&self, projects: Vec<Project>, cancel: &CancellationToken) -> ScanReport {
        let worker = self.worker();
        let (tx, mut rx) = mpsc::channel::<ScanOutcome>(projects.len().max(1));

        let mut tasks = JoinSet::new();
        let mut identities: HashMap<Id, (String, String)> = HashMap::new();

        for project in projects {
            let worker = worker.clone();
            let cancel = cancel.clone();
            let tx = tx.clone();
            let identity = (project.service_name.clone(), project.name.clone());

            let handle = tasks.spawn(async move {
                let outcome = match worker.scan(&project, &cancel).await {
                    Ok(Some(scan)) => ScanOutcome::Success(scan),
                    Ok(None) => ScanOutcome::Success(ProjectScan::new(&project, Vec::new())),
                    Err(err) => {
                        tracing::warn!(
                            service = %project.service_name,
                            project = %project.name,
                            error = %err,
                            "project scan failed"
                        );
                        ScanOutcome::failure(&project, err)
                    }
                };
                // Capacity covers every project, so this never waits.
                if tx.send(outcome).await.is_err() {
                    tracing::debug!("outcome receiver dropped");
                }
            });
            identities.insert(handle.id(), identity);
        }
        drop(tx);

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            if let Err(join_err) = joined {
                let (service_name, project_name) =
                    identities.remove(&join_err.id()).unwrap_or_default();
                outcomes.push(ScanOutcome::Failure(FailedProject {
                    service_name,
                    project_name,
                    cause: ScanError::from(join_err),
                }));
            }
        }
        while let Some(outcome) = rx.recv().await {
            outcomes.push(outcome);
        }

        let report = ScanReport::from_outcomes(outcomes);
        tracing::info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "scan finished"
        );
        report
    }
}
