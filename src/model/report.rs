use super::{Ecosystem, Project, ScannedPackage, Severity};
use crate::error::ScanError;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

/// Advisories resolved for one project.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectScan {
    pub service_name: String,
    pub project_name: String,
    pub ecosystem: Ecosystem,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub framework: Option<String>,
    pub package_count: usize,
    pub packages: Vec<ScannedPackage>,
}

impl ProjectScan {
    pub fn new(project: &Project, packages: Vec<ScannedPackage>) -> Self {
        Self {
            service_name: project.service_name.clone(),
            project_name: project.name.clone(),
            ecosystem: project.ecosystem,
            framework: project.framework_label(),
            package_count: project.inventory.len(),
            packages,
        }
    }
}

/// A project whose scan failed, with the cause.
#[derive(Debug, Clone, Serialize)]
pub struct FailedProject {
    pub service_name: String,
    pub project_name: String,
    #[serde(serialize_with = "serialize_error")]
    pub cause: ScanError,
}

fn serialize_error<S: Serializer>(err: &ScanError, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&err.to_string())
}

/// The single result a project's scan task produces.
#[derive(Debug, Clone)]
pub enum ScanOutcome {
    Success(ProjectScan),
    Failure(FailedProject),
}

impl ScanOutcome {
    pub fn failure(project: &Project, cause: ScanError) -> Self {
        ScanOutcome::Failure(FailedProject {
            service_name: project.service_name.clone(),
            project_name: project.name.clone(),
            cause,
        })
    }
}

/// Aggregate of a scan across one or more projects.
#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub scan_time: DateTime<Utc>,
    pub succeeded: Vec<ProjectScan>,
    pub failed: Vec<FailedProject>,
}

impl ScanReport {
    pub fn new(succeeded: Vec<ProjectScan>, failed: Vec<FailedProject>) -> Self {
        Self {
            scan_time: Utc::now(),
            succeeded,
            failed,
        }
    }

    /// Splits outcomes into successes and failures. Order of `outcomes`
    /// does not matter; both lists are sorted by service then project.
    pub fn from_outcomes(outcomes: impl IntoIterator<Item = ScanOutcome>) -> Self {
        let mut succeeded = Vec::new();
        let mut failed = Vec::new();

        for outcome in outcomes {
            match outcome {
                ScanOutcome::Success(scan) => succeeded.push(scan),
                ScanOutcome::Failure(failure) => failed.push(failure),
            }
        }

        succeeded.sort_by(|a, b| {
            (&a.service_name, &a.project_name).cmp(&(&b.service_name, &b.project_name))
        });
        failed.sort_by(|a, b| {
            (&a.service_name, &a.project_name).cmp(&(&b.service_name, &b.project_name))
        });

        Self::new(succeeded, failed)
    }

    /// Every advisory across all successful projects, tagged with the
    /// service and project it was found in.
    pub fn packages(&self) -> Vec<ScannedPackage> {
        flatten_packages(&self.succeeded)
    }

    pub fn count_severity(&self, severity: Severity) -> usize {
        self.succeeded
            .iter()
            .flat_map(|scan| scan.packages.iter())
            .filter(|pkg| pkg.severity == severity)
            .count()
    }
}

pub fn flatten_packages(scans: &[ProjectScan]) -> Vec<ScannedPackage> {
    scans
        .iter()
        .flat_map(|scan| {
            scan.packages.iter().cloned().map(move |mut pkg| {
                pkg.service_name = scan.service_name.clone();
                pkg.project_name = scan.project_name.clone();
                pkg
            })
        })
        .collect()
}
