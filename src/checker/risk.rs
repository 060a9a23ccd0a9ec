use crate::model::{ScannedPackage, Severity};

/// Sortable ordinal for a severity; higher is worse.
pub fn risk_score(severity: Severity) -> u8 {
    match severity {
        Severity::Critical => 4,
        Severity::High => 3,
        Severity::Medium => 2,
        Severity::Low => 1,
        Severity::Unknown => 0,
    }
}

pub fn assign_risk_scores(packages: &mut [ScannedPackage]) {
    for package in packages {
        package.risk_score = risk_score(package.severity);
    }
}

/// Orders packages by descending risk score, keeping the relative order of
/// equal scores.
pub fn sort_by_risk(packages: &mut [ScannedPackage]) {
    packages.sort_by(|a, b| b.risk_score.cmp(&a.risk_score));
}
