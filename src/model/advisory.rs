use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    #[serde(other)]
    Unknown,
}

impl Severity {
    /// Parses an advisory severity string; anything unrecognised is
    /// [`Severity::Unknown`].
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "critical" => Severity::Critical,
            "high" => Severity::High,
            "medium" | "moderate" => Severity::Medium,
            "low" => Severity::Low,
            _ => Severity::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
            Severity::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One affected package named by an advisory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vulnerability {
    /// Package name as the advisory source spells it.
    pub package_name: String,
    /// Version taken from the scanned project's inventory.
    pub current_version: String,
    pub vulnerable_version_range: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_patched_version: Option<String>,
}

/// An advisory returned for a project, with every vulnerability entry it
/// lists for that project's packages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannedPackage {
    pub advisory_id: String,
    pub summary: String,
    pub description: String,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reviewed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub vulnerabilities: Vec<Vulnerability>,
    /// Sortable severity ordinal; see [`crate::checker::assign_risk_scores`].
    pub risk_score: u8,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub project_name: String,
}

impl ScannedPackage {
    pub fn new(advisory_id: impl Into<String>, severity: Severity) -> Self {
        Self {
            advisory_id: advisory_id.into(),
            summary: String::new(),
            description: String::new(),
            severity,
            reviewed_at: None,
            url: None,
            vulnerabilities: Vec::new(),
            risk_score: 0,
            service_name: String::new(),
            project_name: String::new(),
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    pub fn with_vulnerability(mut self, vulnerability: Vulnerability) -> Self {
        self.vulnerabilities.push(vulnerability);
        self
    }
}
