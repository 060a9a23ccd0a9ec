use crate::error::ScanError;
use crate::model::{is_pinned, Ecosystem, Inventory, ScannedPackage, Severity, Vulnerability};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header;
use serde::Deserialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_ADVISORY_URL: &str = "https://api.github.com";

/// Client for the GitHub global security advisories endpoint.
pub struct GithubAdvisoryClient {
    client: reqwest::Client,
    base_url: String,
}

impl GithubAdvisoryClient {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, ScanError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("deepscan/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn advisories_url(&self) -> String {
        format!("{}/advisories", self.base_url)
    }
}

/// Builds the `affects` filter: `name` or `name@version`, comma separated.
/// Unpinned versions are sent as the bare package name.
fn affects_filter(packages: &Inventory) -> String {
    packages
        .iter()
        .map(|(name, version)| {
            if is_pinned(version) {
                format!("{}@{}", name, version.trim())
            } else {
                name.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(Deserialize)]
struct GithubAdvisory {
    ghsa_id: Option<String>,
    summary: Option<String>,
    description: Option<String>,
    severity: Option<String>,
    github_reviewed_at: Option<DateTime<Utc>>,
    html_url: Option<String>,
    #[serde(default)]
    vulnerabilities: Vec<GithubVulnerability>,
}

#[derive(Deserialize)]
struct GithubVulnerability {
    package: Option<GithubPackage>,
    vulnerable_version_range: Option<String>,
    first_patched_version: Option<PatchedVersion>,
}

#[derive(Deserialize)]
struct GithubPackage {
    name: String,
}

// Older payloads wrap the version in an object.
#[derive(Deserialize)]
#[serde(untagged)]
enum PatchedVersion {
    Plain(String),
    Identified { identifier: String },
}

impl PatchedVersion {
    fn into_string(self) -> String {
        match self {
            PatchedVersion::Plain(v) => v,
            PatchedVersion::Identified { identifier } => identifier,
        }
    }
}

#[derive(Deserialize)]
struct GithubError {
    message: Option<String>,
    documentation_url: Option<String>,
}

impl From<GithubAdvisory> for ScannedPackage {
    fn from(advisory: GithubAdvisory) -> Self {
        let severity = advisory
            .severity
            .as_deref()
            .map(Severity::parse)
            .unwrap_or(Severity::Unknown);

        let vulnerabilities = advisory
            .vulnerabilities
            .into_iter()
            .filter_map(|v| {
                Some(Vulnerability {
                    package_name: v.package?.name,
                    current_version: String::new(),
                    vulnerable_version_range: v.vulnerable_version_range.unwrap_or_default(),
                    first_patched_version: v
                        .first_patched_version
                        .map(PatchedVersion::into_string)
                        .filter(|s| !s.is_empty()),
                })
            })
            .collect();

        let mut package = ScannedPackage::new(advisory.ghsa_id.unwrap_or_default(), severity)
            .with_summary(advisory.summary.unwrap_or_default());
        package.description = advisory.description.unwrap_or_default();
        package.reviewed_at = advisory.github_reviewed_at;
        package.url = advisory.html_url;
        package.vulnerabilities = vulnerabilities;
        package
    }
}

/// Turns a non-success response into [`ScanError::Status`], using the
/// structured error body when there is one.
async fn status_error(response: reqwest::Response) -> ScanError {
    let status = response.status().as_u16();
    let message = match response.text().await {
        Ok(body) => match serde_json::from_str::<GithubError>(&body) {
            Ok(GithubError {
                message: Some(message),
                documentation_url,
            }) => match documentation_url {
                Some(url) => format!("{} ({})", message, url),
                None => message,
            },
            _ if body.trim().is_empty() => "empty error body".to_string(),
            _ => body,
        },
        Err(err) => format!("failed to read error body: {}", err),
    };
    ScanError::Status { status, message }
}

#[async_trait]
impl super::AdvisorySource for GithubAdvisoryClient {
    fn name(&self) -> &'static str {
        "GitHub Advisories"
    }

    async fn query(
        &self,
        ecosystem: Ecosystem,
        packages: &Inventory,
        bearer_token: Option<&str>,
        _cancel: &CancellationToken,
    ) -> Result<Vec<ScannedPackage>, ScanError> {
        if packages.is_empty() {
            return Ok(Vec::new());
        }

        let affects = affects_filter(packages);
        let mut request = self
            .client
            .get(self.advisories_url())
            .header(header::ACCEPT, "application/vnd.github+json")
            .query(&[
                ("ecosystem", ecosystem.advisory_name()),
                ("affects", affects.as_str()),
                ("per_page", "100"),
            ]);

        if let Some(token) = bearer_token {
            request = request.bearer_auth(token);
        }

        tracing::debug!(%ecosystem, packages = packages.len(), "querying advisories");
        let response = request.send().await?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let advisories: Vec<GithubAdvisory> = response
            .json()
            .await
            .map_err(|e| ScanError::Decode(e.to_string()))?;

        Ok(advisories.into_iter().map(ScannedPackage::from).collect())
    }
}
