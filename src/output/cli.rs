use crate::checker::sort_by_risk;
use crate::model::{ScanReport, ScannedPackage, Severity};
use anyhow::Result;
use semver::Version;
use std::fmt::Write;
use tabled::{settings::Style, Table, Tabled};

#[derive(Tabled)]
struct ProjectRow {
    #[tabled(rename = "Service")]
    service: String,
    #[tabled(rename = "Project")]
    project: String,
    #[tabled(rename = "Ecosystem")]
    ecosystem: String,
    #[tabled(rename = "Framework")]
    framework: String,
    #[tabled(rename = "Packages")]
    packages: usize,
    #[tabled(rename = "Advisories")]
    advisories: usize,
}

#[derive(Tabled)]
struct VulnRow {
    #[tabled(rename = "Severity")]
    severity: String,
    #[tabled(rename = "Project")]
    project: String,
    #[tabled(rename = "Package")]
    package: String,
    #[tabled(rename = "Advisory")]
    advisory: String,
    #[tabled(rename = "Summary")]
    summary: String,
    #[tabled(rename = "Current")]
    current: String,
    #[tabled(rename = "Fixed In")]
    fixed_in: String,
    #[tabled(rename = "Upgrade")]
    upgrade: String,
}

#[derive(Tabled)]
struct FailedRow {
    #[tabled(rename = "Service")]
    service: String,
    #[tabled(rename = "Project")]
    project: String,
    #[tabled(rename = "Cause")]
    cause: String,
}

pub fn print_cli_table(report: &ScanReport) -> Result<()> {
    print!("{}", format_cli_table(report)?);
    Ok(())
}

/// Renders the report as tables followed by a summary.
pub fn format_cli_table(report: &ScanReport) -> Result<String> {
    let mut out = String::new();
    write_report(&mut out, report)?;
    Ok(out)
}

fn write_report(out: &mut String, report: &ScanReport) -> std::fmt::Result {
    writeln!(out)?;
    writeln!(
        out,
        "Scan completed at: {}",
        report.scan_time.format("%Y-%m-%d %H:%M:%S UTC")
    )?;
    writeln!(out)?;

    if report.succeeded.is_empty() {
        writeln!(out, "No projects scanned.")?;
    } else {
        writeln!(out, "Scanned {} projects:", report.succeeded.len())?;
        writeln!(out)?;

        let rows: Vec<ProjectRow> = report
            .succeeded
            .iter()
            .map(|scan| ProjectRow {
                service: scan.service_name.clone(),
                project: truncate(&scan.project_name, 40),
                ecosystem: scan.ecosystem.display_name().to_string(),
                framework: scan.framework.clone().unwrap_or_else(|| "-".to_string()),
                packages: scan.package_count,
                advisories: scan.packages.len(),
            })
            .collect();
        writeln!(out, "{}", Table::new(rows).with(Style::rounded()))?;
    }

    let mut packages = report.packages();
    if !packages.is_empty() {
        sort_by_risk(&mut packages);
        writeln!(out)?;
        writeln!(out, "Found {} advisories:", packages.len())?;
        writeln!(out)?;

        let rows: Vec<VulnRow> = packages.iter().flat_map(vuln_rows).collect();
        writeln!(out, "{}", Table::new(rows).with(Style::rounded()))?;
    }

    if !report.failed.is_empty() {
        writeln!(out)?;
        writeln!(out, "{} projects failed:", report.failed.len())?;
        writeln!(out)?;

        let rows: Vec<FailedRow> = report
            .failed
            .iter()
            .map(|failed| FailedRow {
                service: failed.service_name.clone(),
                project: truncate(&failed.project_name, 40),
                cause: truncate(&failed.cause.to_string(), 80),
            })
            .collect();
        writeln!(out, "{}", Table::new(rows).with(Style::rounded()))?;
    }

    writeln!(out)?;
    write_summary(out, report)
}

fn vuln_rows(package: &ScannedPackage) -> Vec<VulnRow> {
    let project = format!("{}/{}", package.service_name, package.project_name);
    package
        .vulnerabilities
        .iter()
        .map(|v| {
            let fixed_in = v.first_patched_version.clone().unwrap_or_else(|| "-".to_string());
            VulnRow {
                severity: format_severity(&package.severity),
                project: truncate(&project, 30),
                package: truncate(&v.package_name, 30),
                advisory: package.advisory_id.clone(),
                summary: truncate(&package.summary, 50),
                current: format_version(&v.current_version),
                upgrade: v
                    .first_patched_version
                    .as_deref()
                    .map(|fixed| classify_update(&v.current_version, fixed))
                    .unwrap_or_else(|| "-".to_string()),
                fixed_in,
            }
        })
        .collect()
}

fn format_severity(severity: &Severity) -> String {
    match severity {
        Severity::Critical => "\x1b[31mCRITICAL\x1b[0m".to_string(),
        Severity::High => "\x1b[91mHIGH\x1b[0m".to_string(),
        Severity::Medium => "\x1b[33mMEDIUM\x1b[0m".to_string(),
        Severity::Low => "\x1b[32mLOW\x1b[0m".to_string(),
        Severity::Unknown => "UNKNOWN".to_string(),
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

fn format_version(version: &str) -> String {
    if version.is_empty() {
        "-".to_string()
    } else {
        version.to_string()
    }
}

/// Parses `v1.2`, `1.2.3`, `4` and similar into a semver version,
/// padding missing components with zeros.
fn lenient_version(raw: &str) -> Option<Version> {
    let trimmed = raw.trim().trim_start_matches('v');
    if let Ok(version) = Version::parse(trimmed) {
        return Some(version);
    }
    let core = trimmed.split(['-', '+']).next()?;
    let mut parts = core.split('.').map(|p| p.parse::<u64>());
    let major = parts.next()?.ok()?;
    let minor = parts.next().unwrap_or(Ok(0)).ok()?;
    let patch = parts.next().unwrap_or(Ok(0)).ok()?;
    Some(Version::new(major, minor, patch))
}

/// Classify the upgrade from `current` to `fixed` as major, minor, or patch
fn classify_update(current: &str, fixed: &str) -> String {
    let (Some(current), Some(fixed)) = (lenient_version(current), lenient_version(fixed)) else {
        return "?".to_string();
    };

    if fixed.major != current.major {
        "MAJOR".to_string()
    } else if fixed.minor != current.minor {
        "minor".to_string()
    } else {
        "patch".to_string()
    }
}

/// Calculate a health score (0-100) from the advisories found
fn calculate_health_score(report: &ScanReport) -> u8 {
    let mut score: i32 = 100;

    for scan in &report.succeeded {
        for package in &scan.packages {
            score -= match package.severity {
                Severity::Critical => 25,
                Severity::High => 15,
                Severity::Medium => 8,
                Severity::Low => 3,
                Severity::Unknown => 5,
            };
        }
    }

    score.clamp(0, 100) as u8
}

fn health_score_indicator(score: u8) -> &'static str {
    match score {
        90..=100 => "[Excellent]",
        70..=89 => "[Good]",
        50..=69 => "[Fair]",
        25..=49 => "[Poor]",
        _ => "[Critical]",
    }
}

fn write_summary(out: &mut String, report: &ScanReport) -> std::fmt::Result {
    let total_packages: usize = report.succeeded.iter().map(|s| s.package_count).sum();

    writeln!(out, "Summary:")?;
    writeln!(
        out,
        "  Projects: {} scanned, {} failed",
        report.succeeded.len(),
        report.failed.len()
    )?;
    writeln!(out, "  Total packages: {}", total_packages)?;

    let advisories: usize = report.succeeded.iter().map(|s| s.packages.len()).sum();
    if advisories > 0 {
        writeln!(
            out,
            "  Advisories: {} critical, {} high, {} medium, {} low",
            report.count_severity(Severity::Critical),
            report.count_severity(Severity::High),
            report.count_severity(Severity::Medium),
            report.count_severity(Severity::Low)
        )?;
    }

    let score = calculate_health_score(report);
    writeln!(out)?;
    writeln!(out, "Health Score: {}/100 {}", score, health_score_indicator(score))
}
