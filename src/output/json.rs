use crate::model::ScanReport;
use anyhow::Result;

pub fn format_json(report: &ScanReport) -> Result<String> {
    Ok(serde_json::to_string_pretty(report)?)
}

pub fn print_json(report: &ScanReport) -> Result<()> {
    println!("{}", format_json(report)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScanError;
    use crate::model::{Ecosystem, FailedProject, Project, ProjectScan, ScannedPackage, Severity};

    #[test]
    fn test_json_shape() {
        let project = Project::new("web", "storefront", Ecosystem::Npm, "web/package-lock.json");
        let report = ScanReport::new(
            vec![ProjectScan::new(
                &project,
                vec![ScannedPackage::new("GHSA-1", Severity::Critical)],
            )],
            vec![FailedProject {
                service_name: "api".to_string(),
                project_name: "gateway".to_string(),
                cause: ScanError::Transport("connection reset".to_string()),
            }],
        );

        let value: serde_json::Value = serde_json::from_str(&format_json(&report).unwrap()).unwrap();
        assert_eq!(value["succeeded"][0]["ecosystem"], "npm");
        assert_eq!(value["succeeded"][0]["packages"][0]["severity"], "critical");
        assert_eq!(
            value["failed"][0]["cause"],
            "transport error: connection reset"
        );
        assert!(value["scan_time"].is_string());
    }
}
