use super::{ManifestKind, ManifestParser};
use crate::error::ScanError;
use crate::model::{Ecosystem, FrameworkInfo, Inventory, Project};
use async_trait::async_trait;
use std::path::Path;

/// Parser for `go.mod` module files.
pub struct GoModParser;

fn strip_comment(line: &str) -> &str {
    let code = match line.find("//") {
        Some(index) => &line[..index],
        None => line,
    };
    code.trim()
}

fn unquote(value: &str) -> &str {
    value.trim_matches(|c| c == '"' || c == '`')
}

/// Parses `path version` from a require line, ignoring anything after.
fn parse_requirement(spec: &str) -> Option<(String, String)> {
    let mut parts = spec.split_whitespace();
    let name = unquote(parts.next()?);
    let version = parts.next()?;
    Some((name.to_string(), version.to_string()))
}

#[async_trait]
impl ManifestParser for GoModParser {
    fn kind(&self) -> ManifestKind {
        ManifestKind::GoMod
    }

    fn parse_content(
        &self,
        content: &str,
        path: &Path,
        service_name: &str,
    ) -> Result<Project, ScanError> {
        let mut module: Option<String> = None;
        let mut go_version: Option<String> = None;
        let mut inventory = Inventory::new();
        // Directive of the `( ... )` block being read, if any.
        let mut block: Option<&str> = None;

        for (number, raw) in content.lines().enumerate() {
            let line = strip_comment(raw);
            if line.is_empty() {
                continue;
            }

            if let Some(directive) = block {
                if line == ")" {
                    block = None;
                } else if directive == "require" {
                    let (name, version) = parse_requirement(line).ok_or_else(|| {
                        ScanError::manifest(
                            path,
                            format!("line {}: malformed requirement '{}'", number + 1, line),
                        )
                    })?;
                    inventory.entry(name).or_insert(version);
                }
                continue;
            }

            let (directive, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
            let rest = rest.trim();
            if rest == "(" {
                block = Some(directive);
                continue;
            }

            match directive {
                "module" => module = Some(unquote(rest).to_string()),
                "go" => go_version = Some(rest.to_string()),
                "require" => {
                    let (name, version) = parse_requirement(rest).ok_or_else(|| {
                        ScanError::manifest(
                            path,
                            format!("line {}: malformed requirement '{}'", number + 1, rest),
                        )
                    })?;
                    inventory.entry(name).or_insert(version);
                }
                _ => {}
            }
        }

        if block.is_some() {
            return Err(ScanError::manifest(path, "unterminated block"));
        }
        let module = module
            .filter(|m| !m.is_empty())
            .ok_or_else(|| ScanError::manifest(path, "missing module directive"))?;

        let mut project =
            Project::new(service_name, module, Ecosystem::GoModule, path).with_inventory(inventory);
        if let Some(version) = go_version {
            project = project.with_framework(FrameworkInfo::Go { version });
        }
        Ok(project)
    }
}
