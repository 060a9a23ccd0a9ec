use super::{ManifestKind, ManifestParser};
use crate::error::ScanError;
use crate::model::{Ecosystem, FrameworkInfo, Inventory, Project, UNPINNED_VERSION};
use async_trait::async_trait;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::path::Path;

/// Parser for SDK-style and legacy `.csproj` files.
pub struct CsprojParser;

#[derive(Clone, Copy, PartialEq)]
enum TextField {
    TargetFramework,
    TargetFrameworks,
    ReferenceVersion,
}

struct PendingReference {
    name: String,
    version: Option<String>,
}

fn attribute(reader: &Reader<&[u8]>, element: &BytesStart<'_>, key: &str) -> Option<String> {
    let attr = element
        .attributes()
        .flatten()
        .find(|attr| attr.key.local_name().as_ref() == key.as_bytes())?;
    let value = reader.decoder().decode(&attr.value).ok()?.trim().to_string();
    Some(value)
}

fn insert_reference(inventory: &mut Inventory, reference: PendingReference) {
    if reference.name.is_empty() {
        return;
    }
    let version = reference
        .version
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| UNPINNED_VERSION.to_string());
    inventory.entry(reference.name).or_insert(version);
}

#[async_trait]
impl ManifestParser for CsprojParser {
    fn kind(&self) -> ManifestKind {
        ManifestKind::Csproj
    }

    fn parse_content(
        &self,
        content: &str,
        path: &Path,
        service_name: &str,
    ) -> Result<Project, ScanError> {
        let mut reader = Reader::from_str(content);
        let mut inventory = Inventory::new();
        let mut target: Option<String> = None;
        let mut targets: Option<String> = None;
        let mut pending: Option<PendingReference> = None;
        let mut field: Option<TextField> = None;

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => match e.local_name().as_ref() {
                    b"PackageReference" => {
                        pending = attribute(&reader, &e, "Include").map(|name| PendingReference {
                            name,
                            version: attribute(&reader, &e, "Version"),
                        });
                    }
                    b"Version" if pending.is_some() => field = Some(TextField::ReferenceVersion),
                    b"TargetFramework" => field = Some(TextField::TargetFramework),
                    b"TargetFrameworks" => field = Some(TextField::TargetFrameworks),
                    _ => field = None,
                },
                Ok(Event::Empty(e)) => {
                    if e.local_name().as_ref() == b"PackageReference" {
                        if let Some(name) = attribute(&reader, &e, "Include") {
                            insert_reference(
                                &mut inventory,
                                PendingReference {
                                    name,
                                    version: attribute(&reader, &e, "Version"),
                                },
                            );
                        }
                    }
                }
                Ok(Event::Text(t)) => {
                    if let Some(current) = field {
                        let text = reader
                            .decoder()
                            .decode(t.as_ref())
                            .map(|s| s.trim().to_string())
                            .unwrap_or_default();
                        if text.is_empty() {
                            continue;
                        }
                        match current {
                            TextField::TargetFramework => target = Some(text),
                            TextField::TargetFrameworks => targets = Some(text),
                            TextField::ReferenceVersion => {
                                if let Some(reference) = pending.as_mut() {
                                    reference.version = Some(text);
                                }
                            }
                        }
                    }
                }
                Ok(Event::End(e)) => {
                    field = None;
                    if e.local_name().as_ref() == b"PackageReference" {
                        if let Some(reference) = pending.take() {
                            insert_reference(&mut inventory, reference);
                        }
                    }
                }
                Ok(Event::Eof) => break,
                Err(e) => {
                    return Err(ScanError::manifest(
                        path,
                        format!(
                            "XML parse error at position {}: {}",
                            reader.error_position(),
                            e
                        ),
                    ))
                }
                _ => {}
            }
        }

        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut project = Project::new(service_name, name, Ecosystem::Nuget, path)
            .with_inventory(inventory);
        if target.is_some() || targets.is_some() {
            project = project.with_framework(FrameworkInfo::Dotnet { target, targets });
        }
        Ok(project)
    }
}
