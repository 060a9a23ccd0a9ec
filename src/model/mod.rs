//! Core data types for projects, advisories, and scan reports.
//!
//! - [`Project`] - One manifest's packages, normalized across ecosystems
//! - [`Ecosystem`] - The package ecosystem a manifest belongs to
//! - [`ScannedPackage`] - An advisory matched against a project
//! - [`Vulnerability`] - One affected package listed by an advisory
//! - [`ScanReport`] - Successful and failed projects of a scan
//!
//! # Example
//!
//! ```
//! use deepscan::model::{Ecosystem, Inventory, Project};
//!
//! let mut inventory = Inventory::new();
//! inventory.insert("left-pad".to_string(), "1.0.0".to_string());
//!
//! let project = Project::new("web", "storefront", Ecosystem::Npm, "web/package-lock.json")
//!     .with_inventory(inventory);
//!
//! assert_eq!(project.inventory.len(), 1);
//! ```

mod advisory;
mod project;
mod report;

pub use advisory::*;
pub use project::*;
pub use report::*;
