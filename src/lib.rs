pub mod cache;
pub mod checker;
pub mod config;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod output;
pub mod scanner;

pub use cache::Cache;
pub use config::Config;
pub use error::ScanError;
pub use model::{Ecosystem, Project, ScanReport, ScannedPackage, Severity, Vulnerability};
pub use orchestrator::Orchestrator;
