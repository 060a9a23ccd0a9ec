//! Advisory lookups and the resilience layer around them.
//!
//! - [`AdvisorySource`] - raw query of one batch of packages
//! - [`GithubAdvisoryClient`] - GitHub global advisories implementation
//! - [`ResilientClient`] - circuit breaker + cancellation around a source
//! - [`BatchPlanner`] - splits inventories into source-sized batches
//! - [`DeviceFlowAuthenticator`] - cached OAuth device-flow tokens

mod auth;
mod breaker;
mod github;
mod planner;
mod resilient;
mod risk;

pub use auth::{
    AccessToken, DeviceCode, DeviceFlowAuthenticator, DeviceFlowClient, StaticToken,
    TokenProvider, DEFAULT_AUTH_URL, TOKEN_CACHE_KEY,
};
pub use breaker::{BreakerSettings, CircuitBreaker, CircuitState};
pub use github::{GithubAdvisoryClient, DEFAULT_ADVISORY_URL};
pub use planner::{chunk_inventory, BatchPlanner, MAX_PACKAGES_PER_QUERY};
pub use resilient::ResilientClient;
pub use risk::{assign_risk_scores, risk_score, sort_by_risk};

use crate::error::ScanError;
use crate::model::{Ecosystem, Inventory, ScannedPackage};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// A service that reports known advisories for a batch of packages.
#[async_trait]
pub trait AdvisorySource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Issues one query for `packages`, authenticated with `bearer_token`
    /// when one is given. Callers keep batches within the source's
    /// per-call limit.
    async fn query(
        &self,
        ecosystem: Ecosystem,
        packages: &Inventory,
        bearer_token: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Vec<ScannedPackage>, ScanError>;
}
