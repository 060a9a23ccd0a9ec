use super::auth::TokenProvider;
use super::breaker::CircuitBreaker;
use super::AdvisorySource;
use crate::error::ScanError;
use crate::model::{Ecosystem, Inventory, ScannedPackage};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// An [`AdvisorySource`] behind a circuit breaker.
///
/// Every project scan shares one `ResilientClient`, so repeated failures
/// from any project open the circuit for all of them. Bearer tokens are
/// fetched before the breaker admits the call, so authentication failures
/// never count against the advisory source.
#[derive(Clone)]
pub struct ResilientClient {
    source: Arc<dyn AdvisorySource>,
    breaker: Arc<CircuitBreaker>,
    token: Option<Arc<dyn TokenProvider>>,
}

impl ResilientClient {
    pub fn new(source: Arc<dyn AdvisorySource>, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            source,
            breaker,
            token: None,
        }
    }

    pub fn with_token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.token = Some(provider);
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn source_name(&self) -> &'static str {
        self.source.name()
    }

    /// Resolves one batch with a single call to the source. Failures are
    /// not retried here; the breaker's half-open trials are the only retry.
    ///
    /// A 401 answer makes the token provider forget its token, so the next
    /// batch authenticates again.
    pub async fn resolve_packages(
        &self,
        ecosystem: Ecosystem,
        chunk: &Inventory,
        cancel: &CancellationToken,
    ) -> Result<Vec<ScannedPackage>, ScanError> {
        let token = match &self.token {
            Some(provider) => Some(provider.access_token(cancel).await?),
            None => None,
        };

        let result = self
            .breaker
            .execute(cancel, || {
                self.source.query(ecosystem, chunk, token.as_deref(), cancel)
            })
            .await;

        if let (Err(ScanError::Status { status: 401, .. }), Some(provider)) = (&result, &self.token) {
            tracing::debug!(source = self.source.name(), "token rejected, invalidating");
            provider.invalidate();
        }
        result
    }
}
