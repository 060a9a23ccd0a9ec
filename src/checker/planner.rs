use super::resilient::ResilientClient;
use crate::error::ScanError;
use crate::model::{Ecosystem, Inventory, ScannedPackage};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Packages the advisory source accepts in one query.
pub const MAX_PACKAGES_PER_QUERY: usize = 100;

/// Splits `inventory` into chunks of at most `size` packages. Every package
/// lands in exactly one chunk.
pub fn chunk_inventory(inventory: &Inventory, size: usize) -> Vec<Inventory> {
    let size = size.max(1);
    let mut chunks = Vec::with_capacity(inventory.len().div_ceil(size));
    let mut current = Inventory::new();

    for (name, version) in inventory {
        current.insert(name.clone(), version.clone());
        if current.len() == size {
            chunks.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Resolves whole inventories through a [`ResilientClient`], one batch at
/// a time.
#[derive(Clone)]
pub struct BatchPlanner {
    client: Arc<ResilientClient>,
    batch_size: usize,
}

impl BatchPlanner {
    pub fn new(client: Arc<ResilientClient>) -> Self {
        Self {
            client,
            batch_size: MAX_PACKAGES_PER_QUERY,
        }
    }

    /// Uses a smaller batch size. Values are clamped to `1..=100`.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.clamp(1, MAX_PACKAGES_PER_QUERY);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Returns every advisory affecting `inventory`, each listed once, with
    /// `current_version` filled in from the inventory.
    ///
    /// Batches are queried sequentially and the first failing batch aborts
    /// the whole resolution.
    pub async fn resolve(
        &self,
        ecosystem: Ecosystem,
        inventory: &Inventory,
        cancel: &CancellationToken,
    ) -> Result<Vec<ScannedPackage>, ScanError> {
        if inventory.is_empty() {
            return Ok(Vec::new());
        }

        let mut found = Vec::new();
        if inventory.len() < self.batch_size {
            found = self
                .client
                .resolve_packages(ecosystem, inventory, cancel)
                .await?;
        } else {
            let chunks = chunk_inventory(inventory, self.batch_size);
            let total = chunks.len();
            for (index, chunk) in chunks.iter().enumerate() {
                tracing::debug!(%ecosystem, chunk = index + 1, total, size = chunk.len(), "resolving batch");
                let batch = self
                    .client
                    .resolve_packages(ecosystem, chunk, cancel)
                    .await?;
                found.extend(batch);
            }
        }

        let mut merged = merge_advisories(found);
        attach_current_versions(&mut merged, inventory);
        Ok(merged)
    }
}

/// Collapses repeated advisories (same non-empty id) into their first
/// occurrence, keeping vulnerabilities not already listed there.
fn merge_advisories(found: Vec<ScannedPackage>) -> Vec<ScannedPackage> {
    let mut merged: Vec<ScannedPackage> = Vec::with_capacity(found.len());
    let mut seen: HashMap<String, usize> = HashMap::new();

    for package in found {
        if package.advisory_id.is_empty() {
            merged.push(package);
            continue;
        }
        match seen.get(&package.advisory_id) {
            Some(&index) => {
                let existing = &mut merged[index];
                for vulnerability in package.vulnerabilities {
                    if !existing.vulnerabilities.contains(&vulnerability) {
                        existing.vulnerabilities.push(vulnerability);
                    }
                }
            }
            None => {
                seen.insert(package.advisory_id.clone(), merged.len());
                merged.push(package);
            }
        }
    }
    merged
}

fn attach_current_versions(packages: &mut [ScannedPackage], inventory: &Inventory) {
    for vulnerability in packages.iter_mut().flat_map(|p| p.vulnerabilities.iter_mut()) {
        vulnerability.current_version = inventory
            .get(&vulnerability.package_name)
            .cloned()
            .unwrap_or_default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::{AdvisorySource, BreakerSettings, CircuitBreaker};
    use crate::model::{Severity, Vulnerability};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Reports one advisory per queried package, optionally failing on a
    /// given call number.
    #[derive(Default)]
    struct FakeSource {
        calls: AtomicUsize,
        batch_sizes: Mutex<Vec<usize>>,
        fail_on_call: Option<usize>,
        shared_advisory: bool,
    }

    #[async_trait]
    impl AdvisorySource for FakeSource {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn query(
            &self,
            _ecosystem: Ecosystem,
            packages: &Inventory,
            _bearer_token: Option<&str>,
            _cancel: &CancellationToken,
        ) -> Result<Vec<ScannedPackage>, ScanError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.batch_sizes.lock().unwrap().push(packages.len());
            if self.fail_on_call == Some(call) {
                return Err(ScanError::Status {
                    status: 502,
                    message: "bad gateway".to_string(),
                });
            }

            Ok(packages
                .keys()
                .map(|name| {
                    let id = if self.shared_advisory {
                        "GHSA-shared".to_string()
                    } else {
                        format!("GHSA-{}", name)
                    };
                    ScannedPackage::new(id, Severity::High).with_vulnerability(Vulnerability {
                        package_name: name.clone(),
                        current_version: String::new(),
                        vulnerable_version_range: "< 9.9.9".to_string(),
                        first_patched_version: Some("9.9.9".to_string()),
                    })
                })
                .collect())
        }
    }

    fn planner(source: Arc<FakeSource>) -> BatchPlanner {
        let breaker = Arc::new(CircuitBreaker::new("test", BreakerSettings::default()));
        BatchPlanner::new(Arc::new(ResilientClient::new(source, breaker)))
    }

    fn inventory_of(n: usize) -> Inventory {
        (0..n)
            .map(|i| (format!("pkg-{:04}", i), format!("1.0.{}", i)))
            .collect()
    }

    #[test]
    fn test_chunk_inventory_covers_every_package_once() {
        let inventory = inventory_of(250);
        let chunks = chunk_inventory(&inventory, 100);

        assert_eq!(
            chunks.iter().map(Inventory::len).collect::<Vec<_>>(),
            vec![100, 100, 50]
        );
        let names: HashSet<_> = chunks.iter().flat_map(|c| c.keys()).collect();
        assert_eq!(names.len(), 250);
    }

    #[tokio::test]
    async fn test_call_count_is_ceil_of_batches() {
        for n in [0usize, 1, 99, 100, 101, 250] {
            let source = Arc::new(FakeSource::default());
            let planner = planner(source.clone());

            let result = planner
                .resolve(Ecosystem::Npm, &inventory_of(n), &CancellationToken::new())
                .await
                .unwrap();

            assert_eq!(
                source.calls.load(Ordering::SeqCst),
                n.div_ceil(MAX_PACKAGES_PER_QUERY),
                "calls for {n} packages"
            );
            assert!(source
                .batch_sizes
                .lock()
                .unwrap()
                .iter()
                .all(|&size| size <= MAX_PACKAGES_PER_QUERY));

            let ids: HashSet<_> = result.iter().map(|p| p.advisory_id.as_str()).collect();
            assert_eq!(result.len(), n);
            assert_eq!(ids.len(), n);
        }
    }

    #[tokio::test]
    async fn test_current_version_is_joined_from_inventory() {
        let planner = planner(Arc::new(FakeSource::default()));
        let inventory = Inventory::from([("left-pad".to_string(), "1.0.0".to_string())]);

        let result = planner
            .resolve(Ecosystem::Npm, &inventory, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result[0].vulnerabilities[0].package_name, "left-pad");
        assert_eq!(result[0].vulnerabilities[0].current_version, "1.0.0");
    }

    #[tokio::test]
    async fn test_failed_batch_aborts_resolution() {
        let source = Arc::new(FakeSource {
            fail_on_call: Some(2),
            ..Default::default()
        });
        let planner = planner(source.clone());

        let err = planner
            .resolve(Ecosystem::Npm, &inventory_of(250), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ScanError::Status { status: 502, .. }));
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_repeated_advisory_is_merged_across_batches() {
        let source = Arc::new(FakeSource {
            shared_advisory: true,
            ..Default::default()
        });
        let planner = planner(source).with_batch_size(2);

        let result = planner
            .resolve(Ecosystem::Npm, &inventory_of(5), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.len(), 1);
        assert_eq!(result[0].vulnerabilities.len(), 5);
        assert_eq!(result[0].vulnerabilities[4].current_version, "1.0.4");
    }

    #[test]
    fn test_unknown_package_gets_empty_current_version() {
        let mut packages = vec![ScannedPackage::new("GHSA-x", Severity::Low).with_vulnerability(
            Vulnerability {
                package_name: "not-installed".to_string(),
                current_version: "stale".to_string(),
                vulnerable_version_range: "*".to_string(),
                first_patched_version: None,
            },
        )];

        attach_current_versions(&mut packages, &inventory_of(3));
        assert_eq!(packages[0].vulnerabilities[0].current_version, "");
    }
}
