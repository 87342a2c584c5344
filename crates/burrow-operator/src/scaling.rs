//! Persistent volume resizing
//!
//! StatefulSet `volumeClaimTemplates` are immutable, so growing a cluster's
//! storage means deleting the StatefulSet with an orphan cascade (pods and
//! claims survive), waiting until it is gone, and resizing each claim in
//! place. The reconciler recreates the StatefulSet from the updated spec on
//! its next pass.
//!
//! Updates are not rolled back: if one claim fails, earlier claims stay at
//! the new size and the next call only touches the claims still behind.

use crate::crd::BurrowCluster;
use crate::error::{OperatorError, Result};
use crate::quantity::Capacity;
use crate::store::{DeleteOutcome, DeletePropagation, ResourceStore};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, VolumeResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Key of the storage request on a claim
const STORAGE_RESOURCE: &str = "storage";

/// Delete-confirmation polling settings
#[derive(Debug, Clone)]
pub struct ScalerConfig {
    /// Number of times to check that the StatefulSet is gone
    pub delete_poll_retries: u32,
    /// Pause between checks
    pub delete_poll_interval: Duration,
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            delete_poll_retries: 10,
            delete_poll_interval: Duration::from_secs(3),
        }
    }
}

/// What a call to [`PersistenceScaler::scale`] did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaleOutcome {
    /// Every existing claim already had the requested size
    Unchanged,
    /// The StatefulSet was removed and these claims were resized
    Scaled { claims: Vec<String> },
}

/// Grows the claims of a cluster to a new capacity
pub struct PersistenceScaler {
    store: Arc<dyn ResourceStore>,
    config: ScalerConfig,
}

impl PersistenceScaler {
    pub fn new(store: Arc<dyn ResourceStore>, config: ScalerConfig) -> Self {
        Self { store, config }
    }

    /// Resize every provisioned claim of `cluster` to `desired`
    ///
    /// Claims of replicas that were never provisioned are skipped. All claims
    /// are validated before anything is changed, so a shrink or an
    /// ephemeral-to-persistent request leaves the cluster untouched. Every
    /// API call is abandoned with [`OperatorError::Cancelled`] once `cancel`
    /// fires.
    #[instrument(skip_all, fields(cluster = %cluster_name(cluster), desired = %desired.0))]
    pub async fn scale(
        &self,
        cluster: &BurrowCluster,
        desired: &Quantity,
        cancel: &CancellationToken,
    ) -> Result<ScaleOutcome> {
        let namespace = cluster.namespace_or_default();
        let desired_capacity = Capacity::from_quantity(desired)?;

        let candidates = self
            .find_candidates(cluster, &namespace, desired, desired_capacity, cancel)
            .await?;

        if candidates.is_empty() {
            debug!("All claims already at requested capacity");
            return Ok(ScaleOutcome::Unchanged);
        }

        info!(
            claims = candidates.len(),
            "Recreating StatefulSet to resize claims"
        );

        self.remove_stateful_set(&cluster.resource_name(), &namespace, cancel)
            .await?;

        for claim_name in &candidates {
            self.resize_claim(claim_name, &namespace, desired, cancel)
                .await?;
        }

        Ok(ScaleOutcome::Scaled { claims: candidates })
    }

    /// Names of claims below `desired`, after checking every claim is allowed to change
    async fn find_candidates(
        &self,
        cluster: &BurrowCluster,
        namespace: &str,
        desired: &Quantity,
        desired_capacity: Capacity,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let mut candidates = Vec::new();

        for ordinal in 0..cluster.spec.replicas.max(0) {
            let claim_name = cluster.claim_name(ordinal);
            let lookup = self.store.get_claim(namespace, &claim_name);
            let Some(claim) = cancellable(cancel, &format!("reading claim {}", claim_name), lookup)
                .await?
            else {
                debug!(claim = %claim_name, "Claim not provisioned yet, skipping");
                continue;
            };

            let current = requested_capacity(&claim)?;

            if current.is_zero() && !desired_capacity.is_zero() {
                return Err(OperatorError::EphemeralToPersistent {
                    claim: claim_name,
                    desired: desired.0.clone(),
                });
            }
            if current > desired_capacity {
                return Err(OperatorError::StorageShrink {
                    claim: claim_name,
                    current: current.to_string(),
                    desired: desired.0.clone(),
                });
            }
            if current < desired_capacity {
                candidates.push(claim_name);
            }
        }

        Ok(candidates)
    }

    /// Orphan-delete the StatefulSet and wait until the API server no longer returns it
    async fn remove_stateful_set(
        &self,
        name: &str,
        namespace: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let delete = self
            .store
            .delete_stateful_set(namespace, name, DeletePropagation::Orphan);
        let context = format!("deletion of StatefulSet {}/{} was not confirmed", namespace, name);

        match cancellable(cancel, &context, delete).await? {
            DeleteOutcome::Deleted => {
                metrics::counter!("burrow_operator_statefulset_recreations_total").increment(1);
            }
            DeleteOutcome::NotFound => {
                debug!(stateful_set = %name, "StatefulSet already absent");
                return Ok(());
            }
        }

        let retries = self.config.delete_poll_retries;
        for attempt in 1..=retries {
            let lookup = self.store.get_stateful_set(namespace, name);
            if cancellable(cancel, &context, lookup).await?.is_none() {
                debug!(stateful_set = %name, attempt, "StatefulSet deleted");
                return Ok(());
            }

            if attempt < retries {
                let pause = async {
                    tokio::time::sleep(self.config.delete_poll_interval).await;
                    Ok::<(), OperatorError>(())
                };
                cancellable(cancel, &context, pause).await?;
            }
        }

        Err(OperatorError::Timeout(format!(
            "StatefulSet {}/{} still present after {} checks",
            namespace, name, retries
        )))
    }

    /// Re-read a claim and write the new storage request
    async fn resize_claim(
        &self,
        claim_name: &str,
        namespace: &str,
        desired: &Quantity,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let context = format!("resizing claim {}", claim_name);
        let lookup = self.store.get_claim(namespace, claim_name);
        let mut claim = cancellable(cancel, &context, lookup)
            .await?
            .ok_or_else(|| OperatorError::NotFound {
                kind: "PersistentVolumeClaim".to_string(),
                name: claim_name.to_string(),
                namespace: namespace.to_string(),
            })?;

        let resources = claim
            .spec
            .get_or_insert_with(Default::default)
            .resources
            .get_or_insert_with(VolumeResourceRequirements::default);
        resources
            .requests
            .get_or_insert_with(Default::default)
            .insert(STORAGE_RESOURCE.to_string(), desired.clone());

        cancellable(cancel, &context, self.store.update_claim(namespace, &claim)).await?;

        info!(claim = %claim_name, size = %desired.0, "Resized claim");
        metrics::counter!("burrow_operator_claims_resized_total").increment(1);
        Ok(())
    }
}

/// Run `call` unless `cancel` fires first
async fn cancellable<T>(
    cancel: &CancellationToken,
    context: &str,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            warn!(operation = %context, "Cancelled before the API server answered");
            Err(OperatorError::Cancelled(context.to_string()))
        }
        result = call => result,
    }
}

fn cluster_name(cluster: &BurrowCluster) -> &str {
    cluster.metadata.name.as_deref().unwrap_or_default()
}

/// Storage requested by a claim; a claim without a request holds nothing
fn requested_capacity(claim: &PersistentVolumeClaim) -> Result<Capacity> {
    let request = claim
        .spec
        .as_ref()
        .and_then(|s| s.resources.as_ref())
        .and_then(|r| r.requests.as_ref())
        .and_then(|r| r.get(STORAGE_RESOURCE));

    match request {
        Some(quantity) => Capacity::from_quantity(quantity),
        None => Ok(Capacity::ZERO),
    }
}
