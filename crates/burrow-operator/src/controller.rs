//! BurrowCluster Controller
//!
//! This module implements the Kubernetes controller pattern for managing
//! BurrowCluster custom resources. Each pass refreshes the status
//! conditions, grows persistent storage when the requested size changed,
//! staggers image upgrades through the shared [`RolloutScheduler`], and
//! applies the StatefulSet and Services.

use crate::conditions::{compute_all, find_condition, reconcile_outcome, ClusterResources};
use crate::crd::{
    BurrowCluster, BurrowClusterSpec, BurrowClusterStatus, ClusterCondition, ConditionStatus,
    ConditionType,
};
use crate::error::{OperatorError, Result};
use crate::quantity::Capacity;
use crate::resources::{broker_image, data_template_size, ResourceBuilder};
use crate::rollout::RolloutScheduler;
use crate::scaling::{PersistenceScaler, ScaleOutcome, ScalerConfig};
use crate::store::{KubeResourceStore, ResourceStore};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Endpoints, Service};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config;
use kube::{Client, Resource, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use validator::Validate;

/// Field manager used for server-side apply
const FIELD_MANAGER: &str = "burrow-operator";

/// Default requeue interval for successful reconciliations
const DEFAULT_REQUEUE_SECONDS: u64 = 300; // 5 minutes

/// Requeue interval for error cases (base for exponential backoff)
const ERROR_REQUEUE_SECONDS: u64 = 30;

/// Maximum requeue delay for error backoff
const MAX_ERROR_REQUEUE_SECONDS: u64 = 600;

/// Runtime settings of the controller
#[derive(Debug, Clone, Default)]
pub struct OperatorConfig {
    /// Window over which image upgrades are staggered; zero upgrades at once
    pub rollout_window: Duration,
    /// StatefulSet deletion polling used when resizing storage
    pub scaler: ScalerConfig,
}

/// Context passed to the controller
pub struct ControllerContext {
    /// Kubernetes client
    pub client: Client,
    /// Read access used for status and storage decisions
    pub store: Arc<dyn ResourceStore>,
    /// Storage resizer
    pub scaler: PersistenceScaler,
    /// Upgrade times shared by every cluster this operator manages
    pub scheduler: Arc<RolloutScheduler>,
    /// Metrics recorder (optional)
    pub metrics: Option<ControllerMetrics>,
    /// Per-cluster error retry counts for exponential backoff
    pub error_counts: DashMap<String, u32>,
    /// Planned upgrade time per cluster with a pending image change
    pub planned_upgrades: DashMap<String, DateTime<Utc>>,
    /// Cancelled when the operator shuts down
    pub shutdown: CancellationToken,
}

impl ControllerContext {
    /// Build a context talking to the API server through `client`
    pub fn new(client: Client, config: OperatorConfig, shutdown: CancellationToken) -> Self {
        let store: Arc<dyn ResourceStore> = Arc::new(KubeResourceStore::new(client.clone()));
        Self {
            client,
            scaler: PersistenceScaler::new(store.clone(), config.scaler),
            store,
            scheduler: Arc::new(RolloutScheduler::new(config.rollout_window)),
            metrics: Some(ControllerMetrics::new()),
            error_counts: DashMap::new(),
            planned_upgrades: DashMap::new(),
            shutdown,
        }
    }
}

/// Metrics for the controller
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Counter for reconciliation attempts
    pub reconciliations: metrics::Counter,
    /// Counter for reconciliation errors
    pub errors: metrics::Counter,
    /// Histogram for reconciliation duration
    pub duration: metrics::Histogram,
    /// Counter for passes that held back an image upgrade
    pub upgrades_deferred: metrics::Counter,
}

impl ControllerMetrics {
    /// Create new controller metrics
    pub fn new() -> Self {
        Self {
            reconciliations: metrics::counter!("burrow_operator_reconciliations_total"),
            errors: metrics::counter!("burrow_operator_reconciliation_errors_total"),
            duration: metrics::histogram!("burrow_operator_reconciliation_duration_seconds"),
            upgrades_deferred: metrics::counter!("burrow_operator_upgrades_deferred_total"),
        }
    }
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the BurrowCluster controller
///
/// Runs until `shutdown` is cancelled; in-flight passes are allowed to
/// finish, and a pass waiting on a StatefulSet deletion ends with a
/// cancellation error.
pub async fn run_controller(
    client: Client,
    namespace: Option<String>,
    config: OperatorConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let clusters: Api<BurrowCluster> = match &namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    let ctx = Arc::new(ControllerContext::new(
        client.clone(),
        config,
        shutdown.clone(),
    ));

    info!(
        namespace = namespace.as_deref().unwrap_or("all"),
        rollout_window_secs = ctx.scheduler.window().num_seconds(),
        "Starting BurrowCluster controller"
    );

    // Watch related resources for changes
    let statefulsets = match &namespace {
        Some(ns) => Api::<StatefulSet>::namespaced(client.clone(), ns),
        None => Api::<StatefulSet>::all(client.clone()),
    };

    let services = match &namespace {
        Some(ns) => Api::<Service>::namespaced(client.clone(), ns),
        None => Api::<Service>::all(client.clone()),
    };

    let endpoints = match &namespace {
        Some(ns) => Api::<Endpoints>::namespaced(client.clone(), ns),
        None => Api::<Endpoints>::all(client.clone()),
    };

    Controller::new(clusters, Config::default())
        .owns(statefulsets, Config::default())
        .owns(services, Config::default())
        .watches(
            endpoints,
            Config::default().labels("app.kubernetes.io/managed-by=burrow-operator"),
            cluster_for_endpoints,
        )
        .graceful_shutdown_on(async move { shutdown.cancelled().await })
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    debug!(
                        name = obj.name,
                        namespace = obj.namespace,
                        ?action,
                        "Reconciliation completed"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Reconciliation failed");
                }
            }
        })
        .await;

    info!("BurrowCluster controller stopped");
    Ok(())
}

/// Map client Service endpoints back to their cluster
///
/// Endpoints inherit the labels of their Service.
fn cluster_for_endpoints(endpoints: Endpoints) -> Option<ObjectRef<BurrowCluster>> {
    let instance = endpoints.labels().get("app.kubernetes.io/instance")?;
    let namespace = endpoints.namespace()?;
    Some(ObjectRef::new(instance).within(&namespace))
}

/// Main reconciliation function
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any(), namespace = cluster.namespace()))]
async fn reconcile(cluster: Arc<BurrowCluster>, ctx: Arc<ControllerContext>) -> Result<Action> {
    let start = std::time::Instant::now();

    if let Some(ref metrics) = ctx.metrics {
        metrics.reconciliations.increment(1);
    }

    let namespace = cluster.namespace_or_default();
    let name = cluster.name_any();

    let mut status = StatusDraft::new(&cluster);
    let result = apply_cluster(&cluster, &ctx, &mut status).await;

    let now = Utc::now();
    let conditions = std::mem::take(&mut status.current.conditions);
    let previous = find_condition(&conditions, ConditionType::ReconcileSuccess);
    let outcome = match &result {
        Ok(_) => reconcile_outcome(ConditionStatus::True, "Success", "", previous, now),
        Err(e) => reconcile_outcome(
            ConditionStatus::False,
            e.reason(),
            e.to_string(),
            previous,
            now,
        ),
    };
    status.current.conditions = record_outcome(conditions, outcome, now);

    if let Err(e) = status.flush(&ctx.client, &namespace, &name).await {
        warn!(error = %e, "Failed to record reconcile outcome");
    }

    if let Some(ref metrics) = ctx.metrics {
        metrics.duration.record(start.elapsed().as_secs_f64());
    }

    match &result {
        // Reset error backoff counter on success
        Ok(_) => {
            ctx.error_counts.remove(&backoff_key(&cluster));
        }
        Err(_) => {
            if let Some(ref metrics) = ctx.metrics {
                metrics.errors.increment(1);
            }
        }
    }

    result
}

/// Bring the cluster's child resources in line with its spec
///
/// `status` is refreshed in place; the caller adds the reconcile outcome.
#[instrument(skip_all)]
async fn apply_cluster(
    cluster: &BurrowCluster,
    ctx: &ControllerContext,
    status: &mut StatusDraft,
) -> Result<Action> {
    let name = cluster.name_any();
    let namespace = cluster.namespace_or_default();

    info!(name = %name, namespace = %namespace, "Reconciling BurrowCluster");

    let resources = gather_resources(ctx.store.as_ref(), cluster).await?;
    let conditions = compute_all(&resources, &status.current.conditions, Utc::now());
    refresh_status(&mut status.current, cluster, &resources, conditions.into_vec());
    status.flush(&ctx.client, &namespace, &name).await?;

    validate_spec(cluster)?;

    let mut live = resources.stateful_set.as_ref();
    check_scale_down(live, &cluster.spec)?;

    let builder = ResourceBuilder::new(cluster)?;
    let statefulset = builder.build_statefulset()?;

    let cancel = ctx.shutdown.child_token();
    if reconcile_storage(&ctx.scaler, cluster, live, &cancel).await? {
        // The StatefulSet is gone and is recreated below
        live = None;
    }

    apply_service(&ctx.client, &namespace, builder.build_headless_service()).await?;
    apply_service(&ctx.client, &namespace, builder.build_client_service()).await?;

    let key = backoff_key(cluster);
    let deferred_until = match live {
        Some(sts) if upgrade_pending(sts, &cluster.spec) => {
            upgrade_gate(&ctx.scheduler, &ctx.planned_upgrades, &key, Utc::now())
        }
        _ => {
            ctx.planned_upgrades.remove(&key);
            None
        }
    };
    status.current.planned_upgrade_time = deferred_until;

    if let Some(at) = deferred_until {
        info!(name = %name, planned = %at, "Deferring image upgrade");
        if let Some(ref metrics) = ctx.metrics {
            metrics.upgrades_deferred.increment(1);
        }
        let wait = (at - Utc::now()).to_std().unwrap_or_default();
        return Ok(Action::requeue(wait.max(Duration::from_secs(1))));
    }

    let sts_status = apply_statefulset(&ctx.client, &namespace, statefulset).await?;
    if let Some(sts_status) = sts_status {
        status.current.replicas = sts_status.replicas;
        status.current.ready_replicas = sts_status.ready_replicas.unwrap_or(0);
    }

    info!(name = %name, "Reconciliation complete");

    Ok(Action::requeue(Duration::from_secs(
        DEFAULT_REQUEUE_SECONDS,
    )))
}

fn backoff_key(cluster: &BurrowCluster) -> String {
    format!("{}/{}", cluster.namespace_or_default(), cluster.name_any())
}

/// Validate the cluster spec before touching any child resource
fn validate_spec(cluster: &BurrowCluster) -> Result<()> {
    if let Err(errors) = cluster.spec.validate() {
        let error_messages: Vec<String> = errors
            .field_errors()
            .iter()
            .flat_map(|(field, errs)| {
                errs.iter()
                    .map(move |e| format!("{}: {:?}", field, e.message))
            })
            .collect();
        let error_msg = error_messages.join("; ");
        warn!(cluster = %cluster.name_any(), errors = %error_msg, "Cluster spec validation failed");
        return Err(OperatorError::ValidationError(error_msg));
    }

    if cluster.spec.replicas == 1 {
        debug!(
            cluster = %cluster.name_any(),
            "Running with single replica - not recommended for production"
        );
    }

    Ok(())
}

/// Read the live StatefulSet and client Service endpoints
pub async fn gather_resources(
    store: &dyn ResourceStore,
    cluster: &BurrowCluster,
) -> Result<ClusterResources> {
    let namespace = cluster.namespace_or_default();
    let name = cluster.resource_name();

    let (stateful_set, endpoints) = tokio::try_join!(
        store.get_stateful_set(&namespace, &name),
        store.get_endpoints(&namespace, &name),
    )?;

    Ok(ClusterResources {
        stateful_set,
        endpoints,
    })
}

/// Refuse to lower the replica count of a running cluster
fn check_scale_down(live: Option<&StatefulSet>, spec: &BurrowClusterSpec) -> Result<()> {
    let current = live
        .and_then(|sts| sts.spec.as_ref())
        .and_then(|s| s.replicas);

    match current {
        Some(current) if current > spec.replicas => {
            warn!(current, desired = spec.replicas, "Refusing to scale cluster down");
            Err(OperatorError::ScaleDown {
                current,
                desired: spec.replicas,
            })
        }
        _ => Ok(()),
    }
}

/// Grow every provisioned claim still below `spec.storage.size`
///
/// Runs on every pass, with or without a live StatefulSet, so a resize that
/// failed half way is picked up again from the claims themselves. Returns
/// whether the StatefulSet was removed and must be recreated.
async fn reconcile_storage(
    scaler: &PersistenceScaler,
    cluster: &BurrowCluster,
    live: Option<&StatefulSet>,
    cancel: &CancellationToken,
) -> Result<bool> {
    let desired = desired_storage(live, &cluster.spec)?;

    match scaler.scale(cluster, &desired, cancel).await? {
        ScaleOutcome::Scaled { claims } => {
            info!(claims = claims.len(), size = %desired.0, "Storage resized");
            Ok(true)
        }
        ScaleOutcome::Unchanged => {
            debug!("No provisioned claim needed resizing");
            Ok(false)
        }
    }
}

/// Requested storage size, checked against the live claim template
///
/// The template is held to the same rules the scaler applies to each claim,
/// so a StatefulSet whose replicas were never provisioned still refuses to
/// shrink or to gain storage.
fn desired_storage(live: Option<&StatefulSet>, spec: &BurrowClusterSpec) -> Result<Quantity> {
    let desired = Quantity(spec.storage.size.clone());
    let desired_capacity = Capacity::from_quantity(&desired)?;
    let Some(live) = live else {
        return Ok(desired);
    };

    let current_capacity = data_template_size(live)
        .map(Capacity::from_quantity)
        .transpose()?
        .unwrap_or(Capacity::ZERO);

    let template = live.metadata.name.clone().unwrap_or_default();

    if current_capacity == desired_capacity {
        Ok(desired)
    } else if current_capacity.is_zero() {
        Err(OperatorError::EphemeralToPersistent {
            claim: template,
            desired: desired.0,
        })
    } else if current_capacity > desired_capacity {
        Err(OperatorError::StorageShrink {
            claim: template,
            current: current_capacity.to_string(),
            desired: desired.0,
        })
    } else {
        Ok(desired)
    }
}

/// Whether the live StatefulSet runs a different broker image than the spec
fn upgrade_pending(live: &StatefulSet, spec: &BurrowClusterSpec) -> bool {
    match broker_image(live) {
        Some(image) => image != spec.get_image(),
        None => false,
    }
}

/// Plan (or look up) the cluster's upgrade time
///
/// Returns the planned time while it lies in the future; once it is reached
/// the plan is forgotten and `None` lets the upgrade through.
fn upgrade_gate(
    scheduler: &RolloutScheduler,
    planned: &DashMap<String, DateTime<Utc>>,
    key: &str,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let at = *planned
        .entry(key.to_string())
        .or_insert_with(|| scheduler.plan_upgrade(now));

    if now < at {
        Some(at)
    } else {
        planned.remove(key);
        None
    }
}

/// Copy observed facts into the status
fn refresh_status(
    status: &mut BurrowClusterStatus,
    cluster: &BurrowCluster,
    resources: &ClusterResources,
    conditions: Vec<ClusterCondition>,
) {
    let (replicas, ready_replicas) = resources
        .stateful_set
        .as_ref()
        .and_then(|sts| sts.status.as_ref())
        .map(|s| (s.replicas, s.ready_replicas.unwrap_or(0)))
        .unwrap_or((0, 0));

    status.conditions = conditions;
    status.replicas = replicas;
    status.ready_replicas = ready_replicas;
    status.observed_generation = cluster.metadata.generation.unwrap_or(0);
}

/// Replace the ReconcileSuccess entry, keeping the others in place
///
/// A list missing any condition, left by a pass that failed before the
/// cluster was observed, is first filled in as if nothing existed yet.
fn record_outcome(
    mut conditions: Vec<ClusterCondition>,
    outcome: ClusterCondition,
    now: DateTime<Utc>,
) -> Vec<ClusterCondition> {
    let complete = ConditionType::ALL
        .iter()
        .all(|t| find_condition(&conditions, *t).is_some());
    if !complete {
        return compute_all(&ClusterResources::default(), &conditions, now)
            .with_reconcile_outcome(outcome)
            .into_vec();
    }

    if let Some(existing) = conditions
        .iter_mut()
        .find(|c| c.condition_type == ConditionType::ReconcileSuccess)
    {
        *existing = outcome;
    }
    conditions
}

/// Status built up during a pass, next to the copy the API server holds
struct StatusDraft {
    current: BurrowClusterStatus,
    persisted: Option<BurrowClusterStatus>,
}

impl StatusDraft {
    fn new(cluster: &BurrowCluster) -> Self {
        Self {
            current: cluster.status.clone().unwrap_or_default(),
            persisted: cluster.status.clone(),
        }
    }

    fn is_dirty(&self) -> bool {
        self.persisted.as_ref() != Some(&self.current)
    }

    fn mark_persisted(&mut self) {
        self.persisted = Some(self.current.clone());
    }

    /// Patch the status subresource if it changed since the last write
    async fn flush(&mut self, client: &Client, namespace: &str, name: &str) -> Result<()> {
        if self.is_dirty() {
            update_status(client, namespace, name, &self.current).await?;
            self.mark_persisted();
        }
        Ok(())
    }
}

/// Verify the operator still owns a resource before force-applying.
///
/// A resource carrying an `app.kubernetes.io/managed-by` label of another
/// manager (Helm, another operator) is left alone.
fn verify_ownership<K: Resource>(existing: &K) -> Result<()> {
    let labels = existing.meta().labels.as_ref();
    let managed_by = labels.and_then(|l| l.get("app.kubernetes.io/managed-by"));
    match managed_by {
        Some(manager) if manager != FIELD_MANAGER => {
            let name = existing.meta().name.as_deref().unwrap_or("<unknown>");
            Err(OperatorError::InvalidConfig(format!(
                "resource '{}' is managed by '{}', not {}; refusing to force-apply",
                name, manager, FIELD_MANAGER
            )))
        }
        _ => Ok(()),
    }
}

/// Apply a Service using server-side apply
async fn apply_service(client: &Client, namespace: &str, svc: Service) -> Result<()> {
    let api: Api<Service> = Api::namespaced(client.clone(), namespace);
    let name = svc
        .metadata
        .name
        .as_ref()
        .ok_or_else(|| OperatorError::InvalidConfig("Service missing metadata.name".into()))?;

    debug!(name = %name, "Applying Service");

    if let Some(existing) = api.get_opt(name).await? {
        verify_ownership(&existing)?;
    }

    let patch_params = PatchParams::apply(FIELD_MANAGER).force();
    api.patch(name, &patch_params, &Patch::Apply(&svc))
        .await
        .map_err(OperatorError::from)?;

    Ok(())
}

/// Apply a StatefulSet using server-side apply
async fn apply_statefulset(
    client: &Client,
    namespace: &str,
    sts: StatefulSet,
) -> Result<Option<k8s_openapi::api::apps::v1::StatefulSetStatus>> {
    let api: Api<StatefulSet> = Api::namespaced(client.clone(), namespace);
    let name =
        sts.metadata.name.as_ref().ok_or_else(|| {
            OperatorError::InvalidConfig("StatefulSet missing metadata.name".into())
        })?;

    debug!(name = %name, "Applying StatefulSet");

    if let Some(existing) = api.get_opt(name).await? {
        verify_ownership(&existing)?;
    }

    let patch_params = PatchParams::apply(FIELD_MANAGER).force();
    let result = api
        .patch(name, &patch_params, &Patch::Apply(&sts))
        .await
        .map_err(OperatorError::from)?;

    Ok(result.status)
}

/// Update the cluster status subresource
async fn update_status(
    client: &Client,
    namespace: &str,
    name: &str,
    status: &BurrowClusterStatus,
) -> Result<()> {
    let api: Api<BurrowCluster> = Api::namespaced(client.clone(), namespace);

    debug!(name = %name, ready = status.ready_replicas, "Updating cluster status");

    let patch = serde_json::json!({
        "status": status
    });

    let patch_params = PatchParams::default();
    api.patch_status(name, &patch_params, &Patch::Merge(&patch))
        .await
        .map_err(OperatorError::from)?;

    Ok(())
}

/// Error policy for the controller
///
/// Transient errors retry after their suggested delay; spec problems back
/// off exponentially until the spec is fixed.
fn error_policy(
    cluster: Arc<BurrowCluster>,
    error: &OperatorError,
    ctx: Arc<ControllerContext>,
) -> Action {
    let key = backoff_key(&cluster);
    let retries = {
        let mut entry = ctx.error_counts.entry(key.clone()).or_insert(0);
        *entry += 1;
        *entry
    };

    let delay = backoff_delay(error, retries);

    if error.is_policy_violation() {
        warn!(
            error = %error,
            reason = error.reason(),
            delay_secs = delay.as_secs(),
            "Spec of '{}' asks for an unsupported change, waiting for it to be fixed",
            key
        );
    } else {
        warn!(
            error = %error,
            retry = retries,
            delay_secs = delay.as_secs(),
            "Reconciliation error for '{}', will retry",
            key
        );
    }

    Action::requeue(delay)
}

/// 30s, 60s, 120s, 240s, 480s, then 600s for non-retryable errors
fn backoff_delay(error: &OperatorError, retries: u32) -> Duration {
    error.requeue_delay().unwrap_or_else(|| {
        let base = Duration::from_secs(ERROR_REQUEUE_SECONDS);
        let backoff = base * 2u32.saturating_pow(retries.saturating_sub(1).min(5));
        backoff.min(Duration::from_secs(MAX_ERROR_REQUEUE_SECONDS))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::InMemoryStore;
    use chrono::{TimeDelta, TimeZone};
    use k8s_openapi::api::apps::v1::{StatefulSetSpec, StatefulSetStatus};
    use k8s_openapi::api::core::v1::{EndpointAddress, EndpointSubset};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn create_test_cluster() -> BurrowCluster {
        BurrowCluster {
            metadata: ObjectMeta {
                name: Some("test-cluster".to_string()),
                namespace: Some("default".to_string()),
                uid: Some("test-uid".to_string()),
                generation: Some(4),
                ..Default::default()
            },
            spec: BurrowClusterSpec::default(),
            status: None,
        }
    }

    fn live_statefulset(cluster: &BurrowCluster) -> StatefulSet {
        ResourceBuilder::new(cluster)
            .unwrap()
            .build_statefulset()
            .unwrap()
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap()
    }

    fn q(s: &str) -> Quantity {
        Quantity(s.to_string())
    }

    fn store_with_claims(sizes: &[&str]) -> Arc<InMemoryStore> {
        let store = sizes.iter().enumerate().fold(
            InMemoryStore::new().with_stateful_set("burrow-test-cluster"),
            |store, (ordinal, size)| {
                store.with_claim(&format!("data-burrow-test-cluster-{}", ordinal), Some(*size))
            },
        );
        Arc::new(store)
    }

    fn claim_sizes(store: &InMemoryStore, replicas: usize) -> Vec<Option<String>> {
        (0..replicas)
            .map(|i| store.size_of(&format!("data-burrow-test-cluster-{}", i)))
            .collect()
    }

    #[test]
    fn test_desired_storage_unchanged() {
        let cluster = create_test_cluster();
        let live = live_statefulset(&cluster);

        let mut spec = cluster.spec.clone();
        assert_eq!(desired_storage(Some(&live), &spec).unwrap(), q("10Gi"));

        spec.storage.size = "10240Mi".to_string();
        assert_eq!(desired_storage(Some(&live), &spec).unwrap(), q("10240Mi"));
    }

    #[test]
    fn test_desired_storage_growth() {
        let cluster = create_test_cluster();
        let live = live_statefulset(&cluster);

        let mut spec = cluster.spec.clone();
        spec.storage.size = "20Gi".to_string();
        assert_eq!(desired_storage(Some(&live), &spec).unwrap(), q("20Gi"));
        assert_eq!(desired_storage(None, &spec).unwrap(), q("20Gi"));
    }

    #[test]
    fn test_desired_storage_rejects_shrink() {
        let cluster = create_test_cluster();
        let live = live_statefulset(&cluster);

        let mut spec = cluster.spec.clone();
        spec.storage.size = "1Gi".to_string();
        assert!(matches!(
            desired_storage(Some(&live), &spec),
            Err(OperatorError::StorageShrink { .. })
        ));

        spec.storage.size = "0".to_string();
        assert!(matches!(
            desired_storage(Some(&live), &spec),
            Err(OperatorError::StorageShrink { .. })
        ));
    }

    #[test]
    fn test_desired_storage_rejects_ephemeral_to_persistent() {
        let mut cluster = create_test_cluster();
        cluster.spec.storage.size = "0".to_string();
        let live = live_statefulset(&cluster);

        let mut spec = cluster.spec.clone();
        assert_eq!(desired_storage(Some(&live), &spec).unwrap(), q("0"));

        spec.storage.size = "5Gi".to_string();
        let err = desired_storage(Some(&live), &spec).unwrap_err();
        assert!(matches!(err, OperatorError::EphemeralToPersistent { .. }));
        assert_eq!(err.reason(), "FailedReconcilePersistence");
    }

    #[test]
    fn test_upgrade_pending() {
        let cluster = create_test_cluster();
        let live = live_statefulset(&cluster);

        let mut spec = cluster.spec.clone();
        assert!(!upgrade_pending(&live, &spec));

        spec.version = "0.2.0".to_string();
        assert!(upgrade_pending(&live, &spec));

        assert!(!upgrade_pending(&StatefulSet::default(), &spec));
    }

    #[test]
    fn test_upgrade_gate_without_window_lets_through() {
        let scheduler = RolloutScheduler::new(Duration::ZERO);
        let planned = DashMap::new();

        assert_eq!(upgrade_gate(&scheduler, &planned, "ns/a", t0()), None);
        assert!(planned.is_empty());
    }

    #[test]
    fn test_upgrade_gate_defers_until_planned_time() {
        let scheduler = RolloutScheduler::new(Duration::from_secs(600));
        scheduler.add_upgrade_time(t0());
        let planned = DashMap::new();

        let at = upgrade_gate(&scheduler, &planned, "ns/a", t0());
        assert_eq!(at, Some(t0() + TimeDelta::minutes(5)));

        // The plan is sticky between passes
        let later = t0() + TimeDelta::minutes(2);
        assert_eq!(upgrade_gate(&scheduler, &planned, "ns/a", later), at);
        assert_eq!(scheduler.committed().len(), 2);

        let due = t0() + TimeDelta::minutes(5);
        assert_eq!(upgrade_gate(&scheduler, &planned, "ns/a", due), None);
        assert!(!planned.contains_key("ns/a"));
    }

    #[test]
    fn test_upgrade_gate_first_cluster_goes_now() {
        let scheduler = RolloutScheduler::new(Duration::from_secs(600));
        let planned = DashMap::new();

        assert_eq!(upgrade_gate(&scheduler, &planned, "ns/a", t0()), None);
        assert_eq!(
            upgrade_gate(&scheduler, &planned, "ns/b", t0()),
            Some(t0() + TimeDelta::minutes(5))
        );
    }

    #[test]
    fn test_refresh_status() {
        let cluster = create_test_cluster();
        let mut sts = live_statefulset(&cluster);
        sts.status = Some(StatefulSetStatus {
            replicas: 3,
            ready_replicas: Some(2),
            ..Default::default()
        });
        let resources = ClusterResources {
            stateful_set: Some(sts),
            endpoints: None,
        };

        let mut status = BurrowClusterStatus::default();
        let conditions = compute_all(&resources, &[], t0()).into_vec();
        refresh_status(&mut status, &cluster, &resources, conditions);

        assert_eq!(status.replicas, 3);
        assert_eq!(status.ready_replicas, 2);
        assert_eq!(status.observed_generation, 4);
        assert_eq!(status.conditions.len(), 4);
        assert_eq!(
            status.conditions[0].condition_type,
            ConditionType::AllReplicasReady
        );
        assert_eq!(status.conditions[0].status, ConditionStatus::False);
    }

    #[test]
    fn test_record_outcome_replaces_in_place() {
        let resources = ClusterResources::default();
        let conditions = compute_all(&resources, &[], t0()).into_vec();
        assert_eq!(conditions[3].reason, "Initialising");

        let outcome = reconcile_outcome(
            ConditionStatus::False,
            "InvalidSpec",
            "bad storage size",
            Some(&conditions[3]),
            t0() + TimeDelta::seconds(10),
        );
        let updated = record_outcome(conditions, outcome, t0() + TimeDelta::seconds(10));

        assert_eq!(updated.len(), 4);
        assert_eq!(updated[3].condition_type, ConditionType::ReconcileSuccess);
        assert_eq!(updated[3].status, ConditionStatus::False);
        assert_eq!(
            updated[3].last_transition_time,
            t0() + TimeDelta::seconds(10)
        );
    }

    #[test]
    fn test_record_outcome_fills_in_unobserved_conditions() {
        let outcome = reconcile_outcome(
            ConditionStatus::False,
            "Error",
            "API server unavailable",
            None,
            t0(),
        );
        let updated = record_outcome(Vec::new(), outcome.clone(), t0());

        let types: Vec<_> = updated.iter().map(|c| c.condition_type).collect();
        assert_eq!(types, ConditionType::ALL.to_vec());
        assert_eq!(updated[0].status, ConditionStatus::Unknown);
        assert_eq!(updated[0].reason, "MissingStatefulSet");
        assert_eq!(updated[3], outcome);
    }

    #[test]
    fn test_status_draft_tracks_last_write() {
        let mut cluster = create_test_cluster();
        let mut draft = StatusDraft::new(&cluster);
        assert!(draft.is_dirty());

        draft.mark_persisted();
        assert!(!draft.is_dirty());

        draft.current.ready_replicas = 2;
        assert!(draft.is_dirty());
        draft.mark_persisted();
        assert!(!draft.is_dirty());

        // An unchanged status read back from the API server needs no write
        cluster.status = Some(draft.current.clone());
        assert!(!StatusDraft::new(&cluster).is_dirty());
    }

    #[test]
    fn test_scale_down_is_refused() {
        let mut cluster = create_test_cluster();
        cluster.spec.replicas = 3;
        let live = live_statefulset(&cluster);

        let mut spec = cluster.spec.clone();
        assert!(check_scale_down(Some(&live), &spec).is_ok());

        spec.replicas = 5;
        assert!(check_scale_down(Some(&live), &spec).is_ok());

        spec.replicas = 1;
        let err = check_scale_down(Some(&live), &spec).unwrap_err();
        assert!(matches!(
            err,
            OperatorError::ScaleDown {
                current: 3,
                desired: 1
            }
        ));
        assert_eq!(err.reason(), "UnsupportedOperation");
        assert!(!err.is_retryable());

        assert!(check_scale_down(None, &spec).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_storage_resize_resumes_after_partial_failure() {
        let mut cluster = create_test_cluster();
        cluster.spec.replicas = 3;
        let old = live_statefulset(&cluster);
        cluster.spec.storage.size = "20Gi".to_string();

        let store = store_with_claims(&["10Gi", "10Gi", "10Gi"]);
        store.fail_claim_update("data-burrow-test-cluster-1");
        let scaler = PersistenceScaler::new(store.clone(), ScalerConfig::default());
        let cancel = CancellationToken::new();

        assert!(reconcile_storage(&scaler, &cluster, Some(&old), &cancel)
            .await
            .is_err());
        store.clear_failures();

        // The StatefulSet was removed before the failure
        let resources = gather_resources(store.as_ref(), &cluster).await.unwrap();
        assert!(resources.stateful_set.is_none());

        let removed = reconcile_storage(&scaler, &cluster, None, &cancel)
            .await
            .unwrap();
        assert!(removed);
        assert_eq!(claim_sizes(&store, 3), vec![Some("20Gi".to_string()); 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_storage_resize_follows_claims_not_template() {
        let mut cluster = create_test_cluster();
        cluster.spec.replicas = 3;
        cluster.spec.storage.size = "20Gi".to_string();
        // Recreated from the new spec while two claims are still behind
        let recreated = live_statefulset(&cluster);

        let store = store_with_claims(&["20Gi", "10Gi", "10Gi"]);
        let scaler = PersistenceScaler::new(store.clone(), ScalerConfig::default());
        let cancel = CancellationToken::new();

        let removed = reconcile_storage(&scaler, &cluster, Some(&recreated), &cancel)
            .await
            .unwrap();
        assert!(removed);
        assert_eq!(
            store.updates(),
            vec![
                "data-burrow-test-cluster-1".to_string(),
                "data-burrow-test-cluster-2".to_string(),
            ]
        );

        // Converged: nothing left to do
        let removed = reconcile_storage(&scaler, &cluster, None, &cancel)
            .await
            .unwrap();
        assert!(!removed);
        assert_eq!(store.deletions().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_storage_shrink_refused_without_statefulset() {
        let mut cluster = create_test_cluster();
        cluster.spec.replicas = 2;
        cluster.spec.storage.size = "5Gi".to_string();

        let store = store_with_claims(&["10Gi", "10Gi"]);
        let scaler = PersistenceScaler::new(store.clone(), ScalerConfig::default());

        let err = reconcile_storage(&scaler, &cluster, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OperatorError::StorageShrink { .. }));
        assert!(store.updates().is_empty());
    }

    #[tokio::test]
    async fn test_gather_resources() {
        let cluster = create_test_cluster();
        let endpoints = Endpoints {
            subsets: Some(vec![EndpointSubset {
                addresses: Some(vec![EndpointAddress {
                    ip: "10.0.0.7".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }]),
            ..Default::default()
        };
        let store = InMemoryStore::new()
            .with_stateful_set("burrow-test-cluster")
            .with_endpoints("burrow-test-cluster", endpoints);

        let resources = gather_resources(&store, &cluster).await.unwrap();
        assert!(resources.stateful_set.is_some());
        assert!(resources.endpoints.is_some());

        let empty = gather_resources(&InMemoryStore::new(), &cluster)
            .await
            .unwrap();
        assert!(empty.stateful_set.is_none());
        assert!(empty.endpoints.is_none());
    }

    #[test]
    fn test_cluster_for_endpoints() {
        let endpoints = Endpoints {
            metadata: ObjectMeta {
                name: Some("burrow-orders".to_string()),
                namespace: Some("mq".to_string()),
                labels: Some(BTreeMap::from([(
                    "app.kubernetes.io/instance".to_string(),
                    "orders".to_string(),
                )])),
                ..Default::default()
            },
            ..Default::default()
        };

        let obj = cluster_for_endpoints(endpoints).unwrap();
        assert_eq!(obj.name, "orders");
        assert_eq!(obj.namespace.as_deref(), Some("mq"));

        assert!(cluster_for_endpoints(Endpoints::default()).is_none());
    }

    #[test]
    fn test_verify_ownership() {
        let mut sts = StatefulSet {
            spec: Some(StatefulSetSpec::default()),
            ..Default::default()
        };
        assert!(verify_ownership(&sts).is_ok());

        sts.metadata.labels = Some(BTreeMap::from([(
            "app.kubernetes.io/managed-by".to_string(),
            "Helm".to_string(),
        )]));
        assert!(verify_ownership(&sts).is_err());

        sts.metadata.labels = Some(BTreeMap::from([(
            "app.kubernetes.io/managed-by".to_string(),
            FIELD_MANAGER.to_string(),
        )]));
        assert!(verify_ownership(&sts).is_ok());
    }

    #[test]
    fn test_backoff_delay() {
        let invalid = OperatorError::ValidationError("replicas".to_string());
        assert_eq!(backoff_delay(&invalid, 1), Duration::from_secs(30));
        assert_eq!(backoff_delay(&invalid, 3), Duration::from_secs(120));
        assert_eq!(backoff_delay(&invalid, 20), Duration::from_secs(600));

        let transient = OperatorError::Timeout("poll".to_string());
        assert_eq!(backoff_delay(&transient, 7), Duration::from_secs(30));
    }
}
