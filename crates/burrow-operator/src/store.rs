//! Resource store abstraction
//!
//! The persistence scaler and the status gathering only need a handful of
//! get/delete/update calls against the Kubernetes API. They go through
//! [`ResourceStore`] so the delete-and-poll choreography can be exercised
//! against an in-memory store in tests.

use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Endpoints, PersistentVolumeClaim};
use kube::api::{Api, DeleteParams, PostParams, PropagationPolicy};
use kube::Client;
use tracing::debug;

/// How dependents are treated when their owner is deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletePropagation {
    /// Dependents (pods, claims) survive the owner
    Orphan,
}

impl From<DeletePropagation> for PropagationPolicy {
    fn from(value: DeletePropagation) -> Self {
        match value {
            DeletePropagation::Orphan => PropagationPolicy::Orphan,
        }
    }
}

/// Result of a delete call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The API server accepted the deletion
    Deleted,
    /// There was nothing to delete
    NotFound,
}

/// Get/delete/update access to the objects owned by a cluster
///
/// Getters return `Ok(None)` for objects that do not exist; every other
/// failure is an error.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Fetch a StatefulSet
    async fn get_stateful_set(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>>;

    /// Delete a StatefulSet with the given propagation policy
    async fn delete_stateful_set(
        &self,
        namespace: &str,
        name: &str,
        propagation: DeletePropagation,
    ) -> Result<DeleteOutcome>;

    /// Fetch a PersistentVolumeClaim
    async fn get_claim(&self, namespace: &str, name: &str)
        -> Result<Option<PersistentVolumeClaim>>;

    /// Replace a PersistentVolumeClaim
    async fn update_claim(&self, namespace: &str, claim: &PersistentVolumeClaim) -> Result<()>;

    /// Fetch the Endpoints of a Service
    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>>;
}

/// [`ResourceStore`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeResourceStore {
    client: Client,
}

impl KubeResourceStore {
    /// Create a store using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Map a 404 to `None`
fn not_found_as_none<T>(result: std::result::Result<T, kube::Error>) -> Result<Option<T>> {
    match result {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(OperatorError::from(e)),
    }
}

#[async_trait]
impl ResourceStore for KubeResourceStore {
    async fn get_stateful_set(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        not_found_as_none(api.get(name).await)
    }

    async fn delete_stateful_set(
        &self,
        namespace: &str,
        name: &str,
        propagation: DeletePropagation,
    ) -> Result<DeleteOutcome> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        let params = DeleteParams {
            propagation_policy: Some(propagation.into()),
            ..Default::default()
        };

        debug!(name = %name, namespace = %namespace, ?propagation, "Deleting StatefulSet");

        match api.delete(name, &params).await {
            Ok(_) => Ok(DeleteOutcome::Deleted),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(DeleteOutcome::NotFound),
            Err(e) => Err(OperatorError::from(e)),
        }
    }

    async fn get_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        not_found_as_none(api.get(name).await)
    }

    async fn update_claim(&self, namespace: &str, claim: &PersistentVolumeClaim) -> Result<()> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let name = claim.metadata.name.as_deref().ok_or_else(|| {
            OperatorError::InvalidConfig("PersistentVolumeClaim missing metadata.name".into())
        })?;

        api.replace(name, &PostParams::default(), claim)
            .await
            .map_err(OperatorError::from)?;

        Ok(())
    }

    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>> {
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), namespace);
        not_found_as_none(api.get(name).await)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory [`ResourceStore`] for unit tests

    use super::*;
    use k8s_openapi::api::core::v1::{PersistentVolumeClaimSpec, VolumeResourceRequirements};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use parking_lot::Mutex;
    use std::collections::{BTreeMap, HashMap, HashSet};

    /// Build a claim requesting `size` of storage
    pub fn claim(name: &str, size: Option<&str>) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                resources: Some(VolumeResourceRequirements {
                    requests: size.map(|s| {
                        BTreeMap::from([("storage".to_string(), Quantity(s.to_string()))])
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Storage request of a claim, if any
    pub fn claim_size(claim: &PersistentVolumeClaim) -> Option<String> {
        claim
            .spec
            .as_ref()?
            .resources
            .as_ref()?
            .requests
            .as_ref()?
            .get("storage")
            .map(|q| q.0.clone())
    }

    #[derive(Default)]
    struct State {
        stateful_sets: HashMap<String, StatefulSet>,
        claims: HashMap<String, PersistentVolumeClaim>,
        endpoints: HashMap<String, Endpoints>,
        /// StatefulSet names with the propagation used to delete them
        deletions: Vec<(String, DeletePropagation)>,
        /// Claim names in update order
        updates: Vec<String>,
        failing_claim_gets: HashSet<String>,
        failing_claim_updates: HashSet<String>,
        /// Number of polls a deleted StatefulSet stays visible for
        linger_polls: Option<usize>,
        /// StatefulSet gets never complete
        stall_stateful_set_gets: bool,
    }

    /// Store keyed by object name; namespaces are ignored
    #[derive(Default)]
    pub struct InMemoryStore {
        state: Mutex<State>,
    }

    impl InMemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_stateful_set(self, name: &str) -> Self {
            self.state.lock().stateful_sets.insert(
                name.to_string(),
                StatefulSet {
                    metadata: ObjectMeta {
                        name: Some(name.to_string()),
                        ..Default::default()
                    },
                    ..Default::default()
                },
            );
            self
        }

        pub fn with_claim(self, name: &str, size: Option<&str>) -> Self {
            self.state
                .lock()
                .claims
                .insert(name.to_string(), claim(name, size));
            self
        }

        pub fn with_endpoints(self, name: &str, endpoints: Endpoints) -> Self {
            self.state
                .lock()
                .endpoints
                .insert(name.to_string(), endpoints);
            self
        }

        /// Make every `get_claim` for `name` fail
        pub fn fail_claim_get(&self, name: &str) {
            self.state.lock().failing_claim_gets.insert(name.to_string());
        }

        /// Make every `update_claim` for `name` fail
        pub fn fail_claim_update(&self, name: &str) {
            self.state
                .lock()
                .failing_claim_updates
                .insert(name.to_string());
        }

        pub fn clear_failures(&self) {
            let mut state = self.state.lock();
            state.failing_claim_gets.clear();
            state.failing_claim_updates.clear();
        }

        /// Keep a deleted StatefulSet visible for `polls` gets, or forever
        pub fn linger_after_delete(&self, polls: Option<usize>) {
            self.state.lock().linger_polls = Some(polls.unwrap_or(usize::MAX));
        }

        /// Make every later `get_stateful_set` hang
        pub fn stall_stateful_set_gets(&self) {
            self.state.lock().stall_stateful_set_gets = true;
        }

        pub fn remove_claim(&self, name: &str) {
            self.state.lock().claims.remove(name);
        }

        pub fn has_stateful_set(&self, name: &str) -> bool {
            self.state.lock().stateful_sets.contains_key(name)
        }

        pub fn deletions(&self) -> Vec<(String, DeletePropagation)> {
            self.state.lock().deletions.clone()
        }

        pub fn updates(&self) -> Vec<String> {
            self.state.lock().updates.clone()
        }

        pub fn size_of(&self, claim_name: &str) -> Option<String> {
            self.state.lock().claims.get(claim_name).and_then(claim_size)
        }
    }

    fn unavailable(what: &str) -> OperatorError {
        OperatorError::ReconcileFailed(format!("injected failure: {}", what))
    }

    #[async_trait]
    impl ResourceStore for InMemoryStore {
        async fn get_stateful_set(
            &self,
            _namespace: &str,
            name: &str,
        ) -> Result<Option<StatefulSet>> {
            let stalled = self.state.lock().stall_stateful_set_gets;
            if stalled {
                std::future::pending::<()>().await;
            }

            let mut state = self.state.lock();
            let deleted = state.deletions.iter().any(|(n, _)| n == name);
            if deleted {
                if let Some(remaining) = state.linger_polls.as_mut() {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return Ok(state.stateful_sets.get(name).cloned().or_else(|| {
                            Some(StatefulSet::default())
                        }));
                    }
                }
                state.stateful_sets.remove(name);
            }
            Ok(state.stateful_sets.get(name).cloned())
        }

        async fn delete_stateful_set(
            &self,
            _namespace: &str,
            name: &str,
            propagation: DeletePropagation,
        ) -> Result<DeleteOutcome> {
            let mut state = self.state.lock();
            if !state.stateful_sets.contains_key(name) {
                return Ok(DeleteOutcome::NotFound);
            }
            state.deletions.push((name.to_string(), propagation));
            if state.linger_polls.is_none() {
                state.stateful_sets.remove(name);
            }
            Ok(DeleteOutcome::Deleted)
        }

        async fn get_claim(
            &self,
            _namespace: &str,
            name: &str,
        ) -> Result<Option<PersistentVolumeClaim>> {
            let state = self.state.lock();
            if state.failing_claim_gets.contains(name) {
                return Err(unavailable(name));
            }
            Ok(state.claims.get(name).cloned())
        }

        async fn update_claim(
            &self,
            _namespace: &str,
            claim: &PersistentVolumeClaim,
        ) -> Result<()> {
            let name = claim.metadata.name.clone().unwrap_or_default();
            let mut state = self.state.lock();
            if state.failing_claim_updates.contains(&name) {
                return Err(unavailable(&name));
            }
            state.updates.push(name.clone());
            state.claims.insert(name, claim.clone());
            Ok(())
        }

        async fn get_endpoints(&self, _namespace: &str, name: &str) -> Result<Option<Endpoints>> {
            Ok(self.state.lock().endpoints.get(name).cloned())
        }
    }
}
