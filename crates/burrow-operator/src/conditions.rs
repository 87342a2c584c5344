//! Status condition engine
//!
//! Collapses possibly-missing live resources into four independently
//! reasoned health signals. Every function here is pure: it takes the
//! previous condition of its type and the current time, and returns a new
//! condition. `last_transition_time` only moves when `status` changes.

use crate::crd::{ClusterCondition, ConditionStatus, ConditionType};
use crate::quantity::quantities_equal;
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Endpoints;

/// Live child resources of one cluster, either of which may be missing
#[derive(Debug, Clone, Default)]
pub struct ClusterResources {
    pub stateful_set: Option<StatefulSet>,
    pub endpoints: Option<Endpoints>,
}

/// The fixed, ordered set of conditions reported on a cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConditions {
    pub replica_readiness: ClusterCondition,
    pub availability: ClusterCondition,
    pub warnings: ClusterCondition,
    pub reconcile_outcome: ClusterCondition,
}

impl ClusterConditions {
    /// Replace the reconcile outcome, keeping the other three
    pub fn with_reconcile_outcome(self, reconcile_outcome: ClusterCondition) -> Self {
        Self {
            reconcile_outcome,
            ..self
        }
    }

    /// Serialize in reporting order
    pub fn into_vec(self) -> Vec<ClusterCondition> {
        vec![
            self.replica_readiness,
            self.availability,
            self.warnings,
            self.reconcile_outcome,
        ]
    }
}

/// Find the previous condition of a type in a status list
pub fn find_condition(
    conditions: &[ClusterCondition],
    condition_type: ConditionType,
) -> Option<&ClusterCondition> {
    conditions
        .iter()
        .find(|c| c.condition_type == condition_type)
}

/// Build a condition, carrying the previous transition time when the
/// status did not change.
fn transition(
    condition_type: ConditionType,
    status: ConditionStatus,
    reason: &str,
    message: String,
    previous: Option<&ClusterCondition>,
    now: DateTime<Utc>,
) -> ClusterCondition {
    let last_transition_time = match previous {
        Some(prev) if prev.status == status => prev.last_transition_time,
        _ => now,
    };

    ClusterCondition {
        condition_type,
        status,
        last_transition_time,
        reason: reason.to_string(),
        message,
    }
}

/// AllReplicasReady: are all StatefulSet pods ready?
pub fn replica_readiness(
    resources: &ClusterResources,
    previous: Option<&ClusterCondition>,
    now: DateTime<Utc>,
) -> ClusterCondition {
    let kind = ConditionType::AllReplicasReady;

    let Some(sts) = resources.stateful_set.as_ref() else {
        return transition(
            kind,
            ConditionStatus::Unknown,
            "MissingStatefulSet",
            "Could not find StatefulSet".to_string(),
            previous,
            now,
        );
    };

    let (desired, ready) = sts
        .status
        .as_ref()
        .map(|s| (s.replicas, s.ready_replicas.unwrap_or(0)))
        .unwrap_or((0, 0));

    if ready == desired {
        transition(
            kind,
            ConditionStatus::True,
            "AllPodsAreReady",
            String::new(),
            previous,
            now,
        )
    } else {
        transition(
            kind,
            ConditionStatus::False,
            "NotAllPodsReady",
            format!("{}/{} Pods ready", ready, desired),
            previous,
            now,
        )
    }
}

/// ClusterAvailable: does the client service route to at least one pod?
pub fn availability(
    resources: &ClusterResources,
    previous: Option<&ClusterCondition>,
    now: DateTime<Utc>,
) -> ClusterCondition {
    let kind = ConditionType::ClusterAvailable;

    let Some(endpoints) = resources.endpoints.as_ref() else {
        return transition(
            kind,
            ConditionStatus::False,
            "CouldNotAccessServiceEndpoints",
            "Could not verify available service endpoints".to_string(),
            previous,
            now,
        );
    };

    let any_address = endpoints
        .subsets
        .iter()
        .flatten()
        .any(|subset| subset.addresses.as_ref().is_some_and(|a| !a.is_empty()));

    if any_address {
        transition(
            kind,
            ConditionStatus::True,
            "AtLeastOneEndpointAvailable",
            String::new(),
            previous,
            now,
        )
    } else {
        transition(
            kind,
            ConditionStatus::False,
            "NoEndpointsAvailable",
            "The service has no endpoints available".to_string(),
            previous,
            now,
        )
    }
}

/// NoWarnings: is the broker container's memory request equal to its limit?
pub fn warnings(
    resources: &ClusterResources,
    previous: Option<&ClusterCondition>,
    now: DateTime<Utc>,
) -> ClusterCondition {
    let kind = ConditionType::NoWarnings;

    let Some(sts) = resources.stateful_set.as_ref() else {
        return transition(
            kind,
            ConditionStatus::Unknown,
            "MissingStatefulSet",
            "Could not find StatefulSet".to_string(),
            previous,
            now,
        );
    };

    let container_resources = sts
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|pod| pod.containers.first())
        .and_then(|c| c.resources.as_ref());

    let request = container_resources
        .and_then(|r| r.requests.as_ref())
        .and_then(|r| r.get("memory"));
    let limit = container_resources
        .and_then(|r| r.limits.as_ref())
        .and_then(|l| l.get("memory"));

    if quantities_equal(request, limit) {
        transition(
            kind,
            ConditionStatus::True,
            "NoWarnings",
            String::new(),
            previous,
            now,
        )
    } else {
        transition(
            kind,
            ConditionStatus::False,
            "MemoryRequestAndLimitDifferent",
            "broker container memory resource request and limit must be equal".to_string(),
            previous,
            now,
        )
    }
}

/// ReconcileSuccess, written by the reconciler after a pass
pub fn reconcile_outcome(
    status: ConditionStatus,
    reason: &str,
    message: impl Into<String>,
    previous: Option<&ClusterCondition>,
    now: DateTime<Utc>,
) -> ClusterCondition {
    transition(
        ConditionType::ReconcileSuccess,
        status,
        reason,
        message.into(),
        previous,
        now,
    )
}

/// Recompute all conditions from the live resources
///
/// ReconcileSuccess is not derived from resources; the previous value is
/// carried through as-is, or seeded as `Unknown/Initialising` on first sight.
pub fn compute_all(
    resources: &ClusterResources,
    previous: &[ClusterCondition],
    now: DateTime<Utc>,
) -> ClusterConditions {
    let prev = |t| find_condition(previous, t);

    let reconcile_outcome = match prev(ConditionType::ReconcileSuccess) {
        Some(existing) => existing.clone(),
        None => reconcile_outcome(ConditionStatus::Unknown, "Initialising", "", None, now),
    };

    ClusterConditions {
        replica_readiness: replica_readiness(
            resources,
            prev(ConditionType::AllReplicasReady),
            now,
        ),
        availability: availability(resources, prev(ConditionType::ClusterAvailable), now),
        warnings: warnings(resources, prev(ConditionType::NoWarnings), now),
        reconcile_outcome,
    }
}
