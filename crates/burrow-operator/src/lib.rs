//! # Burrow Kubernetes Operator
//!
//! Kubernetes operator for deploying and managing Burrow message-broker
//! clusters through the `BurrowCluster` custom resource.
//!
//! ## Features
//!
//! - **Status conditions**: `AllReplicasReady`, `ClusterAvailable`,
//!   `NoWarnings` and `ReconcileSuccess`, with transition times that only
//!   move when a status changes
//! - **Storage growth**: claims are resized in place after the owning
//!   StatefulSet is removed with an orphan cascade; shrinking and moving
//!   from ephemeral to persistent storage are refused
//! - **Staggered upgrades**: image changes across many clusters are spread
//!   over a configurable window
//! - **Observability**: Prometheus-compatible operator metrics
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use burrow_operator::prelude::*;
//! use kube::Client;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Client::try_default().await?;
//!     run_controller(client, None, OperatorConfig::default(), CancellationToken::new()).await
//! }
//! ```
//!
//! ## Architecture
//!
//! 1. **Observe**: read the StatefulSet and client Service endpoints and
//!    recompute the status conditions
//! 2. **Resize**: grow persistent volumes when `spec.storage.size` grew
//! 3. **Act**: apply Services, then the StatefulSet, unless an image
//!    upgrade is held back until its planned time
//! 4. **Report**: record the outcome of the pass as `ReconcileSuccess`
//!
//! ## Modules
//!
//! - [`crd`] - Custom Resource Definition types with validation
//! - [`controller`] - reconciliation logic and controller setup
//! - [`conditions`] - status condition computation
//! - [`scaling`] - persistent volume resizing
//! - [`rollout`] - upgrade time planning
//! - [`store`] - resource access used by the above
//! - [`resources`] - StatefulSet and Service builders
//! - [`quantity`] - exact resource quantity comparison
//! - [`error`] - Error types for operator operations
//!
//! ## Example
//!
//! ```yaml
//! apiVersion: burrow.io/v1alpha1
//! kind: BurrowCluster
//! metadata:
//!   name: orders
//! spec:
//!   replicas: 3
//!   version: "0.1.0"
//!   storage:
//!     size: 100Gi
//!   resources:
//!     requests:
//!       memory: 2Gi
//!     limits:
//!       memory: 2Gi
//! ```
//!
//! ## Metrics
//!
//! - `burrow_operator_reconciliations_total` - Total reconciliation attempts
//! - `burrow_operator_reconciliation_errors_total` - Reconciliation errors
//! - `burrow_operator_reconciliation_duration_seconds` - Reconciliation latency
//! - `burrow_operator_claims_resized_total` - Claims grown by the scaler
//! - `burrow_operator_statefulset_recreations_total` - Orphan deletions for resizes
//! - `burrow_operator_upgrades_deferred_total` - Passes that held back an upgrade

pub mod conditions;
pub mod controller;
pub mod crd;
pub mod error;
pub mod quantity;
pub mod resources;
pub mod rollout;
pub mod scaling;
pub mod store;

pub mod prelude {
    //! Re-exports for convenient usage
    pub use crate::conditions::{compute_all, ClusterConditions, ClusterResources};
    pub use crate::controller::{
        run_controller, ControllerContext, ControllerMetrics, OperatorConfig,
    };
    pub use crate::crd::{
        BurrowCluster, BurrowClusterSpec, BurrowClusterStatus, ClusterCondition, ConditionStatus,
        ConditionType, StorageSpec,
    };
    pub use crate::error::{OperatorError, Result};
    pub use crate::resources::ResourceBuilder;
    pub use crate::rollout::RolloutScheduler;
    pub use crate::scaling::{PersistenceScaler, ScaleOutcome, ScalerConfig};
    pub use crate::store::{KubeResourceStore, ResourceStore};
}
