//! Custom Resource Definitions for the Burrow Kubernetes Operator
//!
//! This module defines the `BurrowCluster` CRD that represents a Burrow
//! message-broker cluster in Kubernetes, together with the condition types
//! reported on its status.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ResourceRequirements;
use kube::{CustomResource, ResourceExt};
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;
use validator::{Validate, ValidationError};

/// Name of the volume claim template holding broker data
pub const DATA_VOLUME_NAME: &str = "data";

/// Regex for validating Kubernetes resource quantities (e.g., "10Gi", "100Mi")
static QUANTITY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]+(\.[0-9]+)?(Ki|Mi|Gi|Ti|Pi|Ei|k|M|G|T|P|E)?$").unwrap());

/// Regex for validating Kubernetes names (RFC 1123 subdomain)
static NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap());

/// Validate a Kubernetes resource quantity string
fn validate_quantity(value: &str) -> Result<(), ValidationError> {
    if QUANTITY_REGEX.is_match(value) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_quantity")
            .with_message(format!("'{}' is not a valid Kubernetes quantity", value).into()))
    }
}

/// Validate a container image reference
fn validate_image(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Ok(()); // Empty is allowed (uses default)
    }
    if value.len() > 255 {
        return Err(ValidationError::new("image_too_long")
            .with_message("image reference exceeds 255 characters".into()));
    }
    if value.contains("..") || value.starts_with('/') || value.starts_with('-') {
        return Err(ValidationError::new("invalid_image")
            .with_message(format!("'{}' is not a valid container image", value).into()));
    }
    Ok(())
}

/// Validate an optional Kubernetes name (RFC 1123 label)
fn validate_optional_k8s_name(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Ok(());
    }
    if value.len() > 63 {
        return Err(
            ValidationError::new("name_too_long").with_message("name exceeds 63 characters".into())
        );
    }
    if !NAME_REGEX.is_match(value) {
        return Err(ValidationError::new("invalid_name").with_message(
            format!("'{}' is not a valid Kubernetes name (RFC 1123)", value).into(),
        ));
    }
    Ok(())
}

/// Validate image pull policy
fn validate_pull_policy(policy: &str) -> Result<(), ValidationError> {
    match policy {
        "Always" | "IfNotPresent" | "Never" => Ok(()),
        _ => Err(ValidationError::new("invalid_pull_policy")
            .with_message("imagePullPolicy must be Always, IfNotPresent, or Never".into())),
    }
}

/// BurrowCluster custom resource definition
///
/// Represents a Burrow message-broker cluster deployment. The operator
/// watches these resources and reconciles the live StatefulSet, Services
/// and PersistentVolumeClaims toward the declared specification.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "burrow.io",
    version = "v1alpha1",
    kind = "BurrowCluster",
    plural = "burrowclusters",
    shortname = "bc",
    namespaced,
    status = "BurrowClusterStatus",
    printcolumn = r#"{"name":"Replicas", "type":"integer", "jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Ready", "type":"integer", "jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BurrowClusterSpec {
    /// Number of broker replicas (0-100, 0 pauses the cluster)
    #[serde(default = "default_replicas")]
    #[validate(range(min = 0, max = 100, message = "replicas must be between 0 and 100"))]
    pub replicas: i32,

    /// Broker version to deploy
    #[serde(default = "default_version")]
    #[validate(length(min = 1, max = 64, message = "version must be 1-64 characters"))]
    pub version: String,

    /// Container image (overrides version-based default)
    #[serde(default)]
    #[validate(custom(function = "validate_image"))]
    pub image: Option<String>,

    /// Image pull policy (Always, IfNotPresent, Never)
    #[serde(default = "default_image_pull_policy")]
    #[validate(custom(function = "validate_pull_policy"))]
    pub image_pull_policy: String,

    /// Persistent storage for broker data
    #[serde(default)]
    #[validate(nested)]
    pub storage: StorageSpec,

    /// Resource requirements (CPU, memory) of the broker container
    #[serde(default)]
    #[schemars(skip)]
    pub resources: Option<ResourceRequirements>,

    /// Service account name
    #[serde(default)]
    #[validate(custom(function = "validate_optional_k8s_name"))]
    pub service_account: Option<String>,
}

/// Storage specification for broker data
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Capacity per replica (e.g., "100Gi"); "0" runs brokers on ephemeral storage
    #[serde(default = "default_storage_size")]
    #[validate(custom(function = "validate_quantity"))]
    pub size: String,

    /// Storage class name (empty uses default)
    #[serde(default)]
    #[validate(custom(function = "validate_optional_k8s_name"))]
    pub storage_class_name: Option<String>,
}

impl Default for StorageSpec {
    fn default() -> Self {
        Self {
            size: default_storage_size(),
            storage_class_name: None,
        }
    }
}

impl Default for BurrowClusterSpec {
    fn default() -> Self {
        Self {
            replicas: default_replicas(),
            version: default_version(),
            image: None,
            image_pull_policy: default_image_pull_policy(),
            storage: StorageSpec::default(),
            resources: None,
            service_account: None,
        }
    }
}

/// Status of a BurrowCluster resource
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BurrowClusterStatus {
    /// Conditions, always in the order AllReplicasReady, ClusterAvailable,
    /// NoWarnings, ReconcileSuccess
    #[serde(default)]
    pub conditions: Vec<ClusterCondition>,

    /// Total number of replicas reported by the StatefulSet
    #[serde(default)]
    pub replicas: i32,

    /// Number of ready replicas
    #[serde(default)]
    pub ready_replicas: i32,

    /// Most recent generation observed by the operator
    #[serde(default)]
    pub observed_generation: i64,

    /// When a deferred disruptive upgrade is scheduled to roll out
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planned_upgrade_time: Option<DateTime<Utc>>,
}

/// Condition status values
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// The four health signals reported on every BurrowCluster
#[derive(Debug, Clone, Copy, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum ConditionType {
    /// Every broker pod is ready
    AllReplicasReady,
    /// The client service has at least one endpoint
    ClusterAvailable,
    /// No configuration smells were detected
    NoWarnings,
    /// The last reconcile pass completed
    ReconcileSuccess,
}

impl ConditionType {
    /// Fixed reporting order
    pub const ALL: [ConditionType; 4] = [
        ConditionType::AllReplicasReady,
        ConditionType::ClusterAvailable,
        ConditionType::NoWarnings,
        ConditionType::ReconcileSuccess,
    ];
}

/// Condition describing an aspect of cluster state
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCondition {
    /// Type of condition
    #[serde(rename = "type")]
    pub condition_type: ConditionType,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Last time the status changed value
    pub last_transition_time: DateTime<Utc>,

    /// One word, camel-case reason for the current status
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

// Default value functions
fn default_replicas() -> i32 {
    3
}

fn default_version() -> String {
    "0.1.0".to_string()
}

fn default_image_pull_policy() -> String {
    "IfNotPresent".to_string()
}

fn default_storage_size() -> String {
    "10Gi".to_string()
}

impl BurrowClusterSpec {
    /// Get the full container image including version
    pub fn get_image(&self) -> String {
        match self.image.as_deref() {
            Some(image) if !image.is_empty() => image.to_string(),
            _ => format!("ghcr.io/burrow-mq/burrow:{}", self.version),
        }
    }

    /// Get labels for managed resources
    pub fn get_labels(&self, cluster_name: &str) -> BTreeMap<String, String> {
        let mut labels = self.get_selector_labels(cluster_name);
        labels.insert(
            "app.kubernetes.io/component".to_string(),
            "broker".to_string(),
        );
        labels.insert(
            "app.kubernetes.io/managed-by".to_string(),
            "burrow-operator".to_string(),
        );
        labels.insert(
            "app.kubernetes.io/version".to_string(),
            self.version.clone(),
        );
        labels
    }

    /// Get selector labels for managed resources
    pub fn get_selector_labels(&self, cluster_name: &str) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert("app.kubernetes.io/name".to_string(), "burrow".to_string());
        labels.insert(
            "app.kubernetes.io/instance".to_string(),
            cluster_name.to_string(),
        );
        labels
    }
}

impl BurrowCluster {
    /// Namespace of the cluster, falling back to `default`
    pub fn namespace_or_default(&self) -> String {
        self.namespace().unwrap_or_else(|| "default".to_string())
    }

    /// Name shared by the StatefulSet and the client Service
    pub fn resource_name(&self) -> String {
        format!("burrow-{}", self.name_any())
    }

    /// Name of the headless Service governing pod identity
    pub fn headless_service_name(&self) -> String {
        format!("{}-headless", self.resource_name())
    }

    /// Deterministic claim name for one replica ordinal
    ///
    /// StatefulSets name claims `<template>-<statefulset>-<ordinal>`.
    pub fn claim_name(&self, ordinal: i32) -> String {
        format!("{}-{}-{}", DATA_VOLUME_NAME, self.resource_name(), ordinal)
    }
}
