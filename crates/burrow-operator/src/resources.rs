//! Kubernetes Resource Builders
//!
//! This module generates the StatefulSet and Services of a BurrowCluster,
//! and reads back the fields of a live StatefulSet the reconciler compares
//! against the desired state.

use crate::crd::{BurrowCluster, BurrowClusterSpec, DATA_VOLUME_NAME};
use crate::error::{OperatorError, Result};
use crate::quantity::Capacity;
use k8s_openapi::api::apps::v1::{
    RollingUpdateStatefulSetStrategy, StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy,
};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource, ObjectFieldSelector,
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec, Probe, Service,
    ServicePort, ServiceSpec, TCPSocketAction, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::Resource;
use std::collections::BTreeMap;

/// Client protocol port
pub const BROKER_PORT: i32 = 5672;

/// Inter-node clustering port
pub const CLUSTER_PORT: i32 = 25672;

/// Name of the broker container
pub const BROKER_CONTAINER: &str = "burrow";

const DATA_MOUNT_PATH: &str = "/var/lib/burrow";

/// Builder for generating Kubernetes resources from a BurrowCluster
pub struct ResourceBuilder<'a> {
    cluster: &'a BurrowCluster,
    name: String,
    namespace: String,
}

impl<'a> ResourceBuilder<'a> {
    /// Create a new resource builder
    pub fn new(cluster: &'a BurrowCluster) -> Result<Self> {
        let name =
            cluster.metadata.name.clone().ok_or_else(|| {
                OperatorError::InvalidConfig("cluster name is required".to_string())
            })?;

        Ok(Self {
            cluster,
            name,
            namespace: cluster.namespace_or_default(),
        })
    }

    fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: BurrowCluster::api_version(&()).to_string(),
            kind: BurrowCluster::kind(&()).to_string(),
            name: self.name.clone(),
            uid: self.cluster.metadata.uid.clone().unwrap_or_default(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    fn metadata(&self, name: String) -> ObjectMeta {
        ObjectMeta {
            name: Some(name),
            namespace: Some(self.namespace.clone()),
            labels: Some(self.cluster.spec.get_labels(&self.name)),
            owner_references: Some(vec![self.owner_reference()]),
            ..Default::default()
        }
    }

    /// Build the StatefulSet running the brokers
    ///
    /// A storage size of zero runs brokers on an `emptyDir` instead of a
    /// claim template.
    pub fn build_statefulset(&self) -> Result<StatefulSet> {
        let spec = &self.cluster.spec;
        let selector_labels = spec.get_selector_labels(&self.name);
        let claim_template = self.build_claim_template(spec)?;

        let volumes = match claim_template {
            Some(_) => None,
            None => Some(vec![Volume {
                name: DATA_VOLUME_NAME.to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            }]),
        };

        let pod_spec = PodSpec {
            containers: vec![self.build_container(spec)],
            volumes,
            service_account_name: spec.service_account.clone(),
            automount_service_account_token: Some(false),
            termination_grace_period_seconds: Some(604_800),
            ..Default::default()
        };

        Ok(StatefulSet {
            metadata: self.metadata(self.cluster.resource_name()),
            spec: Some(StatefulSetSpec {
                service_name: self.cluster.headless_service_name(),
                replicas: Some(spec.replicas),
                selector: LabelSelector {
                    match_labels: Some(selector_labels.clone()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(selector_labels),
                        ..Default::default()
                    }),
                    spec: Some(pod_spec),
                },
                volume_claim_templates: claim_template.map(|t| vec![t]),
                pod_management_policy: Some("Parallel".to_string()),
                update_strategy: Some(StatefulSetUpdateStrategy {
                    type_: Some("RollingUpdate".to_string()),
                    rolling_update: Some(RollingUpdateStatefulSetStrategy {
                        max_unavailable: Some(IntOrString::Int(1)),
                        partition: Some(0),
                    }),
                }),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    fn build_container(&self, spec: &BurrowClusterSpec) -> Container {
        let field_env = |name: &str, path: &str| EnvVar {
            name: name.to_string(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: path.to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        let env = vec![
            EnvVar {
                name: "BURROW_DATA_DIR".to_string(),
                value: Some(DATA_MOUNT_PATH.to_string()),
                ..Default::default()
            },
            EnvVar {
                name: "BURROW_CLUSTER_NAME".to_string(),
                value: Some(self.name.clone()),
                ..Default::default()
            },
            EnvVar {
                name: "BURROW_SERVICE_NAME".to_string(),
                value: Some(self.cluster.headless_service_name()),
                ..Default::default()
            },
            field_env("BURROW_POD_NAME", "metadata.name"),
            field_env("BURROW_POD_NAMESPACE", "metadata.namespace"),
        ];

        let tcp_probe = |initial_delay: i32| Probe {
            tcp_socket: Some(TCPSocketAction {
                port: IntOrString::String("broker".to_string()),
                ..Default::default()
            }),
            initial_delay_seconds: Some(initial_delay),
            period_seconds: Some(10),
            timeout_seconds: Some(5),
            failure_threshold: Some(3),
            ..Default::default()
        };

        Container {
            name: BROKER_CONTAINER.to_string(),
            image: Some(spec.get_image()),
            image_pull_policy: Some(spec.image_pull_policy.clone()),
            env: Some(env),
            ports: Some(vec![
                ContainerPort {
                    name: Some("broker".to_string()),
                    container_port: BROKER_PORT,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                },
                ContainerPort {
                    name: Some("cluster".to_string()),
                    container_port: CLUSTER_PORT,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                },
            ]),
            resources: spec.resources.clone(),
            liveness_probe: Some(tcp_probe(60)),
            readiness_probe: Some(tcp_probe(10)),
            volume_mounts: Some(vec![VolumeMount {
                name: DATA_VOLUME_NAME.to_string(),
                mount_path: DATA_MOUNT_PATH.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }
    }

    /// Claim template for broker data, or `None` for ephemeral storage
    fn build_claim_template(&self, spec: &BurrowClusterSpec) -> Result<Option<PersistentVolumeClaim>> {
        let size = Quantity(spec.storage.size.clone());
        if Capacity::from_quantity(&size)?.is_zero() {
            return Ok(None);
        }

        Ok(Some(PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(DATA_VOLUME_NAME.to_string()),
                labels: Some(spec.get_selector_labels(&self.name)),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                storage_class_name: spec.storage.storage_class_name.clone(),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([("storage".to_string(), size)])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }))
    }

    /// Build the headless service for pod discovery
    pub fn build_headless_service(&self) -> Service {
        Service {
            metadata: self.metadata(self.cluster.headless_service_name()),
            spec: Some(ServiceSpec {
                cluster_ip: Some("None".to_string()),
                selector: Some(self.cluster.spec.get_selector_labels(&self.name)),
                ports: Some(vec![service_port("cluster", CLUSTER_PORT)]),
                publish_not_ready_addresses: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Build the client-facing service
    ///
    /// Its Endpoints back the `ClusterAvailable` condition.
    pub fn build_client_service(&self) -> Service {
        Service {
            metadata: self.metadata(self.cluster.resource_name()),
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                selector: Some(self.cluster.spec.get_selector_labels(&self.name)),
                ports: Some(vec![service_port("broker", BROKER_PORT)]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

fn service_port(name: &str, port: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        target_port: Some(IntOrString::Int(port)),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

/// Storage requested by the `data` claim template of a live StatefulSet
///
/// `None` when the StatefulSet has no such template (ephemeral storage).
pub fn data_template_size(sts: &StatefulSet) -> Option<&Quantity> {
    sts.spec
        .as_ref()?
        .volume_claim_templates
        .as_ref()?
        .iter()
        .find(|t| t.metadata.name.as_deref() == Some(DATA_VOLUME_NAME))?
        .spec
        .as_ref()?
        .resources
        .as_ref()?
        .requests
        .as_ref()?
        .get("storage")
}

/// Image of the broker container of a live StatefulSet
pub fn broker_image(sts: &StatefulSet) -> Option<&str> {
    sts.spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .iter()
        .find(|c| c.name == BROKER_CONTAINER)?
        .image
        .as_deref()
}
