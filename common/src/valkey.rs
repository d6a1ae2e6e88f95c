use crate::conditions::{ApplicationCondition, ConditionsStatus, ConditionsType};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub static DEFAULT_IMAGE: &str = "valkey/valkey:8.0.1";
pub static DEFAULT_EXPORTER_IMAGE: &str = "oliver006/redis_exporter:v1.66.0";

fn default_image() -> String {
    DEFAULT_IMAGE.to_string()
}
fn default_exporter_image() -> String {
    DEFAULT_EXPORTER_IMAGE.to_string()
}
fn default_replicas() -> i32 {
    3
}
fn default_size() -> String {
    "1Gi".to_string()
}

/// StorageSpec describe the persistent volume of every replica
#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Requested capacity of each replica volume. Volumes can grow, never shrink
    #[serde(default = "default_size")]
    pub size: String,
    /// StorageClass used for new volumes
    pub storage_class_name: Option<String>,
}
impl Default for StorageSpec {
    fn default() -> Self {
        Self {
            size: default_size(),
            storage_class_name: None,
        }
    }
}

/// Describe a managed valkey deployment
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    kind = "Valkey",
    status = "ValkeyStatus",
    shortname = "vk",
    group = "cache.valkey.io",
    version = "v1",
    namespaced
)]
#[kube(
    doc = "Custom resource representing a managed Valkey data-store",
    printcolumn = r#"
    {"name":"replicas", "type":"integer", "description":"Desired replicas", "jsonPath":".spec.replicas"},
    {"name":"ready",    "type":"integer", "description":"Ready replicas", "jsonPath":".status.readyReplicas"},
    {"name":"storage",  "type":"string",  "description":"Volume size", "jsonPath":".spec.storage.size"},
    {"name":"status",   "type":"string",  "description":"Ready", "jsonPath":".status.conditions[?(@.type == 'Ready')].status"},
    {"name":"errors",   "type":"string",  "description":"Errors", "jsonPath":".status.conditions[?(@.type == 'Degraded')].message"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ValkeySpec {
    /// Container image (and so version) of valkey
    #[serde(default = "default_image")]
    pub image: String,
    /// Number of valkey replicas
    #[serde(default = "default_replicas")]
    pub replicas: i32,
    /// Persistent storage of each replica
    #[serde(default)]
    pub storage: StorageSpec,
    /// Run the metrics exporter and publish a metrics service
    #[serde(default)]
    pub prometheus: bool,
    /// Image of the metrics exporter sidecar
    #[serde(default = "default_exporter_image")]
    pub exporter_image: String,
    /// Labels added to the metrics service, for the monitoring stack to select it
    #[serde(default)]
    pub prometheus_labels: BTreeMap<String, String>,
}

/// The status object of `Valkey`
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ValkeyStatus {
    /// Valkey Conditions, unique by type
    #[serde(default)]
    pub conditions: Vec<ApplicationCondition>,
    /// Last generation of the spec fully processed
    pub observed_generation: Option<i64>,
    /// Number of replicas reporting ready
    #[serde(default)]
    pub ready_replicas: i32,
}

impl ValkeyStatus {
    pub fn condition(&self, condition_type: ConditionsType) -> Option<&ApplicationCondition> {
        self.conditions.iter().find(|c| c.condition_type == condition_type)
    }

    pub fn is(&self, condition_type: ConditionsType) -> bool {
        self.condition(condition_type)
            .is_some_and(|c| c.status == ConditionsStatus::True)
    }
}

impl Valkey {
    pub fn have_finalizer(&self) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|f| f == crate::FINALIZER))
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn status_or_default(&self) -> ValkeyStatus {
        self.status.clone().unwrap_or_default()
    }
}
