use crate::{Error, Result, Valkey, ValkeySpec};
use common::quantity::parse_bytes;
use k8s_openapi::{
    api::{
        apps::v1::StatefulSet,
        core::v1::{PersistentVolumeClaim, Service},
    },
    apimachinery::pkg::{api::resource::Quantity, apis::meta::v1::OwnerReference},
};
use kube::{Resource, ResourceExt};
use serde_json::{Value, json};
use std::collections::BTreeMap;

pub static DIGEST_ANNOTATION: &str = "cache.valkey.io/template-digest";
pub static MANAGED_BY: &str = "valkey-operator";
static DATA_VOLUME: &str = "data";
const VALKEY_PORT: i32 = 6379;
const EXPORTER_PORT: i32 = 9121;

/// Label selector matching every child of the instance `name`
pub fn selector(name: &str) -> String {
    format!("app.kubernetes.io/instance={name},app.kubernetes.io/managed-by={MANAGED_BY}")
}

/// Desired state of one instance, detached from the watched object
#[derive(Clone, Debug)]
pub struct Desired {
    pub name: String,
    pub namespace: String,
    pub owner: OwnerReference,
    pub spec: ValkeySpec,
    pub size: Quantity,
    pub size_bytes: u128,
}

impl Desired {
    pub fn from_instance(inst: &Valkey) -> Result<Desired> {
        let namespace = inst.namespace().ok_or(Error::MissingObjectKey("metadata.namespace"))?;
        let owner = inst
            .controller_owner_ref(&())
            .ok_or(Error::MissingObjectKey("metadata.uid"))?;
        if inst.spec.replicas < 0 {
            return Err(Error::InvalidSpec(format!(
                "replicas must not be negative, got {}",
                inst.spec.replicas
            )));
        }
        let size_bytes = parse_bytes(&inst.spec.storage.size)?;
        if size_bytes == 0 {
            return Err(Error::InvalidSpec("storage.size must not be zero".to_string()));
        }
        Ok(Desired {
            name: inst.name_any(),
            namespace,
            owner,
            spec: inst.spec.clone(),
            size: Quantity(inst.spec.storage.size.trim().to_string()),
            size_bytes,
        })
    }

    pub fn replicas(&self) -> i32 {
        self.spec.replicas
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("app.kubernetes.io/name".to_string(), "valkey".to_string()),
            ("app.kubernetes.io/instance".to_string(), self.name.clone()),
            ("app.kubernetes.io/managed-by".to_string(), MANAGED_BY.to_string()),
        ])
    }

    /// Labels of the metrics service: the user labels, never overriding ours
    pub fn metrics_labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.spec.prometheus_labels.clone();
        labels.extend(self.labels());
        labels
    }

    fn metadata(&self, name: &str, labels: BTreeMap<String, String>) -> Value {
        json!({
            "name": name,
            "namespace": self.namespace,
            "labels": labels,
            "ownerReferences": [self.owner],
        })
    }

    pub fn workload_name(&self) -> String {
        self.name.clone()
    }

    pub fn headless_name(&self) -> String {
        format!("{}-headless", self.name)
    }

    pub fn client_name(&self) -> String {
        self.name.clone()
    }

    pub fn metrics_name(&self) -> String {
        format!("{}-metrics", self.name)
    }

    /// Name of the volume the StatefulSet binds for the replica `ordinal`
    pub fn volume_name(&self, ordinal: usize) -> String {
        format!("{DATA_VOLUME}-{}-{ordinal}", self.name)
    }

    pub fn volume_ordinal(&self, volume: &str) -> Option<usize> {
        volume
            .strip_prefix(&format!("{DATA_VOLUME}-{}-", self.name))?
            .parse()
            .ok()
    }

    fn volume_spec(&self, size: &Quantity) -> Value {
        let mut spec = json!({
            "accessModes": ["ReadWriteOnce"],
            "resources": {"requests": {"storage": size}},
        });
        if let Some(class) = &self.spec.storage.storage_class_name {
            spec["storageClassName"] = Value::String(class.clone());
        }
        spec
    }

    pub fn volume(&self, ordinal: usize, size: &Quantity) -> Result<PersistentVolumeClaim> {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "PersistentVolumeClaim",
            "metadata": self.metadata(&self.volume_name(ordinal), self.labels()),
            "spec": self.volume_spec(size),
        }))
        .map_err(Error::SerializationError)
    }

    pub fn pod_template(&self) -> Value {
        let mut containers = vec![json!({
            "name": "valkey",
            "image": self.spec.image,
            "imagePullPolicy": "IfNotPresent",
            "command": ["valkey-server"],
            "args": ["--dir", "/data", "--appendonly", "yes", "--protected-mode", "no"],
            "ports": [{"name": "valkey", "containerPort": VALKEY_PORT}],
            "readinessProbe": {
                "exec": {"command": ["valkey-cli", "ping"]},
                "initialDelaySeconds": 5,
                "periodSeconds": 10,
            },
            "volumeMounts": [{"name": DATA_VOLUME, "mountPath": "/data"}],
        })];
        if self.spec.prometheus {
            containers.push(json!({
                "name": "exporter",
                "image": self.spec.exporter_image,
                "imagePullPolicy": "IfNotPresent",
                "env": [{"name": "REDIS_ADDR", "value": format!("redis://localhost:{VALKEY_PORT}")}],
                "ports": [{"name": "metrics", "containerPort": EXPORTER_PORT}],
            }));
        }
        json!({
            "metadata": {"labels": self.labels()},
            "spec": {"containers": containers},
        })
    }

    pub fn template_digest(&self) -> String {
        sha256::digest(self.pod_template().to_string())
    }

    /// Pod template rollout, volume claim templates are immutable and never patched
    pub fn rollout_patch(&self) -> Value {
        json!({
            "metadata": {"annotations": {DIGEST_ANNOTATION: self.template_digest()}},
            "spec": {"template": self.pod_template()},
        })
    }

    pub fn workload(&self, replicas: i32) -> Result<StatefulSet> {
        let mut metadata = self.metadata(&self.workload_name(), self.labels());
        metadata["annotations"] = json!({DIGEST_ANNOTATION: self.template_digest()});
        serde_json::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "StatefulSet",
            "metadata": metadata,
            "spec": {
                "replicas": replicas,
                "serviceName": self.headless_name(),
                "selector": {"matchLabels": self.labels()},
                "podManagementPolicy": "OrderedReady",
                "updateStrategy": {"type": "RollingUpdate"},
                "persistentVolumeClaimRetentionPolicy": {"whenDeleted": "Retain", "whenScaled": "Retain"},
                "template": self.pod_template(),
                "volumeClaimTemplates": [{
                    "metadata": {"name": DATA_VOLUME, "labels": self.labels()},
                    "spec": self.volume_spec(&self.size),
                }],
            },
        }))
        .map_err(Error::SerializationError)
    }

    pub fn headless_service(&self) -> Result<Service> {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": self.metadata(&self.headless_name(), self.labels()),
            "spec": {
                "clusterIP": "None",
                "publishNotReadyAddresses": true,
                "selector": self.labels(),
                "ports": [{"name": "valkey", "port": VALKEY_PORT, "targetPort": "valkey"}],
            },
        }))
        .map_err(Error::SerializationError)
    }

    pub fn client_service(&self) -> Result<Service> {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": self.metadata(&self.client_name(), self.labels()),
            "spec": {
                "selector": self.labels(),
                "ports": [{"name": "valkey", "port": VALKEY_PORT, "targetPort": "valkey"}],
            },
        }))
        .map_err(Error::SerializationError)
    }

    pub fn metrics_service(&self) -> Result<Service> {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": self.metadata(&self.metrics_name(), self.metrics_labels()),
            "spec": {
                "selector": self.labels(),
                "ports": [{"name": "metrics", "port": EXPORTER_PORT, "targetPort": "metrics"}],
            },
        }))
        .map_err(Error::SerializationError)
    }
}
