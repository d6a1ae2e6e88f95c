use crate::{Error, Result, Valkey, ValkeyStatus, resources};
use async_trait::async_trait;
use common::get_reporter;
use either::Either;
use k8s_openapi::api::{
    apps::v1::StatefulSet,
    core::v1::{PersistentVolumeClaim, Service},
};
use kube::{
    Client, Resource, ResourceExt,
    api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams, Preconditions},
    runtime::events::{Event, Recorder},
};
use serde_json::Value;
use std::fmt;

/// Kind of object created on behalf of a Valkey
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChildKind {
    Workload,
    Service,
    Volume,
}

impl ChildKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChildKind::Workload => "StatefulSet",
            ChildKind::Service => "Service",
            ChildKind::Volume => "PersistentVolumeClaim",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChildRef {
    pub kind: ChildKind,
    pub name: String,
}

impl ChildRef {
    pub fn new(kind: ChildKind, name: impl Into<String>) -> Self {
        Self { kind, name: name.into() }
    }
}

impl fmt::Display for ChildRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind.as_str(), self.name)
    }
}

/// A typed child object
#[derive(Clone, Debug, PartialEq)]
pub enum Child {
    Workload(StatefulSet),
    Service(Service),
    Volume(PersistentVolumeClaim),
}

impl Child {
    pub fn kind(&self) -> ChildKind {
        match self {
            Child::Workload(_) => ChildKind::Workload,
            Child::Service(_) => ChildKind::Service,
            Child::Volume(_) => ChildKind::Volume,
        }
    }

    pub fn name(&self) -> String {
        match self {
            Child::Workload(o) => o.name_any(),
            Child::Service(o) => o.name_any(),
            Child::Volume(o) => o.name_any(),
        }
    }

    pub fn reference(&self) -> ChildRef {
        ChildRef::new(self.kind(), self.name())
    }
}

/// How an object relates to the instance with the uid `uid`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ownership {
    Owned,
    /// No controller at all, free to adopt
    Unowned,
    /// Controlled by another object
    Foreign,
}

impl Ownership {
    pub fn of(meta: &ObjectMeta, uid: &str) -> Self {
        let refs = meta.owner_references.as_deref().unwrap_or_default();
        if refs.iter().any(|r| r.uid == uid) {
            Ownership::Owned
        } else if refs.iter().any(|r| r.controller == Some(true)) {
            Ownership::Foreign
        } else {
            Ownership::Unowned
        }
    }
}

/// Live children of one instance, as listed at the start of a pass
#[derive(Clone, Debug, Default)]
pub struct ObservedChildren {
    pub workload: Option<StatefulSet>,
    pub services: Vec<Service>,
    /// Sorted by name
    pub volumes: Vec<PersistentVolumeClaim>,
    /// Labelled volumes without a controller, as the StatefulSet controller
    /// recreates them from its claim template. Sorted by name.
    pub adoptable: Vec<PersistentVolumeClaim>,
}

impl ObservedChildren {
    /// Sort the labelled objects of the instance `name` by ownership, dropping the foreign ones
    pub fn from_listed(
        uid: &str,
        name: &str,
        workloads: Vec<StatefulSet>,
        services: Vec<Service>,
        volumes: Vec<PersistentVolumeClaim>,
    ) -> Self {
        let workload = workloads
            .into_iter()
            .find(|w| Ownership::of(&w.metadata, uid) == Ownership::Owned && w.name_any() == name);
        let mut services: Vec<Service> = services
            .into_iter()
            .filter(|s| Ownership::of(&s.metadata, uid) == Ownership::Owned)
            .collect();
        services.sort_by_key(|s| s.name_any());
        let (mut volumes, mut adoptable): (Vec<_>, Vec<_>) = volumes
            .into_iter()
            .filter(|v| Ownership::of(&v.metadata, uid) != Ownership::Foreign)
            .partition(|v| Ownership::of(&v.metadata, uid) == Ownership::Owned);
        volumes.sort_by_key(|v| v.name_any());
        adoptable.sort_by_key(|v| v.name_any());
        ObservedChildren {
            workload,
            services,
            volumes,
            adoptable,
        }
    }

    /// Whether any owned child is left
    pub fn is_empty(&self) -> bool {
        self.workload.is_none() && self.services.is_empty() && self.volumes.is_empty()
    }

    pub fn service(&self, name: &str) -> Option<&Service> {
        self.services.iter().find(|s| s.metadata.name.as_deref() == Some(name))
    }

    pub fn volume(&self, name: &str) -> Option<&PersistentVolumeClaim> {
        self.volumes.iter().find(|v| v.metadata.name.as_deref() == Some(name))
    }

    pub fn adoptable(&self, name: &str) -> Option<&PersistentVolumeClaim> {
        self.adoptable.iter().find(|v| v.metadata.name.as_deref() == Some(name))
    }

    /// Every owned child with its token, terminating ones included
    pub fn references(&self) -> Vec<(ChildRef, Option<String>, bool)> {
        let mut refs = Vec::new();
        if let Some(w) = &self.workload {
            refs.push((
                ChildRef::new(ChildKind::Workload, w.name_any()),
                w.resource_version(),
                w.metadata.deletion_timestamp.is_some(),
            ));
        }
        for s in &self.services {
            refs.push((
                ChildRef::new(ChildKind::Service, s.name_any()),
                s.resource_version(),
                s.metadata.deletion_timestamp.is_some(),
            ));
        }
        for v in &self.volumes {
            refs.push((
                ChildRef::new(ChildKind::Volume, v.name_any()),
                v.resource_version(),
                v.metadata.deletion_timestamp.is_some(),
            ));
        }
        refs
    }
}

/// Every call the reconciler makes against the platform.
///
/// Writes carry the `resourceVersion` observed when they were planned, so a
/// concurrent writer makes them fail with a conflict instead of being overwritten.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Fresh read of one instance, `None` when it does not exist
    async fn get_instance(&self, namespace: &str, name: &str) -> Result<Option<Valkey>>;

    /// Children of the instance, see [`ObservedChildren::from_listed`]
    async fn list_children(&self, inst: &Valkey) -> Result<ObservedChildren>;

    /// Returns the resourceVersion of the created object
    async fn create(&self, namespace: &str, child: &Child) -> Result<String>;

    /// Merge patch guarded by `token`, returns the new resourceVersion
    async fn patch(&self, namespace: &str, target: &ChildRef, token: &str, patch: &Value) -> Result<String>;

    async fn delete(&self, namespace: &str, target: &ChildRef, token: Option<&str>) -> Result<()>;

    /// Replace the finalizers of the instance, guarded by its resourceVersion
    async fn set_finalizers(&self, inst: &Valkey, finalizers: Vec<String>) -> Result<()>;

    async fn patch_status(&self, inst: &Valkey, status: &ValkeyStatus) -> Result<()>;

    async fn publish(&self, inst: &Valkey, event: Event) -> Result<()>;
}

/// [`ClusterApi`] backed by the kubernetes API server
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    recorder: Recorder,
}

impl KubeCluster {
    #[must_use]
    pub fn new(client: Client) -> Self {
        let recorder = Recorder::new(client.clone(), get_reporter());
        Self { client, recorder }
    }

    fn guarded(patch: &Value, token: &str) -> Value {
        let mut patch = patch.clone();
        patch["metadata"]["resourceVersion"] = Value::String(token.to_string());
        patch
    }

    async fn patch_one<K>(&self, namespace: &str, name: &str, patch: &Value) -> Result<String, kube::Error>
    where
        K: Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + fmt::Debug
            + serde::de::DeserializeOwned
            + serde::Serialize,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let pp = PatchParams {
            field_manager: Some(common::get_client_name()),
            ..PatchParams::default()
        };
        let obj = api.patch(name, &pp, &Patch::Merge(patch)).await?;
        Ok(obj.meta().resource_version.clone().unwrap_or_default())
    }

    async fn delete_one<K>(&self, namespace: &str, name: &str, token: Option<&str>) -> Result<(), kube::Error>
    where
        K: Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + fmt::Debug
            + serde::de::DeserializeOwned,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let dp = DeleteParams {
            preconditions: token.map(|rv| Preconditions {
                resource_version: Some(rv.to_string()),
                uid: None,
            }),
            ..DeleteParams::background()
        };
        match api.delete(name, &dp).await? {
            Either::Left(_) => tracing::debug!("{name} is being deleted"),
            Either::Right(_) => tracing::debug!("{name} deleted"),
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get_instance(&self, namespace: &str, name: &str) -> Result<Option<Valkey>> {
        let api: Api<Valkey> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name).await.map_err(Error::KubeError)
    }

    async fn list_children(&self, inst: &Valkey) -> Result<ObservedChildren> {
        let ns = inst.namespace().ok_or(Error::MissingObjectKey("metadata.namespace"))?;
        let uid = inst.uid().ok_or(Error::MissingObjectKey("metadata.uid"))?;
        let lp = ListParams::default().labels(&resources::selector(&inst.name_any()));

        let workloads: Api<StatefulSet> = Api::namespaced(self.client.clone(), &ns);
        let services: Api<Service> = Api::namespaced(self.client.clone(), &ns);
        let volumes: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), &ns);

        Ok(ObservedChildren::from_listed(
            &uid,
            &inst.name_any(),
            workloads.list(&lp).await.map_err(Error::KubeError)?.items,
            services.list(&lp).await.map_err(Error::KubeError)?.items,
            volumes.list(&lp).await.map_err(Error::KubeError)?.items,
        ))
    }

    async fn create(&self, namespace: &str, child: &Child) -> Result<String> {
        let pp = PostParams {
            field_manager: Some(common::get_client_name()),
            ..PostParams::default()
        };
        let action = |e| Error::ActionFailed {
            action: format!("create {}", child.reference()),
            source: e,
        };
        let rv = match child {
            Child::Workload(o) => Api::<StatefulSet>::namespaced(self.client.clone(), namespace)
                .create(&pp, o)
                .await
                .map_err(action)?
                .resource_version(),
            Child::Service(o) => Api::<Service>::namespaced(self.client.clone(), namespace)
                .create(&pp, o)
                .await
                .map_err(action)?
                .resource_version(),
            Child::Volume(o) => Api::<PersistentVolumeClaim>::namespaced(self.client.clone(), namespace)
                .create(&pp, o)
                .await
                .map_err(action)?
                .resource_version(),
        };
        Ok(rv.unwrap_or_default())
    }

    async fn patch(&self, namespace: &str, target: &ChildRef, token: &str, patch: &Value) -> Result<String> {
        let patch = Self::guarded(patch, token);
        let res = match target.kind {
            ChildKind::Workload => self.patch_one::<StatefulSet>(namespace, &target.name, &patch).await,
            ChildKind::Service => self.patch_one::<Service>(namespace, &target.name, &patch).await,
            ChildKind::Volume => {
                self.patch_one::<PersistentVolumeClaim>(namespace, &target.name, &patch)
                    .await
            }
        };
        res.map_err(|e| Error::ActionFailed {
            action: format!("patch {target}"),
            source: e,
        })
    }

    async fn delete(&self, namespace: &str, target: &ChildRef, token: Option<&str>) -> Result<()> {
        let res = match target.kind {
            ChildKind::Workload => self.delete_one::<StatefulSet>(namespace, &target.name, token).await,
            ChildKind::Service => self.delete_one::<Service>(namespace, &target.name, token).await,
            ChildKind::Volume => {
                self.delete_one::<PersistentVolumeClaim>(namespace, &target.name, token)
                    .await
            }
        };
        match res {
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(e) => Err(Error::ActionFailed {
                action: format!("delete {target}"),
                source: e,
            }),
            Ok(()) => Ok(()),
        }
    }

    async fn set_finalizers(&self, inst: &Valkey, finalizers: Vec<String>) -> Result<()> {
        let ns = inst.namespace().ok_or(Error::MissingObjectKey("metadata.namespace"))?;
        let api: Api<Valkey> = Api::namespaced(self.client.clone(), &ns);
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": inst.resource_version(),
            }
        });
        api.patch(&inst.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(Error::KubeError)?;
        Ok(())
    }

    async fn patch_status(&self, inst: &Valkey, status: &ValkeyStatus) -> Result<()> {
        let ns = inst.namespace().ok_or(Error::MissingObjectKey("metadata.namespace"))?;
        let api: Api<Valkey> = Api::namespaced(self.client.clone(), &ns);
        let patch = serde_json::json!({
            "apiVersion": format!("{}/v1", common::GROUP),
            "kind": "Valkey",
            "status": status,
        });
        api.patch_status(&inst.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(Error::KubeError)?;
        Ok(())
    }

    async fn publish(&self, inst: &Valkey, event: Event) -> Result<()> {
        let oref = inst.object_ref(&());
        match self.recorder.publish(&event, &oref).await {
            Ok(()) => Ok(()),
            Err(kube::Error::Api(src)) => {
                // namespaces being terminated refuse new events
                tracing::warn!("Ignoring {:?} while sending an event", src);
                Ok(())
            }
            Err(e) => Err(Error::KubeError(e)),
        }
    }
}
