//! In-memory [`ClusterApi`] for the reconciler tests
use crate::{
    Error, Result, Valkey, ValkeySpec, ValkeyStatus,
    cluster::{Child, ChildKind, ChildRef, ClusterApi, ObservedChildren},
};
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{ResourceExt, core::ErrorResponse, runtime::events::Event};
use serde_json::{Value, json};
use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard},
};

/// A Valkey named `cache` in namespace `db`, at generation 1
pub fn instance(spec: Value) -> Valkey {
    let spec: ValkeySpec = serde_json::from_value(spec).unwrap();
    let mut inst = Valkey::new("cache", spec);
    inst.metadata.namespace = Some("db".to_string());
    inst.metadata.uid = Some("uid-cache".to_string());
    inst.metadata.generation = Some(1);
    inst.metadata.resource_version = Some("1".to_string());
    inst
}

fn api_error(code: u16, reason: &str) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{reason} ({code})"),
        reason: reason.to_string(),
        code,
    })
}

#[derive(Default)]
struct State {
    instance: Option<Valkey>,
    objects: BTreeMap<ChildRef, Value>,
    version: u64,
    mutations: Vec<String>,
    events: Vec<String>,
    faults: Vec<(String, String, u16)>,
    gc_lag: bool,
    vanish_on_list: bool,
}

impl State {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    fn fault(&mut self, verb: &str, name: &str) -> Option<kube::Error> {
        let pos = self.faults.iter().position(|(v, n, _)| v == verb && n == name)?;
        let (_, _, code) = self.faults.remove(pos);
        Some(api_error(code, "Injected"))
    }

    fn typed<K: serde::de::DeserializeOwned>(&self, kind: ChildKind) -> Vec<K> {
        self.objects
            .iter()
            .filter(|(r, _)| r.kind == kind)
            .map(|(_, v)| serde_json::from_value(v.clone()).unwrap())
            .collect()
    }
}

/// Cluster state shared by the reconciler under test and the assertions
pub struct MockCluster {
    state: Mutex<State>,
}

impl MockCluster {
    pub fn new(instance: Valkey) -> Self {
        Self {
            state: Mutex::new(State {
                instance: Some(instance),
                version: 100,
                ..State::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn instance(&self) -> Option<Valkey> {
        self.state().instance.clone()
    }

    pub fn status(&self) -> ValkeyStatus {
        self.instance().unwrap().status.unwrap_or_default()
    }

    /// Mutating calls received so far, status writes included
    pub fn mutations(&self) -> Vec<String> {
        self.state().mutations.clone()
    }

    pub fn clear_mutations(&self) {
        self.state().mutations.clear();
    }

    /// Published events, as `reason: note`
    pub fn events(&self) -> Vec<String> {
        self.state().events.clone()
    }

    pub fn object<K: serde::de::DeserializeOwned>(&self, kind: ChildKind, name: &str) -> Option<K> {
        self.state()
            .objects
            .get(&ChildRef::new(kind, name))
            .map(|v| serde_json::from_value(v.clone()).unwrap())
    }

    pub fn children(&self) -> Vec<ChildRef> {
        self.state().objects.keys().cloned().collect()
    }

    /// Edit the spec the way a user would, bumping the generation
    pub fn set_spec(&self, edit: impl FnOnce(&mut ValkeySpec)) {
        let mut state = self.state();
        let version = state.next_version();
        let inst = state.instance.as_mut().unwrap();
        edit(&mut inst.spec);
        inst.metadata.generation = Some(inst.metadata.generation.unwrap_or_default() + 1);
        inst.metadata.resource_version = Some(version);
    }

    pub fn request_deletion(&self) {
        let mut state = self.state();
        let version = state.next_version();
        let inst = state.instance.as_mut().unwrap();
        inst.metadata.deletion_timestamp = Some(Time(Utc::now()));
        inst.metadata.resource_version = Some(version);
    }

    /// Deleted children stay terminating until [`MockCluster::collect_garbage`]
    pub fn set_gc_lag(&self, lag: bool) {
        self.state().gc_lag = lag;
    }

    pub fn collect_garbage(&self) {
        self.state()
            .objects
            .retain(|_, v| v["metadata"]["deletionTimestamp"].is_null());
    }

    /// Fail the next `verb` ("create", "patch", "delete", or "list" with the instance name) on `name` with the http `code`
    pub fn fail_next(&self, verb: &str, name: &str, code: u16) {
        self.state()
            .faults
            .push((verb.to_string(), name.to_string(), code));
    }

    /// A concurrent writer modified the child
    pub fn touch(&self, kind: ChildKind, name: &str) {
        self.edit(kind, name, |_| {});
    }

    /// Someone else than the operator changed the child
    pub fn edit(&self, kind: ChildKind, name: &str, change: impl FnOnce(&mut Value)) {
        let mut state = self.state();
        let version = state.next_version();
        let obj = state.objects.get_mut(&ChildRef::new(kind, name)).unwrap();
        let spec_before = obj["spec"].clone();
        change(obj);
        if obj["spec"] != spec_before {
            let generation = obj["metadata"]["generation"].as_i64().unwrap_or(1) + 1;
            obj["metadata"]["generation"] = json!(generation);
        }
        obj["metadata"]["resourceVersion"] = Value::String(version);
    }

    /// The child loses its owner, as when the StatefulSet controller recreates a claim
    pub fn disown(&self, kind: ChildKind, name: &str) {
        self.edit(kind, name, |obj| {
            obj["metadata"].as_object_mut().unwrap().remove("ownerReferences");
        });
    }

    /// The instance is deleted right after its children are listed
    pub fn vanish_on_list(&self) {
        self.state().vanish_on_list = true;
    }

    /// Let the platform controllers catch up: pods ready, volumes bound at their requested size
    pub fn settle(&self) {
        let mut state = self.state();
        for (r, obj) in state.objects.iter_mut() {
            match r.kind {
                ChildKind::Workload => {
                    let replicas = obj["spec"]["replicas"].as_i64().unwrap_or(1);
                    let generation = obj["metadata"]["generation"].clone();
                    obj["status"] = json!({
                        "replicas": replicas,
                        "readyReplicas": replicas,
                        "updatedReplicas": replicas,
                        "observedGeneration": generation,
                    });
                }
                ChildKind::Volume => {
                    let size = obj["spec"]["resources"]["requests"]["storage"].clone();
                    obj["status"] = json!({"phase": "Bound", "capacity": {"storage": size}});
                }
                ChildKind::Service => {}
            }
        }
    }
}

#[async_trait]
impl ClusterApi for MockCluster {
    async fn get_instance(&self, namespace: &str, name: &str) -> Result<Option<Valkey>> {
        Ok(self
            .state()
            .instance
            .clone()
            .filter(|i| i.namespace().as_deref() == Some(namespace) && i.name_any() == name))
    }

    async fn list_children(&self, inst: &Valkey) -> Result<ObservedChildren> {
        let mut state = self.state();
        if let Some(e) = state.fault("list", &inst.name_any()) {
            return Err(Error::KubeError(e));
        }
        let uid = inst.uid().ok_or(Error::MissingObjectKey("metadata.uid"))?;
        let observed = ObservedChildren::from_listed(
            &uid,
            &inst.name_any(),
            state.typed(ChildKind::Workload),
            state.typed(ChildKind::Service),
            state.typed(ChildKind::Volume),
        );
        if std::mem::take(&mut state.vanish_on_list) {
            state.instance = None;
        }
        Ok(observed)
    }

    async fn create(&self, _namespace: &str, child: &Child) -> Result<String> {
        let mut state = self.state();
        let target = child.reference();
        let failed = |source| Error::ActionFailed {
            action: format!("create {target}"),
            source,
        };
        if let Some(e) = state.fault("create", &target.name) {
            return Err(failed(e));
        }
        if state.objects.contains_key(&target) {
            return Err(failed(api_error(409, "AlreadyExists")));
        }
        let mut obj = match child {
            Child::Workload(o) => serde_json::to_value(o)?,
            Child::Service(o) => serde_json::to_value(o)?,
            Child::Volume(o) => serde_json::to_value(o)?,
        };
        let version = state.next_version();
        obj["metadata"]["resourceVersion"] = Value::String(version.clone());
        obj["metadata"]["generation"] = json!(1);
        state.mutations.push(format!("create {target}"));
        state.objects.insert(target, obj);
        Ok(version)
    }

    async fn patch(&self, _namespace: &str, target: &ChildRef, token: &str, patch: &Value) -> Result<String> {
        let mut state = self.state();
        let failed = |source| Error::ActionFailed {
            action: format!("patch {target}"),
            source,
        };
        if let Some(e) = state.fault("patch", &target.name) {
            return Err(failed(e));
        }
        let version = state.next_version();
        let Some(obj) = state.objects.get_mut(target) else {
            return Err(failed(api_error(404, "NotFound")));
        };
        if obj["metadata"]["resourceVersion"].as_str() != Some(token) {
            return Err(failed(api_error(409, "Conflict")));
        }
        let spec_before = obj["spec"].clone();
        json_patch::merge(obj, patch);
        if obj["spec"] != spec_before {
            let generation = obj["metadata"]["generation"].as_i64().unwrap_or(1) + 1;
            obj["metadata"]["generation"] = json!(generation);
        }
        obj["metadata"]["resourceVersion"] = Value::String(version.clone());
        state.mutations.push(format!("patch {target}"));
        Ok(version)
    }

    async fn delete(&self, _namespace: &str, target: &ChildRef, token: Option<&str>) -> Result<()> {
        let mut state = self.state();
        let failed = |source| Error::ActionFailed {
            action: format!("delete {target}"),
            source,
        };
        if let Some(e) = state.fault("delete", &target.name) {
            return Err(failed(e));
        }
        let gc_lag = state.gc_lag;
        let Some(obj) = state.objects.get_mut(target) else {
            return Ok(());
        };
        if token.is_some_and(|t| obj["metadata"]["resourceVersion"].as_str() != Some(t)) {
            return Err(failed(api_error(409, "Conflict")));
        }
        if gc_lag {
            obj["metadata"]["deletionTimestamp"] = json!(Utc::now());
        } else {
            state.objects.remove(target);
        }
        state.mutations.push(format!("delete {target}"));
        Ok(())
    }

    async fn set_finalizers(&self, inst: &Valkey, finalizers: Vec<String>) -> Result<()> {
        let mut state = self.state();
        let version = state.next_version();
        let Some(current) = state.instance.as_mut() else {
            return Err(Error::KubeError(api_error(404, "NotFound")));
        };
        if current.resource_version() != inst.resource_version() {
            return Err(Error::KubeError(api_error(409, "Conflict")));
        }
        let gone = finalizers.is_empty() && current.is_deleting();
        current.metadata.finalizers = Some(finalizers);
        current.metadata.resource_version = Some(version);
        state.mutations.push("finalizers Valkey cache".to_string());
        if gone {
            state.instance = None;
        }
        Ok(())
    }

    async fn patch_status(&self, _inst: &Valkey, status: &ValkeyStatus) -> Result<()> {
        let mut state = self.state();
        let version = state.next_version();
        let Some(current) = state.instance.as_mut() else {
            return Err(Error::KubeError(api_error(404, "NotFound")));
        };
        current.status = Some(status.clone());
        current.metadata.resource_version = Some(version);
        state.mutations.push("status Valkey cache".to_string());
        Ok(())
    }

    async fn publish(&self, _inst: &Valkey, event: Event) -> Result<()> {
        let note = event.note.unwrap_or_default();
        self.state().events.push(format!("{}: {note}", event.reason));
        Ok(())
    }
}
