use crate::{
    Result,
    cluster::{Child, ChildKind, ChildRef, ObservedChildren},
    resources::{DIGEST_ANNOTATION, Desired},
};
use common::quantity::quantity_bytes;
use k8s_openapi::{
    api::core::v1::{PersistentVolumeClaim, Service},
    apimachinery::pkg::{
        api::resource::Quantity,
        apis::meta::v1::{ObjectMeta, OwnerReference},
    },
};
use kube::ResourceExt;
use serde_json::{Map, Value, json};
use std::{collections::BTreeMap, fmt};

/// One mutation of a child, with the token observed when it was planned
#[derive(Clone, Debug, PartialEq)]
pub enum ChildAction {
    Create(Child),
    Resize {
        volume: String,
        size: Quantity,
        token: String,
    },
    Scale {
        workload: String,
        replicas: i32,
        token: String,
    },
    /// Take control of a volume left without controller
    Adopt {
        volume: String,
        owners: Vec<OwnerReference>,
        token: String,
    },
    Update {
        target: ChildRef,
        patch: Value,
        token: String,
    },
    Delete {
        target: ChildRef,
        token: String,
    },
}

impl ChildAction {
    pub fn target(&self) -> ChildRef {
        match self {
            ChildAction::Create(child) => child.reference(),
            ChildAction::Resize { volume, .. } | ChildAction::Adopt { volume, .. } => {
                ChildRef::new(ChildKind::Volume, volume.as_str())
            }
            ChildAction::Scale { workload, .. } => ChildRef::new(ChildKind::Workload, workload.as_str()),
            ChildAction::Update { target, .. } | ChildAction::Delete { target, .. } => target.clone(),
        }
    }

    pub fn verb(&self) -> &'static str {
        match self {
            ChildAction::Create(_) => "create",
            ChildAction::Resize { .. } => "resize",
            ChildAction::Scale { .. } => "scale",
            ChildAction::Adopt { .. } => "adopt",
            ChildAction::Update { .. } => "update",
            ChildAction::Delete { .. } => "delete",
        }
    }

    /// Token of the planned write, creations have none
    pub fn token(&self) -> Option<&str> {
        match self {
            ChildAction::Create(_) => None,
            ChildAction::Resize { token, .. }
            | ChildAction::Scale { token, .. }
            | ChildAction::Adopt { token, .. }
            | ChildAction::Update { token, .. }
            | ChildAction::Delete { token, .. } => Some(token),
        }
    }
}

impl fmt::Display for ChildAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildAction::Resize { volume, size, .. } => write!(f, "resize PersistentVolumeClaim {volume} to {}", size.0),
            ChildAction::Scale { workload, replicas, .. } => {
                write!(f, "scale StatefulSet {workload} to {replicas}")
            }
            _ => write!(f, "{} {}", self.verb(), self.target()),
        }
    }
}

/// A transition the planner refuses to act on
#[derive(Clone, Debug, PartialEq)]
pub enum Blocker {
    StorageShrink {
        volume: String,
        requested: Quantity,
        provisioned: Quantity,
    },
}

impl fmt::Display for Blocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Blocker::StorageShrink {
                volume,
                requested,
                provisioned,
            } => write!(
                f,
                "{volume} cannot shrink from {} to {}",
                provisioned.0, requested.0
            ),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Plan {
    pub actions: Vec<ChildAction>,
    pub blockers: Vec<Blocker>,
    /// Children whose name is held by an object still terminating
    pub waiting: Vec<ChildRef>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.blockers.is_empty() && self.waiting.is_empty()
    }
}

fn terminating(meta: &ObjectMeta) -> bool {
    meta.deletion_timestamp.is_some()
}

fn requested_storage(pvc: &PersistentVolumeClaim) -> Option<&Quantity> {
    pvc.spec.as_ref()?.resources.as_ref()?.requests.as_ref()?.get("storage")
}

/// Whether every field set in `wanted` holds the same value in `live`.
///
/// Fields only present in `live` are platform defaults and do not count,
/// lists must have the same length.
fn covers(live: &Value, wanted: &Value) -> bool {
    match (live, wanted) {
        (_, Value::Null) => true,
        (Value::Object(live), Value::Object(wanted)) => wanted
            .iter()
            .all(|(k, v)| covers(live.get(k).unwrap_or(&Value::Null), v)),
        (Value::Array(live), Value::Array(wanted)) => {
            live.len() == wanted.len() && live.iter().zip(wanted).all(|(l, w)| covers(l, w))
        }
        _ => live == wanted,
    }
}

/// Merge patch turning the `current` map into `wanted`
fn map_patch(current: &BTreeMap<String, String>, wanted: &BTreeMap<String, String>) -> Value {
    let mut map = Map::new();
    for key in current.keys().filter(|k| !wanted.contains_key(*k)) {
        map.insert(key.clone(), Value::Null);
    }
    for (key, value) in wanted {
        map.insert(key.clone(), Value::String(value.clone()));
    }
    Value::Object(map)
}

/// Patch restoring the selector and ports of `live`, and its labels when `exact_labels`
fn service_drift(live: &Service, wanted: &Service, exact_labels: bool) -> Result<Option<Value>> {
    let mut patch = Map::new();
    if exact_labels && live.labels() != wanted.labels() {
        patch.insert(
            "metadata".to_string(),
            json!({"labels": map_patch(live.labels(), wanted.labels())}),
        );
    }
    let empty = BTreeMap::new();
    let live_spec = live.spec.as_ref();
    let wanted_spec = wanted.spec.as_ref();
    let live_selector = live_spec.and_then(|s| s.selector.as_ref()).unwrap_or(&empty);
    let wanted_selector = wanted_spec.and_then(|s| s.selector.as_ref()).unwrap_or(&empty);
    let live_ports = serde_json::to_value(live_spec.and_then(|s| s.ports.as_ref()))?;
    let wanted_ports = serde_json::to_value(wanted_spec.and_then(|s| s.ports.as_ref()))?;
    if live_selector != wanted_selector || !covers(&live_ports, &wanted_ports) {
        patch.insert(
            "spec".to_string(),
            json!({"selector": map_patch(live_selector, wanted_selector), "ports": wanted_ports}),
        );
    }
    Ok((!patch.is_empty()).then_some(Value::Object(patch)))
}

/// Compute the ordered actions driving `observed` toward `desired`.
///
/// Actions are emitted in this order:
/// 1. missing services, then drifted ones
/// 2. scale down, then removal of the volumes of the removed replicas
/// 3. volume growth, then adoption or creation of missing volumes
/// 4. workload creation or scale up, held while a volume is terminating
/// 5. pod template rollout, when the desired template or the live one changed
/// 6. metrics service removal
///
/// Objects being deleted are never acted on. A requested size below the
/// provisioned one yields a [`Blocker`] and freezes the storage dimension.
pub fn plan(desired: &Desired, observed: &ObservedChildren) -> Result<Plan> {
    let mut plan = Plan::default();
    let replicas = desired.replicas();
    let wanted = usize::try_from(replicas).unwrap_or_default();

    let mut services = vec![desired.headless_service()?, desired.client_service()?];
    if desired.spec.prometheus {
        services.push(desired.metrics_service()?);
    }
    for svc in services {
        let name = svc.name_any();
        match observed.service(&name) {
            None => plan.actions.push(ChildAction::Create(Child::Service(svc))),
            Some(live) if terminating(&live.metadata) => {
                plan.waiting.push(ChildRef::new(ChildKind::Service, name))
            }
            Some(live) => {
                let exact_labels = name == desired.metrics_name();
                if let Some(patch) = service_drift(live, &svc, exact_labels)? {
                    plan.actions.push(ChildAction::Update {
                        target: ChildRef::new(ChildKind::Service, name),
                        patch,
                        token: live.resource_version().unwrap_or_default(),
                    });
                }
            }
        }
    }

    let workload = observed.workload.as_ref();
    let live_workload = workload.filter(|w| !terminating(&w.metadata));
    // the platform defaults a missing replica count to one
    let current = live_workload
        .and_then(|w| w.spec.as_ref()?.replicas)
        .unwrap_or(1);
    if let Some(w) = live_workload {
        if current > replicas {
            plan.actions.push(ChildAction::Scale {
                workload: w.name_any(),
                replicas,
                token: w.resource_version().unwrap_or_default(),
            });
        }
    }
    for pvc in &observed.volumes {
        if terminating(&pvc.metadata) {
            continue;
        }
        if desired.volume_ordinal(&pvc.name_any()).is_some_and(|i| i >= wanted) {
            plan.actions.push(ChildAction::Delete {
                target: ChildRef::new(ChildKind::Volume, pvc.name_any()),
                token: pvc.resource_version().unwrap_or_default(),
            });
        }
    }

    let mut resizes = Vec::new();
    let mut largest: Option<(u128, Quantity)> = None;
    for ordinal in 0..wanted {
        let name = desired.volume_name(ordinal);
        let Some(pvc) = observed.volume(&name).filter(|v| !terminating(&v.metadata)) else {
            continue;
        };
        let Some(provisioned) = requested_storage(pvc) else {
            continue;
        };
        let bytes = quantity_bytes(provisioned)?;
        if largest.as_ref().is_none_or(|(b, _)| bytes > *b) {
            largest = Some((bytes, provisioned.clone()));
        }
        if desired.size_bytes > bytes {
            resizes.push(ChildAction::Resize {
                volume: name,
                size: desired.size.clone(),
                token: pvc.resource_version().unwrap_or_default(),
            });
        } else if desired.size_bytes < bytes {
            plan.blockers.push(Blocker::StorageShrink {
                volume: name,
                requested: desired.size.clone(),
                provisioned: provisioned.clone(),
            });
        }
    }
    let new_size = match (&largest, plan.blockers.is_empty()) {
        (Some((_, size)), false) => size.clone(),
        _ => desired.size.clone(),
    };
    if plan.blockers.is_empty() {
        plan.actions.append(&mut resizes);
    }
    for ordinal in 0..wanted {
        let name = desired.volume_name(ordinal);
        match (observed.volume(&name), observed.adoptable(&name)) {
            (Some(live), _) | (None, Some(live)) if terminating(&live.metadata) => {
                plan.waiting.push(ChildRef::new(ChildKind::Volume, name))
            }
            (Some(_), _) => {}
            (None, Some(orphan)) => {
                let mut owners = orphan.owner_references().to_vec();
                owners.push(desired.owner.clone());
                plan.actions.push(ChildAction::Adopt {
                    volume: name,
                    owners,
                    token: orphan.resource_version().unwrap_or_default(),
                });
            }
            (None, None) => plan
                .actions
                .push(ChildAction::Create(Child::Volume(desired.volume(ordinal, &new_size)?))),
        }
    }
    // a replica started now would get a claim recreated from the template, out of our control
    let volumes_waiting = plan.waiting.iter().any(|c| c.kind == ChildKind::Volume);

    match (workload, live_workload) {
        (None, _) if volumes_waiting => {}
        (None, _) => plan
            .actions
            .push(ChildAction::Create(Child::Workload(desired.workload(replicas)?))),
        (Some(w), None) => plan
            .waiting
            .push(ChildRef::new(ChildKind::Workload, w.name_any())),
        (Some(w), Some(_)) => {
            let token = w.resource_version().unwrap_or_default();
            if current < replicas && !volumes_waiting {
                plan.actions.push(ChildAction::Scale {
                    workload: w.name_any(),
                    replicas,
                    token: token.clone(),
                });
            }
            let live_template = serde_json::to_value(w.spec.as_ref().map(|s| &s.template))?;
            let rolled_out = w.annotations().get(DIGEST_ANNOTATION) == Some(&desired.template_digest());
            if !rolled_out || !covers(&live_template, &desired.pod_template()) {
                plan.actions.push(ChildAction::Update {
                    target: ChildRef::new(ChildKind::Workload, w.name_any()),
                    patch: desired.rollout_patch(),
                    token,
                });
            }
        }
    }

    if !desired.spec.prometheus {
        if let Some(live) = observed
            .service(&desired.metrics_name())
            .filter(|s| !terminating(&s.metadata))
        {
            plan.actions.push(ChildAction::Delete {
                target: ChildRef::new(ChildKind::Service, live.name_any()),
                token: live.resource_version().unwrap_or_default(),
            });
        }
    }

    Ok(plan)
}
