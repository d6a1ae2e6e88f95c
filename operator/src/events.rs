use crate::{Valkey, cluster::ChildRef, planner::ChildAction};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{
    ResourceExt,
    runtime::events::{Event, EventType},
};

fn child_reference(inst: &Valkey, child: &ChildRef) -> ObjectReference {
    let api_version = match child.kind {
        crate::cluster::ChildKind::Workload => "apps/v1",
        _ => "v1",
    };
    ObjectReference {
        api_version: Some(api_version.to_string()),
        kind: Some(child.kind.as_str().to_string()),
        name: Some(child.name.clone()),
        namespace: inst.namespace(),
        ..ObjectReference::default()
    }
}

#[must_use]
pub fn from_action(inst: &Valkey, action: &ChildAction) -> Event {
    let child = action.target();
    let (reason, doing) = match action {
        ChildAction::Create(_) => ("Created", "Creating"),
        ChildAction::Resize { .. } => ("Resized", "Resizing"),
        ChildAction::Scale { .. } => ("Scaled", "Scaling"),
        ChildAction::Adopt { .. } => ("Adopted", "Adopting"),
        ChildAction::Update { .. } => ("Updated", "Updating"),
        ChildAction::Delete { .. } => ("Deleted", "Deleting"),
    };
    Event {
        type_: EventType::Normal,
        reason: reason.to_string(),
        note: Some(format!("{action} for `{}` Valkey", inst.name_any())),
        action: format!("{doing} `{}` {}", child.name, child.kind.as_str()),
        secondary: Some(child_reference(inst, &child)),
    }
}

#[must_use]
pub fn from_delete(inst: &Valkey, child: &ChildRef) -> Event {
    Event {
        type_: EventType::Normal,
        reason: "Teardown".to_string(),
        note: Some(format!(
            "Deleting `{}` {} for `{}` Valkey",
            child.name,
            child.kind.as_str(),
            inst.name_any()
        )),
        action: format!("Deleting `{}` {}", child.name, child.kind.as_str()),
        secondary: Some(child_reference(inst, child)),
    }
}

#[must_use]
pub fn from_blocked(inst: &Valkey, message: &str) -> Event {
    Event {
        type_: EventType::Warning,
        reason: "Blocked".to_string(),
        note: Some(format!("`{}` Valkey: {message}", inst.name_any())),
        action: "Planning".to_string(),
        secondary: None,
    }
}
