use crate::{
    ErrorKind, ValkeyStatus,
    cluster::ObservedChildren,
    executor::ApplyOutcome,
    planner::Plan,
    resources::Desired,
};
use chrono::{DateTime, Utc};
use common::{
    conditions::{ApplicationCondition, merge_condition},
    quantity::quantity_bytes,
};
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::ResourceExt;

/// Health of the children as observed at the start of a pass
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChildHealth {
    pub ready_replicas: i32,
    pub healthy: bool,
    /// What is still settling, one entry per child
    pub pending: Vec<String>,
}

impl ChildHealth {
    /// Health is unknown when the pass stopped before the children were compared
    pub fn unknown(prev: &ValkeyStatus) -> Self {
        Self {
            ready_replicas: prev.ready_replicas,
            healthy: false,
            pending: Vec::new(),
        }
    }
}

fn volume_pending(pvc: &PersistentVolumeClaim) -> Option<String> {
    let name = pvc.name_any();
    let Some(status) = pvc.status.as_ref() else {
        return Some(format!("PersistentVolumeClaim {name} has no status"));
    };
    if status.phase.as_deref() != Some("Bound") {
        return Some(format!(
            "PersistentVolumeClaim {name} is {}",
            status.phase.as_deref().unwrap_or("Pending")
        ));
    }
    let resizing = status.conditions.iter().flatten().any(|c| {
        (c.type_ == "Resizing" || c.type_ == "FileSystemResizePending") && c.status == "True"
    });
    let requested = pvc
        .spec
        .as_ref()
        .and_then(|s| s.resources.as_ref()?.requests.as_ref()?.get("storage"))
        .and_then(|q| quantity_bytes(q).ok());
    let capacity = status
        .capacity
        .as_ref()
        .and_then(|c| c.get("storage"))
        .and_then(|q| quantity_bytes(q).ok());
    match (requested, capacity) {
        (Some(r), Some(c)) if c >= r && !resizing => None,
        _ => Some(format!("PersistentVolumeClaim {name} is resizing")),
    }
}

/// Compare the observed children with what a converged instance looks like
pub fn child_health(desired: &Desired, observed: &ObservedChildren) -> ChildHealth {
    let mut pending = Vec::new();
    let replicas = desired.replicas();
    let mut ready_replicas = 0;

    match observed.workload.as_ref() {
        None => pending.push(format!("StatefulSet {} is missing", desired.workload_name())),
        Some(w) => {
            let status = w.status.clone().unwrap_or_default();
            ready_replicas = status.ready_replicas.unwrap_or_default();
            let updated = status.updated_replicas.unwrap_or_default();
            let observed_generation = status.observed_generation.unwrap_or_default();
            if observed_generation < w.metadata.generation.unwrap_or_default() {
                pending.push(format!("StatefulSet {} has not observed its last change", w.name_any()));
            } else if status.replicas != replicas || ready_replicas != replicas || updated != replicas {
                pending.push(format!(
                    "StatefulSet {}: {ready_replicas}/{replicas} ready, {updated} updated",
                    w.name_any()
                ));
            }
        }
    }

    for ordinal in 0..usize::try_from(replicas).unwrap_or_default() {
        let name = desired.volume_name(ordinal);
        match observed.volume(&name) {
            None => pending.push(format!("PersistentVolumeClaim {name} is missing")),
            Some(pvc) => pending.extend(volume_pending(pvc)),
        }
    }

    let mut services = vec![desired.headless_name(), desired.client_name()];
    if desired.spec.prometheus {
        services.push(desired.metrics_name());
    }
    for name in services {
        if observed.service(&name).is_none() {
            pending.push(format!("Service {name} is missing"));
        }
    }

    ChildHealth {
        ready_replicas,
        healthy: pending.is_empty(),
        pending,
    }
}

/// Fold the outcome of a pass into the previous status.
///
/// Conditions are merged by type so an unchanged status value keeps its
/// transition time. `observed_generation` only moves when no retryable error
/// interrupted the pass.
pub fn reduce(
    prev: &ValkeyStatus,
    plan: &Plan,
    outcome: &ApplyOutcome,
    health: &ChildHealth,
    generation: Option<i64>,
    now: DateTime<Utc>,
) -> ValkeyStatus {
    let kind = outcome.error.as_ref().map(crate::Error::kind);
    let retryable = matches!(kind, Some(ErrorKind::Transient | ErrorKind::Conflict));
    let invalid = kind == Some(ErrorKind::Validation);
    let error_message = outcome.error.as_ref().map(ToString::to_string).unwrap_or_default();

    let ready = plan.is_empty() && outcome.error.is_none() && health.healthy;
    let progressing = retryable
        || (!invalid && (!plan.actions.is_empty() || !plan.waiting.is_empty() || !health.healthy));
    let degraded = invalid || !plan.blockers.is_empty();

    let mut conditions = prev.conditions.clone();
    let ready_cond = if ready {
        ApplicationCondition::ready(
            true,
            "Converged",
            &format!("{} replicas ready", health.ready_replicas),
            now,
        )
    } else if degraded {
        ApplicationCondition::ready(false, "Degraded", "the requested state cannot be reached", now)
    } else {
        ApplicationCondition::ready(
            false,
            "Progressing",
            &format!("{} replicas ready", health.ready_replicas),
            now,
        )
    };
    merge_condition(&mut conditions, ready_cond);

    let progressing_cond = if retryable {
        ApplicationCondition::progressing(true, "Retrying", &error_message, now)
    } else if !progressing {
        let reason = if degraded { "Blocked" } else { "Converged" };
        ApplicationCondition::progressing(false, reason, "", now)
    } else if !plan.actions.is_empty() {
        ApplicationCondition::progressing(
            true,
            "Applying",
            &format!("applied {} of {} actions", outcome.applied, plan.actions.len()),
            now,
        )
    } else {
        let mut waiting: Vec<String> = plan
            .waiting
            .iter()
            .map(|c| format!("{c} is terminating"))
            .collect();
        waiting.extend(health.pending.iter().cloned());
        ApplicationCondition::progressing(true, "WaitingForChildren", &waiting.join("; "), now)
    };
    merge_condition(&mut conditions, progressing_cond);

    let name_taken = outcome.error.as_ref().is_some_and(crate::Error::is_already_exists);
    let degraded_cond = if invalid {
        let reason = if name_taken { "NameTaken" } else { "InvalidSpec" };
        ApplicationCondition::degraded(true, reason, &error_message, now)
    } else if !plan.blockers.is_empty() {
        let blockers: Vec<String> = plan.blockers.iter().map(ToString::to_string).collect();
        ApplicationCondition::degraded(true, "StorageShrinkRejected", &blockers.join("; "), now)
    } else {
        ApplicationCondition::degraded(false, "AsExpected", "", now)
    };
    merge_condition(&mut conditions, degraded_cond);

    ValkeyStatus {
        conditions,
        observed_generation: if retryable { prev.observed_generation } else { generation },
        ready_replicas: health.ready_replicas,
    }
}
