use crate::{
    Error, ErrorKind, FINALIZER, Metrics, ReconcileKey, Result, Valkey, ValkeyStatus,
    cluster::ClusterApi,
    events, executor,
    manager::Context,
    planner,
    resources::Desired,
    scheduler::{Requeue, Scheduler},
    status::{self, ChildHealth},
};
use chrono::Utc;
use common::ConditionsType;
use kube::{ResourceExt, runtime::controller::Action};
use std::sync::Arc;
use tracing::{Span, field, instrument};

/// Whether `error` says the instance itself is gone
fn vanished(error: &Error) -> bool {
    error.kind() == ErrorKind::NotFound
}

/// Delete every child, then release the instance once none is left
async fn teardown(
    api: &dyn ClusterApi,
    metrics: &Metrics,
    inst: &Valkey,
    scheduler: &Scheduler,
) -> Result<Requeue> {
    let ns = inst.namespace().ok_or(Error::MissingObjectKey("metadata.namespace"))?;
    let children = api.list_children(inst).await?.references();
    if !children.is_empty() {
        for (child, token, terminating) in &children {
            if *terminating {
                continue;
            }
            api.delete(&ns, child, token.as_deref()).await?;
            tracing::info!("Deleted {child} of {}/{}", ns, inst.name_any());
            metrics.reconcile.action_applied(&planner::ChildAction::Delete {
                target: child.clone(),
                token: token.clone().unwrap_or_default(),
            });
            if let Err(e) = api.publish(inst, events::from_delete(inst, child)).await {
                tracing::warn!("Failed to publish event for {child}: {e}");
            }
        }
        // wait for the removal before releasing the instance
        return Ok(Requeue::After(scheduler.requeue));
    }
    let finalizers: Vec<String> = inst
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != FINALIZER)
        .cloned()
        .collect();
    match api.set_finalizers(inst, finalizers).await {
        Err(e) if !vanished(&e) => return Err(e),
        _ => tracing::info!("Released {}/{}", ns, inst.name_any()),
    }
    Ok(Requeue::OnChange)
}

/// Write `status` when it changed, `false` when the instance is gone
async fn write_status(
    api: &dyn ClusterApi,
    inst: &Valkey,
    prev: &ValkeyStatus,
    status: &ValkeyStatus,
) -> Result<bool> {
    if status == prev {
        return Ok(true);
    }
    match api.patch_status(inst, status).await {
        Ok(()) => Ok(true),
        Err(e) if vanished(&e) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Report an error which stopped the pass before any action was applied
async fn report_failure(
    api: &dyn ClusterApi,
    inst: &Valkey,
    prev: &ValkeyStatus,
    error: Error,
) -> Result<Requeue> {
    let outcome = executor::ApplyOutcome::failed(error);
    let status = status::reduce(
        prev,
        &planner::Plan::default(),
        &outcome,
        &ChildHealth::unknown(prev),
        inst.metadata.generation,
        Utc::now(),
    );
    match write_status(api, inst, prev, &status).await {
        Ok(true) => {}
        Ok(false) => return Ok(Requeue::OnChange),
        Err(e) => tracing::warn!("Failed to report the status of {}: {e}", inst.name_any()),
    }
    outcome.into_result().map(|_| Requeue::OnChange)
}

/// One reconcile pass: fetch, plan, apply, report, schedule.
///
/// An instance deleted while the pass runs ends it as a no-op.
pub async fn reconcile_pass(
    api: &dyn ClusterApi,
    metrics: &Metrics,
    key: &ReconcileKey,
    scheduler: &Scheduler,
) -> Result<Requeue> {
    let Some(inst) = api.get_instance(&key.namespace, &key.name).await? else {
        tracing::debug!("{key} is gone");
        return Ok(Requeue::OnChange);
    };
    if inst.is_deleting() {
        if !inst.have_finalizer() {
            return Ok(Requeue::OnChange);
        }
        return teardown(api, metrics, &inst, scheduler).await;
    }

    let prev = inst.status_or_default();
    if !inst.have_finalizer() {
        let mut finalizers = inst.finalizers().to_vec();
        finalizers.push(FINALIZER.to_string());
        match api.set_finalizers(&inst, finalizers).await {
            Ok(()) => {}
            Err(e) if vanished(&e) => return Ok(Requeue::OnChange),
            Err(e) => return report_failure(api, &inst, &prev, e).await,
        }
    }

    let desired = match Desired::from_instance(&inst) {
        Ok(d) => d,
        Err(e) => return report_failure(api, &inst, &prev, e).await,
    };
    let observed = match api.list_children(&inst).await {
        Ok(o) => o,
        Err(e) => return report_failure(api, &inst, &prev, e).await,
    };
    let plan = match planner::plan(&desired, &observed) {
        Ok(p) => p,
        Err(e) => return report_failure(api, &inst, &prev, e).await,
    };

    let outcome = executor::apply(api, metrics, &inst, &plan.actions).await;
    let health = status::child_health(&desired, &observed);
    let status = status::reduce(&prev, &plan, &outcome, &health, inst.metadata.generation, Utc::now());
    if status.is(ConditionsType::Degraded) && !prev.is(ConditionsType::Degraded) {
        let message = status
            .condition(ConditionsType::Degraded)
            .map(|c| c.message.clone())
            .unwrap_or_default();
        if let Err(e) = api.publish(&inst, events::from_blocked(&inst, &message)).await {
            tracing::warn!("Failed to publish event for {key}: {e}");
        }
    }
    if !write_status(api, &inst, &prev, &status).await? {
        tracing::debug!("{key} was deleted during the pass");
        return Ok(Requeue::OnChange);
    }
    outcome.into_result()?;
    Ok(scheduler.after_pass(&plan, &health))
}

#[instrument(skip(ctx, inst), fields(namespace, name))]
pub async fn reconcile(inst: Arc<Valkey>, ctx: Arc<Context>) -> Result<Action> {
    let key = ReconcileKey::from_instance(&inst)?;
    Span::current().record("namespace", field::display(&key.namespace));
    Span::current().record("name", field::display(&key.name));
    let _mes = ctx.metrics.reconcile.count_and_measure();
    ctx.diagnostics.write().await.last_event = Utc::now();

    let requeue = reconcile_pass(ctx.cluster.as_ref(), &ctx.metrics, &key, &ctx.scheduler).await?;
    ctx.backoffs.reset(&key);
    Ok(requeue.into())
}

#[must_use]
pub fn error_policy(inst: Arc<Valkey>, error: &Error, ctx: Arc<Context>) -> Action {
    ctx.metrics.reconcile.reconcile_failure(&inst, error);
    let Ok(key) = ReconcileKey::from_instance(&inst) else {
        return Action::await_change();
    };
    let attempt = match error.kind() {
        ErrorKind::Transient => ctx.backoffs.next(&key),
        ErrorKind::NotFound => {
            ctx.backoffs.reset(&key);
            0
        }
        _ => 0,
    };
    let requeue = ctx.scheduler.on_error(error, attempt);
    tracing::warn!("reconcile failed for Valkey {key} ({:?}), next pass {requeue:?}: {error}", error.kind());
    requeue.into()
}
