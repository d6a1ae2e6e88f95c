use crate::{
    Error, Metrics, Result, Valkey,
    cluster::{ChildRef, ClusterApi},
    events,
    planner::ChildAction,
};
use kube::ResourceExt;
use serde_json::json;
use std::collections::HashMap;

/// What a plan execution achieved
#[derive(Debug, Default)]
pub struct ApplyOutcome {
    /// Number of actions applied, in plan order
    pub applied: usize,
    /// The error which stopped the plan
    pub error: Option<Error>,
}

impl ApplyOutcome {
    pub fn failed(error: Error) -> Self {
        Self {
            applied: 0,
            error: Some(error),
        }
    }

    /// Number of applied actions, or the error which stopped the plan
    pub fn into_result(self) -> Result<usize> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.applied),
        }
    }
}

async fn apply_one(
    api: &dyn ClusterApi,
    ns: &str,
    action: &ChildAction,
    token: Option<&str>,
) -> Result<Option<String>> {
    let token = token.unwrap_or_default();
    match action {
        ChildAction::Create(child) => api.create(ns, child).await.map(Some),
        ChildAction::Resize { size, .. } => {
            let patch = json!({"spec": {"resources": {"requests": {"storage": size}}}});
            api.patch(ns, &action.target(), token, &patch).await.map(Some)
        }
        ChildAction::Scale { replicas, .. } => {
            let patch = json!({"spec": {"replicas": replicas}});
            api.patch(ns, &action.target(), token, &patch).await.map(Some)
        }
        ChildAction::Adopt { owners, .. } => {
            let patch = json!({"metadata": {"ownerReferences": owners}});
            api.patch(ns, &action.target(), token, &patch).await.map(Some)
        }
        ChildAction::Update { target, patch, .. } => api.patch(ns, target, token, patch).await.map(Some),
        ChildAction::Delete { target, .. } => api.delete(ns, target, Some(token)).await.map(|()| None),
    }
}

/// Apply `actions` in order, stopping at the first failure.
///
/// Nothing applied is rolled back. When an action wrote a child, the following
/// actions on the same child use the resourceVersion returned by that write
/// instead of the one observed at planning time.
pub async fn apply(api: &dyn ClusterApi, metrics: &Metrics, inst: &Valkey, actions: &[ChildAction]) -> ApplyOutcome {
    let mut outcome = ApplyOutcome::default();
    let Some(ns) = inst.namespace() else {
        outcome.error = Some(Error::MissingObjectKey("metadata.namespace"));
        return outcome;
    };
    let mut tokens: HashMap<ChildRef, String> = HashMap::new();
    for action in actions {
        let target = action.target();
        let token = tokens.get(&target).map(String::as_str).or(action.token());
        match apply_one(api, &ns, action, token).await {
            Ok(rv) => {
                tracing::info!("{action} for {}/{}", ns, inst.name_any());
                match rv {
                    Some(rv) => tokens.insert(target, rv),
                    None => tokens.remove(&target),
                };
                outcome.applied += 1;
                metrics.reconcile.action_applied(action);
                if let Err(e) = api.publish(inst, events::from_action(inst, action)).await {
                    tracing::warn!("Failed to publish event for {action}: {e}");
                }
            }
            Err(e) => {
                tracing::warn!(
                    "{action} failed for {}/{}, skipping {} remaining actions: {e}",
                    ns,
                    inst.name_any(),
                    actions.len() - outcome.applied - 1
                );
                outcome.error = Some(e);
                break;
            }
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ErrorKind,
        cluster::ChildKind,
        k8smock::{MockCluster, instance},
        planner::plan,
        resources::Desired,
    };
    use k8s_openapi::api::apps::v1::StatefulSet;
    use serde_json::json;

    async fn converge(mock: &MockCluster) -> Valkey {
        let inst = mock.instance().unwrap();
        let d = Desired::from_instance(&inst).unwrap();
        let observed = mock.list_children(&inst).await.unwrap();
        let p = plan(&d, &observed).unwrap();
        let out = apply(mock, &Metrics::default(), &inst, &p.actions).await;
        assert!(out.error.is_none());
        inst
    }

    #[tokio::test]
    async fn test_applies_whole_plan_and_publishes_events() {
        let mock = MockCluster::new(instance(json!({"replicas": 2})));
        let inst = mock.instance().unwrap();
        let d = Desired::from_instance(&inst).unwrap();
        let p = plan(&d, &mock.list_children(&inst).await.unwrap()).unwrap();
        let metrics = Metrics::default();
        let out = apply(&mock, &metrics, &inst, &p.actions).await;
        assert!(out.error.is_none());
        assert_eq!(out.applied, p.actions.len());
        assert_eq!(mock.events().len(), p.actions.len());
        assert!(mock.object::<StatefulSet>(ChildKind::Workload, "cache").is_some());
    }

    #[tokio::test]
    async fn test_conflict_stops_the_plan() {
        let mock = MockCluster::new(instance(json!({"replicas": 3})));
        let inst = mock.instance().unwrap();
        let d = Desired::from_instance(&inst).unwrap();
        let p = plan(&d, &mock.list_children(&inst).await.unwrap()).unwrap();
        // third action is the first volume
        mock.fail_next("create", "data-cache-0", 409);
        let out = apply(&mock, &Metrics::default(), &inst, &p.actions).await;
        assert_eq!(out.applied, 2);
        assert_eq!(out.error.unwrap().kind(), ErrorKind::Conflict);
        assert!(mock.object::<StatefulSet>(ChildKind::Workload, "cache").is_none());
        assert_eq!(mock.mutations().len(), 2);
    }

    #[tokio::test]
    async fn test_stale_token_is_a_conflict() {
        let mock = MockCluster::new(instance(json!({"replicas": 1})));
        let inst = converge(&mock).await;
        mock.set_spec(|s| s.replicas = 2);
        let d = Desired::from_instance(&mock.instance().unwrap()).unwrap();
        let p = plan(&d, &mock.list_children(&inst).await.unwrap()).unwrap();
        // a concurrent writer touches the workload after planning
        mock.touch(ChildKind::Workload, "cache");
        let out = apply(&mock, &Metrics::default(), &inst, &p.actions).await;
        assert_eq!(out.applied, 1, "the volume is created, the scale is refused");
        assert_eq!(out.error.unwrap().kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_tokens_chain_across_own_writes() {
        let mock = MockCluster::new(instance(json!({"replicas": 1})));
        let inst = converge(&mock).await;
        mock.set_spec(|s| {
            s.replicas = 2;
            s.image = "valkey/valkey:8.1.0".to_string();
        });
        let d = Desired::from_instance(&mock.instance().unwrap()).unwrap();
        let p = plan(&d, &mock.list_children(&inst).await.unwrap()).unwrap();
        let scale = p.actions.iter().position(|a| matches!(a, ChildAction::Scale { .. }));
        let rollout = p.actions.iter().position(|a| matches!(a, ChildAction::Update { .. }));
        assert!(scale < rollout);
        assert_eq!(p.actions[scale.unwrap()].token(), p.actions[rollout.unwrap()].token());
        let out = apply(&mock, &Metrics::default(), &inst, &p.actions).await;
        assert!(out.error.is_none(), "{:?}", out.error);
        let sts = mock.object::<StatefulSet>(ChildKind::Workload, "cache").unwrap();
        assert_eq!(sts.spec.unwrap().replicas, Some(2));
    }

    #[tokio::test]
    async fn test_vanished_patch_target_is_a_conflict() {
        let mock = MockCluster::new(instance(json!({"replicas": 1})));
        let inst = converge(&mock).await;
        let action = ChildAction::Scale {
            workload: "missing".to_string(),
            replicas: 3,
            token: "1".to_string(),
        };
        let out = apply(&mock, &Metrics::default(), &inst, &[action]).await;
        assert_eq!(out.error.unwrap().kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_delete_of_missing_child_succeeds() {
        let mock = MockCluster::new(instance(json!({"replicas": 1})));
        let inst = converge(&mock).await;
        let action = ChildAction::Delete {
            target: ChildRef::new(ChildKind::Volume, "data-cache-9"),
            token: "1".to_string(),
        };
        let out = apply(&mock, &Metrics::default(), &inst, &[action]).await;
        assert!(out.error.is_none());
        assert_eq!(out.applied, 1);
    }

    #[tokio::test]
    async fn test_transient_failure_keeps_applied_actions() {
        let mock = MockCluster::new(instance(json!({"replicas": 2})));
        let inst = mock.instance().unwrap();
        let d = Desired::from_instance(&inst).unwrap();
        let p = plan(&d, &mock.list_children(&inst).await.unwrap()).unwrap();
        mock.fail_next("create", "cache", 503);
        let out = apply(&mock, &Metrics::default(), &inst, &p.actions).await;
        let err = out.error.unwrap();
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(err.to_string().starts_with("create Service cache failed"));
        assert_eq!(out.applied, 1);
        assert_eq!(mock.mutations(), vec!["create Service cache-headless".to_string()]);
    }
}
