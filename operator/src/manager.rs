use crate::{
    Error, Metrics, Result, Valkey,
    cluster::{ClusterApi, KubeCluster},
    config::Config,
    resources::MANAGED_BY,
    scheduler::{Backoffs, Scheduler},
    valkey,
};
use chrono::{DateTime, Utc};
use futures::{FutureExt, StreamExt, future::BoxFuture};
use k8s_openapi::api::{
    apps::v1::StatefulSet,
    core::v1::{PersistentVolumeClaim, Service},
};
use kube::{
    api::{Api, ListParams},
    client::Client,
    runtime::{
        controller::{self, Controller},
        events::Reporter,
        watcher,
    },
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;

// Context for our reconciler
#[derive(Clone)]
pub struct Context {
    /// Platform calls of the reconciler
    pub cluster: Arc<dyn ClusterApi>,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
    pub scheduler: Scheduler,
    /// Retry bookkeeping of transient failures
    pub backoffs: Arc<Backoffs>,
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}
impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: common::get_reporter(),
        }
    }
}

/// Data owned by the Manager
#[derive(Clone, Default)]
pub struct Manager {
    /// Diagnostics populated by the reconciler
    diagnostics: Arc<RwLock<Diagnostics>>,
    metrics: Metrics,
}

fn api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Manager that owns a Controller for Valkey
impl Manager {
    /// Lifecycle initialization interface for app
    ///
    /// This returns a `Manager` that drives a `Controller` + a future to be awaited
    /// It is up to `main` to wait for the controller stream.
    pub async fn new(config: &Config) -> Result<(Self, BoxFuture<'static, ()>)> {
        let client = Client::try_default().await.map_err(Error::KubeError)?;
        let manager = Manager::default();
        let scheduler = config.scheduler();
        let context = Arc::new(Context {
            cluster: Arc::new(KubeCluster::new(client.clone())),
            metrics: manager.metrics.clone(),
            diagnostics: manager.diagnostics.clone(),
            backoffs: Arc::new(Backoffs::new(scheduler.backoff_max * 2)),
            scheduler,
        });

        let ns = config.namespace.as_deref();
        let insts: Api<Valkey> = api(&client, ns);
        // Ensure CRD is installed before loop-watching
        if let Err(e) = insts.list(&ListParams::default().limit(1)).await {
            tracing::error!("is the crd installed? please run: cargo run --bin crdgen | kubectl apply -f -");
            return Err(Error::KubeError(e));
        }

        let owned = watcher::Config::default().labels(&format!("app.kubernetes.io/managed-by={MANAGED_BY}"));
        // All good. Start controller and return its future.
        let controller = Controller::new(insts, watcher::Config::default().any_semantic())
            .owns(api::<StatefulSet>(&client, ns), owned.clone())
            .owns(api::<PersistentVolumeClaim>(&client, ns), owned.clone())
            .owns(api::<Service>(&client, ns), owned)
            .with_config(controller::Config::default().concurrency(config.workers))
            .shutdown_on_signal()
            .run(valkey::reconcile, valkey::error_policy, context)
            .for_each(|res| async move {
                match res {
                    Ok((obj, action)) => tracing::debug!("reconciled {obj}, next {action:?}"),
                    Err(e) => tracing::debug!("reconcile stream error: {e}"),
                }
            })
            .boxed();

        Ok((manager, controller))
    }

    /// Metrics getter
    pub fn metrics(&self) -> String {
        let mut buffer = String::new();
        if let Err(e) = prometheus_client::encoding::text::encode(&mut buffer, &self.metrics.registry) {
            tracing::warn!("Failed to encode metrics: {e}");
        }
        buffer
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }
}
