pub use common::{
    Error, ErrorKind, FINALIZER, Result, Valkey, ValkeySpec, ValkeyStatus, get_client_name,
};
use kube::ResourceExt;
use std::fmt;

/// Identify one Valkey for work deduplication and retry bookkeeping
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ReconcileKey {
    pub namespace: String,
    pub name: String,
}

impl ReconcileKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_instance(inst: &Valkey) -> Result<Self> {
        let namespace = inst.namespace().ok_or(Error::MissingObjectKey("metadata.namespace"))?;
        Ok(Self::new(namespace, inst.name_any()))
    }
}

impl fmt::Display for ReconcileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Platform calls, behind a trait
pub mod cluster;
pub mod config;
pub mod events;
pub mod executor;
pub mod planner;
pub mod resources;
pub mod scheduler;
pub mod status;
pub mod valkey;

/// State machinery for kube, as exposeable to actix
pub mod manager;
pub use manager::Manager;

/// Metrics
mod metrics;
pub use metrics::Metrics;

#[cfg(test)] pub mod k8smock;
