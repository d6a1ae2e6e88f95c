use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("K8s error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("{action} failed: {source}")]
    ActionFailed {
        action: String,
        #[source]
        source: kube::Error,
    },

    #[error("{0} vanished since it was observed")]
    Vanished(String),

    #[error("Invalid quantity {0:?}")]
    InvalidQuantity(String),

    #[error("Invalid spec: {0}")]
    InvalidSpec(String),

    #[error("Missing object key: {0}")]
    MissingObjectKey(&'static str),

    #[error("Error: {0}")]
    Other(String),
}

/// How an error is expected to resolve, which drives the retry decision
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The platform is unavailable or overloaded, retrying later may succeed
    Transient,
    /// A concurrency token was stale, the next pass must re-plan from fresh state
    Conflict,
    /// The declared spec cannot be realized until it is changed
    Validation,
    /// The target is already gone
    NotFound,
}

fn kube_error_kind(e: &kube::Error) -> ErrorKind {
    match e {
        kube::Error::Api(resp) => match resp.code {
            404 => ErrorKind::NotFound,
            // the name is held by an object we do not own, retrying cannot help
            409 if resp.reason == "AlreadyExists" => ErrorKind::Validation,
            409 => ErrorKind::Conflict,
            400 | 422 => ErrorKind::Validation,
            _ => ErrorKind::Transient,
        },
        _ => ErrorKind::Transient,
    }
}

impl Error {
    pub fn metric_label(&self) -> String {
        match self {
            Error::ActionFailed { source, .. } => format!("actionfailed_{}", kube_error_label(source)),
            Error::KubeError(e) => format!("kubeerror_{}", kube_error_label(e)),
            Error::SerializationError(_) => "serializationerror".to_string(),
            Error::Vanished(_) => "vanished".to_string(),
            Error::InvalidQuantity(_) => "invalidquantity".to_string(),
            Error::InvalidSpec(_) => "invalidspec".to_string(),
            Error::MissingObjectKey(_) => "missingobjectkey".to_string(),
            Error::Other(_) => "other".to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::KubeError(e) => kube_error_kind(e),
            Error::ActionFailed { source, .. } => match kube_error_kind(source) {
                // a patch target that disappeared means the plan was computed on stale state
                ErrorKind::NotFound => ErrorKind::Conflict,
                kind => kind,
            },
            Error::Vanished(_) => ErrorKind::Conflict,
            Error::InvalidQuantity(_) | Error::InvalidSpec(_) | Error::MissingObjectKey(_) => {
                ErrorKind::Validation
            }
            Error::SerializationError(_) | Error::Other(_) => ErrorKind::Transient,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::KubeError(e) if kube_error_kind(e) == ErrorKind::NotFound)
    }

    /// A creation refused because the name is already taken
    pub fn is_already_exists(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(resp)) | Error::ActionFailed {
                source: kube::Error::Api(resp),
                ..
            } => resp.code == 409 && resp.reason == "AlreadyExists",
            _ => false,
        }
    }
}

fn kube_error_label(e: &kube::Error) -> String {
    match e {
        kube::Error::Api(resp) => resp.code.to_string(),
        _ => "client".to_string(),
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub mod conditions;
pub mod context;
pub mod quantity;
pub mod valkey;

pub use conditions::{ApplicationCondition, ConditionsStatus, ConditionsType};
pub use context::{get_client_name, get_reporter};
pub use valkey::{StorageSpec, Valkey, ValkeySpec, ValkeyStatus};

/// API group of the Valkey custom resource
pub static GROUP: &str = "cache.valkey.io";
/// Finalizer guarding the teardown of the children of a Valkey
pub static FINALIZER: &str = "valkeys.cache.valkey.io";
