use crate::{Error, ErrorKind, ReconcileKey, planner::Plan, status::ChildHealth};
use kube::runtime::controller::Action;
use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

/// When the next pass of a key should run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Requeue {
    After(Duration),
    /// Only a change of the instance or of a child triggers a pass
    OnChange,
}

impl From<Requeue> for Action {
    fn from(r: Requeue) -> Action {
        match r {
            Requeue::After(d) => Action::requeue(d),
            Requeue::OnChange => Action::await_change(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Scheduler {
    /// Drift check of a converged instance
    pub resync: Duration,
    /// Follow-up of a pass which left work behind
    pub requeue: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self {
            resync: Duration::from_secs(15 * 60),
            requeue: Duration::from_secs(10),
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(5 * 60),
        }
    }
}

impl Scheduler {
    /// Decision after a pass which ended without error
    pub fn after_pass(&self, plan: &Plan, health: &ChildHealth) -> Requeue {
        if !plan.actions.is_empty() || !plan.waiting.is_empty() || !health.healthy {
            Requeue::After(self.requeue)
        } else if !plan.blockers.is_empty() {
            Requeue::OnChange
        } else {
            Requeue::After(self.resync)
        }
    }

    /// Decision after a failed pass, `attempt` counts the previous transient failures of the key
    pub fn on_error(&self, error: &Error, attempt: u32) -> Requeue {
        // the next listing adopts the holder of the name or reports it again
        if error.is_already_exists() {
            return Requeue::After(self.requeue);
        }
        match error.kind() {
            ErrorKind::Transient => Requeue::After(self.backoff(attempt, rand::random::<f64>())),
            ErrorKind::Conflict => Requeue::After(Duration::ZERO),
            ErrorKind::Validation | ErrorKind::NotFound => Requeue::OnChange,
        }
    }

    /// Capped exponential delay with equal jitter: half fixed, half scaled by `jitter` in `[0, 1]`
    pub fn backoff(&self, attempt: u32, jitter: f64) -> Duration {
        let exp = self
            .backoff_base
            .saturating_mul(2u32.saturating_pow(attempt.min(31)))
            .min(self.backoff_max);
        let half = exp / 2;
        half + half.mul_f64(jitter.clamp(0.0, 1.0))
    }
}

/// Consecutive transient failures, per key.
///
/// A key whose instance disappears is never reconciled again, so entries
/// older than `expiry` are dropped whenever a failure is counted.
#[derive(Debug)]
pub struct Backoffs {
    attempts: Mutex<HashMap<ReconcileKey, (u32, Instant)>>,
    expiry: Duration,
}

impl Default for Backoffs {
    fn default() -> Self {
        Self::new(Scheduler::default().backoff_max * 2)
    }
}

impl Backoffs {
    pub fn new(expiry: Duration) -> Self {
        Self {
            attempts: Mutex::default(),
            expiry,
        }
    }

    /// Returns the attempt number to back off for, and count one more failure
    pub fn next(&self, key: &ReconcileKey) -> u32 {
        let mut attempts = self.attempts.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        attempts.retain(|_, (_, last)| last.elapsed() <= self.expiry);
        let (attempt, last) = attempts.entry(key.clone()).or_insert((0, Instant::now()));
        let current = *attempt;
        *attempt = attempt.saturating_add(1);
        *last = Instant::now();
        current
    }

    pub fn len(&self) -> usize {
        self.attempts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn reset(&self, key: &ReconcileKey) {
        self.attempts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cluster::{ChildKind, ChildRef},
        planner::{Blocker, ChildAction},
    };
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use kube::core::ErrorResponse;

    fn healthy() -> ChildHealth {
        ChildHealth {
            ready_replicas: 1,
            healthy: true,
            pending: vec![],
        }
    }

    fn api_error(code: u16) -> Error {
        Error::KubeError(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: String::new(),
            reason: String::new(),
            code,
        }))
    }

    #[test]
    fn test_pass_decisions() {
        let s = Scheduler::default();
        assert_eq!(s.after_pass(&Plan::default(), &healthy()), Requeue::After(s.resync));

        let unhealthy = ChildHealth {
            healthy: false,
            ..healthy()
        };
        assert_eq!(s.after_pass(&Plan::default(), &unhealthy), Requeue::After(s.requeue));

        let pending = Plan {
            actions: vec![ChildAction::Delete {
                target: ChildRef::new(ChildKind::Service, "cache-metrics"),
                token: "1".to_string(),
            }],
            ..Plan::default()
        };
        assert_eq!(s.after_pass(&pending, &healthy()), Requeue::After(s.requeue));

        let blocked = Plan {
            blockers: vec![Blocker::StorageShrink {
                volume: "data-cache-0".to_string(),
                requested: Quantity("1Gi".to_string()),
                provisioned: Quantity("2Gi".to_string()),
            }],
            ..Plan::default()
        };
        assert_eq!(s.after_pass(&blocked, &healthy()), Requeue::OnChange);
    }

    #[test]
    fn test_error_decisions() {
        let s = Scheduler::default();
        assert_eq!(s.on_error(&api_error(409), 3), Requeue::After(Duration::ZERO));
        assert_eq!(s.on_error(&api_error(422), 0), Requeue::OnChange);
        assert_eq!(s.on_error(&api_error(404), 0), Requeue::OnChange);
        match s.on_error(&api_error(503), 2) {
            Requeue::After(d) => assert!(d >= Duration::from_secs(1) && d <= Duration::from_secs(2)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_backoff_grows_and_is_capped() {
        let s = Scheduler::default();
        assert_eq!(s.backoff(0, 0.0), Duration::from_millis(250));
        assert_eq!(s.backoff(0, 1.0), Duration::from_millis(500));
        assert_eq!(s.backoff(3, 1.0), Duration::from_secs(4));
        assert!(s.backoff(4, 0.5) > s.backoff(3, 0.5));
        assert_eq!(s.backoff(30, 1.0), s.backoff_max);
        assert_eq!(s.backoff(u32::MAX, 0.0), s.backoff_max / 2);
    }

    #[test]
    fn test_attempts_are_per_key_and_reset() {
        let b = Backoffs::default();
        let a = ReconcileKey::new("db", "a");
        let other = ReconcileKey::new("db", "b");
        assert_eq!(b.next(&a), 0);
        assert_eq!(b.next(&a), 1);
        assert_eq!(b.next(&other), 0);
        b.reset(&a);
        assert_eq!(b.next(&a), 0);
        assert_eq!(b.next(&other), 1);
    }

    #[test]
    fn test_attempts_of_vanished_keys_expire() {
        let b = Backoffs::new(Duration::from_millis(1));
        let gone = ReconcileKey::new("db", "gone");
        assert_eq!(b.next(&gone), 0);
        assert_eq!(b.len(), 1);
        std::thread::sleep(Duration::from_millis(5));
        // counting a failure of another key drops the stale entry
        assert_eq!(b.next(&ReconcileKey::new("db", "other")), 0);
        assert_eq!(b.len(), 1);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(b.next(&gone), 0);
    }

    #[test]
    fn test_taken_name_is_rechecked_soon() {
        let s = Scheduler::default();
        let err = Error::ActionFailed {
            action: "create PersistentVolumeClaim data-cache-1".to_string(),
            source: kube::Error::Api(ErrorResponse {
                status: "Failure".to_string(),
                message: String::new(),
                reason: "AlreadyExists".to_string(),
                code: 409,
            }),
        };
        assert_eq!(s.on_error(&err, 0), Requeue::After(s.requeue));
    }

    #[test]
    fn test_requeue_converts_to_action() {
        assert_eq!(Action::from(Requeue::OnChange), Action::await_change());
        assert_eq!(
            Action::from(Requeue::After(Duration::from_secs(10))),
            Action::requeue(Duration::from_secs(10))
        );
    }
}
