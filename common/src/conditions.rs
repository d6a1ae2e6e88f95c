use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Copy, Debug, JsonSchema, Default)]
pub enum ConditionsType {
    #[default]
    Ready,
    Progressing,
    Degraded,
}

#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Copy, Debug, JsonSchema, Default)]
pub enum ConditionsStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl From<bool> for ConditionsStatus {
    fn from(b: bool) -> Self {
        if b { ConditionsStatus::True } else { ConditionsStatus::False }
    }
}

/// ApplicationCondition contains details about one aspect of the instance health
#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationCondition {
    /// Type is the aspect this condition reports on
    #[serde(rename = "type")]
    pub condition_type: ConditionsType,
    /// Status ("True", "False" or "Unknown")
    pub status: ConditionsStatus,
    /// Machine readable reason of the last update
    pub reason: String,
    /// Human readable details
    pub message: String,
    /// Last time the status changed value
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl ApplicationCondition {
    #[must_use]
    pub fn new(
        condition_type: ConditionsType,
        status: ConditionsStatus,
        reason: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> ApplicationCondition {
        ApplicationCondition {
            condition_type,
            status,
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: Some(now),
        }
    }

    pub fn ready(ready: bool, reason: &str, message: &str, now: DateTime<Utc>) -> ApplicationCondition {
        ApplicationCondition::new(ConditionsType::Ready, ready.into(), reason, message, now)
    }

    pub fn progressing(
        progressing: bool,
        reason: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> ApplicationCondition {
        ApplicationCondition::new(ConditionsType::Progressing, progressing.into(), reason, message, now)
    }

    pub fn degraded(degraded: bool, reason: &str, message: &str, now: DateTime<Utc>) -> ApplicationCondition {
        ApplicationCondition::new(ConditionsType::Degraded, degraded.into(), reason, message, now)
    }
}

/// Replace the condition of the same type, or append it when missing.
///
/// The previous `last_transition_time` is carried over unless the status value changed.
pub fn merge_condition(conditions: &mut Vec<ApplicationCondition>, mut cond: ApplicationCondition) {
    match conditions
        .iter_mut()
        .find(|c| c.condition_type == cond.condition_type)
    {
        Some(current) => {
            if current.status == cond.status {
                cond.last_transition_time = current.last_transition_time;
            }
            *current = cond;
        }
        None => conditions.push(cond),
    }
}
