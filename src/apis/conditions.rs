use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A single entry in an entity's condition history.
///
/// Conditions are append-only per type: updating an existing type refreshes
/// the probe time, and the transition time moves only when the status flips.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[allow(non_snake_case)]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    /// "True", "False" or "Unknown"
    pub status: String,
    pub lastProbeTime: Option<DateTime<Utc>>,
    pub lastTransitionTime: Option<DateTime<Utc>>,
    pub reason: String,
    pub message: String,
}

pub const CONDITION_TRUE: &str = "True";
pub const CONDITION_FALSE: &str = "False";

/// Upsert a condition into the history.
///
/// Dedupe rule: one entry per condition type. A repeat observation with the
/// same status and reason only bumps `lastProbeTime`; a status flip also
/// bumps `lastTransitionTime`.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    condition_type: &str,
    status: &str,
    reason: &str,
    message: &str,
) {
    let now = Utc::now();
    if let Some(existing) = conditions
        .iter_mut()
        .find(|c| c.condition_type == condition_type)
    {
        if existing.status != status {
            existing.lastTransitionTime = Some(now);
        }
        existing.status = status.to_string();
        existing.reason = reason.to_string();
        existing.message = message.to_string();
        existing.lastProbeTime = Some(now);
        return;
    }
    conditions.push(Condition {
        condition_type: condition_type.to_string(),
        status: status.to_string(),
        lastProbeTime: Some(now),
        lastTransitionTime: Some(now),
        reason: reason.to_string(),
        message: message.to_string(),
    });
}

pub fn find_condition<'a>(
    conditions: &'a [Condition],
    condition_type: &str,
) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.condition_type == condition_type)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn set_condition_dedupes_by_type() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, "Ready", CONDITION_TRUE, "Done", "ready");
        set_condition(&mut conditions, "Ready", CONDITION_TRUE, "Done", "ready");
        assert_eq!(conditions.len(), 1);

        set_condition(&mut conditions, "Reuse", CONDITION_TRUE, "Scrubbed", "");
        assert_eq!(conditions.len(), 2);
    }

    #[test]
    fn transition_time_moves_only_on_status_flip() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, "Ready", CONDITION_FALSE, "Waiting", "");
        let first_transition = conditions[0].lastTransitionTime;

        set_condition(&mut conditions, "Ready", CONDITION_FALSE, "Waiting", "");
        assert_eq!(conditions[0].lastTransitionTime, first_transition);

        set_condition(&mut conditions, "Ready", CONDITION_TRUE, "Done", "");
        assert_ne!(conditions[0].lastTransitionTime, first_transition);
    }
}
