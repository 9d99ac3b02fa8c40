//! Helpers for the `status.conditions` list every custom resource carries.
//!
//! After each pass exactly one of the outcome conditions is present on a content resource:
//! `InvalidSpec`, `NoMatchingInstance`, or the kind's `<Kind>Synchronized` condition.

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

pub const INVALID_SPEC: &str = "InvalidSpec";
pub const NO_MATCHING_INSTANCE: &str = "NoMatchingInstance";
pub const GRAFANA_READY: &str = "GrafanaReady";

pub const REASON_APPLY_SUCCESSFUL: &str = "ApplySuccessful";
pub const REASON_APPLY_FAILED: &str = "ApplyFailed";
pub const REASON_INVALID: &str = "InvalidSpec";
pub const REASON_UID_CHANGED: &str = "UIDChanged";
pub const REASON_NO_INSTANCES: &str = "NoMatchingInstance";

/// The synchronization condition type of a kind, e.g. `DashboardSynchronized`.
pub fn synchronized(kind: &str) -> String {
    format!("{kind}Synchronized")
}

pub fn status_str(status: bool) -> &'static str {
    if status {
        "True"
    } else {
        "False"
    }
}

pub fn find<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn is_true(conditions: &[Condition], type_: &str) -> bool {
    find(conditions, type_).is_some_and(|c| c.status == "True")
}

/// Insert or replace the condition of `type_`.
///
/// `lastTransitionTime` only moves when the status flips.
pub fn set(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: bool,
    reason: &str,
    message: impl Into<String>,
    observed_generation: Option<i64>,
) {
    let status = status_str(status);
    let message = message.into();
    match conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(existing) => {
            if existing.status != status {
                existing.last_transition_time = Time(Utc::now());
            }
            existing.status = status.to_string();
            existing.reason = reason.to_string();
            existing.message = message;
            existing.observed_generation = observed_generation;
        }
        None => conditions.push(Condition {
            type_: type_.to_string(),
            status: status.to_string(),
            reason: reason.to_string(),
            message,
            observed_generation,
            last_transition_time: Time(Utc::now()),
        }),
    }
}

pub fn remove(conditions: &mut Vec<Condition>, type_: &str) {
    conditions.retain(|c| c.type_ != type_);
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn set_adds_then_replaces() {
        let mut conditions = vec![];
        set(&mut conditions, "DashboardSynchronized", false, REASON_APPLY_FAILED, "boom", Some(1));
        assert_eq!(conditions.len(), 1);
        set(&mut conditions, "DashboardSynchronized", true, REASON_APPLY_SUCCESSFUL, "ok", Some(2));
        assert_eq!(conditions.len(), 1);
        let c = &conditions[0];
        assert_eq!(c.status, "True");
        assert_eq!(c.reason, REASON_APPLY_SUCCESSFUL);
        assert_eq!(c.message, "ok");
        assert_eq!(c.observed_generation, Some(2));
    }

    #[test]
    fn transition_time_only_moves_on_flip() {
        let then = Time(Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap());
        let mut conditions = vec![Condition {
            type_: INVALID_SPEC.into(),
            status: "True".into(),
            reason: REASON_INVALID.into(),
            message: "old".into(),
            observed_generation: Some(1),
            last_transition_time: then.clone(),
        }];
        set(&mut conditions, INVALID_SPEC, true, REASON_INVALID, "new", Some(2));
        assert_eq!(conditions[0].last_transition_time, then);
        set(&mut conditions, INVALID_SPEC, false, REASON_INVALID, "fixed", Some(3));
        assert_ne!(conditions[0].last_transition_time, then);
    }

    #[test]
    fn remove_and_lookup() {
        let mut conditions = vec![];
        set(&mut conditions, NO_MATCHING_INSTANCE, true, REASON_NO_INSTANCES, "", None);
        set(&mut conditions, INVALID_SPEC, false, REASON_INVALID, "", None);
        assert!(is_true(&conditions, NO_MATCHING_INSTANCE));
        assert!(!is_true(&conditions, INVALID_SPEC));
        remove(&mut conditions, NO_MATCHING_INSTANCE);
        assert!(find(&conditions, NO_MATCHING_INSTANCE).is_none());
        assert_eq!(conditions.len(), 1);
    }

    #[test]
    fn synchronized_type_names() {
        assert_eq!(synchronized("Dashboard"), "DashboardSynchronized");
        assert_eq!(synchronized("ContactPoint"), "ContactPointSynchronized");
    }
}
