pub mod alert_rule_group;
pub mod common;
pub mod conditions;
pub mod contact_point;
pub mod dashboard;
pub mod datasource;
pub mod event_recorder;
pub mod folder;
pub mod grafana;
pub mod instances;
pub mod library_panel;
pub mod mute_timing;
pub mod notification_policy;
pub mod notification_template;
pub mod secrets;
pub mod service_account;
pub mod sync;

/// Finalizer guarding the removal of objects from Grafana instances.
pub static FINALIZER: &str = "operator.grafana.com/finalizer";
