use crate::client::{GrafanaClient, GrafanaError};
use crate::controllers::common::{preserve_unknown_array, preserve_unknown_fields, GrafanaCommonSpec, GrafanaCommonStatus};
use crate::controllers::folder::resolve_folder;
use crate::controllers::grafana::Grafana;
use crate::controllers::sync::{Desired, GrafanaContent};
use crate::duration::{format_duration, parse_duration};
use crate::{Context, Error, Result};
use async_trait::async_trait;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use tracing::*;

/// A group of alert rules evaluated together, synchronized into the selected instances.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "GrafanaAlertRuleGroup",
    group = "grafana.integreatly.org",
    version = "v1beta1",
    singular = "grafanaalertrulegroup",
    plural = "grafanaalertrulegroups",
    namespaced
)]
#[kube(status = "GrafanaCommonStatus")]
#[serde(rename_all = "camelCase")]
pub struct GrafanaAlertRuleGroupSpec {
    #[serde(flatten)]
    pub common: GrafanaCommonSpec,
    /// Group name, defaults to the resource name.
    pub name: Option<String>,
    #[serde(rename = "folderUID")]
    pub folder_uid: Option<String>,
    pub folder_ref: Option<String>,
    /// Evaluation interval, e.g. `1m`.
    pub interval: String,
    pub rules: Vec<AlertRule>,
    /// Whether the rules may be edited in the Grafana UI. Defaults to true.
    pub editable: Option<bool>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AlertRule {
    pub uid: String,
    pub title: String,
    /// RefId of the query or expression that decides the alert state.
    pub condition: String,
    #[schemars(schema_with = "preserve_unknown_array")]
    pub data: Vec<Value>,
    pub no_data_state: Option<String>,
    pub exec_err_state: Option<String>,
    /// Pending period, e.g. `5m`.
    #[serde(rename = "for")]
    pub for_: Option<String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub is_paused: Option<bool>,
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub notification_settings: Option<Value>,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuleGroupModel {
    pub folder_uid: String,
    pub group: String,
    pub interval_seconds: u64,
    pub rules: Vec<Value>,
    pub editable: bool,
}

/// Identity of a rule group inside Grafana.
pub fn group_key(folder_uid: &str, group: &str) -> String {
    format!("{folder_uid}/{group}")
}

fn split_group_key(key: &str) -> Option<(&str, &str)> {
    key.split_once('/')
}

fn group_path(folder_uid: &str, group: &str) -> String {
    format!("/api/v1/provisioning/folder/{folder_uid}/rule-groups/{group}")
}

/// The provisioning API form of a rule. `for` is rewritten into Grafana's `1h2m3s` form.
pub fn rule_payload(rule: &AlertRule, folder_uid: &str, group: &str) -> Value {
    let pending = rule
        .for_
        .as_deref()
        .and_then(|f| parse_duration(f).ok())
        .map_or_else(|| "0s".to_string(), format_duration);
    let mut payload = json!({
        "uid": rule.uid,
        "title": rule.title,
        "condition": rule.condition,
        "data": rule.data,
        "noDataState": rule.no_data_state.as_deref().unwrap_or("NoData"),
        "execErrState": rule.exec_err_state.as_deref().unwrap_or("Error"),
        "for": pending,
        "annotations": rule.annotations,
        "labels": rule.labels,
        "isPaused": rule.is_paused.unwrap_or(false),
        "folderUID": folder_uid,
        "ruleGroup": group,
    });
    if let Some(settings) = &rule.notification_settings {
        payload["notification_settings"] = settings.clone();
    }
    payload
}

fn validate_rules(rules: &[AlertRule]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for rule in rules {
        if rule.uid.is_empty() {
            return Err(Error::InvalidSpec(format!("rule `{}` has no uid", rule.title)));
        }
        if !seen.insert(rule.uid.as_str()) {
            return Err(Error::InvalidSpec(format!("rule uid `{}` is used twice", rule.uid)));
        }
        if let Some(pending) = &rule.for_ {
            parse_duration(pending).map_err(|e| Error::InvalidSpec(format!("rule `{}`: for: {e}", rule.uid)))?;
        }
    }
    Ok(())
}

impl GrafanaAlertRuleGroup {
    pub fn group_name(&self) -> String {
        self.spec.name.clone().unwrap_or_else(|| self.name_any())
    }
}

#[async_trait]
impl GrafanaContent for GrafanaAlertRuleGroup {
    type Model = RuleGroupModel;

    const KIND: &'static str = "AlertRuleGroup";

    fn common_spec(&self) -> &GrafanaCommonSpec {
        &self.spec.common
    }

    fn common_status(&self) -> Option<&GrafanaCommonStatus> {
        self.status.as_ref()
    }

    async fn desired(&self, ctx: &Context) -> Result<Desired<RuleGroupModel>> {
        let ns = self.namespace().ok_or(Error::MissingNamespace)?;
        let interval = parse_duration(&self.spec.interval).map_err(|e| Error::InvalidSpec(format!("interval: {e}")))?;
        if interval.as_secs() == 0 {
            return Err(Error::InvalidSpec("interval must be at least 1s".to_string()));
        }
        validate_rules(&self.spec.rules)?;
        let folder_uid = resolve_folder(
            ctx,
            &ns,
            self.spec.folder_uid.as_deref(),
            self.spec.folder_ref.as_deref(),
        )
        .await?
        .ok_or_else(|| Error::InvalidSpec("one of folderUID or folderRef is required".to_string()))?;
        let group = self.group_name();
        let rules = self
            .spec
            .rules
            .iter()
            .map(|rule| rule_payload(rule, &folder_uid, &group))
            .collect();
        Desired::new(
            group_key(&folder_uid, &group),
            RuleGroupModel {
                folder_uid,
                group,
                interval_seconds: interval.as_secs(),
                rules,
                editable: self.spec.editable.unwrap_or(true),
            },
        )
    }

    async fn is_present(
        &self,
        client: &GrafanaClient,
        desired: &Desired<RuleGroupModel>,
    ) -> Result<bool, GrafanaError> {
        client
            .exists(&group_path(&desired.model.folder_uid, &desired.model.group))
            .await
    }

    async fn apply(
        &self,
        _ctx: &Context,
        _grafana: &Grafana,
        client: &GrafanaClient,
        desired: &Desired<RuleGroupModel>,
    ) -> Result<()> {
        let model = &desired.model;
        let client = client.editable(model.editable);
        let path = group_path(&model.folder_uid, &model.group);
        let existing: BTreeSet<String> = client
            .get::<Value>(&path)
            .await?
            .map(|group| rule_uids(&group))
            .unwrap_or_default();

        for rule in &model.rules {
            let uid = rule["uid"].as_str().unwrap_or_default();
            if existing.contains(uid) {
                let _: Value = client
                    .put(&format!("/api/v1/provisioning/alert-rules/{uid}"), rule)
                    .await?;
            } else {
                let _: Value = client.post("/api/v1/provisioning/alert-rules", rule).await?;
            }
        }

        let desired_uids: BTreeSet<&str> = model.rules.iter().filter_map(|r| r["uid"].as_str()).collect();
        for stale in existing.iter().filter(|uid| !desired_uids.contains(uid.as_str())) {
            info!("deleting alert rule {stale} no longer part of group {}", model.group);
            client
                .delete(&format!("/api/v1/provisioning/alert-rules/{stale}"))
                .await?;
        }

        let _: Value = client
            .put(
                &path,
                &json!({
                    "title": model.group,
                    "folderUid": model.folder_uid,
                    "interval": model.interval_seconds,
                    "rules": model.rules,
                }),
            )
            .await?;
        Ok(())
    }

    async fn remove(&self, client: &GrafanaClient, uid: &str) -> Result<(), GrafanaError> {
        let Some((folder_uid, group)) = split_group_key(uid) else {
            warn!("ignoring malformed rule group key {uid}");
            return Ok(());
        };
        let Some(existing) = client.get::<Value>(&group_path(folder_uid, group)).await? else {
            return Ok(());
        };
        for rule in rule_uids(&existing) {
            client
                .delete(&format!("/api/v1/provisioning/alert-rules/{rule}"))
                .await?;
        }
        Ok(())
    }
}

fn rule_uids(group: &Value) -> BTreeSet<String> {
    group["rules"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|rule| rule["uid"].as_str().map(str::to_string))
        .collect()
}
