use crate::client::{GrafanaClient, GrafanaError};
use crate::controllers::common::{preserve_unknown_fields, GrafanaCommonSpec, GrafanaCommonStatus};
use crate::controllers::grafana::Grafana;
use crate::controllers::instances::instance_key;
use crate::controllers::sync::{Desired, GrafanaContent};
use crate::{Context, Error, Result};
use async_trait::async_trait;
use kube::api::ListParams;
use kube::{Api, CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

const POLICIES: &str = "/api/v1/provisioning/policies";

/// There is exactly one policy tree per instance.
pub const POLICY_KEY: &str = "policy";

/// The notification policy tree of the selected Grafana instances.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "GrafanaNotificationPolicy",
    group = "grafana.integreatly.org",
    version = "v1beta1",
    singular = "grafananotificationpolicy",
    plural = "grafananotificationpolicies",
    namespaced
)]
#[kube(status = "GrafanaCommonStatus")]
#[serde(rename_all = "camelCase")]
pub struct GrafanaNotificationPolicySpec {
    #[serde(flatten)]
    pub common: GrafanaCommonSpec,
    /// The root route, as accepted by `PUT /api/v1/provisioning/policies`.
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub route: Value,
    /// Whether the policy may be edited in the Grafana UI. Defaults to true.
    pub editable: Option<bool>,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct PolicyModel {
    pub route: Value,
    pub editable: bool,
}

const MATCH_OPERATORS: [&str; 4] = ["=~", "!~", "!=", "="];

/// Split `label=value` style matchers into Grafana's `[label, op, value]` form.
fn object_matcher(matcher: &str) -> Option<Value> {
    let (at, op) = matcher
        .char_indices()
        .find_map(|(i, _)| MATCH_OPERATORS.iter().find(|op| matcher[i..].starts_with(**op)).map(|op| (i, *op)))?;
    let label = matcher[..at].trim();
    let value = matcher[at + op.len()..].trim().trim_matches('"');
    Some(json!([label, op, value]))
}

/// Rewrite a route tree into the shape Grafana returns it in: string `matchers` become
/// `object_matchers`, and read-only fields are dropped.
fn normalized(mut route: Value) -> Value {
    match &mut route {
        Value::Object(object) => {
            object.remove("provenance");
            if let Some(Value::Array(matchers)) = object.remove("matchers") {
                let converted: Vec<Value> = matchers
                    .iter()
                    .filter_map(|m| m.as_str().and_then(object_matcher))
                    .collect();
                if let Some(Value::Array(existing)) = object.get_mut("object_matchers") {
                    existing.extend(converted);
                } else {
                    object.insert("object_matchers".to_string(), Value::Array(converted));
                }
            }
            for value in object.values_mut() {
                *value = normalized(value.take());
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                *item = normalized(item.take());
            }
        }
        _ => {}
    }
    route
}

/// Whether every field set in `wanted` has the same value in `current`. Fields Grafana fills
/// in on its own are ignored.
fn covers(current: &Value, wanted: &Value) -> bool {
    match (current, wanted) {
        (Value::Object(current), Value::Object(wanted)) => wanted
            .iter()
            .all(|(k, w)| w.is_null() || current.get(k).is_some_and(|c| covers(c, w))),
        (Value::Array(current), Value::Array(wanted)) => {
            current.len() == wanted.len() && current.iter().zip(wanted).all(|(c, w)| covers(c, w))
        }
        (current, wanted) => current == wanted,
    }
}

/// Name the policy (other than `me`) that already owns the instance `key`.
pub fn claimed_by<'a>(
    policies: &'a [GrafanaNotificationPolicy],
    me: &GrafanaNotificationPolicy,
    key: &str,
) -> Option<&'a GrafanaNotificationPolicy> {
    policies.iter().find(|other| {
        (other.namespace() != me.namespace() || other.name_any() != me.name_any())
            && other
                .status
                .as_ref()
                .is_some_and(|s| s.instances.iter().any(|i| i == key))
    })
}

#[async_trait]
impl GrafanaContent for GrafanaNotificationPolicy {
    type Model = PolicyModel;

    const KIND: &'static str = "NotificationPolicy";

    fn common_spec(&self) -> &GrafanaCommonSpec {
        &self.spec.common
    }

    fn common_status(&self) -> Option<&GrafanaCommonStatus> {
        self.status.as_ref()
    }

    async fn desired(&self, _ctx: &Context) -> Result<Desired<PolicyModel>> {
        let route = &self.spec.route;
        if !route.is_object() {
            return Err(Error::InvalidSpec("route must be a JSON object".to_string()));
        }
        if !route["receiver"].as_str().is_some_and(|r| !r.is_empty()) {
            return Err(Error::InvalidSpec("route.receiver is required".to_string()));
        }
        Desired::new(
            POLICY_KEY,
            PolicyModel {
                route: route.clone(),
                editable: self.spec.editable.unwrap_or(true),
            },
        )
    }

    async fn is_present(&self, client: &GrafanaClient, desired: &Desired<PolicyModel>) -> Result<bool, GrafanaError> {
        // the tree always exists; it is "present" while nobody changed it
        let current: Option<Value> = client.get(POLICIES).await?;
        let wanted = normalized(desired.model.route.clone());
        Ok(current.is_some_and(|c| covers(&normalized(c), &wanted)))
    }

    async fn apply(
        &self,
        ctx: &Context,
        grafana: &Grafana,
        client: &GrafanaClient,
        desired: &Desired<PolicyModel>,
    ) -> Result<()> {
        let key = instance_key(grafana);
        let policies: Api<GrafanaNotificationPolicy> = ctx.watched_api();
        let all = policies.list(&ListParams::default()).await?;
        if let Some(owner) = claimed_by(&all.items, self, &key) {
            return Err(Error::Conflict(format!(
                "instance {key} already uses notification policy {}/{}",
                owner.namespace().unwrap_or_default(),
                owner.name_any()
            )));
        }
        let _: Value = client
            .editable(desired.model.editable)
            .put(POLICIES, &desired.model.route)
            .await?;
        Ok(())
    }

    async fn remove(&self, client: &GrafanaClient, _uid: &str) -> Result<(), GrafanaError> {
        client.delete(POLICIES).await.map(|_| ())
    }
}
