use crate::controllers::secrets::{ConfigMapRef, SecretRef};
use crate::duration::parse_duration;
use crate::{Context, Error, Result};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, LabelSelector, Time};
use kube::Api;
use schemars::gen::SchemaGenerator;
use schemars::schema::Schema;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Targeting shared by every resource that is synchronized into Grafana instances.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GrafanaCommonSpec {
    /// Selects the `Grafana` instances to synchronize into. An empty selector matches nothing.
    pub instance_selector: LabelSelector,
    /// Also consider `Grafana` instances in other namespaces.
    #[serde(default)]
    pub allow_cross_namespace_import: bool,
    /// How often to re-apply the resource, e.g. `10m`. `0s` disables periodic resyncs.
    pub resync_period: Option<String>,
}

/// Status shared by every synchronized resource.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GrafanaCommonStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Instances (`namespace/name`) the resource currently lives on.
    #[serde(default)]
    pub instances: Vec<String>,
    #[serde(default)]
    pub no_matching_instances: bool,
    /// Identity of the object inside Grafana.
    pub uid: Option<String>,
    /// Earlier uids that may still exist on some recorded instance.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stale_uids: Vec<String>,
    /// Content hash of the last fully successful apply.
    pub hash: Option<String>,
    pub last_resync: Option<Time>,
    pub observed_generation: Option<i64>,
}

/// A value copied from a `Secret` or `ConfigMap` into the generated Grafana model.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ValueFrom {
    /// Dot-separated path inside the model, e.g. `secureJsonData.password`.
    pub target_path: String,
    pub value_from: ValueFromSource,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ValueFromSource {
    pub secret_key_ref: Option<SecretRef>,
    pub config_map_key_ref: Option<ConfigMapRef>,
}

/// Schema for free-form JSON documents embedded in a spec.
pub fn preserve_unknown_fields(_: &mut SchemaGenerator) -> Schema {
    serde_json::from_value(json!({
        "type": "object",
        "x-kubernetes-preserve-unknown-fields": true
    }))
    .unwrap()
}

/// Schema for a list of free-form JSON documents.
pub fn preserve_unknown_array(_: &mut SchemaGenerator) -> Schema {
    serde_json::from_value(json!({
        "type": "array",
        "items": {
            "type": "object",
            "x-kubernetes-preserve-unknown-fields": true
        }
    }))
    .unwrap()
}

/// Schema for an optional uid that cannot change once set.
pub fn immutable_uid(_: &mut SchemaGenerator) -> Schema {
    serde_json::from_value(json!({
        "nullable": true,
        "type": "string",
        "maxLength": 40,
        "x-kubernetes-validations": [{
            "rule": "self == oldSelf",
            "message": "spec.uid is immutable"
        }]
    }))
    .unwrap()
}

/// Where a JSON document (a dashboard or a library panel) comes from.
///
/// Exactly one source must be set.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct JsonSource {
    /// The document inline.
    pub json: Option<String>,
    /// A key of a `ConfigMap` in the same namespace holding the document.
    pub config_map_ref: Option<ConfigMapRef>,
    /// An http(s) url the document is fetched from.
    pub url: Option<String>,
}

impl JsonSource {
    /// Load the raw document text.
    pub async fn load(&self, ctx: &Context, namespace: &str) -> Result<String> {
        match (&self.json, &self.config_map_ref, &self.url) {
            (Some(json), None, None) => Ok(json.clone()),
            (None, Some(cm), None) => {
                let api: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), namespace);
                cm.get_field(&api).await.map_err(reference_error)
            }
            (None, None, Some(url)) => {
                let response = ctx
                    .http
                    .get(url)
                    .send()
                    .await
                    .and_then(|r| r.error_for_status())
                    .map_err(Error::FetchError)?;
                response.text().await.map_err(Error::FetchError)
            }
            _ => Err(Error::InvalidSpec(
                "exactly one of json, configMapRef or url must be set".to_string(),
            )),
        }
    }
}

/// Parse a document into a JSON object.
pub fn parse_object(what: &str, raw: &str) -> Result<Value> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| Error::InvalidSpec(format!("{what} is not valid JSON: {e}")))?;
    if !value.is_object() {
        return Err(Error::InvalidSpec(format!("{what} must be a JSON object")));
    }
    Ok(value)
}

/// Hex-encoded SHA-256 over the canonical JSON form of `value`.
///
/// `serde_json` maps are ordered, so equal documents always hash the same.
pub fn content_hash<T: Serialize>(value: &T) -> Result<String> {
    let canonical = serde_json::to_vec(&serde_json::to_value(value)?)?;
    Ok(format!("{:x}", Sha256::digest(&canonical)))
}

/// Set `value` at a dot-separated `path`, creating intermediate objects.
pub fn set_path(target: &mut Value, path: &str, value: Value) -> Result<()> {
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(Error::InvalidSpec(format!("invalid target path `{path}`")));
    }
    let mut current = target;
    for segment in &segments[..segments.len() - 1] {
        if current.is_null() {
            *current = Value::Object(Default::default());
        }
        let object = current
            .as_object_mut()
            .ok_or_else(|| Error::InvalidSpec(format!("target path `{path}` crosses a non-object")))?;
        current = object
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
    }
    if current.is_null() {
        *current = Value::Object(Default::default());
    }
    let last = segments[segments.len() - 1];
    current
        .as_object_mut()
        .ok_or_else(|| Error::InvalidSpec(format!("target path `{path}` crosses a non-object")))?
        .insert(last.to_string(), value);
    Ok(())
}

/// Resolve every `valuesFrom` entry and write it into `target`.
pub async fn resolve_values_from(ctx: &Context, namespace: &str, values: &[ValueFrom], target: &mut Value) -> Result<()> {
    if values.is_empty() {
        return Ok(());
    }
    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), namespace);
    let config_maps: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), namespace);
    for value in values {
        let resolved = match (&value.value_from.secret_key_ref, &value.value_from.config_map_key_ref) {
            (Some(secret), None) => secret.get_field(&secrets).await,
            (None, Some(cm)) => cm.get_field(&config_maps).await,
            _ => {
                return Err(Error::InvalidSpec(format!(
                    "valuesFrom `{}` needs exactly one of secretKeyRef or configMapKeyRef",
                    value.target_path
                )))
            }
        };
        let resolved = resolved.map_err(reference_error)?;
        set_path(target, &value.target_path, Value::String(resolved))?;
    }
    Ok(())
}

/// Missing references are spec problems; API failures stay transient.
pub fn reference_error(e: crate::controllers::secrets::SecretError) -> Error {
    if e.is_reference_error() {
        Error::InvalidSpec(e.to_string())
    } else {
        Error::SecretError(e)
    }
}

/// The effective resync period; `None` means periodic resyncs are disabled.
pub fn resync_period(spec: &GrafanaCommonSpec, default: Duration) -> Result<Option<Duration>> {
    let period = match spec.resync_period.as_deref() {
        None => default,
        Some(p) => parse_duration(p).map_err(|e| Error::InvalidSpec(format!("resyncPeriod: {e}")))?,
    };
    Ok((!period.is_zero()).then_some(period))
}
