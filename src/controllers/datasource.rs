use crate::client::{GrafanaClient, GrafanaError};
use crate::controllers::common::{
    immutable_uid, preserve_unknown_fields, resolve_values_from, GrafanaCommonSpec, GrafanaCommonStatus, ValueFrom,
};
use crate::controllers::grafana::Grafana;
use crate::controllers::sync::{resource_uid, Desired, GrafanaContent};
use crate::{Context, Error, Result};
use async_trait::async_trait;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A datasource synchronized into the selected Grafana instances.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "GrafanaDatasource",
    group = "grafana.integreatly.org",
    version = "v1beta1",
    singular = "grafanadatasource",
    plural = "grafanadatasources",
    namespaced
)]
#[kube(status = "GrafanaCommonStatus")]
#[kube(printcolumn = r#"{"name":"No matching instances","type":"boolean","jsonPath":".status.noMatchingInstances"}"#)]
#[serde(rename_all = "camelCase")]
pub struct GrafanaDatasourceSpec {
    #[serde(flatten)]
    pub common: GrafanaCommonSpec,
    /// Datasource uid; taken from the model or the resource when unset.
    #[schemars(schema_with = "immutable_uid")]
    pub uid: Option<String>,
    /// The datasource as accepted by `POST /api/datasources`.
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub datasource: Value,
    /// Values injected into the model from secrets and config maps.
    #[serde(default)]
    pub values_from: Vec<ValueFrom>,
}

/// Validate a datasource model and settle its uid.
pub fn normalize(mut model: Value, spec_uid: Option<&str>, fallback_uid: &str) -> Result<(String, Value)> {
    let object = model
        .as_object_mut()
        .ok_or_else(|| Error::InvalidSpec("datasource must be a JSON object".to_string()))?;
    for field in ["name", "type"] {
        if !object.get(field).and_then(Value::as_str).is_some_and(|v| !v.is_empty()) {
            return Err(Error::InvalidSpec(format!("datasource.{field} is required")));
        }
    }
    let content_uid = object
        .get("uid")
        .and_then(Value::as_str)
        .filter(|u| !u.is_empty())
        .map(str::to_string);
    let uid = spec_uid
        .map(str::to_string)
        .or(content_uid)
        .unwrap_or_else(|| fallback_uid.to_string());
    object.remove("id");
    object.insert("uid".to_string(), Value::String(uid.clone()));
    Ok((uid, model))
}

#[async_trait]
impl GrafanaContent for GrafanaDatasource {
    type Model = Value;

    const KIND: &'static str = "Datasource";

    fn common_spec(&self) -> &GrafanaCommonSpec {
        &self.spec.common
    }

    fn common_status(&self) -> Option<&GrafanaCommonStatus> {
        self.status.as_ref()
    }

    fn spec_uid(&self) -> Option<&str> {
        self.spec.uid.as_deref()
    }

    async fn desired(&self, ctx: &Context) -> Result<Desired<Value>> {
        let ns = self.namespace().ok_or(Error::MissingNamespace)?;
        let (uid, mut model) = normalize(
            self.spec.datasource.clone(),
            self.spec.uid.as_deref(),
            &resource_uid(self),
        )?;
        resolve_values_from(ctx, &ns, &self.spec.values_from, &mut model).await?;
        Desired::new(uid, model)
    }

    async fn is_present(&self, client: &GrafanaClient, desired: &Desired<Value>) -> Result<bool, GrafanaError> {
        client.exists(&format!("/api/datasources/uid/{}", desired.uid)).await
    }

    async fn apply(
        &self,
        _ctx: &Context,
        _grafana: &Grafana,
        client: &GrafanaClient,
        desired: &Desired<Value>,
    ) -> Result<()> {
        let path = format!("/api/datasources/uid/{}", desired.uid);
        if client.exists(&path).await? {
            let _: Value = client.put(&path, &desired.model).await?;
        } else {
            let _: Value = client.post("/api/datasources", &desired.model).await?;
        }
        Ok(())
    }

    async fn remove(&self, client: &GrafanaClient, uid: &str) -> Result<(), GrafanaError> {
        client.delete(&format!("/api/datasources/uid/{uid}")).await.map(|_| ())
    }
}
