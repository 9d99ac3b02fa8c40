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
use serde_json::{json, Value};

const CONTACT_POINTS: &str = "/api/v1/provisioning/contact-points";

/// An alerting contact point synchronized into the selected Grafana instances.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "GrafanaContactPoint",
    group = "grafana.integreatly.org",
    version = "v1beta1",
    singular = "grafanacontactpoint",
    plural = "grafanacontactpoints",
    namespaced
)]
#[kube(status = "GrafanaCommonStatus")]
#[serde(rename_all = "camelCase")]
pub struct GrafanaContactPointSpec {
    #[serde(flatten)]
    pub common: GrafanaCommonSpec,
    #[schemars(schema_with = "immutable_uid")]
    pub uid: Option<String>,
    /// Display name, defaults to the resource name.
    pub name: Option<String>,
    /// Integration type, e.g. `email`, `slack` or `webhook`.
    #[serde(rename = "type")]
    pub type_: String,
    /// Integration settings.
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub settings: Value,
    /// Values injected into `settings` from secrets and config maps.
    #[serde(default)]
    pub values_from: Vec<ValueFrom>,
    pub disable_resolve_message: Option<bool>,
    /// Whether the contact point may be edited in the Grafana UI. Defaults to true.
    pub editable: Option<bool>,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContactPointModel {
    pub uid: String,
    pub name: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub settings: Value,
    pub disable_resolve_message: bool,
    pub editable: bool,
}

impl ContactPointModel {
    /// The provisioning API body; editability travels as a header.
    fn payload(&self) -> Value {
        json!({
            "uid": self.uid,
            "name": self.name,
            "type": self.type_,
            "settings": self.settings,
            "disableResolveMessage": self.disable_resolve_message,
        })
    }
}

/// Contact points have no single-object read; look the uid up in the list.
async fn find(client: &GrafanaClient, uid: &str) -> Result<Option<Value>, GrafanaError> {
    let all: Vec<Value> = client.get(CONTACT_POINTS).await?.unwrap_or_default();
    Ok(all.into_iter().find(|cp| cp["uid"].as_str() == Some(uid)))
}

#[async_trait]
impl GrafanaContent for GrafanaContactPoint {
    type Model = ContactPointModel;

    const KIND: &'static str = "ContactPoint";

    fn common_spec(&self) -> &GrafanaCommonSpec {
        &self.spec.common
    }

    fn common_status(&self) -> Option<&GrafanaCommonStatus> {
        self.status.as_ref()
    }

    fn spec_uid(&self) -> Option<&str> {
        self.spec.uid.as_deref()
    }

    async fn desired(&self, ctx: &Context) -> Result<Desired<ContactPointModel>> {
        let ns = self.namespace().ok_or(Error::MissingNamespace)?;
        if self.spec.type_.is_empty() {
            return Err(Error::InvalidSpec("type is required".to_string()));
        }
        let mut settings = match &self.spec.settings {
            Value::Null => Value::Object(Default::default()),
            Value::Object(_) => self.spec.settings.clone(),
            _ => return Err(Error::InvalidSpec("settings must be a JSON object".to_string())),
        };
        resolve_values_from(ctx, &ns, &self.spec.values_from, &mut settings).await?;
        let uid = self.spec.uid.clone().unwrap_or_else(|| resource_uid(self));
        let model = ContactPointModel {
            uid: uid.clone(),
            name: self.spec.name.clone().unwrap_or_else(|| self.name_any()),
            type_: self.spec.type_.clone(),
            settings,
            disable_resolve_message: self.spec.disable_resolve_message.unwrap_or(false),
            editable: self.spec.editable.unwrap_or(true),
        };
        Desired::new(uid, model)
    }

    async fn is_present(
        &self,
        client: &GrafanaClient,
        desired: &Desired<ContactPointModel>,
    ) -> Result<bool, GrafanaError> {
        Ok(find(client, &desired.uid).await?.is_some())
    }

    async fn apply(
        &self,
        _ctx: &Context,
        _grafana: &Grafana,
        client: &GrafanaClient,
        desired: &Desired<ContactPointModel>,
    ) -> Result<()> {
        let client = client.editable(desired.model.editable);
        if find(&client, &desired.uid).await?.is_some() {
            let _: Value = client
                .put(&format!("{CONTACT_POINTS}/{}", desired.uid), &desired.model.payload())
                .await?;
        } else {
            let _: Value = client.post(CONTACT_POINTS, &desired.model.payload()).await?;
        }
        Ok(())
    }

    async fn remove(&self, client: &GrafanaClient, uid: &str) -> Result<(), GrafanaError> {
        client.delete(&format!("{CONTACT_POINTS}/{uid}")).await.map(|_| ())
    }
}
