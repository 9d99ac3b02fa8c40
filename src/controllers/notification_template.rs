use crate::client::{GrafanaClient, GrafanaError};
use crate::controllers::common::{GrafanaCommonSpec, GrafanaCommonStatus};
use crate::controllers::grafana::Grafana;
use crate::controllers::sync::{Desired, GrafanaContent};
use crate::{Context, Error, Result};
use async_trait::async_trait;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// A notification template synchronized into the selected Grafana instances.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "GrafanaNotificationTemplate",
    group = "grafana.integreatly.org",
    version = "v1beta1",
    singular = "grafananotificationtemplate",
    plural = "grafananotificationtemplates",
    namespaced
)]
#[kube(status = "GrafanaCommonStatus")]
#[serde(rename_all = "camelCase")]
pub struct GrafanaNotificationTemplateSpec {
    #[serde(flatten)]
    pub common: GrafanaCommonSpec,
    /// Template group name, defaults to the resource name.
    pub name: Option<String>,
    /// Go template source.
    pub template: String,
    pub editable: Option<bool>,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct TemplateModel {
    pub template: String,
    pub editable: bool,
}

fn template_path(name: &str) -> String {
    format!("/api/v1/provisioning/templates/{name}")
}

#[async_trait]
impl GrafanaContent for GrafanaNotificationTemplate {
    type Model = TemplateModel;

    const KIND: &'static str = "NotificationTemplate";

    fn common_spec(&self) -> &GrafanaCommonSpec {
        &self.spec.common
    }

    fn common_status(&self) -> Option<&GrafanaCommonStatus> {
        self.status.as_ref()
    }

    async fn desired(&self, _ctx: &Context) -> Result<Desired<TemplateModel>> {
        let name = self.spec.name.clone().unwrap_or_else(|| self.name_any());
        if name.contains('/') {
            return Err(Error::InvalidSpec(format!("template name `{name}` may not contain `/`")));
        }
        Desired::new(
            name,
            TemplateModel {
                template: self.spec.template.clone(),
                editable: self.spec.editable.unwrap_or(true),
            },
        )
    }

    async fn is_present(&self, client: &GrafanaClient, desired: &Desired<TemplateModel>) -> Result<bool, GrafanaError> {
        client.exists(&template_path(&desired.uid)).await
    }

    async fn apply(
        &self,
        _ctx: &Context,
        _grafana: &Grafana,
        client: &GrafanaClient,
        desired: &Desired<TemplateModel>,
    ) -> Result<()> {
        let _: Value = client
            .editable(desired.model.editable)
            .put(
                &template_path(&desired.uid),
                &json!({ "name": desired.uid, "template": desired.model.template }),
            )
            .await?;
        Ok(())
    }

    async fn remove(&self, client: &GrafanaClient, uid: &str) -> Result<(), GrafanaError> {
        client.delete(&template_path(uid)).await.map(|_| ())
    }
}
