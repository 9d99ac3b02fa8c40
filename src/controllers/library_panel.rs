use crate::client::{GrafanaClient, GrafanaError};
use crate::controllers::common::{immutable_uid, parse_object, GrafanaCommonSpec, GrafanaCommonStatus, JsonSource};
use crate::controllers::folder::resolve_folder;
use crate::controllers::grafana::Grafana;
use crate::controllers::sync::{resource_uid, Desired, GrafanaContent};
use crate::{Context, Error, Result};
use async_trait::async_trait;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Library element kind of a panel.
const PANEL_KIND: i64 = 1;

/// A reusable library panel synchronized into the selected Grafana instances.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "GrafanaLibraryPanel",
    group = "grafana.integreatly.org",
    version = "v1beta1",
    singular = "grafanalibrarypanel",
    plural = "grafanalibrarypanels",
    namespaced
)]
#[kube(status = "GrafanaCommonStatus")]
#[serde(rename_all = "camelCase")]
pub struct GrafanaLibraryPanelSpec {
    #[serde(flatten)]
    pub common: GrafanaCommonSpec,
    /// The panel model.
    #[serde(flatten)]
    pub source: JsonSource,
    #[schemars(schema_with = "immutable_uid")]
    pub uid: Option<String>,
    #[serde(rename = "folderUID")]
    pub folder_uid: Option<String>,
    pub folder_ref: Option<String>,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LibraryPanelModel {
    pub name: String,
    pub folder_uid: Option<String>,
    pub model: Value,
}

#[async_trait]
impl GrafanaContent for GrafanaLibraryPanel {
    type Model = LibraryPanelModel;

    const KIND: &'static str = "LibraryPanel";

    fn common_spec(&self) -> &GrafanaCommonSpec {
        &self.spec.common
    }

    fn common_status(&self) -> Option<&GrafanaCommonStatus> {
        self.status.as_ref()
    }

    fn spec_uid(&self) -> Option<&str> {
        self.spec.uid.as_deref()
    }

    async fn desired(&self, ctx: &Context) -> Result<Desired<LibraryPanelModel>> {
        let ns = self.namespace().ok_or(Error::MissingNamespace)?;
        let raw = self.spec.source.load(ctx, &ns).await?;
        let mut model = parse_object("library panel", &raw)?;
        let content_uid = model["uid"].as_str().filter(|u| !u.is_empty()).map(str::to_string);
        let uid = self
            .spec
            .uid
            .clone()
            .or(content_uid)
            .unwrap_or_else(|| resource_uid(self));
        if let Some(object) = model.as_object_mut() {
            object.remove("id");
            object.insert("uid".to_string(), Value::String(uid.clone()));
        }
        let name = model["title"]
            .as_str()
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| self.name_any());
        let folder_uid = resolve_folder(
            ctx,
            &ns,
            self.spec.folder_uid.as_deref(),
            self.spec.folder_ref.as_deref(),
        )
        .await?;
        Desired::new(
            uid,
            LibraryPanelModel {
                name,
                folder_uid,
                model,
            },
        )
    }

    async fn is_present(
        &self,
        client: &GrafanaClient,
        desired: &Desired<LibraryPanelModel>,
    ) -> Result<bool, GrafanaError> {
        client.exists(&format!("/api/library-elements/{}", desired.uid)).await
    }

    async fn apply(
        &self,
        _ctx: &Context,
        _grafana: &Grafana,
        client: &GrafanaClient,
        desired: &Desired<LibraryPanelModel>,
    ) -> Result<()> {
        let path = format!("/api/library-elements/{}", desired.uid);
        let model = &desired.model;
        match client.get::<Value>(&path).await? {
            None => {
                let _: Value = client
                    .post(
                        "/api/library-elements",
                        &json!({
                            "uid": desired.uid,
                            "folderUid": model.folder_uid,
                            "name": model.name,
                            "model": model.model,
                            "kind": PANEL_KIND,
                        }),
                    )
                    .await?;
            }
            Some(existing) => {
                // updates are rejected unless they carry the current version
                let version = existing["result"]["version"].as_i64().unwrap_or(1);
                let _: Value = client
                    .patch(
                        &path,
                        &json!({
                            "folderUid": model.folder_uid,
                            "name": model.name,
                            "model": model.model,
                            "kind": PANEL_KIND,
                            "version": version,
                        }),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn remove(&self, client: &GrafanaClient, uid: &str) -> Result<(), GrafanaError> {
        client.delete(&format!("/api/library-elements/{uid}")).await.map(|_| ())
    }
}
