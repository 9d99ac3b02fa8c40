use crate::client::{GrafanaClient, GrafanaError};
use crate::controllers::common::{immutable_uid, parse_object, GrafanaCommonSpec, GrafanaCommonStatus, JsonSource};
use crate::controllers::folder::{ensure_folder_titled, resolve_folder};
use crate::controllers::grafana::Grafana;
use crate::controllers::sync::{resource_uid, Desired, GrafanaContent};
use crate::{Context, Error, Result};
use async_trait::async_trait;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// A dashboard synchronized into the selected Grafana instances.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "GrafanaDashboard",
    group = "grafana.integreatly.org",
    version = "v1beta1",
    singular = "grafanadashboard",
    plural = "grafanadashboards",
    namespaced
)]
#[kube(status = "GrafanaCommonStatus")]
#[kube(printcolumn = r#"{"name":"No matching instances","type":"boolean","jsonPath":".status.noMatchingInstances"}"#)]
#[serde(rename_all = "camelCase")]
pub struct GrafanaDashboardSpec {
    #[serde(flatten)]
    pub common: GrafanaCommonSpec,
    #[serde(flatten)]
    pub source: JsonSource,
    /// Dashboard uid; taken from the dashboard JSON or the resource when unset.
    #[schemars(schema_with = "immutable_uid")]
    pub uid: Option<String>,
    /// Replacements for `${inputName}` placeholders in the dashboard.
    #[serde(default)]
    pub datasources: Vec<DashboardDatasource>,
    /// Uid of the folder to place the dashboard in.
    #[serde(rename = "folderUID")]
    pub folder_uid: Option<String>,
    /// Name of a `GrafanaFolder` in the same namespace to place the dashboard in.
    pub folder_ref: Option<String>,
    /// Title of a folder to place the dashboard in; created on demand.
    pub folder: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DashboardDatasource {
    pub input_name: String,
    pub datasource_name: String,
}

/// Where the dashboard lands on each instance.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum FolderPlacement {
    General,
    Uid(String),
    /// Resolved per instance, since the folder may be created there.
    Title(String),
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct DashboardModel {
    pub dashboard: Value,
    pub folder: FolderPlacement,
}

/// Replace `${inputName}` placeholders with the configured datasource names.
pub fn substitute_inputs(raw: &str, datasources: &[DashboardDatasource]) -> String {
    datasources.iter().fold(raw.to_string(), |content, ds| {
        content.replace(&format!("${{{}}}", ds.input_name), &ds.datasource_name)
    })
}

/// Normalize a dashboard document for the write: the numeric id is instance-local and the uid
/// is decided by the resource.
pub fn normalize(mut dashboard: Value, spec_uid: Option<&str>, fallback_uid: &str) -> (String, Value) {
    let content_uid = dashboard["uid"].as_str().filter(|u| !u.is_empty()).map(str::to_string);
    let uid = spec_uid
        .map(str::to_string)
        .or(content_uid)
        .unwrap_or_else(|| fallback_uid.to_string());
    if let Some(object) = dashboard.as_object_mut() {
        object.remove("id");
        object.insert("uid".to_string(), Value::String(uid.clone()));
    }
    (uid, dashboard)
}

#[async_trait]
impl GrafanaContent for GrafanaDashboard {
    type Model = DashboardModel;

    const KIND: &'static str = "Dashboard";

    fn common_spec(&self) -> &GrafanaCommonSpec {
        &self.spec.common
    }

    fn common_status(&self) -> Option<&GrafanaCommonStatus> {
        self.status.as_ref()
    }

    fn spec_uid(&self) -> Option<&str> {
        self.spec.uid.as_deref()
    }

    async fn desired(&self, ctx: &Context) -> Result<Desired<DashboardModel>> {
        let ns = self.namespace().ok_or(Error::MissingNamespace)?;
        let raw = self.spec.source.load(ctx, &ns).await?;
        let dashboard = parse_object("dashboard", &substitute_inputs(&raw, &self.spec.datasources))?;
        let (uid, dashboard) = normalize(dashboard, self.spec.uid.as_deref(), &resource_uid(self));

        let folder = match resolve_folder(
            ctx,
            &ns,
            self.spec.folder_uid.as_deref(),
            self.spec.folder_ref.as_deref(),
        )
        .await?
        {
            Some(uid) => FolderPlacement::Uid(uid),
            None => match &self.spec.folder {
                Some(title) if !title.is_empty() => FolderPlacement::Title(title.clone()),
                _ => FolderPlacement::General,
            },
        };
        Desired::new(uid, DashboardModel { dashboard, folder })
    }

    async fn is_present(
        &self,
        client: &GrafanaClient,
        desired: &Desired<DashboardModel>,
    ) -> Result<bool, GrafanaError> {
        client.exists(&format!("/api/dashboards/uid/{}", desired.uid)).await
    }

    async fn apply(
        &self,
        _ctx: &Context,
        _grafana: &Grafana,
        client: &GrafanaClient,
        desired: &Desired<DashboardModel>,
    ) -> Result<()> {
        let folder_uid = match &desired.model.folder {
            FolderPlacement::General => None,
            FolderPlacement::Uid(uid) => Some(uid.clone()),
            FolderPlacement::Title(title) => Some(ensure_folder_titled(client, title).await?),
        };
        let _: Value = client
            .post(
                "/api/dashboards/db",
                &json!({
                    "dashboard": desired.model.dashboard,
                    "folderUid": folder_uid,
                    "overwrite": true,
                    "message": "Updated by grafana-operator",
                }),
            )
            .await?;
        Ok(())
    }

    async fn remove(&self, client: &GrafanaClient, uid: &str) -> Result<(), GrafanaError> {
        client.delete(&format!("/api/dashboards/uid/{uid}")).await.map(|_| ())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fixtures::timeout_after_1s;
    use std::time::Duration;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn inputs_are_substituted() {
        let raw = r#"{"panels":[{"datasource":"${DS_PROMETHEUS}"},{"datasource":"${DS_LOKI}"}]}"#;
        let datasources = vec![DashboardDatasource {
            input_name: "DS_PROMETHEUS".into(),
            datasource_name: "Prometheus".into(),
        }];
        assert_eq!(
            substitute_inputs(raw, &datasources),
            r#"{"panels":[{"datasource":"Prometheus"},{"datasource":"${DS_LOKI}"}]}"#
        );
    }

    #[test]
    fn uid_precedence() {
        let doc = json!({"id": 12, "uid": "from-json", "title": "t"});
        let (uid, normalized) = normalize(doc.clone(), Some("pinned"), "resource");
        assert_eq!(uid, "pinned");
        assert_eq!(normalized, json!({"uid": "pinned", "title": "t"}));

        let (uid, _) = normalize(doc, None, "resource");
        assert_eq!(uid, "from-json");

        let (uid, normalized) = normalize(json!({"uid": "", "title": "t"}), None, "resource");
        assert_eq!(uid, "resource");
        assert_eq!(normalized["uid"], "resource");
    }

    #[tokio::test]
    async fn desired_from_inline_json() {
        let (ctx, _handle) = Context::test();
        let dashboard = GrafanaDashboard::test();
        let desired = timeout_after_1s(dashboard.desired(&ctx)).await.unwrap();
        assert_eq!(desired.uid, "dash-uid");
        assert_eq!(desired.model.folder, FolderPlacement::General);
        assert_eq!(desired.model.dashboard["title"], "Test");
        assert!(desired.model.dashboard.get("id").is_none());
    }

    #[tokio::test]
    async fn invalid_json_is_an_invalid_spec() {
        let (ctx, _handle) = Context::test();
        let mut dashboard = GrafanaDashboard::test();
        dashboard.spec.source.json = Some("{not json".into());
        let err = timeout_after_1s(dashboard.desired(&ctx)).await.unwrap_err();
        assert!(matches!(err, Error::InvalidSpec(_)));
    }

    #[tokio::test]
    async fn dashboards_are_fetched_from_urls() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/dashboards/node.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"title":"Node","uid":"node"}"#))
            .expect(1)
            .mount(&server)
            .await;
        let (ctx, _handle) = Context::test();
        let mut dashboard = GrafanaDashboard::test();
        dashboard.spec.source = JsonSource {
            url: Some(format!("{}/dashboards/node.json", server.uri())),
            ..Default::default()
        };
        dashboard.spec.folder = Some("Infra".into());
        let desired = dashboard.desired(&ctx).await.unwrap();
        assert_eq!(desired.uid, "node");
        assert_eq!(desired.model.folder, FolderPlacement::Title("Infra".into()));
    }

    #[tokio::test]
    async fn apply_posts_with_resolved_folder() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"uid": "infra", "title": "Infra"}])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/dashboards/db"))
            .and(body_json(json!({
                "dashboard": {"uid": "node", "title": "Node"},
                "folderUid": "infra",
                "overwrite": true,
                "message": "Updated by grafana-operator"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "success"})))
            .expect(1)
            .mount(&server)
            .await;
        let (ctx, _handle) = Context::test();
        let client = GrafanaClient::new(
            &server.uri(),
            crate::client::Credentials::Anonymous,
            Duration::from_secs(5),
            false,
        )
        .unwrap();
        let desired = Desired::new(
            "node",
            DashboardModel {
                dashboard: json!({"uid": "node", "title": "Node"}),
                folder: FolderPlacement::Title("Infra".into()),
            },
        )
        .unwrap();
        GrafanaDashboard::test()
            .apply(&ctx, &Grafana::test(), &client, &desired)
            .await
            .unwrap();
    }
}
