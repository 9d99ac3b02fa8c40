use crate::client::{GrafanaClient, GrafanaError};
use crate::controllers::common::{immutable_uid, preserve_unknown_fields, GrafanaCommonSpec, GrafanaCommonStatus};
use crate::controllers::grafana::Grafana;
use crate::controllers::sync::{resource_uid, Desired, GrafanaContent};
use crate::{Context, Error, Result};
use async_trait::async_trait;
use kube::{Api, CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// A folder synchronized into the selected Grafana instances.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "GrafanaFolder",
    group = "grafana.integreatly.org",
    version = "v1beta1",
    singular = "grafanafolder",
    plural = "grafanafolders",
    namespaced
)]
#[kube(status = "GrafanaCommonStatus")]
#[kube(printcolumn = r#"{"name":"Title","type":"string","jsonPath":".spec.title"}"#)]
#[kube(printcolumn = r#"{"name":"No matching instances","type":"boolean","jsonPath":".status.noMatchingInstances"}"#)]
#[serde(rename_all = "camelCase")]
pub struct GrafanaFolderSpec {
    #[serde(flatten)]
    pub common: GrafanaCommonSpec,
    /// Display title, defaults to the resource name.
    pub title: Option<String>,
    /// Folder uid; derived from the resource when unset.
    #[schemars(schema_with = "immutable_uid")]
    pub uid: Option<String>,
    /// Uid of the parent folder inside Grafana.
    #[serde(rename = "parentFolderUID")]
    pub parent_folder_uid: Option<String>,
    /// Name of a `GrafanaFolder` in the same namespace to nest under.
    pub parent_folder_ref: Option<String>,
    /// Folder permissions as accepted by `POST /api/folders/:uid/permissions`.
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub permissions: Option<Value>,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FolderModel {
    pub title: String,
    pub parent_uid: Option<String>,
    pub permissions: Option<Value>,
}

impl GrafanaFolder {
    /// The uid this folder has, or will have, inside Grafana.
    pub fn folder_uid(&self) -> String {
        self.spec.uid.clone().unwrap_or_else(|| resource_uid(self))
    }

    pub fn title(&self) -> String {
        self.spec.title.clone().unwrap_or_else(|| self.name_any())
    }
}

/// Resolve the uid of the `GrafanaFolder` called `name` in `namespace`.
pub async fn folder_uid_for_ref(ctx: &Context, namespace: &str, name: &str) -> Result<String> {
    let api: Api<GrafanaFolder> = Api::namespaced(ctx.client.clone(), namespace);
    let folder = api
        .get_opt(name)
        .await?
        .ok_or_else(|| Error::InvalidSpec(format!("folder {namespace}/{name} not found")))?;
    Ok(folder.folder_uid())
}

/// Pick the folder uid from an explicit uid or a `GrafanaFolder` reference.
pub async fn resolve_folder(
    ctx: &Context,
    namespace: &str,
    folder_uid: Option<&str>,
    folder_ref: Option<&str>,
) -> Result<Option<String>> {
    match (folder_uid, folder_ref) {
        (Some(_), Some(_)) => Err(Error::InvalidSpec(
            "folderUID and folderRef are mutually exclusive".to_string(),
        )),
        (Some(uid), None) => Ok(Some(uid.to_string())),
        (None, Some(name)) => Ok(Some(folder_uid_for_ref(ctx, namespace, name).await?)),
        (None, None) => Ok(None),
    }
}

/// Find a folder by title on an instance, creating it when missing.
pub async fn ensure_folder_titled(client: &GrafanaClient, title: &str) -> Result<String, GrafanaError> {
    let hits: Vec<Value> = client
        .get_query("/api/search", &[("type", "dash-folder"), ("query", title)])
        .await?
        .unwrap_or_default();
    let existing = hits
        .iter()
        .find(|hit| hit["title"].as_str() == Some(title))
        .and_then(|hit| hit["uid"].as_str());
    if let Some(uid) = existing {
        return Ok(uid.to_string());
    }
    let created: Value = client.post("/api/folders", &json!({ "title": title })).await?;
    created["uid"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| GrafanaError::Status {
            method: reqwest::Method::POST,
            path: "/api/folders".to_string(),
            status: reqwest::StatusCode::OK,
            message: "response carries no folder uid".to_string(),
        })
}

#[async_trait]
impl GrafanaContent for GrafanaFolder {
    type Model = FolderModel;

    const KIND: &'static str = "Folder";

    fn common_spec(&self) -> &GrafanaCommonSpec {
        &self.spec.common
    }

    fn common_status(&self) -> Option<&GrafanaCommonStatus> {
        self.status.as_ref()
    }

    fn spec_uid(&self) -> Option<&str> {
        self.spec.uid.as_deref()
    }

    async fn desired(&self, ctx: &Context) -> Result<Desired<FolderModel>> {
        let ns = self.namespace().ok_or(Error::MissingNamespace)?;
        let uid = self.folder_uid();
        if self.spec.parent_folder_ref.as_deref() == Some(self.name_any().as_str()) {
            return Err(Error::InvalidSpec("a folder cannot be its own parent".to_string()));
        }
        let parent_uid = resolve_folder(
            ctx,
            &ns,
            self.spec.parent_folder_uid.as_deref(),
            self.spec.parent_folder_ref.as_deref(),
        )
        .await?;
        if parent_uid.as_deref() == Some(uid.as_str()) {
            return Err(Error::InvalidSpec("a folder cannot be its own parent".to_string()));
        }
        Desired::new(
            uid,
            FolderModel {
                title: self.title(),
                parent_uid,
                permissions: self.spec.permissions.clone(),
            },
        )
    }

    async fn is_present(&self, client: &GrafanaClient, desired: &Desired<FolderModel>) -> Result<bool, GrafanaError> {
        client.exists(&format!("/api/folders/{}", desired.uid)).await
    }

    async fn apply(
        &self,
        _ctx: &Context,
        _grafana: &Grafana,
        client: &GrafanaClient,
        desired: &Desired<FolderModel>,
    ) -> Result<()> {
        let uid = &desired.uid;
        let model = &desired.model;
        let path = format!("/api/folders/{uid}");
        match client.get::<Value>(&path).await? {
            None => {
                let _: Value = client
                    .post(
                        "/api/folders",
                        &json!({ "uid": uid, "title": model.title, "parentUid": model.parent_uid }),
                    )
                    .await?;
            }
            Some(existing) => {
                if existing["parentUid"].as_str() != model.parent_uid.as_deref() {
                    let _: Value = client
                        .post(
                            &format!("{path}/move"),
                            &json!({ "parentUid": model.parent_uid.clone().unwrap_or_default() }),
                        )
                        .await?;
                }
                let _: Value = client
                    .put(&path, &json!({ "title": model.title, "overwrite": true }))
                    .await?;
            }
        }
        if let Some(permissions) = &model.permissions {
            let _: Value = client.post(&format!("{path}/permissions"), permissions).await?;
        }
        Ok(())
    }

    async fn remove(&self, client: &GrafanaClient, uid: &str) -> Result<(), GrafanaError> {
        client
            .delete(&format!("/api/folders/{uid}?forceDeleteRules=true"))
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> GrafanaClient {
        GrafanaClient::new(
            &server.uri(),
            crate::client::Credentials::Anonymous,
            Duration::from_secs(5),
            false,
        )
        .unwrap()
    }

    fn folder(title: Option<&str>) -> GrafanaFolder {
        let mut folder = GrafanaFolder::new(
            "team-a",
            GrafanaFolderSpec {
                title: title.map(String::from),
                ..Default::default()
            },
        );
        folder.metadata.namespace = Some("default".into());
        folder.metadata.uid = Some("8c1f0f0e-folder".into());
        folder
    }

    fn desired(parent: Option<&str>, permissions: Option<Value>) -> Desired<FolderModel> {
        Desired::new(
            "8c1f0f0e-folder",
            FolderModel {
                title: "Team A".into(),
                parent_uid: parent.map(String::from),
                permissions,
            },
        )
        .unwrap()
    }

    #[test]
    fn defaults_come_from_the_resource() {
        let f = folder(None);
        assert_eq!(f.title(), "team-a");
        assert_eq!(f.folder_uid(), "8c1f0f0e-folder");
        let mut pinned = folder(Some("Team A"));
        pinned.spec.uid = Some("team-a".into());
        assert_eq!(pinned.folder_uid(), "team-a");
        assert_eq!(pinned.title(), "Team A");
    }

    #[tokio::test]
    async fn creates_missing_folders() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/folders/8c1f0f0e-folder"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/folders"))
            .and(body_json(json!({"uid": "8c1f0f0e-folder", "title": "Team A", "parentUid": "root"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"uid": "8c1f0f0e-folder"})))
            .expect(1)
            .mount(&server)
            .await;
        let (ctx, _handle) = Context::test();
        let f = folder(Some("Team A"));
        f.apply(&ctx, &Grafana::test(), &client(&server), &desired(Some("root"), None))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn moves_and_renames_existing_folders() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/folders/8c1f0f0e-folder"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "uid": "8c1f0f0e-folder", "title": "Old", "parentUid": "old-parent"
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/folders/8c1f0f0e-folder/move"))
            .and(body_json(json!({"parentUid": ""})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/api/folders/8c1f0f0e-folder"))
            .and(body_json(json!({"title": "Team A", "overwrite": true})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/folders/8c1f0f0e-folder/permissions"))
            .and(body_json(json!({"items": [{"role": "Viewer", "permission": 1}]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"message": "updated"})))
            .expect(1)
            .mount(&server)
            .await;
        let (ctx, _handle) = Context::test();
        let permissions = json!({"items": [{"role": "Viewer", "permission": 1}]});
        folder(Some("Team A"))
            .apply(&ctx, &Grafana::test(), &client(&server), &desired(None, Some(permissions)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn removal_forces_rule_deletion() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/folders/team-a"))
            .and(query_param("forceDeleteRules", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"message": "deleted"})))
            .expect(1)
            .mount(&server)
            .await;
        folder(None).remove(&client(&server), "team-a").await.unwrap();
    }

    #[tokio::test]
    async fn folders_by_title_are_reused_or_created() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/search"))
            .and(query_param("query", "Shared"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"uid": "abc", "title": "Shared Stuff"},
                {"uid": "def", "title": "Shared"}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/search"))
            .and(query_param("query", "New"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/folders"))
            .and(body_json(json!({"title": "New"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"uid": "new-uid"})))
            .expect(1)
            .mount(&server)
            .await;
        let c = client(&server);
        assert_eq!(ensure_folder_titled(&c, "Shared").await.unwrap(), "def");
        assert_eq!(ensure_folder_titled(&c, "New").await.unwrap(), "new-uid");
    }

    #[tokio::test]
    async fn explicit_uid_and_ref_are_exclusive() {
        let (ctx, _handle) = Context::test();
        let err = resolve_folder(&ctx, "default", Some("a"), Some("b")).await.unwrap_err();
        assert!(matches!(err, Error::InvalidSpec(_)));
        assert_eq!(
            resolve_folder(&ctx, "default", Some("a"), None).await.unwrap(),
            Some("a".to_string())
        );
        assert_eq!(resolve_folder(&ctx, "default", None, None).await.unwrap(), None);
    }
}
