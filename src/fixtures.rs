//! Helper methods only available for tests
use crate::controllers::common::{GrafanaCommonSpec, GrafanaCommonStatus, JsonSource};
use crate::controllers::dashboard::{GrafanaDashboard, GrafanaDashboardSpec};
use crate::controllers::grafana::{ExternalGrafana, Grafana, GrafanaSpec, GrafanaStatus, Stage, StageStatus};
use crate::controllers::service_account::GrafanaServiceAccount;
use crate::controllers::FINALIZER;
use crate::{Context, Metrics, OperatorConfig};
use assert_json_diff::assert_json_include;
use http::{Request, Response, StatusCode};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, Time};
use kube::{client::Body, Client, Resource, ResourceExt};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;

const GROUP_PATH: &str = "/apis/grafana.integreatly.org/v1beta1/namespaces/default";

impl Grafana {
    /// A managed instance `default/test` that has not been deployed yet.
    pub fn test() -> Self {
        let mut g = Grafana::new("test", GrafanaSpec::default());
        g.meta_mut().namespace = Some("default".into());
        g.meta_mut().uid = Some("grafana-uid".into());
        g
    }

    pub fn named(mut self, name: &str) -> Self {
        self.meta_mut().name = Some(name.into());
        self
    }

    pub fn in_namespace(mut self, namespace: &str) -> Self {
        self.meta_mut().namespace = Some(namespace.into());
        self
    }

    pub fn with_labels(mut self, labels: &[(&str, &str)]) -> Self {
        self.meta_mut().labels = Some(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect());
        self
    }

    /// Talk to `url` without credentials instead of deploying.
    pub fn external(mut self, url: &str) -> Self {
        self.spec.external = Some(ExternalGrafana {
            url: url.into(),
            ..Default::default()
        });
        self
    }

    pub fn ready(mut self, url: &str) -> Self {
        self.status = Some(GrafanaStatus {
            stage: Some(Stage::Complete),
            stage_status: Some(StageStatus::Success),
            admin_url: Some(url.into()),
            version: Some("11.3.0".into()),
            ..Default::default()
        });
        self
    }
}

impl GrafanaDashboard {
    /// A dashboard `default/test` selecting instances labelled `dashboards=grafana`.
    pub fn test() -> Self {
        let mut d = GrafanaDashboard::new(
            "test",
            GrafanaDashboardSpec {
                common: GrafanaCommonSpec {
                    instance_selector: LabelSelector {
                        match_labels: Some([("dashboards".to_string(), "grafana".to_string())].into()),
                        ..Default::default()
                    },
                    ..Default::default()
                },
                source: JsonSource {
                    json: Some(r#"{"id": 1, "title": "Test", "uid": "dash-uid"}"#.into()),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        d.meta_mut().namespace = Some("default".into());
        d.meta_mut().uid = Some("dashboard-uid".into());
        d
    }

    pub fn finalized(mut self) -> Self {
        self.finalizers_mut().push(FINALIZER.to_string());
        self
    }

    pub fn needs_delete(mut self) -> Self {
        self.meta_mut().deletion_timestamp = Some(Time(chrono::Utc::now()));
        self
    }

    pub fn broken(mut self) -> Self {
        self.spec.source.json = Some("{ not json".into());
        self
    }

    /// Pin `spec.uid`.
    pub fn with_uid(mut self, uid: &str) -> Self {
        self.spec.uid = Some(uid.into());
        self
    }

    /// Pretend an earlier pass put the dashboard on `instances` under `uid`.
    pub fn recorded_on(mut self, instances: &[&str], uid: &str, hash: &str) -> Self {
        self.status = Some(GrafanaCommonStatus {
            instances: instances.iter().map(|i| i.to_string()).collect(),
            uid: Some(uid.into()),
            hash: Some(hash.into()),
            ..Default::default()
        });
        self
    }
}

impl GrafanaServiceAccount {
    pub fn finalized(mut self) -> Self {
        self.finalizers_mut().push(FINALIZER.to_string());
        self
    }
}

// We wrap tower_test::mock::Handle
type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;
pub struct ApiServerVerifier(ApiServerHandle);

/// Scenarios we test for in ApiServerVerifier
pub enum Scenario {
    /// objects without finalizers will get a finalizer applied (and not call the apply loop)
    FinalizerCreation(GrafanaDashboard),
    /// no instance matches: the status records that and nothing else happens
    NoMatchingInstance(GrafanaDashboard),
    /// an unparseable spec publishes an event and marks the status invalid
    InvalidSpec(GrafanaDashboard),
    /// one ready instance is selected; the write is followed by an event and a status patch
    ApplyToInstance(GrafanaDashboard, Grafana),
    /// deletion publishes an event and releases the finalizer
    Cleanup(GrafanaDashboard),
    /// a pinned uid that differs from the recorded one is rejected before any instance is touched
    UidChanged(GrafanaDashboard),
    /// the recorded dashboard is unchanged and present: no write, no event, only a status patch
    UpToDate(GrafanaDashboard, Grafana),
    /// nothing is selected any more; the dashboard is removed from the recorded instance
    RemoveFromUnselected(GrafanaDashboard, Grafana),
    /// as above, but the removal fails and the instance stays recorded
    RemovalFails(GrafanaDashboard, Grafana),
    /// deletion removes every recorded uid from the instance before releasing the finalizer
    CleanupOnInstance(GrafanaDashboard, Grafana),
    /// the service account's instance does not exist
    AccountWithoutInstance(GrafanaServiceAccount),
    /// the account moved to a new instance (first) but the old one (second) refuses the removal
    AccountMoveBlocked(GrafanaServiceAccount, Grafana, Grafana),
    /// the reconciler is expected to fail before touching the apiserver
    RadioSilence,
}

pub async fn timeout_after_1s<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(std::time::Duration::from_secs(1), future)
        .await
        .expect("timeout after 1s")
}

impl ApiServerVerifier {
    /// Tests only get to run specific scenarios that has matching handlers
    ///
    /// This setup makes it easy to handle multiple requests by chaining handlers together.
    ///
    /// NB: If the controller is making more calls than we are handling in the scenario,
    /// you then typically see a `KubeError(Service(Closed(())))` from the reconciler.
    ///
    /// You should await the `JoinHandle` (with a timeout) from this function to ensure that the
    /// scenario runs to completion (i.e. all expected calls were responded to),
    /// using the timeout to catch missing api calls to Kubernetes.
    pub fn run(self, scenario: Scenario) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            // moving self => one scenario per test
            match scenario {
                Scenario::FinalizerCreation(dashboard) => self.handle_finalizer_creation(dashboard).await,
                Scenario::NoMatchingInstance(dashboard) => {
                    self.handle_instance_list(vec![])
                        .await
                        .handle_status_patch(dashboard, |status| {
                            assert_json_include!(
                                actual: status,
                                expected: json!({
                                    "noMatchingInstances": true,
                                    "uid": "dash-uid",
                                    "conditions": [{"type": "NoMatchingInstance", "status": "True"}]
                                })
                            );
                        })
                        .await
                }
                Scenario::InvalidSpec(dashboard) => {
                    self.handle_event_create("InvalidSpec")
                        .await
                        .handle_status_patch(dashboard, |status| {
                            assert_json_include!(
                                actual: status,
                                expected: json!({
                                    "conditions": [{"type": "InvalidSpec", "status": "True", "reason": "InvalidSpec"}]
                                })
                            );
                        })
                        .await
                }
                Scenario::ApplyToInstance(dashboard, grafana) => {
                    self.handle_instance_list(vec![grafana])
                        .await
                        .handle_event_create("Synchronized")
                        .await
                        .handle_status_patch(dashboard, |status| {
                            assert!(status.get("staleUids").is_none(), "status: {status}");
                            assert_json_include!(
                                actual: status,
                                expected: json!({
                                    "instances": ["default/test"],
                                    "uid": "dash-uid",
                                    "noMatchingInstances": false,
                                    "conditions": [{
                                        "type": "DashboardSynchronized",
                                        "status": "True",
                                        "reason": "ApplySuccessful",
                                        "message": "Dashboard was successfully applied to 1 instances"
                                    }]
                                })
                            );
                            assert!(status["hash"].as_str().is_some_and(|h| h.len() == 64));
                        })
                        .await
                }
                Scenario::Cleanup(dashboard) => {
                    self.handle_event_create("DeleteRequested")
                        .await
                        .handle_finalizer_removal(dashboard)
                        .await
                }
                Scenario::UidChanged(dashboard) => {
                    self.handle_event_create("InvalidSpec")
                        .await
                        .handle_status_patch(dashboard, |status| {
                            assert_json_include!(
                                actual: status,
                                expected: json!({
                                    "uid": "dash-uid",
                                    "conditions": [{"type": "InvalidSpec", "status": "True", "reason": "UIDChanged"}]
                                })
                            );
                        })
                        .await
                }
                Scenario::UpToDate(dashboard, grafana) => {
                    let hash = dashboard.status.as_ref().and_then(|s| s.hash.clone());
                    self.handle_instance_list(vec![grafana])
                        .await
                        .handle_status_patch(dashboard, move |status| {
                            assert_eq!(status["hash"].as_str(), hash.as_deref());
                            assert_json_include!(
                                actual: status,
                                expected: json!({
                                    "instances": ["default/test"],
                                    "uid": "dash-uid",
                                    "conditions": [{"type": "DashboardSynchronized", "status": "True"}]
                                })
                            );
                        })
                        .await
                }
                Scenario::RemoveFromUnselected(dashboard, grafana) => {
                    self.handle_instance_list(vec![])
                        .await
                        .handle_grafana_get(grafana)
                        .await
                        .handle_status_patch(dashboard, |status| {
                            assert_eq!(status["instances"], json!([]));
                            assert_json_include!(
                                actual: status,
                                expected: json!({
                                    "noMatchingInstances": true,
                                    "conditions": [{"type": "NoMatchingInstance", "status": "True"}]
                                })
                            );
                        })
                        .await
                }
                Scenario::RemovalFails(dashboard, grafana) => {
                    self.handle_instance_list(vec![])
                        .await
                        .handle_grafana_get(grafana)
                        .await
                        .handle_event_create("ApplyFailed")
                        .await
                        .handle_status_patch(dashboard, |status| {
                            assert_json_include!(
                                actual: status,
                                expected: json!({
                                    "instances": ["default/old"],
                                    "uid": "dash-uid",
                                    "conditions": [{
                                        "type": "DashboardSynchronized",
                                        "status": "False",
                                        "reason": "ApplyFailed"
                                    }]
                                })
                            );
                        })
                        .await
                }
                Scenario::CleanupOnInstance(dashboard, grafana) => {
                    self.handle_event_create("DeleteRequested")
                        .await
                        .handle_grafana_get(grafana)
                        .await
                        .handle_finalizer_removal(dashboard)
                        .await
                }
                Scenario::AccountWithoutInstance(account) => {
                    self.handle_missing_grafana()
                        .await
                        .handle_account_status_patch(account, |status| {
                            assert_json_include!(
                                actual: status,
                                expected: json!({
                                    "conditions": [{"type": "NoMatchingInstance", "status": "True"}]
                                })
                            );
                        })
                        .await
                }
                Scenario::AccountMoveBlocked(account, new_instance, old_instance) => {
                    let recorded = serde_json::to_value(account.status.as_ref().and_then(|s| s.account.clone()))
                        .expect("account status is json");
                    self.handle_grafana_get(new_instance)
                        .await
                        .handle_grafana_get(old_instance)
                        .await
                        .handle_event_create("ApplyFailed")
                        .await
                        .handle_account_status_patch(account, move |status| {
                            assert_eq!(status["account"], recorded);
                            assert_json_include!(
                                actual: status,
                                expected: json!({
                                    "conditions": [{
                                        "type": "ServiceAccountSynchronized",
                                        "status": "False",
                                        "reason": "ApplyFailed"
                                    }]
                                })
                            );
                        })
                        .await
                }
                Scenario::RadioSilence => self,
            };
        })
    }

    async fn next(&mut self) -> (Request<Body>, tower_test::mock::SendResponse<Response<Body>>) {
        self.0.next_request().await.expect("service not called")
    }

    async fn handle_finalizer_creation(mut self, dashboard: GrafanaDashboard) -> Self {
        let (request, send) = self.next().await;
        // We expect a json patch to the specified document adding our finalizer
        assert_eq!(request.method(), http::Method::PATCH);
        assert_eq!(
            request.uri().path(),
            format!("{GROUP_PATH}/grafanadashboards/{}", dashboard.name_any())
        );
        let expected_patch = json!([
            { "op": "test", "path": "/metadata/finalizers", "value": null },
            { "op": "add", "path": "/metadata/finalizers", "value": vec![FINALIZER] }
        ]);
        let req_body = request.into_body().collect_bytes().await.unwrap();
        let runtime_patch: Value = serde_json::from_slice(&req_body).expect("valid patch from runtime");
        assert_json_include!(actual: runtime_patch, expected: expected_patch);

        let response = serde_json::to_vec(&dashboard.finalized()).unwrap(); // respond as the apiserver would have
        send.send_response(Response::builder().body(Body::from(response)).unwrap());
        self
    }

    async fn handle_finalizer_removal(mut self, dashboard: GrafanaDashboard) -> Self {
        let (request, send) = self.next().await;
        assert_eq!(request.method(), http::Method::PATCH);
        assert_eq!(
            request.uri().path(),
            format!("{GROUP_PATH}/grafanadashboards/{}", dashboard.name_any())
        );
        let req_body = request.into_body().collect_bytes().await.unwrap();
        let runtime_patch: Value = serde_json::from_slice(&req_body).expect("valid patch from runtime");
        assert_json_include!(
            actual: runtime_patch,
            expected: json!([{ "op": "test", "value": FINALIZER }, { "op": "remove" }])
        );
        let mut released = dashboard;
        released.finalizers_mut().clear();
        let response = serde_json::to_vec(&released).unwrap();
        send.send_response(Response::builder().body(Body::from(response)).unwrap());
        self
    }

    async fn handle_instance_list(mut self, items: Vec<Grafana>) -> Self {
        let (request, send) = self.next().await;
        assert_eq!(request.method(), http::Method::GET);
        assert_eq!(request.uri().path(), format!("{GROUP_PATH}/grafanas"));
        let query = request.uri().query().unwrap_or_default().to_string();
        assert!(query.contains("labelSelector=dashboards%3Dgrafana"), "query: {query}");
        let list = json!({
            "apiVersion": "grafana.integreatly.org/v1beta1",
            "kind": "GrafanaList",
            "metadata": { "resourceVersion": "1" },
            "items": items,
        });
        let response = serde_json::to_vec(&list).unwrap();
        send.send_response(Response::builder().body(Body::from(response)).unwrap());
        self
    }

    async fn handle_missing_grafana(mut self) -> Self {
        let (request, send) = self.next().await;
        assert_eq!(request.method(), http::Method::GET);
        assert_eq!(request.uri().path(), format!("{GROUP_PATH}/grafanas/test"));
        let status = json!({
            "apiVersion": "v1",
            "kind": "Status",
            "metadata": {},
            "status": "Failure",
            "message": "grafanas.grafana.integreatly.org \"test\" not found",
            "reason": "NotFound",
            "code": 404
        });
        let response = serde_json::to_vec(&status).unwrap();
        send.send_response(
            Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Body::from(response))
                .unwrap(),
        );
        self
    }

    async fn handle_grafana_get(mut self, grafana: Grafana) -> Self {
        let (request, send) = self.next().await;
        assert_eq!(request.method(), http::Method::GET);
        assert_eq!(
            request.uri().path(),
            format!(
                "/apis/grafana.integreatly.org/v1beta1/namespaces/{}/grafanas/{}",
                grafana.namespace().unwrap_or_default(),
                grafana.name_any()
            )
        );
        let response = serde_json::to_vec(&grafana).unwrap();
        send.send_response(Response::builder().body(Body::from(response)).unwrap());
        self
    }

    async fn handle_event_create(mut self, reason: &str) -> Self {
        let (request, send) = self.next().await;
        assert_eq!(request.method(), http::Method::POST);
        assert_eq!(
            request.uri().path(),
            "/apis/events.k8s.io/v1/namespaces/default/events"
        );
        // verify the event reason matches the expected
        let req_body = request.into_body().collect_bytes().await.unwrap();
        let postdata: Value = serde_json::from_slice(&req_body).expect("valid event from runtime");
        assert_eq!(postdata["reason"].as_str(), Some(reason));
        // then pass through the body
        send.send_response(Response::builder().body(Body::from(req_body)).unwrap());
        self
    }

    async fn handle_status_patch<F>(mut self, dashboard: GrafanaDashboard, check: F) -> Self
    where
        F: FnOnce(&Value),
    {
        let (request, send) = self.next().await;
        assert_eq!(request.method(), http::Method::PATCH);
        assert_eq!(
            request.uri().path(),
            format!("{GROUP_PATH}/grafanadashboards/{}/status", dashboard.name_any())
        );
        let query = request.uri().query().unwrap_or_default().to_string();
        assert!(query.contains("fieldManager=grafana-operator"), "query: {query}");
        assert!(query.contains("force=true"), "query: {query}");
        let req_body = request.into_body().collect_bytes().await.unwrap();
        let json: Value = serde_json::from_slice(&req_body).expect("patch_status object is json");
        check(&json["status"]);

        let mut updated = dashboard;
        updated.status = Some(serde_json::from_value(json["status"].clone()).expect("valid status"));
        let response = serde_json::to_vec(&updated).unwrap();
        send.send_response(Response::builder().body(Body::from(response)).unwrap());
        self
    }

    async fn handle_account_status_patch<F>(mut self, account: GrafanaServiceAccount, check: F) -> Self
    where
        F: FnOnce(&Value),
    {
        let (request, send) = self.next().await;
        assert_eq!(request.method(), http::Method::PATCH);
        assert_eq!(
            request.uri().path(),
            format!("{GROUP_PATH}/grafanaserviceaccounts/{}/status", account.name_any())
        );
        let req_body = request.into_body().collect_bytes().await.unwrap();
        let json: Value = serde_json::from_slice(&req_body).expect("patch_status object is json");
        check(&json["status"]);
        let response = serde_json::to_vec(&account).unwrap();
        send.send_response(Response::builder().body(Body::from(response)).unwrap());
        self
    }
}

impl Context {
    // Create a test context with a mocked kube client, locally registered metrics and default diagnostics
    pub fn test() -> (Arc<Self>, ApiServerVerifier) {
        let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let mock_client = Client::new(mock_service, "default");
        let registry = prometheus::Registry::default();
        let ctx = Self {
            client: mock_client,
            metrics: Metrics::default().register(&registry).unwrap(),
            diagnostics: Arc::default(),
            config: OperatorConfig::default(),
            http: reqwest::Client::new(),
        };
        (Arc::new(ctx), ApiServerVerifier(handle))
    }
}
