use crate::client::{Credentials, GrafanaClient};
use crate::config::FIELD_MANAGER;
use crate::controllers::common::content_hash;
use crate::controllers::conditions::{self, GRAFANA_READY};
use crate::controllers::event_recorder::{EventAction, EventReason};
use crate::controllers::secrets::{SecretError, SecretRef};
use crate::controllers::FINALIZER;
use crate::{Context, Error, Result, ERROR_REQUEUE};
use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::{
    api::{Api, Patch, PatchParams, PostParams, ResourceExt},
    runtime::{
        controller::Action,
        finalizer::{finalizer, Event as Finalizer},
    },
    Client, CustomResource, Resource,
};
use rand::distr::{Alphanumeric, SampleString};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::*;

pub const DEFAULT_VERSION: &str = "11.3.0";
pub const DEFAULT_IMAGE: &str = "docker.io/grafana/grafana";
pub const HTTP_PORT: i32 = 3000;
pub const ADMIN_USER_KEY: &str = "GF_SECURITY_ADMIN_USER";
pub const ADMIN_PASSWORD_KEY: &str = "GF_SECURITY_ADMIN_PASSWORD";
const CONFIG_HASH_ANNOTATION: &str = "grafana.integreatly.org/config-hash";

/// A Grafana server, either deployed by the operator or reached at an external url.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "Grafana",
    group = "grafana.integreatly.org",
    version = "v1beta1",
    singular = "grafana",
    plural = "grafanas",
    namespaced
)]
#[kube(status = "GrafanaStatus")]
#[kube(printcolumn = r#"{"name":"Version","type":"string","jsonPath":".status.version"}"#)]
#[kube(printcolumn = r#"{"name":"Stage","type":"string","jsonPath":".status.stage"}"#)]
#[kube(printcolumn = r#"{"name":"Stage status","type":"string","jsonPath":".status.stageStatus"}"#)]
#[serde(rename_all = "camelCase")]
pub struct GrafanaSpec {
    /// Use an existing Grafana instead of deploying one.
    pub external: Option<ExternalGrafana>,
    /// `grafana.ini` sections, e.g. `{"auth": {"disable_login_form": "false"}}`.
    #[serde(default)]
    pub config: BTreeMap<String, BTreeMap<String, String>>,
    /// Grafana version to deploy, used when no `image` is given.
    pub version: Option<String>,
    /// Full image reference, overrides `version`.
    pub image: Option<String>,
    pub replicas: Option<i32>,
    /// Settings of the operator's HTTP client towards this instance.
    pub client: Option<GrafanaClientSettings>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExternalGrafana {
    /// Base url of the instance, e.g. `https://grafana.example.com`.
    pub url: String,
    pub admin_user: Option<SecretRef>,
    pub admin_password: Option<SecretRef>,
    /// A service account token or API key; preferred over basic auth.
    pub api_key: Option<SecretRef>,
    pub tls: Option<TlsSettings>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TlsSettings {
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GrafanaClientSettings {
    pub timeout_seconds: Option<u64>,
}

/// Deployment stages, in the order they are worked through.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    AdminUser,
    Config,
    Deployment,
    Service,
    Complete,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum StageStatus {
    Success,
    Failed,
}

/// The status object of `Grafana`
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GrafanaStatus {
    pub stage: Option<Stage>,
    pub stage_status: Option<StageStatus>,
    /// Url the operator talks to.
    pub admin_url: Option<String>,
    pub version: Option<String>,
    pub last_message: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl Grafana {
    /// Ready instances accept content.
    pub fn is_ready(&self) -> bool {
        self.status.as_ref().is_some_and(|s| {
            s.stage == Some(Stage::Complete)
                && s.stage_status == Some(StageStatus::Success)
                && s.admin_url.as_deref().is_some_and(|u| !u.is_empty())
        })
    }

    pub fn admin_url(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.admin_url.as_deref())
    }

    pub fn client_timeout(&self, default: Duration) -> Duration {
        self.spec
            .client
            .as_ref()
            .and_then(|c| c.timeout_seconds)
            .map_or(default, Duration::from_secs)
    }

    pub fn insecure_skip_verify(&self) -> bool {
        self.spec
            .external
            .as_ref()
            .and_then(|e| e.tls.as_ref())
            .is_some_and(|t| t.insecure_skip_verify)
    }

    pub fn admin_secret_name(&self) -> String {
        format!("{}-admin-credentials", self.name_any())
    }

    fn config_map_name(&self) -> String {
        format!("{}-ini", self.name_any())
    }

    fn deployment_name(&self) -> String {
        format!("{}-deployment", self.name_any())
    }

    fn service_name(&self) -> String {
        format!("{}-service", self.name_any())
    }

    /// In-cluster url of a managed instance.
    pub fn service_url(&self, namespace: &str) -> String {
        format!("http://{}.{namespace}:{HTTP_PORT}", self.service_name())
    }

    pub fn image(&self) -> String {
        self.spec.image.clone().unwrap_or_else(|| {
            format!(
                "{DEFAULT_IMAGE}:{}",
                self.spec.version.as_deref().unwrap_or(DEFAULT_VERSION)
            )
        })
    }

    /// How the operator authenticates against this instance.
    pub async fn credentials(&self, client: &Client) -> Result<Credentials> {
        let ns = self.namespace().ok_or(Error::MissingNamespace)?;
        let secrets: Api<Secret> = Api::namespaced(client.clone(), &ns);
        match &self.spec.external {
            Some(external) => {
                if let Some(api_key) = &external.api_key {
                    return Ok(Credentials::Token(api_key.get_field(&secrets).await?));
                }
                match (&external.admin_user, &external.admin_password) {
                    (Some(user), Some(password)) => Ok(Credentials::Basic {
                        user: user.get_field(&secrets).await?,
                        password: password.get_field(&secrets).await?,
                    }),
                    _ => Ok(Credentials::Anonymous),
                }
            }
            None => {
                let name = self.admin_secret_name();
                let secret = secrets
                    .get_opt(&name)
                    .await?
                    .ok_or_else(|| SecretError::NotFound(format!("secret {name}")))?;
                let field = |key: &str| {
                    SecretRef {
                        name: name.clone(),
                        key: key.to_string(),
                    }
                    .get_field_with(&secret)
                };
                Ok(Credentials::Basic {
                    user: field(ADMIN_USER_KEY)?,
                    password: field(ADMIN_PASSWORD_KEY)?,
                })
            }
        }
    }

    fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("app.kubernetes.io/name".to_string(), "grafana".to_string()),
            ("app.kubernetes.io/instance".to_string(), self.name_any()),
            ("app.kubernetes.io/managed-by".to_string(), "grafana-operator".to_string()),
        ])
    }

    fn object_meta(&self, name: &str, namespace: &str) -> Value {
        json!({
            "name": name,
            "namespace": namespace,
            "labels": self.labels(),
            "ownerReferences": self.controller_owner_ref(&()).into_iter().collect::<Vec<_>>(),
        })
    }

    pub fn admin_secret_manifest(&self, namespace: &str, password: &str) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": self.object_meta(&self.admin_secret_name(), namespace),
            "type": "Opaque",
            "stringData": {
                ADMIN_USER_KEY: "admin",
                ADMIN_PASSWORD_KEY: password,
            }
        })
    }

    pub fn config_map_manifest(&self, namespace: &str, ini: &str) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": self.object_meta(&self.config_map_name(), namespace),
            "data": { "grafana.ini": ini }
        })
    }

    pub fn deployment_manifest(&self, namespace: &str, config_hash: &str) -> Value {
        let secret = self.admin_secret_name();
        let secret_env = |key: &str| {
            json!({
                "name": key,
                "valueFrom": { "secretKeyRef": { "name": secret, "key": key } }
            })
        };
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": self.object_meta(&self.deployment_name(), namespace),
            "spec": {
                "replicas": self.spec.replicas.unwrap_or(1),
                "selector": { "matchLabels": self.labels() },
                "template": {
                    "metadata": {
                        "labels": self.labels(),
                        "annotations": { CONFIG_HASH_ANNOTATION: config_hash }
                    },
                    "spec": {
                        "containers": [{
                            "name": "grafana",
                            "image": self.image(),
                            "args": ["--config=/etc/grafana/grafana.ini"],
                            "ports": [{ "name": "grafana-http", "containerPort": HTTP_PORT, "protocol": "TCP" }],
                            "env": [secret_env(ADMIN_USER_KEY), secret_env(ADMIN_PASSWORD_KEY)],
                            "readinessProbe": {
                                "httpGet": { "path": "/api/health", "port": HTTP_PORT },
                                "initialDelaySeconds": 5,
                                "periodSeconds": 10
                            },
                            "volumeMounts": [
                                { "name": "grafana-config", "mountPath": "/etc/grafana" },
                                { "name": "grafana-data", "mountPath": "/var/lib/grafana" }
                            ]
                        }],
                        "volumes": [
                            { "name": "grafana-config", "configMap": { "name": self.config_map_name() } },
                            { "name": "grafana-data", "emptyDir": {} }
                        ]
                    }
                }
            }
        })
    }

    pub fn service_manifest(&self, namespace: &str) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": self.object_meta(&self.service_name(), namespace),
            "spec": {
                "selector": self.labels(),
                "ports": [{ "name": "grafana", "port": HTTP_PORT, "targetPort": "grafana-http", "protocol": "TCP" }]
            }
        })
    }
}

/// Render `grafana.ini` from the operator defaults and the user's sections.
///
/// The http port is pinned because the Service and probes depend on it.
pub fn render_ini(config: &BTreeMap<String, BTreeMap<String, String>>) -> String {
    let mut sections: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::from([
        (
            "paths".to_string(),
            BTreeMap::from([("data".to_string(), "/var/lib/grafana".to_string())]),
        ),
        (
            "log".to_string(),
            BTreeMap::from([("mode".to_string(), "console".to_string())]),
        ),
    ]);
    for (section, values) in config {
        sections.entry(section.clone()).or_default().extend(values.clone());
    }
    sections
        .entry("server".to_string())
        .or_default()
        .insert("http_port".to_string(), HTTP_PORT.to_string());

    let mut ini = String::new();
    for (section, values) in &sections {
        ini.push_str(&format!("[{section}]\n"));
        for (key, value) in values {
            ini.push_str(&format!("{key} = {value}\n"));
        }
        ini.push('\n');
    }
    ini
}

fn generate_password() -> String {
    Alphanumeric.sample_string(&mut rand::rng(), 24)
}

/// Status after a successful health probe.
pub fn ready_status(previous: &GrafanaStatus, admin_url: &str, version: &str, generation: Option<i64>) -> GrafanaStatus {
    let mut status = previous.clone();
    status.stage = Some(Stage::Complete);
    status.stage_status = Some(StageStatus::Success);
    status.admin_url = Some(admin_url.to_string());
    status.version = Some(version.to_string()).filter(|v| !v.is_empty());
    status.last_message = None;
    conditions::set(
        &mut status.conditions,
        GRAFANA_READY,
        true,
        "GrafanaReady",
        "Grafana is ready to accept content",
        generation,
    );
    status
}

/// Status after a failed stage.
pub fn failed_status(previous: &GrafanaStatus, stage: Stage, message: &str, generation: Option<i64>) -> GrafanaStatus {
    let mut status = previous.clone();
    status.stage = Some(stage);
    status.stage_status = Some(StageStatus::Failed);
    status.last_message = Some(message.to_string());
    conditions::set(
        &mut status.conditions,
        GRAFANA_READY,
        false,
        "GrafanaNotReady",
        message,
        generation,
    );
    status
}

struct StageFailure {
    stage: Stage,
    error: Error,
}

trait AtStage<T> {
    fn at(self, stage: Stage) -> std::result::Result<T, StageFailure>;
}

impl<T, E: Into<Error>> AtStage<T> for std::result::Result<T, E> {
    fn at(self, stage: Stage) -> std::result::Result<T, StageFailure> {
        self.map_err(|e| StageFailure {
            stage,
            error: e.into(),
        })
    }
}

#[instrument(skip(grafana, ctx), fields(trace_id))]
pub async fn reconcile(grafana: Arc<Grafana>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = crate::telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _timer = ctx.metrics.count_and_measure("Grafana");
    ctx.diagnostics.write().await.last_event = Utc::now();
    let ns = grafana.namespace().ok_or(Error::MissingNamespace)?;
    let grafanas: Api<Grafana> = Api::namespaced(ctx.client.clone(), &ns);

    info!("Reconciling Grafana \"{}\" in {}", grafana.name_any(), ns);
    finalizer(&grafanas, FINALIZER, grafana, |event| async {
        match event {
            Finalizer::Apply(grafana) => grafana.reconcile(&ctx).await,
            Finalizer::Cleanup(grafana) => grafana.cleanup(&ctx).await,
        }
    })
    .await
    .map_err(|e| Error::FinalizerError(Box::new(e)))
}

pub fn error_policy(grafana: Arc<Grafana>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    ctx.metrics.reconcile_failure("Grafana", &grafana.name_any(), error);
    Action::requeue(ERROR_REQUEUE)
}

impl Grafana {
    // Reconcile (for non-finalizer related changes)
    async fn reconcile(&self, ctx: &Context) -> Result<Action> {
        let ns = self.namespace().ok_or(Error::MissingNamespace)?;
        let name = self.name_any();
        let generation = self.meta().generation;
        let grafanas: Api<Grafana> = Api::namespaced(ctx.client.clone(), &ns);
        let recorder = ctx.diagnostics.read().await.recorder(ctx.client.clone(), self);
        let previous = self.status.clone().unwrap_or_default();

        let admin_url = match &self.spec.external {
            Some(external) => external.url.clone(),
            None => match self.deploy(ctx, &ns).await {
                Ok(url) => url,
                Err(StageFailure { stage, error }) => {
                    let message = format!("{stage:?} stage failed: {error}");
                    recorder
                        .warn(EventAction::Deploy, EventReason::DeploymentFailed, message.clone())
                        .await?;
                    patch_status(&grafanas, &name, &failed_status(&previous, stage, &message, generation)).await?;
                    return Err(error);
                }
            },
        };

        match self.probe(ctx, &admin_url).await {
            Ok(version) => {
                if !self.is_ready() {
                    recorder
                        .info(
                            EventAction::Connect,
                            EventReason::Ready,
                            format!("Grafana {version} is reachable at {admin_url}"),
                        )
                        .await?;
                }
                let status = ready_status(&previous, &admin_url, &version, generation);
                patch_status(&grafanas, &name, &status).await?;
                Ok(Action::requeue(ctx.config.default_resync_period))
            }
            Err(e) => {
                let message = format!("health check against {admin_url} failed: {e}");
                warn!("{message}");
                if self.is_ready() {
                    recorder
                        .warn(EventAction::Connect, EventReason::NotReady, message.clone())
                        .await?;
                }
                let mut status = failed_status(&previous, Stage::Complete, &message, generation);
                status.admin_url = Some(admin_url);
                patch_status(&grafanas, &name, &status).await?;
                Ok(Action::requeue(ERROR_REQUEUE))
            }
        }
    }

    /// Roll out the managed instance and return its url.
    async fn deploy(&self, ctx: &Context, ns: &str) -> std::result::Result<String, StageFailure> {
        let ps = PatchParams::apply(FIELD_MANAGER).force();

        let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), ns);
        let secret_name = self.admin_secret_name();
        if secrets.get_opt(&secret_name).await.at(Stage::AdminUser)?.is_none() {
            info!("Generating admin credentials {secret_name}");
            let secret: Secret = serde_json::from_value(self.admin_secret_manifest(ns, &generate_password()))
                .at(Stage::AdminUser)?;
            secrets
                .create(&PostParams::default(), &secret)
                .await
                .at(Stage::AdminUser)?;
        }

        let ini = render_ini(&self.spec.config);
        let config_maps: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), ns);
        config_maps
            .patch(&self.config_map_name(), &ps, &Patch::Apply(self.config_map_manifest(ns, &ini)))
            .await
            .at(Stage::Config)?;

        let config_hash = content_hash(&ini).at(Stage::Deployment)?;
        let deployments: Api<Deployment> = Api::namespaced(ctx.client.clone(), ns);
        deployments
            .patch(
                &self.deployment_name(),
                &ps,
                &Patch::Apply(self.deployment_manifest(ns, &config_hash)),
            )
            .await
            .at(Stage::Deployment)?;

        let services: Api<Service> = Api::namespaced(ctx.client.clone(), ns);
        services
            .patch(&self.service_name(), &ps, &Patch::Apply(self.service_manifest(ns)))
            .await
            .at(Stage::Service)?;

        Ok(self.service_url(ns))
    }

    /// Query `/api/health` and return the reported version.
    async fn probe(&self, ctx: &Context, admin_url: &str) -> Result<String> {
        let credentials = self.credentials(&ctx.client).await?;
        let client = GrafanaClient::new(
            admin_url,
            credentials,
            self.client_timeout(ctx.config.http_timeout),
            self.insecure_skip_verify(),
        )?;
        Ok(client.health().await?.version)
    }

    // Finalizer cleanup; owned resources are garbage collected
    async fn cleanup(&self, ctx: &Context) -> Result<Action> {
        let recorder = ctx.diagnostics.read().await.recorder(ctx.client.clone(), self);
        recorder
            .info(
                EventAction::Cleanup,
                EventReason::DeleteRequested,
                format!("Deleting `{}`", self.name_any()),
            )
            .await?;
        Ok(Action::await_change())
    }
}

async fn patch_status(api: &Api<Grafana>, name: &str, status: &GrafanaStatus) -> Result<()> {
    let patch = Patch::Apply(json!({
        "apiVersion": "grafana.integreatly.org/v1beta1",
        "kind": "Grafana",
        "status": status,
    }));
    api.patch_status(name, &PatchParams::apply(FIELD_MANAGER).force(), &patch)
        .await?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fixtures::timeout_after_1s;

    #[test]
    fn readiness_needs_complete_success_and_url() {
        let grafana = Grafana::test();
        assert!(!grafana.is_ready());
        let ready = Grafana::test().ready("http://grafana:3000");
        assert!(ready.is_ready());
        assert_eq!(ready.admin_url(), Some("http://grafana:3000"));

        let mut failed = ready.clone();
        failed.status.as_mut().unwrap().stage_status = Some(StageStatus::Failed);
        assert!(!failed.is_ready());
        let mut deploying = ready.clone();
        deploying.status.as_mut().unwrap().stage = Some(Stage::Deployment);
        assert!(!deploying.is_ready());
    }

    #[test]
    fn ini_pins_port_and_merges_sections() {
        let config = BTreeMap::from([
            (
                "server".to_string(),
                BTreeMap::from([
                    ("http_port".to_string(), "8080".to_string()),
                    ("root_url".to_string(), "https://grafana.example.com".to_string()),
                ]),
            ),
            (
                "auth".to_string(),
                BTreeMap::from([("disable_login_form".to_string(), "false".to_string())]),
            ),
        ]);
        let ini = render_ini(&config);
        assert!(ini.starts_with("[auth]\ndisable_login_form = false\n"));
        assert!(ini.contains("[server]\nhttp_port = 3000\nroot_url = https://grafana.example.com\n"));
        assert!(ini.contains("[paths]\ndata = /var/lib/grafana\n"));
        assert!(!ini.contains("8080"));
    }

    #[test]
    fn image_follows_version() {
        let mut grafana = Grafana::test();
        assert_eq!(grafana.image(), format!("docker.io/grafana/grafana:{DEFAULT_VERSION}"));
        grafana.spec.version = Some("10.4.2".into());
        assert_eq!(grafana.image(), "docker.io/grafana/grafana:10.4.2");
        grafana.spec.image = Some("registry.local/grafana:custom".into());
        assert_eq!(grafana.image(), "registry.local/grafana:custom");
    }

    #[test]
    fn deployment_carries_hash_probe_and_admin_env() {
        let grafana = Grafana::test();
        let manifest = grafana.deployment_manifest("default", "abc123");
        let template = &manifest["spec"]["template"];
        assert_eq!(template["metadata"]["annotations"][CONFIG_HASH_ANNOTATION], "abc123");
        let container = &template["spec"]["containers"][0];
        assert_eq!(container["readinessProbe"]["httpGet"]["path"], "/api/health");
        assert_eq!(container["env"][0]["valueFrom"]["secretKeyRef"]["name"], "test-admin-credentials");
        assert_eq!(container["env"][1]["name"], ADMIN_PASSWORD_KEY);
        assert_eq!(template["spec"]["volumes"][0]["configMap"]["name"], "test-ini");
        assert_eq!(manifest["spec"]["replicas"], 1);
        assert_eq!(grafana.service_url("monitoring"), "http://test-service.monitoring:3000");
    }

    #[test]
    fn generated_manifests_deserialize() {
        let grafana = Grafana::test();
        let secret: Secret = serde_json::from_value(grafana.admin_secret_manifest("default", "pw")).unwrap();
        assert_eq!(secret.string_data.unwrap()[ADMIN_PASSWORD_KEY], "pw");
        let _: Deployment = serde_json::from_value(grafana.deployment_manifest("default", "h")).unwrap();
        let _: Service = serde_json::from_value(grafana.service_manifest("default")).unwrap();
        let _: ConfigMap = serde_json::from_value(grafana.config_map_manifest("default", "[server]\n")).unwrap();
    }

    #[test]
    fn passwords_are_random() {
        let a = generate_password();
        assert_eq!(a.len(), 24);
        assert_ne!(a, generate_password());
    }

    #[test]
    fn status_transitions() {
        let failed = failed_status(&GrafanaStatus::default(), Stage::Config, "boom", Some(1));
        assert_eq!(failed.stage, Some(Stage::Config));
        assert_eq!(failed.stage_status, Some(StageStatus::Failed));
        assert!(!conditions::is_true(&failed.conditions, GRAFANA_READY));

        let ready = ready_status(&failed, "http://g:3000", "11.3.0", Some(2));
        assert_eq!(ready.stage, Some(Stage::Complete));
        assert_eq!(ready.stage_status, Some(StageStatus::Success));
        assert_eq!(ready.last_message, None);
        assert_eq!(ready.version.as_deref(), Some("11.3.0"));
        assert!(conditions::is_true(&ready.conditions, GRAFANA_READY));
        assert_eq!(ready.conditions.len(), 1);
    }

    #[test]
    fn stage_serialization() {
        assert_eq!(serde_json::to_value(Stage::AdminUser).unwrap(), "adminUser");
        assert_eq!(serde_json::to_value(StageStatus::Success).unwrap(), "success");
    }

    #[test]
    fn client_settings() {
        let mut grafana = Grafana::test();
        assert_eq!(grafana.client_timeout(Duration::from_secs(10)), Duration::from_secs(10));
        assert!(!grafana.insecure_skip_verify());
        grafana.spec.client = Some(GrafanaClientSettings {
            timeout_seconds: Some(3),
        });
        grafana.spec.external = Some(ExternalGrafana {
            url: "https://grafana.example.com".into(),
            tls: Some(TlsSettings {
                insecure_skip_verify: true,
            }),
            ..Default::default()
        });
        assert_eq!(grafana.client_timeout(Duration::from_secs(10)), Duration::from_secs(3));
        assert!(grafana.insecure_skip_verify());
    }

    #[tokio::test]
    async fn external_without_secrets_is_anonymous() {
        let (ctx, _handle) = Context::test();
        let mut grafana = Grafana::test();
        grafana.spec.external = Some(ExternalGrafana {
            url: "http://grafana:3000".into(),
            ..Default::default()
        });
        let credentials = timeout_after_1s(grafana.credentials(&ctx.client)).await.unwrap();
        assert_eq!(credentials, Credentials::Anonymous);
    }
}
