//! # grafana-operator - core code
//!
//! This crate contains the controller logic sans the API code. For API code, see
//! [`main.rs`](main.rs).

#![forbid(unsafe_code)]

use thiserror::Error;

/// Expose all controller components used by main
pub mod controllers;

/// Operator configuration read from the environment
pub mod config;
pub use config::OperatorConfig;

/// Typed HTTP client for the Grafana API
pub mod client;

/// Go-style duration strings
pub mod duration;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;
pub use metrics::Metrics;

#[cfg(test)]
pub mod fixtures;

use crate::client::GrafanaError;
use crate::controllers::alert_rule_group::GrafanaAlertRuleGroup;
use crate::controllers::contact_point::GrafanaContactPoint;
use crate::controllers::dashboard::GrafanaDashboard;
use crate::controllers::datasource::GrafanaDatasource;
use crate::controllers::event_recorder::EventRecorder;
use crate::controllers::folder::GrafanaFolder;
use crate::controllers::library_panel::GrafanaLibraryPanel;
use crate::controllers::mute_timing::GrafanaMuteTiming;
use crate::controllers::notification_policy::GrafanaNotificationPolicy;
use crate::controllers::notification_template::GrafanaNotificationTemplate;
use crate::controllers::secrets::SecretError;
use crate::controllers::service_account::GrafanaServiceAccount;
use crate::controllers::sync::{self, GrafanaContent};
use crate::controllers::{grafana, service_account};
use chrono::{DateTime, Utc};
pub use controllers::grafana::Grafana;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::NamespaceResourceScope;
use kube::api::ListParams;
use kube::runtime::events::{Recorder, Reporter};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config;
use kube::runtime::Controller;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info};

// Context for our reconcilers
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
    /// Operator-wide settings
    pub config: OperatorConfig,
    /// Client for fetching remote dashboard content
    pub http: reqwest::Client,
}

impl Context {
    /// An API handle for a namespaced kind, scoped to the watch namespace when one is configured.
    pub fn watched_api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        match &self.config.watch_namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

/// State shared between the controller and the web server
#[derive(Clone, Default)]
pub struct State {
    /// Diagnostics populated by the reconciler
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    registry: prometheus::Registry,
}

/// State wrapper around the controller outputs for the web server
impl State {
    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    // Create a Controller Context that can update State
    pub fn to_context(&self, client: Client, config: OperatorConfig) -> Result<Arc<Context>> {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent())
            .timeout(config.http_timeout)
            .build()
            .map_err(Error::FetchError)?;
        Ok(Arc::new(Context {
            client,
            metrics: Metrics::default().register(&self.registry)?,
            diagnostics: self.diagnostics.clone(),
            config,
            http,
        }))
    }
}

async fn ensure_crd_installed<K>(api: &Api<K>) -> bool
where
    K: Resource + Clone + DeserializeOwned + Debug,
    <K as Resource>::DynamicType: Default,
{
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!(
            "{} CRD is not queryable; {e:?}. Is the CRD installed?",
            K::kind(&Default::default())
        );
        info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
        return false;
    }
    true
}

/// Build the controller for one content kind.
///
/// Every change to a `Grafana` instance retriggers all objects of the kind, so content lands on
/// instances as soon as they become ready.
fn content_controller<K>(ctx: Arc<Context>) -> BoxFuture<'static, ()>
where
    K: GrafanaContent,
{
    let controller = Controller::new(ctx.watched_api::<K>(), Config::default().any_semantic());
    let store = controller.store();
    controller
        .watches(
            ctx.watched_api::<Grafana>(),
            Config::default().any_semantic(),
            move |_grafana| {
                store
                    .state()
                    .into_iter()
                    .map(|obj| ObjectRef::from_obj(obj.as_ref()))
                    .collect::<Vec<_>>()
            },
        )
        .shutdown_on_signal()
        .run(sync::reconcile::<K>, sync::error_policy::<K>, ctx)
        .filter_map(|x| async move { Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .boxed()
}

/// Initialize the controllers and shared state (given the crds are installed)
pub async fn run(state: State, config: OperatorConfig) {
    let client = Client::try_default().await.expect("failed to create kube Client");
    let context = match state.to_context(client, config) {
        Ok(context) => context,
        Err(e) => {
            error!("Failed to create controller context: {e}");
            std::process::exit(1);
        }
    };

    let grafanas = context.watched_api::<Grafana>();
    let service_accounts = context.watched_api::<GrafanaServiceAccount>();
    let installed = ensure_crd_installed(&grafanas).await
        && ensure_crd_installed(&service_accounts).await
        && ensure_crd_installed(&context.watched_api::<GrafanaFolder>()).await
        && ensure_crd_installed(&context.watched_api::<GrafanaDashboard>()).await
        && ensure_crd_installed(&context.watched_api::<GrafanaDatasource>()).await
        && ensure_crd_installed(&context.watched_api::<GrafanaLibraryPanel>()).await
        && ensure_crd_installed(&context.watched_api::<GrafanaAlertRuleGroup>()).await
        && ensure_crd_installed(&context.watched_api::<GrafanaContactPoint>()).await
        && ensure_crd_installed(&context.watched_api::<GrafanaNotificationPolicy>()).await
        && ensure_crd_installed(&context.watched_api::<GrafanaNotificationTemplate>()).await
        && ensure_crd_installed(&context.watched_api::<GrafanaMuteTiming>()).await;
    if !installed {
        std::process::exit(1);
    }

    let instances = Controller::new(grafanas, Config::default().any_semantic())
        .shutdown_on_signal()
        .run(grafana::reconcile, grafana::error_policy, context.clone())
        .filter_map(|x| async move { Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .boxed();

    let accounts = Controller::new(service_accounts, Config::default().any_semantic())
        .owns(context.watched_api::<Secret>(), Config::default().any_semantic())
        .shutdown_on_signal()
        .run(
            service_account::reconcile,
            service_account::error_policy,
            context.clone(),
        )
        .filter_map(|x| async move { Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .boxed();

    futures::future::join_all(vec![
        instances,
        accounts,
        content_controller::<GrafanaFolder>(context.clone()),
        content_controller::<GrafanaDashboard>(context.clone()),
        content_controller::<GrafanaDatasource>(context.clone()),
        content_controller::<GrafanaLibraryPanel>(context.clone()),
        content_controller::<GrafanaAlertRuleGroup>(context.clone()),
        content_controller::<GrafanaContactPoint>(context.clone()),
        content_controller::<GrafanaNotificationPolicy>(context.clone()),
        content_controller::<GrafanaNotificationTemplate>(context.clone()),
        content_controller::<GrafanaMuteTiming>(context),
    ])
    .await;
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: "grafana-operator".into(),
        }
    }
}

impl Diagnostics {
    pub fn recorder<K>(&self, client: Client, obj: &K) -> EventRecorder
    where
        K: Resource<DynamicType = ()>,
    {
        Recorder::new(client, self.reporter.clone(), obj.object_ref(&())).into()
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Kubernetes API Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Finalizer Error: {0}")]
    // NB: awkward type because finalizer::Error embeds the reconciler error (which is this)
    // so boxing this error to break cycles
    FinalizerError(#[from] Box<kube::runtime::finalizer::Error<Error>>),

    #[error("Grafana API Error: {0}")]
    GrafanaError(#[from] GrafanaError),

    #[error("Reference Error: {0}")]
    SecretError(#[from] SecretError),

    #[error("Content fetch failed: {0}")]
    FetchError(#[source] reqwest::Error),

    #[error("Metrics registration failed: {0}")]
    MetricsError(#[from] prometheus::Error),

    #[error("InvalidSpec: {0}")]
    InvalidSpec(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("ApplyFailed: {kind} failed on {failed} of {total} instances")]
    ApplyFailed {
        kind: &'static str,
        failed: usize,
        total: usize,
    },

    #[error("CleanupFailed: {0}")]
    CleanupFailed(String),

    #[error("MissingNamespace")]
    MissingNamespace,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> String {
        match self {
            Error::ApplyFailed { .. } => "applyfailed".to_string(),
            Error::FinalizerError(inner) => match inner.as_ref() {
                kube::runtime::finalizer::Error::ApplyFailed(e) => format!("apply/{}", e.metric_label()),
                kube::runtime::finalizer::Error::CleanupFailed(e) => {
                    format!("cleanup/{}", e.metric_label())
                }
                other => format!("finalizer/{other:?}").to_lowercase(),
            },
            other => {
                let label = format!("{other:?}");
                label
                    .split(['(', ' ', '{'])
                    .next()
                    .unwrap_or_default()
                    .to_lowercase()
            }
        }
    }
}

/// How long to wait before retrying an object that failed to reconcile.
pub(crate) const ERROR_REQUEUE: Duration = Duration::from_secs(30);
