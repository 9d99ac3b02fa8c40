//! The apply/cleanup driver shared by every content kind.
//!
//! A content resource is synchronized into every ready `Grafana` instance its selector
//! matches. The driver keeps the per-instance bookkeeping in the resource's own status so a
//! partial failure, a selector change or a deletion can always be retried from there.

use crate::client::{GrafanaClient, GrafanaError};
use crate::config::FIELD_MANAGER;
use crate::controllers::common::{content_hash, resync_period, GrafanaCommonSpec, GrafanaCommonStatus};
use crate::controllers::conditions::{self, INVALID_SPEC, NO_MATCHING_INSTANCE};
use crate::controllers::event_recorder::{EventAction, EventReason};
use crate::controllers::grafana::Grafana;
use crate::controllers::instances::{self, instance_key};
use crate::controllers::FINALIZER;
use crate::{Context, Error, Result, ERROR_REQUEUE};
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, Patch, PatchParams, ResourceExt};
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{finalizer, Event as Finalizer};
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tracing::*;

/// What a resource wants to exist inside each instance.
#[derive(Clone, Debug, PartialEq)]
pub struct Desired<M> {
    /// Identity of the object inside Grafana.
    pub uid: String,
    pub hash: String,
    pub model: M,
}

impl<M: Serialize> Desired<M> {
    pub fn new(uid: impl Into<String>, model: M) -> Result<Self> {
        Ok(Self {
            uid: uid.into(),
            hash: content_hash(&model)?,
            model,
        })
    }
}

/// A custom resource that is mirrored into Grafana instances.
#[async_trait]
pub trait GrafanaContent:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Kind name used in condition types, events and metrics, e.g. `Dashboard`.
    const KIND: &'static str;

    /// The payload sent to Grafana. It also feeds the content hash, so it must carry every
    /// input that affects the write.
    type Model: Serialize + Send + Sync;

    fn common_spec(&self) -> &GrafanaCommonSpec;

    fn common_status(&self) -> Option<&GrafanaCommonStatus>;

    /// A uid the user pinned in the spec. Such a uid may never change.
    fn spec_uid(&self) -> Option<&str> {
        None
    }

    /// Resolve references and build the desired object. Spec problems are `Error::InvalidSpec`.
    async fn desired(&self, ctx: &Context) -> Result<Desired<Self::Model>>;

    /// Whether the object still exists on an instance.
    async fn is_present(&self, client: &GrafanaClient, desired: &Desired<Self::Model>) -> Result<bool, GrafanaError>;

    /// Create or overwrite the object on one instance.
    async fn apply(
        &self,
        ctx: &Context,
        grafana: &Grafana,
        client: &GrafanaClient,
        desired: &Desired<Self::Model>,
    ) -> Result<()>;

    /// Remove the object with `uid` from one instance. Absent objects are not an error.
    async fn remove(&self, client: &GrafanaClient, uid: &str) -> Result<(), GrafanaError>;
}

/// The uid of the resource itself, used when nothing more specific is given.
pub fn resource_uid<K: Resource>(obj: &K) -> String {
    obj.meta().uid.clone().unwrap_or_else(|| obj.name_any())
}

#[instrument(skip(obj, ctx), fields(kind = K::KIND, trace_id))]
pub async fn reconcile<K: GrafanaContent>(obj: Arc<K>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = crate::telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _timer = ctx.metrics.count_and_measure(K::KIND);
    ctx.diagnostics.write().await.last_event = Utc::now();
    let ns = obj.namespace().ok_or(Error::MissingNamespace)?;
    let api: Api<K> = Api::namespaced(ctx.client.clone(), &ns);

    info!("Reconciling {} \"{}\" in {}", K::KIND, obj.name_any(), ns);
    finalizer(&api, FINALIZER, obj, |event| async {
        match event {
            Finalizer::Apply(obj) => apply_all(obj.as_ref(), &ctx).await,
            Finalizer::Cleanup(obj) => cleanup_all(obj.as_ref(), &ctx).await,
        }
    })
    .await
    .map_err(|e| Error::FinalizerError(Box::new(e)))
}

pub fn error_policy<K: GrafanaContent>(obj: Arc<K>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    ctx.metrics.reconcile_failure(K::KIND, &obj.name_any(), error);
    Action::requeue(ERROR_REQUEUE)
}

fn requeue_after(period: Option<Duration>) -> Action {
    period.map_or_else(Action::await_change, Action::requeue)
}

async fn patch_status<K: GrafanaContent>(api: &Api<K>, name: &str, status: &GrafanaCommonStatus) -> Result<()> {
    let patch = Patch::Apply(json!({
        "apiVersion": K::api_version(&()),
        "kind": K::kind(&()),
        "status": status,
    }));
    let ps = PatchParams::apply(FIELD_MANAGER).force();
    api.patch_status(name, &ps, &patch).await?;
    Ok(())
}

/// A spec problem found before any instance was touched.
struct Rejection {
    reason: &'static str,
    message: String,
}

impl From<String> for Rejection {
    fn from(message: String) -> Self {
        Rejection {
            reason: conditions::REASON_INVALID,
            message,
        }
    }
}

/// Everything that can be checked without talking to Grafana.
async fn prepare<K: GrafanaContent>(
    obj: &K,
    ctx: &Context,
    previous: &GrafanaCommonStatus,
) -> Result<Result<(Option<Duration>, Desired<K::Model>), Rejection>> {
    let spec = obj.common_spec();
    let checks = || -> Result<Option<Duration>> {
        let period = resync_period(spec, ctx.config.default_resync_period)?;
        instances::selector_query(&spec.instance_selector)?;
        Ok(period)
    };
    let period = match checks() {
        Ok(period) => period,
        Err(Error::InvalidSpec(message)) => return Ok(Err(message.into())),
        Err(e) => return Err(e),
    };
    if let (Some(explicit), Some(recorded)) = (obj.spec_uid(), previous.uid.as_deref()) {
        if explicit != recorded {
            return Ok(Err(Rejection {
                reason: conditions::REASON_UID_CHANGED,
                message: format!("spec.uid is immutable: it was {recorded}, now {explicit}"),
            }));
        }
    }
    match obj.desired(ctx).await {
        Ok(desired) => Ok(Ok((period, desired))),
        Err(Error::InvalidSpec(message)) => Ok(Err(message.into())),
        Err(e) => Err(e),
    }
}

/// Record an invalid spec and wait for the user to fix it.
async fn reject<K: GrafanaContent>(
    obj: &K,
    ctx: &Context,
    api: &Api<K>,
    previous: &GrafanaCommonStatus,
    rejection: Rejection,
) -> Result<Action> {
    let name = obj.name_any();
    warn!("{} {} is invalid: {}", K::KIND, name, rejection.message);
    let already_reported = conditions::find(&previous.conditions, INVALID_SPEC)
        .is_some_and(|c| c.status == "True" && c.message == rejection.message);
    if !already_reported {
        let recorder = ctx.diagnostics.read().await.recorder(ctx.client.clone(), obj);
        recorder
            .warn(EventAction::Apply, EventReason::InvalidSpec, rejection.message.clone())
            .await?;
    }

    let mut status = previous.clone();
    conditions::set(
        &mut status.conditions,
        INVALID_SPEC,
        true,
        rejection.reason,
        rejection.message,
        obj.meta().generation,
    );
    conditions::remove(&mut status.conditions, NO_MATCHING_INSTANCE);
    conditions::remove(&mut status.conditions, &conditions::synchronized(K::KIND));
    status.observed_generation = obj.meta().generation;
    patch_status(api, &name, &status).await?;

    let period = resync_period(obj.common_spec(), ctx.config.default_resync_period)
        .unwrap_or(Some(ctx.config.default_resync_period));
    Ok(requeue_after(period))
}

/// Every uid the object may exist under on a recorded instance, current one first.
fn recorded_uids(status: &GrafanaCommonStatus) -> Vec<String> {
    let mut uids: Vec<String> = status.uid.iter().cloned().collect();
    for stale in &status.stale_uids {
        if !uids.contains(stale) {
            uids.push(stale.clone());
        }
    }
    uids
}

/// Remove `uids` from the instance behind `key`.
///
/// Instances that are gone, being deleted or not ready are skipped: there is nothing to
/// clean up that could be reached.
async fn remove_from_instance<K: GrafanaContent>(obj: &K, ctx: &Context, key: &str, uids: &[String]) -> Result<()> {
    let Some(grafana) = instances::lookup(ctx, key).await? else {
        debug!("instance {key} no longer exists");
        return Ok(());
    };
    if grafana.meta().deletion_timestamp.is_some() || !grafana.is_ready() {
        debug!("skipping removal from instance {key}, it is not ready");
        return Ok(());
    }
    let client = instances::client_for(ctx, &grafana).await?;
    for uid in uids {
        obj.remove(&client, uid).await?;
    }
    Ok(())
}

/// Apply to one instance; `Ok(false)` when nothing had to be written.
async fn apply_to_instance<K: GrafanaContent>(
    obj: &K,
    ctx: &Context,
    grafana: &Grafana,
    desired: &Desired<K::Model>,
    previous: &GrafanaCommonStatus,
) -> Result<bool> {
    let key = instance_key(grafana);
    let client = instances::client_for(ctx, grafana).await?;
    let recorded = previous.instances.contains(&key);

    if recorded {
        for old in recorded_uids(previous).iter().filter(|old| **old != desired.uid) {
            info!("uid of {} {} moved from {old} to {}", K::KIND, obj.name_any(), desired.uid);
            obj.remove(&client, old).await?;
        }
    }

    let unchanged = recorded
        && previous.stale_uids.is_empty()
        && previous.uid.as_deref() == Some(desired.uid.as_str())
        && previous.hash.as_deref() == Some(desired.hash.as_str());
    if unchanged && obj.is_present(&client, desired).await? {
        debug!("{} {} is up to date on {key}", K::KIND, obj.name_any());
        return Ok(false);
    }

    obj.apply(ctx, grafana, &client, desired).await?;
    Ok(true)
}

/// Outcome of one pass over all instances.
#[derive(Debug, Default, PartialEq)]
pub struct Outcome {
    /// Instances the object now lives on.
    pub applied: Vec<String>,
    /// Instances that still (may) hold the object although the pass failed for them.
    pub retained: Vec<String>,
    pub errors: BTreeMap<String, String>,
    pub written: usize,
    /// Number of instances that were selected.
    pub selected: usize,
    /// Number of instances acted on, including stale ones.
    pub touched: usize,
}

impl Outcome {
    pub fn instances(&self) -> Vec<String> {
        self.applied
            .iter()
            .chain(self.retained.iter())
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn message(&self, kind: &str) -> String {
        if self.errors.is_empty() {
            return format!("{kind} was successfully applied to {} instances", self.selected);
        }
        let details: Vec<String> = self.errors.iter().map(|(k, e)| format!("- {k}: {e}")).collect();
        format!(
            "{kind} failed to be applied for {} out of {} instances. Errors:\n{}",
            self.errors.len(),
            self.touched,
            details.join("\n")
        )
    }
}

/// Compute the status after a pass from the previous status and the outcome.
pub fn next_status(
    kind: &str,
    previous: &GrafanaCommonStatus,
    desired_uid: &str,
    desired_hash: &str,
    outcome: &Outcome,
    generation: Option<i64>,
) -> GrafanaCommonStatus {
    let mut status = previous.clone();
    let succeeded = outcome.errors.is_empty();
    status.instances = outcome.instances();
    status.observed_generation = generation;
    status.last_resync = Some(Time(Utc::now()));
    // the new uid is tracked as soon as any instance may hold it
    if succeeded || !outcome.applied.is_empty() || previous.uid.is_none() {
        status.uid = Some(desired_uid.to_string());
    }
    status.stale_uids = if succeeded {
        vec![]
    } else {
        recorded_uids(previous)
            .into_iter()
            .filter(|uid| status.uid.as_ref() != Some(uid))
            .collect()
    };
    if succeeded {
        status.hash = Some(desired_hash.to_string());
    }
    conditions::remove(&mut status.conditions, INVALID_SPEC);

    let synchronized = conditions::synchronized(kind);
    if outcome.selected == 0 && succeeded {
        status.no_matching_instances = true;
        conditions::remove(&mut status.conditions, &synchronized);
        conditions::set(
            &mut status.conditions,
            NO_MATCHING_INSTANCE,
            true,
            conditions::REASON_NO_INSTANCES,
            "No ready Grafana instance matches the instanceSelector",
            generation,
        );
        return status;
    }

    status.no_matching_instances = outcome.selected == 0;
    conditions::remove(&mut status.conditions, NO_MATCHING_INSTANCE);
    let reason = if succeeded {
        conditions::REASON_APPLY_SUCCESSFUL
    } else {
        conditions::REASON_APPLY_FAILED
    };
    conditions::set(
        &mut status.conditions,
        &synchronized,
        succeeded,
        reason,
        outcome.message(kind),
        generation,
    );
    status
}

async fn apply_all<K: GrafanaContent>(obj: &K, ctx: &Context) -> Result<Action> {
    let ns = obj.namespace().ok_or(Error::MissingNamespace)?;
    let name = obj.name_any();
    let api: Api<K> = Api::namespaced(ctx.client.clone(), &ns);
    let previous = obj.common_status().cloned().unwrap_or_default();

    let (period, desired) = match prepare(obj, ctx, &previous).await? {
        Ok(prepared) => prepared,
        Err(rejection) => return reject(obj, ctx, &api, &previous, rejection).await,
    };

    let selected = instances::select(ctx, &ns, obj.common_spec()).await?;
    let selected_keys: BTreeSet<String> = selected.iter().map(instance_key).collect();
    let mut outcome = Outcome {
        selected: selected.len(),
        touched: selected.len(),
        ..Default::default()
    };

    for grafana in &selected {
        let key = instance_key(grafana);
        match apply_to_instance(obj, ctx, grafana, &desired, &previous).await {
            Ok(written) => {
                outcome.written += usize::from(written);
                outcome.applied.push(key);
            }
            Err(e) => {
                warn!("failed to apply {} {} to {key}: {e}", K::KIND, name);
                if previous.instances.contains(&key) {
                    outcome.retained.push(key.clone());
                }
                outcome.errors.insert(key, e.to_string());
            }
        }
    }

    let mut stale_uids = recorded_uids(&previous);
    if stale_uids.is_empty() {
        stale_uids.push(desired.uid.clone());
    }
    for key in previous.instances.iter().filter(|k| !selected_keys.contains(*k)) {
        outcome.touched += 1;
        if let Err(e) = remove_from_instance(obj, ctx, key, &stale_uids).await {
            warn!("failed to remove {} {} from {key}: {e}", K::KIND, name);
            outcome.retained.push(key.clone());
            outcome.errors.insert(key.clone(), e.to_string());
        } else {
            info!("removed {} {} from unselected instance {key}", K::KIND, name);
        }
    }

    let status = next_status(
        K::KIND,
        &previous,
        &desired.uid,
        &desired.hash,
        &outcome,
        obj.meta().generation,
    );

    let recorder = ctx.diagnostics.read().await.recorder(ctx.client.clone(), obj);
    if !outcome.errors.is_empty() {
        recorder
            .warn(EventAction::Apply, EventReason::ApplyFailed, outcome.message(K::KIND))
            .await?;
    } else if outcome.written > 0 {
        recorder
            .info(
                EventAction::Apply,
                EventReason::Synchronized,
                format!("Applied to {} of {} instances", outcome.written, outcome.selected),
            )
            .await?;
    }
    patch_status(&api, &name, &status).await?;

    if outcome.errors.is_empty() {
        Ok(requeue_after(period))
    } else {
        Err(Error::ApplyFailed {
            kind: K::KIND,
            failed: outcome.errors.len(),
            total: outcome.touched,
        })
    }
}

async fn cleanup_all<K: GrafanaContent>(obj: &K, ctx: &Context) -> Result<Action> {
    let name = obj.name_any();
    let status = obj.common_status().cloned().unwrap_or_default();
    let recorder = ctx.diagnostics.read().await.recorder(ctx.client.clone(), obj);
    recorder
        .info(
            EventAction::Cleanup,
            EventReason::DeleteRequested,
            format!("Removing `{name}` from {} instances", status.instances.len()),
        )
        .await?;

    let uids = recorded_uids(&status);
    if uids.is_empty() {
        return Ok(Action::await_change());
    }
    let mut failures = Vec::new();
    for key in &status.instances {
        if let Err(e) = remove_from_instance(obj, ctx, key, &uids).await {
            warn!("failed to remove {} {name} from {key}: {e}", K::KIND);
            failures.push(format!("{key}: {e}"));
        }
    }
    if !failures.is_empty() {
        let message = failures.join("; ");
        recorder
            .warn(EventAction::Cleanup, EventReason::CleanupFailed, message.clone())
            .await?;
        return Err(Error::CleanupFailed(message));
    }
    Ok(Action::await_change())
}
