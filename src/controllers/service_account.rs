//! Grafana service accounts and their tokens.
//!
//! Unlike the content kinds, a service account lives on exactly one instance, named by
//! `spec.instanceName` in the resource's namespace. Token keys are only returned by Grafana
//! once, so each key is stored in a `Secret` owned by the resource. A token whose `Secret`
//! went missing is revoked and issued again.

use crate::client::{GrafanaClient, GrafanaError};
use crate::config::FIELD_MANAGER;
use crate::controllers::conditions::{self, NO_MATCHING_INSTANCE};
use crate::controllers::event_recorder::{EventAction, EventReason, EventRecorder};
use crate::controllers::grafana::Grafana;
use crate::controllers::instances::{self, instance_key};
use crate::controllers::FINALIZER;
use crate::duration::parse_duration;
use crate::{Context, Error, Result, ERROR_REQUEUE};
use chrono::Utc;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, ObjectMeta};
use k8s_openapi::ByteString;
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, ResourceExt},
    runtime::{
        controller::Action,
        finalizer::{finalizer, Event as Finalizer},
    },
    CustomResource, Resource,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::*;

const KIND: &str = "ServiceAccount";
const SERVICE_ACCOUNTS: &str = "/api/serviceaccounts";

/// Key of the token inside its `Secret`.
pub const TOKEN_KEY: &str = "token";

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "GrafanaServiceAccount",
    group = "grafana.integreatly.org",
    version = "v1beta1",
    singular = "grafanaserviceaccount",
    plural = "grafanaserviceaccounts",
    shortname = "gsa",
    namespaced
)]
#[kube(status = "GrafanaServiceAccountStatus")]
#[kube(printcolumn = r#"{"name":"Instance","type":"string","jsonPath":".spec.instanceName"}"#)]
#[kube(printcolumn = r#"{"name":"Role","type":"string","jsonPath":".spec.role"}"#)]
#[kube(printcolumn = r#"{"name":"Account","type":"integer","jsonPath":".status.account.id"}"#)]
#[serde(rename_all = "camelCase")]
pub struct GrafanaServiceAccountSpec {
    /// Name of the `Grafana` instance in the same namespace.
    pub instance_name: String,
    /// Account name in Grafana, defaults to the resource name.
    pub name: Option<String>,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub is_disabled: bool,
    #[serde(default)]
    pub tokens: Vec<TokenSpec>,
    /// How often to re-check the account, e.g. `10m`. `0s` disables periodic resyncs.
    pub resync_period: Option<String>,
}

/// Organization role of the account.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum Role {
    #[default]
    Viewer,
    Editor,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Viewer => "Viewer",
            Role::Editor => "Editor",
            Role::Admin => "Admin",
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TokenSpec {
    pub name: String,
    /// Lifetime of the token, e.g. `720h`. Tokens never expire when unset.
    pub expires_in: Option<String>,
    /// Secret receiving the key, defaults to `<resource>-<token>`.
    pub secret_name: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GrafanaServiceAccountStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub account: Option<AccountStatus>,
    #[serde(default)]
    pub tokens: Vec<TokenStatus>,
    pub observed_generation: Option<i64>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AccountStatus {
    /// The instance (`namespace/name`) holding the account.
    pub instance: String,
    pub id: i64,
    pub login: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TokenStatus {
    pub name: String,
    pub id: i64,
    /// Name of the `Secret` holding the key.
    pub secret: String,
}

/// An account as Grafana reports it.
#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AccountInfo {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub login: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub is_disabled: bool,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct TokenInfo {
    pub id: i64,
    pub name: String,
}

#[derive(Deserialize)]
struct CreatedToken {
    id: i64,
    key: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResult {
    #[serde(default)]
    service_accounts: Vec<AccountInfo>,
}

/// What has to happen to the tokens of an account.
#[derive(Debug, Default, PartialEq)]
pub struct TokenPlan {
    /// Recorded tokens that are still intact.
    pub keep: Vec<TokenStatus>,
    /// Declared tokens that must be issued.
    pub issue: Vec<TokenSpec>,
    /// Grafana tokens to revoke.
    pub revoke: Vec<TokenInfo>,
    /// Secrets of tokens that are no longer declared.
    pub orphaned_secrets: Vec<String>,
}

impl GrafanaServiceAccount {
    pub fn account_name(&self) -> String {
        self.spec.name.clone().unwrap_or_else(|| self.name_any())
    }

    pub fn secret_name(&self, token: &TokenSpec) -> String {
        token
            .secret_name
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.name_any(), token.name))
    }

    fn account_body(&self) -> Value {
        json!({
            "name": self.account_name(),
            "role": self.spec.role.as_str(),
            "isDisabled": self.spec.is_disabled,
        })
    }

    /// Whether the account in Grafana differs from the spec.
    pub fn drifted(&self, current: &AccountInfo) -> bool {
        current.name != self.account_name()
            || current.role != self.spec.role.as_str()
            || current.is_disabled != self.spec.is_disabled
    }

    fn resync_period(&self, default: Duration) -> Option<Duration> {
        let period = match self.spec.resync_period.as_deref() {
            None => default,
            Some(p) => parse_duration(p).unwrap_or(default),
        };
        (!period.is_zero()).then_some(period)
    }

    fn validate(&self) -> Result<()> {
        if self.spec.instance_name.is_empty() {
            return Err(Error::InvalidSpec("instanceName is required".to_string()));
        }
        if let Some(p) = self.spec.resync_period.as_deref() {
            parse_duration(p).map_err(|e| Error::InvalidSpec(format!("resyncPeriod: {e}")))?;
        }
        let mut seen = BTreeSet::new();
        for token in &self.spec.tokens {
            if token.name.is_empty() {
                return Err(Error::InvalidSpec("token names may not be empty".to_string()));
            }
            if !seen.insert(token.name.as_str()) {
                return Err(Error::InvalidSpec(format!("token `{}` is declared twice", token.name)));
            }
            if let Some(expires) = token.expires_in.as_deref() {
                parse_duration(expires)
                    .map_err(|e| Error::InvalidSpec(format!("token `{}` expiresIn: {e}", token.name)))?;
            }
        }
        Ok(())
    }

    /// Owned `Secret` carrying a token key.
    pub fn token_secret(&self, namespace: &str, name: &str, key: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                owner_references: self.controller_owner_ref(&()).map(|o| vec![o]),
                labels: Some(BTreeMap::from([(
                    "app.kubernetes.io/managed-by".to_string(),
                    "grafana-operator".to_string(),
                )])),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                TOKEN_KEY.to_string(),
                ByteString(key.as_bytes().to_vec()),
            )])),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        }
    }

    /// Compare declared, recorded and existing tokens.
    ///
    /// A recorded token is kept only while Grafana still knows its id and its `Secret`
    /// exists. Grafana tokens nobody declares any more are revoked, as are stale tokens
    /// with a declared name whose key was lost.
    pub fn plan_tokens(
        &self,
        recorded: &[TokenStatus],
        existing: &[TokenInfo],
        secrets: &BTreeSet<String>,
    ) -> TokenPlan {
        let mut plan = TokenPlan::default();
        let declared: BTreeSet<&str> = self.spec.tokens.iter().map(|t| t.name.as_str()).collect();
        let mut kept_ids = BTreeSet::new();

        for token in &self.spec.tokens {
            let secret = self.secret_name(token);
            let intact = recorded.iter().find(|r| {
                r.name == token.name
                    && r.secret == secret
                    && secrets.contains(&r.secret)
                    && existing.iter().any(|e| e.id == r.id)
            });
            match intact {
                Some(r) => {
                    kept_ids.insert(r.id);
                    plan.keep.push(r.clone());
                }
                None => plan.issue.push(token.clone()),
            }
        }

        plan.revoke = existing
            .iter()
            .filter(|e| !kept_ids.contains(&e.id))
            .filter(|e| !declared.contains(e.name.as_str()) || plan.issue.iter().any(|t| t.name == e.name))
            .cloned()
            .collect();

        let kept_secrets: BTreeSet<&str> = plan.keep.iter().map(|k| k.secret.as_str()).collect();
        let wanted_secrets: BTreeSet<String> = self.spec.tokens.iter().map(|t| self.secret_name(t)).collect();
        plan.orphaned_secrets = recorded
            .iter()
            .filter(|r| !kept_secrets.contains(r.secret.as_str()) && !wanted_secrets.contains(&r.secret))
            .map(|r| r.secret.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        plan
    }
}

#[instrument(skip(account, ctx), fields(trace_id))]
pub async fn reconcile(account: Arc<GrafanaServiceAccount>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = crate::telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _timer = ctx.metrics.count_and_measure(KIND);
    ctx.diagnostics.write().await.last_event = Utc::now();
    let ns = account.namespace().ok_or(Error::MissingNamespace)?;
    let accounts: Api<GrafanaServiceAccount> = Api::namespaced(ctx.client.clone(), &ns);

    info!("Reconciling GrafanaServiceAccount \"{}\" in {}", account.name_any(), ns);
    finalizer(&accounts, FINALIZER, account, |event| async {
        match event {
            Finalizer::Apply(account) => account.reconcile(&ctx).await,
            Finalizer::Cleanup(account) => account.cleanup(&ctx).await,
        }
    })
    .await
    .map_err(|e| Error::FinalizerError(Box::new(e)))
}

pub fn error_policy(account: Arc<GrafanaServiceAccount>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    ctx.metrics.reconcile_failure(KIND, &account.name_any(), error);
    Action::requeue(ERROR_REQUEUE)
}

impl GrafanaServiceAccount {
    async fn reconcile(&self, ctx: &Context) -> Result<Action> {
        let ns = self.namespace().ok_or(Error::MissingNamespace)?;
        let name = self.name_any();
        let generation = self.meta().generation;
        let api: Api<GrafanaServiceAccount> = Api::namespaced(ctx.client.clone(), &ns);
        let recorder = ctx.diagnostics.read().await.recorder(ctx.client.clone(), self);
        let previous = self.status.clone().unwrap_or_default();
        let synchronized = conditions::synchronized(KIND);

        if let Err(Error::InvalidSpec(message)) = self.validate() {
            if !conditions::is_true(&previous.conditions, conditions::INVALID_SPEC) {
                recorder
                    .warn(EventAction::Apply, EventReason::InvalidSpec, message.clone())
                    .await?;
            }
            let mut status = previous.clone();
            conditions::set(
                &mut status.conditions,
                conditions::INVALID_SPEC,
                true,
                conditions::REASON_INVALID,
                message,
                generation,
            );
            conditions::remove(&mut status.conditions, NO_MATCHING_INSTANCE);
            conditions::remove(&mut status.conditions, &synchronized);
            status.observed_generation = generation;
            patch_status(&api, &name, &status).await?;
            return Ok(Action::await_change());
        }
        let period = self.resync_period(ctx.config.default_resync_period);

        let grafanas: Api<Grafana> = Api::namespaced(ctx.client.clone(), &ns);
        let grafana = grafanas
            .get_opt(&self.spec.instance_name)
            .await?
            .filter(|g| g.meta().deletion_timestamp.is_none() && g.is_ready());
        let Some(grafana) = grafana else {
            let mut status = previous.clone();
            conditions::remove(&mut status.conditions, conditions::INVALID_SPEC);
            conditions::remove(&mut status.conditions, &synchronized);
            conditions::set(
                &mut status.conditions,
                NO_MATCHING_INSTANCE,
                true,
                conditions::REASON_NO_INSTANCES,
                format!("Grafana instance {ns}/{} is missing or not ready", self.spec.instance_name),
                generation,
            );
            status.observed_generation = generation;
            patch_status(&api, &name, &status).await?;
            return Ok(Action::requeue(ERROR_REQUEUE));
        };

        let mut status = previous.clone();
        status.observed_generation = generation;
        conditions::remove(&mut status.conditions, conditions::INVALID_SPEC);
        conditions::remove(&mut status.conditions, NO_MATCHING_INSTANCE);

        match self.sync(ctx, &grafana, &previous, &recorder).await {
            Ok((account, tokens)) => {
                let message = format!(
                    "Service account {} with {} tokens is synchronized to {}",
                    account.login,
                    tokens.len(),
                    account.instance
                );
                status.account = Some(account);
                status.tokens = tokens;
                conditions::set(
                    &mut status.conditions,
                    &synchronized,
                    true,
                    conditions::REASON_APPLY_SUCCESSFUL,
                    message,
                    generation,
                );
                patch_status(&api, &name, &status).await?;
                Ok(period.map_or_else(Action::await_change, Action::requeue))
            }
            Err(e) => {
                let message = format!("{KIND} failed to be applied to {}: {e}", instance_key(&grafana));
                recorder
                    .warn(EventAction::Apply, EventReason::ApplyFailed, message.clone())
                    .await?;
                conditions::set(
                    &mut status.conditions,
                    &synchronized,
                    false,
                    conditions::REASON_APPLY_FAILED,
                    message,
                    generation,
                );
                patch_status(&api, &name, &status).await?;
                Err(e)
            }
        }
    }

    /// Converge the account and its tokens on `grafana`.
    async fn sync(
        &self,
        ctx: &Context,
        grafana: &Grafana,
        previous: &GrafanaServiceAccountStatus,
        recorder: &EventRecorder,
    ) -> Result<(AccountStatus, Vec<TokenStatus>)> {
        let ns = self.namespace().ok_or(Error::MissingNamespace)?;
        let key = instance_key(grafana);

        // the instance changed: the old account goes first, so a failure keeps it recorded
        let recorded = previous.account.as_ref().filter(|a| a.instance == key);
        if let Some(old) = previous.account.as_ref().filter(|a| a.instance != key) {
            info!("service account moved from {} to {key}", old.instance);
            remove_account(ctx, old).await?;
        }
        let recorded_tokens: &[TokenStatus] = if recorded.is_some() { &previous.tokens } else { &[] };

        let client = instances::client_for(ctx, grafana).await?;
        let account = self.ensure_account(&client, recorded.map(|a| a.id)).await?;

        let tokens_path = format!("{SERVICE_ACCOUNTS}/{}/tokens", account.id);
        let existing: Vec<TokenInfo> = client.get(&tokens_path).await?.unwrap_or_default();
        let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &ns);
        let mut present = BTreeSet::new();
        for r in recorded_tokens {
            if secrets.get_opt(&r.secret).await?.is_some() {
                present.insert(r.secret.clone());
            }
        }

        let plan = self.plan_tokens(recorded_tokens, &existing, &present);
        for token in &plan.revoke {
            client.delete(&format!("{tokens_path}/{}", token.id)).await?;
            recorder
                .info(
                    EventAction::RotateTokens,
                    EventReason::TokenRevoked,
                    format!("Revoked token `{}`", token.name),
                )
                .await?;
        }
        for secret in &plan.orphaned_secrets {
            match secrets.delete(secret, &DeleteParams::default()).await {
                Ok(_) => {}
                Err(kube::Error::Api(e)) if e.code == 404 => {}
                Err(e) => return Err(e.into()),
            }
        }

        let ps = PatchParams::apply(FIELD_MANAGER).force();
        let mut tokens = plan.keep;
        for token in &plan.issue {
            let seconds_to_live = match token.expires_in.as_deref() {
                Some(expires) => parse_duration(expires)
                    .map_err(|e| Error::InvalidSpec(e.to_string()))?
                    .as_secs(),
                None => 0,
            };
            let created: CreatedToken = client
                .post(&tokens_path, &json!({ "name": token.name, "secondsToLive": seconds_to_live }))
                .await?;
            let secret_name = self.secret_name(token);
            secrets
                .patch(
                    &secret_name,
                    &ps,
                    &Patch::Apply(self.token_secret(&ns, &secret_name, &created.key)),
                )
                .await?;
            recorder
                .info(
                    EventAction::RotateTokens,
                    EventReason::TokenCreated,
                    format!("Issued token `{}` into secret {secret_name}", token.name),
                )
                .await?;
            tokens.push(TokenStatus {
                name: token.name.clone(),
                id: created.id,
                secret: secret_name,
            });
        }
        tokens.sort_by(|a, b| a.name.cmp(&b.name));

        Ok((
            AccountStatus {
                instance: key,
                id: account.id,
                login: account.login,
            },
            tokens,
        ))
    }

    /// Find, adopt or create the account and bring it in line with the spec.
    async fn ensure_account(&self, client: &GrafanaClient, recorded: Option<i64>) -> Result<AccountInfo, GrafanaError> {
        let mut current = match recorded {
            Some(id) => client.get::<AccountInfo>(&format!("{SERVICE_ACCOUNTS}/{id}")).await?,
            None => None,
        };
        if current.is_none() {
            let name = self.account_name();
            let found: Option<SearchResult> = client
                .get_query(&format!("{SERVICE_ACCOUNTS}/search"), &[("query", name.as_str())])
                .await?;
            current = found.and_then(|r| r.service_accounts.into_iter().find(|a| a.name == name));
        }
        match current {
            None => {
                info!("creating service account {}", self.account_name());
                client.post(SERVICE_ACCOUNTS, &self.account_body()).await
            }
            Some(current) if self.drifted(&current) => {
                info!("updating service account {}", current.id);
                let body = self.account_body();
                let _: Value = client.patch(&format!("{SERVICE_ACCOUNTS}/{}", current.id), &body).await?;
                Ok(AccountInfo {
                    name: self.account_name(),
                    role: self.spec.role.as_str().to_string(),
                    is_disabled: self.spec.is_disabled,
                    ..current
                })
            }
            Some(current) => Ok(current),
        }
    }

    // Finalizer cleanup; token secrets are owned and garbage collected
    async fn cleanup(&self, ctx: &Context) -> Result<Action> {
        let recorder = ctx.diagnostics.read().await.recorder(ctx.client.clone(), self);
        recorder
            .info(
                EventAction::Cleanup,
                EventReason::DeleteRequested,
                format!("Deleting `{}`", self.name_any()),
            )
            .await?;
        if let Some(account) = self.status.as_ref().and_then(|s| s.account.as_ref()) {
            if let Err(e) = remove_account(ctx, account).await {
                recorder
                    .warn(EventAction::Cleanup, EventReason::CleanupFailed, e.to_string())
                    .await?;
                return Err(Error::CleanupFailed(e.to_string()));
            }
        }
        Ok(Action::await_change())
    }
}

/// Delete a recorded account. Gone or unready instances are skipped.
async fn remove_account(ctx: &Context, account: &AccountStatus) -> Result<()> {
    let Some(grafana) = instances::lookup(ctx, &account.instance).await? else {
        return Ok(());
    };
    if grafana.meta().deletion_timestamp.is_some() || !grafana.is_ready() {
        debug!("skipping account removal on {}, it is not ready", account.instance);
        return Ok(());
    }
    let client = instances::client_for(ctx, &grafana).await?;
    client.delete(&format!("{SERVICE_ACCOUNTS}/{}", account.id)).await?;
    Ok(())
}

async fn patch_status(
    api: &Api<GrafanaServiceAccount>,
    name: &str,
    status: &GrafanaServiceAccountStatus,
) -> Result<()> {
    let patch = Patch::Apply(json!({
        "apiVersion": "grafana.integreatly.org/v1beta1",
        "kind": "GrafanaServiceAccount",
        "status": status,
    }));
    api.patch_status(name, &PatchParams::apply(FIELD_MANAGER).force(), &patch)
        .await?;
    Ok(())
}
