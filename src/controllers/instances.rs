//! Selection of the `Grafana` instances a resource is synchronized into.

use crate::client::GrafanaClient;
use crate::controllers::common::GrafanaCommonSpec;
use crate::controllers::grafana::Grafana;
use crate::{Context, Error, Result};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use kube::api::ListParams;
use kube::{Api, Resource, ResourceExt};
use std::collections::BTreeMap;

/// `namespace/name` of an instance, the unit of per-instance bookkeeping.
pub fn instance_key(grafana: &Grafana) -> String {
    format!("{}/{}", grafana.namespace().unwrap_or_default(), grafana.name_any())
}

fn split_key(key: &str) -> Option<(&str, &str)> {
    key.split_once('/').filter(|(ns, name)| !ns.is_empty() && !name.is_empty())
}

fn is_empty(selector: &LabelSelector) -> bool {
    selector.match_labels.as_ref().map_or(true, BTreeMap::is_empty)
        && selector.match_expressions.as_ref().map_or(true, Vec::is_empty)
}

fn requirement_query(req: &LabelSelectorRequirement) -> Result<String> {
    let values = req.values.clone().unwrap_or_default();
    match req.operator.as_str() {
        "In" | "NotIn" if values.is_empty() => Err(Error::InvalidSpec(format!(
            "instanceSelector: operator {} on `{}` needs values",
            req.operator, req.key
        ))),
        "In" => Ok(format!("{} in ({})", req.key, values.join(","))),
        "NotIn" => Ok(format!("{} notin ({})", req.key, values.join(","))),
        "Exists" => Ok(req.key.clone()),
        "DoesNotExist" => Ok(format!("!{}", req.key)),
        other => Err(Error::InvalidSpec(format!(
            "instanceSelector: unknown operator `{other}` on `{}`",
            req.key
        ))),
    }
}

/// Render a selector as a label-selector query string.
///
/// An empty selector yields `None`: it selects no instance at all.
pub fn selector_query(selector: &LabelSelector) -> Result<Option<String>> {
    if is_empty(selector) {
        return Ok(None);
    }
    let mut parts: Vec<String> = selector
        .match_labels
        .iter()
        .flatten()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    for req in selector.match_expressions.iter().flatten() {
        parts.push(requirement_query(req)?);
    }
    Ok(Some(parts.join(",")))
}

/// Evaluate a selector against a label set, with the same semantics as the API server.
pub fn selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    if is_empty(selector) {
        return false;
    }
    let labels_match = selector
        .match_labels
        .iter()
        .flatten()
        .all(|(k, v)| labels.get(k) == Some(v));
    let expressions_match = selector.match_expressions.iter().flatten().all(|req| {
        let values = req.values.as_deref().unwrap_or_default();
        let actual = labels.get(&req.key);
        match req.operator.as_str() {
            "In" => actual.is_some_and(|a| values.contains(a)),
            "NotIn" => actual.map_or(true, |a| !values.contains(a)),
            "Exists" => actual.is_some(),
            "DoesNotExist" => actual.is_none(),
            _ => false,
        }
    });
    labels_match && expressions_match
}

/// Keep the candidates a resource in `namespace` may be applied to.
pub fn selectable(candidates: Vec<Grafana>, namespace: &str, spec: &GrafanaCommonSpec) -> Vec<Grafana> {
    let mut selected: Vec<Grafana> = candidates
        .into_iter()
        .filter(|g| spec.allow_cross_namespace_import || g.namespace().as_deref() == Some(namespace))
        .filter(|g| selector_matches(&spec.instance_selector, g.labels()))
        .filter(|g| g.meta().deletion_timestamp.is_none())
        .filter(Grafana::is_ready)
        .collect();
    selected.sort_by_key(instance_key);
    selected
}

/// List the ready instances matching the resource's selector.
pub async fn select(ctx: &Context, namespace: &str, spec: &GrafanaCommonSpec) -> Result<Vec<Grafana>> {
    let Some(query) = selector_query(&spec.instance_selector)? else {
        return Ok(vec![]);
    };
    let api: Api<Grafana> = if spec.allow_cross_namespace_import {
        ctx.watched_api()
    } else {
        Api::namespaced(ctx.client.clone(), namespace)
    };
    let candidates = api.list(&ListParams::default().labels(&query)).await?;
    Ok(selectable(candidates.items, namespace, spec))
}

/// Fetch an instance by its bookkeeping key; `None` when it no longer exists.
pub async fn lookup(ctx: &Context, key: &str) -> Result<Option<Grafana>> {
    let Some((namespace, name)) = split_key(key) else {
        return Ok(None);
    };
    let api: Api<Grafana> = Api::namespaced(ctx.client.clone(), namespace);
    Ok(api.get_opt(name).await?)
}

/// Build an authenticated client for a ready instance.
pub async fn client_for(ctx: &Context, grafana: &Grafana) -> Result<GrafanaClient> {
    let url = grafana
        .admin_url()
        .ok_or_else(|| Error::InvalidSpec(format!("instance {} has no admin url yet", instance_key(grafana))))?;
    let credentials = grafana.credentials(&ctx.client).await?;
    Ok(GrafanaClient::new(
        url,
        credentials,
        grafana.client_timeout(ctx.config.http_timeout),
        grafana.insecure_skip_verify(),
    )?)
}
