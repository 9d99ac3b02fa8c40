//! A small typed client for Grafana's HTTP and provisioning API.
//!
//! Only the verbs are modelled here; the individual controllers own the paths and payloads
//! they need. A `404` on reads and deletes is not an error: reads yield `None` and deletes
//! report `false`, which keeps every cleanup path idempotent.

use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Header that marks alerting resources as editable in the Grafana UI.
const DISABLE_PROVENANCE: &str = "X-Disable-Provenance";

/// How the operator authenticates against an instance.
#[derive(Clone, Default, PartialEq, Eq)]
pub enum Credentials {
    #[default]
    Anonymous,
    Basic {
        user: String,
        password: String,
    },
    Token(String),
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Anonymous => write!(f, "Anonymous"),
            Credentials::Basic { user, .. } => write!(f, "Basic({user}, ***)"),
            Credentials::Token(_) => write!(f, "Token(***)"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GrafanaError {
    #[error("invalid Grafana url `{0}`")]
    InvalidUrl(String),

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("{method} {path} returned {status}: {message}")]
    Status {
        method: Method,
        path: String,
        status: StatusCode,
        message: String,
    },

    #[error("unexpected response from {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl GrafanaError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            GrafanaError::Status { status, .. } => Some(*status),
            GrafanaError::Request(e) => e.status(),
            _ => None,
        }
    }
}

/// The subset of `/api/health` the operator cares about.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct Health {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub database: String,
}

#[derive(Clone, Debug)]
pub struct GrafanaClient {
    http: reqwest::Client,
    base: Url,
    credentials: Credentials,
    disable_provenance: bool,
}

impl GrafanaClient {
    pub fn new(
        base_url: &str,
        credentials: Credentials,
        timeout: Duration,
        insecure_skip_verify: bool,
    ) -> Result<Self, GrafanaError> {
        let mut base =
            Url::parse(base_url).map_err(|_| GrafanaError::InvalidUrl(base_url.to_string()))?;
        if base.cannot_be_a_base() {
            return Err(GrafanaError::InvalidUrl(base_url.to_string()));
        }
        // keep sub-path deployments (`https://host/grafana`) intact when joining
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let http = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .danger_accept_invalid_certs(insecure_skip_verify)
            .build()?;
        Ok(Self {
            http,
            base,
            credentials,
            disable_provenance: false,
        })
    }

    pub fn base_url(&self) -> &str {
        self.base.as_str()
    }

    /// A copy of this client that marks alerting resources as editable in the UI.
    pub fn editable(&self, editable: bool) -> Self {
        Self {
            disable_provenance: editable,
            ..self.clone()
        }
    }

    fn url(&self, path: &str) -> Result<Url, GrafanaError> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|_| GrafanaError::InvalidUrl(format!("{}{}", self.base, path)))
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<Option<Value>, GrafanaError> {
        let url = self.url(path)?;
        debug!(%method, %url, "grafana request");
        let mut req = self.http.request(method.clone(), url).header("Accept", "application/json");
        if !query.is_empty() {
            req = req.query(query);
        }
        req = match &self.credentials {
            Credentials::Anonymous => req,
            Credentials::Basic { user, password } => req.basic_auth(user, Some(password)),
            Credentials::Token(token) => req.bearer_auth(token),
        };
        if self.disable_provenance {
            req = req.header(DISABLE_PROVENANCE, "true");
        }
        if let Some(body) = body {
            req = req.json(body);
        }

        let response = req.send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let bytes = response.bytes().await?;
        if !status.is_success() {
            return Err(GrafanaError::Status {
                method,
                path: path.to_string(),
                status,
                message: error_message(&bytes),
            });
        }
        if bytes.is_empty() {
            return Ok(Some(Value::Null));
        }
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| GrafanaError::Decode {
                path: path.to_string(),
                source,
            })
    }

    fn decode<T: DeserializeOwned>(path: &str, value: Value) -> Result<T, GrafanaError> {
        serde_json::from_value(value).map_err(|source| GrafanaError::Decode {
            path: path.to_string(),
            source,
        })
    }

    /// `GET`, yielding `None` when the object does not exist.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, GrafanaError> {
        self.get_query(path, &[]).await
    }

    pub async fn get_query<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Option<T>, GrafanaError> {
        match self.send(Method::GET, path, query, None).await? {
            None => Ok(None),
            Some(value) => Self::decode(path, value).map(Some),
        }
    }

    /// Whether an object exists at `path`.
    pub async fn exists(&self, path: &str) -> Result<bool, GrafanaError> {
        Ok(self.send(Method::GET, path, &[], None).await?.is_some())
    }

    async fn write<B: Serialize, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> Result<T, GrafanaError> {
        let body = serde_json::to_value(body).map_err(|source| GrafanaError::Decode {
            path: path.to_string(),
            source,
        })?;
        match self.send(method.clone(), path, &[], Some(&body)).await? {
            Some(value) => Self::decode(path, value),
            None => Err(GrafanaError::Status {
                method,
                path: path.to_string(),
                status: StatusCode::NOT_FOUND,
                message: "not found".to_string(),
            }),
        }
    }

    pub async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T, GrafanaError> {
        self.write(Method::POST, path, body).await
    }

    pub async fn put<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T, GrafanaError> {
        self.write(Method::PUT, path, body).await
    }

    pub async fn patch<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T, GrafanaError> {
        self.write(Method::PATCH, path, body).await
    }

    /// `DELETE`, returning whether anything was removed.
    pub async fn delete(&self, path: &str) -> Result<bool, GrafanaError> {
        Ok(self.send(Method::DELETE, path, &[], None).await?.is_some())
    }

    pub async fn health(&self) -> Result<Health, GrafanaError> {
        self.get::<Health>("/api/health")
            .await?
            .ok_or_else(|| GrafanaError::Status {
                method: Method::GET,
                path: "/api/health".to_string(),
                status: StatusCode::NOT_FOUND,
                message: "health endpoint not found".to_string(),
            })
    }
}

fn error_message(body: &[u8]) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        message: String,
    }
    match serde_json::from_slice::<ErrorBody>(body) {
        Ok(parsed) => parsed.message,
        Err(_) => String::from_utf8_lossy(body).trim().chars().take(256).collect(),
    }
}
