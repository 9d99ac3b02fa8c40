use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::Api;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::string::FromUtf8Error;

/// A key within a `Secret` in the same namespace.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct SecretRef {
    /// The name of the secret.
    pub name: String,
    /// The key of the value in the secret.
    pub key: String,
}

impl SecretRef {
    pub async fn get(&self, api: &Api<Secret>) -> Result<Secret, SecretError> {
        api.get_opt(&self.name)
            .await?
            .ok_or_else(|| SecretError::NotFound(format!("secret {}", self.name)))
    }

    pub async fn get_field(&self, api: &Api<Secret>) -> Result<String, SecretError> {
        let secret = self.get(api).await?;
        self.get_field_with(&secret)
    }

    pub fn get_field_with(&self, secret: &Secret) -> Result<String, SecretError> {
        let data = secret
            .data
            .as_ref()
            .ok_or_else(|| SecretError::NoData(self.name.to_owned()))?
            .get(&self.key)
            .cloned()
            .ok_or_else(|| SecretError::KeyNotFound(self.key.to_owned(), self.name.to_owned()))?;

        let data = String::from_utf8(data.0)?;
        Ok(data)
    }
}

/// A key within a `ConfigMap` in the same namespace.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ConfigMapRef {
    /// The name of the config map.
    pub name: String,
    /// The key of the value in the config map.
    pub key: String,
}

impl ConfigMapRef {
    pub async fn get_field(&self, api: &Api<ConfigMap>) -> Result<String, SecretError> {
        let cm = api
            .get_opt(&self.name)
            .await?
            .ok_or_else(|| SecretError::NotFound(format!("configmap {}", self.name)))?;
        self.get_field_with(&cm)
    }

    pub fn get_field_with(&self, cm: &ConfigMap) -> Result<String, SecretError> {
        cm.data
            .as_ref()
            .and_then(|d| d.get(&self.key))
            .cloned()
            .ok_or_else(|| SecretError::KeyNotFound(self.key.to_owned(), self.name.to_owned()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("Kubernetes error: {0}")]
    Kubernetes(#[from] kube::Error),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Key {0} not found in {1}")]
    KeyNotFound(String, String),

    #[error("Secret {0} has no data")]
    NoData(String),

    #[error("Secret has invalid utf-8 data")]
    InvalidUtf8(#[from] FromUtf8Error),
}

impl SecretError {
    /// Whether the error stems from the user's spec rather than the cluster.
    pub fn is_reference_error(&self) -> bool {
        !matches!(self, SecretError::Kubernetes(_))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    fn secret(entries: &[(&str, &[u8])]) -> Secret {
        Secret {
            data: Some(
                entries
                    .iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.to_vec())))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn reads_secret_keys() {
        let r = SecretRef {
            name: "creds".into(),
            key: "password".into(),
        };
        let value = r.get_field_with(&secret(&[("password", b"hunter2")])).unwrap();
        assert_eq!(value, "hunter2");
    }

    #[test]
    fn missing_keys_are_reference_errors() {
        let r = SecretRef {
            name: "creds".into(),
            key: "token".into(),
        };
        let err = r.get_field_with(&secret(&[("password", b"x")])).unwrap_err();
        assert!(matches!(err, SecretError::KeyNotFound(_, _)));
        assert!(err.is_reference_error());

        let err = r.get_field_with(&Secret::default()).unwrap_err();
        assert!(matches!(err, SecretError::NoData(_)));
    }

    #[test]
    fn rejects_non_utf8_secret_data() {
        let r = SecretRef {
            name: "creds".into(),
            key: "bin".into(),
        };
        let err = r.get_field_with(&secret(&[("bin", &[0xff, 0xfe])])).unwrap_err();
        assert!(matches!(err, SecretError::InvalidUtf8(_)));
    }

    #[test]
    fn reads_config_map_keys() {
        let cm = ConfigMap {
            data: Some(BTreeMap::from([("dashboard.json".to_string(), "{}".to_string())])),
            ..Default::default()
        };
        let r = ConfigMapRef {
            name: "dashboards".into(),
            key: "dashboard.json".into(),
        };
        assert_eq!(r.get_field_with(&cm).unwrap(), "{}");
    }
}
