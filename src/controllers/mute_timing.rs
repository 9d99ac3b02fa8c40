use crate::client::{GrafanaClient, GrafanaError};
use crate::controllers::common::{preserve_unknown_array, GrafanaCommonSpec, GrafanaCommonStatus};
use crate::controllers::grafana::Grafana;
use crate::controllers::sync::{Desired, GrafanaContent};
use crate::{Context, Error, Result};
use async_trait::async_trait;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

const MUTE_TIMINGS: &str = "/api/v1/provisioning/mute-timings";

/// A mute timing synchronized into the selected Grafana instances.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "GrafanaMuteTiming",
    group = "grafana.integreatly.org",
    version = "v1beta1",
    singular = "grafanamutetiming",
    plural = "grafanamutetimings",
    namespaced
)]
#[kube(status = "GrafanaCommonStatus")]
#[serde(rename_all = "camelCase")]
pub struct GrafanaMuteTimingSpec {
    #[serde(flatten)]
    pub common: GrafanaCommonSpec,
    /// Mute timing name, defaults to the resource name.
    pub name: Option<String>,
    /// Alertmanager time intervals, e.g. `[{"weekdays": ["saturday", "sunday"]}]`.
    #[schemars(schema_with = "preserve_unknown_array")]
    pub time_intervals: Vec<Value>,
    pub editable: Option<bool>,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct MuteTimingModel {
    pub time_intervals: Vec<Value>,
    pub editable: bool,
}

#[async_trait]
impl GrafanaContent for GrafanaMuteTiming {
    type Model = MuteTimingModel;

    const KIND: &'static str = "MuteTiming";

    fn common_spec(&self) -> &GrafanaCommonSpec {
        &self.spec.common
    }

    fn common_status(&self) -> Option<&GrafanaCommonStatus> {
        self.status.as_ref()
    }

    async fn desired(&self, _ctx: &Context) -> Result<Desired<MuteTimingModel>> {
        let name = self.spec.name.clone().unwrap_or_else(|| self.name_any());
        if name.contains('/') {
            return Err(Error::InvalidSpec(format!("mute timing name `{name}` may not contain `/`")));
        }
        if self.spec.time_intervals.is_empty() {
            return Err(Error::InvalidSpec("at least one time interval is required".to_string()));
        }
        Desired::new(
            name,
            MuteTimingModel {
                time_intervals: self.spec.time_intervals.clone(),
                editable: self.spec.editable.unwrap_or(true),
            },
        )
    }

    async fn is_present(
        &self,
        client: &GrafanaClient,
        desired: &Desired<MuteTimingModel>,
    ) -> Result<bool, GrafanaError> {
        client.exists(&format!("{MUTE_TIMINGS}/{}", desired.uid)).await
    }

    async fn apply(
        &self,
        _ctx: &Context,
        _grafana: &Grafana,
        client: &GrafanaClient,
        desired: &Desired<MuteTimingModel>,
    ) -> Result<()> {
        let client = client.editable(desired.model.editable);
        let path = format!("{MUTE_TIMINGS}/{}", desired.uid);
        let body = json!({ "name": desired.uid, "time_intervals": desired.model.time_intervals });
        if client.exists(&path).await? {
            let _: Value = client.put(&path, &body).await?;
        } else {
            let _: Value = client.post(MUTE_TIMINGS, &body).await?;
        }
        Ok(())
    }

    async fn remove(&self, client: &GrafanaClient, uid: &str) -> Result<(), GrafanaError> {
        client.delete(&format!("{MUTE_TIMINGS}/{uid}")).await.map(|_| ())
    }
}
