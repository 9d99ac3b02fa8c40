use controller::controllers::alert_rule_group::GrafanaAlertRuleGroup;
use controller::controllers::contact_point::GrafanaContactPoint;
use controller::controllers::dashboard::GrafanaDashboard;
use controller::controllers::datasource::GrafanaDatasource;
use controller::controllers::folder::GrafanaFolder;
use controller::controllers::grafana::Grafana;
use controller::controllers::library_panel::GrafanaLibraryPanel;
use controller::controllers::mute_timing::GrafanaMuteTiming;
use controller::controllers::notification_policy::GrafanaNotificationPolicy;
use controller::controllers::notification_template::GrafanaNotificationTemplate;
use controller::controllers::service_account::GrafanaServiceAccount;
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let crds = [
        Grafana::crd(),
        GrafanaFolder::crd(),
        GrafanaDashboard::crd(),
        GrafanaDatasource::crd(),
        GrafanaLibraryPanel::crd(),
        GrafanaAlertRuleGroup::crd(),
        GrafanaContactPoint::crd(),
        GrafanaNotificationPolicy::crd(),
        GrafanaNotificationTemplate::crd(),
        GrafanaMuteTiming::crd(),
        GrafanaServiceAccount::crd(),
    ];
    let documents = crds
        .iter()
        .map(serde_yaml::to_string)
        .collect::<Result<Vec<_>, _>>()?;
    print!("{}", documents.join("---\n"));
    Ok(())
}
