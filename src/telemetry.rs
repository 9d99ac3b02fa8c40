#![allow(unused_imports)] // some used only for telemetry feature
use crate::config::{LogFormat, OperatorConfig};
use opentelemetry::trace::{TraceId, TracerProvider};
use tracing_subscriber::{prelude::*, EnvFilter, Registry};

///  Fetch an opentelemetry::trace::TraceId as hex through the full tracing stack
pub fn get_trace_id() -> TraceId {
    use opentelemetry::trace::TraceContextExt as _; // opentelemetry::Context -> opentelemetry::trace::Span
    use tracing_opentelemetry::OpenTelemetrySpanExt as _; // tracing::Span to opentelemetry::Context

    tracing::Span::current()
        .context()
        .span()
        .span_context()
        .trace_id()
}

#[cfg(feature = "telemetry")]
async fn init_tracer(endpoint: &str) -> anyhow::Result<opentelemetry::sdk::trace::Tracer> {
    let channel = tonic::transport::Channel::from_shared(endpoint.to_string())?
        .connect()
        .await?;

    Ok(opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(opentelemetry_otlp::new_exporter().tonic().with_channel(channel))
        .with_trace_config(opentelemetry::sdk::trace::config().with_resource(
            opentelemetry::sdk::Resource::new(vec![opentelemetry::KeyValue::new(
                "service.name",
                "grafana-operator",
            )]),
        ))
        .install_batch(opentelemetry::runtime::Tokio)?)
}

/// Initialize tracing
pub async fn init(config: &OperatorConfig) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    let (compact, json) = match config.log_format {
        LogFormat::Compact => (Some(tracing_subscriber::fmt::layer().compact()), None),
        LogFormat::Json => (None, Some(tracing_subscriber::fmt::layer().json())),
    };

    // Decide on layers
    #[cfg(feature = "telemetry")]
    {
        let endpoint = config
            .otlp_endpoint
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("Need a otel tracing collector configured"))?;
        let telemetry = tracing_opentelemetry::layer().with_tracer(init_tracer(endpoint).await?);
        let collector = Registry::default()
            .with(telemetry)
            .with(compact)
            .with(json)
            .with(env_filter);
        tracing::subscriber::set_global_default(collector)?;
    }
    #[cfg(not(feature = "telemetry"))]
    {
        let collector = Registry::default().with(compact).with(json).with(env_filter);
        tracing::subscriber::set_global_default(collector)?;
    }
    Ok(())
}
