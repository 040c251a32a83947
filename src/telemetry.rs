use opentelemetry::trace::TraceId;
use tracing_subscriber::{prelude::*, EnvFilter, Registry};

/// Fetch an opentelemetry::trace::TraceId as hex through the full tracing stack
pub fn get_trace_id() -> TraceId {
    use opentelemetry::trace::TraceContextExt as _;
    use tracing_opentelemetry::OpenTelemetrySpanExt as _;

    tracing::Span::current()
        .context()
        .span()
        .span_context()
        .trace_id()
}

#[cfg(feature = "telemetry")]
async fn init_tracer() -> opentelemetry::sdk::trace::Tracer {
    let otlp_endpoint = std::env::var("OPENTELEMETRY_ENDPOINT_URL")
        .expect("Need a otel tracing collector configured");

    let channel = tonic::transport::Channel::from_shared(otlp_endpoint)
        .unwrap()
        .connect()
        .await
        .unwrap();

    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(opentelemetry_otlp::new_exporter().tonic().with_channel(channel))
        .with_trace_config(opentelemetry::sdk::trace::config().with_resource(
            opentelemetry::sdk::Resource::new(vec![opentelemetry::KeyValue::new(
                "service.name",
                "dpa-operator",
            )]),
        ))
        .install_batch(opentelemetry::runtime::Tokio)
        .unwrap()
}

/// Initialize tracing; JSON output when LOG_FORMAT=json
pub async fn init() {
    #[cfg(feature = "telemetry")]
    let telemetry = tracing_opentelemetry::layer().with_tracer(init_tracer().await);
    let json_logs = std::env::var("LOG_FORMAT").map(|f| f == "json").unwrap_or(false);
    let logger = tracing_subscriber::fmt::layer()
        .compact()
        .with_line_number(true)
        .with_target(true);
    let json_logger = if json_logs {
        Some(tracing_subscriber::fmt::layer().json())
    } else {
        None
    };
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();

    #[cfg(feature = "telemetry")]
    let collector = Registry::default()
        .with(telemetry)
        .with(json_logger)
        .with((!json_logs).then_some(logger))
        .with(env_filter);
    #[cfg(not(feature = "telemetry"))]
    let collector = Registry::default()
        .with(json_logger)
        .with((!json_logs).then_some(logger))
        .with(env_filter);

    tracing::subscriber::set_global_default(collector).unwrap();
}
