use opentelemetry::trace::TraceId;
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
async fn init_tracer() -> opentelemetry::sdk::trace::Tracer {
    use opentelemetry::sdk::{trace, Resource};
    use opentelemetry_otlp::WithExportConfig;

    let endpoint = std::env::var("OPENTELEMETRY_ENDPOINT_URL").expect("Needs an otel collector");
    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(opentelemetry_otlp::new_exporter().tonic().with_endpoint(endpoint))
        .with_trace_config(trace::config().with_resource(Resource::new(vec![
            opentelemetry::KeyValue::new("service.name", env!("CARGO_PKG_NAME")),
            opentelemetry::KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ])))
        .install_batch(opentelemetry::runtime::Tokio)
        .expect("valid tracer")
}

/// Initialize the tracing stack. `LOG_FORMAT=json` switches the fmt layer to
/// structured output for log collectors; the default is compact lines for
/// humans. The OTLP layer only exists behind the `telemetry` feature.
pub async fn init() {
    #[cfg(feature = "telemetry")]
    let otel = tracing_opentelemetry::OpenTelemetryLayer::new(init_tracer().await);

    let env_filter = EnvFilter::try_from_default_env()
        .or(EnvFilter::try_new("info"))
        .unwrap();
    let json_logs = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let reg = Registry::default().with(env_filter);
    if json_logs {
        let logger = tracing_subscriber::fmt::layer().json();
        #[cfg(feature = "telemetry")]
        reg.with(logger).with(otel).init();
        #[cfg(not(feature = "telemetry"))]
        reg.with(logger).init();
    } else {
        let logger = tracing_subscriber::fmt::layer().compact();
        #[cfg(feature = "telemetry")]
        reg.with(logger).with(otel).init();
        #[cfg(not(feature = "telemetry"))]
        reg.with(logger).init();
    }
}
