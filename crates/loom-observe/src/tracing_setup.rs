//! Tracing subscriber initialization with structured logging and optional
//! OpenTelemetry trace export.
//!
//! # Usage
//!
//! ```no_run
//! use loom_types::config::LoggingConfig;
//!
//! loom_observe::tracing_setup::init_tracing(&LoggingConfig::default()).unwrap();
//! // ...
//! loom_observe::tracing_setup::shutdown_tracing();
//! ```

use std::sync::OnceLock;

use loom_types::config::{LogFormat, LoggingConfig};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Stores the OTel tracer provider so it can be shut down cleanly on exit.
static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

/// `RUST_LOG` when it is set and parses, else the configured level.
fn build_filter(rust_log: Option<String>, default_level: &str) -> Result<EnvFilter, ParseError> {
    if let Some(directives) = rust_log.filter(|d| !d.trim().is_empty()) {
        match EnvFilter::try_new(&directives) {
            Ok(filter) => return Ok(filter),
            Err(e) => eprintln!("Warning: ignoring invalid RUST_LOG '{directives}': {e}"),
        }
    }
    EnvFilter::try_new(default_level)
}

/// Initialize the global tracing subscriber.
///
/// - Installs a `fmt` layer in pretty or JSON format with target visibility
///   and span close timing.
/// - When `config.otel` is set, additionally bridges tracing spans to
///   OpenTelemetry using a stdout exporter.
///
/// # Errors
///
/// Returns an error if the level directive is invalid or the global
/// subscriber has already been set.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = build_filter(std::env::var("RUST_LOG").ok(), &config.level)?;

    let fmt_layer = match config.format {
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE)
            .boxed(),
    };

    let otel_layer = if config.otel {
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build();
        let tracer = provider.tracer("loom");

        // Store the provider for shutdown and register it globally.
        let _ = TRACER_PROVIDER.set(provider.clone());
        opentelemetry::global::set_tracer_provider(provider);

        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(otel_layer)
        .with(env_filter)
        .try_init()?;

    Ok(())
}

/// Flush pending traces and shut down the OpenTelemetry tracer provider.
///
/// No-op when OTel was not enabled.
pub fn shutdown_tracing() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            eprintln!("Warning: OTel tracer provider shutdown error: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_uses_configured_level() {
        let filter = build_filter(None, "loom_core=debug,info").unwrap().to_string();
        assert!(filter.contains("loom_core=debug"));
        assert!(filter.contains("info"));
    }

    #[test]
    fn test_filter_prefers_rust_log() {
        let filter = build_filter(Some("warn".into()), "info").unwrap();
        assert_eq!(filter.to_string(), "warn");
    }

    #[test]
    fn test_invalid_rust_log_falls_back() {
        let filter = build_filter(Some("loom_core=loud".into()), "info").unwrap();
        assert_eq!(filter.to_string(), "info");
    }

    #[test]
    fn test_invalid_configured_level_is_an_error() {
        assert!(build_filter(None, "loom_core=loud").is_err());
    }

    #[test]
    fn test_shutdown_without_init_is_noop() {
        shutdown_tracing();
    }
}
