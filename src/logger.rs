use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use opentelemetry::global;
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, Protocol, SpanExporter, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::{logs::SdkLoggerProvider, trace::SdkTracerProvider};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt as tfmt};

pub const SERVICE_NAME: &str = "vulhub-flexibility";

/// What log levels are supported?
/// Higher-value variants are more severe.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    #[default]
    Info = 2,
    Warn = 3,
    Error = 4,
}

impl LogLevel {
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_directive())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" | "critical" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level `{other}`")),
        }
    }
}

/// Keeps exporters alive for the lifetime of the process.
pub enum TelemetryGuard {
    Otel(Telemetry),
    Files,
}

impl TelemetryGuard {
    pub fn shutdown(self) {
        if let TelemetryGuard::Otel(telemetry) = self {
            telemetry.shutdown();
        }
    }
}

/// Installs the global subscriber.
///
/// With an OTLP endpoint, logs are bridged to the collector and spans are
/// exported. Without one, a plain-text and a JSON log rotate daily under
/// `log_dir`. Both modes also print to stdout.
pub fn init_tracing(
    log_dir: &Path,
    log_level: LogLevel,
    otel_endpoint: Option<String>,
) -> Result<TelemetryGuard> {
    match otel_endpoint {
        Some(endpoint) if !endpoint.is_empty() => {
            let telemetry = Telemetry::init(log_level, &endpoint)?;
            info!(%endpoint, "OTLP telemetry enabled");
            Ok(TelemetryGuard::Otel(telemetry))
        }
        _ => {
            FileTelemetry::init_files(log_level, log_dir)?;
            Ok(TelemetryGuard::Files)
        }
    }
}

static RESOURCE: OnceLock<Resource> = OnceLock::new();
fn get_resource() -> Resource {
    RESOURCE
        .get_or_init(|| Resource::builder().with_service_name(SERVICE_NAME).build())
        .clone()
}

fn env_filter(log_level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level.as_directive()))
}

fn init_logs(end_point: &str) -> Result<SdkLoggerProvider> {
    let exporter = LogExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(format!("{}/v1/logs", end_point.trim_end_matches('/')))
        .build()
        .context("building OTLP log exporter")?;
    Ok(SdkLoggerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(get_resource())
        .build())
}

fn init_traces(end_point: &str) -> Result<SdkTracerProvider> {
    let exporter = SpanExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(format!("{}/v1/traces", end_point.trim_end_matches('/')))
        .build()
        .context("building OTLP span exporter")?;
    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(get_resource())
        .build())
}

pub struct Telemetry {
    /// emits OTel Logs from `tracing::event!`
    pub logger_provider: SdkLoggerProvider,
    /// emits OTel Spans
    pub tracer_provider: SdkTracerProvider,
}

impl Telemetry {
    pub fn init(log_level: LogLevel, endpoint: &str) -> Result<Self> {
        let logger_provider = init_logs(endpoint)?;
        let tracer_provider = init_traces(endpoint)?;

        // keep the exporter's own HTTP stack out of the bridge, or it logs itself
        let otel_logs_layer = {
            let filter = env_filter(log_level)
                .add_directive("hyper=off".parse()?)
                .add_directive("h2=off".parse()?)
                .add_directive("reqwest=off".parse()?);
            OpenTelemetryTracingBridge::new(&logger_provider).with_filter(filter)
        };

        let fmt_layer = tfmt::layer()
            .with_thread_names(true)
            .with_filter(env_filter(log_level));

        Registry::default()
            .with(otel_logs_layer)
            .with(fmt_layer)
            .try_init()
            .context("installing tracing subscriber")?;

        global::set_tracer_provider(tracer_provider.clone());

        Ok(Telemetry {
            logger_provider,
            tracer_provider,
        })
    }

    pub fn shutdown(self) {
        if let Err(e) = self.tracer_provider.shutdown() {
            warn!("tracer provider shutdown failed: {e}");
        }
        if let Err(e) = self.logger_provider.shutdown() {
            warn!("logger provider shutdown failed: {e}");
        }
    }
}

/// File-only logging.
pub struct FileTelemetry;

impl FileTelemetry {
    /// - `log_dir/vulhub-flex.log` receives human-readable lines.
    /// - `log_dir/vulhub-flex.json` receives newline-delimited JSON.
    pub fn init_files(log_level: LogLevel, log_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(log_dir)
            .with_context(|| format!("creating log dir {}", log_dir.display()))?;

        let txt_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, "vulhub-flex.log");
        let txt_layer = tfmt::layer().with_writer(txt_appender).with_ansi(false);

        let json_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, "vulhub-flex.json");
        let json_layer = tfmt::layer()
            .json()
            .with_writer(json_appender)
            .with_target(true);

        let stdout_layer = tfmt::layer().with_target(false);

        Registry::default()
            .with(env_filter(log_level))
            .with(txt_layer)
            .with(json_layer)
            .with(stdout_layer)
            .try_init()
            .context("installing tracing subscriber")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cli_levels() {
        assert_eq!("INFO".parse::<LogLevel>(), Ok(LogLevel::Info));
        assert_eq!("warning".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert_eq!("critical".parse::<LogLevel>(), Ok(LogLevel::Error));
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn levels_order_by_severity() {
        assert!(LogLevel::Error > LogLevel::Warn);
        assert!(LogLevel::Trace < LogLevel::Debug);
        assert_eq!(LogLevel::default().to_string(), "info");
    }
}
