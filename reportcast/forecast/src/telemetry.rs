use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use serde_json::Value;
use shared_event_bus::{EventPublisher, EventRecord};
use shared_logging::{JsonLogger, LogLevel, LogRecord};
use tokio::runtime::{Handle, Runtime};
use uuid::Uuid;

/// Builder for forecast telemetry sinks.
pub struct ForecastTelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    log_level: LogLevel,
    event_publisher: Option<Arc<dyn EventPublisher>>,
}

impl ForecastTelemetryBuilder {
    /// Creates the builder.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            log_path: None,
            log_level: LogLevel::Debug,
            event_publisher: None,
        }
    }

    /// Sets the JSON-lines log path.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Lowest level written to the log file.
    #[must_use]
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    /// Sets the event publisher.
    #[must_use]
    pub fn event_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.event_publisher = Some(publisher);
        self
    }

    /// Builds the telemetry handle.
    pub fn build(self) -> Result<ForecastTelemetry> {
        let logger = match self.log_path {
            Some(path) => Some(JsonLogger::with_min_level(path, self.log_level)?),
            None => None,
        };
        Ok(ForecastTelemetry {
            inner: Arc::new(TelemetryInner {
                module: self.module,
                logger,
                publisher: self.event_publisher,
            }),
        })
    }
}

/// Telemetry handle shared across forecast components.
///
/// Every log call is mirrored to `tracing`; the JSON log and event bus are optional.
#[derive(Clone)]
pub struct ForecastTelemetry {
    inner: Arc<TelemetryInner>,
}

impl fmt::Debug for ForecastTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForecastTelemetry")
            .field("module", &self.inner.module)
            .field("json_log", &self.inner.logger.as_ref().map(JsonLogger::path))
            .field("events", &self.inner.publisher.is_some())
            .finish()
    }
}

struct TelemetryInner {
    module: String,
    logger: Option<JsonLogger>,
    publisher: Option<Arc<dyn EventPublisher>>,
}

impl ForecastTelemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> ForecastTelemetryBuilder {
        ForecastTelemetryBuilder::new(module)
    }

    /// Telemetry that only feeds `tracing`.
    #[must_use]
    pub fn tracing_only(module: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TelemetryInner {
                module: module.into(),
                logger: None,
                publisher: None,
            }),
        }
    }

    /// Component name stamped on records.
    #[must_use]
    pub fn module(&self) -> &str {
        &self.inner.module
    }

    /// Logs a structured message.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        let module = self.inner.module.as_str();
        match level {
            LogLevel::Debug => tracing::debug!(module, %metadata, "{message}"),
            LogLevel::Info => tracing::info!(module, %metadata, "{message}"),
            LogLevel::Warn => tracing::warn!(module, %metadata, "{message}"),
            LogLevel::Error => tracing::error!(module, %metadata, "{message}"),
        }
        if let Some(logger) = &self.inner.logger {
            logger.log(&LogRecord::new(module, level, message).with_metadata(&metadata))?;
        }
        Ok(())
    }

    /// Emits an event on the bus, if one is attached.
    pub fn event(&self, event_type: &str, payload: Value) -> Result<()> {
        let Some(publisher) = &self.inner.publisher else {
            return Ok(());
        };
        let record = EventRecord::new(
            format!("evt-{}", Uuid::new_v4()),
            self.inner.module.clone(),
            event_type,
            payload,
        );
        if let Ok(handle) = Handle::try_current() {
            let publisher = Arc::clone(publisher);
            handle.spawn(async move {
                if let Err(err) = publisher.publish(record).await {
                    tracing::warn!("telemetry event publish failed: {err:?}");
                }
            });
            Ok(())
        } else {
            Runtime::new()?.block_on(publisher.publish(record))
        }
    }

    /// Logs, reporting sink failures to `tracing` only.
    pub(crate) fn note(&self, level: LogLevel, message: &str, metadata: Value) {
        if let Err(err) = self.log(level, message, metadata) {
            tracing::warn!("telemetry log write failed: {err:?}");
        }
    }

    /// Emits an event and ignores publish failures.
    pub(crate) fn announce(&self, event_type: &str, payload: Value) {
        if let Err(err) = self.event(event_type, payload) {
            tracing::warn!("telemetry event failed: {err:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared_event_bus::MemoryEventBus;
    use tempfile::tempdir;

    #[test]
    fn telemetry_writes_log_and_event() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("forecast.log");
        let bus = Arc::new(MemoryEventBus::new(16));
        let telemetry = ForecastTelemetry::builder("forecast")
            .log_path(&path)
            .log_level(LogLevel::Info)
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        telemetry
            .log(LogLevel::Debug, "forecast.debug.dropped", json!({}))
            .unwrap();
        telemetry
            .log(LogLevel::Info, "forecast.retrain.completed", json!({ "rows": 1 }))
            .unwrap();
        telemetry
            .event("forecast.retrain.completed", json!({ "rows": 1 }))
            .unwrap();
        let records = shared_logging::read_records(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].module, "forecast");
        assert_eq!(bus.events_of("forecast.retrain.completed").len(), 1);
    }

    #[test]
    fn tracing_only_telemetry_accepts_everything() {
        let telemetry = ForecastTelemetry::tracing_only("forecast");
        assert!(telemetry.log(LogLevel::Warn, "w", json!({})).is_ok());
        assert!(telemetry.event("forecast.noop", json!({})).is_ok());
        assert_eq!(telemetry.module(), "forecast");
    }
}
