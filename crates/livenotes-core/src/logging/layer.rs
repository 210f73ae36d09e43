//! Tracing layer that feeds the [`DebugLog`].

use std::fmt::Write as FmtWrite;

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

use super::{DebugLog, LogEntry};
use crate::types::now_millis;

/// Mirrors events at or above `max_level` verbosity into a [`DebugLog`].
///
/// Defaults to `INFO`, so per-frame `debug!` traffic stays out of the
/// user-visible history.
pub struct DebugLogLayer {
    log: DebugLog,
    max_level: Level,
}

impl DebugLogLayer {
    pub fn new(log: DebugLog) -> Self {
        Self {
            log,
            max_level: Level::INFO,
        }
    }

    pub fn with_max_level(mut self, level: Level) -> Self {
        self.max_level = level;
        self
    }

    pub fn log(&self) -> &DebugLog {
        &self.log
    }
}

impl<S> Layer<S> for DebugLogLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if *metadata.level() > self.max_level {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        self.log.push(LogEntry {
            at: now_millis(),
            level: metadata.level().as_str().to_lowercase(),
            target: metadata.target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields: visitor.fields,
        });
    }
}

/// Collects the message and the remaining fields as strings
#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: Vec<(String, String)>,
}

impl FieldVisitor {
    fn put(&mut self, field: &Field, value: String) {
        if field.name() == "message" {
            self.message = Some(value);
        } else {
            self.fields.push((field.name().to_string(), value));
        }
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let mut buf = String::new();
        let _ = write!(&mut buf, "{:?}", value);
        self.put(field, buf);
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, value.to_string());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, value.to_string());
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.put(field, value.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::prelude::*;

    #[test]
    fn test_layer_captures_events() {
        let log = DebugLog::new();
        let subscriber = tracing_subscriber::registry().with(DebugLogLayer::new(log.clone()));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("Advertising");
            tracing::warn!(peer = "AA", count = 2, "Peer dropped");
            tracing::debug!("Too chatty");
        });

        let entries = log.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "Peer dropped");
        assert_eq!(entries[0].level, "warn");
        assert_eq!(
            entries[0].fields,
            vec![("peer".to_string(), "AA".to_string()), ("count".to_string(), "2".to_string())]
        );
        assert_eq!(entries[1].message, "Advertising");
    }

    #[test]
    fn test_max_level() {
        let log = DebugLog::new();
        let layer = DebugLogLayer::new(log.clone()).with_max_level(Level::DEBUG);
        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, || {
            tracing::debug!("kept");
            tracing::trace!("dropped");
        });
        assert_eq!(log.len(), 1);
    }
}
