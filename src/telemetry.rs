//! Log subscriber setup. `LOG_FORMAT=json` (default) emits one JSON object per
//! line stamped with service identity; anything else gets compact text.

use std::fmt;

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt as tfmt, prelude::*, EnvFilter, Registry};

use crate::config::AppConfig;

pub const SERVICE_NAME: &str = "fleetd";

pub fn init(cfg: &AppConfig) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    let subscriber = Registry::default().with(env_filter);

    if cfg.log_format == "json" {
        let formatter = JsonLineFormatter::new(
            SERVICE_NAME.to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
            cfg.env.clone(),
            cfg.node_name.clone(),
        );
        subscriber.with(tfmt::layer().event_format(formatter)).try_init()?;
    } else {
        subscriber.with(tfmt::layer().compact()).try_init()?;
    }
    Ok(())
}

pub struct JsonLineFormatter {
    service: String,
    version: String,
    env: String,
    node: String,
}

impl JsonLineFormatter {
    pub fn new(service: String, version: String, env: String, node: String) -> Self {
        Self {
            service,
            version,
            env,
            node,
        }
    }
}

impl<S, N> FormatEvent<S, N> for JsonLineFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(&self, _ctx: &FmtContext<'_, S, N>, mut writer: Writer<'_>, event: &Event<'_>) -> fmt::Result {
        let meta = event.metadata();
        let mut fields = FieldCollector::default();
        event.record(&mut fields);

        let mut record = Map::new();
        record.insert("ts".into(), Value::from(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)));
        record.insert("level".into(), Value::from(meta.level().as_str()));
        record.insert("service".into(), Value::from(self.service.as_str()));
        record.insert("version".into(), Value::from(self.version.as_str()));
        record.insert("env".into(), Value::from(self.env.as_str()));
        record.insert("node".into(), Value::from(self.node.as_str()));
        record.insert("target".into(), Value::from(meta.target()));
        record.insert("event".into(), Value::from(fields.event.unwrap_or_else(|| "LOG".into())));
        record.insert("message".into(), Value::from(fields.message.unwrap_or_default()));
        if !fields.attributes.is_empty() {
            record.insert("attributes".into(), Value::Object(fields.attributes));
        }

        writeln!(writer, "{}", Value::Object(record))
    }
}

#[derive(Default)]
struct FieldCollector {
    event: Option<String>,
    message: Option<String>,
    attributes: Map<String, Value>,
}

impl FieldCollector {
    fn put(&mut self, field: &Field, value: Value) {
        match field.name() {
            "event" => self.event = value.as_str().map(str::to_string).or_else(|| Some(value.to_string())),
            "message" => self.message = value.as_str().map(str::to_string).or_else(|| Some(value.to_string())),
            name => {
                self.attributes.insert(name.to_string(), value);
            }
        }
    }
}

impl Visit for FieldCollector {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, Value::from(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.put(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, Value::from(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.put(field, Value::from(format!("{value:?}")));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn json_lines_carry_identity_and_fields() {
        let buffer = Buffer::default();
        let writer = buffer.clone();
        let subscriber = tfmt()
            .event_format(JsonLineFormatter::new(
                "fleetd".into(),
                "1.0.0".into(),
                "test".into(),
                "NODE-A".into(),
            ))
            .with_writer(move || writer.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(event = "INSTANCE_RUNNING", instance = %"lobby-1a2b3c4d", port = 30000u64, "Instance registered");
        });

        let out = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        let line: Value = serde_json::from_str(out.trim()).unwrap();
        assert_eq!(line["level"], "INFO");
        assert_eq!(line["service"], "fleetd");
        assert_eq!(line["node"], "NODE-A");
        assert_eq!(line["event"], "INSTANCE_RUNNING");
        assert_eq!(line["message"], "Instance registered");
        assert_eq!(line["attributes"]["instance"], "lobby-1a2b3c4d");
        assert_eq!(line["attributes"]["port"], 30000);
    }

    #[test]
    fn events_without_tag_are_plain_logs() {
        let buffer = Buffer::default();
        let writer = buffer.clone();
        let subscriber = tfmt()
            .event_format(JsonLineFormatter::new("fleetd".into(), "1".into(), "dev".into(), "N".into()))
            .with_writer(move || writer.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || tracing::warn!("plain"));

        let out = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        let line: Value = serde_json::from_str(out.trim()).unwrap();
        assert_eq!(line["event"], "LOG");
        assert_eq!(line["level"], "WARN");
        assert!(line.get("attributes").is_none());
    }
}
