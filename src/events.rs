use std::io::Write;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. Logs go to stderr; stdout carries the
/// terminal passthrough. A second call keeps the first subscriber.
pub fn init_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Session milestones for wrappers driving `cc-bridge start` with
/// `--json-events`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    #[serde(rename_all = "camelCase")]
    SessionStarted {
        session_id: String,
        name: String,
        hook_port: u16,
    },
    RelayState {
        state: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        attempt: Option<u32>,
    },
    #[serde(rename_all = "camelCase")]
    Paired { session_id: String },
    #[serde(rename_all = "camelCase")]
    ViewerDisconnected { session_id: String },
    #[serde(rename_all = "camelCase")]
    SessionEnded { session_id: String },
}

#[derive(Serialize)]
struct EventLine<'a> {
    ts: String,
    #[serde(flatten)]
    event: &'a LifecycleEvent,
}

/// One JSON object per line on stderr; silent unless enabled.
#[derive(Clone, Debug)]
pub struct EventEmitter {
    enabled: bool,
}

impl EventEmitter {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn emit(&self, event: LifecycleEvent) {
        if !self.enabled {
            return;
        }
        if let Some(line) = render(&event) {
            let _ = writeln!(std::io::stderr().lock(), "{line}");
        }
    }
}

fn render(event: &LifecycleEvent) -> Option<String> {
    let line = EventLine {
        ts: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        event,
    };
    serde_json::to_string(&line).ok()
}
