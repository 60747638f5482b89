//! Structured lifecycle events posted by the agent's hook commands.
//!
//! Hook commands POST their JSON payload to a loopback listener. The
//! handler only queues the raw value and answers at once; a single worker
//! turns queued payloads into semantic messages and status updates in
//! arrival order.

use std::net::SocketAddr;
use std::path::Path;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{BridgeError, Result};
use crate::protocol::{
    permission_options, AgentStatus, MessageKind, PermissionInfo, SemanticMessage, ToolInfo,
};

pub const DEFAULT_HOOK_PORT: u16 = 19789;

/// Environment variable carrying the per-session listener port to hook
/// commands started inside the PTY.
pub const HOOK_PORT_ENV: &str = "CC_BRIDGE_HOOK_PORT";

/// Raw payloads waiting for the ingest worker.
const HOOK_QUEUE_DEPTH: usize = 256;

/// Longest tool response forwarded verbatim, in characters.
const TOOL_RESULT_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HookEventName {
    #[serde(rename = "Stop", alias = "turnComplete")]
    TurnComplete,
    #[serde(alias = "notification")]
    Notification,
    #[serde(rename = "PreToolUse", alias = "toolPreUse")]
    ToolPreUse,
    #[serde(rename = "PostToolUse", alias = "toolPostUse")]
    ToolPostUse,
    #[serde(alias = "userPromptSubmit")]
    UserPromptSubmit,
    #[serde(alias = "sessionStart")]
    SessionStart,
    #[serde(alias = "sessionEnd")]
    SessionEnd,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    #[serde(alias = "permissionPrompt")]
    PermissionPrompt,
    #[serde(alias = "idlePrompt")]
    IdlePrompt,
    #[serde(alias = "elicitationDialog")]
    ElicitationDialog,
    AuthSuccess,
    #[serde(other)]
    Other,
}

/// Payload a hook command delivers. Only the event name is required.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookEventInput {
    pub hook_event_name: HookEventName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_hook_active: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_type: Option<NotificationType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl HookEventInput {
    pub fn new(hook_event_name: HookEventName) -> Self {
        Self {
            hook_event_name,
            session_id: None,
            transcript_path: None,
            cwd: None,
            permission_mode: None,
            stop_hook_active: None,
            message: None,
            notification_type: None,
            tool_name: None,
            tool_input: None,
            tool_response: None,
            tool_use_id: None,
            prompt: None,
            source: None,
            model: None,
        }
    }

    fn tool_input_str(&self, field: &str) -> Option<String> {
        self.tool_input
            .as_ref()?
            .get(field)
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: AgentStatus,
    pub message: Option<String>,
}

impl StatusUpdate {
    fn new(status: AgentStatus, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            status,
            message: (!message.is_empty()).then_some(message),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IngestedEvent {
    pub message: Option<SemanticMessage>,
    pub status: Option<StatusUpdate>,
}

/// Map one hook event to the message and status it implies.
///
/// Session start/end and unrecognised events carry nothing for the viewer.
pub fn ingest(input: &HookEventInput) -> Option<IngestedEvent> {
    let event = match input.hook_event_name {
        HookEventName::TurnComplete => {
            let reply = input
                .transcript_path
                .as_deref()
                .and_then(|path| last_assistant_text(Path::new(path)))
                .filter(|text| !text.trim().is_empty());
            IngestedEvent {
                message: reply.map(|text| SemanticMessage::new(MessageKind::AgentReply, text)),
                status: Some(StatusUpdate::new(AgentStatus::Idle, "Waiting for input")),
            }
        }
        HookEventName::Notification => ingest_notification(input),
        HookEventName::ToolPreUse => ingest_tool_pre_use(input),
        HookEventName::ToolPostUse => ingest_tool_post_use(input),
        HookEventName::UserPromptSubmit => {
            let prompt = input.prompt.clone().unwrap_or_default();
            IngestedEvent {
                message: (!prompt.trim().is_empty())
                    .then(|| SemanticMessage::new(MessageKind::UserInput, prompt)),
                status: Some(StatusUpdate::new(AgentStatus::Working, "Processing")),
            }
        }
        HookEventName::SessionStart | HookEventName::SessionEnd | HookEventName::Other => {
            return None
        }
    };
    Some(event)
}

fn ingest_notification(input: &HookEventInput) -> IngestedEvent {
    let text = input.message.clone().unwrap_or_default();
    match input.notification_type {
        Some(NotificationType::PermissionPrompt) => IngestedEvent {
            message: Some(
                SemanticMessage::new(MessageKind::PermissionRequest, text.clone())
                    .with_options(permission_options())
                    .with_permission(PermissionInfo {
                        action: (!text.is_empty()).then(|| text.clone()),
                        ..PermissionInfo::default()
                    })
                    .ensure_interaction_defaults(),
            ),
            status: Some(StatusUpdate::new(AgentStatus::WaitingPermission, text)),
        },
        Some(NotificationType::IdlePrompt) => IngestedEvent {
            message: None,
            status: Some(StatusUpdate::new(AgentStatus::Idle, "Waiting for input")),
        },
        Some(NotificationType::ElicitationDialog) => IngestedEvent {
            message: Some(
                SemanticMessage::new(MessageKind::SelectionDialog, text.clone())
                    .ensure_interaction_defaults(),
            ),
            status: Some(StatusUpdate::new(AgentStatus::WaitingInput, text)),
        },
        _ => IngestedEvent {
            message: None,
            status: Some(StatusUpdate::new(AgentStatus::Working, text)),
        },
    }
}

fn tool_info(input: &HookEventInput) -> ToolInfo {
    let name = input
        .tool_name
        .clone()
        .unwrap_or_else(|| "Unknown".to_string());
    let command = (name == "Bash")
        .then(|| input.tool_input_str("command"))
        .flatten();
    let file_path = input
        .tool_input_str("file_path")
        .or_else(|| input.tool_input_str("notebook_path"));
    let args = command
        .clone()
        .or_else(|| file_path.clone())
        .or_else(|| input.tool_input_str("pattern"))
        .or_else(|| input.tool_input_str("url"));

    ToolInfo {
        name,
        args,
        file_path,
        command,
        description: input.tool_input_str("description"),
        result: None,
    }
}

fn ingest_tool_pre_use(input: &HookEventInput) -> IngestedEvent {
    let tool = tool_info(input);
    let status = format!("Running {}", tool.name);
    IngestedEvent {
        message: Some(SemanticMessage::new(MessageKind::ToolCall, tool.label()).with_tool(tool)),
        status: Some(StatusUpdate::new(AgentStatus::Working, status)),
    }
}

fn tool_result_summary(response: &Value) -> String {
    if let Some(text) = response.as_str() {
        return text.to_string();
    }
    if let Some(success) = response.get("success").and_then(Value::as_bool) {
        return if success { "succeeded" } else { "failed" }.to_string();
    }
    response
        .to_string()
        .chars()
        .take(TOOL_RESULT_PREVIEW_CHARS)
        .collect()
}

fn ingest_tool_post_use(input: &HookEventInput) -> IngestedEvent {
    let tool = ToolInfo {
        result: input.tool_response.as_ref().map(tool_result_summary),
        ..tool_info(input)
    };
    IngestedEvent {
        message: Some(
            SemanticMessage::new(MessageKind::ToolResult, format!("{} finished", tool.label()))
                .with_tool(tool),
        ),
        status: Some(StatusUpdate::new(AgentStatus::Working, "")),
    }
}

/// Text of the last assistant turn in a JSONL transcript.
pub fn last_assistant_text(path: &Path) -> Option<String> {
    let transcript = match std::fs::read_to_string(path) {
        Ok(transcript) => transcript,
        Err(error) => {
            tracing::debug!(
                target = "cc_bridge::hooks",
                path = %path.display(),
                error = %error,
                "transcript unreadable"
            );
            return None;
        }
    };

    transcript.lines().rev().find_map(|line| {
        let entry: Value = serde_json::from_str(line).ok()?;
        if entry.get("type").and_then(Value::as_str) != Some("assistant") {
            return None;
        }
        match entry.pointer("/message/content")? {
            Value::String(text) => Some(text.clone()),
            Value::Array(blocks) => Some(
                blocks
                    .iter()
                    .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
                    .filter_map(|block| block.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("\n"),
            ),
            _ => None,
        }
    })
}

// ---------------------------------------------------------------------------
// HTTP listener
// ---------------------------------------------------------------------------

pub fn hook_router(tx: mpsc::Sender<Value>) -> axum::Router {
    use axum::{routing, Router};

    Router::new()
        .route("/hook", routing::post(receive_hook))
        .route("/health", routing::get(hook_health))
        .with_state(tx)
}

async fn hook_health() -> axum::Json<Value> {
    axum::Json(json!({ "status": "ok" }))
}

async fn receive_hook(
    axum::extract::State(tx): axum::extract::State<mpsc::Sender<Value>>,
    body: Bytes,
) -> (StatusCode, axum::Json<Value>) {
    let Ok(payload) = serde_json::from_slice::<Value>(&body) else {
        return (
            StatusCode::BAD_REQUEST,
            axum::Json(json!({ "error": "Invalid JSON" })),
        );
    };
    // The hook command is waiting on this response; never make it wait on
    // the worker as well.
    if let Err(error) = tx.try_send(payload) {
        tracing::warn!(target = "cc_bridge::hooks", error = %error, "dropping hook event");
    }
    (StatusCode::OK, axum::Json(json!({ "success": true })))
}

/// Bind the loopback hook listener. A port already in use is fatal to
/// session start.
pub async fn serve_hooks(
    port: u16,
    tx: mpsc::Sender<Value>,
) -> Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .map_err(|error| BridgeError::Resource(format!("hook port {port} unavailable: {error}")))?;
    let addr = listener
        .local_addr()
        .map_err(|error| BridgeError::Resource(error.to_string()))?;
    let router = hook_router(tx);
    let handle = tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, router).await {
            tracing::error!(target = "cc_bridge::hooks", error = %error, "hook listener stopped");
        }
    });
    tracing::info!(target = "cc_bridge::hooks", addr = %addr, "hook listener bound");
    Ok((addr, handle))
}

pub fn hook_queue() -> (mpsc::Sender<Value>, mpsc::Receiver<Value>) {
    mpsc::channel(HOOK_QUEUE_DEPTH)
}

/// Drain queued payloads one at a time, forwarding what they imply.
pub fn spawn_ingest_worker(
    mut raw_rx: mpsc::Receiver<Value>,
    out_tx: mpsc::Sender<IngestedEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(raw) = raw_rx.recv().await {
            let input: HookEventInput = match serde_json::from_value(raw) {
                Ok(input) => input,
                Err(error) => {
                    tracing::warn!(target = "cc_bridge::hooks", error = %error, "malformed hook payload");
                    continue;
                }
            };
            tracing::debug!(
                target = "cc_bridge::hooks",
                event = ?input.hook_event_name,
                "hook event"
            );
            // Transcript reads can be large; keep them off the runtime threads.
            let ingested = match tokio::task::spawn_blocking(move || ingest(&input)).await {
                Ok(ingested) => ingested,
                Err(error) => {
                    tracing::warn!(target = "cc_bridge::hooks", error = %error, "ingest task failed");
                    continue;
                }
            };
            if let Some(event) = ingested {
                if out_tx.send(event).await.is_err() {
                    break;
                }
            }
        }
    })
}

/// Event named by `cc-bridge-hook <event> [sub-type]`. An unrecognised
/// notification sub-type leaves the notification type unset.
pub fn forwarded_event(
    event: &str,
    sub_type: Option<&str>,
) -> Option<(HookEventName, Option<NotificationType>)> {
    let name = match event {
        "stop" => HookEventName::TurnComplete,
        "notification" => {
            let kind = match sub_type {
                Some("permission") => Some(NotificationType::PermissionPrompt),
                Some("idle") => Some(NotificationType::IdlePrompt),
                Some("elicitation") => Some(NotificationType::ElicitationDialog),
                _ => None,
            };
            return Some((HookEventName::Notification, kind));
        }
        "pre-tool" => HookEventName::ToolPreUse,
        "post-tool" => HookEventName::ToolPostUse,
        "user-prompt" => HookEventName::UserPromptSubmit,
        _ => return None,
    };
    Some((name, None))
}

/// Overwrite the event fields of a hook payload. Non-object payloads are
/// replaced by an object.
pub fn stamp_payload(
    payload: &mut Value,
    name: HookEventName,
    notification_type: Option<NotificationType>,
) {
    if !payload.is_object() {
        *payload = json!({});
    }
    if let Some(map) = payload.as_object_mut() {
        map.insert("hook_event_name".into(), json!(name));
        if let Some(kind) = notification_type {
            map.insert("notification_type".into(), json!(kind));
        }
    }
}

// ---------------------------------------------------------------------------
// Source arbitration
// ---------------------------------------------------------------------------

pub const DEFAULT_OVERLAP_WINDOW: Duration = Duration::from_secs(5);

/// Decides whether scraped terminal output or hook events speak for the
/// session.
///
/// Hook events are authoritative when hooks are installed or one arrived
/// recently. Selection dialogs still come from scraping because hooks do
/// not carry their choices.
#[derive(Debug, Clone)]
pub struct SourceArbiter {
    hooks_installed: bool,
    overlap: Duration,
    last_hook_event: Option<Instant>,
}

impl SourceArbiter {
    pub fn new(hooks_installed: bool) -> Self {
        Self {
            hooks_installed,
            overlap: DEFAULT_OVERLAP_WINDOW,
            last_hook_event: None,
        }
    }

    pub fn with_overlap(mut self, overlap: Duration) -> Self {
        self.overlap = overlap;
        self
    }

    pub fn record_hook_event(&mut self, now: Instant) {
        self.last_hook_event = Some(now);
    }

    pub fn structured_mode(&self, now: Instant) -> bool {
        self.hooks_installed
            || self
                .last_hook_event
                .is_some_and(|seen| now.duration_since(seen) < self.overlap)
    }

    pub fn admits_scraped(&self, message: &SemanticMessage, now: Instant) -> bool {
        !self.structured_mode(now) || message.kind == MessageKind::SelectionDialog
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::{Duration, Instant};

    use serde_json::json;

    use super::*;
    use crate::protocol::ActionType;

    #[test]
    fn forwarder_arguments_stamp_event_fields() {
        let (name, kind) = forwarded_event("notification", Some("permission")).unwrap();
        let mut payload = json!({ "session_id": "abc", "message": "Allow?" });
        stamp_payload(&mut payload, name, kind);
        assert_eq!(payload["hook_event_name"], "Notification");
        assert_eq!(payload["notification_type"], "permission_prompt");
        assert_eq!(payload["session_id"], "abc");

        let (name, kind) = forwarded_event("stop", None).unwrap();
        let mut payload = json!("not an object");
        stamp_payload(&mut payload, name, kind);
        assert_eq!(payload, json!({ "hook_event_name": "Stop" }));

        assert_eq!(
            forwarded_event("notification", Some("bogus")),
            Some((HookEventName::Notification, None))
        );
        assert_eq!(forwarded_event("pre-tool", None).map(|(n, _)| n), Some(HookEventName::ToolPreUse));
        assert!(forwarded_event("restart", None).is_none());
    }

    fn parse(value: Value) -> HookEventInput {
        serde_json::from_value(value).expect("valid hook payload")
    }

    #[test]
    fn event_names_accept_both_spellings() {
        let input = parse(json!({ "hook_event_name": "PreToolUse" }));
        assert_eq!(input.hook_event_name, HookEventName::ToolPreUse);
        let input = parse(json!({ "hook_event_name": "turnComplete" }));
        assert_eq!(input.hook_event_name, HookEventName::TurnComplete);
        let input = parse(json!({ "hook_event_name": "PreCompact" }));
        assert_eq!(input.hook_event_name, HookEventName::Other);
        assert!(ingest(&input).is_none());
    }

    #[test]
    fn turn_complete_reads_last_assistant_turn() {
        let mut transcript = tempfile::NamedTempFile::new().expect("temp transcript");
        for entry in [
            json!({"type": "user", "message": {"content": "hi"}}),
            json!({"type": "assistant", "message": {"content": "old reply"}}),
            json!({"type": "assistant", "message": {"content": [
                {"type": "text", "text": "Done."},
                {"type": "tool_use", "name": "Bash"},
                {"type": "text", "text": "All green."}
            ]}}),
        ] {
            writeln!(transcript, "{entry}").unwrap();
        }
        writeln!(transcript, "not json").unwrap();

        let mut input = HookEventInput::new(HookEventName::TurnComplete);
        input.transcript_path = Some(transcript.path().display().to_string());
        let event = ingest(&input).unwrap();
        let message = event.message.unwrap();
        assert_eq!(message.kind, MessageKind::AgentReply);
        assert_eq!(message.content, "Done.\nAll green.");
        assert_eq!(event.status.unwrap().status, AgentStatus::Idle);
    }

    #[test]
    fn turn_complete_without_transcript_only_reports_idle() {
        let mut input = HookEventInput::new(HookEventName::TurnComplete);
        input.transcript_path = Some("/nonexistent/transcript.jsonl".into());
        let event = ingest(&input).unwrap();
        assert!(event.message.is_none());
        assert_eq!(event.status.unwrap().status, AgentStatus::Idle);
    }

    #[test]
    fn permission_notification() {
        let input = parse(json!({
            "hook_event_name": "Notification",
            "notification_type": "permission_prompt",
            "message": "Claude needs your permission to use Bash"
        }));
        let event = ingest(&input).unwrap();
        let message = event.message.unwrap();
        assert_eq!(message.kind, MessageKind::PermissionRequest);
        assert!(message.requires_response);
        assert_eq!(message.options[2].action_type, Some(ActionType::AlwaysAllow));
        let status = event.status.unwrap();
        assert_eq!(status.status, AgentStatus::WaitingPermission);
        assert_eq!(
            status.message.as_deref(),
            Some("Claude needs your permission to use Bash")
        );
    }

    #[test]
    fn idle_elicitation_and_other_notifications() {
        let idle = parse(json!({"hook_event_name": "Notification", "notification_type": "idle_prompt"}));
        let event = ingest(&idle).unwrap();
        assert!(event.message.is_none());
        assert_eq!(event.status.unwrap().status, AgentStatus::Idle);

        let dialog = parse(json!({
            "hook_event_name": "Notification",
            "notification_type": "elicitation_dialog",
            "message": "Choose a branch"
        }));
        let event = ingest(&dialog).unwrap();
        let message = event.message.unwrap();
        assert_eq!(message.kind, MessageKind::SelectionDialog);
        assert_eq!(message.options.len(), 1);
        assert_eq!(event.status.unwrap().status, AgentStatus::WaitingInput);

        let other = parse(json!({"hook_event_name": "Notification", "notification_type": "auth_success"}));
        assert_eq!(ingest(&other).unwrap().status.unwrap().status, AgentStatus::Working);
    }

    #[test]
    fn tool_pre_use_prefers_command_for_bash() {
        let bash = parse(json!({
            "hook_event_name": "PreToolUse",
            "tool_name": "Bash",
            "tool_input": {"command": "cargo test", "description": "Run tests"}
        }));
        let message = ingest(&bash).unwrap().message.unwrap();
        assert_eq!(message.kind, MessageKind::ToolCall);
        assert_eq!(message.content, "Bash(cargo test)");
        let tool = message.tool.unwrap();
        assert_eq!(tool.args.as_deref(), Some("cargo test"));
        assert_eq!(tool.command.as_deref(), Some("cargo test"));
        assert_eq!(tool.description.as_deref(), Some("Run tests"));

        let edit = parse(json!({
            "hook_event_name": "PreToolUse",
            "tool_name": "Edit",
            "tool_input": {"file_path": "/src/lib.rs"}
        }));
        let tool = ingest(&edit).unwrap().message.unwrap().tool.unwrap();
        assert_eq!(tool.args.as_deref(), Some("/src/lib.rs"));
        assert_eq!(tool.file_path.as_deref(), Some("/src/lib.rs"));
        assert_eq!(tool.command, None);
    }

    #[test]
    fn tool_post_use_summarises_response() {
        let mut input = HookEventInput::new(HookEventName::ToolPostUse);
        input.tool_name = Some("Write".into());
        input.tool_response = Some(json!({"success": false}));
        input.tool_input = Some(json!({"file_path": "notes.md"}));
        let message = ingest(&input).unwrap().message.unwrap();
        assert_eq!(message.kind, MessageKind::ToolResult);
        assert_eq!(message.content, "Write(notes.md) finished");
        assert_eq!(message.tool.unwrap().result.as_deref(), Some("failed"));

        input.tool_response = Some(json!({"stdout": "x".repeat(500)}));
        let result = ingest(&input).unwrap().message.unwrap().tool.unwrap().result.unwrap();
        assert_eq!(result.chars().count(), 200);

        input.tool_response = Some(json!("plain output"));
        let result = ingest(&input).unwrap().message.unwrap().tool.unwrap().result;
        assert_eq!(result.as_deref(), Some("plain output"));
    }

    #[test]
    fn prompt_submit_yields_user_input() {
        let input = parse(json!({"hook_event_name": "UserPromptSubmit", "prompt": "add tests"}));
        let event = ingest(&input).unwrap();
        assert_eq!(event.message.unwrap().content, "add tests");
        assert_eq!(event.status.unwrap().status, AgentStatus::Working);
    }

    #[test]
    fn arbiter_prefers_hooks_when_recent() {
        let start = Instant::now();
        let mut arbiter = SourceArbiter::new(false).with_overlap(Duration::from_secs(5));
        let reply = SemanticMessage::new(MessageKind::AgentReply, "hello");
        let dialog = SemanticMessage::new(MessageKind::SelectionDialog, "Pick?");

        assert!(arbiter.admits_scraped(&reply, start));
        arbiter.record_hook_event(start);
        assert!(!arbiter.admits_scraped(&reply, start + Duration::from_secs(1)));
        assert!(arbiter.admits_scraped(&dialog, start + Duration::from_secs(1)));
        assert!(arbiter.admits_scraped(&reply, start + Duration::from_secs(6)));

        let installed = SourceArbiter::new(true);
        assert!(installed.structured_mode(start));
    }

    #[tokio::test]
    async fn worker_preserves_arrival_order_and_skips_malformed() {
        let (raw_tx, raw_rx) = hook_queue();
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let worker = spawn_ingest_worker(raw_rx, out_tx);

        raw_tx
            .send(json!({"hook_event_name": "UserPromptSubmit", "prompt": "first"}))
            .await
            .unwrap();
        raw_tx.send(json!({"no_event_name": true})).await.unwrap();
        raw_tx
            .send(json!({"hook_event_name": "UserPromptSubmit", "prompt": "second"}))
            .await
            .unwrap();
        drop(raw_tx);

        let first = out_rx.recv().await.unwrap().message.unwrap();
        let second = out_rx.recv().await.unwrap().message.unwrap();
        assert_eq!(first.content, "first");
        assert_eq!(second.content, "second");
        worker.await.unwrap();
        assert!(out_rx.recv().await.is_none());
    }
}
