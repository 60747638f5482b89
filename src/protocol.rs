//! Semantic message model and the JSON envelopes exchanged over the relay.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BridgeError, Result};

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Kind of a semantic message.
///
/// Known kinds are closed so matches stay exhaustive; anything else a peer
/// sends is preserved verbatim in `Unknown`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageKind {
    AgentReply,
    UserInput,
    ToolCall,
    ToolResult,
    ToolError,
    Thinking,
    StatusBar,
    TaskStatus,
    Question,
    PermissionRequest,
    SelectionDialog,
    Confirmation,
    System,
    Error,
    Logo,
    Raw,
    Unknown(String),
}

impl MessageKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::AgentReply => "agentReply",
            Self::UserInput => "userInput",
            Self::ToolCall => "toolCall",
            Self::ToolResult => "toolResult",
            Self::ToolError => "toolError",
            Self::Thinking => "thinking",
            Self::StatusBar => "statusBar",
            Self::TaskStatus => "taskStatus",
            Self::Question => "question",
            Self::PermissionRequest => "permissionRequest",
            Self::SelectionDialog => "selectionDialog",
            Self::Confirmation => "confirmation",
            Self::System => "system",
            Self::Error => "error",
            Self::Logo => "logo",
            Self::Raw => "raw",
            Self::Unknown(raw) => raw,
        }
    }

    /// Parse a wire literal. The snake_case literals older mobile builds
    /// emit are accepted alongside the camelCase ones.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "agentReply" | "claude" => Self::AgentReply,
            "userInput" | "user_input" => Self::UserInput,
            "toolCall" | "tool_call" => Self::ToolCall,
            "toolResult" | "tool_result" => Self::ToolResult,
            "toolError" | "tool_error" => Self::ToolError,
            "thinking" => Self::Thinking,
            "statusBar" | "status_bar" => Self::StatusBar,
            "taskStatus" | "task_status" => Self::TaskStatus,
            "question" => Self::Question,
            "permissionRequest" | "permission_request" => Self::PermissionRequest,
            "selectionDialog" | "selection_dialog" => Self::SelectionDialog,
            "confirmation" => Self::Confirmation,
            "system" => Self::System,
            "error" => Self::Error,
            "logo" => Self::Logo,
            "raw" => Self::Raw,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Kinds that block the agent until the viewer answers.
    pub fn is_interactive(&self) -> bool {
        matches!(
            self,
            Self::Question | Self::PermissionRequest | Self::SelectionDialog | Self::Confirmation
        )
    }
}

impl From<String> for MessageKind {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl From<MessageKind> for String {
    fn from(kind: MessageKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SemanticColor {
    Red,
    Green,
    Yellow,
    Blue,
    Magenta,
    Cyan,
    White,
    Gray,
}

/// Half-open character range `[start, end)` into a message's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorHint {
    pub start: usize,
    pub end: usize,
    pub color: SemanticColor,
}

impl ColorHint {
    pub fn new(start: usize, end: usize, color: SemanticColor) -> Self {
        Self { start, end, color }
    }

    pub fn shifted(self, offset: usize) -> Self {
        Self {
            start: self.start + offset,
            end: self.end + offset,
            color: self.color,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionType {
    Accept,
    Reject,
    Select,
    Input,
    Skip,
    #[serde(alias = "always_allow")]
    AlwaysAllow,
    #[serde(alias = "always_deny")]
    AlwaysDeny,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionOption {
    pub id: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_default: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_type: Option<ActionType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hotkey: Option<String>,
}

impl InteractionOption {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            description: None,
            is_default: None,
            action_type: None,
            hotkey: None,
        }
    }

    pub fn action(mut self, action: ActionType) -> Self {
        self.action_type = Some(action);
        self
    }

    pub fn hotkey(mut self, hotkey: impl Into<String>) -> Self {
        self.hotkey = Some(hotkey.into());
        self
    }

    pub fn default_choice(mut self) -> Self {
        self.is_default = Some(true);
        self
    }

    /// Literal text to write into the PTY when the viewer picks this option.
    pub fn reply_text(&self) -> String {
        match self.action_type {
            Some(ActionType::Accept) => "y".to_string(),
            Some(ActionType::Reject) => "n".to_string(),
            Some(ActionType::AlwaysAllow) => "a".to_string(),
            Some(ActionType::AlwaysDeny) => "d".to_string(),
            Some(ActionType::Skip) => "\n".to_string(),
            Some(ActionType::Select) | Some(ActionType::Input) | None => {
                self.hotkey.clone().unwrap_or_else(|| self.id.clone())
            }
        }
    }
}

pub fn confirmation_options() -> Vec<InteractionOption> {
    vec![
        InteractionOption::new("yes", "Yes")
            .hotkey("y")
            .action(ActionType::Accept)
            .default_choice(),
        InteractionOption::new("no", "No")
            .hotkey("n")
            .action(ActionType::Reject),
    ]
}

pub fn question_options() -> Vec<InteractionOption> {
    vec![
        InteractionOption::new("yes", "Yes")
            .hotkey("y")
            .action(ActionType::Accept),
        InteractionOption::new("no", "No")
            .hotkey("n")
            .action(ActionType::Reject),
        InteractionOption::new("continue", "Continue").action(ActionType::Skip),
    ]
}

pub fn permission_options() -> Vec<InteractionOption> {
    vec![
        InteractionOption::new("allow", "Allow")
            .hotkey("y")
            .action(ActionType::Accept),
        InteractionOption::new("deny", "Deny")
            .hotkey("n")
            .action(ActionType::Reject),
        InteractionOption::new("always", "Always allow")
            .hotkey("a")
            .action(ActionType::AlwaysAllow),
    ]
}

/// Used when a selection dialog arrives without visible choices: the viewer
/// can still confirm the highlighted entry.
pub fn selection_fallback_options() -> Vec<InteractionOption> {
    vec![InteractionOption::new("confirm", "Confirm selection")
        .action(ActionType::Skip)
        .default_choice()]
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

impl ToolInfo {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// `Name(args)`, or the bare name when the call has no arguments.
    pub fn label(&self) -> String {
        match self.args.as_deref() {
            Some(args) if !args.is_empty() => format!("{}({args})", self.name),
            _ => self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk: Option<RiskLevel>,
}

/// One semantic event derived from the supervised session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SemanticMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: String,
    #[serde(rename = "timestamp")]
    pub timestamp_millis: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<ToolInfo>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub requires_response: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<InteractionOption>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission: Option<PermissionInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub color_hints: Vec<ColorHint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_phase: Option<String>,
}

impl SemanticMessage {
    pub fn new(kind: MessageKind, content: impl Into<String>) -> Self {
        let requires_response = kind.is_interactive();
        Self {
            kind,
            content: content.into(),
            timestamp_millis: now_millis(),
            tool: None,
            requires_response,
            options: Vec::new(),
            permission: None,
            color_hints: Vec::new(),
            thinking_phase: None,
        }
    }

    pub fn at(mut self, timestamp_millis: i64) -> Self {
        self.timestamp_millis = timestamp_millis;
        self
    }

    pub fn with_tool(mut self, tool: ToolInfo) -> Self {
        self.tool = Some(tool);
        self
    }

    pub fn with_options(mut self, options: Vec<InteractionOption>) -> Self {
        self.options = options;
        self
    }

    pub fn with_permission(mut self, permission: PermissionInfo) -> Self {
        self.permission = Some(permission);
        self
    }

    pub fn with_color_hints(mut self, hints: Vec<ColorHint>) -> Self {
        self.color_hints = hints;
        self
    }

    pub fn with_thinking_phase(mut self, phase: impl Into<String>) -> Self {
        self.thinking_phase = Some(phase.into());
        self
    }

    /// Explicit override for kinds that are not interactive by default.
    pub fn with_requires_response(mut self, requires_response: bool) -> Self {
        self.requires_response = requires_response;
        self
    }

    /// Interactive kinds always require a response and always carry at
    /// least one option.
    pub fn ensure_interaction_defaults(mut self) -> Self {
        if self.kind.is_interactive() {
            self.requires_response = true;
        }
        if self.requires_response && self.options.is_empty() {
            self.options = match self.kind {
                MessageKind::Confirmation => confirmation_options(),
                MessageKind::PermissionRequest => permission_options(),
                MessageKind::SelectionDialog => selection_fallback_options(),
                _ => question_options(),
            };
        }
        self
    }

    pub fn content_char_len(&self) -> usize {
        self.content.chars().count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AgentStatus {
    Idle,
    Working,
    #[serde(alias = "waiting_permission")]
    WaitingPermission,
    #[serde(alias = "waiting_input")]
    WaitingInput,
}

/// Relay envelope; the `type` field discriminates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Message {
        message: SemanticMessage,
    },
    Status {
        status: AgentStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },
    Input {
        text: String,
    },
    Interrupt {},
    Resize {
        cols: u16,
        rows: u16,
    },
    Ping {},
    Pong {},
    Paired {},
    CliDisconnected {},
    AppDisconnected {},
}

impl Envelope {
    const KNOWN_TYPES: [&'static str; 10] = [
        "message",
        "status",
        "input",
        "interrupt",
        "resize",
        "ping",
        "pong",
        "paired",
        "cli_disconnected",
        "app_disconnected",
    ];

    /// Decode a text frame.
    ///
    /// Returns `Ok(None)` for a well-formed envelope of a type this build
    /// does not know, which callers treat as a no-op.
    pub fn decode(text: &str) -> Result<Option<Self>> {
        let value: Value = serde_json::from_str(text)
            .map_err(|error| BridgeError::Protocol(format!("malformed frame: {error}")))?;
        let Some(tag) = value.get("type").and_then(Value::as_str).map(str::to_owned) else {
            return Err(BridgeError::Protocol("frame without type".to_string()));
        };
        if !Self::KNOWN_TYPES.contains(&tag.as_str()) {
            return Ok(None);
        }
        serde_json::from_value(value)
            .map(Some)
            .map_err(|error| BridgeError::Protocol(format!("invalid `{tag}` payload: {error}")))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn message(message: SemanticMessage) -> Self {
        Self::Message { message }
    }

    pub fn status(status: AgentStatus, content: Option<String>) -> Self {
        Self::Status { status, content }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Message { .. } => "message",
            Self::Status { .. } => "status",
            Self::Input { .. } => "input",
            Self::Interrupt {} => "interrupt",
            Self::Resize { .. } => "resize",
            Self::Ping {} => "ping",
            Self::Pong {} => "pong",
            Self::Paired {} => "paired",
            Self::CliDisconnected {} => "cli_disconnected",
            Self::AppDisconnected {} => "app_disconnected",
        }
    }
}

/// Which end of a pairing a relay connection represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    AgentSide,
    ViewerSide,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AgentSide => "agentSide",
            Self::ViewerSide => "viewerSide",
        }
    }

    /// Parse the `type` query parameter; `cli`/`app` are the legacy names.
    pub fn from_query(raw: &str) -> Option<Self> {
        match raw {
            "agentSide" | "cli" => Some(Self::AgentSide),
            "viewerSide" | "app" => Some(Self::ViewerSide),
            _ => None,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Self::AgentSide => Self::ViewerSide,
            Self::ViewerSide => Self::AgentSide,
        }
    }

    /// Notification sent to the opposite side when a socket of this role closes.
    pub fn disconnect_envelope(self) -> Envelope {
        match self {
            Self::AgentSide => Envelope::CliDisconnected {},
            Self::ViewerSide => Envelope::AppDisconnected {},
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
