//! Line classification for the agent's rendered terminal output.
//!
//! Every line runs through [`RULES`] in order and the first rule that
//! reaches a verdict wins. Rule order carries meaning: several glyph
//! prefixes are ambiguous and the earlier rule claims them.
//!
//! Selection dialogs span several lines. A line ending in a question mark
//! opens a collector; numbered option lines accumulate into it until a
//! navigation banner or any other line closes it.

use std::sync::LazyLock;

use regex::Regex;

use crate::ansi::{self, Extracted};
use crate::protocol::{
    confirmation_options, permission_options, ActionType, ColorHint, InteractionOption,
    MessageKind, PermissionInfo, SemanticMessage, ToolInfo,
};

static CONFIRMATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\(y/n\)|\[y/n\]|\[yes/no\]|continue\?|proceed\?").expect("valid regex")
});
static TOOL_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[⏺●]\s*([A-Za-z_][\w.:-]*)\((.*)\)\s*$").expect("valid regex")
});
static UI_CHROME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^[\s✻✽✶✳✢·•(]*(?:esc to interrupt|\?\s*for shortcuts|ctrl\+\w+\s+to\b|shift\+tab to cycle|(?:◯\s*)?ide (?:connected|disconnected))",
    )
    .expect("valid regex")
});
static COLOR_REMNANT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9;]+m").expect("valid regex"));
static INCOMPLETE_STATUS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^[✻✽✶✳✢·•\s]*(?:thinking|waiting|loading)\)?$").expect("valid regex")
});
static TIMED_THINKING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[✻✽✶✳✢·•*]\s*)?(\p{Lu}\p{Ll}+) for \d+[hms](?:\s*\d+[ms])*$")
        .expect("valid regex")
});
static NOISE_BANNER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:⎿\s*)?tip:|^◯\s*(?:ide|/ide)|^/ide\b|welcome to claude|auto-update failed")
        .expect("valid regex")
});
static PERMISSION_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:\?|⚠|🔐|allow\b|deny\b|permission\b)").expect("valid regex")
});
static BRACKET_CHOICES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]/]+(?:/[^\]/]+)+)\]").expect("valid regex"));
static TOOL_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([A-Z][A-Za-z0-9_]*)\(").expect("valid regex"));
static SELECTION_OPTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:([❯>›])\s*)?(\d+)[.)]\s+(.+)$").expect("valid regex")
});
static NAV_BANNER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)enter to (?:select|confirm)|esc to cancel|↑/↓|to navigate")
        .expect("valid regex")
});
static ERROR_MARK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)error|failed|exception|crash|错误|失败").expect("valid regex")
});
static PROMPT_HINT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^(?:Try ["']|/\w+)"#).expect("valid regex"));
static BARE_STATUS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:thinking|waiting|loading|processing)$").expect("valid regex")
});
static ENGLISH_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z]{3,}").expect("valid regex"));

const ANIMATION_GLYPHS: &[char] = &['✻', '✽', '✶', '✳', '✢', '·', '•', '*'];
const LOGO_GLYPHS: &[char] = &[
    '▗', '▘', '▝', '▖', '▀', '▄', '█', '▌', '▐', '░', '▒', '▓', '▛', '▜', '▙', '▟',
];
const REPLY_GLYPHS: &[char] = &['⏺', '●'];
const TREE_GLYPHS: &[char] = &['└', '│', '├', '⎿'];
const FILE_TOOLS: &[&str] = &[
    "Read",
    "Write",
    "Edit",
    "MultiEdit",
    "Update",
    "Create",
    "NotebookEdit",
];

/// Heuristic thresholds, tuned against real sessions.
#[derive(Debug, Clone)]
pub struct ClassifierTuning {
    pub min_meaningful_chars: usize,
    pub logo_min_len: usize,
    pub status_bar_min_len: usize,
    pub raw_min_len: usize,
    pub min_alnum_ratio: f32,
    pub thinking_verbs: Vec<String>,
}

impl Default for ClassifierTuning {
    fn default() -> Self {
        let thinking_verbs = [
            "Thinking", "Pondering", "Processing", "Composing", "Finagling", "Schlepping",
            "Brewing", "Levitating", "Percolating", "Contemplating", "Analyzing", "Reasoning",
            "Cogitating", "Musing", "Mulling", "Ruminating", "Deliberating", "Churning",
            "Crunching", "Computing", "Considering", "Baking", "Cooking", "Simmering",
            "Marinating", "Noodling", "Puzzling", "Synthesizing", "Working", "Forging",
            "Conjuring", "Spinning", "Wrangling", "Honking", "Clauding",
        ];
        Self {
            min_meaningful_chars: 3,
            logo_min_len: 10,
            status_bar_min_len: 5,
            raw_min_len: 10,
            min_alnum_ratio: 0.3,
            thinking_verbs: thinking_verbs.iter().map(|verb| verb.to_string()).collect(),
        }
    }
}

impl ClassifierTuning {
    fn thinking_verb(&self, word: &str) -> bool {
        self.thinking_verbs
            .iter()
            .any(|verb| verb.eq_ignore_ascii_case(word))
    }
}

/// A decoration-stripped, trimmed line with its colour hints.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Line {
    text: String,
    hints: Vec<ColorHint>,
}

impl Line {
    pub(crate) fn prepare(raw: &str) -> Self {
        let extracted = ansi::extract(raw);
        let pure_logo = extracted
            .text
            .chars()
            .all(|c| c.is_whitespace() || LOGO_GLYPHS.contains(&c));
        let mut extracted = if pure_logo {
            extracted
        } else {
            ansi::retain_with_hints(&extracted.text, &extracted.hints, |_, c| {
                !LOGO_GLYPHS.contains(&c)
            })
        };

        // Boxed panels draw `│ content │`; the side borders are not tree glyphs.
        let trimmed = extracted.text.trim();
        if trimmed.chars().count() > 1 && trimmed.starts_with('│') && trimmed.ends_with('│') {
            let lead = extracted.text.chars().take_while(|c| c.is_whitespace()).count();
            let last = lead + trimmed.chars().count() - 1;
            extracted = ansi::retain_with_hints(&extracted.text, &extracted.hints, |index, _| {
                index != lead && index != last
            });
        }

        let mut run = 0usize;
        let collapsed = ansi::retain_with_hints(&extracted.text, &extracted.hints, |_, c| {
            if c == ' ' || c == '\t' {
                run += 1;
                run <= 2
            } else {
                run = 0;
                true
            }
        });
        Self::from(ansi::trim_with_hints(&collapsed.text, &collapsed.hints))
    }

    fn starts_with_any(&self, glyphs: &[char]) -> bool {
        self.text.chars().next().is_some_and(|c| glyphs.contains(&c))
    }

    /// The line minus its first `skip` characters, trimmed.
    fn tail(&self, skip: usize) -> Self {
        let rest = ansi::retain_with_hints(&self.text, &self.hints, |index, _| index >= skip);
        Self::from(ansi::trim_with_hints(&rest.text, &rest.hints))
    }

    /// The line minus every leading character in `glyphs` and whitespace.
    fn strip_leading(&self, glyphs: &[char]) -> Self {
        let skip = self
            .text
            .chars()
            .take_while(|c| c.is_whitespace() || glyphs.contains(c))
            .count();
        self.tail(skip)
    }

    fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

impl From<Extracted> for Line {
    fn from(extracted: Extracted) -> Self {
        Self {
            text: extracted.text,
            hints: extracted.hints,
        }
    }
}

/// Outcome of one rule for one line.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Verdict {
    /// Not this rule's line; try the next one.
    Continue,
    Discard,
    Emit(SemanticMessage),
    /// Open a selection dialog with this line as its question.
    Collect,
}

fn emit(kind: MessageKind, line: Line) -> Verdict {
    Verdict::Emit(SemanticMessage::new(kind, line.text).with_color_hints(line.hints))
}

pub(crate) struct Rule {
    pub(crate) name: &'static str,
    pub(crate) apply: fn(&Line, &ClassifierTuning) -> Verdict,
}

pub(crate) const RULES: [Rule; 13] = [
    Rule { name: "noise", apply: noise },
    Rule { name: "logo", apply: logo },
    Rule { name: "status_bar", apply: status_bar },
    Rule { name: "agent_reply", apply: agent_reply },
    Rule { name: "thinking", apply: thinking },
    Rule { name: "noise_banner", apply: noise_banner },
    Rule { name: "permission", apply: permission },
    Rule { name: "selection_question", apply: selection_question },
    Rule { name: "tool_call", apply: tool_call },
    Rule { name: "tool_result", apply: tool_result },
    Rule { name: "user_prompt", apply: user_prompt },
    Rule { name: "task_status", apply: task_status },
    Rule { name: "fallback", apply: fallback },
];

const AFTER_SELECTION: usize = 8;

fn noise(line: &Line, tuning: &ClassifierTuning) -> Verdict {
    let text = line.text.as_str();
    if text.is_empty() {
        return Verdict::Discard;
    }
    let meaningful = text
        .chars()
        .filter(|c| {
            !c.is_whitespace()
                && !ANIMATION_GLYPHS.contains(c)
                && !REPLY_GLYPHS.contains(c)
                && !matches!(c, '❯' | '>' | '⏵')
        })
        .count();
    if meaningful == 0 {
        return Verdict::Discard;
    }
    if meaningful < tuning.min_meaningful_chars && !line.starts_with_any(&['⏺', '●', '❯']) {
        return Verdict::Discard;
    }
    if COLOR_REMNANT.is_match(text) || INCOMPLETE_STATUS.is_match(text) || UI_CHROME.is_match(text)
    {
        return Verdict::Discard;
    }
    Verdict::Continue
}

fn logo(line: &Line, tuning: &ClassifierTuning) -> Verdict {
    let only_glyphs = line
        .text
        .chars()
        .all(|c| c.is_whitespace() || LOGO_GLYPHS.contains(&c));
    if only_glyphs && line.char_len() > tuning.logo_min_len {
        return emit(MessageKind::Logo, line.clone());
    }
    Verdict::Continue
}

fn status_bar(line: &Line, tuning: &ClassifierTuning) -> Verdict {
    if !(line.text.starts_with("⏵⏵") || line.text.starts_with(">>")) {
        return Verdict::Continue;
    }
    let content = line.tail(2);
    if content.char_len() > tuning.status_bar_min_len {
        emit(MessageKind::StatusBar, content)
    } else {
        Verdict::Discard
    }
}

fn agent_reply(line: &Line, _: &ClassifierTuning) -> Verdict {
    if !line.starts_with_any(REPLY_GLYPHS) || TOOL_CALL.is_match(&line.text) {
        return Verdict::Continue;
    }
    let content = line.tail(1);
    if content.char_len() < 2 {
        return Verdict::Discard;
    }
    if CONFIRMATION.is_match(&content.text) {
        return Verdict::Emit(
            SemanticMessage::new(MessageKind::Confirmation, content.text)
                .with_color_hints(content.hints)
                .with_options(confirmation_options()),
        );
    }
    emit(MessageKind::AgentReply, content)
}

fn thinking(line: &Line, tuning: &ClassifierTuning) -> Verdict {
    if let Some(captures) = TIMED_THINKING.captures(&line.text) {
        let phase = captures[1].to_string();
        return Verdict::Emit(
            SemanticMessage::new(MessageKind::Thinking, line.text.clone())
                .with_color_hints(line.hints.clone())
                .with_thinking_phase(phase),
        );
    }

    let has_glyph = line.starts_with_any(ANIMATION_GLYPHS);
    let body = line
        .text
        .trim_start_matches(|c: char| c.is_whitespace() || ANIMATION_GLYPHS.contains(&c));
    let word_len = body
        .find(|c: char| !c.is_alphabetic())
        .unwrap_or(body.len());
    let (word, rest) = body.split_at(word_len);
    if word.is_empty() || !tuning.thinking_verb(word) {
        return Verdict::Continue;
    }
    if !has_glyph && !(rest.starts_with('…') || rest.starts_with("...")) {
        return Verdict::Continue;
    }
    Verdict::Emit(
        SemanticMessage::new(MessageKind::Thinking, line.text.clone())
            .with_color_hints(line.hints.clone())
            .with_thinking_phase(word),
    )
}

pub(crate) fn is_noise_banner(text: &str) -> bool {
    NOISE_BANNER.is_match(text)
}

fn noise_banner(line: &Line, _: &ClassifierTuning) -> Verdict {
    if is_noise_banner(&line.text) {
        Verdict::Discard
    } else {
        Verdict::Continue
    }
}

/// Choices offered inline by a prompt line, if any.
fn inline_options(text: &str) -> Vec<InteractionOption> {
    if CONFIRMATION.is_match(text) {
        return confirmation_options();
    }
    let Some(captures) = BRACKET_CHOICES.captures(text) else {
        return Vec::new();
    };
    captures[1]
        .split('/')
        .map(str::trim)
        .filter(|label| !label.is_empty())
        .enumerate()
        .map(|(index, label)| {
            let mut option = InteractionOption::new(format!("opt_{index}"), label);
            if let Some(first) = label.chars().next() {
                option = option.hotkey(first.to_lowercase().to_string());
            }
            if index == 0 {
                option = option.default_choice();
            }
            option
        })
        .collect()
}

fn permission(line: &Line, _: &ClassifierTuning) -> Verdict {
    if !PERMISSION_PREFIX.is_match(&line.text) || is_noise_banner(&line.text) {
        return Verdict::Continue;
    }
    let mut options = inline_options(&line.text);
    if options.is_empty() {
        options = permission_options();
    }
    let info = PermissionInfo {
        tool: TOOL_TOKEN
            .captures(&line.text)
            .map(|captures| captures[1].to_string()),
        action: Some(line.text.clone()),
        ..PermissionInfo::default()
    };
    Verdict::Emit(
        SemanticMessage::new(MessageKind::PermissionRequest, line.text.clone())
            .with_color_hints(line.hints.clone())
            .with_options(options)
            .with_permission(info),
    )
}

fn selection_question(line: &Line, _: &ClassifierTuning) -> Verdict {
    if line.text.ends_with('?') || line.text.ends_with('？') {
        Verdict::Collect
    } else {
        Verdict::Continue
    }
}

fn tool_call(line: &Line, _: &ClassifierTuning) -> Verdict {
    let Some(captures) = TOOL_CALL.captures(&line.text) else {
        return Verdict::Continue;
    };
    let name = captures[1].to_string();
    let args = captures[2].trim();
    let mut tool = ToolInfo::named(name.clone());
    if !args.is_empty() {
        tool.args = Some(args.to_string());
        if FILE_TOOLS.contains(&name.as_str()) {
            tool.file_path = Some(args.to_string());
        } else if name == "Bash" {
            tool.command = Some(args.to_string());
        }
    }
    Verdict::Emit(SemanticMessage::new(MessageKind::ToolCall, tool.label()).with_tool(tool))
}

fn tool_result(line: &Line, _: &ClassifierTuning) -> Verdict {
    if !line.starts_with_any(TREE_GLYPHS) {
        return Verdict::Continue;
    }
    let content = line.strip_leading(TREE_GLYPHS);
    if content.text.is_empty() {
        return Verdict::Discard;
    }
    if ERROR_MARK.is_match(&content.text) {
        emit(MessageKind::ToolError, content)
    } else if content.text.starts_with("Next:") {
        emit(MessageKind::TaskStatus, content)
    } else {
        emit(MessageKind::ToolResult, content)
    }
}

fn user_prompt(line: &Line, _: &ClassifierTuning) -> Verdict {
    if !line.starts_with_any(&['❯', '>']) {
        return Verdict::Continue;
    }
    let content = line.tail(1);
    if content.text.is_empty() || PROMPT_HINT.is_match(&content.text) {
        return Verdict::Discard;
    }
    emit(MessageKind::UserInput, content)
}

fn task_status(line: &Line, _: &ClassifierTuning) -> Verdict {
    if !line.starts_with_any(&['·', '•']) {
        return Verdict::Continue;
    }
    let content = line.tail(1);
    if content.text.is_empty() || BARE_STATUS.is_match(&content.text) {
        return Verdict::Discard;
    }
    emit(MessageKind::TaskStatus, content)
}

fn is_cjk(c: char) -> bool {
    ('\u{4e00}'..='\u{9fff}').contains(&c)
}

fn fallback(line: &Line, tuning: &ClassifierTuning) -> Verdict {
    let len = line.char_len();
    let has_cjk = line.text.chars().any(is_cjk);
    if len < tuning.raw_min_len && !has_cjk && !ENGLISH_WORD.is_match(&line.text) {
        return Verdict::Discard;
    }
    let dense = line
        .text
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || is_cjk(*c))
        .count();
    if dense as f32 / len as f32 > tuning.min_alnum_ratio {
        emit(MessageKind::Raw, line.clone())
    } else {
        Verdict::Discard
    }
}

#[derive(Debug)]
struct PendingSelection {
    question: Line,
    options: Vec<InteractionOption>,
}

fn selection_option(text: &str) -> Option<InteractionOption> {
    let captures = SELECTION_OPTION.captures(text)?;
    let number = captures[2].to_string();
    let mut option = InteractionOption::new(number.clone(), captures[3].trim())
        .hotkey(number)
        .action(ActionType::Select);
    if captures.get(1).is_some() {
        option = option.default_choice();
    }
    Some(option)
}

/// Per-session classifier. Holds the selection-dialog collector, so each
/// session needs its own instance.
#[derive(Debug, Default)]
pub struct LineClassifier {
    tuning: ClassifierTuning,
    pending: Option<PendingSelection>,
}

impl LineClassifier {
    pub fn new(tuning: ClassifierTuning) -> Self {
        Self {
            tuning,
            pending: None,
        }
    }

    pub fn tuning(&self) -> &ClassifierTuning {
        &self.tuning
    }

    /// Classify one raw line (SGR sequences allowed).
    ///
    /// Yields at most two messages: a selection dialog this line closed,
    /// then the line's own classification.
    pub fn classify(&mut self, raw_line: &str) -> Vec<SemanticMessage> {
        let line = Line::prepare(raw_line);
        let mut out = Vec::new();

        if let Some(pending) = self.pending.as_mut() {
            if NAV_BANNER.is_match(&line.text) {
                out.extend(self.flush_pending());
                return out;
            }
            if let Some(option) = selection_option(&line.text) {
                pending.options.push(option);
                return out;
            }
            // Blank spacer lines inside a dialog do not close it.
            if noise(&line, &self.tuning) == Verdict::Discard {
                return out;
            }
            out.extend(self.flush_pending());
        }

        out.extend(self.evaluate(line, 0));
        out
    }

    /// Close the collector. A question that gathered no options is
    /// classified as if it had never opened one.
    pub fn flush_pending(&mut self) -> Option<SemanticMessage> {
        let PendingSelection { question, options } = self.pending.take()?;
        if options.is_empty() {
            return self.evaluate(question, AFTER_SELECTION);
        }
        Some(
            SemanticMessage::new(MessageKind::SelectionDialog, question.text)
                .with_color_hints(question.hints)
                .with_options(options)
                .ensure_interaction_defaults(),
        )
    }

    pub fn pending_options(&self) -> usize {
        self.pending
            .as_ref()
            .map_or(0, |pending| pending.options.len())
    }

    pub fn is_collecting(&self) -> bool {
        self.pending.is_some()
    }

    fn evaluate(&mut self, line: Line, from: usize) -> Option<SemanticMessage> {
        for rule in &RULES[from..] {
            let verdict = (rule.apply)(&line, &self.tuning);
            if !matches!(verdict, Verdict::Continue) {
                tracing::trace!(target = "cc_bridge::classifier", rule = rule.name, "line matched");
            }
            match verdict {
                Verdict::Continue => continue,
                Verdict::Discard => return None,
                Verdict::Emit(message) => return Some(message.ensure_interaction_defaults()),
                Verdict::Collect => {
                    self.pending = Some(PendingSelection {
                        question: line,
                        options: Vec::new(),
                    });
                    return None;
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SemanticColor;

    fn apply(name: &str, text: &str) -> Verdict {
        let rule = RULES
            .iter()
            .find(|rule| rule.name == name)
            .expect("rule exists");
        (rule.apply)(&Line::prepare(text), &ClassifierTuning::default())
    }

    fn emitted(verdict: Verdict) -> SemanticMessage {
        match verdict {
            Verdict::Emit(message) => message,
            other => panic!("expected a message, got {other:?}"),
        }
    }

    fn classify_one(text: &str) -> Option<SemanticMessage> {
        let mut classifier = LineClassifier::default();
        let mut out = classifier.classify(text);
        assert!(out.len() <= 1, "unexpected extra output {out:?}");
        out.pop()
    }

    #[test]
    fn rule_table_order_is_fixed() {
        let names: Vec<_> = RULES.iter().map(|rule| rule.name).collect();
        assert_eq!(
            names,
            [
                "noise",
                "logo",
                "status_bar",
                "agent_reply",
                "thinking",
                "noise_banner",
                "permission",
                "selection_question",
                "tool_call",
                "tool_result",
                "user_prompt",
                "task_status",
                "fallback",
            ]
        );
        assert_eq!(RULES[AFTER_SELECTION].name, "tool_call");
    }

    #[test]
    fn noise_rule_drops_chrome_and_fragments() {
        for text in ["", "✻ ✶", "ab", "38;2m", "· waiting", "? for shortcuts", "  esc to interrupt"] {
            assert_eq!(apply("noise", text), Verdict::Discard, "{text:?}");
        }
        assert_eq!(apply("noise", "⏺ ok"), Verdict::Continue);
        assert_eq!(
            apply("noise", "✻ Pondering… (3s · esc to interrupt)"),
            Verdict::Continue
        );
    }

    #[test]
    fn logo_line_keeps_block_glyphs() {
        let message = classify_one(" ▐▛███▜▌ ▝▜█████▛▘ ").expect("logo");
        assert_eq!(message.kind, MessageKind::Logo);
        assert!(message.content.contains('█'));
    }

    #[test]
    fn status_bar_needs_content() {
        let message = emitted(apply("status_bar", "⏵⏵ accept edits on (shift+tab to cycle)"));
        assert_eq!(message.kind, MessageKind::StatusBar);
        assert_eq!(message.content, "accept edits on (shift+tab to cycle)");
        assert_eq!(apply("status_bar", ">> ok"), Verdict::Discard);
    }

    #[test]
    fn reply_glyph_yields_agent_reply_with_shifted_hints() {
        let message = classify_one("\x1b[37m⏺\x1b[0m Done, \x1b[32mall tests pass\x1b[0m").unwrap();
        assert_eq!(message.kind, MessageKind::AgentReply);
        assert_eq!(message.content, "Done, all tests pass");
        assert_eq!(
            message.color_hints,
            vec![ColorHint::new(6, 20, SemanticColor::Green)]
        );
    }

    #[test]
    fn reply_with_yes_no_becomes_confirmation() {
        let message = classify_one("⏺ Apply these changes? (y/n)").unwrap();
        assert_eq!(message.kind, MessageKind::Confirmation);
        assert!(message.requires_response);
        assert_eq!(message.options.len(), 2);
        assert_eq!(message.options[0].hotkey.as_deref(), Some("y"));
    }

    #[test]
    fn reply_glyph_with_call_shape_is_left_for_tool_rule() {
        assert_eq!(apply("agent_reply", "⏺ Bash(cargo test)"), Verdict::Continue);
        let message = classify_one("⏺ Bash(cargo test -- --nocapture)").unwrap();
        assert_eq!(message.kind, MessageKind::ToolCall);
        assert_eq!(message.content, "Bash(cargo test -- --nocapture)");
        let tool = message.tool.unwrap();
        assert_eq!(tool.command.as_deref(), Some("cargo test -- --nocapture"));
        assert_eq!(tool.file_path, None);
    }

    #[test]
    fn file_tools_carry_path() {
        let message = classify_one("● Update(src/main.rs)").unwrap();
        let tool = message.tool.unwrap();
        assert_eq!(tool.name, "Update");
        assert_eq!(tool.file_path.as_deref(), Some("src/main.rs"));
    }

    #[test]
    fn thinking_vocabulary_and_timed_variant() {
        let message = classify_one("✻ Pondering… (12s · esc to interrupt)").unwrap();
        assert_eq!(message.kind, MessageKind::Thinking);
        assert_eq!(message.thinking_phase.as_deref(), Some("Pondering"));

        let message = classify_one("Percolating...").unwrap();
        assert_eq!(message.thinking_phase.as_deref(), Some("Percolating"));

        let message = classify_one("✻ Brewed for 12s").unwrap();
        assert_eq!(message.kind, MessageKind::Thinking);
        assert_eq!(message.thinking_phase.as_deref(), Some("Brewed"));

        let message = classify_one("Cooked for 1m 3s").unwrap();
        assert_eq!(message.thinking_phase.as_deref(), Some("Cooked"));

        assert_eq!(apply("thinking", "Thinking about the design carefully"), Verdict::Continue);
    }

    #[test]
    fn thinking_vocabulary_is_configurable() {
        let tuning = ClassifierTuning {
            thinking_verbs: vec!["Daydreaming".into()],
            ..ClassifierTuning::default()
        };
        let mut classifier = LineClassifier::new(tuning);
        let out = classifier.classify("✶ Daydreaming…");
        assert_eq!(out[0].kind, MessageKind::Thinking);
        let out = classifier.classify("✶ Pondering…");
        assert_ne!(out.first().map(|m| m.kind.clone()), Some(MessageKind::Thinking));
    }

    #[test]
    fn noise_banners_are_discarded_even_with_permission_prefix() {
        for text in [
            "⎿ Tip: use /memory to edit",
            "◯ IDE disconnected",
            "Welcome to Claude Code!",
            "✗ Auto-update failed · Try claude doctor",
        ] {
            assert_eq!(classify_one(text), None, "{text:?}");
        }
    }

    #[test]
    fn permission_prefix_yields_request_with_defaults() {
        let message = classify_one("Allow Bash(rm -rf build) to run").unwrap();
        assert_eq!(message.kind, MessageKind::PermissionRequest);
        assert_eq!(message.options, permission_options());
        let info = message.permission.unwrap();
        assert_eq!(info.tool.as_deref(), Some("Bash"));
        assert_eq!(info.action.as_deref(), Some("Allow Bash(rm -rf build) to run"));
    }

    #[test]
    fn permission_bracket_choices() {
        let message = classify_one("⚠ Overwrite file [yes/no/always]").unwrap();
        let labels: Vec<_> = message.options.iter().map(|o| o.label.as_str()).collect();
        assert_eq!(labels, ["yes", "no", "always"]);
        assert_eq!(message.options[0].is_default, Some(true));
        assert_eq!(message.options[2].hotkey.as_deref(), Some("a"));
    }

    #[test]
    fn selection_dialog_accumulates_until_nav_banner() {
        let mut classifier = LineClassifier::default();
        assert!(classifier.classify("Pick one?").is_empty());
        assert!(classifier.classify("1. Yes").is_empty());
        assert!(classifier.classify("2. No").is_empty());
        assert_eq!(classifier.pending_options(), 2);
        let out = classifier.classify("Enter to select · Esc to cancel");
        assert_eq!(out.len(), 1);
        let dialog = &out[0];
        assert_eq!(dialog.kind, MessageKind::SelectionDialog);
        assert_eq!(dialog.content, "Pick one?");
        assert!(dialog.requires_response);
        let hotkeys: Vec<_> = dialog.options.iter().map(|o| o.hotkey.as_deref()).collect();
        assert_eq!(hotkeys, [Some("1"), Some("2")]);
        assert_eq!(dialog.options[0].label, "Yes");
        assert!(!classifier.is_collecting());
    }

    #[test]
    fn cursor_marks_default_and_spacers_do_not_close() {
        let mut classifier = LineClassifier::default();
        classifier.classify("Do you want to make this edit to lib.rs?");
        classifier.classify("");
        classifier.classify("❯ 1. Yes");
        classifier.classify("  2. Yes, allow all edits during this session");
        classifier.classify("  3. No, and tell Claude what to do differently");
        let dialog = classifier.flush_pending().unwrap();
        assert_eq!(dialog.options.len(), 3);
        assert_eq!(dialog.options[0].is_default, Some(true));
        assert_eq!(dialog.options[1].is_default, None);
    }

    #[test]
    fn other_line_closes_dialog_and_is_classified() {
        let mut classifier = LineClassifier::default();
        classifier.classify("Which database?");
        classifier.classify("1) Postgres");
        let out = classifier.classify("⏺ Using Postgres then");
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].kind, MessageKind::SelectionDialog);
        assert_eq!(out[1].kind, MessageKind::AgentReply);
    }

    #[test]
    fn question_without_options_falls_back_to_later_rules() {
        let mut classifier = LineClassifier::default();
        assert!(classifier.classify("What does this function return?").is_empty());
        let out = classifier.classify("It returns the parsed config");
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].kind, MessageKind::Raw);
        assert_eq!(out[0].content, "What does this function return?");
        assert_eq!(out[1].kind, MessageKind::Raw);

        classifier.classify("❯ why is this failing?");
        let prompt = classifier.flush_pending().unwrap();
        assert_eq!(prompt.kind, MessageKind::UserInput);
        assert_eq!(prompt.content, "why is this failing?");
    }

    #[test]
    fn tree_prefix_results_errors_and_next_steps() {
        assert_eq!(classify_one("  ⎿  Read 254 lines").unwrap().kind, MessageKind::ToolResult);
        let error = classify_one("└ Error: file not found").unwrap();
        assert_eq!(error.kind, MessageKind::ToolError);
        assert_eq!(error.content, "Error: file not found");
        assert_eq!(classify_one("├ Next: run migrations").unwrap().kind, MessageKind::TaskStatus);
        assert_eq!(classify_one("└ 构建失败").unwrap().kind, MessageKind::ToolError);
        assert_eq!(apply("tool_result", "⎿"), Verdict::Discard);
    }

    #[test]
    fn boxed_panel_borders_are_not_tool_results() {
        let message = classify_one("│ cwd: /home/dev/project │").unwrap();
        assert_eq!(message.kind, MessageKind::Raw);
        assert_eq!(message.content, "cwd: /home/dev/project");
    }

    #[test]
    fn user_prompt_drops_hint_echoes() {
        let message = classify_one("❯ fix the failing test").unwrap();
        assert_eq!(message.kind, MessageKind::UserInput);
        assert_eq!(message.content, "fix the failing test");
        assert_eq!(classify_one(r#"> Try "refactor main.rs""#), None);
        assert_eq!(classify_one("❯ /clear"), None);
    }

    #[test]
    fn task_status_drops_bare_states() {
        let message = classify_one("• Running database migrations").unwrap();
        assert_eq!(message.kind, MessageKind::TaskStatus);
        assert_eq!(apply("task_status", "· processing"), Verdict::Discard);
    }

    #[test]
    fn fallback_density_threshold() {
        assert_eq!(classify_one("Compiling cc-bridge v0.3.0").unwrap().kind, MessageKind::Raw);
        assert_eq!(classify_one("修改了三个文件").unwrap().kind, MessageKind::Raw);
        assert_eq!(classify_one("-- ** == ++ -- ** a1"), None);
        assert_eq!(classify_one("42%"), None);
    }
}
