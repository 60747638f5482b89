//! Debounced PTY output aggregation.
//!
//! Output is buffered until the stream goes quiet, then every complete line
//! is classified and adjacent fragments of the same reply are merged.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use crate::ansi;
use crate::classifier::{ClassifierTuning, LineClassifier};
use crate::protocol::{MessageKind, SemanticMessage};

static PROMPT_AT_TAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[❯>$%#]\s*$").expect("valid regex"));

/// Bytes of buffer tail inspected for a prompt.
const PROMPT_WINDOW: usize = 512;

#[derive(Debug, Clone)]
pub struct AggregatorTuning {
    /// Delay once a prompt is visible and the agent is likely waiting.
    pub quiet_delay: Duration,
    /// Delay while output is still streaming.
    pub busy_delay: Duration,
    pub max_buffer_bytes: usize,
}

impl Default for AggregatorTuning {
    fn default() -> Self {
        Self {
            quiet_delay: Duration::from_millis(50),
            busy_delay: Duration::from_millis(300),
            max_buffer_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Default)]
pub struct OutputAggregator {
    classifier: LineClassifier,
    tuning: AggregatorTuning,
    buffer: String,
}

fn is_line_break(c: char) -> bool {
    c == '\n' || c == '\r'
}

fn ceil_char_boundary(s: &str, index: usize) -> usize {
    let mut i = index.min(s.len());
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}

impl OutputAggregator {
    pub fn new(classifier: ClassifierTuning, tuning: AggregatorTuning) -> Self {
        Self {
            classifier: LineClassifier::new(classifier),
            tuning,
            buffer: String::new(),
        }
    }

    /// Append a chunk and return the debounce delay to re-arm.
    pub fn push(&mut self, chunk: &str) -> Duration {
        self.buffer.push_str(chunk);
        if self.buffer.len() > self.tuning.max_buffer_bytes {
            let excess = ceil_char_boundary(
                &self.buffer,
                self.buffer.len() - self.tuning.max_buffer_bytes,
            );
            // Prefer cutting at a line break so no line is classified half-eaten.
            let cut = match self.buffer[excess..].find('\n') {
                Some(offset) => excess + offset + 1,
                None => excess,
            };
            self.buffer.drain(..cut);
        }

        if self.prompt_visible() {
            self.tuning.quiet_delay
        } else {
            self.tuning.busy_delay
        }
    }

    fn prompt_visible(&self) -> bool {
        let start = ceil_char_boundary(
            &self.buffer,
            self.buffer.len().saturating_sub(PROMPT_WINDOW),
        );
        let tail = ansi::strip_ansi(&self.buffer[start..]);
        let last_line = tail
            .trim_end_matches('\n')
            .rsplit('\n')
            .next()
            .unwrap_or_default();
        PROMPT_AT_TAIL.is_match(last_line)
    }

    /// Classify every complete line; the trailing partial line stays
    /// buffered.
    pub fn on_quiet(&mut self) -> Vec<SemanticMessage> {
        let Some(last_break) = self.buffer.rfind(is_line_break) else {
            return self.flush_ready_selection();
        };
        let rest = self.buffer.split_off(last_break + 1);
        let complete = std::mem::replace(&mut self.buffer, rest);

        let mut messages = Vec::new();
        for line in complete.split(is_line_break) {
            messages.extend(self.classifier.classify(line));
        }
        if self.classifier.pending_options() > 0 {
            messages.extend(self.classifier.flush_pending());
        }
        merge(messages)
    }

    fn flush_ready_selection(&mut self) -> Vec<SemanticMessage> {
        if self.classifier.pending_options() > 0 {
            self.classifier.flush_pending().into_iter().collect()
        } else {
            Vec::new()
        }
    }

    /// Classify everything, including the partial line. Used at shutdown.
    pub fn flush_all(&mut self) -> Vec<SemanticMessage> {
        let mut messages = self.on_quiet();
        let partial = std::mem::take(&mut self.buffer);
        if !partial.trim().is_empty() {
            messages.extend(self.classifier.classify(&partial));
        }
        messages.extend(self.classifier.flush_pending());
        merge(messages)
    }

    pub fn buffered(&self) -> &str {
        &self.buffer
    }

    pub fn classifier(&self) -> &LineClassifier {
        &self.classifier
    }
}

fn merges_into(current: &MessageKind, next: &MessageKind) -> bool {
    matches!(
        (current, next),
        (MessageKind::Raw, MessageKind::Raw)
            | (MessageKind::ToolResult, MessageKind::ToolResult)
            | (MessageKind::AgentReply, MessageKind::Raw)
            | (MessageKind::AgentReply, MessageKind::AgentReply)
    )
}

/// Join continuation fragments: runs of raw or tool-result lines, and raw
/// lines following an agent reply, whose first line alone carries the
/// reply glyph.
pub fn merge(messages: Vec<SemanticMessage>) -> Vec<SemanticMessage> {
    let mut out: Vec<SemanticMessage> = Vec::with_capacity(messages.len());
    for message in messages {
        match out.last_mut() {
            Some(current) if merges_into(&current.kind, &message.kind) => {
                let offset = current.content_char_len() + 1;
                current.content.push('\n');
                current.content.push_str(&message.content);
                current.color_hints.extend(
                    message
                        .color_hints
                        .into_iter()
                        .map(|hint| hint.shifted(offset)),
                );
            }
            _ => out.push(message),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ColorHint, SemanticColor};

    #[test]
    fn prompt_at_tail_shortens_delay() {
        let mut aggregator = OutputAggregator::default();
        assert_eq!(aggregator.push("building...\n"), Duration::from_millis(300));
        assert_eq!(aggregator.push("\x1b[1m❯\x1b[0m "), Duration::from_millis(50));
        assert_eq!(aggregator.push("user@host:~$ "), Duration::from_millis(50));
    }

    #[test]
    fn partial_line_stays_buffered() {
        let mut aggregator = OutputAggregator::default();
        aggregator.push("⏺ First line of the reply\n⏺ Second");
        let messages = aggregator.on_quiet();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "First line of the reply");
        assert_eq!(aggregator.buffered(), "⏺ Second");

        aggregator.push(" half arrives later\n");
        let messages = aggregator.on_quiet();
        assert_eq!(messages[0].content, "Second half arrives later");
        assert!(aggregator.buffered().is_empty());
    }

    #[test]
    fn carriage_returns_split_lines() {
        let mut aggregator = OutputAggregator::default();
        aggregator.push("• Installing dependencies\r\n• Running the build step\r");
        let kinds: Vec<_> = aggregator.on_quiet().into_iter().map(|m| m.kind).collect();
        assert_eq!(kinds, [MessageKind::TaskStatus, MessageKind::TaskStatus]);
    }

    #[test]
    fn reply_absorbs_following_raw_lines() {
        let mut aggregator = OutputAggregator::default();
        aggregator.push("⏺ Here is the plan:\n\x1b[32mfirst update the parser\x1b[0m\nthen wire the relay\n");
        let messages = aggregator.on_quiet();
        assert_eq!(messages.len(), 1);
        let reply = &messages[0];
        assert_eq!(reply.kind, MessageKind::AgentReply);
        assert_eq!(
            reply.content,
            "Here is the plan:\nfirst update the parser\nthen wire the relay"
        );
        assert_eq!(
            reply.color_hints,
            vec![ColorHint::new(18, 41, SemanticColor::Green)]
        );
    }

    #[test]
    fn merge_rules() {
        let msg = |kind: MessageKind, content: &str| SemanticMessage::new(kind, content);
        let merged = merge(vec![
            msg(MessageKind::ToolResult, "a"),
            msg(MessageKind::ToolResult, "b"),
            msg(MessageKind::Raw, "c"),
            msg(MessageKind::Raw, "d"),
            msg(MessageKind::UserInput, "e"),
            msg(MessageKind::AgentReply, "f"),
            msg(MessageKind::AgentReply, "g"),
            msg(MessageKind::ToolCall, "Read"),
        ]);
        let contents: Vec<_> = merged.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["a\nb", "c\nd", "e", "f\ng", "Read"]);
    }

    #[test]
    fn selection_with_options_flushes_at_quiet_point() {
        let mut aggregator = OutputAggregator::default();
        aggregator.push("Pick one?\n1. Yes\n2. No\n");
        let messages = aggregator.on_quiet();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].kind, MessageKind::SelectionDialog);
        assert_eq!(messages[0].options.len(), 2);
    }

    #[test]
    fn question_without_options_waits_for_next_line() {
        let mut aggregator = OutputAggregator::default();
        aggregator.push("Shall I continue with the migration?\n");
        assert!(aggregator.on_quiet().is_empty());
        assert!(aggregator.classifier().is_collecting());
        aggregator.push("1. Yes\n2. No\n");
        let messages = aggregator.on_quiet();
        assert_eq!(messages[0].content, "Shall I continue with the migration?");
    }

    #[test]
    fn flush_all_classifies_partial_line() {
        let mut aggregator = OutputAggregator::default();
        aggregator.push("⏺ Goodbye for now");
        let messages = aggregator.flush_all();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "Goodbye for now");
    }

    #[test]
    fn buffer_is_capped_at_a_line_break() {
        let tuning = AggregatorTuning {
            max_buffer_bytes: 32,
            ..AggregatorTuning::default()
        };
        let mut aggregator = OutputAggregator::new(ClassifierTuning::default(), tuning);
        aggregator.push("old line that will be dropped\n");
        aggregator.push("newer line survives\n");
        assert!(aggregator.buffered().len() <= 32);
        assert_eq!(aggregator.buffered(), "newer line survives\n");

        aggregator.push(&"é".repeat(40));
        assert!(aggregator.buffered().len() <= 32);
        assert!(aggregator.buffered().chars().all(|c| c == 'é'));
    }
}
