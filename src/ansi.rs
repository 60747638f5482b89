//! Terminal escape stripping with SGR colour tracking.
//!
//! [`extract`] turns raw PTY text into printable text plus [`ColorHint`]
//! spans. Hint offsets count characters, not bytes.

use std::sync::LazyLock;

use regex::Regex;

use crate::protocol::{ColorHint, SemanticColor};

/// Parameter fragments left behind when a terminal emitted a sequence
/// without its `ESC [` introducer.
static SGR_REMNANT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[34]8;[25](?:;\d{1,3}){1,3}m|;\d{1,3}(?:;\d{1,3})*m|\b[34]9m|\?\d{1,4}[hl]")
        .expect("valid regex")
});

const FRAME_GLYPHS: &[char] = &[
    '━', '─', '┃', '┌', '┐', '┘', '┤', '┬', '┴', '┼', '═', '║', '╔', '╗', '╚', '╝', '╠', '╣',
    '╦', '╩', '╬', '╭', '╮', '╯', '╰',
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extracted {
    pub text: String,
    pub hints: Vec<ColorHint>,
}

impl Extracted {
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

struct SpanTracker {
    hints: Vec<ColorHint>,
    open: Option<(usize, SemanticColor)>,
}

impl SpanTracker {
    fn new() -> Self {
        Self {
            hints: Vec::new(),
            open: None,
        }
    }

    fn close(&mut self, at: usize) {
        if let Some((start, color)) = self.open.take() {
            if at > start {
                self.hints.push(ColorHint::new(start, at, color));
            }
        }
    }

    fn open(&mut self, at: usize, color: SemanticColor) {
        self.close(at);
        self.open = Some((at, color));
    }

    fn apply_sgr(&mut self, params: &str, at: usize) {
        let codes: Vec<&str> = params.split(';').collect();
        let mut i = 0;
        while i < codes.len() {
            match codes[i] {
                "" | "0" | "39" | "49" => self.close(at),
                code @ ("38" | "48") if codes.get(i + 1) == Some(&"2") => {
                    let channel = |offset: usize| codes.get(i + offset)?.parse::<u16>().ok();
                    if let (Some(r), Some(g), Some(b)) = (channel(2), channel(3), channel(4)) {
                        if code == "38" {
                            if let Some(color) = rgb_to_semantic(r, g, b) {
                                self.open(at, color);
                            }
                        }
                    }
                    i += 5;
                    continue;
                }
                "38" | "48" if codes.get(i + 1) == Some(&"5") => {
                    i += 3;
                    continue;
                }
                code => {
                    if let Some(color) = basic_color(code) {
                        self.open(at, color);
                    }
                }
            }
            i += 1;
        }
    }
}

fn basic_color(code: &str) -> Option<SemanticColor> {
    Some(match code {
        "31" | "91" => SemanticColor::Red,
        "32" | "92" => SemanticColor::Green,
        "33" | "93" => SemanticColor::Yellow,
        "34" | "94" => SemanticColor::Blue,
        "35" | "95" => SemanticColor::Magenta,
        "36" | "96" => SemanticColor::Cyan,
        "37" | "97" => SemanticColor::White,
        "30" | "90" => SemanticColor::Gray,
        _ => return None,
    })
}

/// Approximate a 24-bit colour by fixed guard clauses.
pub fn rgb_to_semantic(r: u16, g: u16, b: u16) -> Option<SemanticColor> {
    if r > 180 && g < 100 && b < 100 {
        return Some(SemanticColor::Red);
    }
    if r > 200 && g > 100 && b < 150 {
        return Some(SemanticColor::Red);
    }
    if g > 150 && r < 100 && b < 100 {
        return Some(SemanticColor::Green);
    }
    if b > 150 && r < 100 && g < 150 {
        return Some(SemanticColor::Blue);
    }
    if r > 180 && g > 150 && b < 100 {
        return Some(SemanticColor::Yellow);
    }
    if r > 150 && b > 150 && g < 100 {
        return Some(SemanticColor::Magenta);
    }
    if g > 150 && b > 150 && r < 100 {
        return Some(SemanticColor::Cyan);
    }
    if r.abs_diff(g) < 30 && g.abs_diff(b) < 30 && r > 80 && r < 180 {
        return Some(SemanticColor::Gray);
    }
    if r > 200 && g > 200 && b > 200 {
        return Some(SemanticColor::White);
    }
    None
}

/// Strip every escape family, tracking SGR foreground colour as hints.
///
/// An escape sequence cut off by the end of `chunk` is dropped.
pub fn extract(chunk: &str) -> Extracted {
    let mut text = String::with_capacity(chunk.len());
    let mut len = 0usize;
    let mut spans = SpanTracker::new();
    let mut chars = chunk.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\x1b' => match chars.peek().copied() {
                Some('[') => {
                    chars.next();
                    let mut params = String::new();
                    let mut terminator = None;
                    for nc in chars.by_ref() {
                        if ('\x40'..='\x7e').contains(&nc) {
                            terminator = Some(nc);
                            break;
                        }
                        params.push(nc);
                    }
                    if terminator == Some('m') {
                        spans.apply_sgr(&params, len);
                    }
                }
                Some(']') => {
                    chars.next();
                    while let Some(nc) = chars.next() {
                        if nc == '\x07' {
                            break;
                        }
                        if nc == '\x1b' && chars.peek() == Some(&'\\') {
                            chars.next();
                            break;
                        }
                    }
                }
                Some('P' | 'X' | '^' | '_') => {
                    chars.next();
                    while let Some(nc) = chars.next() {
                        if nc == '\x1b' && chars.peek() == Some(&'\\') {
                            chars.next();
                            break;
                        }
                    }
                }
                Some('(' | ')' | '*' | '+') => {
                    chars.next();
                    chars.next();
                }
                Some(nc) if ('\x20'..='\x2f').contains(&nc) => {
                    while chars.next_if(|c| ('\x20'..='\x2f').contains(c)).is_some() {}
                    chars.next();
                }
                Some(nc) if ('0'..='~').contains(&nc) => {
                    chars.next();
                }
                _ => {}
            },
            '\r' => {
                if chars.peek() != Some(&'\n') {
                    text.push('\n');
                    len += 1;
                }
            }
            '\n' | '\t' => {
                text.push(c);
                len += 1;
            }
            c if c.is_control() => {}
            c if FRAME_GLYPHS.contains(&c) => {}
            c => {
                text.push(c);
                len += 1;
            }
        }
    }
    spans.close(len);

    let mut extracted = Extracted {
        text,
        hints: spans.hints,
    };
    while SGR_REMNANT.is_match(&extracted.text) {
        extracted = strip_sgr_remnants(&extracted);
    }
    extracted
}

/// Printable text only.
pub fn strip_ansi(text: &str) -> String {
    extract(text).text
}

fn strip_sgr_remnants(input: &Extracted) -> Extracted {
    let mut removed = vec![false; input.text.len()];
    for found in SGR_REMNANT.find_iter(&input.text) {
        removed[found.range()].iter_mut().for_each(|flag| *flag = true);
    }
    let keep: Vec<bool> = input
        .text
        .char_indices()
        .map(|(byte, _)| !removed[byte])
        .collect();
    retain_with_hints(&input.text, &input.hints, |index, _| keep[index])
}

/// Remove every character `keep` rejects, remapping hint offsets onto the
/// surviving text. `keep` receives the character index and the character.
/// Hints that become empty are dropped.
pub fn retain_with_hints(
    text: &str,
    hints: &[ColorHint],
    mut keep: impl FnMut(usize, char) -> bool,
) -> Extracted {
    let mut out = String::with_capacity(text.len());
    // kept_before[i] = surviving characters among the first i.
    let mut kept_before = Vec::with_capacity(text.len() + 1);
    kept_before.push(0usize);
    let mut kept = 0usize;
    for (index, c) in text.chars().enumerate() {
        if keep(index, c) {
            out.push(c);
            kept += 1;
        }
        kept_before.push(kept);
    }
    let last = kept_before.len() - 1;
    let hints = hints
        .iter()
        .filter_map(|hint| {
            let start = kept_before[hint.start.min(last)];
            let end = kept_before[hint.end.min(last)];
            (end > start).then(|| ColorHint::new(start, end, hint.color))
        })
        .collect();
    Extracted { text: out, hints }
}

/// Trim surrounding whitespace, shifting and clamping hints.
pub fn trim_with_hints(text: &str, hints: &[ColorHint]) -> Extracted {
    let lead = text.chars().take_while(|c| c.is_whitespace()).count();
    let trimmed = text.trim();
    let len = trimmed.chars().count();
    let hints = hints
        .iter()
        .filter_map(|hint| {
            let start = hint.start.saturating_sub(lead).min(len);
            let end = hint.end.saturating_sub(lead).min(len);
            (end > start).then(|| ColorHint::new(start, end, hint.color))
        })
        .collect();
    Extracted {
        text: trimmed.to_string(),
        hints,
    }
}
