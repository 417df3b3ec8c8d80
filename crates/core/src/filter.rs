//! Escape/noise filter for raw terminal transcript lines.
//!
//! Two-stage pre-pass ahead of the speaker segmenter:
//!
//! 1. Strip ANSI CSI/OSC and related control sequences. This removes only
//!    control bytes, never semantic text.
//! 2. Classify each line against a fixed, ordered noise-rule table
//!    (decorative box/block/braille art, known banner phrases, bare
//!    timestamp lines, blank lines, escape remnants). Precedence is the
//!    table order, so it can be tested in isolation.
//!
//! Noise lines are dropped downstream but never close an open message —
//! noise filtering is a pure pre-pass, not a turn boundary.

use regex_lite::Regex;

use crate::types::CleanedLine;

/// One entry of the ordered noise table: pattern plus a label used in
/// diagnostics and precedence tests.
pub struct NoiseRule {
    pub name: &'static str,
    pattern: Regex,
}

/// Compiled filter. Build once and share; compilation of the rule table is
/// not free.
pub struct EscapeFilter {
    /// `ESC [ params intermediates final` — colors, cursor movement, erases.
    csi: Regex,
    /// `ESC ] ... BEL` operating-system commands (titles, hyperlinks).
    osc: Regex,
    /// Remaining single-shift / charset escapes.
    fe: Regex,
    /// Escape-sequence remnants whose ESC byte was lost in transit
    /// (common in multiplexer capture files): `[0m`, `[2K`, `?25h`, ...
    residue: Regex,
    /// Trailing C0/DEL control bytes left on a line after stripping.
    trailing_controls: Regex,
    /// Leading `>` / `!>` prompt glyph runs.
    prompt_glyphs: Regex,
    /// Standalone spinner sentinels (`Thinking...`, `Loading...`).
    thinking: Regex,
    rules: Vec<NoiseRule>,
}

impl EscapeFilter {
    pub fn new() -> Self {
        let rule = |name: &'static str, pattern: &str| NoiseRule {
            name,
            pattern: Regex::new(pattern).expect("noise rule pattern is valid"),
        };

        // Ordered top-to-bottom; first match wins. Mostly inherited from the
        // interface chrome the supervised CLI is known to print.
        let rules = vec![
            rule("blank", r"^\s*$"),
            rule("braille_art", r"^[⠀-⣿\s]+$"),
            rule("box_drawing", r"^[─━│┃┌┏┐┓└┗┘┛├┣┤┫┬┳┴┻┼╋═║╔╗╚╝╠╣╦╩╬╭╮╯╰]+"),
            rule("block_glyphs", r"^[▀▁▂▃▄▅▆▇█▉▊▋▌▍▎▏▐░▒▓▔▕▖▗▘▙▚▛▜▝▞▟]+"),
            rule("banner_did_you_know", r"Did you know\?"),
            rule("banner_bash_hint", r"You can execute bash commands"),
            rule("banner_newline_hint", r"ctrl \+ j new lines"),
            rule("banner_help_hint", r"/help all commands"),
            rule("banner_trust_notice", r"All tools are now trusted"),
            rule("banner_agent_warning", r"Agents can sometimes do unexpected things"),
            rule("banner_chat_header", r"You are chatting with"),
            rule("banner_resume_notice", r"Picking up where we left off"),
            rule(
                "bracketed_timestamp",
                r"^\[.*\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}.*\]$",
            ),
            rule("bare_timestamp", r"^\d{2}:\d{2}:\d{2}$"),
            rule("bare_datestamp", r"^\d{4}-\d{2}-\d{2}( \d{2}:\d{2}:\d{2})?$"),
            rule("cursor_column", r"\[\d+G"),
            rule("mode_toggle", r"\?\d+[hl]"),
            rule("escape_remnant", r"^\x1b?\[[0-9;]*[mK]?$"),
        ];

        Self {
            csi: Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").expect("valid CSI pattern"),
            osc: Regex::new(r"\x1b\][^\x07\x1b]*(\x07|\x1b\\)?").expect("valid OSC pattern"),
            fe: Regex::new(r"\x1b[@-_]").expect("valid Fe pattern"),
            residue: Regex::new(r"\[[0-9]{1,3}(;[0-9]{1,3})*m|\[[0-9]{1,3}[GKJ]|\[?\?(25|2004)[hl]")
                .expect("valid residue pattern"),
            trailing_controls: Regex::new(r"[\x00-\x1f\x7f]+$").expect("valid control pattern"),
            prompt_glyphs: Regex::new(r"^(\s|!?>)+").expect("valid prompt glyph pattern"),
            thinking: Regex::new(r"(?i)^(Thinking|Loading|Processing|Analyzing|Please wait)\.+$")
                .expect("valid spinner pattern"),
            rules,
        }
    }

    /// Remove ANSI escape sequences and carriage returns, leaving the
    /// semantic text intact.
    pub fn strip_ansi(&self, line: &str) -> String {
        let text = self.csi.replace_all(line, "");
        let text = self.osc.replace_all(&text, "");
        let text = self.fe.replace_all(&text, "");
        let text = self.residue.replace_all(&text, "");
        text.replace(['\r', '\x07'], "")
    }

    /// The name of the first matching noise rule, if any.
    ///
    /// Table order is precedence; exposed so the ordering itself is testable.
    pub fn noise_label(&self, line: &str) -> Option<&'static str> {
        self.rules
            .iter()
            .find(|rule| rule.pattern.is_match(line))
            .map(|rule| rule.name)
    }

    /// Whether a standalone line is a spinner sentinel (`Thinking...` etc.).
    pub fn is_spinner(&self, line: &str) -> bool {
        self.thinking.is_match(line.trim())
    }

    /// Strip leading prompt glyphs (`>` / `!>` runs) from a content line.
    /// Used when rendering fragment previews; the segmenter consumes the
    /// glyphs itself via its marker patterns.
    pub fn scrub_prompt_glyphs(&self, line: &str) -> String {
        self.prompt_glyphs.replace(line, "").to_string()
    }

    /// Clean a batch of raw transcript lines, in order.
    ///
    /// Consecutive spinner repaints (`Thinking...` spam from the terminal's
    /// animation) collapse to a single line before classification so
    /// fragment previews stay stable.
    pub fn clean_lines<'a, I>(&self, lines: I) -> Vec<CleanedLine>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut out = Vec::new();
        let mut prev_was_spinner = false;

        for raw in lines {
            let stripped = self.strip_ansi(raw);
            let text = self
                .trailing_controls
                .replace(&stripped, "")
                .into_owned();

            let is_spinner = self.is_spinner(&text);
            if is_spinner && prev_was_spinner {
                continue;
            }
            prev_was_spinner = is_spinner;

            let is_noise = self.noise_label(&text).is_some();
            out.push(CleanedLine { text, is_noise });
        }

        out
    }

    /// Clean a raw multi-line chunk. See [`EscapeFilter::clean_lines`].
    pub fn clean(&self, raw: &str) -> Vec<CleanedLine> {
        self.clean_lines(raw.lines())
    }
}

impl Default for EscapeFilter {
    fn default() -> Self {
        Self::new()
    }
}

/// Collapse runs of three or more newlines (blank-line stutter from terminal
/// repaints) down to a single blank line.
pub fn collapse_blank_runs(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut consecutive_newlines = 0usize;
    for ch in text.chars() {
        if ch == '\n' {
            consecutive_newlines += 1;
            if consecutive_newlines <= 2 {
                out.push(ch);
            }
        } else {
            consecutive_newlines = 0;
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn strips_color_codes_without_touching_text() {
        let f = EscapeFilter::new();
        assert_eq!(
            f.strip_ansi("\x1b[96mhello\x1b[0m world"),
            "hello world"
        );
    }

    #[test]
    fn strips_cursor_and_mode_sequences() {
        let f = EscapeFilter::new();
        assert_eq!(f.strip_ansi("\x1b[2K\x1b[1Gprompt"), "prompt");
        assert_eq!(f.strip_ansi("\x1b[?25htext\x1b[?2004l"), "text");
    }

    #[test]
    fn strips_bare_residue_when_escape_byte_was_lost() {
        let f = EscapeFilter::new();
        assert_eq!(f.strip_ansi("[0m[38;5;12mreply[0m"), "reply");
        assert_eq!(f.strip_ansi("?25h?2004hready"), "ready");
    }

    #[test]
    fn strips_carriage_returns_and_bells() {
        let f = EscapeFilter::new();
        assert_eq!(f.strip_ansi("line\r\x07"), "line");
    }

    #[test]
    fn noise_table_precedence_blank_before_braille() {
        let f = EscapeFilter::new();
        assert_eq!(f.noise_label(""), Some("blank"));
        assert_eq!(f.noise_label("   "), Some("blank"));
        assert_eq!(f.noise_label("⠋⠙⠹"), Some("braille_art"));
    }

    #[test]
    fn classifies_box_art_and_banners() {
        let f = EscapeFilter::new();
        assert_eq!(f.noise_label("╭──────────────╮"), Some("box_drawing"));
        assert_eq!(f.noise_label("███▓▒░ loading"), Some("block_glyphs"));
        assert_eq!(
            f.noise_label("Did you know? You can use /compact"),
            Some("banner_did_you_know")
        );
        assert_eq!(
            f.noise_label("ctrl + j new lines, /help all commands"),
            Some("banner_newline_hint")
        );
    }

    #[test]
    fn classifies_timestamp_only_lines() {
        let f = EscapeFilter::new();
        assert_eq!(f.noise_label("12:34:56"), Some("bare_timestamp"));
        assert_eq!(f.noise_label("2026-08-01"), Some("bare_datestamp"));
        assert_eq!(
            f.noise_label("[session 2026-08-01 12:34:56 UTC]"),
            Some("bracketed_timestamp")
        );
    }

    #[test]
    fn content_lines_are_not_noise() {
        let f = EscapeFilter::new();
        assert_eq!(f.noise_label("The fix is in reader.rs line 40"), None);
        assert_eq!(f.noise_label("!> deploy the staging branch"), None);
        assert_eq!(f.noise_label("> Sure, deploying now."), None);
    }

    #[test]
    fn clean_marks_noise_and_keeps_order() {
        let f = EscapeFilter::new();
        let lines = f.clean("╭───╮\n\x1b[96m!> hello\x1b[0m\nreply text\n");
        let texts: Vec<(&str, bool)> = lines
            .iter()
            .map(|l| (l.text.as_str(), l.is_noise))
            .collect();
        assert_eq!(
            texts,
            vec![("╭───╮", true), ("!> hello", false), ("reply text", false)]
        );
    }

    #[test]
    fn consecutive_spinner_repaints_collapse() {
        let f = EscapeFilter::new();
        let lines = f.clean("Thinking...\nThinking...\nThinking...\nreal reply");
        let texts: Vec<&str> = lines.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(texts, vec!["Thinking...", "real reply"]);
    }

    #[test]
    fn spinner_runs_split_by_content_are_kept_separately() {
        let f = EscapeFilter::new();
        let lines = f.clean("Thinking...\nanswer\nThinking...");
        let texts: Vec<&str> = lines.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(texts, vec!["Thinking...", "answer", "Thinking..."]);
    }

    #[test]
    fn scrub_prompt_glyphs_removes_leading_runs_only() {
        let f = EscapeFilter::new();
        assert_eq!(f.scrub_prompt_glyphs("!> hello"), "hello");
        assert_eq!(f.scrub_prompt_glyphs("> > nested quote"), "nested quote");
        assert_eq!(f.scrub_prompt_glyphs("a > b"), "a > b");
    }

    #[test]
    fn collapse_blank_runs_caps_at_one_blank_line() {
        assert_eq!(collapse_blank_runs("a\n\n\n\nb"), "a\n\nb");
        assert_eq!(collapse_blank_runs("a\nb"), "a\nb");
    }

    #[test]
    fn trailing_control_bytes_are_trimmed() {
        let f = EscapeFilter::new();
        let lines = f.clean("payload\x08\x08");
        assert_eq!(lines[0].text, "payload");
    }
}
