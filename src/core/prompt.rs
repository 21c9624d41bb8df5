/// Prompt formatting and stop-condition logic.
///
/// Wraps caller text in the engine's turn-delimited markup and turns raw
/// engine output into a single clean utterance.

/// Opens a turn.
pub const TURN_START: &str = "<|im_start|>";
/// Closes a turn.
pub const TURN_END: &str = "<|im_end|>";
/// Markers the engine is told to stop at.
pub const STOP_MARKERS: [&str; 2] = [TURN_END, TURN_START];

/// Decorative quote characters removed from every output.
const STRIPPED_CHARS: &[char] = &['"', '«', '»'];

/// Wrap a prompt into system/user/assistant turns, leaving the assistant turn
/// open for the engine to complete.
///
/// An empty or missing system instruction produces no system turn.
pub fn format_prompt(prompt: &str, system_prompt: Option<&str>) -> String {
    let mut formatted = String::with_capacity(prompt.len() + 96);
    if let Some(system) = system_prompt.filter(|s| !s.is_empty()) {
        push_turn(&mut formatted, "system", system);
    }
    push_turn(&mut formatted, "user", prompt);
    formatted.push_str(TURN_START);
    formatted.push_str("assistant\n");
    formatted
}

fn push_turn(buf: &mut String, role: &str, content: &str) {
    buf.push_str(TURN_START);
    buf.push_str(role);
    buf.push('\n');
    buf.push_str(content);
    buf.push_str(TURN_END);
    buf.push('\n');
}

/// Remove the decorative quote characters.
pub fn strip_quotes(text: &str) -> String {
    text.chars().filter(|c| !STRIPPED_CHARS.contains(c)).collect()
}

/// Post-process a complete (blocking) generation into one utterance.
///
/// Surrounding whitespace and quotes go; if a line break remains inside the
/// text only the first line is kept.
pub fn clean_completion(raw: &str) -> String {
    let stripped = strip_quotes(raw.trim());
    let text = stripped.trim_matches('\n');
    match text.split_once('\n') {
        Some((first_line, _)) => first_line.trim().to_string(),
        None => text.to_string(),
    }
}

/// Accumulates streamed tokens into the growing text shown to the player.
///
/// Output counts as started at the first token that is neither empty nor a
/// bare `"\n"`. After that, a token that is exactly `"\n"` ends the
/// generation, so any number of leading blank lines pass through.
#[derive(Debug, Clone, Default)]
pub struct StreamAccumulator {
    raw: String,
    started: bool,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one token. Returns the full text so far, or `None` when the
    /// token ends the generation (the token is then not appended).
    pub fn push(&mut self, token: &str) -> Option<String> {
        if self.started && token == "\n" {
            return None;
        }
        if !token.is_empty() && token != "\n" {
            self.started = true;
        }
        self.raw.push_str(token);
        Some(self.text())
    }

    /// The cleaned text accumulated so far. Leading newlines are not shown.
    pub fn text(&self) -> String {
        strip_quotes(&self.raw).trim_start_matches('\n').to_string()
    }

    pub fn started(&self) -> bool {
        self.started
    }
}
