//! Incremental parser for `text/event-stream` completion bodies.
//!
//! Chunks may split lines anywhere, including inside a multi-byte UTF-8
//! sequence, so bytes are buffered until a full line is available.

use serde_json::Value;

const DATA_PREFIX: &str = "data: ";
const DONE_MARKER: &str = "[DONE]";

/// Accumulates `choices[0].delta.content` fragments from SSE chunks
#[derive(Debug, Default)]
pub struct DeltaParser {
    pending: Vec<u8>,
    text: String,
    done: bool,
}

impl DeltaParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns the content fragments completed by it
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut fragments = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            if let Some(fragment) = self.parse_line(&line) {
                self.text.push_str(&fragment);
                fragments.push(fragment);
            }
        }
        fragments
    }

    /// Flush a trailing line with no terminating newline
    pub fn finish(mut self) -> String {
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            if let Some(fragment) = self.parse_line(&line) {
                self.text.push_str(&fragment);
            }
        }
        self.text
    }

    /// Text accumulated so far
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Whether the `[DONE]` marker has been seen
    pub fn is_done(&self) -> bool {
        self.done
    }

    fn parse_line(&mut self, raw: &[u8]) -> Option<String> {
        if self.done {
            return None;
        }
        let line = String::from_utf8_lossy(raw);
        let data = line.trim_end_matches(['\r', '\n']).strip_prefix(DATA_PREFIX)?;
        if data.trim() == DONE_MARKER {
            self.done = true;
            return None;
        }

        // Partial or foreign payloads are skipped, never fatal
        let value: Value = serde_json::from_str(data).ok()?;
        value
            .pointer("/choices/0/delta/content")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }
}
