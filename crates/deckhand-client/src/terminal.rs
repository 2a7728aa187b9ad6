use deckhand_core::TerminalChunk;
use std::sync::Mutex;

/// Per-channel append-only log of human-readable operation output.
///
/// Lines are kept in arrival order, never reordered or deduplicated.
/// There is no size bound: operations are short-lived and callers clear
/// the buffer when the operation view closes or a new operation begins.
#[derive(Debug, Default)]
pub struct TerminalLogBuffer {
    lines: Mutex<Vec<String>>,
}

impl TerminalLogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, chunk: TerminalChunk) -> String {
        let line = chunk.into_line();
        self.lines.lock().expect("terminal lock").push(line.clone());
        line
    }

    pub fn clear(&self) {
        self.lines.lock().expect("terminal lock").clear();
    }

    /// Full snapshot of the buffer. Each render reads the current whole
    /// sequence; no cursor state is kept.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().expect("terminal lock").clone()
    }

    pub fn len(&self) -> usize {
        self.lines.lock().expect("terminal lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
