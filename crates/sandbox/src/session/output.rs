//! Ordered session output.
//!
//! Stdout and stderr arrive as independent notification streams and can be
//! delivered out of order relative to each other. [`SessionOutput`] merges
//! them into a single timeline sorted by the sandbox-side capture timestamp.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Delimiter used when joining lines into `stdout()` / `stderr()`.
pub const LINE_DELIMITER: &str = "\n";

/// A single captured line (or terminal chunk).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    text: String,
    is_error: bool,
    timestamp: i64,
}

impl OutputLine {
    pub fn new(text: impl Into<String>, is_error: bool, timestamp: i64) -> Self {
        Self {
            text: text.into(),
            is_error,
            timestamp,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// True for stderr lines.
    pub fn is_error(&self) -> bool {
        self.is_error
    }

    /// Unix epoch nanoseconds.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

/// Everything a session produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOutput {
    lines: Vec<OutputLine>,
    error: bool,
    exit_code: Option<i32>,
}

impl SessionOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a line, keeping `lines` sorted by timestamp.
    ///
    /// Events are usually close to sorted already, so the insertion point is
    /// searched from the tail. Lines with equal timestamps keep arrival order.
    pub fn append(&mut self, line: OutputLine) {
        if line.is_error {
            self.error = true;
        }
        let position = self
            .lines
            .iter()
            .rposition(|existing| existing.timestamp <= line.timestamp)
            .map_or(0, |index| index + 1);
        self.lines.insert(position, line);
    }

    pub fn lines(&self) -> &[OutputLine] {
        &self.lines
    }

    /// All stdout lines joined by [`LINE_DELIMITER`].
    pub fn stdout(&self) -> String {
        self.join(false)
    }

    /// All stderr lines joined by [`LINE_DELIMITER`].
    pub fn stderr(&self) -> String {
        self.join(true)
    }

    /// Raw terminal data: every chunk concatenated in timestamp order.
    pub fn data(&self) -> String {
        self.lines.iter().map(OutputLine::text).collect()
    }

    /// Sticky: true once any stderr line was appended.
    pub fn error(&self) -> bool {
        self.error
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub(crate) fn set_exit_code(&mut self, exit_code: Option<i32>) {
        if exit_code.is_some() {
            self.exit_code = exit_code;
        }
    }

    fn join(&self, is_error: bool) -> String {
        self.lines
            .iter()
            .filter(|line| line.is_error == is_error)
            .map(OutputLine::text)
            .collect::<Vec<_>>()
            .join(LINE_DELIMITER)
    }
}

/// Shared, lock-protected [`SessionOutput`].
///
/// The transport's dispatch context is the only writer; handles and the exit
/// handler read snapshots. Cloning shares the same buffer.
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer {
    inner: Arc<Mutex<SessionOutput>>,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, line: OutputLine) {
        self.lock().append(line);
    }

    pub fn set_exit_code(&self, exit_code: Option<i32>) {
        self.lock().set_exit_code(exit_code);
    }

    /// Copy of the current output.
    pub fn snapshot(&self) -> SessionOutput {
        self.lock().clone()
    }

    pub fn stdout(&self) -> String {
        self.lock().stdout()
    }

    pub fn stderr(&self) -> String {
        self.lock().stderr()
    }

    pub fn data(&self) -> String {
        self.lock().data()
    }

    pub fn error(&self) -> bool {
        self.lock().error()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.lock().exit_code()
    }

    // A panicking user callback must not make the output unreadable.
    fn lock(&self) -> MutexGuard<'_, SessionOutput> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
