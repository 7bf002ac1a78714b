//! Error types for termtest.
//!
//! Errors carry enough context to diagnose a failed expectation without
//! re-running the test: timeouts include the unconsumed transcript tail,
//! exit-code mismatches include both codes, and predicate errors are
//! returned verbatim.

use std::time::Duration;

use thiserror::Error;

/// Maximum number of transcript lines to include in an error message.
const MAX_TAIL_LINES: usize = 6;

/// Maximum length of transcript content to include in an error message.
const MAX_TAIL_BYTES: usize = 500;

/// Boxed error type returned by user-supplied predicates and sanitizers.
pub type BoxedError = Box<dyn std::error::Error + Send + Sync>;

/// Format the tail of the pending transcript for display in error messages.
fn format_buffer_tail(buffer: &str) -> String {
    if buffer.is_empty() {
        return "\n(no unconsumed output)".to_string();
    }

    let lines: Vec<&str> = buffer.lines().collect();
    let shown = &lines[lines.len().saturating_sub(MAX_TAIL_LINES)..];
    let hidden = lines.len() - shown.len();

    let mut tail = shown.join("\n| ");
    if tail.len() > MAX_TAIL_BYTES {
        let cut = tail.len() - MAX_TAIL_BYTES;
        // Truncate on a char boundary.
        let start = (cut..tail.len())
            .find(|i| tail.is_char_boundary(*i))
            .unwrap_or(tail.len());
        tail = format!("...{}", &tail[start..]);
    }

    if hidden > 0 {
        format!(
            "\nunconsumed output ({} lines hidden):\n| {tail}",
            hidden
        )
    } else {
        format!("\nunconsumed output:\n| {tail}")
    }
}

/// The main error type for termtest operations.
#[derive(Debug, Error)]
pub enum TermTestError {
    /// Failed to spawn the child process inside a PTY.
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] SpawnError),

    /// An I/O error from the PTY that is not EOF.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An expectation or wait deadline elapsed.
    #[error("no match after {duration:?}{}", format_buffer_tail(buffer))]
    Timeout {
        /// The timeout duration that elapsed.
        duration: Duration,
        /// The unconsumed transcript at the time of the timeout.
        buffer: String,
    },

    /// The session terminated while an expectation was still pending.
    #[error("session stopped prematurely")]
    StopPremature,

    /// Wraps [`TermTestError::StopPremature`] so callers can tell "the
    /// process exited before the expectation matched" apart from a plain
    /// stop.
    #[error("expectation not met by the time the process finished")]
    ExpectNotMetDueToStop {
        /// The underlying premature-stop error.
        #[source]
        source: Box<TermTestError>,
    },

    /// A user-supplied predicate returned an error; passed through verbatim.
    #[error("consumer predicate failed: {0}")]
    Predicate(#[source] BoxedError),

    /// A predicate reported a match end past the end of the buffer it was
    /// given. The session cannot continue after this.
    #[error("consumer reported end position {end_pos} greater than buffer length {buffer_len}")]
    ContractViolation {
        /// The reported match end position.
        end_pos: usize,
        /// The length of the buffer the predicate was given.
        buffer_len: usize,
    },

    /// The user's output sanitizer returned an error.
    #[error("output sanitizer failed: {0}")]
    Sanitizer(#[source] BoxedError),

    /// The child exited with a different code than expected.
    #[error("expected exit code {expected}, got {actual}")]
    ExitCode {
        /// The exit code the expectation asked for.
        expected: i32,
        /// The exit code the child actually returned.
        actual: i32,
    },

    /// The child exited with a code the expectation excluded.
    #[error("expected exit code to not be {actual}")]
    UnexpectedExitCode {
        /// The excluded exit code the child returned.
        actual: i32,
    },

    /// An operation was attempted on a session that has already been
    /// waited on or closed.
    #[error("session is closed")]
    SessionClosed,

    /// A caller-supplied annotation wrapping the real failure.
    #[error("{message}")]
    WithContext {
        /// The caller's annotation.
        message: String,
        /// The underlying error.
        #[source]
        source: Box<TermTestError>,
    },
}

/// Errors related to PTY allocation and process spawning.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// PTY allocation failed.
    #[error("failed to open PTY: {reason}")]
    PtyOpen {
        /// The reason for the failure.
        reason: String,
    },

    /// The child process could not be started on the PTY slave.
    #[error("failed to start command: {reason}")]
    Command {
        /// The reason for the failure.
        reason: String,
    },

    /// The PTY reader or writer half could not be obtained.
    #[error("failed to wire PTY pipes: {reason}")]
    Pipes {
        /// The reason for the failure.
        reason: String,
    },
}

/// Result type alias for termtest operations.
pub type Result<T> = std::result::Result<T, TermTestError>;

impl TermTestError {
    /// Create a timeout error with the given pending transcript.
    pub fn timeout(duration: Duration, buffer: impl Into<String>) -> Self {
        Self::Timeout {
            duration,
            buffer: buffer.into(),
        }
    }

    /// Annotate this error with a caller-supplied message.
    #[must_use]
    pub fn with_context(self, message: impl Into<String>) -> Self {
        Self::WithContext {
            message: message.into(),
            source: Box::new(self),
        }
    }

    /// Check if this is a timeout error, unwrapping annotations.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::WithContext { source, .. } => source.is_timeout(),
            _ => false,
        }
    }

    /// Check if this error means the process stopped before the
    /// expectation was met, unwrapping annotations.
    #[must_use]
    pub fn is_premature_stop(&self) -> bool {
        match self {
            Self::StopPremature | Self::ExpectNotMetDueToStop { .. } => true,
            Self::WithContext { source, .. } => source.is_premature_stop(),
            _ => false,
        }
    }
}

impl SpawnError {
    /// Create a PTY allocation error.
    pub fn pty_open(reason: impl ToString) -> Self {
        Self::PtyOpen {
            reason: reason.to_string(),
        }
    }

    /// Create a command start error.
    pub fn command(reason: impl ToString) -> Self {
        Self::Command {
            reason: reason.to_string(),
        }
    }

    /// Create a pipe wiring error.
    pub fn pipes(reason: impl ToString) -> Self {
        Self::Pipes {
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_display_includes_buffer_tail() {
        let err = TermTestError::timeout(Duration::from_secs(5), "line one\nline two");
        let msg = err.to_string();
        assert!(msg.contains("5s"));
        assert!(msg.contains("line two"));
    }

    #[test]
    fn timeout_display_empty_buffer() {
        let err = TermTestError::timeout(Duration::from_millis(100), "");
        assert!(err.to_string().contains("no unconsumed output"));
    }

    #[test]
    fn timeout_display_hides_old_lines() {
        let buffer: String = (0..20).map(|i| format!("line {i}\n")).collect();
        let err = TermTestError::timeout(Duration::from_secs(1), buffer);
        let msg = err.to_string();
        assert!(msg.contains("lines hidden"));
        assert!(msg.contains("line 19"));
        assert!(!msg.contains("line 0\n"));
    }

    #[test]
    fn exit_code_display() {
        let err = TermTestError::ExitCode {
            expected: 0,
            actual: 1,
        };
        assert_eq!(err.to_string(), "expected exit code 0, got 1");
    }

    #[test]
    fn is_timeout_unwraps_context() {
        let err = TermTestError::timeout(Duration::from_secs(1), "").with_context("during login");
        assert!(err.is_timeout());
        assert!(err.to_string().contains("during login"));
    }

    #[test]
    fn premature_stop_wrapping() {
        let err = TermTestError::ExpectNotMetDueToStop {
            source: Box::new(TermTestError::StopPremature),
        };
        assert!(err.is_premature_stop());
        assert!(err.to_string().contains("process finished"));
    }
}
