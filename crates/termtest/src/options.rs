//! Session and per-expectation configuration.
//!
//! [`Options`] is a plain record built by the caller with chained setters;
//! there is no hidden mutation behind closures. [`ExpectOptions`] carries
//! the per-call overrides (timeout, error policy, annotation) that
//! individual expectations accept.

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{BoxedError, Result, TermTestError};
use crate::session::TermTest;

/// Default PTY width in columns.
pub const DEFAULT_COLS: u16 = 140;

/// Default PTY height in rows.
pub const DEFAULT_ROWS: u16 = 10;

/// Default timeout applied to every expectation that does not override it.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// A user-supplied transcript cleaner, composed after the built-in one.
///
/// Receives a sanitized chunk and the read cursor relative to that chunk;
/// returns the rewritten chunk and the adjusted cursor. The same cursor
/// rules as [`crate::sanitize::sanitize`] apply: a negative cursor passes
/// through unchanged.
pub type OutputSanitizer = Arc<
    dyn Fn(&[u8], isize) -> std::result::Result<(Vec<u8>, isize), BoxedError> + Send + Sync,
>;

/// A writer that receives every raw chunk read from the PTY, before any
/// sanitization. Useful for recording or debugging a session.
pub type MirrorWriter = Arc<Mutex<dyn Write + Send>>;

/// Callback form of the error handler; receives the session (for
/// diagnostics) and the failure, and decides what the expectation returns.
pub type ErrorHandlerFn =
    Arc<dyn Fn(&TermTest, TermTestError) -> Result<()> + Send + Sync>;

/// Policy applied to every failed expectation.
///
/// The default panics: the target audience is test suites, where a missed
/// expectation is a test failure and should fail loudly. Install
/// [`ErrorHandler::Silence`] to probe without failing, or a custom handler
/// to route failures into a test framework.
#[derive(Clone, Default)]
pub enum ErrorHandler {
    /// Panic with the error and a screen snapshot.
    #[default]
    Panic,
    /// Return the error unchanged to the caller.
    Silence,
    /// Delegate to a caller-supplied callback.
    Custom(ErrorHandlerFn),
}

impl ErrorHandler {
    pub(crate) fn apply(&self, session: &TermTest, err: TermTestError) -> Result<()> {
        match self {
            Self::Panic => panic!(
                "{err}\n\nterminal snapshot:\n{}",
                session.snapshot()
            ),
            Self::Silence => Err(err),
            Self::Custom(handler) => handler(session, err),
        }
    }
}

impl std::fmt::Debug for ErrorHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Panic => f.write_str("ErrorHandler::Panic"),
            Self::Silence => f.write_str("ErrorHandler::Silence"),
            Self::Custom(_) => f.write_str("ErrorHandler::Custom(..)"),
        }
    }
}

/// Construction options for a [`TermTest`] session.
#[derive(Clone)]
pub struct Options {
    /// PTY width in columns.
    pub cols: u16,
    /// PTY height in rows.
    pub rows: u16,
    /// Whether line separators and sanitizer selection follow POSIX
    /// conventions. Defaults to true everywhere except Windows.
    pub posix: bool,
    /// Timeout applied to expectations that do not override it.
    pub default_timeout: Duration,
    /// Strip carriage returns from the transcript (and from needles) so
    /// CRLF output matches LF expectations.
    pub normalized_line_ends: bool,
    /// User cleaner composed after the built-in sanitizer.
    pub output_sanitizer: Option<OutputSanitizer>,
    /// Receives raw PTY bytes before any sanitization.
    pub mirror: Option<MirrorWriter>,
    /// Policy for failed expectations.
    pub error_handler: ErrorHandler,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
            posix: !cfg!(windows),
            default_timeout: DEFAULT_TIMEOUT,
            normalized_line_ends: false,
            output_sanitizer: None,
            mirror: None,
            error_handler: ErrorHandler::default(),
        }
    }
}

impl Options {
    /// Create options with all defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the PTY width in columns.
    #[must_use]
    pub const fn cols(mut self, cols: u16) -> Self {
        self.cols = cols;
        self
    }

    /// Set the PTY height in rows.
    #[must_use]
    pub const fn rows(mut self, rows: u16) -> Self {
        self.rows = rows;
        self
    }

    /// Override POSIX behavior (line separators, sanitizer selection).
    #[must_use]
    pub const fn posix(mut self, posix: bool) -> Self {
        self.posix = posix;
        self
    }

    /// Set the default expectation timeout.
    #[must_use]
    pub const fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Strip carriage returns from transcript and needles before matching.
    #[must_use]
    pub const fn normalized_line_ends(mut self, normalized: bool) -> Self {
        self.normalized_line_ends = normalized;
        self
    }

    /// Compose a user cleaner after the built-in sanitizer.
    #[must_use]
    pub fn output_sanitizer(mut self, sanitizer: OutputSanitizer) -> Self {
        self.output_sanitizer = Some(sanitizer);
        self
    }

    /// Mirror raw PTY bytes into the given writer.
    #[must_use]
    pub fn mirror(mut self, writer: MirrorWriter) -> Self {
        self.mirror = Some(writer);
        self
    }

    /// Set the error-handler policy for failed expectations.
    #[must_use]
    pub fn error_handler(mut self, handler: ErrorHandler) -> Self {
        self.error_handler = handler;
        self
    }

    /// Return failed expectations to the caller instead of panicking.
    #[must_use]
    pub fn silence_errors(mut self) -> Self {
        self.error_handler = ErrorHandler::Silence;
        self
    }

    pub(crate) fn line_sep(&self) -> &'static str {
        if self.posix {
            "\n"
        } else {
            "\r\n"
        }
    }
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("cols", &self.cols)
            .field("rows", &self.rows)
            .field("posix", &self.posix)
            .field("default_timeout", &self.default_timeout)
            .field("normalized_line_ends", &self.normalized_line_ends)
            .field("output_sanitizer", &self.output_sanitizer.is_some())
            .field("mirror", &self.mirror.is_some())
            .field("error_handler", &self.error_handler)
            .finish()
    }
}

/// Per-expectation overrides.
#[derive(Clone, Debug, Default)]
pub struct ExpectOptions {
    /// Override the session's default timeout for this expectation.
    pub timeout: Option<Duration>,
    /// Override the session's error handler for this expectation.
    pub error_handler: Option<ErrorHandler>,
    /// Annotation prepended to any failure from this expectation.
    pub error_message: Option<String>,
}

impl ExpectOptions {
    /// Create per-expectation options with no overrides.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the timeout for this expectation.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Override the error handler for this expectation.
    #[must_use]
    pub fn error_handler(mut self, handler: ErrorHandler) -> Self {
        self.error_handler = Some(handler);
        self
    }

    /// Return this expectation's failure instead of applying the session
    /// policy. Lets callers probe for output without failing the test.
    #[must_use]
    pub fn silence(mut self) -> Self {
        self.error_handler = Some(ErrorHandler::Silence);
        self
    }

    /// Annotate any failure from this expectation.
    #[must_use]
    pub fn error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}
