//! termtest: drive a child process through a pseudo-terminal and assert on
//! what a user would see.
//!
//! Interactive command-line programs — shells, prompts, curses-style UIs
//! that emit cursor and color escape sequences — are awkward to test over
//! plain pipes. This crate spawns them inside a real PTY, keeps two views
//! of everything they write, and lets tests send keystrokes and wait for
//! output deterministically:
//!
//! - the **transcript** ([`TermTest::output`]): the linear, sanitized
//!   history of everything written, which expectations consume in order;
//! - the **snapshot** ([`TermTest::snapshot`]): the current screen as a
//!   terminal emulator renders it, cursor movement and overwrites included.
//!
//! Multiple expectations may wait concurrently; each consumes a prefix of
//! the transcript when it matches, so "expect X, then expect Y" behaves the
//! way a human watching the terminal would read it.
//!
//! # Example
//!
//! ```no_run
//! use termtest::{CommandBuilder, Options, TermTest};
//!
//! #[tokio::main]
//! async fn main() -> termtest::Result<()> {
//!     let tt = TermTest::spawn(CommandBuilder::new("bash"), Options::new()).await?;
//!     tt.send_line("echo ABC")?;
//!     tt.expect("ABC").await?;
//!     tt.send_line("exit")?;
//!     tt.expect_exit_code(0).await?;
//!     Ok(())
//! }
//! ```
//!
//! Failed expectations panic by default — the target audience is test
//! suites, where a missed expectation is a test failure. Install
//! [`ErrorHandler::Silence`] (or a custom handler) to get the error back
//! instead.
//!
//! Diagnostics are emitted through [`tracing`] under the `termtest` target;
//! point a `tracing-subscriber` at it for a verbose session log.

pub mod error;
pub mod options;
pub mod sanitize;

mod consumer;
mod expect;
mod producer;
mod session;

pub use consumer::Predicate;
pub use error::{BoxedError, Result, SpawnError, TermTestError};
pub use options::{
    ErrorHandler, ErrorHandlerFn, ExpectOptions, MirrorWriter, Options, OutputSanitizer,
    DEFAULT_COLS, DEFAULT_ROWS, DEFAULT_TIMEOUT,
};
pub use sanitize::{normalize_line_ends, normalize_line_ends_str, sanitize};
pub use session::TermTest;

// The command type of the PTY provider, re-exported so callers do not need
// a direct dependency for the common path.
pub use portable_pty::CommandBuilder;
