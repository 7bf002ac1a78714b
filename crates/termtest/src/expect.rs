//! The expectation API.
//!
//! Everything here is a thin wrapper over [`TermTest::expect_custom_with`]:
//! build a predicate, register it as a consumer, block on the result, and
//! route any failure through the error-handler policy. Exit-code
//! expectations are the exception; they race the child's exit directly
//! instead of going through the consumer pipeline.

use std::time::Duration;

use regex::Regex;
use tracing::debug;

use crate::consumer::Predicate;
use crate::error::{Result, TermTestError};
use crate::options::ExpectOptions;
use crate::sanitize::normalize_line_ends_str;
use crate::session::TermTest;

/// What an exit expectation asserts about the child's exit code.
#[derive(Debug, Clone, Copy)]
enum ExitExpectation {
    Is(i32),
    IsNot(i32),
    Any,
}

impl TermTest {
    /// Wait until `value` appears in the unconsumed transcript.
    ///
    /// On match, the consumer cursor advances past the occurrence: a later
    /// expectation of the same value needs a second occurrence.
    ///
    /// # Errors
    ///
    /// Returns (or panics with, per the error handler) a timeout if the
    /// value does not appear in time.
    pub async fn expect(&self, value: &str) -> Result<()> {
        self.expect_with(value, ExpectOptions::default()).await
    }

    /// [`TermTest::expect`] with per-expectation overrides.
    ///
    /// # Errors
    ///
    /// See [`TermTest::expect`].
    pub async fn expect_with(&self, value: &str, opts: ExpectOptions) -> Result<()> {
        let needle = if self.opts.normalized_line_ends {
            normalize_line_ends_str(value)
        } else {
            value.to_string()
        };
        let label = format!("expect({})", needle.chars().take(40).collect::<String>());
        let predicate: Predicate = Box::new(move |buffer: &str| {
            Ok(buffer.find(&needle).map_or(0, |i| i + needle.len()))
        });
        self.run_consumer(predicate, label, opts).await
    }

    /// Wait until the regex matches the unconsumed transcript; the cursor
    /// advances to the end of the match.
    ///
    /// # Errors
    ///
    /// Returns a timeout if nothing matches in time.
    pub async fn expect_re(&self, pattern: Regex) -> Result<()> {
        self.expect_re_with(pattern, ExpectOptions::default()).await
    }

    /// [`TermTest::expect_re`] with per-expectation overrides.
    ///
    /// # Errors
    ///
    /// See [`TermTest::expect_re`].
    pub async fn expect_re_with(&self, pattern: Regex, opts: ExpectOptions) -> Result<()> {
        let label = format!("expect_re({})", pattern.as_str());
        let predicate: Predicate =
            Box::new(move |buffer: &str| Ok(pattern.find(buffer).map_or(0, |m| m.end())));
        self.run_consumer(predicate, label, opts).await
    }

    /// Wait with a caller-supplied predicate.
    ///
    /// The predicate receives the unconsumed transcript and returns the
    /// byte position just past its match, `0` for "no match yet", or an
    /// error (returned to the caller verbatim). It runs under the producer
    /// lock and must not block.
    ///
    /// # Errors
    ///
    /// Returns a timeout, the predicate's own error, or a contract
    /// violation if the predicate reports a position past the buffer.
    pub async fn expect_custom(&self, predicate: Predicate) -> Result<()> {
        self.expect_custom_with(predicate, ExpectOptions::default())
            .await
    }

    /// [`TermTest::expect_custom`] with per-expectation overrides.
    ///
    /// # Errors
    ///
    /// See [`TermTest::expect_custom`].
    pub async fn expect_custom_with(&self, predicate: Predicate, opts: ExpectOptions) -> Result<()> {
        self.run_consumer(predicate, "expect_custom".to_string(), opts)
            .await
    }

    /// Wait until a shell prompt is ready for input.
    ///
    /// Sends `echo` with a marker the shell expands (`$HOME`, or
    /// `%USERPROFILE%` off POSIX) and waits for the expanded form. Because
    /// the terminal echoes the *unexpanded* command back, the echo of the
    /// input can never match; only the prompt actually executing the
    /// command produces the marker. This is what keeps expectations from
    /// triggering on text that was merely typed.
    ///
    /// # Errors
    ///
    /// Returns a timeout if no prompt becomes active, or an I/O error if
    /// the marker cannot be constructed or sent.
    pub async fn expect_input(&self) -> Result<()> {
        self.expect_input_with(ExpectOptions::default()).await
    }

    /// [`TermTest::expect_input`] with per-expectation overrides.
    ///
    /// # Errors
    ///
    /// See [`TermTest::expect_input`].
    pub async fn expect_input_with(&self, opts: ExpectOptions) -> Result<()> {
        let (line, marker) = if self.opts.posix {
            match std::env::var("HOME") {
                Ok(home) => ("echo wait_ready_$HOME", format!("wait_ready_{home}")),
                Err(_) => {
                    let err = std::io::Error::other("HOME is not set").into();
                    return self.conclude(Err(err), &opts);
                }
            }
        } else {
            match std::env::var("USERPROFILE") {
                Ok(profile) => (
                    "echo wait_ready_%USERPROFILE%",
                    format!("wait_ready_{profile}"),
                ),
                Err(_) => {
                    let err = std::io::Error::other("USERPROFILE is not set").into();
                    return self.conclude(Err(err), &opts);
                }
            }
        };

        if let Err(err) = self.send_line(line) {
            return self.conclude(Err(err), &opts);
        }
        self.expect_with(&marker, opts).await
    }

    /// Wait for the child to exit and assert its exit code.
    ///
    /// Does not run on the consumer pipeline: it races the expectation
    /// timeout against the child's exit, then waits for the reader to
    /// finish so the producer's final error is collected. A timeout does
    /// not kill the child; that is the caller's decision.
    ///
    /// # Errors
    ///
    /// Returns a timeout if the child keeps running, or an exit-code
    /// mismatch error ("expected exit code N, got M").
    pub async fn expect_exit_code(&self, exit_code: i32) -> Result<()> {
        self.exit_expectation(ExitExpectation::Is(exit_code), ExpectOptions::default())
            .await
    }

    /// [`TermTest::expect_exit_code`] with per-expectation overrides.
    ///
    /// # Errors
    ///
    /// See [`TermTest::expect_exit_code`].
    pub async fn expect_exit_code_with(&self, exit_code: i32, opts: ExpectOptions) -> Result<()> {
        self.exit_expectation(ExitExpectation::Is(exit_code), opts)
            .await
    }

    /// Wait for the child to exit and assert its exit code is *not* the
    /// given value.
    ///
    /// # Errors
    ///
    /// Returns a timeout if the child keeps running, or an error if the
    /// child exited with the excluded code.
    pub async fn expect_not_exit_code(&self, exit_code: i32) -> Result<()> {
        self.exit_expectation(ExitExpectation::IsNot(exit_code), ExpectOptions::default())
            .await
    }

    /// [`TermTest::expect_not_exit_code`] with per-expectation overrides.
    ///
    /// # Errors
    ///
    /// See [`TermTest::expect_not_exit_code`].
    pub async fn expect_not_exit_code_with(
        &self,
        exit_code: i32,
        opts: ExpectOptions,
    ) -> Result<()> {
        self.exit_expectation(ExitExpectation::IsNot(exit_code), opts)
            .await
    }

    /// Wait for the child to exit, regardless of exit code.
    ///
    /// # Errors
    ///
    /// Returns a timeout if the child keeps running.
    pub async fn expect_exit(&self) -> Result<()> {
        self.exit_expectation(ExitExpectation::Any, ExpectOptions::default())
            .await
    }

    /// [`TermTest::expect_exit`] with per-expectation overrides.
    ///
    /// # Errors
    ///
    /// See [`TermTest::expect_exit`].
    pub async fn expect_exit_with(&self, opts: ExpectOptions) -> Result<()> {
        self.exit_expectation(ExitExpectation::Any, opts).await
    }

    async fn run_consumer(
        &self,
        predicate: Predicate,
        label: String,
        opts: ExpectOptions,
    ) -> Result<()> {
        let timeout = opts.timeout.unwrap_or(self.opts.default_timeout);
        let handle = self.producer.add_consumer(predicate, timeout, label);
        let result = handle.wait().await;
        self.conclude(result, &opts)
    }

    async fn exit_expectation(
        &self,
        expectation: ExitExpectation,
        opts: ExpectOptions,
    ) -> Result<()> {
        debug!(target: "termtest", ?expectation, "waiting for child exit");
        if self.is_closed() {
            return self.conclude(Err(TermTestError::SessionClosed), &opts);
        }

        let timeout = opts.timeout.unwrap_or(self.opts.default_timeout);
        let started = tokio::time::Instant::now();

        let mut exit_rx = self.exit_rx.clone();
        let result = match tokio::time::timeout(timeout, exit_rx.wait_for(|v| v.is_some())).await {
            Err(_) => Err(TermTestError::timeout(timeout, String::new())),
            // The wait thread vanished without reporting an exit.
            Ok(Err(_)) => Err(TermTestError::StopPremature),
            Ok(Ok(outcome)) => match (*outcome).clone() {
                Some(Ok(code)) => assert_exit_code(code as i32, expectation),
                Some(Err(reason)) => Err(TermTestError::Io(std::io::Error::other(reason))),
                None => Err(TermTestError::StopPremature),
            },
        };

        // On a met expectation, make sure the reader has drained and the
        // producer's final error is collected before reporting success.
        let result = match result {
            Ok(()) => {
                let remaining = timeout
                    .saturating_sub(started.elapsed())
                    .max(Duration::from_millis(100));
                self.wait(remaining).await
            }
            err => err,
        };

        self.conclude(result, &opts)
    }

    /// Upgrade an expectation failure to its descriptive form, then route
    /// it through the error-handler policy.
    fn conclude(&self, result: Result<()>, opts: &ExpectOptions) -> Result<()> {
        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                let err = self.upgrade(err, opts);
                let handler = opts
                    .error_handler
                    .as_ref()
                    .unwrap_or(&self.opts.error_handler);
                handler.apply(self, err)
            }
        }
    }

    fn upgrade(&self, err: TermTestError, opts: &ExpectOptions) -> TermTestError {
        let err = match err {
            // The consumer cannot see the transcript; fill in what nobody
            // has matched yet for the error message.
            TermTestError::Timeout { duration, buffer } if buffer.is_empty() => {
                TermTestError::timeout(duration, self.pending_output())
            }
            TermTestError::StopPremature => TermTestError::ExpectNotMetDueToStop {
                source: Box::new(TermTestError::StopPremature),
            },
            other => other,
        };
        match &opts.error_message {
            Some(message) => err.with_context(message.clone()),
            None => err,
        }
    }
}

fn assert_exit_code(actual: i32, expectation: ExitExpectation) -> Result<()> {
    match expectation {
        ExitExpectation::Is(expected) if actual == expected => Ok(()),
        ExitExpectation::Is(expected) => Err(TermTestError::ExitCode { expected, actual }),
        ExitExpectation::IsNot(excluded) if actual == excluded => {
            Err(TermTestError::UnexpectedExitCode { actual })
        }
        ExitExpectation::IsNot(_) | ExitExpectation::Any => Ok(()),
    }
}
