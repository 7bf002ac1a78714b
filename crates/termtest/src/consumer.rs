//! A single pending expectation attached to the transcript.
//!
//! Each consumer couples a predicate with a timeout and a one-shot result
//! channel. The producer reports unconsumed transcript bytes to the
//! predicate under its own lock; the expecting task blocks on the channel
//! without holding any producer state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::error::{BoxedError, Result, TermTestError};

/// A predicate over the unconsumed transcript.
///
/// Returns the byte position just past the match, `0` for "no match yet",
/// or an error which is delivered to the waiting expectation verbatim.
pub type Predicate = Box<dyn FnMut(&str) -> std::result::Result<usize, BoxedError> + Send>;

/// Outcome of reporting a buffer to a consumer, as seen by the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    /// The predicate matched; the producer advances its cursor by this much
    /// and removes the consumer.
    Match(usize),
    /// No match yet; the consumer stays registered.
    NoMatch,
    /// The predicate errored; the error went out on the result channel and
    /// the producer removes the consumer.
    Failed,
    /// The predicate reported an end position past the buffer. Fatal.
    Violation {
        /// The reported end position.
        end_pos: usize,
        /// The length of the buffer that was reported.
        buffer_len: usize,
    },
}

pub(crate) struct OutputConsumer {
    label: String,
    timeout: Duration,
    predicate: Mutex<Predicate>,
    waiter: Mutex<Option<oneshot::Sender<Result<()>>>>,
    alive: AtomicBool,
}

impl OutputConsumer {
    pub(crate) fn new(
        predicate: Predicate,
        timeout: Duration,
        label: impl Into<String>,
    ) -> (Arc<Self>, ConsumerHandle) {
        let (tx, rx) = oneshot::channel();
        let consumer = Arc::new(Self {
            label: label.into(),
            timeout,
            predicate: Mutex::new(predicate),
            waiter: Mutex::new(Some(tx)),
            alive: AtomicBool::new(true),
        });
        let handle = ConsumerHandle {
            consumer: Arc::clone(&consumer),
            rx,
        };
        (consumer, handle)
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    /// Whether the expecting task is still waiting for a result. The
    /// producer drops consumers whose wait has already returned.
    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Run the predicate over the unconsumed transcript. Called by the
    /// producer with its mutex held; the predicate must not block.
    pub(crate) fn report(&self, buffer: &str) -> Verdict {
        let outcome = {
            let mut predicate = self
                .predicate
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            (*predicate)(buffer)
        };

        match outcome {
            Err(err) => {
                debug!(target: "termtest", consumer = %self.label, %err, "predicate failed");
                self.deliver(Err(TermTestError::Predicate(err)));
                Verdict::Failed
            }
            Ok(end_pos) if end_pos > buffer.len() => {
                let violation = Verdict::Violation {
                    end_pos,
                    buffer_len: buffer.len(),
                };
                self.deliver(Err(TermTestError::ContractViolation {
                    end_pos,
                    buffer_len: buffer.len(),
                }));
                violation
            }
            Ok(0) => Verdict::NoMatch,
            Ok(end_pos) => {
                trace!(target: "termtest", consumer = %self.label, end_pos, "predicate matched");
                self.deliver(Ok(()));
                Verdict::Match(end_pos)
            }
        }
    }

    /// Resolve this consumer with a terminal error (e.g. the session
    /// stopped while it was still pending).
    pub(crate) fn abort(&self, err: TermTestError) {
        self.deliver(Err(err));
    }

    fn deliver(&self, result: Result<()>) {
        let tx = self
            .waiter
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(tx) = tx {
            // The receiver may already be gone (wait timed out); that is
            // its own terminal outcome, so the send result is irrelevant.
            let _ = tx.send(result);
        }
    }
}

impl std::fmt::Debug for OutputConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputConsumer")
            .field("label", &self.label)
            .field("timeout", &self.timeout)
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}

/// The expecting task's side of a registered consumer.
pub(crate) struct ConsumerHandle {
    consumer: Arc<OutputConsumer>,
    rx: oneshot::Receiver<Result<()>>,
}

impl ConsumerHandle {
    /// Block until the consumer resolves: match, predicate error, premature
    /// stop, or timeout. Clears the liveness flag on every exit path so the
    /// producer never invokes the predicate for a consumer whose wait has
    /// returned.
    pub(crate) async fn wait(self) -> Result<()> {
        let timeout = self.consumer.timeout;
        let outcome = tokio::time::timeout(timeout, self.rx).await;
        self.consumer.alive.store(false, Ordering::Release);

        match outcome {
            Ok(Ok(result)) => result,
            // The sender side vanished without a result: the producer was
            // torn down while we were pending.
            Ok(Err(_)) => Err(TermTestError::StopPremature),
            Err(_) => {
                debug!(target: "termtest", consumer = %self.consumer.label(), "expectation timed out");
                Err(TermTestError::timeout(timeout, String::new()))
            }
        }
    }
}
