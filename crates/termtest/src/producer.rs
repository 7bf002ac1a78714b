//! The output pipeline: transcript ownership, incremental sanitization,
//! and consumer fan-out.
//!
//! A single reader thread drains the PTY and appends here; expecting tasks
//! register consumers and block on their result channels. One mutex guards
//! the transcript (`output`, `cursor_pos`, `clean_upto`) and the consumer
//! list; every path that touches any of them holds it.
//!
//! Invariants:
//! - `0 <= cursor_pos` and `clean_upto <= output.len()`
//! - bytes in `output[..clean_upto]` are sanitized and never rewritten
//! - bytes in `output[clean_upto..]` are the raw, not-yet-cleanable tail
//! - consumers are visited in registration order and removed as they resolve

use std::io::Read;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, trace};

use crate::consumer::{ConsumerHandle, OutputConsumer, Predicate, Verdict};
use crate::error::{Result, TermTestError};
use crate::options::Options;
use crate::sanitize::{normalize_line_ends, sanitize};

/// Size of each read from the PTY.
const READ_CHUNK_SIZE: usize = 1024;

pub(crate) struct OutputProducer {
    opts: Options,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    /// The full sanitized transcript (with a raw tail past `clean_upto`).
    output: Vec<u8>,
    /// Byte index every "next match" starts from: how far consumers have
    /// consumed the transcript.
    cursor_pos: usize,
    /// The prefix of `output` that has been sanitized and is immutable.
    clean_upto: usize,
    /// Live consumers in registration order.
    consumers: Vec<Arc<OutputConsumer>>,
    /// Set once the final append has run; no more output will arrive.
    stopped: bool,
}

impl OutputProducer {
    pub(crate) fn new(opts: Options) -> Arc<Self> {
        Arc::new(Self {
            opts,
            state: Mutex::new(State::default()),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The read loop. Runs on a dedicated thread until the PTY reaches EOF
    /// or fails. `tap` sees every raw chunk before sanitization (emulator,
    /// mirror, cursor-report replies).
    pub(crate) fn listen(
        &self,
        mut reader: Box<dyn Read + Send>,
        mut tap: impl FnMut(&[u8]),
    ) -> Result<()> {
        debug!(target: "termtest", "listen started");
        let mut buf = [0u8; READ_CHUNK_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => {
                    debug!(target: "termtest", "listen reached EOF");
                    self.append_buffer(&[], true)?;
                    return Ok(());
                }
                Ok(n) => {
                    trace!(target: "termtest", bytes = n, "read chunk from pty");
                    tap(&buf[..n]);
                    self.append_buffer(&buf[..n], false)?;
                }
                Err(err) if is_pty_eof(&err) => {
                    debug!(target: "termtest", %err, "listen reached EOF (closed pty)");
                    self.append_buffer(&[], true)?;
                    return Ok(());
                }
                Err(err) => {
                    debug!(target: "termtest", %err, "listen failed");
                    self.abort_all();
                    return Err(TermTestError::Io(err));
                }
            }
        }
    }

    /// Append a chunk to the transcript, sanitize what is safe to sanitize,
    /// and wake consumers. `is_final` commits the trailing bytes that never
    /// ended with a newline; it must be passed exactly once, when no more
    /// output will arrive.
    pub(crate) fn append_buffer(&self, value: &[u8], is_final: bool) -> Result<()> {
        let value = if self.opts.normalized_line_ends {
            normalize_line_ends(value)
        } else {
            value.to_vec()
        };

        let mut st = self.lock_state();
        st.output.extend_from_slice(&value);

        let (output, cursor_pos, clean_upto) = process_dirty_output(
            &st.output,
            st.cursor_pos,
            st.clean_upto,
            is_final,
            &mut |chunk, cursor| {
                let (chunk, cursor) = sanitize(chunk, cursor, self.opts.posix);
                match &self.opts.output_sanitizer {
                    Some(user) => user(&chunk, cursor).map_err(TermTestError::Sanitizer),
                    None => Ok((chunk, cursor)),
                }
            },
        )?;
        trace!(
            target: "termtest",
            appended = value.len(),
            is_final,
            clean_upto,
            "transcript grew to {} bytes",
            output.len()
        );
        st.output = output;
        st.cursor_pos = cursor_pos;
        st.clean_upto = clean_upto;

        let flushed = self.flush_consumers(&mut st);

        if is_final {
            st.stopped = true;
            abort_pending(&mut st);
        }

        flushed
    }

    /// Visit consumers in registration order against the unconsumed
    /// transcript. Matches advance the cursor and remove the consumer;
    /// predicate errors remove it without advancing (the error reaches the
    /// expecting task through its channel); a contract violation is fatal.
    fn flush_consumers(&self, st: &mut State) -> Result<()> {
        let mut i = 0;
        while i < st.consumers.len() {
            if st.cursor_pos >= st.output.len() {
                return Ok(());
            }
            let consumer = Arc::clone(&st.consumers[i]);

            if !consumer.is_alive() {
                debug!(target: "termtest", consumer = %consumer.label(), "dropping dead consumer");
                st.consumers.remove(i);
                continue;
            }

            let pending = String::from_utf8_lossy(&st.output[st.cursor_pos..]).into_owned();
            match consumer.report(&pending) {
                Verdict::NoMatch => i += 1,
                Verdict::Match(end_pos) => {
                    st.cursor_pos = (st.cursor_pos + end_pos).min(st.output.len());
                    st.consumers.remove(i);
                }
                Verdict::Failed => {
                    st.consumers.remove(i);
                }
                Verdict::Violation { end_pos, buffer_len } => {
                    st.consumers.remove(i);
                    return Err(TermTestError::ContractViolation { end_pos, buffer_len });
                }
            }
        }
        Ok(())
    }

    /// Register a consumer and flush immediately, so predicates already
    /// satisfied by buffered output resolve without waiting for new input.
    pub(crate) fn add_consumer(
        &self,
        predicate: Predicate,
        timeout: Duration,
        label: impl Into<String>,
    ) -> ConsumerHandle {
        let (consumer, handle) = OutputConsumer::new(predicate, timeout, label);
        let mut st = self.lock_state();
        debug!(target: "termtest", consumer = %consumer.label(), "adding consumer");
        st.consumers.push(consumer);
        if let Err(err) = self.flush_consumers(&mut st) {
            // The violating consumer already received the error on its
            // channel; there is no read loop on this path to tear down.
            debug!(target: "termtest", %err, "flush failed while adding consumer");
        }
        if st.stopped {
            abort_pending(&mut st);
        }
        handle
    }

    /// Resolve every pending consumer with a premature stop.
    pub(crate) fn abort_all(&self) {
        let mut st = self.lock_state();
        st.stopped = true;
        abort_pending(&mut st);
    }

    /// The full sanitized transcript.
    pub(crate) fn output(&self) -> Vec<u8> {
        self.lock_state().output.clone()
    }

    /// The transcript past the consumer cursor: what no consumer has
    /// matched yet.
    pub(crate) fn pending_output(&self) -> Vec<u8> {
        let st = self.lock_state();
        st.output[st.cursor_pos..].to_vec()
    }

    #[cfg(test)]
    fn positions(&self) -> (usize, usize, usize) {
        let st = self.lock_state();
        (st.cursor_pos, st.clean_upto, st.output.len())
    }
}

fn abort_pending(st: &mut State) {
    for consumer in st.consumers.drain(..) {
        if consumer.is_alive() {
            debug!(target: "termtest", consumer = %consumer.label(), "aborting pending consumer");
            consumer.abort(TermTestError::StopPremature);
        }
    }
}

/// Sanitize the part of the transcript that has fully arrived.
///
/// Control sequences and multi-byte runes may straddle read boundaries, so
/// only the raw tail up to its last newline is safe to clean; anything after
/// it is carried raw until more output (or the final append) arrives. The
/// cleaner sees a cursor relative to the chunk it is given and may move it.
fn process_dirty_output(
    output: &[u8],
    cursor_pos: usize,
    clean_upto: usize,
    is_final: bool,
    cleaner: &mut dyn FnMut(&[u8], isize) -> Result<(Vec<u8>, isize)>,
) -> Result<(Vec<u8>, usize, usize)> {
    let already_clean = &output[..clean_upto];
    let raw = &output[clean_upto..];

    let (processable, carry) = if is_final {
        // No more input: there is no point waiting for a newline that will
        // never come.
        (raw, &[][..])
    } else {
        match raw.iter().rposition(|b| *b == b'\n') {
            Some(k) => (&raw[..=k], &raw[k + 1..]),
            None => (&[][..], raw),
        }
    };

    let mut rel_cursor = cursor_pos as isize - clean_upto as isize;
    let mut processed = Vec::new();
    if !processable.is_empty() {
        let (cleaned, cursor) = cleaner(processable, rel_cursor)?;
        processed = cleaned;
        rel_cursor = cursor;
    }

    // Back to an absolute position. The cleaner cannot know where the start
    // of the transcript is, so the clamp to zero happens here.
    let abs_cursor = (rel_cursor + clean_upto as isize).max(0) as usize;
    let new_clean_upto = clean_upto + processed.len();

    let mut new_output = Vec::with_capacity(clean_upto + processed.len() + carry.len());
    new_output.extend_from_slice(already_clean);
    new_output.extend_from_slice(&processed);
    new_output.extend_from_slice(carry);

    let abs_cursor = abs_cursor.min(new_output.len());
    Ok((new_output, abs_cursor, new_clean_upto))
}

/// Platform error taxonomy for "the PTY is gone": EOF proper, a closed
/// pipe, or (on POSIX) the EIO a master read returns once the pty has been
/// reaped.
fn is_pty_eof(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    if matches!(err.kind(), ErrorKind::UnexpectedEof | ErrorKind::BrokenPipe) {
        return true;
    }
    #[cfg(unix)]
    {
        if err.raw_os_error() == Some(libc::EIO) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn producer() -> Arc<OutputProducer> {
        OutputProducer::new(Options::new().posix(false))
    }

    fn contains(needle: &'static str) -> Predicate {
        Box::new(move |buffer: &str| Ok(buffer.find(needle).map_or(0, |i| i + needle.len())))
    }

    const TIMEOUT: Duration = Duration::from_secs(1);
    const SHORT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn transcript_only_grows() {
        let p = producer();
        p.append_buffer(b"one\n", false).unwrap();
        let (c1, u1, l1) = p.positions();
        p.append_buffer(b"two\n", false).unwrap();
        let (c2, u2, l2) = p.positions();
        assert!(l2 > l1 && u2 >= u1 && c2 >= c1);

        let handle = p.add_consumer(contains("two"), TIMEOUT, "two");
        handle.wait().await.unwrap();
        let (c3, u3, l3) = p.positions();
        assert!(c3 > c2 && u3 == u2 && l3 == l2);
    }

    #[tokio::test]
    async fn tail_without_newline_stays_raw_until_final() {
        let p = producer();
        p.append_buffer(b"\x1b[32mgreen\x1b[0m\nhalf \x1b[1m", false)
            .unwrap();
        let out = p.output();
        // The cleaned prefix lost its codes; the carried tail kept them.
        assert!(out.starts_with(b"green\n"));
        assert!(out.ends_with(b"\x1b[1m"));

        p.append_buffer(b"", true).unwrap();
        assert_eq!(p.output(), b"green\nhalf ".to_vec());
    }

    #[tokio::test]
    async fn split_safety_over_every_boundary() {
        let input: &[u8] = b"\x1b[32mgreen\x1b[0m line\nFoo \x08Bar\n\x1b]0;title\x07rest\n";

        let whole = producer();
        whole.append_buffer(input, true).unwrap();
        let expected = whole.output();

        for split in 0..=input.len() {
            let p = producer();
            p.append_buffer(&input[..split], false).unwrap();
            p.append_buffer(&input[split..], true).unwrap();
            assert_eq!(p.output(), expected, "split at {split} diverged");
        }
    }

    #[tokio::test]
    async fn consumers_match_in_registration_order() {
        let p = producer();
        let first = p.add_consumer(contains("ONE"), TIMEOUT, "first");
        let second = p.add_consumer(contains("ONE"), SHORT, "second");

        p.append_buffer(b"say ONE once\n", true).unwrap();

        first.wait().await.unwrap();
        // Only one occurrence: the second consumer never resolves with a
        // match. The final append aborted it.
        let err = second.wait().await.unwrap_err();
        assert!(err.is_premature_stop());
    }

    #[tokio::test]
    async fn second_occurrence_satisfies_second_consumer() {
        let p = producer();
        let first = p.add_consumer(contains("hit"), TIMEOUT, "first");
        let second = p.add_consumer(contains("hit"), TIMEOUT, "second");

        p.append_buffer(b"hit and another hit\n", false).unwrap();

        first.wait().await.unwrap();
        second.wait().await.unwrap();
        // First consumed through the first "hit", second through the next.
        let (cursor, _, _) = p.positions();
        assert_eq!(cursor, b"hit and another hit".len());
    }

    #[tokio::test]
    async fn later_consumer_never_sees_consumed_bytes() {
        let p = producer();
        p.append_buffer(b"alpha beta\n", false).unwrap();

        p.add_consumer(contains("alpha"), TIMEOUT, "alpha")
            .wait()
            .await
            .unwrap();

        // "alpha" is behind the cursor now.
        let err = p
            .add_consumer(contains("alpha"), SHORT, "stale")
            .wait()
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        p.add_consumer(contains("beta"), TIMEOUT, "beta")
            .wait()
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn buffered_output_resolves_a_new_consumer_immediately() {
        let p = producer();
        p.append_buffer(b"already here\n", false).unwrap();
        p.add_consumer(contains("already"), SHORT, "late")
            .wait()
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn predicate_error_does_not_advance_cursor() {
        let p = producer();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        let failing: Predicate = Box::new(move |_| {
            calls2.fetch_add(1, Ordering::SeqCst);
            Err("bad predicate".into())
        });

        let handle = p.add_consumer(failing, TIMEOUT, "failing");
        let (cursor_before, _, _) = p.positions();
        p.append_buffer(b"some output\n", false).unwrap();

        let err = handle.wait().await.unwrap_err();
        assert!(matches!(err, TermTestError::Predicate(_)));
        let (cursor_after, _, _) = p.positions();
        assert_eq!(cursor_before, cursor_after);

        // Removed on failure: further appends never invoke it again.
        let before = calls.load(Ordering::SeqCst);
        p.append_buffer(b"more output\n", false).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), before);
    }

    #[tokio::test]
    async fn end_position_past_buffer_is_fatal() {
        let p = producer();
        let lying: Predicate = Box::new(|buffer: &str| Ok(buffer.len() + 1));
        let handle = p.add_consumer(lying, TIMEOUT, "lying");

        let err = p.append_buffer(b"abc\n", false).unwrap_err();
        assert!(matches!(err, TermTestError::ContractViolation { .. }));
        let err = handle.wait().await.unwrap_err();
        assert!(matches!(err, TermTestError::ContractViolation { .. }));
    }

    #[tokio::test]
    async fn timed_out_consumer_is_dropped_on_next_flush() {
        let p = producer();
        let handle = p.add_consumer(contains("never"), SHORT, "doomed");
        assert!(handle.wait().await.unwrap_err().is_timeout());

        // The next append prunes it without invoking anything.
        p.append_buffer(b"whatever\n", false).unwrap();
        let st = p.lock_state();
        assert!(st.consumers.is_empty());
    }

    #[tokio::test]
    async fn final_append_aborts_pending_consumers() {
        let p = producer();
        let handle = p.add_consumer(contains("never"), Duration::from_secs(30), "pending");
        p.append_buffer(b"unrelated\n", true).unwrap();
        let err = handle.wait().await.unwrap_err();
        assert!(err.is_premature_stop());
    }

    #[tokio::test]
    async fn consumer_after_stop_still_matches_buffered_output() {
        let p = producer();
        p.append_buffer(b"left behind\n", true).unwrap();

        // Unconsumed transcript still satisfies a late expectation.
        p.add_consumer(contains("behind"), SHORT, "late-match")
            .wait()
            .await
            .unwrap();

        // But one that cannot match resolves as a premature stop, not a
        // timeout.
        let err = p
            .add_consumer(contains("nope"), Duration::from_secs(30), "late-miss")
            .wait()
            .await
            .unwrap_err();
        assert!(err.is_premature_stop());
    }

    #[tokio::test]
    async fn user_sanitizer_runs_after_builtin() {
        let opts = Options::new().posix(false).output_sanitizer(Arc::new(
            |chunk: &[u8], cursor: isize| {
                let rewritten: Vec<u8> = chunk
                    .iter()
                    .map(|b| if *b == b'a' { b'A' } else { *b })
                    .collect();
                Ok((rewritten, cursor))
            },
        ));
        let p = OutputProducer::new(opts);
        p.append_buffer(b"\x1b[1mbanana\x1b[0m\n", true).unwrap();
        assert_eq!(p.output(), b"bAnAnA\n".to_vec());
    }

    #[tokio::test]
    async fn normalized_line_ends_strip_carriage_returns() {
        let p = OutputProducer::new(Options::new().posix(false).normalized_line_ends(true));
        p.append_buffer(b"one\r\ntwo\r\n", true).unwrap();
        assert_eq!(p.output(), b"one\ntwo\n".to_vec());
    }

    #[tokio::test]
    async fn listen_feeds_tap_before_transcript() {
        struct Chunks {
            data: Vec<Vec<u8>>,
            next: usize,
        }
        impl Read for Chunks {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                if self.next >= self.data.len() {
                    return Ok(0);
                }
                let chunk = &self.data[self.next];
                self.next += 1;
                buf[..chunk.len()].copy_from_slice(chunk);
                Ok(chunk.len())
            }
        }

        let p = producer();
        let reader = Box::new(Chunks {
            data: vec![b"\x1b[32mraw\x1b[0m\n".to_vec()],
            next: 0,
        });
        let mut mirrored = Vec::new();
        p.listen(reader, |chunk| mirrored.extend_from_slice(chunk))
            .unwrap();

        // The tap saw the escape codes; the transcript does not have them.
        assert_eq!(mirrored, b"\x1b[32mraw\x1b[0m\n".to_vec());
        assert_eq!(p.output(), b"raw\n".to_vec());
    }
}
