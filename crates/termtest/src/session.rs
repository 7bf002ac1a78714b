//! The session: a child process bonded to a pseudo-terminal.
//!
//! [`TermTest`] spawns a command inside a PTY, keeps a terminal emulator
//! fed with everything the child writes (for [`TermTest::snapshot`]), and
//! runs the output producer that expectations attach to. Input goes to the
//! PTY master as if a user had typed it.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

use crate::error::{Result, SpawnError, TermTestError};
use crate::options::Options;
use crate::producer::OutputProducer;

/// Exit status as observed by the child-wait thread: the exit code, or the
/// reason the wait itself failed.
pub(crate) type ExitOutcome = std::result::Result<u32, String>;

type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// A child process driven through a pseudo-terminal.
///
/// Construction spawns the child and starts the single reader task that
/// feeds the terminal emulator and the transcript. Expectations
/// ([`TermTest::expect`] and friends) attach consumers to the transcript;
/// [`TermTest::wait`] tears the session down.
pub struct TermTest {
    pub(crate) opts: Options,
    pub(crate) producer: Arc<OutputProducer>,
    parser: Arc<Mutex<vt100::Parser>>,
    writer: SharedWriter,
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    pub(crate) exit_rx: watch::Receiver<Option<ExitOutcome>>,
    listen_rx: Mutex<Option<oneshot::Receiver<Result<()>>>>,
    pid: Option<u32>,
    closed: AtomicBool,
}

impl TermTest {
    /// How long [`TermTest::close`] waits for the session to wind down.
    pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

    /// Effectively forever; used by [`TermTest::wait_indefinitely`].
    const NEVER: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 100);

    /// Spawn `cmd` attached to a fresh PTY and start listening for output.
    ///
    /// Returns once the reader task is running, so sends cannot race it.
    /// If the PTY opens but the spawn fails, the PTY is released before
    /// returning.
    ///
    /// # Errors
    ///
    /// Returns an error if PTY allocation, the spawn itself, or wiring the
    /// PTY pipes fails.
    pub async fn spawn(cmd: CommandBuilder, opts: Options) -> Result<Self> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: opts.rows,
                cols: opts.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| SpawnError::pty_open(err))?;

        let parser = Arc::new(Mutex::new(vt100::Parser::new(opts.rows, opts.cols, 0)));

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|err| SpawnError::command(err))?;
        let pid = child.process_id();
        debug!(target: "termtest", ?pid, "spawned child on pty");
        // The slave has done its job; the child holds its own handle, and
        // keeping ours open would stop the master from ever reaching EOF.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|err| SpawnError::pipes(err))?;
        let writer: SharedWriter = Arc::new(Mutex::new(
            pair.master
                .take_writer()
                .map_err(|err| SpawnError::pipes(err))?,
        ));

        let (exit_tx, exit_rx) = watch::channel(None::<ExitOutcome>);
        {
            let mut child = child;
            std::thread::Builder::new()
                .name("termtest-wait".into())
                .spawn(move || {
                    let outcome = match child.wait() {
                        Ok(status) => Ok(status.exit_code()),
                        Err(err) => Err(err.to_string()),
                    };
                    debug!(target: "termtest", ?outcome, "child exited");
                    let _ = exit_tx.send(Some(outcome));
                })
                .map_err(|err| SpawnError::command(err))?;
        }

        let producer = OutputProducer::new(opts.clone());
        let (ready_tx, ready_rx) = oneshot::channel();
        let (listen_tx, listen_rx) = oneshot::channel();
        {
            let producer = Arc::clone(&producer);
            let parser = Arc::clone(&parser);
            let writer = Arc::clone(&writer);
            let mirror = opts.mirror.clone();
            std::thread::Builder::new()
                .name("termtest-reader".into())
                .spawn(move || {
                    let _ = ready_tx.send(());
                    let result = producer.listen(reader, |chunk| {
                        // The emulator and the mirror see raw bytes; only
                        // the transcript is sanitized.
                        parser
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .process(chunk);
                        respond_to_cursor_probes(chunk, &parser, &writer);
                        if let Some(mirror) = &mirror {
                            let _ = mirror
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .write_all(chunk);
                        }
                    });
                    if let Err(err) = &result {
                        warn!(target: "termtest", %err, "listener stopped with error");
                    }
                    let _ = listen_tx.send(result);
                })
                .map_err(|err| SpawnError::pipes(err))?;
        }

        ready_rx
            .await
            .map_err(|_| SpawnError::pipes("reader task exited before starting"))?;

        Ok(Self {
            opts,
            producer,
            parser,
            writer,
            master: Mutex::new(Some(pair.master)),
            exit_rx,
            listen_rx: Mutex::new(Some(listen_rx)),
            pid,
            closed: AtomicBool::new(false),
        })
    }

    /// The construction options in effect for this session.
    #[must_use]
    pub fn options(&self) -> &Options {
        &self.opts
    }

    /// The child's process id, when the platform exposes one.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether [`TermTest::wait`] or [`TermTest::close`] has completed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Send text to the terminal, as if a user typed it.
    ///
    /// # Errors
    ///
    /// Returns an error if the PTY write fails.
    pub fn send(&self, value: &str) -> Result<()> {
        debug!(target: "termtest", value, "sending");
        self.send_raw(value.as_bytes())
    }

    /// Send raw bytes to the terminal.
    ///
    /// # Errors
    ///
    /// Returns an error if the PTY write fails.
    pub fn send_raw(&self, bytes: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_all(bytes)?;
        writer.flush()?;
        Ok(())
    }

    /// Send a line to the terminal; the line separator is `\n` on POSIX
    /// and `\r\n` otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if the PTY write fails.
    pub fn send_line(&self, value: &str) -> Result<()> {
        self.send(&format!("{value}{}", self.opts.line_sep()))
    }

    /// Send Ctrl-C, as a user interrupting the foreground program would.
    ///
    /// On Windows the event is only reliably caught when the receiving
    /// process listens for console interrupts.
    ///
    /// # Errors
    ///
    /// Returns an error if the PTY write fails.
    pub fn send_ctrl_c(&self) -> Result<()> {
        self.send_raw(&[0x03])
    }

    /// The current terminal screen, as a user would see it: fixed size,
    /// reflecting cursor movement, wrapping, and overwrites.
    #[must_use]
    pub fn snapshot(&self) -> String {
        self.parser
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .screen()
            .contents()
    }

    /// The full sanitized transcript: the linear history of everything the
    /// child wrote, independent of what is still on screen.
    #[must_use]
    pub fn output(&self) -> String {
        String::from_utf8_lossy(&self.producer.output()).into_owned()
    }

    /// The transcript past the consumer cursor: everything no expectation
    /// has matched yet.
    #[must_use]
    pub fn pending_output(&self) -> String {
        String::from_utf8_lossy(&self.producer.pending_output()).into_owned()
    }

    /// Wait for the child to exit and the reader to drain, then close the
    /// PTY and return the listener's final error, if any.
    ///
    /// # Errors
    ///
    /// Returns a timeout error if the session does not wind down in time,
    /// or the listener's error if reading failed.
    #[cfg(not(windows))]
    pub async fn wait(&self, timeout: Duration) -> Result<()> {
        debug!(target: "termtest", ?timeout, "wait");
        let rx = self
            .listen_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let listen_result = match rx {
            Some(rx) => match tokio::time::timeout(timeout, rx).await {
                Err(_) => {
                    return Err(TermTestError::timeout(timeout, self.pending_output()));
                }
                Ok(Ok(result)) => result,
                // Reader thread gone without reporting; nothing to collect.
                Ok(Err(_)) => Ok(()),
            },
            None => Ok(()),
        };

        self.close_pty();
        self.closed.store(true, Ordering::Release);
        listen_result
    }

    /// Wait for the child to exit and the reader to drain, then close the
    /// PTY and return the listener's final error, if any.
    ///
    /// ConPTY does not reliably deliver EOF to the master, so this polls
    /// the child's exit instead of trusting the reader to finish, and
    /// sleeps briefly before closing the PTY: closing while racing process
    /// exit can hang the pipe.
    ///
    /// # Errors
    ///
    /// Returns a timeout error if the child does not exit in time.
    #[cfg(windows)]
    pub async fn wait(&self, timeout: Duration) -> Result<()> {
        debug!(target: "termtest", ?timeout, "wait");
        let deadline = tokio::time::Instant::now() + timeout;

        let mut exit_rx = self.exit_rx.clone();
        if tokio::time::timeout(timeout, exit_rx.wait_for(|v| v.is_some()))
            .await
            .is_err()
        {
            return Err(TermTestError::timeout(timeout, self.pending_output()));
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        self.close_pty();
        self.closed.store(true, Ordering::Release);

        let rx = self
            .listen_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(rx) = rx {
            let remaining = deadline
                .saturating_duration_since(tokio::time::Instant::now())
                .max(Duration::from_millis(100));
            if let Ok(Ok(result)) = tokio::time::timeout(remaining, rx).await {
                return result;
            }
        }
        Ok(())
    }

    /// [`TermTest::wait`] without a deadline.
    ///
    /// # Errors
    ///
    /// Returns the listener's error if reading failed.
    pub async fn wait_indefinitely(&self) -> Result<()> {
        self.wait(Self::NEVER).await
    }

    /// Wind the session down with a short default deadline. Failures pass
    /// through the session's error handler, like expectations do.
    ///
    /// # Errors
    ///
    /// Returns whatever the error handler decides for a failed teardown.
    pub async fn close(&self) -> Result<()> {
        match self.wait(Self::CLOSE_TIMEOUT).await {
            Ok(()) => Ok(()),
            Err(err) => self.opts.error_handler.apply(self, err),
        }
    }

    fn close_pty(&self) {
        // Dropping the master closes it; a second close is a no-op.
        let _ = self
            .master
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl std::fmt::Debug for TermTest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TermTest")
            .field("pid", &self.pid)
            .field("closed", &self.is_closed())
            .field("opts", &self.opts)
            .finish_non_exhaustive()
    }
}

/// Answer `ESC [6n` cursor-position queries on the emulator's behalf, so
/// programs that wait for the report do not stall under test.
fn respond_to_cursor_probes(
    chunk: &[u8],
    parser: &Arc<Mutex<vt100::Parser>>,
    writer: &SharedWriter,
) {
    let probes = chunk.windows(4).filter(|w| *w == b"\x1b[6n").count();
    if probes == 0 {
        return;
    }
    let (row, col) = parser
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .screen()
        .cursor_position();
    let report = format!("\x1b[{};{}R", row + 1, col + 1);
    let mut writer = writer.lock().unwrap_or_else(PoisonError::into_inner);
    for _ in 0..probes {
        if writer
            .write_all(report.as_bytes())
            .and_then(|()| writer.flush())
            .is_err()
        {
            break;
        }
    }
}
