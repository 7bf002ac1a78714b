//! Session lifecycle tests: spawning, sending, waiting, and the two views
//! of the output (transcript vs. screen snapshot).
//!
//! These spawn real shells and are Unix-only.

#![cfg(unix)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use termtest::{CommandBuilder, ExpectOptions, MirrorWriter, Options, TermTest};

fn bash() -> CommandBuilder {
    CommandBuilder::new("bash")
}

fn bash_c(script: &str) -> CommandBuilder {
    let mut cmd = CommandBuilder::new("bash");
    cmd.arg("-c");
    cmd.arg(script);
    cmd
}

async fn spawn(cmd: CommandBuilder, opts: Options) -> TermTest {
    // Run with RUST_LOG=termtest=trace for a full session log.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    TermTest::spawn(cmd, opts).await.expect("spawn failed")
}

#[tokio::test]
async fn basic_echo_and_exit() {
    let tt = spawn(bash(), Options::new()).await;

    tt.send_line("echo ABC").unwrap();
    tt.expect("ABC").await.unwrap();

    tt.send_line("exit").unwrap();
    tt.expect_exit_code(0).await.unwrap();

    assert!(tt.output().contains("ABC"));
}

#[tokio::test]
async fn wait_after_short_lived_command() {
    let tt = spawn(bash_c("echo done"), Options::new()).await;
    tt.wait(Duration::from_secs(5)).await.unwrap();
    assert!(tt.is_closed());
    assert!(tt.output().contains("done"));

    // Waiting again is a no-op.
    tt.wait(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn expectation_after_wait_reports_premature_stop() {
    let tt = spawn(bash_c("echo gone"), Options::new()).await;
    tt.wait(Duration::from_secs(5)).await.unwrap();

    let err = tt
        .expect_with(
            "too late",
            ExpectOptions::new()
                .timeout(Duration::from_millis(50))
                .silence(),
        )
        .await
        .unwrap_err();
    assert!(err.is_premature_stop(), "got: {err}");
}

#[tokio::test]
async fn transcript_keeps_wide_lines_that_the_screen_wraps() {
    let wide = "a".repeat(10_000);
    let tt = spawn(
        bash_c("printf 'a%.0s' $(seq 1 10000); echo"),
        Options::new().cols(80).rows(10),
    )
    .await;
    tt.expect_exit_code(0).await.unwrap();

    // The transcript does not clip, no matter the terminal width.
    assert!(tt.output().contains(&wide));

    // The screen is bounded by its geometry: no rendered row exceeds the
    // configured width, and the whole snapshot fits rows x cols.
    let snapshot = tt.snapshot();
    assert!(snapshot.lines().all(|line| line.chars().count() <= 80));
    assert!(snapshot.chars().count() <= 80 * 10 + 10);
}

#[tokio::test]
async fn snapshot_keeps_full_line_at_matching_width() {
    let wide = "a".repeat(100);
    let tt = spawn(bash(), Options::new().cols(100)).await;

    tt.send_line(&format!("echo {wide}")).unwrap();
    tt.expect(&wide).await.unwrap();
    tt.send_line("exit").unwrap();
    tt.expect_exit_code(0).await.unwrap();

    assert!(tt.snapshot().contains(&wide));
}

#[tokio::test]
async fn pending_output_shrinks_as_expectations_consume() {
    let tt = spawn(bash_c("echo MATCH1 MATCH2 MATCH3"), Options::new()).await;

    tt.expect("MATCH1").await.unwrap();
    assert!(tt.pending_output().contains(" MATCH2 MATCH3"));
    assert!(!tt.pending_output().contains("MATCH1"));

    tt.expect("MATCH2").await.unwrap();
    assert!(tt.pending_output().contains(" MATCH3"));

    tt.expect_exit_code(0).await.unwrap();
    assert!(tt.output().contains("MATCH1 MATCH2 MATCH3"));
    assert!(tt.snapshot().contains("MATCH1 MATCH2 MATCH3"));
}

#[tokio::test]
async fn normalized_line_ends_match_across_crlf() {
    let path = std::env::temp_dir().join(format!("termtest-normalized-{}", std::process::id()));
    std::fs::write(&path, "foo\r\nbar").unwrap();

    let tt = spawn(bash(), Options::new().normalized_line_ends(true)).await;
    tt.send_line(&format!("cat {}", path.display())).unwrap();
    tt.expect("foo\nbar").await.unwrap();

    tt.send_line("exit").unwrap();
    tt.expect_exit_code(0).await.unwrap();
    assert!(!tt.output().contains('\r'));

    std::fs::remove_file(&path).ok();
}

#[tokio::test]
async fn mirror_receives_raw_bytes() {
    let captured: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let mirror: MirrorWriter = captured.clone();

    let tt = spawn(bash_c("echo MIRRORED"), Options::new().mirror(mirror)).await;
    tt.wait(Duration::from_secs(5)).await.unwrap();

    let raw = captured.lock().unwrap().clone();
    let raw = String::from_utf8_lossy(&raw).into_owned();
    assert!(raw.contains("MIRRORED"));
}

#[tokio::test]
async fn ctrl_c_interrupts_the_foreground_program() {
    let tt = spawn(CommandBuilder::new("cat"), Options::new()).await;

    tt.send_line("still alive").unwrap();
    tt.expect("still alive").await.unwrap();

    tt.send_ctrl_c().unwrap();
    tt.expect_exit().await.unwrap();
}

#[tokio::test]
async fn close_is_wait_with_a_short_default() {
    let tt = spawn(bash_c("echo closing"), Options::new()).await;
    tt.close().await.unwrap();
    assert!(tt.is_closed());
}

#[tokio::test]
async fn spawn_failure_is_an_error_not_a_hang() {
    let err = TermTest::spawn(
        CommandBuilder::new("/definitely/not/a/real/binary"),
        Options::new(),
    )
    .await;
    // Some platforms only surface the failure at first read; either way
    // construction must not succeed silently with a usable session.
    if let Ok(tt) = err {
        let err = tt
            .expect_with(
                "anything",
                ExpectOptions::new()
                    .timeout(Duration::from_secs(2))
                    .silence(),
            )
            .await
            .unwrap_err();
        assert!(err.is_premature_stop() || err.is_timeout());
    }
}

#[tokio::test]
async fn user_sanitizer_rewrites_transcript_only() {
    let opts = Options::new().output_sanitizer(Arc::new(|chunk: &[u8], cursor| {
        let rewritten: Vec<u8> = chunk
            .iter()
            .map(|b| if *b == b'X' { b'Y' } else { *b })
            .collect();
        Ok((rewritten, cursor))
    }));

    let tt = spawn(bash_c("echo XXX"), opts).await;
    tt.expect("YYY").await.unwrap();
    tt.expect_exit_code(0).await.unwrap();
    assert!(tt.output().contains("YYY"));
    // The emulator saw the raw bytes.
    assert!(tt.snapshot().contains("XXX"));
}
