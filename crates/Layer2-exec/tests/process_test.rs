//! End-to-end process tests against the local backend
//!
//! `cargo test -p overseer-exec --test process_test -- --nocapture`

#![cfg(unix)]

use overseer_exec::{
    Context, Create, Error, LoggerConfig, Output, SharedBuffer, Signal, Status,
};
use std::time::{Duration, Instant};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("overseer_exec=debug")
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn test_local_success() {
    init_tracing();
    let mut create = Create::new(["true"]);
    let (exec, _) = create.resolve(&Context::background()).await.expect("resolve failed");

    exec.start().await.expect("start failed");
    exec.wait().await.expect("wait failed");
    assert_eq!(exec.exit_code(), 0);
    assert!(exec.success());
    assert!(exec.pid().await > 0);

    exec.close().await.expect("close failed");
    assert_eq!(exec.status(), Status::Closed);
    create.close().expect("create close failed");
}

#[tokio::test]
async fn test_local_failure() {
    let mut create = Create::new(["false"]);
    let (exec, _) = create.resolve(&Context::background()).await.expect("resolve failed");

    exec.start().await.expect("start failed");
    let err = exec.wait().await.expect_err("false should fail");
    assert!(err.is_process_outcome());
    assert_eq!(exec.exit_code(), 1);
    assert!(!exec.success());
}

#[tokio::test]
async fn test_signal_death() {
    let mut create = Create::new(["sleep", "100"]);
    let (exec, _) = create.resolve(&Context::background()).await.expect("resolve failed");

    exec.start().await.expect("start failed");
    exec.signal(Signal::Term).await.expect("signal failed");

    assert!(exec.wait().await.is_err());
    assert_eq!(exec.exit_code(), Signal::Term.number());
    assert_eq!(exec.signal_info(), Some(Signal::Term));

    // Already exited
    assert!(exec.signal(Signal::Kill).await.is_err());
}

#[tokio::test]
async fn test_timeout_enforced() {
    let mut create = Create::new(["sleep", "10"]).with_timeout(Duration::from_secs(1));
    let started = Instant::now();
    let (exec, deadline) = create.resolve(&Context::background()).await.expect("resolve failed");
    assert!(deadline.is_some());

    exec.start().await.expect("start failed");
    let err = exec.wait().await.expect_err("wait should time out");
    let elapsed = started.elapsed();

    assert!(err.is_context(), "unexpected error: {}", err);
    assert!(elapsed >= Duration::from_millis(900), "returned too early: {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(5), "timeout not enforced: {:?}", elapsed);
    create.close().expect("create close failed");
}

#[tokio::test]
async fn test_start_twice_and_wait_before_start() {
    let mut create = Create::new(["true"]);
    let (exec, _) = create.resolve(&Context::background()).await.expect("resolve failed");

    assert!(matches!(exec.wait().await, Err(Error::Lifecycle(_))));
    assert_eq!(exec.status(), Status::Unstarted);

    exec.start().await.expect("start failed");
    assert!(exec.start().await.is_err());
    assert!(exec.status() >= Status::Running);
    exec.wait().await.expect("wait failed");
}

#[tokio::test]
async fn test_environment_override() {
    let mut create = Create::new(["true"]);
    create.add_env("foo", "bar");
    create.override_environ = true;
    let (exec, _) = create.resolve(&Context::background()).await.expect("resolve failed");
    assert_eq!(exec.env(), vec!["foo=bar".to_string()]);

    let mut create = Create::new(["true"]);
    create.add_env("foo", "bar");
    let (exec, _) = create.resolve(&Context::background()).await.expect("resolve failed");
    let env = exec.env();
    assert!(env.len() > 1);
    assert!(env.contains(&"foo=bar".to_string()));
}

#[tokio::test]
async fn test_environment_reaches_process() {
    let out = SharedBuffer::new();
    let mut create = Create::new(["sh", "-c", "echo $GREETING"])
        .with_output(Output::default().with_output(out.writer()));
    create.add_env("GREETING", "hello from overseer");

    let (exec, _) = create.resolve(&Context::background()).await.expect("resolve failed");
    exec.start().await.expect("start failed");
    exec.wait().await.expect("wait failed");
    assert_eq!(out.contents(), "hello from overseer\n");
}

#[tokio::test]
async fn test_stdin_bytes_and_stderr_redirect() {
    let out = SharedBuffer::new();
    let mut create = Create::new(["sh", "-c", "cat; echo oops >&2"])
        .with_stdin_bytes("piped input\n")
        .with_output(Output {
            output: out.writer(),
            send_error_to_output: true,
            ..Default::default()
        });

    let (exec, _) = create.resolve(&Context::background()).await.expect("resolve failed");
    exec.start().await.expect("start failed");
    exec.wait().await.expect("wait failed");

    let text = out.contents();
    assert!(text.contains("piped input\n"));
    assert!(text.contains("oops\n"));
}

#[tokio::test]
async fn test_output_logged_and_flushed_on_close() {
    let mut create = Create::new(["printf", "line one\\nno newline"])
        .with_output(Output::default().with_logger(LoggerConfig::in_memory("proc", 100)));

    let (exec, _) = create.resolve(&Context::background()).await.expect("resolve failed");
    exec.start().await.expect("start failed");
    exec.wait().await.expect("wait failed");

    let cached = create.output.cached_logger("proc-1");
    let log = cached
        .output
        .and_then(|sender| sender.in_memory())
        .expect("in-memory logger");
    assert_eq!(log.text(), "line one");

    create.close().expect("create close failed");
    assert_eq!(log.text(), "line one\nno newline");
}

#[tokio::test]
async fn test_redirect_cycle_rejected_before_resolution() {
    let mut create = Create::new(["true"]).with_output(Output {
        output: SharedBuffer::new().writer(),
        error: SharedBuffer::new().writer(),
        send_output_to_error: true,
        send_error_to_output: true,
        ..Default::default()
    });
    let err = create
        .resolve(&Context::background())
        .await
        .err()
        .expect("cycle should be rejected");
    assert!(err.is_validation());
}

#[tokio::test]
async fn test_copy_resolves_independently() {
    let mut original = Create::new(["echo", "original"]).with_tag("batch");
    let mut copy = original.copy();
    original.args = vec!["echo".into(), "changed".into()];

    let out = SharedBuffer::new();
    copy.output = Output::default().with_output(out.writer());
    let (exec, _) = copy.resolve(&Context::background()).await.expect("resolve failed");
    exec.start().await.expect("start failed");
    exec.wait().await.expect("wait failed");
    assert_eq!(out.contents(), "original\n");
    assert_eq!(copy.tags, vec!["batch"]);
}

#[tokio::test]
async fn test_command_line_round_trip() {
    let out = SharedBuffer::new();
    let mut create = Create::from_command_line("NAME='two words' sh -c 'echo \"$NAME\"'")
        .expect("parse failed")
        .with_output(Output::default().with_output(out.writer()));

    let (exec, _) = create.resolve(&Context::background()).await.expect("resolve failed");
    exec.start().await.expect("start failed");
    exec.wait().await.expect("wait failed");
    assert_eq!(out.contents(), "two words\n");
}
