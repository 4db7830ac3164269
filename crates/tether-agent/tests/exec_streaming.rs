//! Shell executor behavior, observed on the outbound message queue.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use tether_agent::cancel::CancelToken;
use tether_agent::exec::handle_exec;
use tether_agent::transport::{Outbox, WriteOp};
use tether_core::protocol::{AgentPayload, ExecOutput, ExecRequest};

/// Drain exec output messages for one request until `done=true`.
async fn collect_outputs(rx: &mut mpsc::Receiver<WriteOp>, request_id: &str) -> Vec<ExecOutput> {
    let mut outputs = Vec::new();
    loop {
        let op = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for exec output")
            .expect("outbox closed before done message");
        let WriteOp::Message(env) = op else {
            panic!("unexpected keep-alive on the outbox")
        };
        assert_eq!(env.request_id, request_id);
        let AgentPayload::ExecOutput(out) = env.payload else {
            panic!("unexpected payload for exec request")
        };
        let done = out.done;
        outputs.push(out);
        if done {
            return outputs;
        }
    }
}

fn exec_request(command: &str, workdir: &str, timeout_ms: i64) -> ExecRequest {
    ExecRequest {
        command: command.to_string(),
        workdir: workdir.to_string(),
        timeout_ms,
    }
}

#[tokio::test]
async fn streams_stdout_lines_then_terminal_message() {
    let (outbox, mut rx) = Outbox::channel(64);
    handle_exec(
        outbox,
        "r1".into(),
        exec_request("printf 'a\\nb\\n'", "/tmp", 0),
        Arc::new(vec!["/tmp".to_string()]),
        CancelToken::new(),
    )
    .await;

    let outputs = collect_outputs(&mut rx, "r1").await;
    assert_eq!(outputs.len(), 3);
    assert_eq!(outputs[0].stdout, "a\n");
    assert!(!outputs[0].done);
    assert_eq!(outputs[1].stdout, "b\n");

    let done = &outputs[2];
    assert!(done.done);
    assert_eq!(done.exit_code, 0);
    assert_eq!(done.stdout, "");
    assert_eq!(done.stderr, "");
    assert_eq!(done.workdir, "/tmp");
}

#[tokio::test]
async fn deadline_kills_command_with_exit_124() {
    let (outbox, mut rx) = Outbox::channel(64);
    let start = Instant::now();
    handle_exec(
        outbox,
        "r2".into(),
        exec_request("sleep 5", "/tmp", 100),
        Arc::new(Vec::new()),
        CancelToken::new(),
    )
    .await;

    let outputs = collect_outputs(&mut rx, "r2").await;
    assert_eq!(outputs.len(), 1);
    assert!(outputs[0].done);
    assert_eq!(outputs[0].exit_code, 124);
    // Killed shortly after the 100ms deadline, not after the full sleep
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn denied_workdir_fails_without_spawning() {
    let (outbox, mut rx) = Outbox::channel(64);
    handle_exec(
        outbox,
        "r3".into(),
        exec_request("echo hi", "/etc", 0),
        Arc::new(vec!["/tmp".to_string()]),
        CancelToken::new(),
    )
    .await;

    let outputs = collect_outputs(&mut rx, "r3").await;
    assert_eq!(outputs.len(), 1);
    assert!(outputs[0].done);
    assert_eq!(outputs[0].exit_code, 1);
    assert!(outputs[0].stderr.contains("路径不允许"));
    assert_eq!(outputs[0].workdir, "/etc");
}

#[tokio::test]
async fn stderr_arrives_only_in_terminal_message() {
    let (outbox, mut rx) = Outbox::channel(64);
    handle_exec(
        outbox,
        "r4".into(),
        exec_request("echo out; echo err 1>&2; exit 3", "/tmp", 0),
        Arc::new(Vec::new()),
        CancelToken::new(),
    )
    .await;

    let outputs = collect_outputs(&mut rx, "r4").await;
    assert_eq!(outputs.len(), 2);
    assert_eq!(outputs[0].stdout, "out\n");
    assert_eq!(outputs[0].stderr, "");

    let done = &outputs[1];
    assert!(done.done);
    assert_eq!(done.exit_code, 3);
    assert_eq!(done.stderr, "err\n");
}

#[tokio::test]
async fn nonzero_exit_code_is_reported() {
    let (outbox, mut rx) = Outbox::channel(64);
    handle_exec(
        outbox,
        "r5".into(),
        exec_request("exit 7", "/tmp", 0),
        Arc::new(Vec::new()),
        CancelToken::new(),
    )
    .await;

    let outputs = collect_outputs(&mut rx, "r5").await;
    assert_eq!(outputs.last().unwrap().exit_code, 7);
}

#[tokio::test]
async fn session_cancel_interrupts_running_command() {
    let (outbox, mut rx) = Outbox::channel(64);
    let cancel = CancelToken::new();

    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let start = Instant::now();
    handle_exec(
        outbox,
        "r6".into(),
        exec_request("sleep 5", "/tmp", 60_000),
        Arc::new(Vec::new()),
        cancel,
    )
    .await;

    // Terminal message still goes out on teardown
    let outputs = collect_outputs(&mut rx, "r6").await;
    assert!(outputs.last().unwrap().done);
    assert!(start.elapsed() < Duration::from_secs(2));
}
