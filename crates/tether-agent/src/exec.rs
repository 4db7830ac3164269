//! Shell executor: one command per request, streamed stdout, enforced
//! deadline.
//!
//! Commands run through the login shell with the current environment.
//! Stdout is forwarded line by line as non-terminal messages; stderr is
//! collected into a capped buffer and shipped only in the terminal message,
//! which always carries `done=true` and is emitted after stdout is drained.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{ChildStderr, ChildStdout, Command};
use tracing::{info, warn};

use tether_core::constants::{
    DEFAULT_EXEC_TIMEOUT_MS, EXIT_CODE_TIMEOUT, LINE_BUFFER_INITIAL, LINE_BUFFER_MAX, STDERR_CAP,
};
use tether_core::is_path_allowed;
use tether_core::protocol::{AgentEnvelope, AgentPayload, ExecOutput, ExecRequest};

use crate::cancel::CancelToken;
use crate::transport::Outbox;

/// The login shell: `$SHELL`, falling back to `/bin/sh`.
pub fn login_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

/// The user's home directory, or empty when unknown.
pub fn home_dir() -> String {
    dirs::home_dir()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Truncate to `max` characters, appending `...` when shortened.
pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let head: String = s.chars().take(max.saturating_sub(3)).collect();
    format!("{head}...")
}

/// Run one shell command and stream its output upstream.
pub async fn handle_exec(
    outbox: Outbox,
    request_id: String,
    req: ExecRequest,
    allowed_paths: Arc<Vec<String>>,
    cancel: CancelToken,
) {
    info!("[执行] $ {}", truncate(&req.command, 80));
    let start = Instant::now();

    let timeout_ms = if req.timeout_ms <= 0 {
        DEFAULT_EXEC_TIMEOUT_MS
    } else {
        req.timeout_ms
    };
    let deadline = Duration::from_millis(timeout_ms as u64);

    let workdir = if req.workdir.is_empty() {
        home_dir()
    } else {
        req.workdir.clone()
    };
    if !is_path_allowed(&workdir, &allowed_paths) {
        warn!("[执行] 拒绝: 路径不允许 {workdir}");
        send_exec_done(
            &outbox,
            &request_id,
            &format!("路径不允许: {workdir}"),
            1,
            &workdir,
        )
        .await;
        return;
    }

    let mut command = Command::new(login_shell());
    command
        .arg("-c")
        .arg(&req.command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if !workdir.is_empty() {
        command.current_dir(&workdir);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            send_exec_done(&outbox, &request_id, &format!("启动失败: {e}"), 1, &workdir).await;
            return;
        }
    };
    let Some(stdout) = child.stdout.take() else {
        send_exec_done(&outbox, &request_id, "stdout 管道失败", 1, &workdir).await;
        return;
    };
    let Some(stderr) = child.stderr.take() else {
        send_exec_done(&outbox, &request_id, "stderr 管道失败", 1, &workdir).await;
        return;
    };

    let pump = tokio::spawn(pump_stdout(stdout, outbox.clone(), request_id.clone()));
    let stderr_task = tokio::spawn(read_stderr_capped(stderr));

    let mut timed_out = false;
    let wait = tokio::select! {
        status = child.wait() => status,
        _ = tokio::time::sleep(deadline) => {
            timed_out = true;
            let _ = child.start_kill();
            child.wait().await
        }
        _ = cancel.cancelled() => {
            let _ = child.start_kill();
            child.wait().await
        }
    };

    let exit_code = if timed_out {
        EXIT_CODE_TIMEOUT
    } else {
        match wait {
            Ok(status) => status.code().unwrap_or(-1),
            Err(e) => {
                warn!("[执行] 等待进程失败: {e}");
                1
            }
        }
    };

    // stdout must be fully drained before the terminal message goes out
    let _ = pump.await;
    let stderr_bytes = stderr_task.await.unwrap_or_default();
    let stderr_text = String::from_utf8_lossy(&stderr_bytes).into_owned();

    let elapsed = start.elapsed().as_secs_f64();
    if timed_out {
        // Exit code 124 collides with a legal exit code; the deadline is the
        // distinguishing cause, so keep it in the log.
        warn!("[执行] 超时已终止 exit={EXIT_CODE_TIMEOUT} (限时 {timeout_ms}ms, 实际 {elapsed:.1}s)");
    } else if exit_code == 0 {
        info!("[执行] 完成 ({elapsed:.1}s)");
    } else {
        warn!("[执行] 失败 exit={exit_code} ({elapsed:.1}s)");
    }

    send_exec_done(&outbox, &request_id, &stderr_text, exit_code, &workdir).await;
}

/// Forward stdout line by line. Lines longer than the cap abandon the
/// stream; the remainder of the output is discarded.
async fn pump_stdout(stdout: ChildStdout, outbox: Outbox, request_id: String) {
    let mut reader = BufReader::with_capacity(LINE_BUFFER_INITIAL, stdout);
    let mut buf: Vec<u8> = Vec::with_capacity(256);
    loop {
        buf.clear();
        let mut limited = (&mut reader).take((LINE_BUFFER_MAX + 1) as u64);
        match limited.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if buf.len() > LINE_BUFFER_MAX {
                    warn!("[执行] 输出行超过 {LINE_BUFFER_MAX} 字节，停止流式转发");
                    break;
                }
                let mut line = String::from_utf8_lossy(&buf).into_owned();
                while line.ends_with('\n') || line.ends_with('\r') {
                    line.pop();
                }
                line.push('\n');
                let chunk = AgentEnvelope::reply(
                    &request_id,
                    AgentPayload::ExecOutput(ExecOutput {
                        stdout: line,
                        ..Default::default()
                    }),
                );
                if outbox.send(chunk).await.is_err() {
                    warn!("[执行] 发送 stdout 失败");
                    break;
                }
            }
            Err(e) => {
                warn!("[执行] 读取 stdout 失败: {e}");
                break;
            }
        }
    }
}

/// Collect stderr up to the cap; anything beyond is truncated.
async fn read_stderr_capped(stderr: ChildStderr) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut limited = stderr.take(STDERR_CAP as u64);
    if let Err(e) = limited.read_to_end(&mut buf).await {
        warn!("[执行] 读取 stderr 失败: {e}");
    }
    buf
}

/// Send the terminal message for an exec request.
async fn send_exec_done(
    outbox: &Outbox,
    request_id: &str,
    stderr: &str,
    exit_code: i32,
    workdir: &str,
) {
    let done = AgentEnvelope::reply(
        request_id,
        AgentPayload::ExecOutput(ExecOutput {
            stdout: String::new(),
            stderr: stderr.to_string(),
            exit_code,
            done: true,
            workdir: workdir.to_string(),
        }),
    );
    if outbox.send(done).await.is_err() {
        warn!("[执行] 发送结果失败");
    }
}
