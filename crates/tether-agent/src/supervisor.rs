//! Session supervisor: reconnect loop, panic containment, observable state.
//!
//! The supervisor owns the session lifecycle. Each attempt runs in its own
//! task so a panic is contained and surfaced as an error instead of taking
//! the process down. The browser bridge is owned here, outside the attempt
//! loop, so its local port is bound once and survives reconnects.

use std::any::Any;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use tether_core::config::Store;
use tether_core::constants::CONFIG_POLL_INTERVAL;
use tether_core::session::{format_uptime, Backoff, ConnectionState, Status};
use tether_core::Error;

use crate::browser::BrowserBridge;
use crate::cancel::CancelToken;
use crate::session::{run_session, SessionConfig};

/// Cloneable handle to the supervisor.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

struct SupervisorInner {
    store: Arc<Store>,
    state: Mutex<StateInner>,
    /// Serializes start/stop/restart so they never interleave.
    lifecycle: tokio::sync::Mutex<Lifecycle>,
}

struct StateInner {
    state: ConnectionState,
    last_error: String,
    reconnects: u32,
    connected_wall: Option<DateTime<Utc>>,
    connected_mono: Option<Instant>,
}

#[derive(Default)]
struct Lifecycle {
    cancel: Option<CancelToken>,
    task: Option<JoinHandle<()>>,
}

impl Supervisor {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                store,
                state: Mutex::new(StateInner {
                    state: ConnectionState::Stopped,
                    last_error: String::new(),
                    reconnects: 0,
                    connected_wall: None,
                    connected_mono: None,
                }),
                lifecycle: tokio::sync::Mutex::new(Lifecycle::default()),
            }),
        }
    }

    /// Start the reconnect loop. Idempotent: a running supervisor is left
    /// alone.
    pub async fn start(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        self.start_locked(&mut lifecycle);
    }

    /// Stop the loop and wait for it to wind down. Idempotent.
    pub async fn stop(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        Self::stop_locked(&mut lifecycle).await;
        self.inner.set_state(ConnectionState::Stopped);
    }

    /// Stop, then start with the current configuration.
    pub async fn restart(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        Self::stop_locked(&mut lifecycle).await;
        self.start_locked(&mut lifecycle);
    }

    fn start_locked(&self, lifecycle: &mut Lifecycle) {
        if lifecycle.cancel.is_some() {
            return;
        }
        {
            let mut state = self.inner.state.lock().expect("state lock poisoned");
            state.reconnects = 0;
            state.last_error.clear();
        }
        let cancel = CancelToken::new();
        let task = tokio::spawn(run_loop(self.inner.clone(), cancel.clone()));
        lifecycle.cancel = Some(cancel);
        lifecycle.task = Some(task);
    }

    async fn stop_locked(lifecycle: &mut Lifecycle) {
        if let Some(cancel) = lifecycle.cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = lifecycle.task.take() {
            let _ = task.await;
        }
    }

    /// Point-in-time snapshot; a value, never a live view.
    pub fn status(&self) -> Status {
        let cfg = self.inner.store.get();
        let state = self.inner.state.lock().expect("state lock poisoned");

        let mut status = Status {
            state: state.state,
            reconnects: state.reconnects,
            last_error: state.last_error.clone(),
            computer: cfg.computer.id,
            browser: cfg.browser.id,
            ..Default::default()
        };
        if state.state == ConnectionState::Connected {
            if let (Some(wall), Some(mono)) = (state.connected_wall, state.connected_mono) {
                status.connected_at = Some(wall);
                status.uptime = format_uptime(mono.elapsed());
            }
        }
        status
    }
}

impl SupervisorInner {
    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock().expect("state lock poisoned");
        state.state = next;
        if next != ConnectionState::Connected {
            state.connected_wall = None;
            state.connected_mono = None;
        }
    }

    fn mark_connected(&self) {
        let mut state = self.state.lock().expect("state lock poisoned");
        state.state = ConnectionState::Connected;
        state.connected_wall = Some(Utc::now());
        state.connected_mono = Some(Instant::now());
    }

    fn record_failure(&self, err: &Error) {
        let mut state = self.state.lock().expect("state lock poisoned");
        state.state = ConnectionState::Reconnecting;
        state.last_error = err.to_string();
        state.reconnects += 1;
        state.connected_wall = None;
        state.connected_mono = None;
    }
}

/// The reconnect loop. Runs until cancelled or a session exits cleanly.
async fn run_loop(inner: Arc<SupervisorInner>, cancel: CancelToken) {
    // The bridge outlives session attempts so the local port binds once.
    let mut bridge: Option<Arc<BrowserBridge>> = None;
    {
        let cfg = inner.store.get();
        if !cfg.browser.id.is_empty() {
            let candidate = Arc::new(BrowserBridge::new(
                cfg.browser.id.clone(),
                cfg.browser.description.clone(),
                cfg.browser.port,
            ));
            match candidate.start().await {
                Ok(()) => {
                    info!(
                        "[浏览器] SSE 服务已启动: port={}, id={}",
                        cfg.browser.port, cfg.browser.id
                    );
                    bridge = Some(candidate);
                }
                Err(e) => warn!("[浏览器] SSE 服务启动失败: {e}"),
            }
        }
    }

    let mut backoff = Backoff::new();

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let cfg = inner.store.get();
        if !cfg.is_configured() {
            inner.set_state(ConnectionState::Stopped);
            info!("[管理] 未配置 Hub 地址或 ID，等待配置...");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(CONFIG_POLL_INTERVAL) => {}
            }
            continue;
        }

        let session_cfg = SessionConfig::from_config(&cfg);
        inner.set_state(ConnectionState::Connecting);
        let attempt_start = Instant::now();

        let on_connected: Arc<dyn Fn() + Send + Sync> = {
            let inner = inner.clone();
            Arc::new(move || inner.mark_connected())
        };

        // The attempt runs in its own task: a panic becomes a JoinError
        // instead of unwinding through the loop.
        let attempt = tokio::spawn(run_session(
            session_cfg,
            bridge.clone(),
            cancel.clone(),
            on_connected,
        ));
        let result = match attempt.await {
            Ok(result) => result,
            Err(join_err) if join_err.is_panic() => {
                let message = panic_message(join_err.into_panic());
                warn!("[连接] panic 已恢复: {message}");
                Err(Error::internal(format!("panic: {message}")))
            }
            Err(_) => Ok(()),
        };

        let Err(err) = result else { break };
        if cancel.is_cancelled() {
            break;
        }

        let session_len = attempt_start.elapsed();
        inner.record_failure(&err);
        warn!("[连接] 断开: {err} (持续 {:.0}s)", session_len.as_secs_f64());

        let delay = backoff.delay_after(session_len);
        info!("[连接] {}s 后尝试重连...", delay.as_secs());
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    if let Some(bridge) = bridge {
        bridge.stop().await;
    }
    inner.set_state(ConnectionState::Stopped);
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tether_core::config::Config;

    fn unconfigured() -> Arc<Store> {
        Arc::new(Store::in_memory(Config::default()))
    }

    #[tokio::test]
    async fn stays_stopped_without_configuration() {
        let supervisor = Supervisor::new(unconfigured());
        supervisor.start().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let status = supervisor.status();
        assert_eq!(status.state, ConnectionState::Stopped);
        assert_eq!(status.reconnects, 0);

        supervisor.stop().await;
        assert_eq!(supervisor.status().state, ConnectionState::Stopped);
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let supervisor = Supervisor::new(unconfigured());
        supervisor.start().await;
        supervisor.start().await;
        supervisor.stop().await;
        supervisor.stop().await;
        supervisor.restart().await;
        supervisor.stop().await;
        assert_eq!(supervisor.status().state, ConnectionState::Stopped);
    }

    #[tokio::test]
    async fn status_is_a_snapshot() {
        let store = unconfigured();
        let supervisor = Supervisor::new(store.clone());

        let before = supervisor.status();
        let mut cfg = store.get();
        cfg.computer.id = "pc".into();
        store.update(cfg).unwrap();

        // The earlier snapshot is unaffected by the config change
        assert_eq!(before.computer, "");
        assert_eq!(supervisor.status().computer, "pc");
    }

    #[test]
    fn panic_message_downcasts() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new("boom".to_string())), "boom");
        assert_eq!(panic_message(Box::new(42_u32)), "unknown");
    }
}
