//! One session attempt: stream wiring, registration, heartbeat, dispatch.
//!
//! A session owns a fresh transport, funnels every outbound message through
//! the single writer task, and runs two concurrent loops: the heartbeat
//! (PING every 3 s, trip on pong timeout) and the serial receive loop that
//! dispatches Hub requests to their handlers. Handlers run concurrently,
//! one task per request; their replies are serialized by the outbox.
//!
//! Heartbeat and dispatcher communicate through data (`last_pong`) in one
//! direction and control (the session cancel token) in the other.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{info, warn};

use tether_core::config::Config;
use tether_core::constants::{HEARTBEAT_INTERVAL, PONG_TIMEOUT};
use tether_core::now_ms;
use tether_core::protocol::{
    AgentEnvelope, AgentPayload, HubEnvelope, HubPayload, Ping, Registration,
};
use tether_core::{Error, Result};

use crate::browser::BrowserBridge;
use crate::cancel::CancelToken;
use crate::exec::{handle_exec, home_dir, login_shell, truncate};
use crate::fileops::{handle_edit_file, handle_read_file, handle_write_file};
use crate::tools::detect_tools;
use crate::transport::{self, Outbox};

/// Immutable per-session configuration, derived from the config store once
/// per attempt.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub hub_addr: String,
    pub computer_id: String,
    pub computer_desc: String,
    pub allowed_paths: Vec<String>,
    pub token: String,
}

impl SessionConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            hub_addr: cfg.agent.address.clone(),
            computer_id: cfg.computer.id.clone(),
            computer_desc: cfg.computer.description.clone(),
            allowed_paths: cfg.computer.allowed_paths.clone(),
            token: cfg.agent.token.clone(),
        }
    }

    /// The computer role is active when an identity is configured.
    pub fn computer_enabled(&self) -> bool {
        !self.computer_id.is_empty()
    }
}

/// Run one session from stream open to close.
///
/// Returns `Ok(())` only on clean shutdown; any stream, send, or liveness
/// failure is an `Err` carrying the distinguishing cause for the
/// supervisor's error surface.
pub async fn run_session(
    cfg: SessionConfig,
    bridge: Option<Arc<BrowserBridge>>,
    shutdown: CancelToken,
    on_connected: Arc<dyn Fn() + Send + Sync>,
) -> Result<()> {
    info!("[连接] 连接 Hub: {}", cfg.hub_addr);

    let (sink, mut receiver) = transport::connect(&cfg.hub_addr).await?;
    let session = CancelToken::new();
    let outbox = transport::spawn_writer(sink, session.clone());

    let registration = build_registration(&cfg).await;
    let (os, arch) = (registration.os.clone(), registration.arch.clone());
    outbox
        .send(AgentEnvelope::unsolicited(AgentPayload::Registration(
            registration,
        )))
        .await
        .map_err(|_| Error::transport("发送注册消息失败"))?;
    info!("[连接] 已注册: {} ({os}/{arch})", cfg.computer_id);

    let last_pong = Arc::new(Mutex::new(Instant::now()));
    let heartbeat_task = tokio::spawn(heartbeat(
        outbox.clone(),
        last_pong.clone(),
        session.clone(),
        shutdown.clone(),
    ));

    if let Some(bridge) = &bridge {
        bridge.set_outbox(Some(outbox.clone()));
    }

    let allowed_paths = Arc::new(cfg.allowed_paths.clone());
    let mut connected_seen = false;

    let result = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            _ = session.cancelled() => {
                break Err(session
                    .take_cause()
                    .unwrap_or_else(|| Error::transport("连接已取消")));
            }
            frame = receiver.recv(&outbox) => match frame {
                // A heartbeat trip surfaces here as a receive failure too;
                // prefer the recorded cause so the supervisor can tell
                // pong timeout from stream error.
                Err(e) => break Err(session.take_cause().unwrap_or(e)),
                Ok(None) => {
                    break Err(session
                        .take_cause()
                        .unwrap_or_else(|| Error::transport("连接已关闭")));
                }
                Ok(Some(text)) => {
                    if !connected_seen {
                        connected_seen = true;
                        on_connected();
                    }
                    dispatch(&text, &cfg, &outbox, &bridge, &allowed_paths, &last_pong, &session);
                }
            }
        }
    };

    if let Some(bridge) = &bridge {
        bridge.set_outbox(None);
    }
    heartbeat_task.abort();
    result
}

/// Route one inbound frame. Requests get their own task; replies funnel
/// through the outbox with the request's id.
fn dispatch(
    text: &str,
    cfg: &SessionConfig,
    outbox: &Outbox,
    bridge: &Option<Arc<BrowserBridge>>,
    allowed_paths: &Arc<Vec<String>>,
    last_pong: &Arc<Mutex<Instant>>,
    session: &CancelToken,
) {
    let envelope = match HubEnvelope::decode(text) {
        Ok(envelope) => envelope,
        Err(_) => {
            warn!("[连接] 未知消息类型: {}", truncate(text, 120));
            return;
        }
    };
    let request_id = envelope.request_id;

    match envelope.payload {
        HubPayload::Pong(_) => {
            *last_pong.lock().expect("pong lock poisoned") = Instant::now();
        }
        HubPayload::Exec(req) => {
            if !cfg.computer_enabled() {
                return;
            }
            tokio::spawn(handle_exec(
                outbox.clone(),
                request_id,
                req,
                allowed_paths.clone(),
                session.clone(),
            ));
        }
        HubPayload::ReadFile(req) => {
            if !cfg.computer_enabled() {
                return;
            }
            tokio::spawn(handle_read_file(
                outbox.clone(),
                request_id,
                req,
                allowed_paths.clone(),
            ));
        }
        HubPayload::WriteFile(req) => {
            if !cfg.computer_enabled() {
                return;
            }
            tokio::spawn(handle_write_file(
                outbox.clone(),
                request_id,
                req,
                allowed_paths.clone(),
            ));
        }
        HubPayload::EditFile(req) => {
            if !cfg.computer_enabled() {
                return;
            }
            tokio::spawn(handle_edit_file(
                outbox.clone(),
                request_id,
                req,
                allowed_paths.clone(),
            ));
        }
        HubPayload::BrowserExec(req) => {
            let Some(bridge) = bridge else { return };
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.handle_browser_exec(request_id, req).await });
        }
    }
}

/// Submit a PING every 3 s and trip the session when the last PONG is too
/// old or the send path is gone.
async fn heartbeat(
    outbox: Outbox,
    last_pong: Arc<Mutex<Instant>>,
    session: CancelToken,
    shutdown: CancelToken,
) {
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = session.cancelled() => return,
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {
                let ping = AgentEnvelope::unsolicited(AgentPayload::Ping(Ping {
                    timestamp: now_ms(),
                }));
                if let Err(e) = outbox.send(ping).await {
                    warn!("[心跳] 心跳发送失败: {e}");
                    session.cancel_with(Error::transport(format!("心跳发送失败: {e}")));
                    return;
                }

                let elapsed = last_pong.lock().expect("pong lock poisoned").elapsed();
                if elapsed > PONG_TIMEOUT {
                    let secs = elapsed.as_secs();
                    warn!("[心跳] Pong 超时 ({secs}s 未收到回应)，主动断连");
                    session.cancel_with(Error::Liveness {
                        message: format!("Pong 超时 ({secs}s)"),
                    });
                    return;
                }
            }
        }
    }
}

/// Registration payload: identity, platform facts, detected tools.
async fn build_registration(cfg: &SessionConfig) -> Registration {
    Registration {
        computer_id: cfg.computer_id.clone(),
        description: cfg.computer_desc.clone(),
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        shell: login_shell(),
        home_dir: home_dir(),
        tools: detect_tools().await,
        allowed_paths: cfg.allowed_paths.clone(),
        token: cfg.token.clone(),
    }
}
