//! WebSocket server: accept loop plus per-connection protocol dispatch.
//!
//! One task per connection. Text frames carry JSON envelopes, binary frames
//! carry chunk payloads. Everything except the hello/pairing exchange is
//! gated on a valid pairing token.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use dock_core::pairing::{self, PairingCode};
use dock_core::protocol::{
    self, code, ApplyArtwork, CreateShortcut, DeleteShortcut, Envelope, Hello, HelloAck,
    InfoResult, MessageKind, OperationEvent, PairRequired, PairResult, PairSubmit, ShortcutCreated,
    ShortcutsList, UploadCancel, UploadComplete, UploadInit,
};
use dock_core::trust::TrustStore;
use dock_core::wire::{decode_chunk_frame, FrameDecodeError};

use crate::config::Config;
use crate::library::{LibraryError, ShortcutLibrary};
use crate::receiver::{ReceiveError, UploadReceiver};

/// Everything a connection handler needs, shared across connections.
pub struct AgentState {
    pub agent_id: String,
    pub version: String,
    pub config: Config,
    pub trust: tokio::sync::Mutex<TrustStore>,
    /// Library mutations are serialized agent-wide: the database is a single
    /// file rewritten in place.
    pub library: tokio::sync::Mutex<ShortcutLibrary>,
    pub receiver: UploadReceiver,
}

/// Accept loop. Runs until cancelled; each connection gets its own task.
pub async fn run(
    state: Arc<AgentState>,
    listener: TcpListener,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("server shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted.context("accept failed")?;
                let state = Arc::clone(&state);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(state, stream, peer, cancel).await {
                        tracing::warn!(%peer, "connection ended with error: {e:#}");
                    }
                });
            }
        }
    }
}

async fn handle_connection(
    state: Arc<AgentState>,
    stream: TcpStream,
    peer: SocketAddr,
    cancel: CancellationToken,
) -> Result<()> {
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .context("websocket handshake failed")?;
    tracing::info!(%peer, "hub connected");
    let (mut sink, mut inbound) = ws.split();

    // Single writer task; dispatch and the progress ticker both feed it.
    let (tx, mut rx) = mpsc::channel::<Message>(64);
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut conn = Connection {
        state,
        tx: tx.clone(),
        peer,
        authed: false,
        hub_id: None,
        hub_name: String::new(),
        pending_code: None,
        sessions: Arc::new(Mutex::new(HashSet::new())),
    };

    let mut ping_timer = tokio::time::interval(protocol::PING_INTERVAL);
    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut progress_timer = tokio::time::interval(std::time::Duration::from_secs(1));
    progress_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The pong deadline is shorter than the ping interval, so a dead peer is
    // caught before the next ping is due.
    let mut keepalive = PongTracker::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ping_timer.tick() => {
                if tx.send(Message::Ping(vec![])).await.is_err() {
                    break;
                }
                keepalive.ping_sent(tokio::time::Instant::now());
            }
            _ = tokio::time::sleep_until(keepalive.deadline().unwrap_or_else(tokio::time::Instant::now)),
                if keepalive.deadline().is_some() =>
            {
                tracing::warn!(%peer, "no pong within deadline, closing");
                break;
            }
            _ = progress_timer.tick() => {
                conn.emit_progress().await;
            }
            msg = inbound.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        tracing::debug!(%peer, "read error: {e}");
                        break;
                    }
                    None => break,
                };
                match msg {
                    Message::Text(text) => conn.on_text(&text).await?,
                    Message::Binary(bytes) => conn.on_binary(&bytes).await?,
                    Message::Pong(_) => keepalive.pong_received(),
                    Message::Ping(data) => {
                        let _ = tx.send(Message::Pong(data)).await;
                    }
                    Message::Close(_) => break,
                    Message::Frame(_) => {}
                }
            }
        }
    }

    drop(conn);
    drop(tx);
    let _ = writer.await;
    tracing::info!(%peer, "hub disconnected");
    Ok(())
}

/// Outstanding-keepalive state for one connection: armed when a ping goes
/// out, cleared by the matching pong.
struct PongTracker {
    deadline: Option<tokio::time::Instant>,
}

impl PongTracker {
    fn new() -> Self {
        Self { deadline: None }
    }

    fn ping_sent(&mut self, now: tokio::time::Instant) {
        self.deadline = Some(now + protocol::PONG_DEADLINE);
    }

    fn pong_received(&mut self) {
        self.deadline = None;
    }

    fn deadline(&self) -> Option<tokio::time::Instant> {
        self.deadline
    }
}

struct Connection {
    state: Arc<AgentState>,
    tx: mpsc::Sender<Message>,
    peer: SocketAddr,
    authed: bool,
    hub_id: Option<String>,
    hub_name: String,
    pending_code: Option<PairingCode>,
    /// Sessions this connection initiated; drives the progress ticker.
    sessions: Arc<Mutex<HashSet<String>>>,
}

impl Connection {
    async fn send(&self, env: Envelope) -> Result<()> {
        let json = env.to_json()?;
        self.tx
            .send(Message::Text(json))
            .await
            .context("writer gone")?;
        Ok(())
    }

    async fn send_error(&self, request_id: &str, code: &str, message: impl Into<String>) -> Result<()> {
        self.send(Envelope::error_reply(request_id, code, message)).await
    }

    async fn on_text(&mut self, text: &str) -> Result<()> {
        let env = match Envelope::from_json(text) {
            Ok(e) => e,
            Err(e) => {
                tracing::debug!(peer = %self.peer, "malformed envelope: {e}");
                return self.send_error("", code::MALFORMED, e.to_string()).await;
            }
        };
        match env.kind {
            MessageKind::Hello => self.on_hello(&env).await,
            MessageKind::PairSubmit => self.on_pair_submit(&env).await,
            _ if !self.authed => {
                self.send_error(&env.id, code::PAIRING_REQUIRED, "not paired").await
            }
            MessageKind::Info => self.on_info(&env).await,
            MessageKind::ListShortcuts => self.on_list_shortcuts(&env).await,
            MessageKind::CreateShortcut => self.on_create_shortcut(&env).await,
            MessageKind::DeleteShortcut => self.on_delete_shortcut(&env).await,
            MessageKind::ApplyArtwork => self.on_apply_artwork(&env).await,
            MessageKind::UploadInit => self.on_upload_init(&env).await,
            MessageKind::UploadComplete => self.on_upload_complete(&env).await,
            MessageKind::UploadCancel => self.on_upload_cancel(&env).await,
            other => {
                self.send_error(&env.id, code::UNKNOWN_MESSAGE, format!("unexpected {other:?}"))
                    .await
            }
        }
    }

    async fn on_hello(&mut self, env: &Envelope) -> Result<()> {
        let hello: Hello = match env.parse_payload() {
            Ok(Some(h)) => h,
            _ => return self.send_error(&env.id, code::MALFORMED, "hello payload required").await,
        };
        if hello.protocol_version != protocol::PROTOCOL_VERSION {
            return self
                .send_error(
                    &env.id,
                    code::MALFORMED,
                    format!("unsupported protocol version {}", hello.protocol_version),
                )
                .await;
        }

        let token_ok = match &hello.token {
            Some(token) => {
                let mut trust = self.state.trust.lock().await;
                let ok = trust.token_matches(&hello.hub_id, token);
                if ok {
                    if let Err(e) = trust.touch_last_seen(&hello.hub_id) {
                        tracing::warn!("failed to update trust store: {e}");
                    }
                }
                ok
            }
            None => false,
        };

        if !token_ok && !self.state.config.accept_connections {
            tracing::info!(hub = %hello.hub_id, "rejecting unpaired hub: not accepting connections");
            return self
                .send_error(&env.id, code::UNAUTHORIZED, "agent is not accepting new connections")
                .await;
        }

        self.hub_id = Some(hello.hub_id.clone());
        self.hub_name = hello.hub_name.clone();
        self.authed = token_ok;
        self.send(Envelope::reply(
            &env.id,
            MessageKind::HelloAck,
            &HelloAck {
                agent_id: self.state.agent_id.clone(),
                agent_name: self.state.config.name.clone(),
                platform: std::env::consts::OS.to_string(),
                version: self.state.version.clone(),
                paired: token_ok,
            },
        )?)
        .await?;

        if !token_ok {
            let pairing = PairingCode::generate(pairing::DEFAULT_CODE_TTL);
            // Shown on the Agent side; the person at the device reads it to
            // the Hub operator.
            tracing::info!(hub = %hello.hub_name, code = %pairing.code(), "pairing code issued");
            let event = Envelope::event(
                MessageKind::PairRequired,
                &PairRequired {
                    expires_in_secs: pairing.expires_in().as_secs(),
                },
            )?;
            self.pending_code = Some(pairing);
            self.send(event).await?;
        }
        Ok(())
    }

    async fn on_pair_submit(&mut self, env: &Envelope) -> Result<()> {
        let submit: PairSubmit = match env.parse_payload() {
            Ok(Some(s)) => s,
            _ => return self.send_error(&env.id, code::MALFORMED, "pair payload required").await,
        };
        let hub_id = match self.hub_id.clone() {
            Some(id) => id,
            None => return self.send_error(&env.id, code::MALFORMED, "hello first").await,
        };
        // One attempt per code: taking it out consumes it either way.
        let result = match self.pending_code.take() {
            Some(pending) => pending.verify(&submit.code),
            None => return self.send_error(&env.id, code::PAIR_FAILED, "no pairing in progress").await,
        };
        match result {
            Ok(()) => {
                let token = pairing::issue_token();
                {
                    let mut trust = self.state.trust.lock().await;
                    trust
                        .authorize(&hub_id, &self.hub_name, &token)
                        .context("failed to persist pairing")?;
                }
                self.authed = true;
                tracing::info!(hub = %hub_id, "hub paired");
                self.send(Envelope::reply(
                    &env.id,
                    MessageKind::PairResult,
                    &PairResult {
                        success: true,
                        token: Some(token),
                        reason: None,
                    },
                )?)
                .await
            }
            Err(failure) => {
                tracing::info!(hub = %hub_id, "pairing rejected: {failure}");
                self.send(Envelope::reply(
                    &env.id,
                    MessageKind::PairResult,
                    &PairResult {
                        success: false,
                        token: None,
                        reason: Some(failure.to_string()),
                    },
                )?)
                .await
            }
        }
    }

    async fn on_info(&self, env: &Envelope) -> Result<()> {
        self.send(Envelope::reply(
            &env.id,
            MessageKind::InfoResult,
            &InfoResult {
                id: self.state.agent_id.clone(),
                name: self.state.config.name.clone(),
                platform: std::env::consts::OS.to_string(),
                version: self.state.version.clone(),
                accept_connections: self.state.config.accept_connections,
            },
        )?)
        .await
    }

    async fn on_list_shortcuts(&self, env: &Envelope) -> Result<()> {
        let (shortcuts, warning) = self.state.library.lock().await.list();
        if let Some(w) = &warning {
            tracing::warn!("{w}");
        }
        self.send(Envelope::reply(
            &env.id,
            MessageKind::ShortcutsList,
            &ShortcutsList { shortcuts, warning },
        )?)
        .await
    }

    async fn on_create_shortcut(&self, env: &Envelope) -> Result<()> {
        let req: CreateShortcut = match env.parse_payload() {
            Ok(Some(r)) => r,
            _ => return self.send_error(&env.id, code::MALFORMED, "shortcut payload required").await,
        };
        let created = self.state.library.lock().await.create(
            &req.name,
            &req.exe,
            &req.start_dir,
            &req.launch_options,
            &req.tags,
        );
        match created {
            Ok(app_id) => {
                tracing::info!(app_id, name = %req.name, "shortcut created");
                self.send(Envelope::reply(
                    &env.id,
                    MessageKind::ShortcutCreated,
                    &ShortcutCreated { app_id },
                )?)
                .await
            }
            Err(e) => self.send_error(&env.id, code::LIBRARY, e.to_string()).await,
        }
    }

    async fn on_delete_shortcut(&self, env: &Envelope) -> Result<()> {
        let req: DeleteShortcut = match env.parse_payload() {
            Ok(Some(r)) => r,
            _ => return self.send_error(&env.id, code::MALFORMED, "app id required").await,
        };
        match self.state.library.lock().await.delete(req.app_id) {
            Ok(()) => {
                tracing::info!(app_id = req.app_id, "shortcut deleted");
                self.send(Envelope::reply_empty(&env.id, MessageKind::ShortcutDeleted))
                    .await
            }
            Err(LibraryError::NotFound(id)) => {
                self.send_error(&env.id, code::NOT_FOUND, format!("no shortcut {id}")).await
            }
            Err(e) => self.send_error(&env.id, code::LIBRARY, e.to_string()).await,
        }
    }

    async fn on_apply_artwork(&self, env: &Envelope) -> Result<()> {
        let req: ApplyArtwork = match env.parse_payload() {
            Ok(Some(r)) => r,
            _ => return self.send_error(&env.id, code::MALFORMED, "artwork payload required").await,
        };
        // The image was transferred like any other file; resolve it under
        // the install root the same way chunk writes do.
        let source = match crate::receiver::resolve_under(
            &self.state.config.install_dir,
            &req.rel_path,
        ) {
            Ok(p) => p,
            Err(e) => return self.send_error(&env.id, code::MALFORMED, e.to_string()).await,
        };
        let applied = self
            .state
            .library
            .lock()
            .await
            .apply_artwork(req.app_id, &req.slot, &source);
        match applied {
            Ok(dest) => {
                tracing::info!(app_id = req.app_id, slot = %req.slot, dest = %dest.display(), "artwork applied");
                self.send(Envelope::reply_empty(&env.id, MessageKind::ArtworkApplied))
                    .await
            }
            Err(e) => self.send_error(&env.id, code::LIBRARY, e.to_string()).await,
        }
    }

    async fn on_upload_init(&self, env: &Envelope) -> Result<()> {
        let init: UploadInit = match env.parse_payload() {
            Ok(Some(i)) => i,
            _ => return self.send_error(&env.id, code::MALFORMED, "upload manifest required").await,
        };
        let session_id = init.session_id.clone();
        let game_name = init.config.game_name.clone();
        match self.state.receiver.init(init).await {
            Ok(ready) => {
                self.sessions
                    .lock()
                    .expect("session set poisoned")
                    .insert(session_id.clone());
                self.send(Envelope::reply(&env.id, MessageKind::UploadReady, &ready)?)
                    .await?;
                self.send(Envelope::event(
                    MessageKind::OperationEvent,
                    &OperationEvent {
                        event_type: "upload".into(),
                        status: "started".into(),
                        game_name,
                        progress: 0.0,
                        message: String::new(),
                    },
                )?)
                .await
            }
            Err(e) => self.send_error(&env.id, code::IO, e.to_string()).await,
        }
    }

    /// Binary frames have no request id; errors are correlated by session.
    async fn on_binary(&self, bytes: &[u8]) -> Result<()> {
        if !self.authed {
            return self.send_error("", code::PAIRING_REQUIRED, "not paired").await;
        }
        let frame = match decode_chunk_frame(bytes) {
            Ok((frame, _)) => frame,
            Err(FrameDecodeError::TooLarge) => {
                return self.send_error("", code::MALFORMED, "chunk frame too large").await
            }
            Err(e) => return self.send_error("", code::MALFORMED, e.to_string()).await,
        };
        let session_id = frame.session_id.clone();
        if let Err(e) = self.state.receiver.write_chunk(frame).await {
            let code = match &e {
                ReceiveError::ChecksumMismatch { .. } => code::CHECKSUM_MISMATCH,
                ReceiveError::UnknownSession(_) | ReceiveError::SessionClosed(_) => {
                    code::UNKNOWN_SESSION
                }
                ReceiveError::PathEscape(_) => code::MALFORMED,
                ReceiveError::Io(_) => code::IO,
            };
            tracing::warn!(session = %session_id, "chunk rejected: {e}");
            return self.send_error(&session_id, code, e.to_string()).await;
        }
        Ok(())
    }

    async fn on_upload_complete(&self, env: &Envelope) -> Result<()> {
        let req: UploadComplete = match env.parse_payload() {
            Ok(Some(r)) => r,
            _ => return self.send_error(&env.id, code::MALFORMED, "session id required").await,
        };
        let library = self.state.library.lock().await;
        let finished = self.state.receiver.finalize(&req.session_id, &library).await;
        drop(library);
        self.sessions
            .lock()
            .expect("session set poisoned")
            .remove(&req.session_id);
        let game_name = self
            .state
            .receiver
            .registry()
            .snapshot(&req.session_id)
            .map(|s| s.game_name)
            .unwrap_or_default();
        let event = OperationEvent {
            event_type: "upload".into(),
            status: if finished.transfer_ok && finished.shortcut_ok {
                "completed".into()
            } else {
                "failed".into()
            },
            game_name,
            progress: 1.0,
            message: finished.error.clone().unwrap_or_default(),
        };
        self.send(Envelope::reply(&env.id, MessageKind::UploadFinished, &finished)?)
            .await?;
        self.send(Envelope::event(MessageKind::OperationEvent, &event)?)
            .await?;
        // Terminal either way; drop it from the active registry.
        self.state.receiver.registry().remove(&req.session_id);
        Ok(())
    }

    async fn on_upload_cancel(&self, env: &Envelope) -> Result<()> {
        let req: UploadCancel = match env.parse_payload() {
            Ok(Some(r)) => r,
            _ => return self.send_error(&env.id, code::MALFORMED, "session id required").await,
        };
        self.sessions
            .lock()
            .expect("session set poisoned")
            .remove(&req.session_id);
        match self.state.receiver.cancel(&req.session_id) {
            Ok(()) => {
                self.send(Envelope::reply_empty(&env.id, MessageKind::UploadCancelled))
                    .await?;
                self.state.receiver.registry().remove(&req.session_id);
                Ok(())
            }
            Err(e) => self.send_error(&env.id, code::UNKNOWN_SESSION, e.to_string()).await,
        }
    }

    /// Periodic progress events for every live session on this connection.
    async fn emit_progress(&self) {
        let ids: Vec<String> = {
            let set = self.sessions.lock().expect("session set poisoned");
            set.iter().cloned().collect()
        };
        for id in ids {
            let Some(progress) = self.state.receiver.progress(&id) else {
                self.sessions.lock().expect("session set poisoned").remove(&id);
                continue;
            };
            match self
                .state
                .receiver
                .registry()
                .snapshot(&id)
                .map(|s| s.status.is_terminal())
            {
                Some(true) | None => {
                    self.sessions.lock().expect("session set poisoned").remove(&id);
                    continue;
                }
                Some(false) => {}
            }
            if let Ok(env) = Envelope::event(MessageKind::UploadProgress, &progress) {
                if let Ok(json) = env.to_json() {
                    let _ = self.tx.send(Message::Text(json)).await;
                }
            }
        }
    }
}
