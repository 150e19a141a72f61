//! Connection to one agent: request/response correlation over a persistent
//! WebSocket, keepalive, and typed helpers for every operation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;

use dock_core::protocol::{
    self, ApplyArtwork, CreateShortcut, DeleteShortcut, Envelope, Hello, HelloAck, InfoResult,
    MessageKind, PairResult, PairSubmit, ShortcutCreated, ShortcutsList, UploadCancel,
    UploadComplete, UploadFinished, UploadInit, UploadReady,
};
use dock_core::wire::{encode_chunk_frame, ChunkFrame};

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Envelope>>>>;

/// A live connection to one agent. Cloneable; requests from multiple tasks
/// interleave on the single socket and are correlated by envelope id.
#[derive(Clone)]
pub struct AgentClient {
    tx: mpsc::Sender<Message>,
    pending: PendingMap,
    hello: HelloAck,
}

impl AgentClient {
    /// Dial an agent and run the hello handshake. Unsolicited envelopes
    /// (pairing prompts, progress, operation events) arrive on the returned
    /// receiver.
    pub async fn connect(
        addr: &str,
        hub_id: &str,
        hub_name: &str,
        token: Option<String>,
    ) -> Result<(Self, mpsc::Receiver<Envelope>)> {
        let url = format!("ws://{addr}");
        let (ws, _) = tokio::time::timeout(
            protocol::REQUEST_TIMEOUT,
            tokio_tungstenite::connect_async(url.as_str()),
        )
        .await
        .with_context(|| format!("timed out connecting to {addr}"))?
        .with_context(|| format!("failed to connect to {addr}"))?;
        let (mut sink, mut stream) = ws.split();

        let (tx, mut outgoing) = mpsc::channel::<Message>(64);
        tokio::spawn(async move {
            while let Some(msg) = outgoing.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (event_tx, event_rx) = mpsc::channel::<Envelope>(64);
        {
            let pending = Arc::clone(&pending);
            let tx = tx.clone();
            tokio::spawn(async move {
                while let Some(msg) = stream.next().await {
                    match msg {
                        Ok(Message::Text(text)) => {
                            let env = match Envelope::from_json(&text) {
                                Ok(e) => e,
                                Err(e) => {
                                    tracing::debug!("dropping malformed envelope: {e}");
                                    continue;
                                }
                            };
                            let waiter = pending
                                .lock()
                                .expect("pending map poisoned")
                                .remove(&env.id);
                            match waiter {
                                Some(reply_to) => {
                                    let _ = reply_to.send(env);
                                }
                                // Unsolicited: pairing prompt, progress,
                                // operation events, chunk errors.
                                None => {
                                    if event_tx.try_send(env).is_err() {
                                        tracing::debug!("event dropped: channel full");
                                    }
                                }
                            }
                        }
                        Ok(Message::Ping(data)) => {
                            let _ = tx.send(Message::Pong(data)).await;
                        }
                        Ok(Message::Close(_)) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
            });
        }

        let mut client = Self {
            tx,
            pending,
            hello: HelloAck {
                agent_id: String::new(),
                agent_name: String::new(),
                platform: String::new(),
                version: String::new(),
                paired: false,
            },
        };
        let hello = Envelope::request(
            MessageKind::Hello,
            &Hello {
                hub_id: hub_id.to_string(),
                hub_name: hub_name.to_string(),
                protocol_version: protocol::PROTOCOL_VERSION,
                token,
            },
        )?;
        let ack = client.request(hello).await.context("hello failed")?;
        client.hello = expect_payload(&ack, MessageKind::HelloAck)?;
        Ok((client, event_rx))
    }

    /// Handshake result: who we connected to and whether the token held.
    pub fn agent(&self) -> &HelloAck {
        &self.hello
    }

    pub fn paired(&self) -> bool {
        self.hello.paired
    }

    /// Send a request and await its correlated reply, bounded by the
    /// request timeout.
    pub async fn request(&self, env: Envelope) -> Result<Envelope> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending map poisoned")
            .insert(env.id.clone(), reply_tx);
        let json = env.to_json()?;
        if self.tx.send(Message::Text(json)).await.is_err() {
            self.pending
                .lock()
                .expect("pending map poisoned")
                .remove(&env.id);
            bail!("connection closed");
        }
        match tokio::time::timeout(protocol::REQUEST_TIMEOUT, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => bail!("connection closed before reply"),
            Err(_) => {
                self.pending
                    .lock()
                    .expect("pending map poisoned")
                    .remove(&env.id);
                bail!("request timed out after {:?}", protocol::REQUEST_TIMEOUT)
            }
        }
    }

    /// Send one chunk as a binary frame. No per-chunk acknowledgement; the
    /// agent pushes an error envelope keyed by session id on failure.
    pub async fn send_chunk(&self, frame: &ChunkFrame) -> Result<()> {
        let bytes = encode_chunk_frame(frame)?;
        self.tx
            .send(Message::Binary(bytes))
            .await
            .map_err(|_| anyhow::anyhow!("connection closed"))
    }

    /// Submit the pairing code read off the agent's screen. On success the
    /// returned token must be stored for future connections.
    pub async fn submit_pair_code(&mut self, code: &str) -> Result<PairResult> {
        let env = Envelope::request(
            MessageKind::PairSubmit,
            &PairSubmit {
                code: code.to_string(),
            },
        )?;
        let reply = self.request(env).await?;
        let result: PairResult = expect_payload(&reply, MessageKind::PairResult)?;
        if result.success {
            self.hello.paired = true;
        }
        Ok(result)
    }

    pub async fn info(&self) -> Result<InfoResult> {
        let reply = self.request(Envelope::request_empty(MessageKind::Info)).await?;
        expect_payload(&reply, MessageKind::InfoResult)
    }

    pub async fn upload_init(&self, init: &UploadInit) -> Result<UploadReady> {
        let reply = self
            .request(Envelope::request(MessageKind::UploadInit, init)?)
            .await?;
        expect_payload(&reply, MessageKind::UploadReady)
    }

    pub async fn upload_complete(&self, session_id: &str) -> Result<UploadFinished> {
        let reply = self
            .request(Envelope::request(
                MessageKind::UploadComplete,
                &UploadComplete {
                    session_id: session_id.to_string(),
                },
            )?)
            .await?;
        expect_payload(&reply, MessageKind::UploadFinished)
    }

    pub async fn upload_cancel(&self, session_id: &str) -> Result<()> {
        let reply = self
            .request(Envelope::request(
                MessageKind::UploadCancel,
                &UploadCancel {
                    session_id: session_id.to_string(),
                },
            )?)
            .await?;
        expect_kind(&reply, MessageKind::UploadCancelled)
    }
}

/// Deploys games: session bring-up, chunk streaming, finalize, cancel.
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload_init(&self, init: &UploadInit) -> Result<UploadReady>;
    async fn send_chunk(&self, frame: &ChunkFrame) -> Result<()>;
    async fn upload_complete(&self, session_id: &str) -> Result<UploadFinished>;
    async fn upload_cancel(&self, session_id: &str) -> Result<()>;
}

#[async_trait]
impl Uploader for AgentClient {
    async fn upload_init(&self, init: &UploadInit) -> Result<UploadReady> {
        AgentClient::upload_init(self, init).await
    }
    async fn send_chunk(&self, frame: &ChunkFrame) -> Result<()> {
        AgentClient::send_chunk(self, frame).await
    }
    async fn upload_complete(&self, session_id: &str) -> Result<UploadFinished> {
        AgentClient::upload_complete(self, session_id).await
    }
    async fn upload_cancel(&self, session_id: &str) -> Result<()> {
        AgentClient::upload_cancel(self, session_id).await
    }
}

/// Manages the remote shortcut library.
#[async_trait]
pub trait ShortcutManager: Send + Sync {
    async fn list_shortcuts(&self) -> Result<ShortcutsList>;
    async fn create_shortcut(&self, req: &CreateShortcut) -> Result<u32>;
    async fn delete_shortcut(&self, app_id: u32) -> Result<()>;
    async fn apply_artwork(&self, req: &ApplyArtwork) -> Result<()>;
}

#[async_trait]
impl ShortcutManager for AgentClient {
    async fn list_shortcuts(&self) -> Result<ShortcutsList> {
        let reply = self
            .request(Envelope::request_empty(MessageKind::ListShortcuts))
            .await?;
        expect_payload(&reply, MessageKind::ShortcutsList)
    }

    async fn create_shortcut(&self, req: &CreateShortcut) -> Result<u32> {
        let reply = self
            .request(Envelope::request(MessageKind::CreateShortcut, req)?)
            .await?;
        let created: ShortcutCreated = expect_payload(&reply, MessageKind::ShortcutCreated)?;
        Ok(created.app_id)
    }

    async fn delete_shortcut(&self, app_id: u32) -> Result<()> {
        let reply = self
            .request(Envelope::request(
                MessageKind::DeleteShortcut,
                &DeleteShortcut { app_id },
            )?)
            .await?;
        expect_kind(&reply, MessageKind::ShortcutDeleted)
    }

    async fn apply_artwork(&self, req: &ApplyArtwork) -> Result<()> {
        let reply = self
            .request(Envelope::request(MessageKind::ApplyArtwork, req)?)
            .await?;
        expect_kind(&reply, MessageKind::ArtworkApplied)
    }
}

fn expect_kind(reply: &Envelope, want: MessageKind) -> Result<()> {
    if let Some(err) = &reply.error {
        bail!("agent error [{}]: {}", err.code, err.message);
    }
    if reply.kind != want {
        bail!("unexpected reply kind {:?}, wanted {want:?}", reply.kind);
    }
    Ok(())
}

fn expect_payload<T: serde::de::DeserializeOwned>(reply: &Envelope, want: MessageKind) -> Result<T> {
    expect_kind(reply, want)?;
    reply
        .parse_payload()?
        .with_context(|| format!("{want:?} reply missing payload"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dock_core::protocol::code;

    #[test]
    fn error_reply_surfaces_code_and_message() {
        let reply = Envelope::error_reply("r1", code::NOT_FOUND, "no shortcut 7");
        let err = expect_kind(&reply, MessageKind::ShortcutDeleted).unwrap_err();
        let text = err.to_string();
        assert!(text.contains(code::NOT_FOUND));
        assert!(text.contains("no shortcut 7"));
    }

    #[test]
    fn wrong_kind_rejected() {
        let reply = Envelope::reply_empty("r1", MessageKind::UploadCancelled);
        assert!(expect_kind(&reply, MessageKind::ShortcutDeleted).is_err());
    }

    #[test]
    fn missing_payload_rejected() {
        let reply = Envelope::reply_empty("r1", MessageKind::InfoResult);
        let res: Result<InfoResult> = expect_payload(&reply, MessageKind::InfoResult);
        assert!(res.is_err());
    }
}
