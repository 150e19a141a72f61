//! Receive side of the upload pipeline: session bring-up with resume
//! detection, checksum-verified chunk writes, finalize, cancel.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use dock_core::chunk;
use dock_core::protocol::{UploadFinished, UploadInit, UploadProgress, UploadReady};
use dock_core::session::{SessionRegistry, ThroughputEstimator, UploadSession};
use dock_core::wire::ChunkFrame;

use crate::library::ShortcutLibrary;

#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    #[error("unknown session {0}")]
    UnknownSession(String),
    #[error("checksum mismatch in {rel_path} at offset {offset}")]
    ChecksumMismatch { rel_path: String, offset: u64 },
    #[error("path escapes the destination directory: {0}")]
    PathEscape(String),
    #[error("chunk for terminal session {0}")]
    SessionClosed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Owns the install root, the active-session registry, and per-session
/// throughput estimators. One instance per Agent process, shared across
/// connections behind an `Arc`.
pub struct UploadReceiver {
    install_root: PathBuf,
    registry: SessionRegistry,
    rates: Mutex<HashMap<String, ThroughputEstimator>>,
}

impl UploadReceiver {
    pub fn new(install_root: impl Into<PathBuf>) -> Self {
        Self {
            install_root: install_root.into(),
            registry: SessionRegistry::new(),
            rates: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Bring up a session from its manifest. Scans the destination for
    /// partial files left by a prior attempt and reports their lengths as
    /// resume offsets, so the sender skips bytes already on disk.
    pub async fn init(&self, init: UploadInit) -> Result<UploadReady, ReceiveError> {
        let dest = self.dest_dir(&init.config.dest_dir)?;
        tokio::fs::create_dir_all(&dest).await?;

        let mut resume = HashMap::new();
        for entry in &init.files {
            let path = resolve_under(&dest, &entry.rel_path)?;
            if let Ok(meta) = tokio::fs::metadata(&path).await {
                // A file longer than declared is from a different build of
                // the game; restart it from zero.
                let len = meta.len();
                if len > 0 && len <= entry.size {
                    resume.insert(entry.rel_path.clone(), len);
                }
            }
        }

        let chunk_size = if init.chunk_size == 0 {
            chunk::DEFAULT_CHUNK_SIZE
        } else {
            init.chunk_size
        };

        let mut session = UploadSession::new(
            init.session_id.clone(),
            init.config,
            init.files,
            init.total_bytes,
        );
        for (rel_path, &offset) in &resume {
            session.seed_resume(rel_path, offset);
        }
        self.registry.insert(session);
        self.rates
            .lock()
            .expect("rate map poisoned")
            .insert(init.session_id.clone(), ThroughputEstimator::new());

        tracing::info!(session = %init.session_id, resumed_files = resume.len(), "upload session ready");
        Ok(UploadReady {
            session_id: init.session_id,
            chunk_size,
            resume,
        })
    }

    /// Verify and apply one chunk. The checksum is checked before any byte
    /// touches the disk; a mismatch rejects the chunk and waits for a resend.
    pub async fn write_chunk(&self, frame: ChunkFrame) -> Result<(), ReceiveError> {
        let dest_dir = self
            .registry
            .with_session(&frame.session_id, |s| {
                if s.status().is_terminal() {
                    None
                } else {
                    Some(s.config.dest_dir.clone())
                }
            })
            .ok_or_else(|| ReceiveError::UnknownSession(frame.session_id.clone()))?
            .ok_or_else(|| ReceiveError::SessionClosed(frame.session_id.clone()))?;

        // A mismatch rejects only this chunk; the sender resends it and the
        // session stays live.
        if !chunk::verify(&frame.payload, &frame.checksum) {
            return Err(ReceiveError::ChecksumMismatch {
                rel_path: frame.rel_path,
                offset: frame.offset,
            });
        }

        let path = resolve_under(&self.dest_dir(&dest_dir)?, &frame.rel_path)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .await?;
        file.seek(std::io::SeekFrom::Start(frame.offset)).await?;
        file.write_all(&frame.payload).await?;

        let counted = self
            .registry
            .with_session(&frame.session_id, |s| {
                s.record_chunk(&frame.rel_path, frame.offset, frame.payload.len() as u64)
            })
            .unwrap_or(false);
        if counted {
            if let Some(est) = self
                .rates
                .lock()
                .expect("rate map poisoned")
                .get_mut(&frame.session_id)
            {
                est.record(frame.payload.len() as u64);
            }
        }
        Ok(())
    }

    /// Current progress of a session, or `None` for an unknown id.
    pub fn progress(&self, session_id: &str) -> Option<UploadProgress> {
        let snap = self.registry.snapshot(session_id)?;
        let rates = self.rates.lock().expect("rate map poisoned");
        let (bytes_per_sec, eta_secs) = rates
            .get(session_id)
            .map(|est| {
                let remaining = snap.total_bytes.saturating_sub(snap.transferred_bytes);
                (est.bytes_per_sec(), est.eta_secs(remaining))
            })
            .unwrap_or((0.0, 0));
        Some(UploadProgress {
            session_id: session_id.to_string(),
            transferred_bytes: snap.transferred_bytes,
            total_bytes: snap.total_bytes,
            bytes_per_sec,
            eta_secs,
        })
    }

    /// End of data: check completeness, then register the shortcut. Byte
    /// transfer and shortcut registration succeed or fail independently.
    pub async fn finalize(&self, session_id: &str, library: &ShortcutLibrary) -> UploadFinished {
        let snap = match self.registry.snapshot(session_id) {
            Some(s) => s,
            None => {
                return UploadFinished {
                    session_id: session_id.to_string(),
                    transfer_ok: false,
                    shortcut_ok: false,
                    app_id: None,
                    error: Some(format!("unknown session {session_id}")),
                }
            }
        };

        // A session fully covered by the resume scan never saw a chunk and is
        // still Pending; only terminal states disqualify a byte-complete one.
        let transfer_ok =
            !snap.status.is_terminal() && snap.transferred_bytes == snap.total_bytes;
        if !transfer_ok {
            let reason = format!(
                "incomplete transfer: {} of {} bytes",
                snap.transferred_bytes, snap.total_bytes
            );
            self.registry.with_session(session_id, |s| s.fail(&reason));
            self.drop_rate(session_id);
            return UploadFinished {
                session_id: session_id.to_string(),
                transfer_ok: false,
                shortcut_ok: false,
                app_id: None,
                error: Some(reason),
            };
        }

        let config = match self
            .registry
            .with_session(session_id, |s| s.config.clone())
        {
            Some(c) => c,
            None => {
                return UploadFinished {
                    session_id: session_id.to_string(),
                    transfer_ok: false,
                    shortcut_ok: false,
                    app_id: None,
                    error: Some(format!("unknown session {session_id}")),
                }
            }
        };
        let exe = self
            .install_root
            .join(&config.dest_dir)
            .join(&config.exe_rel_path);
        let start_dir = self.install_root.join(&config.dest_dir);
        let created = library.create(
            &config.game_name,
            &exe.to_string_lossy(),
            &start_dir.to_string_lossy(),
            &config.launch_options,
            &config.tags,
        );
        self.drop_rate(session_id);
        match created {
            Ok(app_id) => {
                self.registry.with_session(session_id, |s| s.complete());
                tracing::info!(session = %session_id, app_id, game = %config.game_name, "upload finalized");
                UploadFinished {
                    session_id: session_id.to_string(),
                    transfer_ok: true,
                    shortcut_ok: true,
                    app_id: Some(app_id),
                    error: None,
                }
            }
            Err(e) => {
                let reason = format!("shortcut registration failed: {e}");
                self.registry.with_session(session_id, |s| s.fail(&reason));
                tracing::warn!(session = %session_id, "{reason}");
                UploadFinished {
                    session_id: session_id.to_string(),
                    transfer_ok: true,
                    shortcut_ok: false,
                    app_id: None,
                    error: Some(reason),
                }
            }
        }
    }

    /// Abort a session. Bytes already written stay on disk so a later
    /// attempt can resume from them.
    pub fn cancel(&self, session_id: &str) -> Result<(), ReceiveError> {
        self.registry
            .with_session(session_id, |s| s.cancel())
            .ok_or_else(|| ReceiveError::UnknownSession(session_id.to_string()))?;
        self.drop_rate(session_id);
        tracing::info!(session = %session_id, "upload cancelled");
        Ok(())
    }

    fn drop_rate(&self, session_id: &str) {
        self.rates
            .lock()
            .expect("rate map poisoned")
            .remove(session_id);
    }

    fn dest_dir(&self, dest: &str) -> Result<PathBuf, ReceiveError> {
        resolve_under(&self.install_root, dest)
    }
}

/// Join an untrusted relative path onto `base`, rejecting anything that
/// could land outside it: absolute paths, drive prefixes, `..`.
pub fn resolve_under(base: &Path, rel: &str) -> Result<PathBuf, ReceiveError> {
    let rel_path = Path::new(rel);
    if rel.is_empty() {
        return Err(ReceiveError::PathEscape(rel.to_string()));
    }
    for component in rel_path.components() {
        match component {
            Component::Normal(_) => {}
            _ => return Err(ReceiveError::PathEscape(rel.to_string())),
        }
    }
    Ok(base.join(rel_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dock_core::protocol::{FileEntry, TransferConfig};
    use dock_core::session::SessionStatus;

    fn sample_init(session_id: &str, files: Vec<FileEntry>) -> UploadInit {
        let total = files.iter().map(|f| f.size).sum();
        UploadInit {
            session_id: session_id.into(),
            config: TransferConfig {
                game_name: "Celeste".into(),
                dest_dir: "celeste".into(),
                exe_rel_path: "Celeste.exe".into(),
                launch_options: String::new(),
                tags: vec![],
            },
            files,
            total_bytes: total,
            chunk_size: 0,
        }
    }

    fn frame(session_id: &str, rel_path: &str, offset: u64, payload: &[u8]) -> ChunkFrame {
        ChunkFrame {
            session_id: session_id.into(),
            rel_path: rel_path.into(),
            offset,
            checksum: chunk::checksum(payload),
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn sanitize_rejects_escapes() {
        let base = Path::new("/srv/games");
        assert!(resolve_under(base, "a/b.bin").is_ok());
        assert!(resolve_under(base, "../etc/passwd").is_err());
        assert!(resolve_under(base, "a/../../b").is_err());
        assert!(resolve_under(base, "/etc/passwd").is_err());
        assert!(resolve_under(base, "").is_err());
    }

    #[tokio::test]
    async fn full_upload_writes_files_and_registers_shortcut() {
        let dir = tempfile::tempdir().unwrap();
        let rx = UploadReceiver::new(dir.path().join("games"));
        let library = ShortcutLibrary::new(
            dir.path().join("shortcuts.vdf"),
            dir.path().join("grid"),
        );

        let payload = vec![9u8; 1000];
        let init = sample_init(
            "s1",
            vec![FileEntry {
                rel_path: "Celeste.exe".into(),
                size: 1000,
            }],
        );
        let ready = rx.init(init).await.unwrap();
        assert!(ready.resume.is_empty());

        rx.write_chunk(frame("s1", "Celeste.exe", 0, &payload))
            .await
            .unwrap();
        let fin = rx.finalize("s1", &library).await;
        assert!(fin.transfer_ok);
        assert!(fin.shortcut_ok);
        assert!(fin.app_id.is_some());

        let written =
            std::fs::read(dir.path().join("games").join("celeste").join("Celeste.exe")).unwrap();
        assert_eq!(written, payload);
        assert_eq!(library.list().0.len(), 1);
    }

    #[tokio::test]
    async fn corrupt_chunk_rejected_and_resend_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let rx = UploadReceiver::new(dir.path().join("games"));
        let library = ShortcutLibrary::new(
            dir.path().join("shortcuts.vdf"),
            dir.path().join("grid"),
        );
        rx.init(sample_init(
            "s1",
            vec![FileEntry {
                rel_path: "a.bin".into(),
                size: 10,
            }],
        ))
        .await
        .unwrap();

        let mut bad = frame("s1", "a.bin", 0, b"0123456789");
        bad.checksum[0] ^= 0xff;
        let err = rx.write_chunk(bad).await.unwrap_err();
        assert!(matches!(err, ReceiveError::ChecksumMismatch { .. }));
        // Nothing was written and the session is still live.
        assert!(!dir.path().join("games/celeste/a.bin").exists());
        let snap = rx.registry().snapshot("s1").unwrap();
        assert!(!snap.status.is_terminal());

        // The sender resends the same chunk intact and the session completes.
        rx.write_chunk(frame("s1", "a.bin", 0, b"0123456789"))
            .await
            .unwrap();
        let fin = rx.finalize("s1", &library).await;
        assert!(fin.transfer_ok);
        assert_eq!(
            std::fs::read(dir.path().join("games/celeste/a.bin")).unwrap(),
            b"0123456789"
        );
    }

    #[tokio::test]
    async fn fully_resumed_session_finalizes_without_new_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let rx = UploadReceiver::new(dir.path().join("games"));
        let library = ShortcutLibrary::new(
            dir.path().join("shortcuts.vdf"),
            dir.path().join("grid"),
        );
        // Every declared byte already landed during a prior attempt.
        let partial = dir.path().join("games").join("celeste");
        std::fs::create_dir_all(&partial).unwrap();
        std::fs::write(partial.join("Celeste.exe"), vec![7u8; 1000]).unwrap();

        let ready = rx
            .init(sample_init(
                "s6",
                vec![FileEntry {
                    rel_path: "Celeste.exe".into(),
                    size: 1000,
                }],
            ))
            .await
            .unwrap();
        assert_eq!(ready.resume.get("Celeste.exe"), Some(&1000));

        // The sender has nothing left to stream; finalize must still succeed.
        let fin = rx.finalize("s6", &library).await;
        assert!(fin.transfer_ok, "error: {:?}", fin.error);
        assert!(fin.shortcut_ok);
        assert_eq!(library.list().0.len(), 1);
    }

    #[tokio::test]
    async fn out_of_order_chunks_reassemble_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let rx = UploadReceiver::new(dir.path().join("games"));
        let library = ShortcutLibrary::new(
            dir.path().join("shortcuts.vdf"),
            dir.path().join("grid"),
        );
        let source: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        rx.init(sample_init(
            "s7",
            vec![FileEntry {
                rel_path: "Celeste.exe".into(),
                size: 1000,
            }],
        ))
        .await
        .unwrap();

        // 256-byte chunks delivered in scrambled offset order.
        for offset in [768u64, 0, 512, 256] {
            let end = (offset as usize + 256).min(source.len());
            rx.write_chunk(frame(
                "s7",
                "Celeste.exe",
                offset,
                &source[offset as usize..end],
            ))
            .await
            .unwrap();
        }

        let fin = rx.finalize("s7", &library).await;
        assert!(fin.transfer_ok);
        let written =
            std::fs::read(dir.path().join("games").join("celeste").join("Celeste.exe")).unwrap();
        assert_eq!(written, source);
    }

    #[tokio::test]
    async fn chunk_for_unknown_session_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let rx = UploadReceiver::new(dir.path());
        let err = rx
            .write_chunk(frame("nope", "a.bin", 0, b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ReceiveError::UnknownSession(_)));
    }

    #[tokio::test]
    async fn reinit_reports_resume_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let rx = UploadReceiver::new(dir.path().join("games"));
        // A prior attempt left 400 of 1000 bytes on disk.
        let partial = dir.path().join("games").join("celeste");
        std::fs::create_dir_all(&partial).unwrap();
        std::fs::write(partial.join("Celeste.exe"), vec![1u8; 400]).unwrap();

        let ready = rx
            .init(sample_init(
                "s2",
                vec![FileEntry {
                    rel_path: "Celeste.exe".into(),
                    size: 1000,
                }],
            ))
            .await
            .unwrap();
        assert_eq!(ready.resume.get("Celeste.exe"), Some(&400));

        // Sender resumes: one chunk for the tail completes the session.
        rx.write_chunk(frame("s2", "Celeste.exe", 400, &vec![2u8; 600]))
            .await
            .unwrap();
        assert_eq!(rx.progress("s2").unwrap().transferred_bytes, 1000);
    }

    #[tokio::test]
    async fn oversized_leftover_restarts_from_zero() {
        let dir = tempfile::tempdir().unwrap();
        let rx = UploadReceiver::new(dir.path().join("games"));
        let partial = dir.path().join("games").join("celeste");
        std::fs::create_dir_all(&partial).unwrap();
        std::fs::write(partial.join("Celeste.exe"), vec![1u8; 2000]).unwrap();

        let ready = rx
            .init(sample_init(
                "s3",
                vec![FileEntry {
                    rel_path: "Celeste.exe".into(),
                    size: 1000,
                }],
            ))
            .await
            .unwrap();
        assert!(ready.resume.is_empty());
    }

    #[tokio::test]
    async fn incomplete_finalize_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let rx = UploadReceiver::new(dir.path().join("games"));
        let library = ShortcutLibrary::new(
            dir.path().join("shortcuts.vdf"),
            dir.path().join("grid"),
        );
        rx.init(sample_init(
            "s4",
            vec![FileEntry {
                rel_path: "a.bin".into(),
                size: 1000,
            }],
        ))
        .await
        .unwrap();
        rx.write_chunk(frame("s4", "a.bin", 0, &vec![0u8; 500]))
            .await
            .unwrap();

        let fin = rx.finalize("s4", &library).await;
        assert!(!fin.transfer_ok);
        assert!(!fin.shortcut_ok);
        assert!(fin.error.is_some());
        assert!(library.list().0.is_empty());
    }

    #[tokio::test]
    async fn cancel_keeps_bytes_for_later_resume() {
        let dir = tempfile::tempdir().unwrap();
        let rx = UploadReceiver::new(dir.path().join("games"));
        rx.init(sample_init(
            "s5",
            vec![FileEntry {
                rel_path: "a.bin".into(),
                size: 1000,
            }],
        ))
        .await
        .unwrap();
        rx.write_chunk(frame("s5", "a.bin", 0, &vec![0u8; 500]))
            .await
            .unwrap();
        rx.cancel("s5").unwrap();
        assert_eq!(
            rx.registry().snapshot("s5").unwrap().status,
            SessionStatus::Cancelled
        );
        // Partial file stays for the next attempt's resume scan.
        let meta = std::fs::metadata(dir.path().join("games/celeste/a.bin")).unwrap();
        assert_eq!(meta.len(), 500);
    }
}
