//! Send side of the upload pipeline: scan a game directory into a manifest,
//! then stream checksummed chunks, honoring the agent's resume offsets.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;

use dock_core::chunk::{self, plan_chunks};
use dock_core::protocol::{FileEntry, TransferConfig, UploadFinished, UploadInit};
use dock_core::session::ThroughputEstimator;
use dock_core::wire::ChunkFrame;

use crate::client::Uploader;

/// Everything needed to deploy one game: where the files are and what the
/// agent should make of them.
#[derive(Debug, Clone)]
pub struct DeployPlan {
    pub source_root: PathBuf,
    pub config: TransferConfig,
    pub files: Vec<FileEntry>,
    pub total_bytes: u64,
}

/// Walk a game directory into a manifest. Relative paths use `/` on every
/// platform; symlinks are skipped.
pub fn scan_dir(
    source_root: &Path,
    config: TransferConfig,
) -> Result<DeployPlan> {
    let mut files = Vec::new();
    collect_files(source_root, source_root, &mut files)
        .with_context(|| format!("failed to scan {}", source_root.display()))?;
    anyhow::ensure!(!files.is_empty(), "no files under {}", source_root.display());
    files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    anyhow::ensure!(
        files.iter().any(|f| f.rel_path == config.exe_rel_path),
        "executable {} not found in scanned files",
        config.exe_rel_path
    );
    let total_bytes = files.iter().map(|f| f.size).sum();
    Ok(DeployPlan {
        source_root: source_root.to_path_buf(),
        config,
        files,
        total_bytes,
    })
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<FileEntry>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let meta = std::fs::symlink_metadata(&path)?;
        if meta.file_type().is_symlink() {
            tracing::debug!(path = %path.display(), "skipping symlink");
            continue;
        }
        if meta.is_dir() {
            collect_files(root, &path, out)?;
        } else {
            let rel = path
                .strip_prefix(root)
                .map_err(|_| std::io::Error::other("path outside scan root"))?;
            let rel_path = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            out.push(FileEntry {
                rel_path,
                size: meta.len(),
            });
        }
    }
    Ok(())
}

/// Run one deployment against any [`Uploader`]. Streams every chunk the
/// agent does not already have, then finalizes. Cancellation aborts the
/// session on the agent before returning.
pub async fn deploy(
    uploader: &dyn Uploader,
    plan: &DeployPlan,
    cancel: &CancellationToken,
) -> Result<UploadFinished> {
    let session_id = uuid::Uuid::new_v4().to_string();
    let init = UploadInit {
        session_id: session_id.clone(),
        config: plan.config.clone(),
        files: plan.files.clone(),
        total_bytes: plan.total_bytes,
        chunk_size: chunk::DEFAULT_CHUNK_SIZE,
    };
    let ready = uploader.upload_init(&init).await.context("upload init failed")?;
    let chunk_size = if ready.chunk_size == 0 {
        chunk::DEFAULT_CHUNK_SIZE
    } else {
        ready.chunk_size
    };

    let resumed: u64 = ready.resume.values().sum();
    if resumed > 0 {
        tracing::info!(session = %session_id, resumed_bytes = resumed, "resuming prior transfer");
    }

    let mut estimator = ThroughputEstimator::new();
    let mut sent = resumed.min(plan.total_bytes);
    let mut since_report = 0u64;
    for file in &plan.files {
        let resume_offset = ready.resume.get(&file.rel_path).copied().unwrap_or(0);
        let chunks = plan_chunks(file.size, chunk_size, resume_offset);
        if chunks.is_empty() {
            continue;
        }
        let path = plan.source_root.join(Path::new(&file.rel_path));
        let mut handle = tokio::fs::File::open(&path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
        if resume_offset > 0 {
            handle
                .seek(std::io::SeekFrom::Start(resume_offset))
                .await?;
        }
        for spec in chunks {
            if cancel.is_cancelled() {
                tracing::info!(session = %session_id, "deploy cancelled");
                uploader.upload_cancel(&session_id).await?;
                anyhow::bail!("deployment cancelled");
            }
            let mut payload = vec![0u8; spec.len as usize];
            handle.read_exact(&mut payload).await.with_context(|| {
                format!("short read in {} at offset {}", file.rel_path, spec.offset)
            })?;
            let frame = ChunkFrame {
                session_id: session_id.clone(),
                rel_path: file.rel_path.clone(),
                offset: spec.offset,
                checksum: chunk::checksum(&payload),
                payload,
            };
            uploader.send_chunk(&frame).await?;
            estimator.record(spec.len);
            sent += spec.len;
            since_report += spec.len;
            if since_report >= 16 * chunk::DEFAULT_CHUNK_SIZE {
                since_report = 0;
                tracing::info!(
                    session = %session_id,
                    sent,
                    total = plan.total_bytes,
                    rate = format!("{:.0} B/s", estimator.bytes_per_sec()),
                    eta_secs = estimator.eta_secs(plan.total_bytes.saturating_sub(sent)),
                    "upload progress"
                );
            }
        }
    }

    let finished = uploader
        .upload_complete(&session_id)
        .await
        .context("finalize failed")?;
    if finished.transfer_ok && finished.shortcut_ok {
        tracing::info!(
            session = %session_id,
            app_id = finished.app_id,
            game = %plan.config.game_name,
            "deployment complete"
        );
    } else {
        tracing::warn!(
            session = %session_id,
            transfer_ok = finished.transfer_ok,
            shortcut_ok = finished.shortcut_ok,
            error = finished.error.as_deref().unwrap_or(""),
            "deployment did not fully succeed"
        );
    }
    Ok(finished)
}
