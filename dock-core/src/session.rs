//! Upload sessions: per-transfer state machine, guarded registry, and
//! throughput estimation.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::{FileEntry, TransferConfig};

/// Session lifecycle. `Pending -> InProgress -> {Completed|Failed|Cancelled}`;
/// terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }
}

/// State of one upload session. Mutated by every chunk write; terminal once
/// completed, failed, or cancelled.
#[derive(Debug)]
pub struct UploadSession {
    pub id: String,
    pub config: TransferConfig,
    pub files: Vec<FileEntry>,
    pub total_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    status: SessionStatus,
    transferred_bytes: u64,
    /// Offsets already counted per file, so a retried chunk is never counted
    /// twice.
    applied: HashMap<String, HashSet<u64>>,
    /// Per-file resume base: chunks below this offset were written by a prior
    /// attempt and are never re-sent or re-counted.
    resume_base: HashMap<String, u64>,
    /// Retained after failure so late pollers can still see why.
    error: Option<String>,
}

impl UploadSession {
    pub fn new(
        id: impl Into<String>,
        config: TransferConfig,
        files: Vec<FileEntry>,
        total_bytes: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            config,
            files,
            total_bytes,
            created_at: now,
            updated_at: now,
            status: SessionStatus::Pending,
            transferred_bytes: 0,
            applied: HashMap::new(),
            resume_base: HashMap::new(),
            error: None,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn transferred_bytes(&self) -> u64 {
        self.transferred_bytes
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Credit bytes already on disk from a prior attempt and remember the
    /// resume base for the file.
    pub fn seed_resume(&mut self, rel_path: &str, offset: u64) {
        if offset == 0 {
            return;
        }
        self.resume_base.insert(rel_path.to_string(), offset);
        self.transferred_bytes = (self.transferred_bytes + offset).min(self.total_bytes);
        self.updated_at = Utc::now();
    }

    /// Record one applied chunk. Moves `Pending -> InProgress` on the first
    /// byte. Returns `false` if the chunk was already counted (duplicate
    /// delivery or a pre-resume offset) or the session is terminal.
    pub fn record_chunk(&mut self, rel_path: &str, offset: u64, len: u64) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        if let Some(&base) = self.resume_base.get(rel_path) {
            if offset < base {
                return false;
            }
        }
        let offsets = self.applied.entry(rel_path.to_string()).or_default();
        if !offsets.insert(offset) {
            return false;
        }
        if self.status == SessionStatus::Pending {
            self.status = SessionStatus::InProgress;
        }
        // Invariant: the counter only grows and never exceeds the declared
        // total.
        self.transferred_bytes = (self.transferred_bytes + len).min(self.total_bytes);
        self.updated_at = Utc::now();
        true
    }

    /// Normal end-of-data with a successful finalize. No-op if terminal.
    pub fn complete(&mut self) -> bool {
        self.transition(SessionStatus::Completed)
    }

    /// Unrecoverable error; the reason string is retained on the session.
    pub fn fail(&mut self, reason: impl Into<String>) -> bool {
        if self.transition(SessionStatus::Failed) {
            self.error = Some(reason.into());
            true
        } else {
            false
        }
    }

    /// Explicit abort by either side.
    pub fn cancel(&mut self) -> bool {
        self.transition(SessionStatus::Cancelled)
    }

    fn transition(&mut self, to: SessionStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = to;
        self.updated_at = Utc::now();
        true
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            game_name: self.config.game_name.clone(),
            status: self.status,
            transferred_bytes: self.transferred_bytes,
            total_bytes: self.total_bytes,
            error: self.error.clone(),
        }
    }
}

/// Point-in-time view of a session for status queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub id: String,
    pub game_name: String,
    pub status: SessionStatus,
    pub transferred_bytes: u64,
    pub total_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Active-session registry: one struct owning the map and its lock,
/// constructed once and passed by reference. Lock scope is the map
/// operation itself, never I/O.
#[derive(Default)]
pub struct SessionRegistry {
    inner: RwLock<HashMap<String, UploadSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: UploadSession) {
        let mut map = self.inner.write().expect("session registry poisoned");
        map.insert(session.id.clone(), session);
    }

    /// Run `f` against a session under the write lock. `None` if the id is
    /// unknown.
    pub fn with_session<R>(&self, id: &str, f: impl FnOnce(&mut UploadSession) -> R) -> Option<R> {
        let mut map = self.inner.write().expect("session registry poisoned");
        map.get_mut(id).map(f)
    }

    pub fn snapshot(&self, id: &str) -> Option<SessionSnapshot> {
        let map = self.inner.read().expect("session registry poisoned");
        map.get(id).map(|s| s.snapshot())
    }

    pub fn list(&self) -> Vec<SessionSnapshot> {
        let map = self.inner.read().expect("session registry poisoned");
        map.values().map(|s| s.snapshot()).collect()
    }

    /// Remove a terminal session from the active registry.
    pub fn remove(&self, id: &str) -> Option<UploadSession> {
        let mut map = self.inner.write().expect("session registry poisoned");
        map.remove(id)
    }
}

/// Sliding-window throughput estimator. Samples are cumulative byte counts;
/// old samples are pruned by age and the list is capped, so memory stays
/// bounded however long a transfer runs.
pub struct ThroughputEstimator {
    samples: VecDeque<(Instant, u64)>,
    cumulative: u64,
    window: Duration,
    max_samples: usize,
}

impl ThroughputEstimator {
    pub const DEFAULT_WINDOW: Duration = Duration::from_secs(10);
    pub const DEFAULT_MAX_SAMPLES: usize = 256;

    pub fn new() -> Self {
        Self::with_limits(Self::DEFAULT_WINDOW, Self::DEFAULT_MAX_SAMPLES)
    }

    pub fn with_limits(window: Duration, max_samples: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            cumulative: 0,
            window,
            max_samples: max_samples.max(2),
        }
    }

    /// Record a byte delta (one applied chunk).
    pub fn record(&mut self, bytes: u64) {
        self.record_at(Instant::now(), bytes);
    }

    fn record_at(&mut self, now: Instant, bytes: u64) {
        self.cumulative += bytes;
        self.samples.push_back((now, self.cumulative));
        while self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
        while let Some(&(t, _)) = self.samples.front() {
            if now.duration_since(t) > self.window && self.samples.len() > 2 {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Bytes/second over the earliest-to-latest sample span. Zero with fewer
    /// than two samples.
    pub fn bytes_per_sec(&self) -> f64 {
        let (first, last) = match (self.samples.front(), self.samples.back()) {
            (Some(f), Some(l)) if f.0 < l.0 => (f, l),
            _ => return 0.0,
        };
        let span = last.0.duration_since(first.0).as_secs_f64();
        if span <= 0.0 {
            return 0.0;
        }
        (last.1 - first.1) as f64 / span
    }

    /// Remaining-bytes ETA. Zero when throughput is zero or there are no
    /// samples yet; never an error, never infinity.
    pub fn eta_secs(&self, remaining_bytes: u64) -> u64 {
        let rate = self.bytes_per_sec();
        if rate <= 0.0 || remaining_bytes == 0 {
            return 0;
        }
        (remaining_bytes as f64 / rate).ceil() as u64
    }
}

impl Default for ThroughputEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_session(total: u64) -> UploadSession {
        UploadSession::new(
            "s1",
            TransferConfig {
                game_name: "Hollow Knight".into(),
                dest_dir: "hollow-knight".into(),
                exe_rel_path: "hk.x86_64".into(),
                launch_options: String::new(),
                tags: vec![],
            },
            vec![FileEntry {
                rel_path: "hk.x86_64".into(),
                size: total,
            }],
            total,
        )
    }

    #[test]
    fn first_chunk_moves_pending_to_in_progress() {
        let mut s = sample_session(100);
        assert_eq!(s.status(), SessionStatus::Pending);
        assert!(s.record_chunk("hk.x86_64", 0, 50));
        assert_eq!(s.status(), SessionStatus::InProgress);
        assert_eq!(s.transferred_bytes(), 50);
    }

    #[test]
    fn duplicate_chunk_not_double_counted() {
        let mut s = sample_session(100);
        assert!(s.record_chunk("hk.x86_64", 0, 50));
        assert!(!s.record_chunk("hk.x86_64", 0, 50));
        assert_eq!(s.transferred_bytes(), 50);
    }

    #[test]
    fn counter_never_exceeds_total() {
        let mut s = sample_session(100);
        s.record_chunk("hk.x86_64", 0, 80);
        s.record_chunk("hk.x86_64", 80, 80);
        assert_eq!(s.transferred_bytes(), 100);
    }

    #[test]
    fn terminal_states_are_final() {
        let mut s = sample_session(100);
        s.record_chunk("hk.x86_64", 0, 100);
        assert!(s.complete());
        assert!(!s.fail("too late"));
        assert!(!s.cancel());
        assert_eq!(s.status(), SessionStatus::Completed);
        assert!(s.error().is_none());
    }

    #[test]
    fn failure_reason_retained() {
        let mut s = sample_session(100);
        s.record_chunk("hk.x86_64", 0, 10);
        assert!(s.fail("disk full at offset 10"));
        assert_eq!(s.status(), SessionStatus::Failed);
        assert_eq!(s.error(), Some("disk full at offset 10"));
        // Late pollers still see the reason.
        assert_eq!(s.snapshot().error.as_deref(), Some("disk full at offset 10"));
    }

    #[test]
    fn resume_seeds_counter_and_ignores_pre_offset_chunks() {
        let mut s = sample_session(100);
        s.seed_resume("hk.x86_64", 40);
        assert_eq!(s.transferred_bytes(), 40);
        // A stray retransmit below the resume base is not counted.
        assert!(!s.record_chunk("hk.x86_64", 0, 40));
        assert!(s.record_chunk("hk.x86_64", 40, 60));
        assert_eq!(s.transferred_bytes(), 100);
    }

    #[test]
    fn scenario_three_files_exact_total() {
        // 3 files, 2,500,000 bytes, 1 MiB chunks: largest file yields two
        // full chunks and one partial; final counter is exactly the total.
        let chunk = crate::chunk::DEFAULT_CHUNK_SIZE;
        let sizes = [2_300_000u64, 150_000, 50_000];
        let files: Vec<FileEntry> = sizes
            .iter()
            .enumerate()
            .map(|(i, &size)| FileEntry {
                rel_path: format!("f{i}"),
                size,
            })
            .collect();
        let total: u64 = sizes.iter().sum();
        assert_eq!(total, 2_500_000);
        let mut s = UploadSession::new(
            "s3",
            TransferConfig {
                game_name: "g".into(),
                dest_dir: "g".into(),
                exe_rel_path: "f0".into(),
                launch_options: String::new(),
                tags: vec![],
            },
            files.clone(),
            total,
        );
        let largest = crate::chunk::plan_chunks(sizes[0], chunk, 0);
        assert_eq!(largest.len(), 3);
        for f in &files {
            for c in crate::chunk::plan_chunks(f.size, chunk, 0) {
                assert!(s.record_chunk(&f.rel_path, c.offset, c.len));
            }
        }
        assert_eq!(s.transferred_bytes(), 2_500_000);
    }

    #[test]
    fn registry_insert_snapshot_remove() {
        let reg = SessionRegistry::new();
        reg.insert(sample_session(100));
        assert_eq!(reg.list().len(), 1);
        reg.with_session("s1", |s| {
            s.record_chunk("hk.x86_64", 0, 100);
            s.complete();
        });
        let snap = reg.snapshot("s1").unwrap();
        assert_eq!(snap.status, SessionStatus::Completed);
        assert!(reg.remove("s1").is_some());
        assert!(reg.snapshot("s1").is_none());
    }

    #[test]
    fn throughput_zero_without_samples() {
        let est = ThroughputEstimator::new();
        assert_eq!(est.bytes_per_sec(), 0.0);
        assert_eq!(est.eta_secs(1_000_000), 0);
    }

    #[test]
    fn throughput_from_sample_span() {
        let mut est = ThroughputEstimator::new();
        let t0 = Instant::now();
        est.record_at(t0, 0);
        est.record_at(t0 + Duration::from_secs(2), 2000);
        let rate = est.bytes_per_sec();
        assert!((rate - 1000.0).abs() < 1.0, "rate was {rate}");
        assert_eq!(est.eta_secs(5000), 5);
    }

    #[test]
    fn sample_count_stays_bounded() {
        let mut est = ThroughputEstimator::with_limits(Duration::from_secs(10), 8);
        let t0 = Instant::now();
        for i in 0..100u64 {
            est.record_at(t0 + Duration::from_millis(i * 10), 100);
        }
        assert!(est.samples.len() <= 8);
        assert!(est.bytes_per_sec() > 0.0);
    }

    #[test]
    fn old_samples_pruned_by_window() {
        let mut est = ThroughputEstimator::with_limits(Duration::from_secs(1), 64);
        let t0 = Instant::now();
        est.record_at(t0, 1000);
        est.record_at(t0 + Duration::from_secs(5), 1000);
        est.record_at(t0 + Duration::from_secs(5) + Duration::from_millis(500), 1000);
        // The first sample is outside the window and must not stretch the span.
        let span_first = est.samples.front().unwrap().0;
        assert!(span_first > t0);
    }
}
