//! Persisted trust: authorized peers and the durable self-identity.
//!
//! Both files are owner-readable only. The store is single-writer per
//! process; callers wrap it in their own lock.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A peer that has completed pairing. Token rotates on re-pairing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizedPeer {
    pub id: String,
    pub name: String,
    pub token: String,
    pub paired_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum TrustStoreError {
    #[error("trust store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("trust store parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// On-disk map of peer id -> authorized peer, JSON, 0600.
pub struct TrustStore {
    path: PathBuf,
    peers: HashMap<String, AuthorizedPeer>,
}

impl TrustStore {
    /// Load the store, treating a missing file as empty.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, TrustStoreError> {
        let path = path.into();
        let peers = if path.exists() {
            serde_json::from_str(&fs::read_to_string(&path)?)?
        } else {
            HashMap::new()
        };
        Ok(Self { path, peers })
    }

    /// Grant (or re-grant) access. Re-pairing the same peer rotates its
    /// token. Persists before returning.
    pub fn authorize(
        &mut self,
        peer_id: &str,
        name: &str,
        token: &str,
    ) -> Result<(), TrustStoreError> {
        let now = Utc::now();
        let paired_at = self
            .peers
            .get(peer_id)
            .map(|p| p.paired_at)
            .unwrap_or(now);
        self.peers.insert(
            peer_id.to_string(),
            AuthorizedPeer {
                id: peer_id.to_string(),
                name: name.to_string(),
                token: token.to_string(),
                paired_at,
                last_seen: now,
            },
        );
        self.persist()
    }

    /// True if the peer is known and presented its current token.
    pub fn token_matches(&self, peer_id: &str, token: &str) -> bool {
        self.peers
            .get(peer_id)
            .map(|p| p.token == token)
            .unwrap_or(false)
    }

    pub fn is_authorized(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn touch_last_seen(&mut self, peer_id: &str) -> Result<(), TrustStoreError> {
        if let Some(p) = self.peers.get_mut(peer_id) {
            p.last_seen = Utc::now();
            self.persist()?;
        }
        Ok(())
    }

    /// Delete the stored entry. The next connection from that peer is
    /// treated as first contact.
    pub fn revoke(&mut self, peer_id: &str) -> Result<bool, TrustStoreError> {
        let removed = self.peers.remove(peer_id).is_some();
        if removed {
            self.persist()?;
        }
        Ok(removed)
    }

    pub fn list(&self) -> Vec<AuthorizedPeer> {
        let mut out: Vec<_> = self.peers.values().cloned().collect();
        out.sort_by(|a, b| a.paired_at.cmp(&b.paired_at));
        out
    }

    fn persist(&self) -> Result<(), TrustStoreError> {
        let json = serde_json::to_string_pretty(&self.peers)?;
        write_private(&self.path, json.as_bytes())?;
        Ok(())
    }
}

/// Durable self-identifier: generated once, persisted, reused across
/// restarts, so the same physical device is recognized even when pairing
/// tokens churn.
pub fn load_or_create_identity(path: &Path) -> Result<String, TrustStoreError> {
    if path.exists() {
        let id = fs::read_to_string(path)?.trim().to_string();
        if !id.is_empty() {
            return Ok(id);
        }
    }
    let id = uuid::Uuid::new_v4().to_string();
    write_private(path, id.as_bytes())?;
    Ok(id)
}

/// Write a file with owner-only permissions, creating parent directories.
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrustStore::load(dir.path().join("peers.json")).unwrap();
        assert!(store.list().is_empty());
    }

    #[test]
    fn authorize_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.json");
        {
            let mut store = TrustStore::load(&path).unwrap();
            store.authorize("hub-1", "Office PC", "tok-a").unwrap();
        }
        let store = TrustStore::load(&path).unwrap();
        assert!(store.token_matches("hub-1", "tok-a"));
        assert!(!store.token_matches("hub-1", "tok-b"));
        assert!(!store.token_matches("hub-2", "tok-a"));
    }

    #[test]
    fn repairing_rotates_token_keeps_paired_at() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = TrustStore::load(dir.path().join("peers.json")).unwrap();
        store.authorize("hub-1", "Office PC", "tok-a").unwrap();
        let first = store.list()[0].paired_at;
        store.authorize("hub-1", "Office PC", "tok-b").unwrap();
        assert!(!store.token_matches("hub-1", "tok-a"));
        assert!(store.token_matches("hub-1", "tok-b"));
        assert_eq!(store.list()[0].paired_at, first);
    }

    #[test]
    fn revoke_forgets_peer() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = TrustStore::load(dir.path().join("peers.json")).unwrap();
        store.authorize("hub-1", "Office PC", "tok-a").unwrap();
        assert!(store.revoke("hub-1").unwrap());
        assert!(!store.is_authorized("hub-1"));
        assert!(!store.revoke("hub-1").unwrap());
    }

    #[test]
    fn identity_stable_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity");
        let a = load_or_create_identity(&path).unwrap();
        let b = load_or_create_identity(&path).unwrap();
        assert_eq!(a, b);
    }

    #[cfg(unix)]
    #[test]
    fn files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.json");
        let mut store = TrustStore::load(&path).unwrap();
        store.authorize("hub-1", "Office PC", "tok-a").unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
