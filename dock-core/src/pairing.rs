//! Pairing codes and token issue: short-lived human-enterable codes
//! bootstrap trust between an unpaired Hub and an Agent.

use std::time::{Duration, Instant};

use rand::Rng;

/// Pairing codes are fixed-length numeric so they can be read off a screen
/// and typed on another device.
pub const CODE_LEN: usize = 6;

/// How long a code stays valid. Tens of seconds: long enough to type, short
/// enough that a shoulder-surfed code goes stale.
pub const DEFAULT_CODE_TTL: Duration = Duration::from_secs(45);

/// An outstanding pairing code. Verification consumes it: one attempt,
/// success or fail.
#[derive(Debug)]
pub struct PairingCode {
    code: String,
    issued_at: Instant,
    ttl: Duration,
}

/// Why a pairing attempt was rejected. Distinct reasons so the UI can tell
/// "expired" from "wrong code".
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PairingFailure {
    #[error("expired")]
    Expired,
    #[error("mismatch")]
    Mismatch,
}

impl PairingCode {
    /// Generate a fresh random code with the given lifetime.
    pub fn generate(ttl: Duration) -> Self {
        let mut rng = rand::thread_rng();
        let code: String = (0..CODE_LEN)
            .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
            .collect();
        Self {
            code,
            issued_at: Instant::now(),
            ttl,
        }
    }

    /// The digits to show on the Agent's own display.
    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn expires_in(&self) -> Duration {
        self.ttl.saturating_sub(self.issued_at.elapsed())
    }

    pub fn is_expired(&self) -> bool {
        self.issued_at.elapsed() >= self.ttl
    }

    /// Check a submitted code. Takes `self` by value: the code is gone after
    /// this call whatever the outcome. Expiry is checked before the match so
    /// a correct-but-late code still reads "expired".
    pub fn verify(self, submitted: &str) -> Result<(), PairingFailure> {
        if self.is_expired() {
            return Err(PairingFailure::Expired);
        }
        if self.code != submitted {
            return Err(PairingFailure::Mismatch);
        }
        Ok(())
    }
}

/// Issue a new opaque long-lived token: 32 random bytes, hex-encoded.
pub fn issue_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}
