//! Record version number generation

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::{rngs::OsRng, RngCore};

/// Produces record version numbers: opaque tokens that identify one state
/// of a lock item.
///
/// Each token carries 160 bits of OS entropy, so collisions across clients
/// are out of the question, and a process-local sequence number, so no two
/// tokens from the same source are ever equal. The wall-clock prefix is
/// there for log forensics only; ordering between writes is established
/// by chaining tokens through conditional writes, never by comparing them.
pub struct RvnSource {
    seq: AtomicU64,
}

impl RvnSource {
    pub fn new() -> Self {
        Self {
            seq: AtomicU64::new(0),
        }
    }

    /// Generate a fresh token. Never parses back; callers treat the result
    /// as an opaque string.
    pub fn next(&self) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);

        let mut entropy = [0u8; 20];
        OsRng.fill_bytes(&mut entropy);

        format!("{}.{}:{}", nanos, seq, URL_SAFE_NO_PAD.encode(entropy))
    }
}

impl Default for RvnSource {
    fn default() -> Self {
        Self::new()
    }
}
