//! PV events generated by downstream activity.

use crate::domain::{MemberId, Pv, TimeMs};
use serde::{Deserialize, Serialize};

/// A unit of PV produced by a member's activity.
///
/// Consumed once by propagation, then archived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PvEvent {
    /// Stable unique identifier, the replay guard.
    ///
    /// Priority: caller-supplied activity id > hash of deterministic fields.
    pub event_key: String,
    pub source: MemberId,
    pub amount: Pv,
    pub time_ms: TimeMs,
}

impl PvEvent {
    /// Create an event keyed by a caller-supplied activity id.
    pub fn with_key(
        event_key: impl Into<String>,
        source: MemberId,
        amount: Pv,
        time_ms: TimeMs,
    ) -> Self {
        Self {
            event_key: event_key.into(),
            source,
            amount,
            time_ms,
        }
    }

    /// Create an event whose key is derived from its fields.
    pub fn new(source: MemberId, amount: Pv, time_ms: TimeMs) -> Self {
        let event_key = Self::compute_event_key(&source, amount, time_ms);
        Self {
            event_key,
            source,
            amount,
            time_ms,
        }
    }

    /// SHA-256 over length-prefixed fields, truncated to 128 bits.
    pub fn compute_event_key(source: &MemberId, amount: Pv, time_ms: TimeMs) -> String {
        use sha2::{Digest, Sha256};

        fn hash_var(hasher: &mut Sha256, data: &[u8]) {
            hasher.update((data.len() as u64).to_be_bytes());
            hasher.update(data);
        }

        let mut hasher = Sha256::new();
        hash_var(&mut hasher, source.as_str().as_bytes());
        hash_var(&mut hasher, &amount.get().to_be_bytes());
        hash_var(&mut hasher, &time_ms.as_i64().to_be_bytes());
        let digest = hasher.finalize();
        format!("pv:{}", hex::encode(&digest[..16]))
    }
}
