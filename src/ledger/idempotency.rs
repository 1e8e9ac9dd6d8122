use std::sync::atomic::{AtomicU64, Ordering};

use sha2::Digest as _;

static KEY_SEQ: AtomicU64 = AtomicU64::new(0);

pub const MAX_KEY_LEN: usize = 255;

/// Stable key for a charge that has a natural identifier upstream (a chat
/// message id, a job run id). Retries of the same unit of work derive the same
/// key and are deduplicated.
pub fn derive_key(account_id: &str, feature: &str, source_ref: &str) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(account_id.as_bytes());
    hasher.update(b"\n");
    hasher.update(feature.as_bytes());
    hasher.update(b"\n");
    hasher.update(source_ref.as_bytes());
    format!("derived:{}", hex_encode(&hasher.finalize()))
}

/// Unique key for callers that cannot retry, and for administrative events.
/// Two calls never collide, so such charges are never deduplicated.
pub fn unique_key(prefix: &str) -> String {
    let mut bytes = [0u8; 16];
    if getrandom::fill(&mut bytes).is_err() {
        let ts_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|duration| duration.as_millis())
            .unwrap_or(0);
        let seq = KEY_SEQ.fetch_add(1, Ordering::Relaxed);
        return format!("{prefix}:{ts_ms}-{seq}");
    }
    format!("{prefix}:{}", hex_encode(&bytes))
}

fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0x0f) as usize] as char);
    }
    out
}
