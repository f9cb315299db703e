//! `hashsum(body, timestamp)`.
//!
//! Reverses the first 8 bytes of SHA-256 over the UTF-8 JSON of `body`
//! and renders them as a big-endian-interpreted decimal string. The
//! `timestamp` argument is accepted but unused, matching the source —
//! see SPEC_FULL §9 ("Timestamp argument to hashsum is unused").
use sha2::{Digest, Sha256};

pub fn hashsum(body: &serde_json::Value, _timestamp: i64) -> String {
    let json = serde_json::to_vec(body).unwrap_or_default();
    let digest = Sha256::digest(&json);
    let mut first8: [u8; 8] = digest[0..8].try_into().expect("8 bytes");
    first8.reverse();
    u64::from_be_bytes(first8).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn is_deterministic() {
        let body = json!({"a": 1, "b": "two"});
        assert_eq!(hashsum(&body, 0), hashsum(&body, 0));
    }

    #[test]
    fn timestamp_does_not_affect_output() {
        let body = json!({"a": 1});
        assert_eq!(hashsum(&body, 0), hashsum(&body, 999_999));
    }

    #[test]
    fn different_bodies_differ() {
        let a = json!({"a": 1});
        let b = json!({"a": 2});
        assert_ne!(hashsum(&a, 0), hashsum(&b, 0));
    }
}
