//! Small shared helpers: id generation, secret hashing, client address
//! extraction.

use axum::http::HeaderMap;
use base64::Engine;
use sha2::{Digest, Sha256};

/// Fresh opaque identifier for events, sessions, and call records.
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// One-way hash for stored secrets (pins, verification tokens).
pub fn hash_secret(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest)
}

/// Client address as reported by the proxy headers, falling back to the
/// socket peer address.
pub fn client_ip(headers: &HeaderMap, peer: Option<std::net::SocketAddr>) -> String {
    for header in ["x-real-ip", "x-forwarded-for"] {
        if let Some(value) = headers.get(header).and_then(|v| v.to_str().ok()) {
            let first = value.split(',').next().unwrap_or(value).trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Value of the named cookie, if the request carries one.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = headers.get("cookie")?.to_str().ok()?;
    for pair in raw.split(';') {
        let (key, value) = pair.split_once('=')?;
        if key.trim() == name {
            return Some(value.trim().to_string());
        }
    }
    None
}
