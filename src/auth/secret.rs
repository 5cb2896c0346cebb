//! Shared secrets compared in constant time.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// A shared secret held only as an HMAC-SHA256 tag under a per-process key.
#[derive(Clone)]
pub struct SharedSecret {
    key: [u8; 16],
    tag: Vec<u8>,
}

impl SharedSecret {
    /// `None` for a blank secret: an unset secret must never match anything.
    pub fn new(secret: &str) -> Option<Self> {
        if secret.is_empty() {
            return None;
        }
        let key = *uuid::Uuid::new_v4().as_bytes();
        let tag = Self::mac(&key, secret)?.finalize().into_bytes().to_vec();
        Some(Self { key, tag })
    }

    fn mac(key: &[u8], value: &str) -> Option<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(key).ok()?;
        mac.update(value.as_bytes());
        Some(mac)
    }

    pub fn matches(&self, candidate: &str) -> bool {
        Self::mac(&self.key, candidate)
            .map(|mac| mac.verify_slice(&self.tag).is_ok())
            .unwrap_or(false)
    }

    /// Short, non-reversible id for log lines.
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.tag[..4])
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SharedSecret({})", self.fingerprint())
    }
}
