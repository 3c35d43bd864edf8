//! Cache identity and captured responses.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};

/// Cache identity: absolute request URI plus the client's User-Agent.
///
/// Equality and hashing are structural over both fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Absolute URI of the request.
    pub absolute_uri: String,
    /// User-Agent sent by the client (empty if none).
    pub user_agent: String,
}

impl CacheKey {
    /// Create a key.
    pub fn new(absolute_uri: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            absolute_uri: absolute_uri.into(),
            user_agent: user_agent.into(),
        }
    }
}

/// A response captured after a successful upstream fetch.
///
/// An entry that is removal-flagged or past its expiry is logically absent,
/// whether or not the periodic sweep has removed it yet.
#[derive(Debug)]
pub struct CacheEntry {
    /// Identity of the cached request.
    pub key: CacheKey,
    /// Expiry time, if the response carried one.
    pub expires: Option<DateTime<Utc>>,
    /// When the entry was captured.
    pub stored_at: DateTime<Utc>,
    /// Response body, if it had one.
    pub response_bytes: Option<Bytes>,
    /// Upstream status code.
    pub status_code: u16,
    /// Upstream reason phrase.
    pub status_text: String,
    /// Relayed headers, in relay order.
    pub headers: Vec<(String, String)>,
    removal_flag: AtomicBool,
}

impl CacheEntry {
    /// Capture a response for `key`.
    ///
    /// An empty body is stored as `None`.
    pub fn new(
        key: CacheKey,
        status_code: u16,
        status_text: impl Into<String>,
        headers: Vec<(String, String)>,
        body: Bytes,
        expires: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            key,
            expires,
            stored_at: Utc::now(),
            response_bytes: (!body.is_empty()).then_some(body),
            status_code,
            status_text: status_text.into(),
            headers,
            removal_flag: AtomicBool::new(false),
        }
    }

    /// Whether the entry has been flagged for removal.
    pub fn is_flagged(&self) -> bool {
        self.removal_flag.load(Ordering::Acquire)
    }

    /// Whether the entry has expired as of `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|expires| expires < now)
    }

    /// Whether the entry must be treated as absent as of `now`.
    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        self.is_flagged() || self.is_expired_at(now)
    }

    pub(crate) fn flag_for_removal(&self) {
        self.removal_flag.store(true, Ordering::Release);
    }
}
