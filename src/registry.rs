//! Stream registry: opaque stream ids → call context.
//!
//! A registration is created before the provider is told to dial or answer,
//! so the id resolves the instant the media socket connects. Each entry is
//! consumed exactly once; replays and collisions are rejected. Entries that
//! never connect are evicted after a TTL so abandoned registrations cannot
//! accumulate.

use crate::error::{BridgeError, Result};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Everything a media session needs to know about its call, resolved once
/// at socket attach and read-only afterwards.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Provider call id (call control id).
    pub call_id: String,
    /// Persisted call record id, when the record was created before attach.
    pub record_id: Option<i64>,
    /// Per-call goal prompt; also marks the preload path for inbound calls.
    pub prompt: Option<String>,
    /// Maximum call duration before forced termination.
    pub max_duration: Duration,
    /// Message spoken when the duration limit fires.
    pub limit_message: String,
    /// Initial silence delay before any preloaded audio, in milliseconds.
    pub delay_ms: u64,
    /// User assigned to this call, if any.
    pub user_id: Option<String>,
    /// Chat the call was started from, if any.
    pub chat_id: Option<String>,
    /// Whether the call is inbound (drives preload polling and alerting).
    pub inbound: bool,
}

struct Entry {
    context: CallContext,
    registered_at: Instant,
}

/// Process-wide map from short-lived stream ids to call context.
pub struct StreamRegistry {
    ttl: Duration,
    inner: Mutex<HashMap<String, Entry>>,
}

impl StreamRegistry {
    /// Create a registry whose entries expire after `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Register a stream id. Fails if the id is already present: a
    /// collision or replay must never silently rebind a call.
    pub fn register(&self, stream_id: &str, context: CallContext) -> Result<()> {
        let mut map = self.inner.lock().expect("registry lock");
        Self::sweep(&mut map, self.ttl);
        if map.contains_key(stream_id) {
            return Err(BridgeError::Registry(format!(
                "stream id already registered: {stream_id}"
            )));
        }
        debug!("registered stream {stream_id} -> call {}", context.call_id);
        map.insert(
            stream_id.to_owned(),
            Entry {
                context,
                registered_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Resolve and consume a stream id. Returns `None` for unknown,
    /// already-consumed, or expired ids.
    pub fn resolve(&self, stream_id: &str) -> Option<CallContext> {
        let mut map = self.inner.lock().expect("registry lock");
        Self::sweep(&mut map, self.ttl);
        map.remove(stream_id).map(|e| e.context)
    }

    fn sweep(map: &mut HashMap<String, Entry>, ttl: Duration) {
        map.retain(|id, entry| {
            let alive = entry.registered_at.elapsed() < ttl;
            if !alive {
                warn!("evicting stream registration that never connected: {id}");
            }
            alive
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(call_id: &str) -> CallContext {
        CallContext {
            call_id: call_id.to_owned(),
            record_id: Some(1),
            prompt: None,
            max_duration: Duration::from_secs(600),
            limit_message: "time is up".to_owned(),
            delay_ms: 0,
            user_id: None,
            chat_id: None,
            inbound: false,
        }
    }

    #[test]
    fn resolve_consumes_the_registration() {
        let registry = StreamRegistry::new(Duration::from_secs(60));
        registry.register("abc", context("call-1")).expect("register");
        let ctx = registry.resolve("abc").expect("resolve");
        assert_eq!(ctx.call_id, "call-1");
        // A replayed stream id must not resolve again.
        assert!(registry.resolve("abc").is_none());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = StreamRegistry::new(Duration::from_secs(60));
        registry.register("abc", context("call-1")).expect("register");
        assert!(registry.register("abc", context("call-2")).is_err());
    }

    #[test]
    fn unknown_id_does_not_resolve() {
        let registry = StreamRegistry::new(Duration::from_secs(60));
        assert!(registry.resolve("nope").is_none());
    }

    #[test]
    fn stale_entries_expire() {
        let registry = StreamRegistry::new(Duration::from_millis(10));
        registry.register("old", context("call-1")).expect("register");
        std::thread::sleep(Duration::from_millis(25));
        assert!(registry.resolve("old").is_none());
    }
}
