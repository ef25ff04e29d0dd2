//! Session token cache for the commercial CA API

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::clock::Clock;

struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Time-bounded session token shared by concurrent driver calls.
///
/// `invalidate()` is idempotent; concurrent refreshes after a 401 each log
/// in and the last stored token wins.
pub struct SessionTokenCache {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    slot: RwLock<Option<CachedToken>>,
}

impl SessionTokenCache {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            slot: RwLock::new(None),
        }
    }

    /// Current token, if one is cached and not expired
    pub fn get(&self) -> Option<String> {
        let now = self.clock.now();
        let slot = self.slot.read();
        match slot.as_ref() {
            Some(cached) if cached.expires_at > now => {
                trace!(expires_at = %cached.expires_at, "Session token cache hit");
                Some(cached.token.clone())
            }
            Some(_) => {
                debug!("Session token expired");
                None
            }
            None => None,
        }
    }

    pub fn store(&self, token: impl Into<String>) {
        let expires_at = self.clock.now() + self.ttl;
        *self.slot.write() = Some(CachedToken {
            token: token.into(),
            expires_at,
        });
        debug!(expires_at = %expires_at, "Session token cached");
    }

    pub fn invalidate(&self) {
        if self.slot.write().take().is_some() {
            debug!("Session token invalidated");
        }
    }
}

impl fmt::Debug for SessionTokenCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionTokenCache")
            .field("ttl", &self.ttl)
            .field("cached", &self.slot.read().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn test_token_expires_after_ttl() {
        let clock = Arc::new(ManualClock::starting_now());
        let cache = SessionTokenCache::new(Duration::hours(23), clock.clone());

        assert!(cache.get().is_none());
        cache.store("tok-1");
        assert_eq!(cache.get().as_deref(), Some("tok-1"));

        clock.advance(Duration::hours(22));
        assert_eq!(cache.get().as_deref(), Some("tok-1"));

        clock.advance(Duration::hours(2));
        assert!(cache.get().is_none());
    }

    #[test]
    fn test_invalidate_is_idempotent() {
        let clock = Arc::new(ManualClock::starting_now());
        let cache = SessionTokenCache::new(Duration::hours(1), clock);
        cache.store("tok");
        cache.invalidate();
        cache.invalidate();
        assert!(cache.get().is_none());

        cache.store("tok-2");
        assert_eq!(cache.get().as_deref(), Some("tok-2"));
    }

    #[test]
    fn test_debug_hides_token() {
        let clock = Arc::new(ManualClock::starting_now());
        let cache = SessionTokenCache::new(Duration::hours(1), clock);
        cache.store("secret-token");
        assert!(!format!("{:?}", cache).contains("secret-token"));
    }
}
