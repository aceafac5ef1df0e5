//! Cached SMB sessions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use polystore_common::Result;

use crate::config::{SmbAddress, SmbCredentials};
use crate::smb::share::{SmbConnector, SmbShare};

struct Session {
    share: Arc<dyn SmbShare>,
    logged_in: Instant,
}

/// Tree-connected shares keyed by share name.
///
/// A session is reused until `ttl` has elapsed since its login, then the
/// next caller logs in again. Connections are made to the address's
/// physical server.
pub struct SessionCache {
    connector: Arc<dyn SmbConnector>,
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionCache {
    pub fn new(connector: Arc<dyn SmbConnector>) -> Self {
        Self {
            connector,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Get the session for `key`, logging in when absent or expired.
    ///
    /// Blocks on the connector.
    ///
    /// # Errors
    /// - `Connection` if the login fails; the stale session is discarded
    pub fn share(
        &self,
        key: &str,
        address: &SmbAddress,
        credentials: &SmbCredentials,
        ttl: Duration,
    ) -> Result<Arc<dyn SmbShare>> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(session) = sessions.get(key) {
            if session.logged_in.elapsed() < ttl {
                return Ok(session.share.clone());
            }
            debug!("Session for {} expired, reconnecting", key);
            sessions.remove(key);
        }

        info!(
            "Connecting to {} as {}\\{} via {}",
            key, credentials.domain, credentials.username, address.physical_server
        );
        let share = self.connector.connect(address, credentials)?;
        sessions.insert(
            key.to_string(),
            Session {
                share: share.clone(),
                logged_in: Instant::now(),
            },
        );
        Ok(share)
    }

    /// Drop the cached session for `key`.
    pub fn invalidate(&self, key: &str) {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    /// Number of live cached sessions.
    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SmbConfig;
    use crate::smb::memory::MemoryConnector;

    const TEN_MINUTES: Duration = Duration::from_secs(600);

    fn config() -> SmbConfig {
        SmbConfig::new("filer", "public", "home.com", "peter", "pw")
    }

    fn connect(cache: &SessionCache, ttl: Duration) -> Result<Arc<dyn SmbShare>> {
        let config = config();
        cache.share(&config.name(), &config.address(), &config.credentials(), ttl)
    }

    #[test]
    fn test_session_is_reused_within_ttl() {
        let connector = Arc::new(MemoryConnector::new());
        let cache = SessionCache::new(connector.clone());

        for _ in 0..3 {
            connect(&cache, TEN_MINUTES).unwrap();
        }
        assert_eq!(connector.connections().len(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_expired_session_reconnects() {
        let connector = Arc::new(MemoryConnector::new());
        let cache = SessionCache::new(connector.clone());

        for _ in 0..2 {
            connect(&cache, Duration::ZERO).unwrap();
        }
        assert_eq!(connector.connections().len(), 2);
    }

    #[test]
    fn test_invalidated_session_reconnects() {
        let connector = Arc::new(MemoryConnector::new());
        let cache = SessionCache::new(connector.clone());

        connect(&cache, TEN_MINUTES).unwrap();
        cache.invalidate(&config().name());
        assert!(cache.is_empty());

        connect(&cache, TEN_MINUTES).unwrap();
        assert_eq!(connector.connections().len(), 2);
    }

    #[test]
    fn test_failed_login_is_not_cached() {
        let connector = Arc::new(MemoryConnector::with_password("secret"));
        let cache = SessionCache::new(connector);

        let err = connect(&cache, TEN_MINUTES).err().unwrap();
        assert!(matches!(err, polystore_common::Error::Connection { .. }));
        assert!(cache.is_empty());
    }
}
