use std::sync::Arc;

use anyhow::Result;
use chrono::Duration;
use tracing::{debug, warn};

use crate::models::TokenPair;

use super::schedule::{plan_refresh, RefreshPlan};
use super::SessionStore;

// Persisted layout. Expiry is epoch millis, string-encoded.
const ACCESS_TOKEN_KEY: &str = "accessToken";
const REFRESH_TOKEN_KEY: &str = "refreshToken";
const TOKEN_EXPIRY_KEY: &str = "tokenExpiry";
const USER_ID_KEY: &str = "userId";
const USERNAME_KEY: &str = "username";
const REDIRECT_KEY: &str = "redirectAfterLogin";

const SESSION_KEYS: [&str; 6] = [
    ACCESS_TOKEN_KEY,
    REFRESH_TOKEN_KEY,
    TOKEN_EXPIRY_KEY,
    USER_ID_KEY,
    USERNAME_KEY,
    REDIRECT_KEY,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionData {
    pub tokens: TokenPair,
    /// Access token expiry in epoch millis
    pub expires_at: i64,
    pub user_id: Option<String>,
    pub username: Option<String>,
}

impl SessionData {
    /// When to renew the access token, given the refresh margin
    pub fn refresh_plan(&self, now_millis: i64, margin: std::time::Duration) -> RefreshPlan {
        plan_refresh(self.expires_at, now_millis, margin)
    }

    pub fn time_until_expiry(&self, now_millis: i64) -> Duration {
        Duration::milliseconds(self.expires_at - now_millis)
    }

    /// Get minutes remaining until expiry (for display)
    pub fn minutes_until_expiry(&self, now_millis: i64) -> i64 {
        self.time_until_expiry(now_millis).num_minutes().max(0)
    }
}

/// Typed view over a `SessionStore`.
#[derive(Clone)]
pub struct Session {
    store: Arc<dyn SessionStore>,
}

impl Session {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    /// Load the persisted session.
    ///
    /// Returns `None` unless both tokens are present. A missing or unreadable
    /// expiry is filled in by `fallback_expiry`.
    pub fn load(&self, fallback_expiry: impl FnOnce(&TokenPair) -> i64) -> Result<Option<SessionData>> {
        let access_token = self.store.get(ACCESS_TOKEN_KEY)?;
        let refresh_token = self.store.get(REFRESH_TOKEN_KEY)?;
        let (Some(access_token), Some(refresh_token)) = (access_token, refresh_token) else {
            debug!("No complete token pair in session store");
            return Ok(None);
        };
        let tokens = TokenPair::new(access_token, refresh_token);

        let stored_expiry = self.store.get(TOKEN_EXPIRY_KEY)?;
        let expires_at = match stored_expiry.as_deref().map(str::parse::<i64>) {
            Some(Ok(expiry)) => expiry,
            Some(Err(e)) => {
                warn!(error = %e, "Stored token expiry is unreadable, decoding from token");
                fallback_expiry(&tokens)
            }
            None => {
                debug!("No stored token expiry, decoding from token");
                fallback_expiry(&tokens)
            }
        };

        Ok(Some(SessionData {
            tokens,
            expires_at,
            user_id: self.store.get(USER_ID_KEY)?,
            username: self.store.get(USERNAME_KEY)?,
        }))
    }

    /// Save a complete session, as after login
    pub fn save(&self, data: &SessionData) -> Result<()> {
        self.save_tokens(&data.tokens, data.expires_at)?;
        match data.user_id {
            Some(ref user_id) => self.store.set(USER_ID_KEY, user_id)?,
            None => self.store.remove(USER_ID_KEY)?,
        }
        match data.username {
            Some(ref username) => self.store.set(USERNAME_KEY, username)?,
            None => self.store.remove(USERNAME_KEY)?,
        }
        Ok(())
    }

    /// Replace the token pair and expiry, keeping the identity hints
    pub fn save_tokens(&self, tokens: &TokenPair, expires_at: i64) -> Result<()> {
        self.store.set(ACCESS_TOKEN_KEY, &tokens.access_token)?;
        self.store.set(REFRESH_TOKEN_KEY, &tokens.refresh_token)?;
        self.store.set(TOKEN_EXPIRY_KEY, &expires_at.to_string())?;
        Ok(())
    }

    /// Remove every session key. All keys are attempted; the first failure
    /// is reported.
    pub fn clear(&self) -> Result<()> {
        let mut first_error = None;
        for key in SESSION_KEYS {
            if let Err(e) = self.store.remove(key) {
                warn!(key = key, error = %e, "Failed to remove session key");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Remember where to send the user after the next login
    pub fn remember_redirect(&self, path: &str) -> Result<()> {
        self.store.set(REDIRECT_KEY, path)
    }

    /// Take the remembered post-login destination, if any
    pub fn take_redirect(&self) -> Result<Option<String>> {
        let path = self.store.get(REDIRECT_KEY)?;
        if path.is_some() {
            self.store.remove(REDIRECT_KEY)?;
        }
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemorySessionStore;

    fn sample() -> SessionData {
        SessionData {
            tokens: TokenPair::new("access", "refresh"),
            expires_at: 1_700_000_000_000,
            user_id: Some("42".to_string()),
            username: Some("liftlarry".to_string()),
        }
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let store = Arc::new(MemorySessionStore::new());
        let session = Session::new(store.clone());
        session.save(&sample()).unwrap();

        assert_eq!(store.get("tokenExpiry").unwrap().as_deref(), Some("1700000000000"));
        let loaded = session.load(|_| panic!("expiry was stored")).unwrap();
        assert_eq!(loaded, Some(sample()));
    }

    #[test]
    fn test_load_requires_both_tokens() {
        let store = Arc::new(MemorySessionStore::new());
        store.set("accessToken", "only-access").unwrap();
        let session = Session::new(store);
        assert!(session.load(|_| 0).unwrap().is_none());
    }

    #[test]
    fn test_load_fills_missing_or_bad_expiry() {
        let store = Arc::new(MemorySessionStore::new());
        store.set("accessToken", "a").unwrap();
        store.set("refreshToken", "r").unwrap();
        let session = Session::new(store.clone());

        let loaded = session.load(|_| 123).unwrap().unwrap();
        assert_eq!(loaded.expires_at, 123);
        assert_eq!(loaded.user_id, None);

        store.set("tokenExpiry", "tomorrow").unwrap();
        let loaded = session.load(|_| 456).unwrap().unwrap();
        assert_eq!(loaded.expires_at, 456);
    }

    #[test]
    fn test_save_tokens_keeps_identity_hints() {
        let store = Arc::new(MemorySessionStore::new());
        let session = Session::new(store.clone());
        session.save(&sample()).unwrap();

        session.save_tokens(&TokenPair::new("access2", "refresh2"), 99).unwrap();
        let loaded = session.load(|_| 0).unwrap().unwrap();
        assert_eq!(loaded.tokens, TokenPair::new("access2", "refresh2"));
        assert_eq!(loaded.expires_at, 99);
        assert_eq!(loaded.username.as_deref(), Some("liftlarry"));
    }

    #[test]
    fn test_clear_removes_everything() {
        let store = Arc::new(MemorySessionStore::new());
        let session = Session::new(store.clone());
        session.save(&sample()).unwrap();
        session.remember_redirect("/workouts/7").unwrap();

        session.clear().unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_redirect_is_taken_once() {
        let session = Session::new(Arc::new(MemorySessionStore::new()));
        assert!(session.take_redirect().unwrap().is_none());
        session.remember_redirect("/feed").unwrap();
        assert_eq!(session.take_redirect().unwrap().as_deref(), Some("/feed"));
        assert!(session.take_redirect().unwrap().is_none());
    }

    #[test]
    fn test_expiry_helpers() {
        let data = sample();
        let now = data.expires_at - 20 * 60 * 1000;
        let margin = std::time::Duration::from_secs(5 * 60);
        assert_eq!(data.minutes_until_expiry(now), 20);
        assert_eq!(
            data.refresh_plan(now, margin),
            RefreshPlan::At(std::time::Duration::from_secs(15 * 60))
        );
        assert_eq!(data.refresh_plan(now + 15 * 60 * 1000, margin), RefreshPlan::Now);
        assert_eq!(data.refresh_plan(data.expires_at, margin), RefreshPlan::Expired);
        assert_eq!(data.minutes_until_expiry(data.expires_at + 60_000), 0);
    }
}
