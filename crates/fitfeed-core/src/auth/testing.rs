//! In-process fake of the remote API for session tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::api::{ApiError, AuthApi};
use crate::models::{AuthPayload, LoginInput, SignupInput, TokenPair, User};

use super::token::make_jwt;
use super::{Clock, MemorySessionStore, SessionManager, TokioClock};

/// Wall-clock time the fake clock starts at (2023-11-14T22:13:20Z)
pub(crate) const EPOCH_MS: i64 = 1_700_000_000_000;

const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(20 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LogoutBehavior {
    Ok,
    Fail,
    /// Never answers
    Hang,
}

pub(crate) struct MockApi {
    clock: Arc<TokioClock>,
    token_ttl: Mutex<Duration>,
    /// Applied to `refresh_token` and `me`
    latency: Mutex<Duration>,
    logout_behavior: Mutex<LogoutBehavior>,
    issued: AtomicUsize,

    pub refresh_fails: AtomicBool,
    pub me_fails: AtomicBool,
    /// Number of upcoming `me` calls to reject as unauthenticated
    pub me_rejections: AtomicUsize,

    pub refresh_calls: AtomicUsize,
    pub logout_calls: AtomicUsize,
    pub me_calls: AtomicUsize,
}

impl MockApi {
    /// Must be called inside a tokio runtime
    pub fn new() -> Self {
        Self {
            clock: Arc::new(TokioClock::starting_at(EPOCH_MS)),
            token_ttl: Mutex::new(DEFAULT_TOKEN_TTL),
            latency: Mutex::new(Duration::ZERO),
            logout_behavior: Mutex::new(LogoutBehavior::Ok),
            issued: AtomicUsize::new(0),
            refresh_fails: AtomicBool::new(false),
            me_fails: AtomicBool::new(false),
            me_rejections: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            logout_calls: AtomicUsize::new(0),
            me_calls: AtomicUsize::new(0),
        }
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn set_token_ttl(&self, ttl: Duration) {
        *self.token_ttl.lock().unwrap() = ttl;
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    pub fn set_logout_behavior(&self, behavior: LogoutBehavior) {
        *self.logout_behavior.lock().unwrap() = behavior;
    }

    /// A fresh, distinct token pair whose access token expires `ttl` from now
    pub fn tokens_expiring_in(&self, ttl: Duration) -> TokenPair {
        let n = self.issued.fetch_add(1, Ordering::SeqCst);
        let exp_secs = (self.clock.now_millis() + ttl.as_millis() as i64) / 1000;
        TokenPair::new(make_jwt(exp_secs, &format!("42-{}", n)), format!("refresh-{}", n))
    }

    fn payload(&self) -> AuthPayload {
        let ttl = *self.token_ttl.lock().unwrap();
        let tokens = self.tokens_expiring_in(ttl);
        AuthPayload {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            user_id: "42".to_string(),
            username: "liftlarry".to_string(),
        }
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

pub(crate) fn sample_user() -> User {
    User {
        id: "42".to_string(),
        username: "liftlarry".to_string(),
        email: "larry@example.com".to_string(),
        display_name: Some("Larry Lifts".to_string()),
        avatar_url: None,
        status: None,
    }
}

#[async_trait]
impl AuthApi for MockApi {
    async fn login(&self, _input: &LoginInput) -> Result<AuthPayload, ApiError> {
        Ok(self.payload())
    }

    async fn signup(&self, _input: &SignupInput) -> Result<AuthPayload, ApiError> {
        Ok(self.payload())
    }

    async fn refresh_token(&self, _refresh_token: &str) -> Result<AuthPayload, ApiError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        if self.refresh_fails.load(Ordering::SeqCst) {
            return Err(ApiError::Unauthorized);
        }
        Ok(self.payload())
    }

    async fn logout(&self, _refresh_token: &str) -> Result<bool, ApiError> {
        self.logout_calls.fetch_add(1, Ordering::SeqCst);
        let behavior = *self.logout_behavior.lock().unwrap();
        match behavior {
            LogoutBehavior::Ok => Ok(true),
            LogoutBehavior::Fail => Err(ApiError::ServerError("boom".to_string())),
            LogoutBehavior::Hang => std::future::pending().await,
        }
    }

    async fn me(&self, _access_token: &str) -> Result<User, ApiError> {
        self.me_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        let rejected = self
            .me_rejections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(ApiError::Unauthorized);
        }
        if self.me_fails.load(Ordering::SeqCst) {
            return Err(ApiError::ServerError("unavailable".to_string()));
        }
        Ok(sample_user())
    }
}

/// A manager wired to a fresh `MockApi` and in-memory store, on the mock's
/// clock. Must be called inside a paused tokio runtime.
pub(crate) fn harness() -> (SessionManager, Arc<MockApi>, Arc<MemorySessionStore>) {
    let api = Arc::new(MockApi::new());
    let store = Arc::new(MemorySessionStore::new());
    let manager = SessionManager::builder(api.clone(), store.clone())
        .clock(api.clock())
        .build();
    (manager, api, store)
}
