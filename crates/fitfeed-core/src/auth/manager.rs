//! The session manager: owns the token pair, keeps it fresh, and tells the
//! rest of the client who is signed in.
//!
//! State lives behind a `std::sync::Mutex` that is never held across an
//! `.await`. The only suspend points are the calls into [`AuthApi`]. A
//! refresh spans one of those, so refresh attempts are serialized with a
//! separate flag, and every result that comes back from the network is
//! checked against the session generation before it is applied.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::api::AuthApi;
use crate::cache::{CacheManager, CachedData};
use crate::models::{TokenPair, User};

use super::schedule::{RefreshPlan, RefreshTimer};
use super::signal::{AuthFailure, AuthSignal};
use super::{token, Clock, Session, SessionData, SessionStore, SystemClock};

// ============================================================================
// Constants
// ============================================================================

/// Buffer size for the session event channel.
const EVENT_CHANNEL_SIZE: usize = 32;

/// Upper bound on the server-side logout call. Client-side logout proceeds
/// once it passes.
const LOGOUT_TIMEOUT_SECS: u64 = 10;

/// Refresh this long before the access token expires
const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);

/// Assumed validity of an access token whose expiry cannot be decoded
const DEFAULT_TOKEN_VALIDITY: Duration = Duration::from_secs(15 * 60);

const LOGIN_PATH: &str = "/login";
const SIGNUP_PATH: &str = "/signup";
const DASHBOARD_PATH: &str = "/dashboard";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub refresh_margin: Duration,
    pub default_token_validity: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            refresh_margin: DEFAULT_REFRESH_MARGIN,
            default_token_validity: DEFAULT_TOKEN_VALIDITY,
        }
    }
}

/// Where the application should go next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Login,
    Dashboard,
    /// A protected page the user asked for before logging in
    Path(String),
}

impl Route {
    pub fn path(&self) -> &str {
        match self {
            Route::Login => LOGIN_PATH,
            Route::Dashboard => DASHBOARD_PATH,
            Route::Path(path) => path,
        }
    }
}

/// A user-visible message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub title: String,
    pub description: String,
}

impl Notice {
    pub fn session_expired() -> Self {
        Self {
            title: "Session Expired".to_string(),
            description: "Please log in again.".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Navigate(Route),
    Notice(Notice),
    UserChanged(Option<User>),
}

/// Outcome of checking a protected route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    /// Identity is still being fetched
    Pending,
    Allow,
    RedirectToLogin,
}

/// Point-in-time copy of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct SessionState {
    pub tokens: Option<TokenPair>,
    pub expiry_epoch_millis: Option<i64>,
    pub current_user: Option<User>,
    pub is_loading: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IdentityOutcome {
    Fetched,
    Rejected,
    Failed,
    NoSession,
    Superseded,
}

#[derive(Default)]
struct State {
    /// Tokens and their expiry always travel together
    session: Option<SessionData>,
    current_user: Option<User>,
    loading: bool,
    /// Bumped on login and logout. Network results tagged with an older
    /// generation are discarded.
    generation: u64,
    timer: Option<RefreshTimer>,
}

struct Inner {
    api: Arc<dyn AuthApi>,
    session: Session,
    cache: Option<CacheManager>,
    clock: Arc<dyn Clock>,
    settings: SessionSettings,
    state: Mutex<State>,
    refreshing: AtomicBool,
    events: broadcast::Sender<SessionEvent>,
    signal: AuthSignal,
    signal_rx: Mutex<Option<mpsc::Receiver<AuthFailure>>>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        // Every mutation is a plain field assignment, so a poisoned lock
        // still holds consistent state.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Held while a refresh is in flight; releases the flag on drop.
struct RefreshGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> RefreshGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

pub struct SessionManagerBuilder {
    api: Arc<dyn AuthApi>,
    store: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
    settings: SessionSettings,
    cache: Option<CacheManager>,
}

impl SessionManagerBuilder {
    pub fn settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Response cache to fill with the fetched identity and reset on logout
    pub fn identity_cache(mut self, cache: CacheManager) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn build(self) -> SessionManager {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let (signal, signal_rx) = AuthSignal::channel();

        SessionManager {
            inner: Arc::new(Inner {
                api: self.api,
                session: Session::new(self.store),
                cache: self.cache,
                clock: self.clock,
                settings: self.settings,
                state: Mutex::new(State::default()),
                refreshing: AtomicBool::new(false),
                events,
                signal,
                signal_rx: Mutex::new(Some(signal_rx)),
            }),
        }
    }
}

/// Owns the access/refresh token pair. Clone is cheap and every clone
/// drives the same session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn builder(api: Arc<dyn AuthApi>, store: Arc<dyn SessionStore>) -> SessionManagerBuilder {
        SessionManagerBuilder {
            api,
            store,
            clock: Arc::new(SystemClock),
            settings: SessionSettings::default(),
            cache: None,
        }
    }

    pub fn new(api: Arc<dyn AuthApi>, store: Arc<dyn SessionStore>) -> Self {
        Self::builder(api, store).build()
    }

    // =========================================================================
    // State accessors
    // =========================================================================

    /// Handle for the API transport to report unauthenticated responses
    pub fn auth_signal(&self) -> AuthSignal {
        self.inner.signal.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn current_user(&self) -> Option<User> {
        self.inner.state().current_user.clone()
    }

    /// True once the identity behind the current tokens has been confirmed
    pub fn is_authenticated(&self) -> bool {
        self.inner.state().current_user.is_some()
    }

    pub fn has_tokens(&self) -> bool {
        self.inner.state().session.is_some()
    }

    pub fn is_loading(&self) -> bool {
        let state = self.inner.state();
        state.loading && state.session.is_some()
    }

    pub fn is_refreshing(&self) -> bool {
        self.inner.refreshing.load(Ordering::Acquire)
    }

    /// Bearer token for outgoing requests
    pub fn access_token(&self) -> Option<String> {
        self.inner
            .state()
            .session
            .as_ref()
            .map(|data| data.tokens.access_token.clone())
    }

    pub fn session_data(&self) -> Option<SessionData> {
        self.inner.state().session.clone()
    }

    pub fn snapshot(&self) -> SessionState {
        let state = self.inner.state();
        SessionState {
            tokens: state.session.as_ref().map(|data| data.tokens.clone()),
            expiry_epoch_millis: state.session.as_ref().map(|data| data.expires_at),
            current_user: state.current_user.clone(),
            is_loading: state.loading && state.session.is_some(),
        }
    }

    /// Minutes left on the access token, for display
    pub fn minutes_until_expiry(&self) -> Option<i64> {
        let now = self.inner.clock.now_millis();
        self.inner
            .state()
            .session
            .as_ref()
            .map(|data| data.minutes_until_expiry(now))
    }

    /// Time until the armed proactive refresh fires
    pub fn next_refresh_in(&self) -> Option<Duration> {
        self.inner.state().timer.as_ref().map(RefreshTimer::remaining)
    }

    /// Last identity written to the response cache, for offline display
    pub fn cached_identity(&self) -> Option<CachedData<User>> {
        let cache = self.inner.cache.as_ref()?;
        match cache.load_user() {
            Ok(cached) => cached,
            Err(e) => {
                warn!(error = %e, "Failed to read cached identity");
                None
            }
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Restore the persisted session and arm its refresh schedule.
    ///
    /// Must run inside a tokio runtime. Makes no identity call; an already
    /// expired session is ended here without a refresh attempt.
    pub async fn initialize(&self) {
        self.start_signal_listener();

        let now = self.inner.clock.now_millis();
        let default_validity = self.inner.settings.default_token_validity;
        let loaded = self.inner.session.load(|tokens| {
            token::expiry_or_default(&tokens.access_token, now, default_validity)
        });

        let data = match loaded {
            Ok(Some(data)) => data,
            Ok(None) => {
                debug!("No persisted session");
                return;
            }
            Err(e) => {
                warn!(error = %e, "Failed to load session, starting signed out");
                return;
            }
        };

        info!(username = ?data.username, "Restored persisted session");
        {
            let mut state = self.inner.state();
            state.generation += 1;
            state.session = Some(data);
            state.current_user = None;
            state.loading = false;
        }

        self.schedule_proactive_refresh().await;
    }

    /// Adopt a freshly issued token pair.
    ///
    /// Persists and schedules before the identity fetch is issued, then
    /// navigates to the remembered destination or the dashboard.
    pub async fn login(&self, tokens: TokenPair, user_id: &str, username: &str) {
        let expires_at = self.decode_expiry(&tokens.access_token);
        let data = SessionData {
            tokens,
            expires_at,
            user_id: Some(user_id.to_string()),
            username: Some(username.to_string()),
        };

        let destination = {
            let mut state = self.inner.state();
            state.generation += 1;
            if let Err(e) = self.inner.session.save(&data) {
                warn!(error = %e, "Failed to save session");
            }
            state.session = Some(data);
            state.current_user = None;
            state.loading = false;

            match self.inner.session.take_redirect() {
                Ok(Some(path)) => Route::Path(path),
                Ok(None) => Route::Dashboard,
                Err(e) => {
                    warn!(error = %e, "Failed to read post-login redirect");
                    Route::Dashboard
                }
            }
        };
        info!(username = username, "Logged in");

        self.schedule_proactive_refresh().await;
        if !self.has_tokens() {
            // Issued already expired; schedule_proactive_refresh ended it
            return;
        }

        self.emit(SessionEvent::Navigate(destination));
        if !self.is_authenticated() {
            // Not already fetched by an immediate refresh
            self.refresh_identity().await;
        }
    }

    /// End the session. Always succeeds from the caller's point of view.
    pub async fn logout(&self) {
        let refresh_token = {
            let mut state = self.inner.state();
            state.timer = None;
            state.session.as_ref().map(|data| data.tokens.refresh_token.clone())
        };

        if let Some(refresh_token) = refresh_token {
            let timeout = Duration::from_secs(LOGOUT_TIMEOUT_SECS);
            match tokio::time::timeout(timeout, self.inner.api.logout(&refresh_token)).await {
                Ok(Ok(_)) => debug!("Server-side logout succeeded"),
                Ok(Err(e)) => warn!(error = %e, "Server-side logout failed"),
                Err(_) => warn!(timeout_secs = LOGOUT_TIMEOUT_SECS, "Server-side logout timed out"),
            }
        }

        let had_user = {
            let mut state = self.inner.state();
            state.timer = None;
            state.generation += 1;
            state.session = None;
            state.loading = false;
            if let Err(e) = self.inner.session.clear() {
                warn!(error = %e, "Failed to clear persisted session");
            }
            state.current_user.take().is_some()
        };

        if let Some(ref cache) = self.inner.cache {
            if let Err(e) = cache.clear() {
                warn!(error = %e, "Failed to reset response cache");
            }
        }

        if had_user {
            self.emit(SessionEvent::UserChanged(None));
        }
        info!("Logged out");
        self.emit(SessionEvent::Navigate(Route::Login));
    }

    /// Exchange the refresh token for a new pair.
    ///
    /// Returns `false` without touching state when another refresh is in
    /// flight or there is no refresh token. A failed exchange ends the
    /// session.
    pub async fn refresh_access_token(&self) -> bool {
        let Some(_guard) = RefreshGuard::acquire(&self.inner.refreshing) else {
            debug!("Refresh already in flight, skipping");
            return false;
        };

        let (refresh_token, generation) = {
            let state = self.inner.state();
            match state.session {
                Some(ref data) => (data.tokens.refresh_token.clone(), state.generation),
                None => {
                    debug!("No refresh token, nothing to refresh");
                    return false;
                }
            }
        };

        info!("Refreshing access token");
        match self.inner.api.refresh_token(&refresh_token).await {
            Ok(payload) => {
                let tokens = payload.tokens();
                let expires_at = self.decode_expiry(&tokens.access_token);
                {
                    let mut state = self.inner.state();
                    if state.generation != generation {
                        info!("Session changed while refresh was in flight, discarding result");
                        return false;
                    }
                    let Some(data) = state.session.as_mut() else {
                        return false;
                    };
                    if let Err(e) = self.inner.session.save_tokens(&tokens, expires_at) {
                        warn!(error = %e, "Failed to save refreshed tokens");
                    }
                    data.tokens = tokens;
                    data.expires_at = expires_at;
                }

                if self.arm_refresh_timer(true) == Some(RefreshPlan::Expired) {
                    warn!("Refreshed access token is already expired");
                    self.expire_session().await;
                    return false;
                }

                info!("Access token refreshed");
                self.fetch_identity().await;
                true
            }
            Err(e) => {
                if !self.is_current(generation) {
                    info!(error = %e, "Refresh failed after session changed, ignoring");
                    return false;
                }
                error!(error = %e, "Token refresh failed");
                self.expire_session().await;
                false
            }
        }
    }

    /// Arm the one-shot refresh for the current expiry, replacing any armed
    /// timer.
    ///
    /// A token already inside the margin is refreshed before this returns,
    /// and an already expired token ends the session. The one exception is
    /// the re-arm after a successful refresh: when the new token is itself
    /// inside the margin, the next refresh is armed halfway to its expiry
    /// instead of immediately.
    pub async fn schedule_proactive_refresh(&self) {
        match self.arm_refresh_timer(false) {
            Some(RefreshPlan::Expired) => {
                warn!("Access token already expired, ending session");
                self.expire_session().await;
            }
            Some(RefreshPlan::Now) => {
                info!("Access token inside refresh margin, refreshing now");
                self.refresh_access_token().await;
            }
            Some(RefreshPlan::At(_)) | None => {}
        }
    }

    /// Fetch the identity behind the current token.
    ///
    /// An authentication failure gets exactly one refresh attempt; the
    /// identity fetch that follows a refresh never triggers another.
    pub async fn refresh_identity(&self) -> Option<User> {
        if self.fetch_identity().await == IdentityOutcome::Rejected {
            info!("Identity fetch rejected, attempting one token refresh");
            self.refresh_access_token().await;
        }
        self.current_user()
    }

    /// Decide whether `path` may be shown.
    ///
    /// Fetches identity first if the session has tokens but no confirmed
    /// user. A redirect remembers `path` for after the next login.
    pub async fn guard(&self, path: &str) -> RouteDecision {
        let needs_identity = {
            let state = self.inner.state();
            state.session.is_some() && state.current_user.is_none() && !state.loading
        };
        if needs_identity {
            self.refresh_identity().await;
        }

        {
            let state = self.inner.state();
            if state.loading && state.session.is_some() {
                return RouteDecision::Pending;
            }
            if state.current_user.is_some() {
                return RouteDecision::Allow;
            }
        }

        if path != LOGIN_PATH && path != SIGNUP_PATH {
            if let Err(e) = self.inner.session.remember_redirect(path) {
                warn!(error = %e, "Failed to remember post-login redirect");
            }
        }
        RouteDecision::RedirectToLogin
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    fn decode_expiry(&self, access_token: &str) -> i64 {
        token::expiry_or_default(
            access_token,
            self.inner.clock.now_millis(),
            self.inner.settings.default_token_validity,
        )
    }

    fn is_current(&self, generation: u64) -> bool {
        let state = self.inner.state();
        state.generation == generation && state.session.is_some()
    }

    async fn expire_session(&self) {
        self.emit(SessionEvent::Notice(Notice::session_expired()));
        self.logout().await;
    }

    /// Replace the armed timer according to the current expiry.
    ///
    /// `Now` arms nothing; the caller refreshes inline. After a refresh, a
    /// token that is already inside the margin is renewed halfway to its
    /// expiry instead, so a server issuing tokens shorter than the margin
    /// does not cause a refresh loop.
    fn arm_refresh_timer(&self, after_refresh: bool) -> Option<RefreshPlan> {
        let now = self.inner.clock.now_millis();
        let mut state = self.inner.state();
        let Some((expires_at, plan)) = state.session.as_ref().map(|data| {
            (data.expires_at, data.refresh_plan(now, self.inner.settings.refresh_margin))
        }) else {
            state.timer = None;
            return None;
        };

        let generation = state.generation;
        state.timer = match plan {
            RefreshPlan::At(delay) => Some(self.spawn_timer(delay, generation)),
            RefreshPlan::Now if after_refresh => {
                let halfway = Duration::from_millis(((expires_at - now) / 2).max(0) as u64);
                Some(self.spawn_timer(halfway, generation))
            }
            RefreshPlan::Now | RefreshPlan::Expired => None,
        };
        Some(plan)
    }

    fn spawn_timer(&self, delay: Duration, generation: u64) -> RefreshTimer {
        debug!(delay_secs = delay.as_secs(), "Arming proactive refresh");
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let manager = SessionManager { inner };
            if !manager.is_current(generation) {
                debug!("Session changed before scheduled refresh, skipping");
                return;
            }
            // Detached, so re-arming from inside the refresh cannot abort it
            tokio::spawn(async move {
                manager.refresh_access_token().await;
            });
        });
        RefreshTimer::new(handle, delay)
    }

    fn start_signal_listener(&self) {
        let receiver = match self.inner.signal_rx.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(mut receiver) = receiver else {
            return;
        };

        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(failure) = receiver.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                // Handled concurrently so the refresh flag drops duplicates
                // instead of queueing them behind the running exchange
                tokio::spawn(async move {
                    SessionManager { inner }.handle_auth_failure(failure).await;
                });
            }
            debug!("Auth signal listener stopped");
        });
    }

    async fn handle_auth_failure(&self, failure: AuthFailure) {
        let current = self.access_token();
        match (failure.rejected_token, current) {
            (_, None) => debug!("Auth failure signalled without a session, ignoring"),
            (Some(rejected), Some(current)) if rejected != current => {
                debug!("Auth failure for a replaced token, ignoring")
            }
            _ => {
                info!("Request rejected as unauthenticated, refreshing");
                self.refresh_access_token().await;
            }
        }
    }

    async fn fetch_identity(&self) -> IdentityOutcome {
        let (access_token, generation) = {
            let mut state = self.inner.state();
            let Some(token) = state.session.as_ref().map(|data| data.tokens.access_token.clone())
            else {
                return IdentityOutcome::NoSession;
            };
            state.loading = true;
            (token, state.generation)
        };

        let result = self.inner.api.me(&access_token).await;

        let user = {
            let mut state = self.inner.state();
            let current_token = state.session.as_ref().map(|data| data.tokens.access_token.as_str());
            if state.generation != generation || current_token != Some(access_token.as_str()) {
                debug!("Session changed during identity fetch, discarding result");
                return IdentityOutcome::Superseded;
            }
            state.loading = false;

            match result {
                Ok(user) => {
                    state.current_user = Some(user.clone());
                    user
                }
                Err(e) if e.is_unauthorized() => {
                    warn!(error = %e, "Identity fetch rejected");
                    return IdentityOutcome::Rejected;
                }
                Err(e) => {
                    warn!(error = %e, "Identity fetch failed");
                    return IdentityOutcome::Failed;
                }
            }
        };

        debug!(username = %user.username, "Identity fetched");
        if let Some(ref cache) = self.inner.cache {
            if let Err(e) = cache.save_user(&user) {
                warn!(error = %e, "Failed to cache identity");
            }
        }
        self.emit(SessionEvent::UserChanged(Some(user)));
        IdentityOutcome::Fetched
    }
}
