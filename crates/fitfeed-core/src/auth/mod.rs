//! Authentication module for keeping a signed-in session alive.
//!
//! This module provides:
//! - `SessionManager`: token lifecycle with proactive and reactive refresh
//! - `Session`: typed view over a durable `SessionStore`
//! - `SessionStore` backends: file, OS keychain, in-memory
//! - `AuthSignal`: lets the API transport report rejected requests
//!
//! Access tokens are refreshed five minutes before they expire.

pub mod clock;
pub mod keyring_store;
pub mod manager;
pub mod schedule;
pub mod session;
pub mod signal;
pub mod store;
pub mod token;

#[cfg(test)]
pub(crate) mod testing;

pub use clock::{Clock, SystemClock, TokioClock};
pub use keyring_store::KeyringSessionStore;
pub use manager::{
    Notice, Route, RouteDecision, SessionEvent, SessionManager, SessionManagerBuilder,
    SessionSettings, SessionState,
};
pub use schedule::{plan_refresh, RefreshPlan};
pub use session::{Session, SessionData};
pub use signal::AuthSignal;
pub use store::{FileSessionStore, MemorySessionStore, SessionStore};
pub use token::TokenError;
