//! Out-of-band "authentication failed" channel from the API transport to
//! the session manager.

use tokio::sync::mpsc;
use tracing::debug;

/// Pending reports beyond this are dropped. Any one of them already leads
/// to a refresh, so nothing is lost.
const SIGNAL_BUFFER: usize = 4;

/// One report of a rejected request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AuthFailure {
    /// Access token the rejected request carried, when known
    pub rejected_token: Option<String>,
}

/// Handle the transport layer holds to ask the session for a refresh.
///
/// Cheap to clone. Raising after the session manager is gone is a no-op,
/// and reports beyond a small buffer are dropped until the session manager
/// catches up.
#[derive(Debug, Clone)]
pub struct AuthSignal {
    tx: mpsc::Sender<AuthFailure>,
}

impl AuthSignal {
    pub(crate) fn channel() -> (Self, mpsc::Receiver<AuthFailure>) {
        let (tx, rx) = mpsc::channel(SIGNAL_BUFFER);
        (Self { tx }, rx)
    }

    /// Report an authentication failure without saying which token failed
    pub fn raise(&self) {
        self.send(AuthFailure { rejected_token: None });
    }

    /// Report that a request carrying `access_token` was rejected.
    ///
    /// Reports for a token the session has already replaced are ignored.
    pub fn raise_rejected(&self, access_token: &str) {
        self.send(AuthFailure {
            rejected_token: Some(access_token.to_string()),
        });
    }

    fn send(&self, failure: AuthFailure) {
        match self.tx.try_send(failure) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("Auth failure already pending, dropping signal")
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Session manager is gone, dropping auth failure signal")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_signal_delivers_failures() {
        let (signal, mut rx) = AuthSignal::channel();
        signal.raise();
        signal.clone().raise_rejected("old-token");

        assert_eq!(rx.recv().await, Some(AuthFailure { rejected_token: None }));
        assert_eq!(
            rx.recv().await,
            Some(AuthFailure {
                rejected_token: Some("old-token".to_string())
            })
        );
    }

    #[test]
    fn test_raise_after_receiver_dropped_is_noop() {
        let (signal, rx) = AuthSignal::channel();
        drop(rx);
        signal.raise();
    }

    #[test]
    fn test_unread_signals_are_bounded() {
        let (signal, mut rx) = AuthSignal::channel();
        for _ in 0..100 {
            signal.raise();
        }

        let mut pending = 0;
        while rx.try_recv().is_ok() {
            pending += 1;
        }
        assert_eq!(pending, SIGNAL_BUFFER);
    }
}
