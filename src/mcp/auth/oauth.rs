//! Single-shot OAuth completion signal
//!
//! When a connect attempt hits an authentication challenge the connection
//! arms an [`OAuthSignal`] and waits on the returned [`OAuthWaiter`]. The
//! code that completes the OAuth flow out of band resolves the signal
//! exactly once with an [`OAuthOutcome`]. The wait is bounded by a timeout;
//! nothing is left registered when it ends.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::McpConnError;

/// Result of an out-of-band OAuth flow.
#[derive(Debug, Clone)]
pub enum OAuthOutcome {
    /// The flow completed; any token has already been installed
    Handled,
    /// The flow failed with this error
    Failed(McpConnError),
}

/// How a wait ended.
#[derive(Debug)]
pub enum OAuthWait {
    /// The signal was resolved
    Resolved(OAuthOutcome),
    /// Nothing arrived within the timeout
    TimedOut,
    /// The signal was re-armed or dropped without a result
    Abandoned,
}

/// Sender side, held by the connection.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use mcpconn::mcp::auth::oauth::{OAuthOutcome, OAuthSignal, OAuthWait};
///
/// # tokio_test::block_on(async {
/// let signal = OAuthSignal::default();
/// let waiter = signal.arm();
/// assert!(signal.resolve(OAuthOutcome::Handled));
/// assert!(matches!(
///     waiter.wait(Duration::from_secs(1)).await,
///     OAuthWait::Resolved(OAuthOutcome::Handled)
/// ));
/// # });
/// ```
#[derive(Debug, Default)]
pub struct OAuthSignal {
    pending: Mutex<Option<oneshot::Sender<OAuthOutcome>>>,
}

/// Receiver side, awaited by the suspended connect.
#[derive(Debug)]
pub struct OAuthWaiter {
    rx: oneshot::Receiver<OAuthOutcome>,
}

impl OAuthSignal {
    /// Arm the signal. A previous waiter, if any, is abandoned.
    pub fn arm(&self) -> OAuthWaiter {
        let (tx, rx) = oneshot::channel();
        *self.lock() = Some(tx);
        OAuthWaiter { rx }
    }

    /// Deliver `outcome` to the armed waiter.
    ///
    /// Returns `false` when nothing is waiting.
    pub fn resolve(&self, outcome: OAuthOutcome) -> bool {
        match self.lock().take() {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Drop the armed sender without resolving.
    pub fn disarm(&self) {
        self.lock().take();
    }

    /// Returns `true` while a waiter is armed.
    pub fn is_armed(&self) -> bool {
        self.lock().is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<oneshot::Sender<OAuthOutcome>>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl OAuthWaiter {
    /// Wait up to `timeout` for the outcome.
    pub async fn wait(self, timeout: Duration) -> OAuthWait {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(outcome)) => OAuthWait::Resolved(outcome),
            Ok(Err(_)) => OAuthWait::Abandoned,
            Err(_) => OAuthWait::TimedOut,
        }
    }
}
