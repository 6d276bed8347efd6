/*!
 * Execution Context
 * Per-call deadline and cancellation, raced natively against the run future
 */

use crate::core::errors::SandboxError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Why a context fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    DeadlineExceeded,
    Cancelled,
}

impl Interrupt {
    pub fn into_error(self, what: &str) -> SandboxError {
        match self {
            Interrupt::DeadlineExceeded => {
                SandboxError::Timeout(format!("{} exceeded its deadline", what))
            }
            Interrupt::Cancelled => SandboxError::Cancelled(format!("{} was cancelled", what)),
        }
    }
}

/// Caller-held cancellation handle
///
/// Clones share state; cancelling any clone cancels them all.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `cancel` has been called
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // wait_for checks the current value first
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Deadline plus cancellation for one call
#[derive(Debug, Clone, Default)]
pub struct ExecContext {
    deadline: Option<Instant>,
    cancel: Option<CancelToken>,
}

impl ExecContext {
    /// Context that never fires
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::background().timeout(timeout)
    }

    /// Narrow the deadline; an earlier existing deadline is kept
    ///
    /// A timeout too large to represent as an instant sets no deadline.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        let Some(candidate) = Instant::now().checked_add(timeout) else {
            return self;
        };
        self.deadline = Some(match self.deadline {
            Some(existing) if existing <= candidate => existing,
            _ => candidate,
        });
        self
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Already fired, without waiting
    pub fn interrupted(&self) -> Option<Interrupt> {
        if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            return Some(Interrupt::Cancelled);
        }
        match self.deadline {
            Some(deadline) if deadline <= Instant::now() => Some(Interrupt::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves when the deadline passes or the token is cancelled; never otherwise
    pub async fn done(&self) -> Interrupt {
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        let cancelled = async {
            match &self.cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancelled => Interrupt::Cancelled,
            _ = deadline => Interrupt::DeadlineExceeded,
        }
    }

    /// Race `fut` against the context
    pub async fn run_until_done<F, T>(&self, fut: F) -> Result<T, Interrupt>
    where
        F: Future<Output = T>,
    {
        if let Some(interrupt) = self.interrupted() {
            return Err(interrupt);
        }
        tokio::select! {
            out = fut => Ok(out),
            interrupt = self.done() => Err(interrupt),
        }
    }
}
