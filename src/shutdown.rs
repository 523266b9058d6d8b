//! Cancellation coordination utilities.
//!
//! Provides a lightweight [`ShutdownCoordinator`] that is shared across tasks
//! to propagate Ctrl+C, error-budget trips and instance aborts to every
//! suspension point of an export run without corrupting the resume ledger or
//! leaving partially written archives behind.
//!
//! A coordinator may have a parent. A child scope is cancelled when either it
//! or its parent is cancelled, which lets one instance abort on repeated disk
//! errors while the rest of the run continues.

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Shared handle to a shutdown coordinator.
pub type SharedShutdown = Arc<ShutdownCoordinator>;

/// Why a scope was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// Interrupt signal from the operator (Ctrl+C / SIGTERM)
    Signal,
    /// Failure ratio exceeded the configured error budget
    ErrorBudget,
    /// Consecutive local disk failures on one instance
    InstanceAborted,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Signal => write!(f, "interrupted by signal"),
            CancelReason::ErrorBudget => write!(f, "error budget exceeded"),
            CancelReason::InstanceAborted => write!(f, "instance aborted after repeated disk errors"),
        }
    }
}

/// Coordinates cancellation across async tasks.
#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
    is_shutdown: AtomicBool,
    reason: OnceCell<CancelReason>,
    notify: Notify,
    parent: Option<SharedShutdown>,
}

impl ShutdownCoordinator {
    /// Create a new root coordinator.
    pub fn new() -> Self {
        Self {
            is_shutdown: AtomicBool::new(false),
            reason: OnceCell::new(),
            notify: Notify::new(),
            parent: None,
        }
    }

    /// Create a new shared coordinator wrapped in [`Arc`].
    pub fn shared() -> SharedShutdown {
        Arc::new(Self::new())
    }

    /// Create a child scope that also observes this coordinator.
    ///
    /// Cancelling the child never cancels the parent.
    pub fn child(self: &Arc<Self>) -> SharedShutdown {
        Arc::new(Self {
            parent: Some(Arc::clone(self)),
            ..Self::new()
        })
    }

    /// Request cancellation. The first reason wins; waiters are notified once.
    pub fn cancel(&self, reason: CancelReason) {
        let _ = self.reason.set(reason);
        if !self.is_shutdown.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    /// Request shutdown because of an operator signal.
    pub fn request_shutdown(&self) {
        self.cancel(CancelReason::Signal);
    }

    /// Whether this scope or any ancestor has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.is_shutdown.load(Ordering::SeqCst)
            || self.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }

    /// Reason for cancellation, preferring this scope over its parent.
    pub fn reason(&self) -> Option<CancelReason> {
        self.reason
            .get()
            .copied()
            .or_else(|| self.parent.as_ref().and_then(|p| p.reason()))
    }

    /// Wait until this scope or an ancestor is cancelled. Returns immediately if already set.
    pub async fn cancelled(&self) {
        match &self.parent {
            Some(parent) => {
                tokio::select! {
                    _ = self.wait_local() => {}
                    _ = Box::pin(parent.cancelled()) => {}
                }
            }
            None => self.wait_local().await,
        }
    }

    async fn wait_local(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent cancel is not missed.
        notified.as_mut().enable();
        if self.is_shutdown.load(Ordering::SeqCst) {
            return;
        }
        notified.await;
    }
}
