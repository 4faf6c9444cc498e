//! Request-scoped operation context.
//!
//! Every store call takes an [`OpContext`] carrying the namespace, the lease
//! protecting the operation's working set, an optional deadline, and a
//! cancellation signal shared by all contexts derived from the same root.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use cask_core::error::{CaskError, Result};
use tokio::sync::watch;
use tokio::time::Instant;

/// Operation context.
#[derive(Clone)]
pub struct OpContext {
    namespace: Arc<str>,
    lease: Option<String>,
    deadline: Option<Instant>,
    canceled: watch::Receiver<bool>,
    _sender: Arc<watch::Sender<bool>>,
}

/// Cancels every context derived from the root it was created with.
#[derive(Clone)]
pub struct CancelHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.sender.send(true);
    }
}

impl OpContext {
    /// New root context for `namespace`.
    pub fn new(namespace: &str) -> Self {
        Self::with_cancel(namespace).0
    }

    /// New root context plus a handle that cancels it.
    pub fn with_cancel(namespace: &str) -> (Self, CancelHandle) {
        let (sender, canceled) = watch::channel(false);
        let sender = Arc::new(sender);
        let ctx = Self {
            namespace: Arc::from(namespace),
            lease: None,
            deadline: None,
            canceled,
            _sender: sender.clone(),
        };
        (ctx, CancelHandle { sender })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn lease(&self) -> Option<&str> {
        self.lease.as_deref()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Child context whose writes are attached to `lease`.
    pub fn with_lease(&self, lease: impl Into<String>) -> Self {
        Self {
            lease: Some(lease.into()),
            ..self.clone()
        }
    }

    /// Child context that expires after `timeout` (or earlier, if the parent does).
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        Self {
            deadline: Some(self.deadline.map_or(deadline, |d| d.min(deadline))),
            ..self.clone()
        }
    }

    pub fn is_canceled(&self) -> bool {
        *self.canceled.borrow()
    }

    /// Fail fast if the context is canceled or past its deadline.
    pub fn check(&self) -> Result<()> {
        if self.is_canceled() {
            return Err(CaskError::Canceled(self.namespace.to_string()));
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(CaskError::DeadlineExceeded(self.namespace.to_string()));
            }
        }
        Ok(())
    }

    /// Run `fut`, racing it against cancellation and the deadline.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;
        let deadline = async {
            match self.deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            result = fut => result,
            _ = self.wait_canceled() => Err(CaskError::Canceled(self.namespace.to_string())),
            _ = deadline => Err(CaskError::DeadlineExceeded(self.namespace.to_string())),
        }
    }

    async fn wait_canceled(&self) {
        let mut rx = self.canceled.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl std::fmt::Debug for OpContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpContext")
            .field("namespace", &self.namespace)
            .field("lease", &self.lease)
            .field("deadline", &self.deadline)
            .finish()
    }
}
