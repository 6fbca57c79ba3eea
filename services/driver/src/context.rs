//! Request-scoped context: correlation id, deadline and cancellation.
//!
//! Every infrastructure call goes through [`RequestContext::call`], which
//! stops waiting as soon as the caller cancels or the deadline passes.
//! Abandoned calls are not rolled back on the API side.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use ulid::Ulid;

use crate::error::DriverError;
use crate::infra::ApiError;

/// Correlation id, deadline and cancellation of one driver call.
#[derive(Debug, Clone)]
pub struct RequestContext {
    request_id: String,
    deadline: Option<Instant>,
    cancel: Option<watch::Receiver<bool>>,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestContext {
    /// A context with a fresh request id, no deadline and no cancellation.
    pub fn new() -> Self {
        Self {
            request_id: Ulid::new().to_string(),
            deadline: None,
            cancel: None,
        }
    }

    /// Use a caller-supplied request id.
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    /// Fail calls once `timeout` has elapsed from now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Fail calls once `deadline` has passed. An earlier deadline wins.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    /// Fail calls once `true` is sent on the channel.
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Correlation id for log lines of this call.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// The effective deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns true if cancellation has already been signalled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Run one infrastructure call under this context.
    pub async fn call<T, F>(&self, operation: F) -> Result<T, DriverError>
    where
        F: Future<Output = Result<T, ApiError>>,
    {
        let mut cancel = self.cancel.clone();
        let cancelled = async move {
            let Some(rx) = cancel.as_mut() else {
                return std::future::pending::<()>().await;
            };
            loop {
                if *rx.borrow_and_update() {
                    return;
                }
                if rx.changed().await.is_err() {
                    // Sender gone without cancelling: nothing can cancel us now.
                    return std::future::pending::<()>().await;
                }
            }
        };

        let deadline = self.deadline;
        let expired = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancelled => Err(DriverError::Cancelled),
            _ = expired => Err(DriverError::DeadlineExceeded),
            result = operation => result.map_err(DriverError::from),
        }
    }
}
