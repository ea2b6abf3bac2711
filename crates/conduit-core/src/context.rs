//! Per-call cancellation and deadline token.

use crate::error::Error;
use http::Extensions;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Cancellation signal, optional deadline and typed values for one call.
///
/// Clones share the cancellation signal: canceling any of them cancels all.
/// Deadlines only ever tighten.
#[derive(Clone, Debug)]
pub struct CallContext {
    deadline: Option<Instant>,
    canceled: watch::Receiver<bool>,
    canceler: Arc<watch::Sender<bool>>,
    extensions: Extensions,
}

impl CallContext {
    pub fn new() -> Self {
        let (canceler, canceled) = watch::channel(false);
        Self {
            deadline: None,
            canceled,
            canceler: Arc::new(canceler),
            extensions: Extensions::new(),
        }
    }

    /// Apply a deadline, keeping the earlier one if already set.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    /// Apply a deadline `timeout` from now. A timeout too large to
    /// represent as an instant leaves the call unbounded.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.with_deadline(deadline),
            None => self,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, zero once it has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn cancel(&self) {
        self.canceler.send_replace(true);
    }

    pub fn is_canceled(&self) -> bool {
        *self.canceled.borrow()
    }

    /// Why the call can no longer proceed, if it can't.
    pub fn err(&self) -> Option<Error> {
        if self.is_canceled() {
            return Some(Error::canceled());
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(Error::deadline_exceeded()),
            _ => None,
        }
    }

    /// Resolve once the call is canceled or its deadline passes.
    pub async fn done(&self) -> Error {
        let mut canceled = self.canceled.clone();
        let wait_canceled = async move {
            if canceled.wait_for(|canceled| *canceled).await.is_err() {
                std::future::pending::<()>().await;
            }
        };
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = wait_canceled => Error::canceled(),
                _ = tokio::time::sleep_until(deadline) => Error::deadline_exceeded(),
            },
            None => {
                wait_canceled.await;
                Error::canceled()
            }
        }
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}
