use crate::error::FleetError;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Cooperative cancellation shared by every thread of one `execute`/`check_health` call.
///
/// Tokens derived with [`CancelToken::child_with_timeout`] share the cancel flag with their
/// parent and add a deadline of their own.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
    deadline: Option<Instant>,
}

#[derive(Debug, Default)]
struct Inner {
    cancelled: Mutex<bool>,
    wake: Condvar,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let mut cancelled = self
            .inner
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *cancelled = true;
        self.inner.wake.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.check().is_err()
    }

    pub fn check(&self) -> Result<(), FleetError> {
        if *self
            .inner
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
        {
            return Err(FleetError::Cancelled);
        }
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(FleetError::DeadlineExceeded);
        }
        Ok(())
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        };
        Self {
            inner: Arc::clone(&self.inner),
            deadline: Some(deadline),
        }
    }

    /// Sleeps for `duration`, waking early on cancellation or deadline.
    pub fn sleep(&self, duration: Duration) -> Result<(), FleetError> {
        let until = Instant::now() + duration;
        let mut cancelled = self
            .inner
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if *cancelled {
                return Err(FleetError::Cancelled);
            }
            let now = Instant::now();
            if self.deadline.is_some_and(|deadline| now >= deadline) {
                return Err(FleetError::DeadlineExceeded);
            }
            if now >= until {
                return Ok(());
            }
            let mut wait = until - now;
            if let Some(remaining) = self.remaining() {
                wait = wait.min(remaining);
            }
            let (guard, _) = self
                .inner
                .wake
                .wait_timeout(cancelled, wait)
                .unwrap_or_else(PoisonError::into_inner);
            cancelled = guard;
        }
    }
}
