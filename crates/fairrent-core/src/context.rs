//! Caller-supplied cancellation for scheduler operations.
//!
//! A [`CallContext`] is only consulted while waiting for the queue lock.
//! Once the lock is held the operation runs to completion, so a cancelled
//! call either has no effect at all or has fully applied.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{SchedulerError, SchedulerResult};

/// Upper bound on a single lock wait between cancellation checks.
const LOCK_POLL_SLICE: Duration = Duration::from_millis(1);

/// Shared flag a caller flips to abandon pending operations.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Clone, Debug, Default)]
pub struct CallContext {
    deadline: Option<Instant>,
    tokens: Vec<CancelToken>,
}

impl CallContext {
    /// A context that never cancels.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Adds a token; the call is cancelled when any of its tokens fires.
    pub fn with_token(mut self, token: CancelToken) -> Self {
        self.tokens.push(token);
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Fails if any token fired or the deadline passed.
    pub fn check(&self) -> SchedulerResult<()> {
        if self.tokens.iter().any(CancelToken::is_cancelled) {
            return Err(SchedulerError::Cancelled);
        }
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(SchedulerError::DeadlineExceeded);
        }
        Ok(())
    }

    fn is_unbounded(&self) -> bool {
        self.deadline.is_none() && self.tokens.is_empty()
    }

    fn next_slice(&self) -> Duration {
        match self.deadline {
            Some(deadline) => deadline
                .saturating_duration_since(Instant::now())
                .min(LOCK_POLL_SLICE),
            None => LOCK_POLL_SLICE,
        }
    }

    pub(crate) fn write<'a, T>(
        &self,
        lock: &'a RwLock<T>,
    ) -> SchedulerResult<RwLockWriteGuard<'a, T>> {
        self.check()?;
        if self.is_unbounded() {
            return Ok(lock.write());
        }
        loop {
            if let Some(guard) = lock.try_write_for(self.next_slice()) {
                return Ok(guard);
            }
            self.check()?;
        }
    }

    pub(crate) fn read<'a, T>(
        &self,
        lock: &'a RwLock<T>,
    ) -> SchedulerResult<RwLockReadGuard<'a, T>> {
        self.check()?;
        if self.is_unbounded() {
            return Ok(lock.read());
        }
        loop {
            if let Some(guard) = lock.try_read_for(self.next_slice()) {
                return Ok(guard);
            }
            self.check()?;
        }
    }
}
