//! Coarse cancellation for a whole publish or update invocation.
//!
//! The deadline is only consulted at operation boundaries; it never interrupts
//! a remote command or a file copy that is already running.

use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("{operation} canceled: deadline exceeded")]
pub struct Cancelled {
    pub operation: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Deadline {
    expires_at: Option<Instant>,
}

impl Deadline {
    /// A deadline that never expires.
    pub fn none() -> Self {
        Self { expires_at: None }
    }

    pub fn after(timeout: Duration) -> Self {
        Self::at(Instant::now() + timeout)
    }

    pub fn at(instant: Instant) -> Self {
        Self {
            expires_at: Some(instant),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn check(&self, operation: &str) -> Result<(), Cancelled> {
        if self.is_expired() {
            return Err(Cancelled {
                operation: operation.to_string(),
            });
        }
        Ok(())
    }
}
