//! Per-call request context: purpose, caller, deadline, idempotency key.
//!
//! Every vault operation takes a [`RequestContext`] explicitly; nothing about
//! the caller is kept in global state.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Purpose code accompanying every access ("reason").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Reason(String);

impl Reason {
    /// Parse a reason. Blank reasons are rejected.
    pub fn new(reason: impl Into<String>) -> Result<Self> {
        let reason = reason.into();
        let trimmed = reason.trim();
        if trimmed.is_empty() {
            return Err(Error::Validation("reason is required".into()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Authenticated caller, established before the call reaches the vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallerIdentity(String);

impl CallerIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Point in time after which an operation must give up.
#[derive(Debug, Clone, Copy, Default)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// No deadline.
    pub fn none() -> Self {
        Self(None)
    }

    /// Deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Self(Some(Instant::now() + timeout))
    }

    /// Time left, or `None` when unbounded. Zero once expired.
    pub fn remaining(&self) -> Option<Duration> {
        self.0
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        matches!(self.remaining(), Some(d) if d.is_zero())
    }

    /// Fail with `Unavailable` once the deadline has passed.
    pub fn check(&self, what: &str) -> Result<()> {
        if self.is_expired() {
            return Err(Error::Unavailable(format!("deadline exceeded during {}", what)));
        }
        Ok(())
    }
}

/// Everything a vault operation needs to know about who is asking and why.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub reason: Reason,
    pub caller: CallerIdentity,
    pub deadline: Deadline,
    /// Makes a retried write return the first outcome instead of applying twice.
    pub idempotency_key: Option<String>,
}

impl RequestContext {
    pub fn new(reason: Reason, caller: CallerIdentity) -> Self {
        Self {
            reason,
            caller,
            deadline: Deadline::none(),
            idempotency_key: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Deadline::after(timeout))
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}
