//! Cooperative cancellation.
//!
//! A [`Cancel`] merges the reader-level token with an optional per-call token
//! ("any signals abort") and is threaded through every substrate read and
//! codec loop. Sync decode loops re-check via [`CancelCounter`] at least once
//! per 16 KiB of bytes processed.

use tokio_util::sync::CancellationToken;

use crate::error::{ArchiveError, Result};

/// Bytes processed between cancellation checks in tight decode loops.
pub const CHECK_INTERVAL_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, Default)]
pub struct Cancel {
    tokens: Vec<CancellationToken>,
}

impl Cancel {
    /// A handle that never cancels.
    pub fn none() -> Self {
        Cancel::default()
    }

    pub fn from_token(token: CancellationToken) -> Self {
        Cancel {
            tokens: vec![token],
        }
    }

    /// Merge with a per-call token; either side firing cancels the result.
    pub fn merged(&self, other: Option<CancellationToken>) -> Self {
        let mut tokens = self.tokens.clone();
        tokens.extend(other);
        Cancel { tokens }
    }

    /// Merge two handles ("any signals abort").
    pub fn merge_with(&self, other: &Cancel) -> Self {
        let mut tokens = self.tokens.clone();
        tokens.extend(other.tokens.iter().cloned());
        Cancel { tokens }
    }

    pub fn is_cancelled(&self) -> bool {
        self.tokens.iter().any(CancellationToken::is_cancelled)
    }

    /// Fail with the dedicated cancelled error if any token has fired.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(ArchiveError::cancelled())
        } else {
            Ok(())
        }
    }
}

/// Amortized cancellation checks for synchronous byte loops.
pub struct CancelCounter {
    cancel: Cancel,
    since_check: usize,
}

impl CancelCounter {
    pub fn new(cancel: Cancel) -> Self {
        CancelCounter {
            cancel,
            since_check: 0,
        }
    }

    /// Account for `bytes` of work; checks the token once per 16 KiB.
    pub fn step(&mut self, bytes: usize) -> Result<()> {
        self.since_check = self.since_check.saturating_add(bytes);
        if self.since_check >= CHECK_INTERVAL_BYTES {
            self.since_check = 0;
            self.cancel.check()?;
        }
        Ok(())
    }
}
