use std::sync::OnceLock;

use tokio_util::sync::CancellationToken;

use crate::core::domain::LimitKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Limit(LimitKind),
    Abandoned,
}

/// Cancellation signal for one run together with the reason it was raised.
///
/// Only the first reason is kept, later trips still cancel but are ignored.
#[derive(Debug, Default)]
pub struct RunCancellation {
    token: CancellationToken,
    reason: OnceLock<CancelReason>,
}

impl RunCancellation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `reason` and cancels. Returns whether this call set the reason.
    pub fn trip(&self, reason: CancelReason) -> bool {
        let won = self.reason.set(reason).is_ok();
        self.token.cancel();
        won
    }

    pub fn reason(&self) -> Option<CancelReason> {
        self.reason.get().copied()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}
