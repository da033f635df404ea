//! Device reset escalation.
//!
//! The datapath never resets the device itself. It latches a reason into a
//! shared `ResetSignal` (first reason wins, later ones are ignored until the
//! device-management layer clears it) and returns a `ResetRequest` from the
//! call that detected the problem.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResetReason {
    Unknown = 1,
    TooManyRxDescs = 2,
    MalformedRxDescriptor = 3,
    InvalidRxReqId = 4,
    InvalidTxReqId = 5,
    DriverInvalidState = 6,
    MissingTxCompletion = 7,
}

impl ResetReason {
    fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => Self::Unknown,
            2 => Self::TooManyRxDescs,
            3 => Self::MalformedRxDescriptor,
            4 => Self::InvalidRxReqId,
            5 => Self::InvalidTxReqId,
            6 => Self::DriverInvalidState,
            7 => Self::MissingTxCompletion,
            _ => return None,
        })
    }
}

impl fmt::Display for ResetReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::TooManyRxDescs => "too many rx descriptors",
            Self::MalformedRxDescriptor => "malformed rx descriptor",
            Self::InvalidRxReqId => "invalid rx request id",
            Self::InvalidTxReqId => "invalid tx request id",
            Self::DriverInvalidState => "driver invalid state",
            Self::MissingTxCompletion => "missing tx completions",
        };
        f.write_str(s)
    }
}

/// Returned by a burst that detected device/ring desynchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("device reset requested: {reason}")]
pub struct ResetRequest {
    reason: ResetReason,
}

impl ResetRequest {
    pub fn reason(&self) -> ResetReason {
        self.reason
    }
}

/// Shared, latched reset flag. Clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct ResetSignal {
    state: Arc<AtomicU8>,
}

impl ResetSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch `reason` unless a reset is already pending. Always returns a
    /// request carrying `reason` for the caller to propagate.
    pub fn trigger(&self, reason: ResetReason) -> ResetRequest {
        match self.state.compare_exchange(0, reason as u8, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => tracing::error!(%reason, "device reset requested"),
            Err(prev) => tracing::debug!(
                %reason,
                pending = ?ResetReason::from_u8(prev),
                "reset already pending"
            ),
        }
        ResetRequest { reason }
    }

    /// Pending reason, if any.
    pub fn pending(&self) -> Option<ResetReason> {
        ResetReason::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Take the pending reason, clearing the latch.
    pub fn clear(&self) -> Option<ResetReason> {
        ResetReason::from_u8(self.state.swap(0, Ordering::AcqRel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_reason_wins() {
        let sig = ResetSignal::new();
        assert_eq!(sig.pending(), None);
        let r = sig.trigger(ResetReason::InvalidTxReqId);
        assert_eq!(r.reason(), ResetReason::InvalidTxReqId);
        let r2 = sig.clone().trigger(ResetReason::MissingTxCompletion);
        assert_eq!(r2.reason(), ResetReason::MissingTxCompletion);
        assert_eq!(sig.pending(), Some(ResetReason::InvalidTxReqId));
    }

    #[test]
    fn test_clear() {
        let sig = ResetSignal::new();
        sig.trigger(ResetReason::Unknown);
        assert_eq!(sig.clear(), Some(ResetReason::Unknown));
        assert_eq!(sig.pending(), None);
        sig.trigger(ResetReason::TooManyRxDescs);
        assert_eq!(sig.pending(), Some(ResetReason::TooManyRxDescs));
    }
}
