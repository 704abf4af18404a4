//! Completion reconciliation
//!
//! Merges the transfer-level code and the multiplexer-level code reported for
//! one finished session into a single classified [`Outcome`].
//!
//! Policy:
//! - a non-zero multiplexer code wins, origin = [`Origin::Multi`]
//! - otherwise the transfer code is authoritative, origin = [`Origin::Transfer`]
//! - success only when both codes are zero

use crate::engine::{MultiCode, TransferCode};
use serde::Serialize;
use std::fmt;

/// Which layer produced the authoritative code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Transfer,
    Multi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Success,
    Failure,
}

/// Terminal result of one transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Outcome {
    pub origin: Origin,
    pub code: i64,
    pub classification: Classification,
}

impl Outcome {
    /// Build an outcome from an already reconciled code
    pub fn new(code: i64, origin: Origin) -> Self {
        let classification = if code == 0 {
            Classification::Success
        } else {
            Classification::Failure
        };

        Self {
            origin,
            code,
            classification,
        }
    }

    pub fn is_success(&self) -> bool {
        self.classification == Classification::Success
    }

    pub fn is_multi_originated(&self) -> bool {
        self.origin == Origin::Multi
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.classification, self.origin) {
            (Classification::Success, _) => write!(f, "ok"),
            (Classification::Failure, Origin::Transfer) => {
                write!(f, "transfer error {}", self.code)
            }
            (Classification::Failure, Origin::Multi) => {
                write!(f, "multiplexer error {}", self.code)
            }
        }
    }
}

/// Reconcile the two codes reported for a finished session
pub fn reconcile(transfer: TransferCode, multi: MultiCode) -> Outcome {
    if !multi.is_ok() {
        return Outcome::new(multi.0, Origin::Multi);
    }

    Outcome::new(transfer.0, Origin::Transfer)
}
