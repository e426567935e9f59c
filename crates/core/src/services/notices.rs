//! User-facing notices per transaction state.

use serde::{Deserialize, Serialize};

use crate::models::TransactionState;

/// Title and description shown for a transaction state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub title: String,
    pub description: String,
}

impl Notice {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
        }
    }
}

/// Partial override of a [`Notice`]. Unset fields keep the default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoticeOverride {
    pub title: Option<String>,
    pub description: Option<String>,
}

/// Caller overrides for each non-idle state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoticeOverrides {
    #[serde(default)]
    pub pending: NoticeOverride,
    #[serde(default)]
    pub mining: NoticeOverride,
    #[serde(default)]
    pub mined: NoticeOverride,
    #[serde(default)]
    pub failed: NoticeOverride,
}

/// Notices for every non-idle state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionNotices {
    pub pending: Notice,
    pub mining: Notice,
    pub mined: Notice,
    pub failed: Notice,
}

impl Default for TransactionNotices {
    fn default() -> Self {
        Self {
            pending: Notice::new("Transaction pending", "Your transaction is pending to be signed"),
            mining: Notice::new("Transaction mining", "Your transaction was sent to the blockchain"),
            mined: Notice::new("Transaction mined", "Your transaction was mined by a miner"),
            failed: Notice::new("Transaction failed", "Your transaction failed to be transacted"),
        }
    }
}

impl TransactionNotices {
    /// Defaults with `overrides` applied field by field.
    pub fn compose(overrides: &NoticeOverrides) -> Self {
        let defaults = Self::default();
        Self {
            pending: apply(defaults.pending, &overrides.pending),
            mining: apply(defaults.mining, &overrides.mining),
            mined: apply(defaults.mined, &overrides.mined),
            failed: apply(defaults.failed, &overrides.failed),
        }
    }

    /// Notice for `state`. Nothing is shown while idle.
    pub fn for_state(&self, state: TransactionState) -> Option<&Notice> {
        match state {
            TransactionState::Idle => None,
            TransactionState::Pending => Some(&self.pending),
            TransactionState::Mining => Some(&self.mining),
            TransactionState::Mined => Some(&self.mined),
            TransactionState::Failed => Some(&self.failed),
        }
    }
}

fn apply(notice: Notice, overrides: &NoticeOverride) -> Notice {
    Notice {
        title: overrides.title.clone().unwrap_or(notice.title),
        description: overrides.description.clone().unwrap_or(notice.description),
    }
}
