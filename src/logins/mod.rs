//! Login event aggregation and its write-back into the store.

pub mod aggregator;
pub mod cleanup;
pub mod writeback;

pub use aggregator::Aggregator;
pub use cleanup::CleanupScheduler;
pub use writeback::{WriteBackHandle, WriteBackQueue, WriteBackWorker};

use crate::store::loginstats::NETHASH_UNDEFINED;
use std::fmt;

/// A (network, IdP) pair that login counts are aggregated under.
///
/// `nethash` is `None` when the requester's network could not be
/// determined; such logins only feed the global ranking.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LoginKey {
    pub nethash: Option<u16>,
    pub entity_id: String,
}

impl LoginKey {
    pub fn new(nethash: Option<u16>, entity_id: impl Into<String>) -> Self {
        Self {
            nethash,
            entity_id: entity_id.into(),
        }
    }

    /// Value of the `iphash` column for this key
    pub fn iphash(&self) -> i64 {
        self.nethash.map(i64::from).unwrap_or(NETHASH_UNDEFINED)
    }
}

impl fmt::Display for LoginKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.nethash {
            Some(hash) => write!(f, "{}#{}", self.entity_id, hash),
            None => write!(f, "{}#undefined", self.entity_id),
        }
    }
}

/// Count handed from the aggregator to the write-back worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginCount {
    pub key: LoginKey,
    pub count: u32,
}
