//! Canonical record store shared by both assemblers and the resolver.
//!
//! The store holds three index families (by TEID, by IP, by identity) plus
//! slice membership sets and per-IP activity. Every write is a field-level
//! merge applied atomically for its key; no operation replaces a whole
//! record. A backend that cannot be reached fails the single call with
//! [`StoreError::Unavailable`] and never retries.

mod memory;
mod records;

use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::codec::{SliceKey, Teid, is_known_ip};
use crate::error::StoreError;

pub use memory::MemoryStore;
pub use records::{
    ReverseIndex, StoreKey, SubscriberPatch, SubscriberRecord, TeidPatch, TeidRecord, field,
};

/// Result of a single store operation.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Per-IP TEID membership and activity (`ueip:<ip>:teids`, `ueip:<ip>`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpActivity {
    pub teids: BTreeSet<Teid>,
    pub last_seen: Option<u64>,
}

/// Persisted-record retention. Zero disables it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub record_ttl_secs: u64,
}

impl RetentionPolicy {
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.record_ttl_secs > 0
    }

    /// Whether a record last seen at `last_seen` is stale at `now`.
    /// Records without a timestamp are never stale.
    #[must_use]
    pub const fn is_stale(&self, last_seen: Option<u64>, now: u64) -> bool {
        match last_seen {
            Some(seen) if self.is_enabled() => now.saturating_sub(seen) > self.record_ttl_secs,
            _ => false,
        }
    }
}

/// Outcome of a retention sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    pub teid_records: usize,
    pub subscriber_records: usize,
    pub reverse_entries: usize,
}

impl RetentionReport {
    #[must_use]
    pub const fn total(&self) -> usize {
        self.teid_records + self.subscriber_records + self.reverse_entries
    }
}

/// Keyed store with per-key atomic field merges.
pub trait RecordStore: Send + Sync {
    /// Merge `patch` into `teid:<teid>`, creating it if absent.
    /// Returns the record as stored after the merge.
    fn merge_teid_record(&self, teid: Teid, patch: &TeidPatch) -> StoreResult<TeidRecord>;

    /// Merge `patch` into `ue:<identity>`, creating it if absent.
    fn merge_subscriber_record(
        &self,
        identity: &str,
        patch: &SubscriberPatch,
    ) -> StoreResult<SubscriberRecord>;

    /// Set a scalar pointer, replacing any previous value.
    fn set_reverse_index(&self, kind: ReverseIndex, key: &str, value: &str) -> StoreResult<()>;

    fn get_teid(&self, teid: Teid) -> StoreResult<Option<TeidRecord>>;

    fn get_reverse_index(&self, kind: ReverseIndex, key: &str) -> StoreResult<Option<String>>;

    fn get_subscriber(&self, identity: &str) -> StoreResult<Option<SubscriberRecord>>;

    /// Every TEID record, ordered by TEID.
    fn all_teid_records(&self) -> StoreResult<Vec<(Teid, TeidRecord)>>;

    /// Member identities of `slice:<sst>:<sd>`.
    fn slice_members(&self, slice: &SliceKey) -> StoreResult<BTreeSet<String>>;

    /// Population path for slice sets, owned by an external collaborator.
    fn add_slice_member(&self, slice: &SliceKey, identity: &str) -> StoreResult<()>;

    /// Add `teid` to `ueip:<ip>:teids`.
    fn add_ip_teid(&self, ip: &str, teid: Teid) -> StoreResult<()>;

    /// Stamp `ueip:<ip>` with `now`.
    fn touch_ip(&self, ip: &str, now: u64) -> StoreResult<()>;

    fn ip_activity(&self, ip: &str) -> StoreResult<Option<IpActivity>>;

    /// Delete `teid:<teid>`. Returns whether it existed.
    fn remove_teid(&self, teid: Teid) -> StoreResult<bool>;

    /// Delete `ue:<identity>`. Returns whether it existed.
    fn remove_subscriber(&self, identity: &str) -> StoreResult<bool>;

    /// Delete records whose `last_seen` is older than the retention TTL.
    fn sweep_stale(&self, now: u64) -> StoreResult<RetentionReport>;

    /// Cheap reachability probe.
    fn is_available(&self) -> bool;
}

/// Current wall-clock time in unix seconds.
#[must_use]
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}

/// First candidate that is a real address.
pub fn preferred_ip<'a, I>(candidates: I) -> Option<&'a str>
where
    I: IntoIterator<Item = Option<&'a str>>,
{
    candidates.into_iter().flatten().find(|ip| is_known_ip(ip))
}
