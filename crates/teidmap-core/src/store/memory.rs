//! In-process [`RecordStore`] backend.
//!
//! Each key family is its own [`ShardedMap`]; a merge takes exactly one
//! shard write lock, which is what makes it atomic for its key.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, warn};

use super::{
    IpActivity, RecordStore, RetentionPolicy, RetentionReport, ReverseIndex, StoreResult,
    SubscriberPatch, SubscriberRecord, TeidPatch, TeidRecord,
};
use crate::codec::{SliceKey, Teid};
use crate::concurrent_map::{DEFAULT_SHARDS, ShardedMap};
use crate::error::StoreError;

/// Sharded in-memory store.
#[derive(Debug)]
pub struct MemoryStore {
    teids: ShardedMap<Teid, TeidRecord>,
    subscribers: ShardedMap<String, SubscriberRecord>,
    pointers: ShardedMap<(ReverseIndex, String), String>,
    slices: ShardedMap<SliceKey, BTreeSet<String>>,
    ip_activity: ShardedMap<String, IpActivity>,
    retention: RetentionPolicy,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_SHARDS, RetentionPolicy::default())
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new(shards: usize, retention: RetentionPolicy) -> Self {
        Self {
            teids: ShardedMap::with_shards(shards),
            subscribers: ShardedMap::with_shards(shards),
            pointers: ShardedMap::with_shards(shards),
            slices: ShardedMap::with_shards(shards),
            ip_activity: ShardedMap::with_shards(shards),
            retention,
            available: AtomicBool::new(true),
        }
    }

    #[must_use]
    pub fn retention(&self) -> RetentionPolicy {
        self.retention
    }

    /// Simulate the backend going away or coming back.
    pub fn set_available(&self, available: bool) {
        let was = self.available.swap(available, Ordering::SeqCst);
        if was != available {
            if available {
                debug!("record store available");
            } else {
                warn!("record store marked unavailable");
            }
        }
    }

    fn check(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable)
        }
    }

    fn pointer_key(kind: ReverseIndex, key: &str) -> (ReverseIndex, String) {
        (kind, key.to_string())
    }
}

impl RecordStore for MemoryStore {
    fn merge_teid_record(&self, teid: Teid, patch: &TeidPatch) -> StoreResult<TeidRecord> {
        self.check()?;
        Ok(self.teids.upsert_with(teid, TeidRecord::default, |record| {
            record.apply(patch);
            record.clone()
        }))
    }

    fn merge_subscriber_record(
        &self,
        identity: &str,
        patch: &SubscriberPatch,
    ) -> StoreResult<SubscriberRecord> {
        self.check()?;
        Ok(self
            .subscribers
            .upsert_with(identity.to_string(), SubscriberRecord::default, |record| {
                record.apply(patch);
                record.clone()
            }))
    }

    fn set_reverse_index(&self, kind: ReverseIndex, key: &str, value: &str) -> StoreResult<()> {
        self.check()?;
        self.pointers
            .insert(Self::pointer_key(kind, key), value.to_string());
        Ok(())
    }

    fn get_teid(&self, teid: Teid) -> StoreResult<Option<TeidRecord>> {
        self.check()?;
        Ok(self.teids.get(&teid))
    }

    fn get_reverse_index(&self, kind: ReverseIndex, key: &str) -> StoreResult<Option<String>> {
        self.check()?;
        Ok(self.pointers.get(&Self::pointer_key(kind, key)))
    }

    fn get_subscriber(&self, identity: &str) -> StoreResult<Option<SubscriberRecord>> {
        self.check()?;
        Ok(self.subscribers.get(&identity.to_string()))
    }

    fn all_teid_records(&self) -> StoreResult<Vec<(Teid, TeidRecord)>> {
        self.check()?;
        let mut records = self.teids.entries();
        records.sort_unstable_by_key(|(teid, _)| *teid);
        Ok(records)
    }

    fn slice_members(&self, slice: &SliceKey) -> StoreResult<BTreeSet<String>> {
        self.check()?;
        Ok(self.slices.get(slice).unwrap_or_default())
    }

    fn add_slice_member(&self, slice: &SliceKey, identity: &str) -> StoreResult<()> {
        self.check()?;
        self.slices
            .upsert_with(slice.clone(), BTreeSet::new, |members| {
                members.insert(identity.to_string());
            });
        Ok(())
    }

    fn add_ip_teid(&self, ip: &str, teid: Teid) -> StoreResult<()> {
        self.check()?;
        self.ip_activity
            .upsert_with(ip.to_string(), IpActivity::default, |activity| {
                activity.teids.insert(teid);
            });
        Ok(())
    }

    fn touch_ip(&self, ip: &str, now: u64) -> StoreResult<()> {
        self.check()?;
        self.ip_activity
            .upsert_with(ip.to_string(), IpActivity::default, |activity| {
                activity.last_seen = Some(now);
            });
        Ok(())
    }

    fn ip_activity(&self, ip: &str) -> StoreResult<Option<IpActivity>> {
        self.check()?;
        Ok(self.ip_activity.get(&ip.to_string()))
    }

    fn remove_teid(&self, teid: Teid) -> StoreResult<bool> {
        self.check()?;
        Ok(self.teids.remove(&teid).is_some())
    }

    fn remove_subscriber(&self, identity: &str) -> StoreResult<bool> {
        self.check()?;
        Ok(self.subscribers.remove(&identity.to_string()).is_some())
    }

    fn sweep_stale(&self, now: u64) -> StoreResult<RetentionReport> {
        self.check()?;
        let policy = self.retention;
        if !policy.is_enabled() {
            return Ok(RetentionReport::default());
        }

        let dead_teids: HashSet<Teid> = self
            .teids
            .retain(|_, record| !policy.is_stale(record.last_seen, now))
            .into_iter()
            .collect();
        let dead_subscribers: HashSet<String> = self
            .subscribers
            .retain(|_, record| !policy.is_stale(record.last_seen, now))
            .into_iter()
            .collect();

        let mut reverse_entries = self
            .pointers
            .retain(|(kind, _), value| {
                if kind.targets_teid() {
                    Teid::from_hex(value).is_none_or(|teid| !dead_teids.contains(&teid))
                } else {
                    !dead_subscribers.contains(value)
                }
            })
            .len();
        reverse_entries += self
            .ip_activity
            .retain(|_, activity| {
                activity.teids.retain(|teid| !dead_teids.contains(teid));
                !activity.teids.is_empty() || !policy.is_stale(activity.last_seen, now)
            })
            .len();

        let report = RetentionReport {
            teid_records: dead_teids.len(),
            subscriber_records: dead_subscribers.len(),
            reverse_entries,
        };
        if report.total() > 0 {
            debug!(
                teid_records = report.teid_records,
                subscriber_records = report.subscriber_records,
                reverse_entries = report.reverse_entries,
                "retention sweep removed stale records"
            );
        }
        Ok(report)
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Direction, UNKNOWN_IP};

    fn teid(value: u32) -> Teid {
        Teid::from_u32(value)
    }

    #[test]
    fn merges_from_two_writers_converge() {
        let store = MemoryStore::default();
        store
            .merge_teid_record(
                teid(1),
                &TeidPatch::default().identity("imsi-001").slice("01", "empty"),
            )
            .unwrap();
        let merged = store
            .merge_teid_record(
                teid(1),
                &TeidPatch::default()
                    .subscriber_ip("10.0.0.5")
                    .direction(Direction::Uplink),
            )
            .unwrap();
        assert_eq!(merged.identity.as_deref(), Some("imsi-001"));
        assert_eq!(merged.known_ip(), Some("10.0.0.5"));
        assert_eq!(store.get_teid(teid(1)).unwrap(), Some(merged));
    }

    #[test]
    fn unknown_ip_patch_keeps_stored_ip() {
        let store = MemoryStore::default();
        store
            .merge_subscriber_record("imsi-001", &SubscriberPatch::default().subscriber_ip("10.0.0.5"))
            .unwrap();
        let record = store
            .merge_subscriber_record("imsi-001", &SubscriberPatch::default().subscriber_ip(UNKNOWN_IP))
            .unwrap();
        assert_eq!(record.subscriber_ip.as_deref(), Some("10.0.0.5"));
    }

    #[test]
    fn pointers_are_namespaced_by_kind() {
        let store = MemoryStore::default();
        store
            .set_reverse_index(ReverseIndex::IpToTeid, "10.0.0.5", "00000001")
            .unwrap();
        store
            .set_reverse_index(ReverseIndex::IpToIdentity, "10.0.0.5", "imsi-001")
            .unwrap();
        assert_eq!(
            store
                .get_reverse_index(ReverseIndex::IpToTeid, "10.0.0.5")
                .unwrap()
                .as_deref(),
            Some("00000001")
        );
        assert_eq!(
            store
                .get_reverse_index(ReverseIndex::IpToIdentity, "10.0.0.5")
                .unwrap()
                .as_deref(),
            Some("imsi-001")
        );
        assert_eq!(
            store
                .get_reverse_index(ReverseIndex::IdentityToTeid, "10.0.0.5")
                .unwrap(),
            None
        );
    }

    #[test]
    fn all_teid_records_are_ordered() {
        let store = MemoryStore::new(4, RetentionPolicy::default());
        for value in [30, 10, 20] {
            store
                .merge_teid_record(teid(value), &TeidPatch::default().last_seen(1))
                .unwrap();
        }
        let order: Vec<u32> = store
            .all_teid_records()
            .unwrap()
            .into_iter()
            .map(|(t, _)| t.value())
            .collect();
        assert_eq!(order, vec![10, 20, 30]);
    }

    #[test]
    fn slice_members_and_ip_activity() {
        let store = MemoryStore::default();
        let slice = SliceKey::new("1", "1");
        assert!(store.slice_members(&slice).unwrap().is_empty());
        store.add_slice_member(&slice, "imsi-002").unwrap();
        store.add_slice_member(&slice, "imsi-001").unwrap();
        store.add_slice_member(&slice, "imsi-001").unwrap();
        let members: Vec<String> = store.slice_members(&slice).unwrap().into_iter().collect();
        assert_eq!(members, vec!["imsi-001", "imsi-002"]);

        store.add_ip_teid("10.0.0.5", teid(1)).unwrap();
        store.add_ip_teid("10.0.0.5", teid(2)).unwrap();
        store.touch_ip("10.0.0.5", 42).unwrap();
        let activity = store.ip_activity("10.0.0.5").unwrap().unwrap();
        assert_eq!(activity.teids.len(), 2);
        assert_eq!(activity.last_seen, Some(42));
    }

    #[test]
    fn unavailable_store_fails_fast() {
        let store = MemoryStore::default();
        store.set_available(false);
        assert!(!store.is_available());
        assert_eq!(
            store.merge_teid_record(teid(1), &TeidPatch::default()),
            Err(StoreError::Unavailable)
        );
        assert_eq!(store.get_subscriber("imsi-001"), Err(StoreError::Unavailable));
        assert_eq!(store.all_teid_records(), Err(StoreError::Unavailable));

        store.set_available(true);
        assert_eq!(store.get_subscriber("imsi-001"), Ok(None));
        assert!(store.get_teid(teid(1)).unwrap().is_none());
    }

    #[test]
    fn remove_reports_existence() {
        let store = MemoryStore::default();
        store
            .merge_subscriber_record("imsi-001", &SubscriberPatch::default().identity("imsi-001"))
            .unwrap();
        assert!(store.remove_subscriber("imsi-001").unwrap());
        assert!(!store.remove_subscriber("imsi-001").unwrap());
        assert!(!store.remove_teid(teid(9)).unwrap());
    }

    #[test]
    fn disabled_retention_keeps_everything() {
        let store = MemoryStore::default();
        store
            .merge_teid_record(teid(1), &TeidPatch::default().last_seen(0))
            .unwrap();
        assert_eq!(store.sweep_stale(u64::MAX).unwrap(), RetentionReport::default());
        assert!(store.get_teid(teid(1)).unwrap().is_some());
    }

    #[test]
    fn retention_sweep_drops_stale_records_and_their_pointers() {
        let store = MemoryStore::new(4, RetentionPolicy { record_ttl_secs: 100 });
        store
            .merge_teid_record(teid(1), &TeidPatch::default().last_seen(1_000))
            .unwrap();
        store
            .merge_teid_record(teid(2), &TeidPatch::default().last_seen(1_950))
            .unwrap();
        // No timestamp: never swept.
        store
            .merge_teid_record(teid(3), &TeidPatch::default().identity("imsi-003"))
            .unwrap();
        store
            .merge_subscriber_record("imsi-001", &SubscriberPatch::default().last_seen(1_000))
            .unwrap();
        store
            .set_reverse_index(ReverseIndex::IpToTeid, "10.0.0.5", "00000001")
            .unwrap();
        store
            .set_reverse_index(ReverseIndex::IdentityToTeid, "imsi-002", "00000002")
            .unwrap();
        store
            .set_reverse_index(ReverseIndex::IpToIdentity, "10.0.0.5", "imsi-001")
            .unwrap();
        store.add_ip_teid("10.0.0.5", teid(1)).unwrap();
        store.touch_ip("10.0.0.5", 1_000).unwrap();

        let report = store.sweep_stale(2_000).unwrap();
        assert_eq!(report.teid_records, 1);
        assert_eq!(report.subscriber_records, 1);
        assert_eq!(report.reverse_entries, 3);

        assert!(store.get_teid(teid(1)).unwrap().is_none());
        assert!(store.get_teid(teid(2)).unwrap().is_some());
        assert!(store.get_teid(teid(3)).unwrap().is_some());
        assert!(store.get_subscriber("imsi-001").unwrap().is_none());
        assert!(store
            .get_reverse_index(ReverseIndex::IpToTeid, "10.0.0.5")
            .unwrap()
            .is_none());
        assert!(store
            .get_reverse_index(ReverseIndex::IdentityToTeid, "imsi-002")
            .unwrap()
            .is_some());
        assert!(store.ip_activity("10.0.0.5").unwrap().is_none());
    }
}
