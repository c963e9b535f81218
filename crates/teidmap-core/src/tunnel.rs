//! Tunnel-management session assembler.
//!
//! PFCP session establishment carries the subscriber IP in the request and
//! the tunnel identifiers in either message of the exchange. A request's
//! sequence number is bound to its IP so a later message sharing that
//! sequence number, but without an IP of its own, still resolves to the
//! subscriber. Every TEID found is written to the store against that IP.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::codec::{Direction, Teid, is_known_ip};
use crate::message::{SESSION_ESTABLISHMENT_REQUEST, TunnelMessage, collect_elements, ie_type};
use crate::session_table::{ExpiryPolicy, SessionTable, SweepReport};
use crate::store::{
    RecordStore, ReverseIndex, StoreResult, SubscriberPatch, TeidPatch, TeidRecord, epoch_secs,
    preferred_ip,
};

/// Tunnel state observed for one subscriber IP.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TunnelSession {
    pub subscriber_ip: String,
    pub uplink_teid: Option<Teid>,
    pub downlink_teid: Option<Teid>,
}

/// What one call to [`TunnelAssembler::observe`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelObservation {
    /// Not a managed-protocol message.
    Ignored,
    /// No subscriber IP in the message or bound to its sequence number.
    NoAnchor,
    /// Anchored to `ip`; the listed TEIDs were written.
    Recorded {
        ip: String,
        uplink: Option<Teid>,
        downlink: Option<Teid>,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TunnelStats {
    pub messages: u64,
    pub ignored: u64,
    pub no_anchor: u64,
    pub sequence_bindings: u64,
    pub teid_writes: u64,
    pub store_failures: u64,
    pub enrichment_failures: u64,
}

/// Sequence-correlating assembler writing TEID bindings to the store.
pub struct TunnelAssembler {
    store: Arc<dyn RecordStore>,
    sequences: SessionTable<u32, String>,
    sessions: SessionTable<String, TunnelSession>,
    stats: TunnelStats,
}

impl std::fmt::Debug for TunnelAssembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelAssembler")
            .field("sequences", &self.sequences.len())
            .field("sessions", &self.sessions.len())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl TunnelAssembler {
    #[must_use]
    pub fn new(store: Arc<dyn RecordStore>, policy: ExpiryPolicy) -> Self {
        Self {
            store,
            sequences: SessionTable::new(policy),
            sessions: SessionTable::new(policy),
            stats: TunnelStats::default(),
        }
    }

    #[must_use]
    pub const fn stats(&self) -> TunnelStats {
        self.stats
    }

    #[must_use]
    pub fn bound_ip(&self, sequence: u32) -> Option<&str> {
        self.sequences.peek(&sequence).map(String::as_str)
    }

    #[must_use]
    pub fn session(&self, ip: &str) -> Option<&TunnelSession> {
        self.sessions.peek(&ip.to_string())
    }

    pub fn observe<M: TunnelMessage + ?Sized>(&mut self, msg: &M) -> TunnelObservation {
        self.observe_at(msg, Instant::now(), epoch_secs())
    }

    pub fn observe_at<M: TunnelMessage + ?Sized>(
        &mut self,
        msg: &M,
        now: Instant,
        wall: u64,
    ) -> TunnelObservation {
        self.stats.messages += 1;
        if !msg.is_managed_protocol() {
            self.stats.ignored += 1;
            return TunnelObservation::Ignored;
        }

        let elements = collect_elements(msg.elements());
        let found_ip = elements
            .iter()
            .find(|ie| ie.ie_type == ie_type::UE_IP_ADDRESS)
            .and_then(|ie| ie.ipv4)
            .map(|ip| ip.to_string());
        let sequence = msg.sequence();

        if let (true, Some(ip), Some(seq)) = (
            msg.message_type() == SESSION_ESTABLISHMENT_REQUEST,
            found_ip.as_ref(),
            sequence,
        ) {
            self.sequences.insert(seq, ip.clone(), now);
            self.sessions
                .get_or_insert_with(ip.clone(), now, || TunnelSession {
                    subscriber_ip: ip.clone(),
                    ..TunnelSession::default()
                });
            self.stats.sequence_bindings += 1;
            trace!(seq, ue_ip = %ip, "sequence bound to subscriber ip");
        }

        let anchor = found_ip.or_else(|| {
            sequence.and_then(|seq| self.sequences.get(&seq, now).cloned())
        });
        let Some(ip) = anchor else {
            self.stats.no_anchor += 1;
            debug!(seq = sequence.unwrap_or_default(), "tunnel message without subscriber ip dropped");
            return TunnelObservation::NoAnchor;
        };

        let mut uplink = None;
        let mut downlink = None;
        for ie in &elements {
            match (ie.ie_type, ie.teid) {
                (ie_type::F_TEID, Some(teid)) => uplink = Some(Teid::from_u32(teid)),
                (ie_type::OUTER_HEADER_CREATION, Some(teid)) => {
                    downlink = Some(Teid::from_u32(teid));
                }
                _ => {}
            }
        }

        if uplink.is_some() || downlink.is_some() {
            let session = self
                .sessions
                .get_or_insert_with(ip.clone(), now, || TunnelSession {
                    subscriber_ip: ip.clone(),
                    ..TunnelSession::default()
                });
            if downlink.is_some() {
                session.downlink_teid = downlink;
            }
            if uplink.is_some() {
                session.uplink_teid = uplink;
            }
            if let Err(err) = self.record(&ip, uplink, downlink, wall) {
                self.stats.store_failures += 1;
                warn!(ue_ip = %ip, error = %err, "failed to store tunnel binding");
            }
        }

        TunnelObservation::Recorded {
            ip,
            uplink,
            downlink,
        }
    }

    pub fn sweep(&mut self, now: Instant) -> SweepReport {
        let bindings = self.sequences.sweep(now);
        let sessions = self.sessions.sweep(now);
        let report = SweepReport {
            expired: bindings.expired + sessions.expired,
            remaining: bindings.remaining + sessions.remaining,
        };
        if report.expired > 0 {
            debug!(
                expired = report.expired,
                remaining = report.remaining,
                "tunnel sessions swept"
            );
        }
        report
    }

    /// Write the TEIDs of one message, downlink first.
    fn record(
        &mut self,
        observed_ip: &str,
        uplink: Option<Teid>,
        downlink: Option<Teid>,
        wall: u64,
    ) -> StoreResult<()> {
        let store = Arc::clone(&self.store);
        let ip_on_record = |teid: Option<Teid>| -> StoreResult<Option<String>> {
            let Some(teid) = teid else { return Ok(None) };
            Ok(store
                .get_teid(teid)?
                .and_then(|r| r.known_ip().map(str::to_string)))
        };
        let ul_ip = ip_on_record(uplink)?;
        let dl_ip = ip_on_record(downlink)?;
        let ip = preferred_ip([ul_ip.as_deref(), dl_ip.as_deref(), Some(observed_ip)])
            .unwrap_or(observed_ip)
            .to_string();

        let writes = [(downlink, Direction::Downlink), (uplink, Direction::Uplink)];
        for (teid, direction) in writes {
            let Some(teid) = teid else { continue };
            let record = write_teid(store.as_ref(), teid, &ip, direction, wall)?;
            self.stats.teid_writes += 1;
            debug!(teid = %teid, ue_ip = %ip, dir = %direction, "stored tunnel binding");
            let binding = (teid, direction);
            if let Err(err) = enrich_subscriber(store.as_ref(), &record, binding, &ip, wall) {
                self.stats.enrichment_failures += 1;
                debug!(teid = %teid, error = %err, "subscriber enrichment skipped");
            }
        }
        Ok(())
    }
}

fn write_teid(
    store: &dyn RecordStore,
    teid: Teid,
    ip: &str,
    direction: Direction,
    wall: u64,
) -> StoreResult<TeidRecord> {
    let record = store.merge_teid_record(
        teid,
        &TeidPatch::default()
            .subscriber_ip(ip)
            .direction(direction)
            .last_seen(wall),
    )?;
    store.add_ip_teid(ip, teid)?;
    store.touch_ip(ip, wall)?;
    if direction == Direction::Uplink {
        store.set_reverse_index(ReverseIndex::IpToTeid, ip, &teid.to_string())?;
    }
    Ok(record)
}

/// Carry a TEID record's identity over to its subscriber record.
///
/// Patches `ue:<imsi>` with `last_seen`, the IP and the TEID just bound in
/// its direction; a missing subscriber record is seeded from the TEID
/// record's control-plane fields.
fn enrich_subscriber(
    store: &dyn RecordStore,
    record: &TeidRecord,
    (teid, direction): (Teid, Direction),
    ip: &str,
    wall: u64,
) -> StoreResult<()> {
    let Some(imsi) = record.identity.as_deref() else {
        return Ok(());
    };
    let mut patch = SubscriberPatch::default().last_seen(wall);
    match direction {
        Direction::Uplink => patch.uplink_teid = Some(teid),
        Direction::Downlink => patch.downlink_teid = Some(teid),
    }
    if is_known_ip(ip) {
        patch = patch.subscriber_ip(ip);
    }
    if store.get_subscriber(imsi)?.is_none() {
        patch.identity = Some(imsi.to_string());
        patch.call_id.clone_from(&record.call_id);
        patch.slice_type = record.slice_type.as_deref().map(str::to_ascii_lowercase);
        patch.slice_differentiator = record
            .slice_differentiator
            .as_deref()
            .map(str::to_ascii_lowercase);
    }
    store.merge_subscriber_record(imsi, &patch)?;
    if is_known_ip(ip) {
        store.set_reverse_index(ReverseIndex::IpToIdentity, ip, imsi)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::message::{InformationElement, PfcpRecord};
    use crate::store::MemoryStore;

    const UE_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);

    fn assembler() -> (Arc<MemoryStore>, TunnelAssembler) {
        let store = Arc::new(MemoryStore::default());
        let asm = TunnelAssembler::new(store.clone(), ExpiryPolicy::default());
        (store, asm)
    }

    fn pfcp(message_type: u8, seq: u32, ies: Vec<InformationElement>) -> PfcpRecord {
        PfcpRecord {
            message_type,
            seq: Some(seq),
            ies,
            ..PfcpRecord::default()
        }
    }

    fn ue_ip_ie() -> InformationElement {
        InformationElement::new(1)
            .with_child(InformationElement::new(ie_type::UE_IP_ADDRESS).with_ipv4(UE_IP))
    }

    #[test]
    fn response_resolves_ip_through_sequence_binding() {
        let (store, mut asm) = assembler();
        let now = Instant::now();
        let request = pfcp(SESSION_ESTABLISHMENT_REQUEST, 99, vec![ue_ip_ie()]);
        assert_eq!(
            asm.observe_at(&request, now, 10),
            TunnelObservation::Recorded {
                ip: "10.0.0.5".into(),
                uplink: None,
                downlink: None,
            }
        );
        assert_eq!(asm.bound_ip(99), Some("10.0.0.5"));

        let response = pfcp(
            51,
            99,
            vec![InformationElement::new(ie_type::F_TEID).with_teid(0x1a2b_3c4d)],
        );
        let obs = asm.observe_at(&response, now, 20);
        let ul = Teid::from_u32(0x1a2b_3c4d);
        assert_eq!(
            obs,
            TunnelObservation::Recorded {
                ip: "10.0.0.5".into(),
                uplink: Some(ul),
                downlink: None,
            }
        );

        let record = store.get_teid(ul).unwrap().unwrap();
        assert_eq!(record.subscriber_ip.as_deref(), Some("10.0.0.5"));
        assert_eq!(record.direction, Some(Direction::Uplink));
        assert_eq!(record.last_seen, Some(20));
        assert_eq!(
            store
                .get_reverse_index(ReverseIndex::IpToTeid, "10.0.0.5")
                .unwrap()
                .as_deref(),
            Some("1a2b3c4d")
        );
        let activity = store.ip_activity("10.0.0.5").unwrap().unwrap();
        assert!(activity.teids.contains(&ul));
        assert_eq!(activity.last_seen, Some(20));
        assert_eq!(asm.session("10.0.0.5").unwrap().uplink_teid, Some(ul));
    }

    #[test]
    fn unmanaged_protocol_is_ignored() {
        let (_, mut asm) = assembler();
        let msg = PfcpRecord {
            protocol: "gtpv2".into(),
            ..pfcp(SESSION_ESTABLISHMENT_REQUEST, 1, vec![ue_ip_ie()])
        };
        assert_eq!(asm.observe(&msg), TunnelObservation::Ignored);
        assert_eq!(asm.bound_ip(1), None);
    }

    #[test]
    fn no_ip_and_no_binding_records_nothing() {
        let (store, mut asm) = assembler();
        let msg = pfcp(
            51,
            7,
            vec![InformationElement::new(ie_type::F_TEID).with_teid(1)],
        );
        assert_eq!(asm.observe(&msg), TunnelObservation::NoAnchor);
        assert!(store.all_teid_records().unwrap().is_empty());
        assert_eq!(asm.stats().no_anchor, 1);
    }

    #[test]
    fn zero_sequence_never_binds() {
        let (_, mut asm) = assembler();
        let request = pfcp(SESSION_ESTABLISHMENT_REQUEST, 0, vec![ue_ip_ie()]);
        asm.observe(&request);
        assert_eq!(asm.stats().sequence_bindings, 0);
        let response = pfcp(
            51,
            0,
            vec![InformationElement::new(ie_type::F_TEID).with_teid(1)],
        );
        assert_eq!(asm.observe(&response), TunnelObservation::NoAnchor);
    }

    #[test]
    fn downlink_only_does_not_set_ip_pointer() {
        let (store, mut asm) = assembler();
        let msg = pfcp(
            52,
            4,
            vec![
                ue_ip_ie(),
                InformationElement::new(ie_type::OUTER_HEADER_CREATION).with_teid(0xbeef),
            ],
        );
        asm.observe(&msg);
        let dl = store.get_teid(Teid::from_u32(0xbeef)).unwrap().unwrap();
        assert_eq!(dl.direction, Some(Direction::Downlink));
        assert!(store
            .get_reverse_index(ReverseIndex::IpToTeid, "10.0.0.5")
            .unwrap()
            .is_none());
    }

    #[test]
    fn known_ip_on_record_wins_over_observed() {
        let (store, mut asm) = assembler();
        let ul = Teid::from_u32(1);
        store
            .merge_teid_record(ul, &TeidPatch::default().subscriber_ip("10.9.9.9"))
            .unwrap();
        let msg = pfcp(
            52,
            4,
            vec![
                ue_ip_ie(),
                InformationElement::new(ie_type::F_TEID).with_teid(1),
                InformationElement::new(ie_type::OUTER_HEADER_CREATION).with_teid(2),
            ],
        );
        asm.observe(&msg);
        let dl = store.get_teid(Teid::from_u32(2)).unwrap().unwrap();
        assert_eq!(dl.known_ip(), Some("10.9.9.9"));
        assert_eq!(
            store.get_teid(ul).unwrap().unwrap().known_ip(),
            Some("10.9.9.9")
        );
    }

    #[test]
    fn enrichment_seeds_missing_subscriber_record() {
        let (store, mut asm) = assembler();
        let ul = Teid::from_u32(0x1a2b_3c4d);
        store
            .merge_teid_record(
                ul,
                &TeidPatch::default()
                    .identity("imsi-001")
                    .slice("01", "EMPTY")
                    .call_id("7")
                    .direction(Direction::Uplink),
            )
            .unwrap();
        let msg = pfcp(
            51,
            3,
            vec![
                ue_ip_ie(),
                InformationElement::new(ie_type::F_TEID).with_teid(0x1a2b_3c4d),
            ],
        );
        asm.observe_at(&msg, Instant::now(), 500);

        let ue = store.get_subscriber("imsi-001").unwrap().unwrap();
        assert_eq!(ue.identity.as_deref(), Some("imsi-001"));
        assert_eq!(ue.call_id.as_deref(), Some("7"));
        assert_eq!(ue.slice_differentiator.as_deref(), Some("empty"));
        assert_eq!(ue.subscriber_ip.as_deref(), Some("10.0.0.5"));
        assert_eq!(ue.last_seen, Some(500));
        assert_eq!(
            store
                .get_reverse_index(ReverseIndex::IpToIdentity, "10.0.0.5")
                .unwrap()
                .as_deref(),
            Some("imsi-001")
        );
    }

    #[test]
    fn seeded_subscriber_carries_bound_teid() {
        let (store, mut asm) = assembler();
        let ul = Teid::from_u32(0x10);
        store
            .merge_teid_record(
                ul,
                &TeidPatch::default()
                    .identity("imsi-002")
                    .direction(Direction::Uplink),
            )
            .unwrap();
        let resolver = crate::Resolver::new(store.clone());
        let before = resolver.resolve_by_identity("imsi-002").unwrap();
        assert_eq!(before.teid_args(), "0x00000010@0");

        let msg = pfcp(
            51,
            3,
            vec![ue_ip_ie(), InformationElement::new(ie_type::F_TEID).with_teid(0x10)],
        );
        asm.observe_at(&msg, Instant::now(), 700);

        let ue = store.get_subscriber("imsi-002").unwrap().unwrap();
        assert_eq!(ue.uplink_teid, Some(ul));
        assert_eq!(ue.downlink_teid, None);
        let after = resolver.resolve_by_identity("imsi-002").unwrap();
        assert_eq!(after.teid_args(), "0x00000010@0");
    }

    #[test]
    fn enrichment_patches_existing_subscriber_without_reseeding() {
        let (store, mut asm) = assembler();
        let ul = Teid::from_u32(5);
        store
            .merge_teid_record(ul, &TeidPatch::default().identity("imsi-001").call_id("7"))
            .unwrap();
        store
            .merge_subscriber_record("imsi-001", &SubscriberPatch::default().call_id("99"))
            .unwrap();
        let msg = pfcp(
            51,
            3,
            vec![ue_ip_ie(), InformationElement::new(ie_type::F_TEID).with_teid(5)],
        );
        asm.observe_at(&msg, Instant::now(), 600);
        let ue = store.get_subscriber("imsi-001").unwrap().unwrap();
        assert_eq!(ue.call_id.as_deref(), Some("99"));
        assert_eq!(ue.last_seen, Some(600));
    }

    #[test]
    fn store_outage_is_counted_and_loop_state_survives() {
        let (store, mut asm) = assembler();
        store.set_available(false);
        let msg = pfcp(
            SESSION_ESTABLISHMENT_REQUEST,
            8,
            vec![ue_ip_ie(), InformationElement::new(ie_type::F_TEID).with_teid(1)],
        );
        assert!(matches!(asm.observe(&msg), TunnelObservation::Recorded { .. }));
        assert_eq!(asm.stats().store_failures, 1);
        assert_eq!(asm.bound_ip(8), Some("10.0.0.5"));
    }
}
