//! Control-plane session assembler.
//!
//! NGAP messages for one subscriber arrive spread over several packets that
//! share a call identifier (RAN UE NGAP ID). The assembler accumulates six
//! attributes per call (identity, call id, SST, SD, UL TEID, DL TEID) with
//! first-writer-wins semantics and writes the finalized subscriber record to
//! the store exactly once, the moment the last attribute lands.
//!
//! Completed sessions stay in the table until the expiry sweep drops them,
//! so duplicate messages for a finished call never fire a second write.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::codec::{Direction, Teid, normalize_captured_sd, normalize_sd, normalize_sst};
use crate::message::ControlPlaneMessage;
use crate::session_table::{ExpiryPolicy, SessionTable, SweepReport};
use crate::store::{
    RecordStore, ReverseIndex, StoreResult, SubscriberPatch, TeidPatch, epoch_secs, preferred_ip,
};

/// Transient per-call state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriberSession {
    pub call_id: u64,
    pub identity: Option<String>,
    pub slice_type: Option<String>,
    pub slice_differentiator: Option<String>,
    pub uplink_teid: Option<Teid>,
    pub downlink_teid: Option<Teid>,
    pub completed: bool,
}

impl SubscriberSession {
    #[must_use]
    pub const fn new(call_id: u64) -> Self {
        Self {
            call_id,
            identity: None,
            slice_type: None,
            slice_differentiator: None,
            uplink_teid: None,
            downlink_teid: None,
            completed: false,
        }
    }

    /// All six tracked attributes are present.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.identity.is_some()
            && self.slice_type.is_some()
            && self.slice_differentiator.is_some()
            && self.uplink_teid.is_some()
            && self.downlink_teid.is_some()
    }

    /// Copy every attribute `msg` carries into the unset slots.
    fn absorb<M: ControlPlaneMessage + ?Sized>(&mut self, msg: &M) {
        if self.identity.is_none() {
            self.identity = msg.identity().map(str::to_string);
        }
        if self.slice_type.is_none() {
            self.slice_type = msg.slice_type().map(normalize_sst);
        }
        if self.slice_differentiator.is_none() {
            self.slice_differentiator = msg
                .slice_differentiator()
                .map(|sd| normalize_sd(&normalize_captured_sd(sd)));
        }
        let Some(teid) = msg.gtp_teid().and_then(Teid::parse) else {
            return;
        };
        for direction in classify_teid_direction(msg) {
            let slot = match direction {
                Direction::Uplink => &mut self.uplink_teid,
                Direction::Downlink => &mut self.downlink_teid,
            };
            if slot.is_none() {
                *slot = Some(teid);
            }
        }
    }
}

/// Which tunnel direction(s) the TEID in `msg` belongs to.
///
/// A setup-request item next to the TEID means uplink, a setup-response item
/// means downlink. When both are present each direction is offered the TEID
/// independently.
pub fn classify_teid_direction<M: ControlPlaneMessage + ?Sized>(msg: &M) -> &'static [Direction] {
    match (
        msg.has_setup_request_container(),
        msg.has_setup_response_container(),
    ) {
        (true, true) => &[Direction::Uplink, Direction::Downlink],
        (true, false) => &[Direction::Uplink],
        (false, true) => &[Direction::Downlink],
        (false, false) => &[],
    }
}

/// What one call to [`ControlPlaneAssembler::observe`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// No call identifier; nothing recorded.
    Skipped,
    /// Session updated, still missing attributes.
    Pending,
    /// This message completed the session and the record was emitted.
    Completed(SubscriberSession),
    /// The session already fired; nothing written.
    AlreadyCompleted,
}

/// Running counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AssemblerStats {
    pub messages: u64,
    pub skipped: u64,
    pub completions: u64,
    pub store_failures: u64,
}

/// Per-call session assembler writing finished sessions to the store.
pub struct ControlPlaneAssembler {
    store: Arc<dyn RecordStore>,
    sessions: SessionTable<u64, SubscriberSession>,
    stats: AssemblerStats,
}

impl std::fmt::Debug for ControlPlaneAssembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlaneAssembler")
            .field("sessions", &self.sessions.len())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl ControlPlaneAssembler {
    #[must_use]
    pub fn new(store: Arc<dyn RecordStore>, policy: ExpiryPolicy) -> Self {
        Self {
            store,
            sessions: SessionTable::new(policy),
            stats: AssemblerStats::default(),
        }
    }

    #[must_use]
    pub const fn stats(&self) -> AssemblerStats {
        self.stats
    }

    /// Live sessions, completed ones included.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn session(&self, call_id: u64) -> Option<&SubscriberSession> {
        self.sessions.peek(&call_id)
    }

    /// Consume one decoded message using the current clocks.
    pub fn observe<M: ControlPlaneMessage + ?Sized>(&mut self, msg: &M) -> Observation {
        self.observe_at(msg, Instant::now(), epoch_secs())
    }

    /// Consume one decoded message at `now` (session clock) and `wall`
    /// (unix seconds stamped on written records).
    pub fn observe_at<M: ControlPlaneMessage + ?Sized>(
        &mut self,
        msg: &M,
        now: Instant,
        wall: u64,
    ) -> Observation {
        self.stats.messages += 1;
        let Some(call_id) = msg.call_id() else {
            self.stats.skipped += 1;
            debug!("control-plane message without call id skipped");
            return Observation::Skipped;
        };

        let session = self
            .sessions
            .get_or_insert_with(call_id, now, || SubscriberSession::new(call_id));
        if session.completed {
            return Observation::AlreadyCompleted;
        }
        session.absorb(msg);
        if !session.is_complete() {
            return Observation::Pending;
        }
        session.completed = true;
        let finished = session.clone();

        self.stats.completions += 1;
        match persist(self.store.as_ref(), &finished, wall) {
            Ok(ip) => info!(
                call_id,
                imsi = finished.identity.as_deref().unwrap_or_default(),
                ul_teid = %finished.uplink_teid.map(|t| t.to_string()).unwrap_or_default(),
                dl_teid = %finished.downlink_teid.map(|t| t.to_string()).unwrap_or_default(),
                ue_ip = ip.as_deref().unwrap_or(crate::codec::UNKNOWN_IP),
                "subscriber session completed"
            ),
            Err(err) => {
                self.stats.store_failures += 1;
                warn!(call_id, error = %err, "failed to store completed session");
            }
        }
        Observation::Completed(finished)
    }

    /// Drop sessions idle past the expiry policy.
    pub fn sweep(&mut self, now: Instant) -> SweepReport {
        let report = self.sessions.sweep(now);
        if report.expired > 0 {
            debug!(
                expired = report.expired,
                remaining = report.remaining,
                "control-plane sessions swept"
            );
        }
        report
    }
}

/// Write a completed session. Returns the subscriber IP chosen, if known.
fn persist(
    store: &dyn RecordStore,
    session: &SubscriberSession,
    wall: u64,
) -> StoreResult<Option<String>> {
    let (Some(identity), Some(sst), Some(sd), Some(ul), Some(dl)) = (
        session.identity.as_deref(),
        session.slice_type.as_deref(),
        session.slice_differentiator.as_deref(),
        session.uplink_teid,
        session.downlink_teid,
    ) else {
        return Ok(None);
    };
    let call_id = session.call_id.to_string();

    let ul_existing = store.get_teid(ul)?;
    let dl_existing = store.get_teid(dl)?;
    let ip = preferred_ip([
        ul_existing.as_ref().and_then(|r| r.known_ip()),
        dl_existing.as_ref().and_then(|r| r.known_ip()),
    ])
    .map(str::to_string);

    let mut base = TeidPatch::default()
        .identity(identity)
        .slice(sst, sd)
        .call_id(call_id.as_str())
        .last_seen(wall);
    if let Some(ip) = &ip {
        base = base.subscriber_ip(ip.as_str());
    }
    store.merge_teid_record(ul, &base.clone().direction(Direction::Uplink))?;
    store.merge_teid_record(dl, &base.direction(Direction::Downlink))?;

    let ul_text = ul.to_string();
    store.set_reverse_index(ReverseIndex::IdentityToTeid, identity, &ul_text)?;
    if let Some(ip) = &ip {
        store.set_reverse_index(ReverseIndex::IpToTeid, ip, &ul_text)?;
    }

    let mut subscriber = SubscriberPatch::default()
        .identity(identity)
        .call_id(call_id)
        .slice(sst, sd)
        .teids(ul, dl)
        .last_seen(wall);
    if let Some(ip) = &ip {
        subscriber = subscriber.subscriber_ip(ip.as_str());
    }
    store.merge_subscriber_record(identity, &subscriber)?;
    if let Some(ip) = &ip {
        store.set_reverse_index(ReverseIndex::IpToIdentity, ip, identity)?;
    }
    Ok(ip)
}
