//! Read-only query layer over the record store.
//!
//! Subscriber resolution falls back through three tiers and returns at the
//! first one that yields data:
//!
//! 1. the canonical `ue:<identity>` record (full slice and tunnel data);
//! 2. a scan of every `teid:` record enriched with the identity, rebuilding
//!    uplink/downlink from the stored direction (slice unknown);
//! 3. the single `imsi:<identity>` TEID pointer, with no direction.
//!
//! Output is normalized: SST at width 2, SD at width 6, TEIDs rendered with
//! a `0x` prefix, and `slice_id = 0` whenever a slice half is missing.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::codec::{Direction, SliceKey, Teid, normalize_sd, normalize_sst, slice_id, teid_args};
use crate::error::ResolveError;
use crate::store::{RecordStore, ReverseIndex, StoreKey, SubscriberRecord};

/// Flat field hash as stored on the wire.
pub type FieldMap = BTreeMap<String, String>;

pub const MISSING_SLICE_PARAMS: &str = "missing sst or sd query param";

/// Which tier answered a subscriber resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    UeRecord,
    TeidScan,
    ImsiPointer,
}

/// Tier 1 answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordResolution {
    pub imsi: String,
    pub ran_ue_id: Option<String>,
    pub ue_ip: Option<String>,
    pub sst: String,
    pub sd: String,
    pub ul_teid: Option<String>,
    pub dl_teid: Option<String>,
    pub slice_id: u32,
    pub last_seen: Option<u64>,
    pub teid_args: String,
    pub source: ResolutionSource,
}

/// Tier 2 answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanResolution {
    pub imsi: String,
    pub ue_ip: Option<String>,
    pub sst: Option<String>,
    pub sd: Option<String>,
    pub ul_teid: Option<String>,
    pub dl_teid: Option<String>,
    pub slice_id: u32,
    pub teid_args: String,
    pub source: ResolutionSource,
}

/// Tier 3 answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PointerResolution {
    pub imsi: String,
    pub teid: String,
    pub data: FieldMap,
    pub slice_id: u32,
    pub teid_args: String,
    pub source: ResolutionSource,
}

/// Result of [`Resolver::resolve_by_identity`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum SubscriberResolution {
    Record(RecordResolution),
    TeidScan(ScanResolution),
    Pointer(PointerResolution),
}

impl SubscriberResolution {
    #[must_use]
    pub const fn source(&self) -> ResolutionSource {
        match self {
            Self::Record(r) => r.source,
            Self::TeidScan(r) => r.source,
            Self::Pointer(r) => r.source,
        }
    }

    #[must_use]
    pub fn slice_id(&self) -> u32 {
        match self {
            Self::Record(r) => r.slice_id,
            Self::TeidScan(r) => r.slice_id,
            Self::Pointer(r) => r.slice_id,
        }
    }

    #[must_use]
    pub fn teid_args(&self) -> &str {
        match self {
            Self::Record(r) => &r.teid_args,
            Self::TeidScan(r) => &r.teid_args,
            Self::Pointer(r) => &r.teid_args,
        }
    }
}

/// `{teid, data}` answer of the single-hop pointer lookups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PointerLookup {
    pub teid: String,
    pub data: FieldMap,
}

/// One member of a resolved slice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SliceMember {
    pub imsi: String,
    pub ran_ue_id: Option<String>,
    pub ue_ip: Option<String>,
    pub ul_teid: Option<String>,
    pub dl_teid: Option<String>,
    pub last_seen: Option<u64>,
    pub teid_args: String,
}

/// Aggregated slice answer for bulk probe configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SliceResolution {
    pub sst: String,
    pub sd: String,
    pub slice_id: u32,
    pub ues: Vec<SliceMember>,
    pub teid_args: String,
}

fn prefixed(teid: Option<Teid>) -> Option<String> {
    teid.map(Teid::as_prefixed)
}

/// Stateless resolver; cheap to clone into request handlers.
#[derive(Clone)]
pub struct Resolver {
    store: Arc<dyn RecordStore>,
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver").finish_non_exhaustive()
    }
}

impl Resolver {
    #[must_use]
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Field hash of `teid:<teid>`; `teid` is read as hexadecimal.
    pub fn teid(&self, raw: &str) -> Result<FieldMap, ResolveError> {
        let teid = Teid::from_hex(raw).ok_or(ResolveError::NotFound("TEID"))?;
        self.store
            .get_teid(teid)?
            .map(|record| record.to_fields())
            .ok_or(ResolveError::NotFound("TEID"))
    }

    /// Every TEID record keyed by its store key.
    pub fn all_teids(&self) -> Result<BTreeMap<String, FieldMap>, ResolveError> {
        Ok(self
            .store
            .all_teid_records()?
            .into_iter()
            .map(|(teid, record)| (StoreKey::Teid(teid).to_string(), record.to_fields()))
            .collect())
    }

    /// `ip:<ip>` pointer, then the TEID record it names.
    pub fn resolve_by_ip(&self, ip: &str) -> Result<PointerLookup, ResolveError> {
        self.follow_pointer(ReverseIndex::IpToTeid, ip, "UE IP")
    }

    /// `imsi:<identity>` pointer, then the TEID record it names.
    pub fn by_imsi_pointer(&self, identity: &str) -> Result<PointerLookup, ResolveError> {
        self.follow_pointer(ReverseIndex::IdentityToTeid, identity, "IMSI")
    }

    fn follow_pointer(
        &self,
        kind: ReverseIndex,
        key: &str,
        subject: &'static str,
    ) -> Result<PointerLookup, ResolveError> {
        let teid = self
            .store
            .get_reverse_index(kind, key)?
            .as_deref()
            .and_then(Teid::from_hex)
            .ok_or(ResolveError::NotFound(subject))?;
        let data = self
            .store
            .get_teid(teid)?
            .map(|record| record.to_fields())
            .unwrap_or_default();
        Ok(PointerLookup {
            teid: teid.to_string(),
            data,
        })
    }

    /// Three-tier subscriber resolution.
    pub fn resolve_by_identity(&self, identity: &str) -> Result<SubscriberResolution, ResolveError> {
        if let Some(record) = self.store.get_subscriber(identity)? {
            return Ok(SubscriberResolution::Record(from_subscriber_record(
                identity, &record,
            )));
        }
        if let Some(scan) = self.scan_teid_records(identity)? {
            return Ok(SubscriberResolution::TeidScan(scan));
        }
        let lookup = self.by_imsi_pointer(identity)?;
        let teid = Teid::from_hex(&lookup.teid);
        Ok(SubscriberResolution::Pointer(PointerResolution {
            imsi: identity.to_string(),
            teid: prefixed(teid).unwrap_or_default(),
            data: lookup.data,
            slice_id: 0,
            teid_args: teid_args(teid, None, 0),
            source: ResolutionSource::ImsiPointer,
        }))
    }

    /// Tier 2: most recently seen TEID per direction among records carrying
    /// `identity`.
    fn scan_teid_records(&self, identity: &str) -> Result<Option<ScanResolution>, ResolveError> {
        let mut uplink: Option<(Teid, Option<u64>)> = None;
        let mut downlink: Option<(Teid, Option<u64>)> = None;
        let mut ue_ip: Option<String> = None;

        let matching = self
            .store
            .all_teid_records()?
            .into_iter()
            .filter(|(_, record)| record.identity.as_deref() == Some(identity));
        for (teid, record) in matching {
            if ue_ip.is_none() {
                ue_ip = record.subscriber_ip.clone().filter(|ip| !ip.is_empty());
            }
            let slot = match record.direction {
                Some(Direction::Uplink) => &mut uplink,
                Some(Direction::Downlink) => &mut downlink,
                None => continue,
            };
            if slot.is_none_or(|(_, seen)| record.last_seen > seen) {
                *slot = Some((teid, record.last_seen));
            }
        }

        let ul = uplink.map(|(teid, _)| teid);
        let dl = downlink.map(|(teid, _)| teid);
        if ul.is_none() && dl.is_none() {
            return Ok(None);
        }
        Ok(Some(ScanResolution {
            imsi: identity.to_string(),
            ue_ip,
            sst: None,
            sd: None,
            ul_teid: prefixed(ul),
            dl_teid: prefixed(dl),
            slice_id: 0,
            teid_args: teid_args(ul, dl, 0),
            source: ResolutionSource::TeidScan,
        }))
    }

    /// Resolve every member of `slice:<sst>:<sd>` through its `ue:` record.
    pub fn resolve_by_slice(
        &self,
        sst: Option<&str>,
        sd: Option<&str>,
    ) -> Result<SliceResolution, ResolveError> {
        let (Some(sst), Some(sd)) = (
            sst.map(str::trim).filter(|s| !s.is_empty()),
            sd.map(str::trim).filter(|s| !s.is_empty()),
        ) else {
            return Err(ResolveError::BadRequest(MISSING_SLICE_PARAMS));
        };
        let key = SliceKey::new(sst, sd);
        let sid = key.slice_id();

        let mut ues = Vec::new();
        for imsi in self.store.slice_members(&key)? {
            let Some(record) = self.store.get_subscriber(&imsi)? else {
                continue;
            };
            let args = teid_args(record.uplink_teid, record.downlink_teid, sid);
            if args.is_empty() {
                continue;
            }
            ues.push(SliceMember {
                imsi,
                ran_ue_id: record.call_id,
                ue_ip: record.subscriber_ip,
                ul_teid: prefixed(record.uplink_teid),
                dl_teid: prefixed(record.downlink_teid),
                last_seen: record.last_seen,
                teid_args: args,
            });
        }
        let teid_args = ues
            .iter()
            .map(|ue| ue.teid_args.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        Ok(SliceResolution {
            sst: key.sst,
            sd: key.sd,
            slice_id: sid,
            ues,
            teid_args,
        })
    }
}

fn from_subscriber_record(identity: &str, record: &SubscriberRecord) -> RecordResolution {
    let sst = record
        .slice_type
        .as_deref()
        .map(normalize_sst)
        .unwrap_or_default();
    let sd = record
        .slice_differentiator
        .as_deref()
        .map(normalize_sd)
        .unwrap_or_default();
    let sid = if sst.is_empty() || sd.is_empty() {
        0
    } else {
        slice_id(&sst, &sd)
    };
    RecordResolution {
        imsi: identity.to_string(),
        ran_ue_id: record.call_id.clone(),
        ue_ip: record.subscriber_ip.clone(),
        ul_teid: prefixed(record.uplink_teid),
        dl_teid: prefixed(record.downlink_teid),
        slice_id: sid,
        last_seen: record.last_seen,
        teid_args: teid_args(record.uplink_teid, record.downlink_teid, sid),
        sst,
        sd,
        source: ResolutionSource::UeRecord,
    }
}
