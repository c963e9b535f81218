//! Persistent record types, field patches and the key schema.
//!
//! Writers never hand the store a whole record. They send a patch whose
//! `None` fields leave the stored value alone, so the control-plane side
//! (identity, slice) and the tunnel side (IP, TEID binding) can write the
//! same key in either order and converge.
//!
//! One rule overrides plain last-write-wins: a patch carrying the
//! [`UNKNOWN_IP`](crate::codec::UNKNOWN_IP) placeholder never replaces a
//! known subscriber IP.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec::{Direction, SliceKey, Teid, is_known_ip};

/// Wire field names of the flat record hashes.
pub mod field {
    pub const UE_IP: &str = "ue_ip";
    pub const DIR: &str = "dir";
    pub const LAST_SEEN: &str = "last_seen";
    pub const IMSI: &str = "imsi";
    pub const SST: &str = "sst";
    pub const SD: &str = "sd";
    pub const RAN_UE_ID: &str = "ran_ue_id";
    pub const UL_TEID: &str = "ul_teid";
    pub const DL_TEID: &str = "dl_teid";
}

/// Apply an optional field write.
fn merge_field<T: Clone>(slot: &mut Option<T>, update: Option<&T>) {
    if let Some(value) = update {
        *slot = Some(value.clone());
    }
}

/// Apply an IP write, refusing to replace a known IP with the placeholder.
fn merge_ip(slot: &mut Option<String>, update: Option<&String>) {
    let Some(ip) = update else { return };
    let replace = is_known_ip(ip) || slot.as_deref().is_none_or(|cur| !is_known_ip(cur));
    if replace {
        *slot = Some(ip.clone());
    }
}

fn put(fields: &mut BTreeMap<String, String>, name: &str, value: Option<impl ToString>) {
    if let Some(value) = value {
        fields.insert(name.to_string(), value.to_string());
    }
}

// ---------------------------------------------------------------------------
// TEID record
// ---------------------------------------------------------------------------

/// State held under `teid:<8hex>`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeidRecord {
    pub subscriber_ip: Option<String>,
    pub direction: Option<Direction>,
    /// Unix seconds of the most recent write.
    pub last_seen: Option<u64>,
    pub identity: Option<String>,
    pub slice_type: Option<String>,
    pub slice_differentiator: Option<String>,
    pub call_id: Option<String>,
}

impl TeidRecord {
    pub fn apply(&mut self, patch: &TeidPatch) {
        merge_ip(&mut self.subscriber_ip, patch.subscriber_ip.as_ref());
        merge_field(&mut self.direction, patch.direction.as_ref());
        merge_field(&mut self.last_seen, patch.last_seen.as_ref());
        merge_field(&mut self.identity, patch.identity.as_ref());
        merge_field(&mut self.slice_type, patch.slice_type.as_ref());
        merge_field(
            &mut self.slice_differentiator,
            patch.slice_differentiator.as_ref(),
        );
        merge_field(&mut self.call_id, patch.call_id.as_ref());
    }

    /// The subscriber IP when it is a real address.
    #[must_use]
    pub fn known_ip(&self) -> Option<&str> {
        self.subscriber_ip.as_deref().filter(|ip| is_known_ip(ip))
    }

    /// Flat hash view with wire field names.
    #[must_use]
    pub fn to_fields(&self) -> BTreeMap<String, String> {
        let mut fields = BTreeMap::new();
        put(&mut fields, field::UE_IP, self.subscriber_ip.as_ref());
        put(&mut fields, field::DIR, self.direction);
        put(&mut fields, field::LAST_SEEN, self.last_seen);
        put(&mut fields, field::IMSI, self.identity.as_ref());
        put(&mut fields, field::SST, self.slice_type.as_ref());
        put(&mut fields, field::SD, self.slice_differentiator.as_ref());
        put(&mut fields, field::RAN_UE_ID, self.call_id.as_ref());
        fields
    }
}

/// Field-level write to a [`TeidRecord`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeidPatch {
    pub subscriber_ip: Option<String>,
    pub direction: Option<Direction>,
    pub last_seen: Option<u64>,
    pub identity: Option<String>,
    pub slice_type: Option<String>,
    pub slice_differentiator: Option<String>,
    pub call_id: Option<String>,
}

impl TeidPatch {
    #[must_use]
    pub fn subscriber_ip(mut self, ip: impl Into<String>) -> Self {
        self.subscriber_ip = Some(ip.into());
        self
    }

    #[must_use]
    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = Some(direction);
        self
    }

    #[must_use]
    pub fn last_seen(mut self, secs: u64) -> Self {
        self.last_seen = Some(secs);
        self
    }

    #[must_use]
    pub fn identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    #[must_use]
    pub fn slice(mut self, sst: impl Into<String>, sd: impl Into<String>) -> Self {
        self.slice_type = Some(sst.into());
        self.slice_differentiator = Some(sd.into());
        self
    }

    #[must_use]
    pub fn call_id(mut self, call_id: impl Into<String>) -> Self {
        self.call_id = Some(call_id.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Subscriber record
// ---------------------------------------------------------------------------

/// Canonical aggregate held under `ue:<identity>`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberRecord {
    pub identity: Option<String>,
    pub call_id: Option<String>,
    pub slice_type: Option<String>,
    pub slice_differentiator: Option<String>,
    pub subscriber_ip: Option<String>,
    pub uplink_teid: Option<Teid>,
    pub downlink_teid: Option<Teid>,
    pub last_seen: Option<u64>,
}

impl SubscriberRecord {
    pub fn apply(&mut self, patch: &SubscriberPatch) {
        merge_field(&mut self.identity, patch.identity.as_ref());
        merge_field(&mut self.call_id, patch.call_id.as_ref());
        merge_field(&mut self.slice_type, patch.slice_type.as_ref());
        merge_field(
            &mut self.slice_differentiator,
            patch.slice_differentiator.as_ref(),
        );
        merge_ip(&mut self.subscriber_ip, patch.subscriber_ip.as_ref());
        merge_field(&mut self.uplink_teid, patch.uplink_teid.as_ref());
        merge_field(&mut self.downlink_teid, patch.downlink_teid.as_ref());
        merge_field(&mut self.last_seen, patch.last_seen.as_ref());
    }

    #[must_use]
    pub fn to_fields(&self) -> BTreeMap<String, String> {
        let mut fields = BTreeMap::new();
        put(&mut fields, field::IMSI, self.identity.as_ref());
        put(&mut fields, field::RAN_UE_ID, self.call_id.as_ref());
        put(&mut fields, field::SST, self.slice_type.as_ref());
        put(&mut fields, field::SD, self.slice_differentiator.as_ref());
        put(&mut fields, field::UE_IP, self.subscriber_ip.as_ref());
        put(&mut fields, field::UL_TEID, self.uplink_teid);
        put(&mut fields, field::DL_TEID, self.downlink_teid);
        put(&mut fields, field::LAST_SEEN, self.last_seen);
        fields
    }
}

/// Field-level write to a [`SubscriberRecord`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriberPatch {
    pub identity: Option<String>,
    pub call_id: Option<String>,
    pub slice_type: Option<String>,
    pub slice_differentiator: Option<String>,
    pub subscriber_ip: Option<String>,
    pub uplink_teid: Option<Teid>,
    pub downlink_teid: Option<Teid>,
    pub last_seen: Option<u64>,
}

impl SubscriberPatch {
    #[must_use]
    pub fn identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    #[must_use]
    pub fn call_id(mut self, call_id: impl Into<String>) -> Self {
        self.call_id = Some(call_id.into());
        self
    }

    #[must_use]
    pub fn slice(mut self, sst: impl Into<String>, sd: impl Into<String>) -> Self {
        self.slice_type = Some(sst.into());
        self.slice_differentiator = Some(sd.into());
        self
    }

    #[must_use]
    pub fn subscriber_ip(mut self, ip: impl Into<String>) -> Self {
        self.subscriber_ip = Some(ip.into());
        self
    }

    #[must_use]
    pub fn teids(mut self, uplink: Teid, downlink: Teid) -> Self {
        self.uplink_teid = Some(uplink);
        self.downlink_teid = Some(downlink);
        self
    }

    #[must_use]
    pub fn last_seen(mut self, secs: u64) -> Self {
        self.last_seen = Some(secs);
        self
    }
}

// ---------------------------------------------------------------------------
// Reverse indices and key schema
// ---------------------------------------------------------------------------

/// Scalar pointer families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReverseIndex {
    /// `ip:<ip>` -> uplink TEID
    IpToTeid,
    /// `imsi:<identity>` -> uplink TEID
    IdentityToTeid,
    /// `ipimsi:<ip>` -> identity
    IpToIdentity,
}

impl ReverseIndex {
    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::IpToTeid => "ip",
            Self::IdentityToTeid => "imsi",
            Self::IpToIdentity => "ipimsi",
        }
    }

    /// Whether the pointed-to value is a TEID.
    #[must_use]
    pub const fn targets_teid(self) -> bool {
        matches!(self, Self::IpToTeid | Self::IdentityToTeid)
    }
}

/// Textual store keys, as exposed on the query API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreKey<'a> {
    Teid(Teid),
    Subscriber(&'a str),
    Reverse(ReverseIndex, &'a str),
    Slice(&'a SliceKey),
    IpTeids(&'a str),
}

impl fmt::Display for StoreKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Teid(teid) => write!(f, "teid:{teid}"),
            Self::Subscriber(identity) => write!(f, "ue:{identity}"),
            Self::Reverse(kind, key) => write!(f, "{}:{key}", kind.prefix()),
            Self::Slice(slice) => write!(f, "slice:{}:{}", slice.sst, slice.sd),
            Self::IpTeids(ip) => write!(f, "ueip:{ip}:teids"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::UNKNOWN_IP;

    #[test]
    fn patch_leaves_untouched_fields_alone() {
        let mut record = TeidRecord::default();
        record.apply(&TeidPatch::default().identity("imsi-001").slice("01", "empty"));
        record.apply(&TeidPatch::default().subscriber_ip("10.0.0.5").direction(Direction::Uplink));
        assert_eq!(record.identity.as_deref(), Some("imsi-001"));
        assert_eq!(record.slice_differentiator.as_deref(), Some("empty"));
        assert_eq!(record.known_ip(), Some("10.0.0.5"));
        assert_eq!(record.direction, Some(Direction::Uplink));
    }

    #[test]
    fn unknown_never_replaces_known_ip() {
        let mut record = TeidRecord::default();
        record.apply(&TeidPatch::default().subscriber_ip(UNKNOWN_IP));
        assert_eq!(record.subscriber_ip.as_deref(), Some(UNKNOWN_IP));
        assert_eq!(record.known_ip(), None);

        record.apply(&TeidPatch::default().subscriber_ip("10.0.0.5"));
        record.apply(&TeidPatch::default().subscriber_ip(UNKNOWN_IP));
        assert_eq!(record.subscriber_ip.as_deref(), Some("10.0.0.5"));

        record.apply(&TeidPatch::default().subscriber_ip("10.0.0.6"));
        assert_eq!(record.subscriber_ip.as_deref(), Some("10.0.0.6"));
    }

    #[test]
    fn teid_record_fields_use_wire_names() {
        let mut record = TeidRecord::default();
        record.apply(
            &TeidPatch::default()
                .subscriber_ip("10.0.0.5")
                .direction(Direction::Downlink)
                .last_seen(1_700_000_000)
                .call_id("7"),
        );
        let fields = record.to_fields();
        assert_eq!(fields.get("ue_ip").map(String::as_str), Some("10.0.0.5"));
        assert_eq!(fields.get("dir").map(String::as_str), Some("DL"));
        assert_eq!(fields.get("last_seen").map(String::as_str), Some("1700000000"));
        assert_eq!(fields.get("ran_ue_id").map(String::as_str), Some("7"));
        assert!(!fields.contains_key("imsi"));
    }

    #[test]
    fn subscriber_fields_render_canonical_teids() {
        let mut record = SubscriberRecord::default();
        record.apply(
            &SubscriberPatch::default()
                .identity("imsi-001")
                .teids(Teid::from_u32(1), Teid::from_u32(0xabc)),
        );
        let fields = record.to_fields();
        assert_eq!(fields.get("ul_teid").map(String::as_str), Some("00000001"));
        assert_eq!(fields.get("dl_teid").map(String::as_str), Some("00000abc"));
        assert_eq!(fields.get("imsi").map(String::as_str), Some("imsi-001"));
    }

    #[test]
    fn key_schema_rendering() {
        let slice = SliceKey::new("1", "1");
        assert_eq!(StoreKey::Teid(Teid::from_u32(0x1a2b_3c4d)).to_string(), "teid:1a2b3c4d");
        assert_eq!(StoreKey::Subscriber("imsi-001").to_string(), "ue:imsi-001");
        assert_eq!(
            StoreKey::Reverse(ReverseIndex::IpToIdentity, "10.0.0.5").to_string(),
            "ipimsi:10.0.0.5"
        );
        assert_eq!(StoreKey::Slice(&slice).to_string(), "slice:01:000001");
        assert_eq!(StoreKey::IpTeids("10.0.0.5").to_string(), "ueip:10.0.0.5:teids");
    }
}
