//! Canonical forms for the identifiers both signaling streams share.
//!
//! A TEID is always stored and compared as 8 lowercase hex digits without a
//! `0x` prefix, whatever notation the dissector used. Slice halves are kept
//! at fixed hex width (SST 2, SD 6) and hashed into a stable `slice_id`
//! handle for external tooling.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Placeholder written when no subscriber IP is known yet.
pub const UNKNOWN_IP: &str = "unknown";

/// Control-plane SD value meaning "no differentiator".
pub const RESERVED_SD: &str = "ffffff";

/// Stored in place of [`RESERVED_SD`].
pub const EMPTY_SD: &str = "empty";

const SST_WIDTH: usize = 2;
const SD_WIDTH: usize = 6;
const TEID_WIDTH: usize = 8;

/// Whether `ip` carries a real address rather than the placeholder.
#[must_use]
pub fn is_known_ip(ip: &str) -> bool {
    !ip.is_empty() && ip != UNKNOWN_IP
}

/// Lowercase, strip `0x`, left-pad with zeros to `width`.
///
/// Empty input stays empty. Longer input is never truncated.
#[must_use]
pub fn norm_hex(s: &str, width: usize) -> String {
    if s.is_empty() {
        return String::new();
    }
    let s = s.to_ascii_lowercase().replace("0x", "");
    format!("{s:0>width$}")
}

// ---------------------------------------------------------------------------
// TEID
// ---------------------------------------------------------------------------

/// Tunnel endpoint identifier in canonical textual form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Teid(u32);

impl Teid {
    #[must_use]
    pub const fn from_u32(value: u32) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }

    /// Parse a TEID as a dissector presents it.
    ///
    /// Accepted: `0x`-prefixed hex, colon-separated hex byte dumps, all-digit
    /// decimal, and bare hex. An all-digit string is read as decimal.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if let Some(hex) = strip_hex_prefix(raw) {
            return Self::from_hex_digits(hex);
        }
        if raw.contains(':') {
            return Self::from_hex_digits(&raw.replace(':', ""));
        }
        if raw.bytes().all(|b| b.is_ascii_digit()) {
            return raw.parse::<u32>().ok().map(Self);
        }
        Self::from_hex_digits(raw)
    }

    /// Parse text already known to be hexadecimal (store pointers, API paths).
    #[must_use]
    pub fn from_hex(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let digits = strip_hex_prefix(raw).unwrap_or(raw).replace(':', "");
        Self::from_hex_digits(&digits)
    }

    fn from_hex_digits(digits: &str) -> Option<Self> {
        if digits.is_empty() || digits.len() > TEID_WIDTH {
            return None;
        }
        u32::from_str_radix(digits, 16).ok().map(Self)
    }

    /// `0x`-prefixed canonical form.
    #[must_use]
    pub fn as_prefixed(self) -> String {
        format!("0x{self}")
    }
}

fn strip_hex_prefix(raw: &str) -> Option<&str> {
    raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X"))
}

impl fmt::Display for Teid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl Serialize for Teid {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Teid {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::from_hex(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid TEID: {raw}")))
    }
}

// ---------------------------------------------------------------------------
// Direction
// ---------------------------------------------------------------------------

/// Tunnel direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "UL")]
    Uplink,
    #[serde(rename = "DL")]
    Downlink,
}

impl Direction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Uplink => "UL",
            Self::Downlink => "DL",
        }
    }

    /// Case-insensitive parse of `UL` / `DL`.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "UL" => Some(Self::Uplink),
            "DL" => Some(Self::Downlink),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Slice
// ---------------------------------------------------------------------------

/// Normalize a control-plane SD as captured (`ff:ff:ff`, `FFFFFF`, ...).
///
/// The reserved all-ones value becomes [`EMPTY_SD`].
#[must_use]
pub fn normalize_captured_sd(raw: &str) -> String {
    let sd = raw.trim().replace(':', "").to_ascii_lowercase();
    let sd = sd.strip_prefix("0x").unwrap_or(sd.as_str());
    if sd == RESERVED_SD {
        EMPTY_SD.to_string()
    } else {
        sd.to_string()
    }
}

/// Network slice identity at canonical hex width.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SliceKey {
    pub sst: String,
    pub sd: String,
}

impl SliceKey {
    /// Build a key, normalizing both halves. [`EMPTY_SD`] is kept verbatim.
    #[must_use]
    pub fn new(sst: &str, sd: &str) -> Self {
        Self {
            sst: norm_hex(sst.trim(), SST_WIDTH),
            sd: normalize_sd(sd),
        }
    }

    /// Stable 32-bit handle for this slice.
    #[must_use]
    pub fn slice_id(&self) -> u32 {
        slice_id(&self.sst, &self.sd)
    }
}

impl fmt::Display for SliceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.sst, self.sd)
    }
}

/// Normalize an SD half to width 6, leaving [`EMPTY_SD`] untouched.
#[must_use]
pub fn normalize_sd(sd: &str) -> String {
    let sd = sd.trim();
    if sd.eq_ignore_ascii_case(EMPTY_SD) {
        EMPTY_SD.to_string()
    } else {
        norm_hex(sd, SD_WIDTH)
    }
}

/// Normalize an SST half to width 2.
#[must_use]
pub fn normalize_sst(sst: &str) -> String {
    norm_hex(sst.trim(), SST_WIDTH)
}

/// CRC-32 (IEEE) of `"{sst}:{sd}"`.
#[must_use]
pub fn slice_id(sst: &str, sd: &str) -> u32 {
    crc32fast::hash(format!("{sst}:{sd}").as_bytes())
}

/// Tunnel-argument string consumed by the GTP latency probe.
///
/// Pair: `0xUL:0xDL@slice`, single: `0xTEID@slice`, neither: empty.
#[must_use]
pub fn teid_args(ul: Option<Teid>, dl: Option<Teid>, slice_id: u32) -> String {
    match (ul, dl) {
        (Some(ul), Some(dl)) => format!("0x{ul}:0x{dl}@{slice_id}"),
        (Some(teid), None) | (None, Some(teid)) => format!("0x{teid}@{slice_id}"),
        (None, None) => String::new(),
    }
}
