//! Decoded-message capability interfaces.
//!
//! The dissection layer is external. It hands over one decoded record per
//! packet; the assemblers only ever ask for the named fields below and treat
//! every one of them as optional. [`NgapRecord`] and [`PfcpRecord`] are the
//! JSON-lines shapes the dissector emits.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

/// PFCP message type: Session Establishment Request.
pub const SESSION_ESTABLISHMENT_REQUEST: u8 = 50;

/// PFCP information element type codes used for correlation.
pub mod ie_type {
    /// F-TEID, carries the uplink TEID.
    pub const F_TEID: u16 = 21;
    /// Outer Header Creation, carries the downlink TEID.
    pub const OUTER_HEADER_CREATION: u16 = 84;
    /// UE IP Address.
    pub const UE_IP_ADDRESS: u16 = 93;
}

/// Accessors a control-plane (NGAP) decoded message may answer.
pub trait ControlPlaneMessage {
    /// Transient call identifier (RAN UE NGAP ID).
    fn call_id(&self) -> Option<u64>;
    /// Subscriber permanent identifier fragment (SUCI MSIN).
    fn identity(&self) -> Option<&str>;
    fn slice_type(&self) -> Option<&str>;
    fn slice_differentiator(&self) -> Option<&str>;
    /// GTP TEID carried in a transport-layer information element.
    fn gtp_teid(&self) -> Option<&str>;
    /// A PDU session resource setup request item accompanies the TEID.
    fn has_setup_request_container(&self) -> bool;
    /// A PDU session resource setup response item accompanies the TEID.
    fn has_setup_response_container(&self) -> bool;
}

/// Accessors a tunnel-management (PFCP) decoded message may answer.
pub trait TunnelMessage {
    /// Whether the record belongs to the managed protocol at all.
    fn is_managed_protocol(&self) -> bool;
    fn message_type(&self) -> u8;
    /// Transaction sequence number; zero is treated as absent.
    fn sequence(&self) -> Option<u32>;
    /// Top-level information elements (each may nest children).
    fn elements(&self) -> &[InformationElement];
}

/// One information element of a tunnel-management message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InformationElement {
    #[serde(rename = "type")]
    pub ie_type: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<Ipv4Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub teid: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<InformationElement>,
}

impl InformationElement {
    #[must_use]
    pub fn new(ie_type: u16) -> Self {
        Self {
            ie_type,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_ipv4(mut self, ip: Ipv4Addr) -> Self {
        self.ipv4 = Some(ip);
        self
    }

    #[must_use]
    pub fn with_teid(mut self, teid: u32) -> Self {
        self.teid = Some(teid);
        self
    }

    #[must_use]
    pub fn with_child(mut self, child: Self) -> Self {
        self.children.push(child);
        self
    }
}

/// Flatten a nested element tree into every element it contains.
///
/// Walks with an explicit stack, so sibling order comes out reversed and
/// parents precede their children.
#[must_use]
pub fn collect_elements(roots: &[InformationElement]) -> Vec<&InformationElement> {
    let mut out = Vec::new();
    let mut stack: Vec<&InformationElement> = roots.iter().collect();
    while let Some(current) = stack.pop() {
        out.push(current);
        stack.extend(current.children.iter());
    }
    out
}

/// Integer fields arrive as JSON numbers or as decimal strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(u64),
    Text(String),
}

impl FieldValue {
    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(s) => s.trim().parse().ok(),
        }
    }
}

/// Decoded NGAP packet as emitted by the dissector.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NgapRecord {
    pub ran_ue_ngap_id: Option<FieldValue>,
    #[serde(rename = "nas_5gs_mm_suci_msin")]
    pub suci_msin: Option<String>,
    pub sst: Option<String>,
    pub sd: Option<String>,
    pub gtp_teid: Option<String>,
    #[serde(rename = "pdusessionresourcesetuprequest_element")]
    pub setup_request_element: Option<serde_json::Value>,
    #[serde(rename = "pdusessionresourcesetupresponse_element")]
    pub setup_response_element: Option<serde_json::Value>,
}

fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(|s| s.trim()).filter(|s| !s.is_empty())
}

impl ControlPlaneMessage for NgapRecord {
    fn call_id(&self) -> Option<u64> {
        self.ran_ue_ngap_id.as_ref().and_then(FieldValue::as_u64)
    }

    fn identity(&self) -> Option<&str> {
        non_empty(self.suci_msin.as_ref())
    }

    fn slice_type(&self) -> Option<&str> {
        non_empty(self.sst.as_ref())
    }

    fn slice_differentiator(&self) -> Option<&str> {
        non_empty(self.sd.as_ref())
    }

    fn gtp_teid(&self) -> Option<&str> {
        non_empty(self.gtp_teid.as_ref())
    }

    fn has_setup_request_container(&self) -> bool {
        self.setup_request_element.is_some()
    }

    fn has_setup_response_container(&self) -> bool {
        self.setup_response_element.is_some()
    }
}

fn default_protocol() -> String {
    "pfcp".to_string()
}

/// Decoded PFCP packet as emitted by the dissector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PfcpRecord {
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub message_type: u8,
    #[serde(default)]
    pub seq: Option<u32>,
    #[serde(default)]
    pub ies: Vec<InformationElement>,
}

impl Default for PfcpRecord {
    fn default() -> Self {
        Self {
            protocol: default_protocol(),
            message_type: 0,
            seq: None,
            ies: Vec::new(),
        }
    }
}

impl TunnelMessage for PfcpRecord {
    fn is_managed_protocol(&self) -> bool {
        self.protocol.eq_ignore_ascii_case("pfcp")
    }

    fn message_type(&self) -> u8 {
        self.message_type
    }

    fn sequence(&self) -> Option<u32> {
        self.seq.filter(|seq| *seq != 0)
    }

    fn elements(&self) -> &[InformationElement] {
        &self.ies
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ngap_record_decodes_dissector_fields() {
        let line = r#"{"ran_ue_ngap_id":"7","nas_5gs_mm_suci_msin":"imsi-001","sd":"ff:ff:ff",
            "gtp_teid":"1a:2b:3c:4d","pdusessionresourcesetuprequest_element":"present"}"#;
        let record: NgapRecord = serde_json::from_str(line).unwrap();
        assert_eq!(record.call_id(), Some(7));
        assert_eq!(record.identity(), Some("imsi-001"));
        assert_eq!(record.slice_differentiator(), Some("ff:ff:ff"));
        assert_eq!(record.slice_type(), None);
        assert!(record.has_setup_request_container());
        assert!(!record.has_setup_response_container());
    }

    #[test]
    fn ngap_call_id_accepts_numbers_and_rejects_blanks() {
        let record: NgapRecord = serde_json::from_str(r#"{"ran_ue_ngap_id":42}"#).unwrap();
        assert_eq!(record.call_id(), Some(42));
        let record: NgapRecord = serde_json::from_str(r#"{"ran_ue_ngap_id":""}"#).unwrap();
        assert_eq!(record.call_id(), None);
        let record: NgapRecord = serde_json::from_str(r#"{"sst":"1"}"#).unwrap();
        assert_eq!(record.call_id(), None);
    }

    #[test]
    fn null_container_counts_as_absent() {
        let record: NgapRecord =
            serde_json::from_str(r#"{"pdusessionresourcesetupresponse_element":null}"#).unwrap();
        assert!(!record.has_setup_response_container());
    }

    #[test]
    fn pfcp_record_decodes_nested_elements() {
        let line = r#"{"message_type":50,"seq":99,"ies":[
            {"type":1,"children":[{"type":2,"children":[{"type":93,"ipv4":"10.0.0.5"}]}]}]}"#;
        let record: PfcpRecord = serde_json::from_str(line).unwrap();
        assert!(record.is_managed_protocol());
        assert_eq!(record.sequence(), Some(99));
        let all = collect_elements(record.elements());
        assert_eq!(all.len(), 3);
        assert!(all
            .iter()
            .any(|ie| ie.ie_type == ie_type::UE_IP_ADDRESS
                && ie.ipv4 == Some(Ipv4Addr::new(10, 0, 0, 5))));
    }

    #[test]
    fn pfcp_zero_sequence_is_absent() {
        let record = PfcpRecord {
            seq: Some(0),
            ..PfcpRecord::default()
        };
        assert_eq!(record.sequence(), None);
    }

    #[test]
    fn other_protocols_are_unmanaged() {
        let record: PfcpRecord = serde_json::from_str(r#"{"protocol":"gtpv2"}"#).unwrap();
        assert!(!record.is_managed_protocol());
    }

    #[test]
    fn collect_elements_visits_every_depth() {
        let tree = vec![
            InformationElement::new(1).with_child(
                InformationElement::new(3)
                    .with_child(InformationElement::new(ie_type::F_TEID).with_teid(5)),
            ),
            InformationElement::new(ie_type::OUTER_HEADER_CREATION).with_teid(6),
        ];
        let types: Vec<u16> = collect_elements(&tree).iter().map(|ie| ie.ie_type).collect();
        assert_eq!(types, vec![ie_type::OUTER_HEADER_CREATION, 1, 3, ie_type::F_TEID]);
    }
}
