//! Property-based tests for control-plane session assembly.
//!
//! Whatever order the attribute-carrying messages arrive in, and however
//! often they repeat, a call completes exactly once and the stored
//! subscriber record is the same.

use std::sync::Arc;
use std::time::Instant;

use proptest::prelude::*;

use teidmap_core::codec::{EMPTY_SD, Teid};
use teidmap_core::control_plane::{ControlPlaneAssembler, Observation};
use teidmap_core::message::NgapRecord;
use teidmap_core::session_table::ExpiryPolicy;
use teidmap_core::store::{MemoryStore, RecordStore};

const WALL: u64 = 1_700_000_000;

fn ngap(json: &str) -> NgapRecord {
    serde_json::from_str(json).unwrap()
}

/// The four messages that together complete call 7.
fn call_messages(ul: u32, dl: u32) -> Vec<NgapRecord> {
    vec![
        ngap(r#"{"ran_ue_ngap_id":7,"nas_5gs_mm_suci_msin":"imsi-001"}"#),
        ngap(r#"{"ran_ue_ngap_id":"7","sst":"1","sd":"ff:ff:ff"}"#),
        ngap(&format!(
            r#"{{"ran_ue_ngap_id":7,"gtp_teid":"0x{ul:08x}","pdusessionresourcesetuprequest_element":{{}}}}"#
        )),
        ngap(&format!(
            r#"{{"ran_ue_ngap_id":7,"gtp_teid":"0x{dl:08x}","pdusessionresourcesetupresponse_element":{{}}}}"#
        )),
    ]
}

/// Indices into [`call_messages`] in arbitrary order, each at least once.
fn arb_delivery() -> impl Strategy<Value = Vec<usize>> {
    (
        Just(vec![0usize, 1, 2, 3]).prop_shuffle(),
        proptest::collection::vec(0usize..4, 0..6),
    )
        .prop_map(|(mut order, extra)| {
            order.extend(extra);
            order
        })
        .prop_shuffle()
}

proptest! {
    #[test]
    fn completes_exactly_once_in_any_order(
        delivery in arb_delivery(),
        ul in any::<u32>(),
        dl in any::<u32>(),
    ) {
        let store = Arc::new(MemoryStore::default());
        let mut asm = ControlPlaneAssembler::new(store.clone(), ExpiryPolicy::default());
        let messages = call_messages(ul, dl);
        let now = Instant::now();

        let mut completions = 0;
        for index in &delivery {
            if let Observation::Completed(_) = asm.observe_at(&messages[*index], now, WALL) {
                completions += 1;
            }
        }
        prop_assert_eq!(completions, 1);
        prop_assert_eq!(asm.stats().completions, 1);

        let record = store.get_subscriber("imsi-001").unwrap().unwrap();
        prop_assert_eq!(record.slice_type.as_deref(), Some("01"));
        prop_assert_eq!(record.slice_differentiator.as_deref(), Some(EMPTY_SD));
        prop_assert_eq!(record.uplink_teid, Some(Teid::from_u32(ul)));
        prop_assert_eq!(record.downlink_teid, Some(Teid::from_u32(dl)));
        prop_assert_eq!(record.call_id.as_deref(), Some("7"));
    }

    #[test]
    fn first_writer_wins_per_attribute(
        first in "imsi-[0-9]{3}",
        second in "imsi-[0-9]{3}",
        first_sst in 0u8..=255,
        second_sst in 0u8..=255,
    ) {
        let store = Arc::new(MemoryStore::default());
        let mut asm = ControlPlaneAssembler::new(store, ExpiryPolicy::default());
        let now = Instant::now();
        for (identity, sst) in [(&first, first_sst), (&second, second_sst)] {
            let msg = ngap(&format!(
                r#"{{"ran_ue_ngap_id":9,"nas_5gs_mm_suci_msin":"{identity}","sst":"{sst:x}"}}"#
            ));
            prop_assert_eq!(asm.observe_at(&msg, now, WALL), Observation::Pending);
        }
        let session = asm.session(9).unwrap();
        prop_assert_eq!(session.identity.as_deref(), Some(first.as_str()));
        let expected_sst = format!("{first_sst:02x}");
        prop_assert_eq!(session.slice_type.as_deref(), Some(expected_sst.as_str()));
        prop_assert!(!session.completed);
    }

    #[test]
    fn messages_without_call_id_never_create_sessions(
        identity in "imsi-[0-9]{3}",
        teid in any::<u32>(),
    ) {
        let store = Arc::new(MemoryStore::default());
        let mut asm = ControlPlaneAssembler::new(store.clone(), ExpiryPolicy::default());
        let msg = ngap(&format!(
            r#"{{"nas_5gs_mm_suci_msin":"{identity}","gtp_teid":"0x{teid:08x}","pdusessionresourcesetuprequest_element":{{}}}}"#
        ));
        prop_assert_eq!(asm.observe(&msg), Observation::Skipped);
        prop_assert_eq!(asm.session_count(), 0);
        prop_assert!(store.all_teid_records().unwrap().is_empty());
    }
}
