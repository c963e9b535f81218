//! Long-lived capture loops.
//!
//! The dissector delivers decoded messages as JSON lines. Each loop reads one
//! line, hands it to its assembler and only then reads the next. A line that
//! does not decode is counted and skipped; only a failing reader ends a loop
//! early. Session tables are swept every `sweep_interval` messages.

use std::io::BufRead;
use std::time::Instant;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::control_plane::ControlPlaneAssembler;
use crate::error::Result;
use crate::message::{NgapRecord, PfcpRecord};
use crate::tunnel::TunnelAssembler;

/// Counters for one finished loop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoopSummary {
    pub feed: String,
    pub lines: u64,
    pub messages: u64,
    pub malformed: u64,
    pub sweeps: u64,
    pub expired: u64,
}

/// An assembler a capture loop can drive.
pub trait FeedConsumer {
    /// Wire record decoded from each line.
    type Message: DeserializeOwned;

    /// Feed name used in logs and summaries.
    const FEED: &'static str;

    fn consume(&mut self, message: &Self::Message);

    /// Sweep transient state; returns how many entries expired.
    fn sweep_sessions(&mut self, now: Instant) -> usize;
}

impl FeedConsumer for ControlPlaneAssembler {
    type Message = NgapRecord;
    const FEED: &'static str = "ngap";

    fn consume(&mut self, message: &NgapRecord) {
        self.observe(message);
    }

    fn sweep_sessions(&mut self, now: Instant) -> usize {
        self.sweep(now).expired
    }
}

impl FeedConsumer for TunnelAssembler {
    type Message = PfcpRecord;
    const FEED: &'static str = "pfcp";

    fn consume(&mut self, message: &PfcpRecord) {
        self.observe(message);
    }

    fn sweep_sessions(&mut self, now: Instant) -> usize {
        self.sweep(now).expired
    }
}

/// Read JSON lines from `reader` into `consumer` until end of input.
pub fn run_feed<R, C>(mut reader: R, consumer: &mut C, sweep_interval: u64) -> Result<LoopSummary>
where
    R: BufRead,
    C: FeedConsumer,
{
    let feed = C::FEED;
    let mut summary = LoopSummary {
        feed: feed.to_string(),
        ..LoopSummary::default()
    };
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            break;
        }
        summary.lines += 1;
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice::<C::Message>(&line) {
            Ok(message) => {
                consumer.consume(&message);
                summary.messages += 1;
            }
            Err(err) => {
                summary.malformed += 1;
                warn!(feed, line = summary.lines, error = %err, "malformed decoded message skipped");
                continue;
            }
        }
        if sweep_interval > 0 && summary.messages % sweep_interval == 0 {
            let expired = consumer.sweep_sessions(Instant::now());
            summary.sweeps += 1;
            summary.expired += u64::try_from(expired).unwrap_or(u64::MAX);
        }
    }
    info!(
        feed,
        lines = summary.lines,
        messages = summary.messages,
        malformed = summary.malformed,
        "capture feed ended"
    );
    Ok(summary)
}

/// NGAP feed into the control-plane assembler.
pub fn run_control_plane_loop<R: BufRead>(
    reader: R,
    assembler: &mut ControlPlaneAssembler,
    sweep_interval: u64,
) -> Result<LoopSummary> {
    let summary = run_feed(reader, assembler, sweep_interval)?;
    let stats = assembler.stats();
    debug!(
        completions = stats.completions,
        skipped = stats.skipped,
        store_failures = stats.store_failures,
        "control-plane loop stats"
    );
    Ok(summary)
}

/// PFCP feed into the tunnel assembler.
pub fn run_tunnel_loop<R: BufRead>(
    reader: R,
    assembler: &mut TunnelAssembler,
    sweep_interval: u64,
) -> Result<LoopSummary> {
    let summary = run_feed(reader, assembler, sweep_interval)?;
    let stats = assembler.stats();
    debug!(
        teid_writes = stats.teid_writes,
        no_anchor = stats.no_anchor,
        store_failures = stats.store_failures,
        "tunnel loop stats"
    );
    Ok(summary)
}
