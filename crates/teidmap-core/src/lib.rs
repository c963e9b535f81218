//! teidmap-core: Core library for teidmap
//!
//! Correlates 5G control-plane signaling (NGAP) and user-plane session
//! management (PFCP) into per-subscriber records keyed by GTP-U tunnel
//! endpoint identifiers, and answers lookups over HTTP.
//!
//! # Architecture
//!
//! ```text
//! NGAP JSON lines → ControlPlaneAssembler ─┐
//!                                          ├→ RecordStore → Resolver → HTTP API
//! PFCP JSON lines → TunnelAssembler ───────┘
//! ```
//!
//! # Modules
//!
//! - `codec`: TEID, SST/SD and slice handle normalization
//! - `message`: decoded message records and the traits the assemblers read
//! - `session_table`: bounded, idle-expiring tables for transient sessions
//! - `concurrent_map`: sharded map backing the in-memory store
//! - `store`: record schema, the `RecordStore` trait and `MemoryStore`
//! - `control_plane`: NGAP call assembly into subscriber/TEID records
//! - `tunnel`: PFCP sequence pairing into TEID/IP bindings
//! - `resolver`: lookups by TEID, IP, identity and slice
//! - `api`: axum router over the resolver
//! - `capture`: JSON-lines feed loops
//! - `config`: TOML configuration
//! - `logging`: tracing subscriber setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod api;
pub mod capture;
pub mod codec;
pub mod concurrent_map;
pub mod config;
pub mod control_plane;
pub mod error;
pub mod logging;
pub mod message;
pub mod resolver;
pub mod session_table;
pub mod store;
pub mod tunnel;

pub use codec::{Direction, SliceKey, Teid};
pub use config::Config;
pub use control_plane::ControlPlaneAssembler;
pub use error::{Error, Result};
pub use resolver::Resolver;
pub use store::{MemoryStore, RecordStore};
pub use tunnel::TunnelAssembler;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
