//! # harmony-core
//!
//! I/O-free building blocks for discovering and talking to Harmony hubs.
//!
//! - **`protocol`** – the colon-delimited `key=value` wire codec, decoding of
//!   the self-report a hub sends during discovery, and the request/response/
//!   event stanza model used by sessions.
//!
//! - **`domain`** – discovery snapshots ([`DeviceDigest`]) and the hub's
//!   activity model: configuration, activity lookup and normalized
//!   [`HubEvent`]s.
//!
//! Sockets, timers and tasks live in the `harmony-hub` crate.

pub mod domain;
pub mod protocol;

pub use domain::activity::{
    Activity, ActivityStatus, ActivityTable, ControlGroup, Device, Function, HubConfig, HubEvent,
    StateDigest,
};
pub use domain::digest::{DeviceDigest, HubState};
pub use protocol::codec::{decode, encode, ProtocolError, WireMap, WireValue};
pub use protocol::report::decode_report;
pub use protocol::stanza::{ResponseBody, Stanza};
