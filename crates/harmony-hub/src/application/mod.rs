//! Application layer: state kept across discovery rounds and the orchestration
//! of sessions on top of it.
//!
//! - **`registry`** – Online/Offline bookkeeping for every hub heard from.
//! - **`universe`** – one supervised session per hub address.

pub mod registry;
pub mod universe;
