//! Domain types with no I/O: discovery snapshots and the hub activity model.

pub mod activity;
pub mod digest;
