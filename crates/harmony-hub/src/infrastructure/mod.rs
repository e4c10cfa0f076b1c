//! Infrastructure layer: sockets, tasks and the configuration file.
//!
//! **Dependency rule**: this layer may use `harmony_core` and the registry in
//! `application`, but the domain types in `harmony_core` never import it.

pub mod network;
pub mod storage;
