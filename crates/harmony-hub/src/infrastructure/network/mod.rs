//! Network adapters.

pub mod discovery;
pub mod session;
pub mod transport;
