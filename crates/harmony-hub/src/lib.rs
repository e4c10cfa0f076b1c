//! # harmony-hub
//!
//! Finds Harmony hubs on the local network and keeps a session open to each.
//!
//! - **`infrastructure::network::discovery`** – UDP announcements, the TCP
//!   listener that collects hub self-reports, and Online/Offline tracking.
//! - **`infrastructure::network::session`** – one correlated request/response
//!   session per hub, with activity lookup, key presses and keepalive.
//! - **`application::universe`** – ties the two together: a session per
//!   discovered hub, replaced on rediscovery and closed when the hub goes
//!   offline, with all hub events merged into one stream.
//!
//! The authenticated transport (pairing, login and stanza framing) is supplied
//! by the caller through [`infrastructure::network::transport::HubAuthenticator`].

pub mod application;
pub mod infrastructure;
