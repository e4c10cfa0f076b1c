//! Seam between sessions and the hub's authenticated transport.
//!
//! Pairing and login (the XMPP handshake, credentials and stanza framing) are
//! provided by an external [`HubAuthenticator`].  What a session receives back
//! is a [`HubLink`]: a pair of channels carrying already-framed [`Stanza`]s.
//!
//! ```text
//! HubSession ──outbound──► [ link implementation ] ──► hub
//! HubSession ◄──inbound─── [ link implementation ] ◄── hub
//! ```
//!
//! Dropping the outbound sender tells the link implementation to end the
//! connection; the inbound channel closing tells the session the hub is gone.

use std::net::IpAddr;

use async_trait::async_trait;
use harmony_core::{Stanza, WireMap};
use thiserror::Error;
use tokio::sync::mpsc;

/// Error type reported by authenticator implementations.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("hub {addr} unreachable: {source}")]
    Unreachable {
        addr: IpAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("pairing with hub {addr} failed: {reason}")]
    Pairing { addr: IpAddr, reason: String },
    #[error("login to hub {addr} rejected: {reason}")]
    Login { addr: IpAddr, reason: String },
}

/// Identity obtained from the first (guest) login to a hub.
#[derive(Debug, Clone, PartialEq)]
pub struct PairedHub {
    pub identity: String,
    pub friendly_name: String,
    /// Remaining hub info such as `hubId` or `productId`.
    pub fields: WireMap,
}

/// Channels of an authenticated connection to one hub.
#[derive(Debug)]
pub struct HubLink {
    pub outbound: mpsc::Sender<Stanza>,
    pub inbound: mpsc::Receiver<Stanza>,
}

/// The far side of a [`HubLink`], held by whatever speaks to the hub.
#[derive(Debug)]
pub struct LinkEndpoint {
    /// Stanzas the session sends.
    pub requests: mpsc::Receiver<Stanza>,
    /// Stanzas delivered to the session.
    pub replies: mpsc::Sender<Stanza>,
}

impl HubLink {
    /// Creates a connected link/endpoint pair with bounded buffers.
    pub fn pair(capacity: usize) -> (HubLink, LinkEndpoint) {
        let (out_tx, out_rx) = mpsc::channel(capacity);
        let (in_tx, in_rx) = mpsc::channel(capacity);
        (
            HubLink {
                outbound: out_tx,
                inbound: in_rx,
            },
            LinkEndpoint {
                requests: out_rx,
                replies: in_tx,
            },
        )
    }
}

/// Pairs with and logs into a hub.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HubAuthenticator: Send + Sync {
    /// Performs the guest login and returns the hub's session identity.
    async fn pair(&self, addr: IpAddr) -> Result<PairedHub, TransportError>;

    /// Logs in with the identity from [`pair`](Self::pair) and opens the link.
    async fn login(&self, addr: IpAddr, hub: PairedHub) -> Result<HubLink, TransportError>;
}
