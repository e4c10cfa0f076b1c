//! Discovery snapshot of a single hub.
//!
//! A [`DeviceDigest`] is built from one decoded self-report.  The registry in
//! `harmony-hub` keeps one digest per [`DeviceDigest::key`] and flips its
//! [`HubState`] as reports arrive and age out.

use std::fmt;
use std::net::IpAddr;
use std::time::Instant;

use crate::protocol::codec::{WireMap, WireValue};

/// Report field carrying the hub's address.
pub const FIELD_IP: &str = "ip";
/// Report field carrying the hub's stable identity.
pub const FIELD_UUID: &str = "uuid";
/// Report field carrying the user-assigned hub name.
pub const FIELD_FRIENDLY_NAME: &str = "friendlyName";

/// Liveness of a hub as seen by discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HubState {
    Online,
    Offline,
}

impl fmt::Display for HubState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HubState::Online => f.write_str("online"),
            HubState::Offline => f.write_str("offline"),
        }
    }
}

/// One hub's most recent discovery snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceDigest {
    pub address: IpAddr,
    /// Absent on a partial report.
    pub uuid: Option<String>,
    pub friendly_name: String,
    /// Every self-reported field, in report order.
    pub fields: WireMap,
    pub state: HubState,
    pub last_seen: Instant,
}

impl DeviceDigest {
    /// Builds an Online digest from a decoded self-report.
    ///
    /// The address comes from the `ip` field when it parses, otherwise from
    /// the TCP peer.  A missing friendly name falls back to the address.
    pub fn from_report(fields: WireMap, peer: IpAddr, now: Instant) -> Self {
        let address = text_field(&fields, FIELD_IP)
            .and_then(|ip| ip.parse::<IpAddr>().ok())
            .unwrap_or(peer);
        let uuid = text_field(&fields, FIELD_UUID)
            .filter(|u| !u.is_empty())
            .map(str::to_string);
        let friendly_name = text_field(&fields, FIELD_FRIENDLY_NAME)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| address.to_string());

        Self {
            address,
            uuid,
            friendly_name,
            fields,
            state: HubState::Online,
            last_seen: now,
        }
    }

    /// Registry key: the uuid, or the address for partial reports.
    pub fn key(&self) -> String {
        match &self.uuid {
            Some(uuid) => uuid.clone(),
            None => self.address.to_string(),
        }
    }

    /// Returns a scalar self-reported field.
    pub fn field(&self, name: &str) -> Option<&str> {
        text_field(&self.fields, name)
    }

    pub fn is_online(&self) -> bool {
        self.state == HubState::Online
    }
}

fn text_field<'a>(fields: &'a WireMap, name: &str) -> Option<&'a str> {
    fields.get(name).and_then(WireValue::as_str).map(str::trim)
}
