//! Shared fakes for the integration tests.
//!
//! [`FakeHub`] answers engine commands on the far side of a [`HubLink`] the
//! way a real hub does; [`FakeAuthenticator`] hands out links to fake hubs.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use harmony_core::protocol::stanza::{command, STATE_DIGEST_NOTIFY};
use harmony_core::{decode, Stanza, WireMap};
use harmony_hub::infrastructure::network::transport::{
    HubAuthenticator, HubLink, LinkEndpoint, PairedHub, TransportError,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const WATCH_TV: &str = "12345";

pub const CONFIG_JSON: &str = r#"{
    "activity": [
        { "id": "-1", "label": "PowerOff", "isAVActivity": false, "controlGroup": [] },
        {
            "id": "12345",
            "label": "Watch TV",
            "isAVActivity": true,
            "controlGroup": [
                {
                    "name": "Volume",
                    "function": [
                        {
                            "action": "{\"command\":\"Mute\",\"type\":\"IRCommand\",\"deviceId\":\"555\"}",
                            "name": "Mute",
                            "label": "Mute"
                        }
                    ]
                }
            ]
        }
    ],
    "device": []
}"#;

/// Behaviour of a [`FakeHub`].
#[derive(Debug, Clone)]
pub struct FakeHubOptions {
    /// Activity id reported by `getCurrentActivity`.
    pub current: String,
    /// Commands the hub never answers.
    pub silent: Vec<&'static str>,
}

impl Default for FakeHubOptions {
    fn default() -> Self {
        Self {
            current: "-1".to_string(),
            silent: Vec::new(),
        }
    }
}

/// Scripted hub.
///
/// - `config` → [`CONFIG_JSON`]
/// - `getCurrentActivity` → `result=<current>`
/// - `startactivity` → acknowledged, then a Running state digest event
/// - `holdAction` → recorded only
/// - `echo` → held until two arrive, then both answered in reverse order
///   with their own body
pub struct FakeHub {
    pub requests: Arc<Mutex<Vec<Stanza>>>,
    events: mpsc::Sender<Stanza>,
    handle: JoinHandle<()>,
}

impl FakeHub {
    pub fn spawn(endpoint: LinkEndpoint, options: FakeHubOptions) -> Self {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let events = endpoint.replies.clone();
        let handle = tokio::spawn(serve(endpoint, options, Arc::clone(&requests)));
        Self {
            requests,
            events,
            handle,
        }
    }

    /// Pushes an unsolicited stanza to the session.
    pub async fn push(&self, stanza: Stanza) {
        self.events.send(stanza).await.expect("session gone");
    }

    /// Commands received so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter_map(|stanza| match stanza {
                Stanza::Request { command, .. } => Some(command.clone()),
                _ => None,
            })
            .collect()
    }

    /// Bodies of every request for `name`.
    pub fn bodies(&self, name: &str) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter_map(|stanza| match stanza {
                Stanza::Request { command, body, .. } if command == name => Some(body.clone()),
                _ => None,
            })
            .collect()
    }

    /// Polls until `name` has been received, up to two seconds.
    pub async fn wait_for_command(&self, name: &str) {
        for _ in 0..200 {
            if self.commands().iter().any(|c| c == name) {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("hub never received {name}");
    }

    /// Drops the hub side of the link.
    pub async fn disconnect(self) {
        self.handle.abort();
        let _ = self.handle.await;
        drop(self.events);
    }
}

pub fn state_digest(activity_id: &str, status: u8) -> Stanza {
    Stanza::Event {
        kind: STATE_DIGEST_NOTIFY.to_string(),
        body: format!(
            r#"{{"activityId":"{activity_id}","runningActivityList":"{activity_id}","activityStatus":{status}}}"#
        ),
    }
}

async fn serve(
    mut endpoint: LinkEndpoint,
    mut options: FakeHubOptions,
    requests: Arc<Mutex<Vec<Stanza>>>,
) {
    let mut echoes: Vec<(String, String)> = Vec::new();

    while let Some(stanza) = endpoint.requests.recv().await {
        requests.lock().unwrap().push(stanza.clone());
        let Stanza::Request { id, command: name, body } = stanza else {
            continue;
        };
        if options.silent.iter().any(|s| *s == name) {
            continue;
        }

        let mut out = Vec::new();
        match name.as_str() {
            command::CONFIG => out.push(response(id, CONFIG_JSON)),
            command::GET_CURRENT_ACTIVITY => {
                out.push(response(id, &format!("result={}", options.current)));
            }
            command::START_ACTIVITY => {
                let requested = decode(&body)
                    .and_then(|fields: WireMap| {
                        fields
                            .get("activityId")
                            .and_then(|v| v.as_str())
                            .map(str::to_string)
                    })
                    .unwrap_or_default();
                options.current = requested.clone();
                out.push(response(id, "errorCode=200:errorString=OK"));
                out.push(state_digest(&requested, 2));
            }
            "echo" => {
                echoes.push((id, body));
                if echoes.len() == 2 {
                    for (id, body) in echoes.drain(..).rev() {
                        out.push(response(id, &body));
                    }
                }
            }
            _ => {}
        }

        for stanza in out {
            if endpoint.replies.send(stanza).await.is_err() {
                return;
            }
        }
    }
}

fn response(id: String, body: &str) -> Stanza {
    Stanza::Response {
        id,
        body: body.to_string(),
    }
}

/// Creates a link with a fake hub on its far side.
pub fn fake_link(options: FakeHubOptions) -> (HubLink, FakeHub) {
    let (link, endpoint) = HubLink::pair(32);
    (link, FakeHub::spawn(endpoint, options))
}

// ── Authenticator ─────────────────────────────────────────────────────────────

type PairHook = Box<dyn Fn(IpAddr) + Send + Sync>;

/// Authenticator whose logins open links to [`FakeHub`]s.
#[derive(Default)]
pub struct FakeAuthenticator {
    names: HashMap<IpAddr, String>,
    failing: HashSet<IpAddr>,
    hub_options: FakeHubOptions,
    on_pair: Option<PairHook>,
    pub pairs: Mutex<Vec<IpAddr>>,
    pub hubs: Mutex<Vec<(IpAddr, FakeHub)>>,
}

impl FakeAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(mut self, addr: &str, name: &str) -> Self {
        self.names.insert(addr.parse().unwrap(), name.to_string());
        self
    }

    pub fn failing(mut self, addr: &str) -> Self {
        self.failing.insert(addr.parse().unwrap());
        self
    }

    pub fn with_hub_options(mut self, options: FakeHubOptions) -> Self {
        self.hub_options = options;
        self
    }

    /// Runs `hook` at the start of every pairing attempt.
    pub fn on_pair(mut self, hook: impl Fn(IpAddr) + Send + Sync + 'static) -> Self {
        self.on_pair = Some(Box::new(hook));
        self
    }

    /// Polls until the `index`-th hub handed out has received `name`.
    pub async fn wait_for_command(&self, index: usize, name: &str) {
        for _ in 0..200 {
            let seen = self
                .hubs
                .lock()
                .unwrap()
                .get(index)
                .is_some_and(|(_, hub)| hub.commands().iter().any(|c| c == name));
            if seen {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("hub {index} never received {name}");
    }

    pub fn pair_count(&self, addr: &str) -> usize {
        let addr: IpAddr = addr.parse().unwrap();
        self.pairs.lock().unwrap().iter().filter(|a| **a == addr).count()
    }
}

#[async_trait]
impl HubAuthenticator for FakeAuthenticator {
    async fn pair(&self, addr: IpAddr) -> Result<PairedHub, TransportError> {
        if let Some(hook) = &self.on_pair {
            hook(addr);
        }
        self.pairs.lock().unwrap().push(addr);
        if self.failing.contains(&addr) {
            return Err(TransportError::Pairing {
                addr,
                reason: "guest login refused".to_string(),
            });
        }
        Ok(PairedHub {
            identity: format!("identity-{addr}"),
            friendly_name: self
                .names
                .get(&addr)
                .cloned()
                .unwrap_or_else(|| format!("Hub {addr}")),
            fields: WireMap::new(),
        })
    }

    async fn login(&self, addr: IpAddr, _hub: PairedHub) -> Result<HubLink, TransportError> {
        let (link, hub) = fake_link(self.hub_options.clone());
        self.hubs.lock().unwrap().push((addr, hub));
        Ok(link)
    }
}
