//! Per-connection relay protocol engine.
//!
//! Speaks the EVENT/REQ/CLOSE/AUTH subset of NIP-01/NIP-42 over JSON array
//! frames. All connection state lives behind one lock and every frame is
//! handled to completion — including the broadcast fan-out for an accepted
//! event — before the next one is processed, so subscribers never observe
//! reordered events.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    time::{SystemTime, UNIX_EPOCH},
};

use parking_lot::Mutex;
use rand::{thread_rng, Rng};
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedSender;

use crate::{
    event::{verify_event, Event},
    filter::{any_match, Filter},
    replicate::Replicator,
    store::EventStore,
};

/// Maximum allowed clock skew for AUTH events, in seconds.
const AUTH_WINDOW_SECS: u64 = 300;

/// Write-policy switches fixed at engine construction.
#[derive(Debug, Clone, Copy)]
pub struct RelayPolicy {
    /// Require NIP-42 authentication before accepting writes.
    pub auth_required: bool,
    /// Treat every connection as open: writes accepted unconditionally.
    pub open_relay: bool,
}

/// Identifier for a registered connection; assigned in registration order.
pub type ConnId = u64;

struct Connection {
    outbound: UnboundedSender<String>,
    open_relay: bool,
    challenge: String,
    authed_pubkey: Option<String>,
    subscriptions: HashMap<String, Vec<Filter>>,
}

struct EngineState {
    next_id: ConnId,
    connections: BTreeMap<ConnId, Connection>,
    allowed_authors: HashSet<String>,
    frames_in: u64,
    frames_out: u64,
}

/// The relay protocol engine shared by every connection of one listener.
pub struct RelayEngine {
    store: EventStore,
    policy: RelayPolicy,
    replicator: Replicator,
    state: Mutex<EngineState>,
}

impl RelayEngine {
    pub fn new(store: EventStore, policy: RelayPolicy, replicator: Replicator) -> Self {
        Self {
            store,
            policy,
            replicator,
            state: Mutex::new(EngineState {
                next_id: 1,
                connections: BTreeMap::new(),
                allowed_authors: HashSet::new(),
                frames_in: 0,
                frames_out: 0,
            }),
        }
    }

    /// Event store backing this engine.
    pub fn store(&self) -> &EventStore {
        &self.store
    }

    /// Register a new connection and issue its challenge. When write
    /// authentication applies, the AUTH challenge is pushed immediately.
    pub fn register(&self, outbound: UnboundedSender<String>) -> ConnId {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        let conn = Connection {
            outbound,
            open_relay: self.policy.open_relay,
            challenge: new_challenge(),
            authed_pubkey: None,
            subscriptions: HashMap::new(),
        };
        if self.policy.auth_required && !conn.open_relay {
            let frame = json!(["AUTH", conn.challenge]).to_string();
            if conn.outbound.send(frame).is_ok() {
                state.frames_out += 1;
            }
        }
        state.connections.insert(id, conn);
        id
    }

    /// Drop a connection and all of its subscriptions.
    pub fn unregister(&self, id: ConnId) {
        self.state.lock().connections.remove(&id);
    }

    /// Replace the set of authors permitted to write under auth. The list is
    /// owned by an external policy collaborator; this is its update seam.
    pub fn set_allowed_authors(&self, authors: HashSet<String>) {
        self.state.lock().allowed_authors = authors;
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// Total frames processed and sent since construction.
    pub fn frame_counts(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.frames_in, state.frames_out)
    }

    /// Challenge issued to a connection.
    pub fn challenge_for(&self, id: ConnId) -> Option<String> {
        self.state
            .lock()
            .connections
            .get(&id)
            .map(|c| c.challenge.clone())
    }

    /// Authenticated pubkey recorded for a connection, if any.
    pub fn authed_pubkey(&self, id: ConnId) -> Option<String> {
        self.state
            .lock()
            .connections
            .get(&id)
            .and_then(|c| c.authed_pubkey.clone())
    }

    /// Handle one inbound text frame from a connection.
    pub fn handle_frame(&self, id: ConnId, raw: &str) {
        let mut state = self.state.lock();
        state.frames_in += 1;
        if !state.connections.contains_key(&id) {
            return;
        }
        let val: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(_) => {
                notice(&mut state, id, "invalid: could not parse message");
                return;
            }
        };
        let Some(arr) = val.as_array() else {
            notice(&mut state, id, "invalid: expected an array frame");
            return;
        };
        match arr.first().and_then(|v| v.as_str()) {
            Some("EVENT") => self.handle_event(&mut state, id, arr, raw),
            Some("REQ") => self.handle_req(&mut state, id, arr),
            Some("CLOSE") => {
                if let (Some(conn), Some(sub)) = (
                    state.connections.get_mut(&id),
                    arr.get(1).and_then(|v| v.as_str()),
                ) {
                    conn.subscriptions.remove(sub);
                }
            }
            Some("AUTH") => self.handle_auth(&mut state, id, arr),
            _ => {}
        }
    }

    fn handle_event(&self, state: &mut EngineState, id: ConnId, arr: &[Value], raw: &str) {
        let Some(ev_val) = arr.get(1) else {
            notice(state, id, "invalid: EVENT requires an event object");
            return;
        };
        let ev: Event = match serde_json::from_value(ev_val.clone()) {
            Ok(ev) => ev,
            Err(_) => {
                notice(state, id, "invalid: malformed event");
                return;
            }
        };
        if verify_event(&ev).is_err() {
            ok(state, id, &ev.id, false, "invalid: signature");
            return;
        }
        if !self.write_allowed(state, id, &ev.pubkey) {
            ok(state, id, &ev.id, false, "restricted: write");
            return;
        }
        if let Err(e) = self.store.ingest(&ev, raw) {
            log::error!("event persist failed: {e}");
            ok(state, id, &ev.id, false, "error: could not persist event");
            return;
        }
        ok(state, id, &ev.id, true, "");
        broadcast(state, &ev);
        let author_allowed = state.allowed_authors.contains(&ev.pubkey);
        self.replicator.trigger(&ev, author_allowed);
    }

    fn handle_req(&self, state: &mut EngineState, id: ConnId, arr: &[Value]) {
        let Some(sub) = arr.get(1).and_then(|v| v.as_str()).map(|s| s.to_string()) else {
            notice(state, id, "invalid: REQ requires a subscription id");
            return;
        };
        let filters: Vec<Filter> = arr[2..].iter().filter_map(Filter::from_value).collect();
        let stored = match self.store.all() {
            Ok(events) => events,
            Err(e) => {
                log::error!("event replay failed: {e}");
                vec![]
            }
        };
        let Some(conn) = state.connections.get_mut(&id) else {
            return;
        };
        conn.subscriptions.insert(sub.clone(), filters.clone());
        let mut sent = 0u64;
        for ev in &stored {
            if any_match(&filters, ev) {
                let frame = json!(["EVENT", sub, ev]).to_string();
                if conn.outbound.send(frame).is_ok() {
                    sent += 1;
                }
            }
        }
        let eose = json!(["EOSE", sub]).to_string();
        if conn.outbound.send(eose).is_ok() {
            sent += 1;
        }
        state.frames_out += sent;
    }

    fn handle_auth(&self, state: &mut EngineState, id: ConnId, arr: &[Value]) {
        let Some(ev_val) = arr.get(1) else {
            notice(state, id, "invalid: AUTH requires an event object");
            return;
        };
        let ev: Event = match serde_json::from_value(ev_val.clone()) {
            Ok(ev) => ev,
            Err(_) => {
                notice(state, id, "invalid: malformed event");
                return;
            }
        };
        if verify_event(&ev).is_err() {
            ok(state, id, &ev.id, false, "invalid: signature");
            return;
        }
        let Some(conn) = state.connections.get(&id) else {
            return;
        };
        if ev.tag_value("challenge") != Some(conn.challenge.as_str()) {
            ok(state, id, &ev.id, false, "invalid: challenge");
            return;
        }
        if now_unix().abs_diff(ev.created_at) > AUTH_WINDOW_SECS {
            ok(state, id, &ev.id, false, "invalid: stale");
            return;
        }
        if let Some(conn) = state.connections.get_mut(&id) {
            conn.authed_pubkey = Some(ev.pubkey.clone());
        }
        ok(state, id, &ev.id, true, "");
    }

    fn write_allowed(&self, state: &EngineState, id: ConnId, pubkey: &str) -> bool {
        let Some(conn) = state.connections.get(&id) else {
            return false;
        };
        if conn.open_relay {
            return true;
        }
        if !self.policy.auth_required {
            return true;
        }
        match &conn.authed_pubkey {
            Some(authed) => authed == pubkey && state.allowed_authors.contains(pubkey),
            None => false,
        }
    }
}

/// Push an accepted event to every matching subscription of every live
/// connection, in connection-registration order.
fn broadcast(state: &mut EngineState, ev: &Event) {
    let mut sent = 0u64;
    for conn in state.connections.values() {
        for (sub, filters) in &conn.subscriptions {
            if any_match(filters, ev) {
                let frame = json!(["EVENT", sub, ev]).to_string();
                if conn.outbound.send(frame).is_ok() {
                    sent += 1;
                }
            }
        }
    }
    state.frames_out += sent;
}

fn ok(state: &mut EngineState, id: ConnId, event_id: &str, accepted: bool, reason: &str) {
    send(state, id, json!(["OK", event_id, accepted, reason]));
}

fn notice(state: &mut EngineState, id: ConnId, message: &str) {
    send(state, id, json!(["NOTICE", message]));
}

fn send(state: &mut EngineState, id: ConnId, frame: Value) {
    if let Some(conn) = state.connections.get(&id) {
        if conn.outbound.send(frame.to_string()).is_ok() {
            state.frames_out += 1;
        }
    }
}

/// Generate a fresh 32-hex-digit connection challenge.
fn new_challenge() -> String {
    hex::encode(thread_rng().gen::<[u8; 16]>())
}

/// Current Unix timestamp in seconds.
pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
