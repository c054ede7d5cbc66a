//! Pairing and relay engine.
//!
//! The engine turns one input event from one connection into zero or more
//! [`Dispatch`]es addressed to connections. It never touches the network;
//! delivering dispatches is the [`Hub`](crate::hub::Hub)'s job.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::protocol::{AcceptCall, CallPeer, Calling, ClientEvent, ConnectionId, Otp, ServerEvent};
use crate::registry::Registry;

/// Delay between a disconnect and the peer's `peerDisconnected` notice.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(200);

/// Smallest generated pairing code.
pub const OTP_MIN: u32 = 100_000;

/// Largest generated pairing code.
pub const OTP_MAX: u32 = 999_999;

/// Generate a six-digit pairing code. Not a secret.
pub fn generate_otp() -> u32 {
    rand::thread_rng().gen_range(OTP_MIN..=OTP_MAX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub grace_period: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

/// When a dispatch should go out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    Now,
    /// Send after `delay`, unless `cancel_key` connects again first.
    Deferred {
        delay: Duration,
        cancel_key: ConnectionId,
    },
}

/// One outbound event addressed to a single connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub to: ConnectionId,
    pub event: ServerEvent,
    pub schedule: Schedule,
}

impl Dispatch {
    pub fn now(to: ConnectionId, event: ServerEvent) -> Self {
        Self {
            to,
            event,
            schedule: Schedule::Now,
        }
    }

    pub fn deferred(
        to: ConnectionId,
        event: ServerEvent,
        delay: Duration,
        cancel_key: ConnectionId,
    ) -> Self {
        Self {
            to,
            event,
            schedule: Schedule::Deferred { delay, cancel_key },
        }
    }
}

/// The pairing and relay state machine.
#[derive(Debug, Clone)]
pub struct Engine {
    registry: Arc<Registry>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(registry: Arc<Registry>, config: EngineConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// A transport connection was opened.
    pub fn connect(&self, id: &ConnectionId) -> Vec<Dispatch> {
        if let Err(e) = self.registry.create(id.clone()) {
            warn!(conn_id = %id, "Connect for live id: {}", e);
        } else {
            info!(conn_id = %id, "Client connected");
        }
        vec![Dispatch::now(id.clone(), ServerEvent::ServerAck(id.clone()))]
    }

    /// A transport connection went away.
    ///
    /// The entry is removed immediately; the former peer hears about it after
    /// the grace period.
    pub fn disconnect(&self, id: &ConnectionId) -> Vec<Dispatch> {
        let entry = match self.registry.remove(id) {
            Ok(entry) => entry,
            Err(e) => {
                debug!(conn_id = %id, "Ignoring disconnect: {}", e);
                return Vec::new();
            }
        };
        info!(conn_id = %id, peer_id = ?entry.peer_id, "Client disconnected");

        entry
            .peer_id
            .map(|peer| {
                Dispatch::deferred(
                    peer,
                    ServerEvent::PeerDisconnected,
                    self.config.grace_period,
                    id.clone(),
                )
            })
            .into_iter()
            .collect()
    }

    /// Handle one event received from connection `id`.
    pub fn handle(&self, id: &ConnectionId, event: ClientEvent) -> Vec<Dispatch> {
        match event {
            ClientEvent::ClientHello => self.handle_client_hello(id),
            ClientEvent::OtpRequest => self.handle_otp_request(id),
            ClientEvent::PairingRequest(code) => self.handle_pairing_request(id, code),
            ClientEvent::CallPeer(call) => self.handle_call_peer(id, call),
            ClientEvent::AcceptCall(accept) => self.handle_accept_call(id, accept),
            ClientEvent::Link(payload) => self.handle_link(id, payload),
        }
    }

    fn handle_client_hello(&self, id: &ConnectionId) -> Vec<Dispatch> {
        if !self.registry.contains(id) {
            debug!(conn_id = %id, "Hello from unknown connection");
            return Vec::new();
        }
        vec![Dispatch::now(id.clone(), ServerEvent::ServerAck(id.clone()))]
    }

    fn handle_otp_request(&self, id: &ConnectionId) -> Vec<Dispatch> {
        let code = generate_otp();
        match self.registry.set_otp(id, Otp::from(code)) {
            Ok(()) => {
                debug!(conn_id = %id, otp = code, "Issued pairing code");
                vec![Dispatch::now(id.clone(), ServerEvent::Otp(code))]
            }
            Err(e) => {
                debug!(conn_id = %id, "Dropping code request: {}", e);
                Vec::new()
            }
        }
    }

    /// Whoever submits second finds the first and both sides are told.
    fn handle_pairing_request(&self, id: &ConnectionId, code: Otp) -> Vec<Dispatch> {
        debug!(conn_id = %id, otp = %code, "Pairing request");

        match self.registry.pair_with_code(id, code) {
            Ok(Some(peer)) => {
                info!(conn_id = %id, peer_id = %peer, "Pairing complete");
                vec![
                    Dispatch::now(id.clone(), ServerEvent::PeerSocketId(peer.clone())),
                    Dispatch::now(peer, ServerEvent::PeerSocketId(id.clone())),
                ]
            }
            Ok(None) => {
                debug!(conn_id = %id, "No peer waiting on this code yet");
                Vec::new()
            }
            Err(e) => {
                debug!(conn_id = %id, "Dropping pairing request: {}", e);
                Vec::new()
            }
        }
    }

    fn handle_call_peer(&self, id: &ConnectionId, call: CallPeer) -> Vec<Dispatch> {
        debug!(conn_id = %id, target = %call.peer_to_call, "Calling peer");
        let calling = Calling {
            signal: call.signal_data,
            from: call.from,
        };
        vec![Dispatch::now(call.peer_to_call, ServerEvent::Calling(calling))]
    }

    fn handle_accept_call(&self, id: &ConnectionId, accept: AcceptCall) -> Vec<Dispatch> {
        debug!(conn_id = %id, target = %accept.to, "Call accepted");
        vec![Dispatch::now(accept.to, ServerEvent::CallAccepted(accept.signal))]
    }

    fn handle_link(&self, id: &ConnectionId, payload: serde_json::Value) -> Vec<Dispatch> {
        match self.registry.peer_of(id) {
            Some(peer) => vec![Dispatch::now(peer, ServerEvent::Link(payload))],
            None => {
                debug!(conn_id = %id, "Link from unpaired connection dropped");
                Vec::new()
            }
        }
    }
}
