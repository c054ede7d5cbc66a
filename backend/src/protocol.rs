//! Protocol message types for the signaling relay.
//!
//! Every frame is one JSON object per line, shaped as
//! `{"event": <name>, "data": <payload>}`. Event names are the external
//! contract and keep their historical spelling (`OTPrequest`, `peerSocketId`).

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// The ALPN protocol identifier for the relay service.
pub const ALPN: &[u8] = b"tandem/1";

/// Opaque identity of one live transport connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random connection id (32 lower-case hex chars).
    pub fn generate() -> Self {
        use rand::RngCore;

        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(base16ct::lower::encode_string(&bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// A pairing code.
///
/// Clients may submit codes as JSON numbers or strings; both forms are
/// normalized to trimmed text so `123456` and `"123456"` compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Otp(String);

impl Otp {
    pub fn new(code: impl AsRef<str>) -> Self {
        Self(code.as_ref().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<u32> for Otp {
    fn from(code: u32) -> Self {
        Self(code.to_string())
    }
}

impl fmt::Display for Otp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawCode {
    Number(u64),
    Float(f64),
    Text(String),
}

impl<'de> Deserialize<'de> for Otp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match RawCode::deserialize(deserializer)? {
            RawCode::Number(n) => Self(n.to_string()),
            // Whole floats such as `123456.0` name the same code as `123456`
            RawCode::Float(f) if f.fract() == 0.0 && (0.0..=u64::MAX as f64).contains(&f) => {
                Self((f as u64).to_string())
            }
            RawCode::Float(f) => Self(f.to_string()),
            RawCode::Text(s) => Self::new(s),
        })
    }
}

impl Serialize for Otp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// Payload of a `callPeer` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallPeer {
    /// The connection to ring.
    pub peer_to_call: ConnectionId,
    /// Opaque session-offer payload.
    pub signal_data: Value,
    /// Caller id as claimed by the client; forwarded as-is.
    pub from: ConnectionId,
}

/// Payload of an `acceptCall` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptCall {
    pub to: ConnectionId,
    pub signal: Value,
}

/// Events sent from a client to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    /// Ask the server to repeat this connection's id.
    #[serde(rename = "clienthello")]
    ClientHello,
    /// Ask for a freshly generated pairing code.
    #[serde(rename = "OTPrequest")]
    OtpRequest,
    /// Submit a pairing code read off the other device.
    #[serde(rename = "pairingRequest")]
    PairingRequest(Otp),
    /// Forward an offer to another connection.
    #[serde(rename = "callPeer")]
    CallPeer(CallPeer),
    /// Forward an answer back to the caller.
    #[serde(rename = "acceptCall")]
    AcceptCall(AcceptCall),
    /// Opaque data for the paired peer.
    #[serde(rename = "link")]
    Link(Value),
}

/// Payload of a `calling` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calling {
    pub signal: Value,
    pub from: ConnectionId,
}

/// Events sent from the server to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    /// The id the server assigned to this connection.
    #[serde(rename = "serverack")]
    ServerAck(ConnectionId),
    /// A freshly generated pairing code.
    #[serde(rename = "otp")]
    Otp(u32),
    /// Pairing complete; carries the other side's id.
    #[serde(rename = "peerSocketId")]
    PeerSocketId(ConnectionId),
    #[serde(rename = "calling")]
    Calling(Calling),
    #[serde(rename = "callAccepted")]
    CallAccepted(Value),
    #[serde(rename = "link")]
    Link(Value),
    /// The paired peer went away.
    #[serde(rename = "peerDisconnected")]
    PeerDisconnected,
    /// Input could not be processed. Only ever sent to the offending client.
    #[serde(rename = "error")]
    Error(ErrorReason),
}

/// Error reasons returned by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorReason {
    /// The line was not a recognised event.
    InvalidMessage,
}

impl fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorReason::InvalidMessage => write!(f, "invalid_message"),
        }
    }
}
