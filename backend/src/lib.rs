//! Tandem - OTP Rendezvous and Signaling Relay
//!
//! Lets two peers find each other with a short pairing code read aloud or
//! typed by hand, then relays opaque session-establishment messages (offers,
//! answers, ICE candidates, arbitrary link data) between them over iroh.
//!
//! ## Design Principles
//!
//! * **Zero persistent state** - Everything lives in memory and is gone on restart
//! * **Opaque payloads** - Signals and link data are forwarded verbatim
//! * **Strict pairs** - A connection has at most one peer, and pairing is symmetric
//! * **Order independent** - Either side may request the code; whoever submits second completes the match
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tandem::{Engine, EngineConfig, Hub, Registry, RelayHandler, ALPN};
//! use iroh::protocol::Router;
//! use iroh::Endpoint;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let endpoint = Endpoint::builder().bind().await?;
//!
//! let engine = Engine::new(Arc::new(Registry::new()), EngineConfig::default());
//! let handler = RelayHandler::new(Arc::new(engine), Hub::default());
//!
//! let router = Router::builder(endpoint.clone())
//!     .accept(ALPN, handler)
//!     .spawn();
//! # Ok(())
//! # }
//! ```

pub mod engine;
pub mod error;
pub mod handler;
pub mod hub;
pub mod protocol;
pub mod registry;

// Re-export main types for convenience
pub use engine::{generate_otp, Dispatch, Engine, EngineConfig, Schedule, DEFAULT_GRACE_PERIOD};
pub use error::RegistryError;
pub use handler::RelayHandler;
pub use hub::{Hub, DEFAULT_OUTBOX_CAPACITY};
pub use protocol::{ClientEvent, ConnectionId, ErrorReason, Otp, ServerEvent, ALPN};
pub use registry::{Registry, SessionEntry};
