//! Reliable, ordered message channel layered over a reconnecting WebSocket, with an in-band
//! TCP-tunneling side channel (the "jet channel"). See `PersistentWebsocket` for the entry point.

pub mod config;
pub mod engine;
pub mod error;
pub mod framer;
pub mod journal;
pub mod socket;
pub mod tcp_connector;
pub mod timers;

pub use config::EngineConfig;
pub use engine::PersistentWebsocket;
pub use error::PwError;
pub use socket::{dial, FastWsTransport, LoopbackTransport, WsTransport};
