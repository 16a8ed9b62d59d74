//! A Kademlia DHT peer.
//!
//! Clients store and retrieve values over a framed TCP API (`DHT_PUT`,
//! `DHT_GET`), while peers replicate and locate them over a separate TCP P2P
//! protocol. See [Dht::start] to run a node, and [Config] for its settings.

// Public modules
mod common;

pub mod config;
mod dht;
mod error;
pub mod messages;
pub mod rpc;
pub mod server;
pub mod store;

pub use crate::common::{Id, KBucket, Peer, Prefix, RoutingTable, UpdateOutcome, ID_SIZE};
pub use bytes::Bytes;
pub use config::Config;
pub use dht::{Dht, ShutdownHandle};
pub use error::{Error, Result};
