//! Struct and implementation of the Peer entry in the Kademlia routing table
use std::fmt::{self, Debug, Formatter};
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};

use crate::common::Id;

#[derive(Clone, Copy)]
/// A network-addressable node: `<ip, port, id>`.
///
/// Two peers are equal if they have the same [Id], regardless of address.
pub struct Peer {
    pub id: Id,
    pub address: SocketAddr,
}

impl Peer {
    /// Creates a new Peer from an id and socket address.
    pub fn new(id: Id, address: SocketAddr) -> Peer {
        Peer { id, address }
    }

    /// Creates a peer with a random Id at the given address, useful for testing.
    pub fn random(address: SocketAddr) -> Peer {
        Peer {
            id: Id::random(),
            address,
        }
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn ip(&self) -> IpAddr {
        self.address.ip()
    }

    pub fn port(&self) -> u16 {
        self.address.port()
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Peer {}

impl Hash for Peer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state)
    }
}

impl Debug for Peer {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let id = self.id.to_string();
        write!(f, "Peer({} {})", self.address, &id[..10])
    }
}
