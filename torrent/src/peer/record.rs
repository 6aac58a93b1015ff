use std::{
    net::{IpAddr, SocketAddr},
    time::Instant,
};

use crate::Bitfield;

/// What the swarm knows about one remote peer, independent of whether a
/// session to it is currently open. Identity is `peer_id`, not address —
/// peers may reconnect from a different port.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub peer_id: String,
    pub ip: IpAddr,
    pub port: u16,
    pub last_seen: Instant,
    pub bitfield: Option<Bitfield>,
}

impl PeerRecord {
    pub fn new(peer_id: String, ip: IpAddr, port: u16) -> Self {
        Self { peer_id, ip, port, last_seen: Instant::now(), bitfield: None }
    }

    pub fn address(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }
}
