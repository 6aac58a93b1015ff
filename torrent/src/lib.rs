#![allow(dead_code)]

pub mod config;
pub mod de;
pub mod metainfo;
pub mod peer;
pub mod piece_manager;
pub mod stats;
pub mod swarm;
pub mod tracker;

/// Pieces are requested and served whole; there is no 16 KiB block
/// subdivision in this wire protocol.
type Bitfield = bitvec::vec::BitVec<u8, bitvec::order::Msb0>;

pub use config::{ClientConfig, TorrentConfig};
pub use metainfo::MetaInfo;
pub use swarm::{Swarm, SwarmError};
