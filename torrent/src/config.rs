use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

/// Per-torrent knobs: where to write, where to listen, how hard to chase
/// peers.
#[derive(Debug, Clone)]
pub struct TorrentConfig {

    pub output_dir: PathBuf,

    pub listen_address: SocketAddr,

    pub announce_interval: Duration,

    pub min_max_peers: (u32, u32),

    /// Whether to run the upload server once the torrent is complete (or
    /// concurrently with download). `--no-seed` on the CLI disables this.
    pub seed: bool,

    /// Whether to run the download scheduler at all. `--download` on the
    /// CLI sets this; otherwise the client only seeds whatever pieces are
    /// already present on disk.
    pub download: bool,

    pub scheduler: SchedulerConfig,

}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("downloads"),
            listen_address: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 6881),
            announce_interval: Duration::from_secs(1800),
            min_max_peers: (5, 100),
            seed: true,
            download: true,
            scheduler: SchedulerConfig::default(),
        }
    }
}

/// Tunables for the download scheduler and upload server, broken out of
/// `TorrentConfig` so tests can shrink them without touching the rest.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {

    /// Number of worker threads pulling from the piece queue.
    pub max_concurrent: usize,

    /// Attempts before a piece is abandoned for a retry round.
    pub max_retries: u32,

    /// Probability (0.0..=1.0) a worker picks a random peer instead of the
    /// best-scoring one, to keep exploring the swarm.
    pub exploration_probability: f64,

    /// Concurrent upload slots, excluding optimistic unchokes.
    pub max_slots: usize,

    /// Probability (0.0..=1.0) an otherwise-full upload server admits a
    /// new peer anyway (optimistic unchoke).
    pub optimistic_unchoke_probability: f64,

    /// How often upload slots are reconsidered.
    pub slot_rotation_interval: Duration,

    /// Entries in the peer-stats table older than this are pruned.
    pub stats_ttl: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            max_retries: 3,
            exploration_probability: 0.3,
            max_slots: 4,
            optimistic_unchoke_probability: 0.1,
            slot_rotation_interval: Duration::from_secs(30),
            stats_ttl: Duration::from_secs(10),
        }
    }
}

/// Client-wide identity, independent of any single torrent.
#[derive(Debug, Clone)]
pub struct ClientConfig {

    pub client_id: [u8; 20],

    /// Inclusive port range tried in order when the listen address's port
    /// is already taken.
    pub port_search_range: std::ops::RangeInclusive<u16>,

}

const DEFAULT_CLIENT_ID: [u8; 20] = *b"-RS0133-73b3b0b0b0b0";

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID,
            port_search_range: 6881..=6890,
        }
    }
}
