pub mod scheduler;
pub mod upload;

use std::{
    net::{SocketAddr, TcpListener},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use crate::{
    config::{ClientConfig, TorrentConfig},
    metainfo::{MetaInfo, MetaInfoError},
    peer::PeerRecord,
    piece_manager::{PieceManager, PieceManagerError, StoreInfo},
    stats::PeerStatsTable,
    tracker::{AnnounceParams, Event, Tracker, TrackerClient, TrackerError},
};

#[derive(Debug, thiserror::Error)]
pub enum SwarmError {
    #[error("metainfo error: {0}")]
    MetaInfo(#[from] MetaInfoError),

    #[error("piece manager error: {0}")]
    PieceManager(#[from] PieceManagerError),

    #[error("tracker error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not bind a listen port in the configured range")]
    NoPortAvailable,
}

pub type Result<T> = std::result::Result<T, SwarmError>;

/// A torrent's lifecycle state. `Downloading` and `Seeding` both transition
/// through `Paused` and back; `Stopped` is only reached by an explicit
/// stop, or by finishing without a seed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Stopped,
    Downloading,
    Seeding,
    Paused,
}

/// Read-only state shared across the scheduler, upload server, and
/// background threads, all reached through locks or atomics rather than
/// message passing since there's no async task boundary to cross.
pub struct SwarmContext {
    pub info_hash: [u8; 20],
    pub client_id: [u8; 20],
    pub piece_manager: PieceManager,
    pub peer_stats: PeerStatsTable,
    pub trackers: Mutex<Vec<Vec<Tracker>>>,
    pub tracker_client: TrackerClient,
    pub known_peers: Mutex<Vec<PeerRecord>>,
    pub active_peers: Mutex<Vec<PeerRecord>>,
    pub listen_port: u16,
    pub config: TorrentConfig,
    pub running: AtomicBool,
    pub paused: AtomicBool,
    pub state: Mutex<ClientState>,
}

impl SwarmContext {
    pub fn peer_id(&self) -> String {
        hex::encode(self.client_id)
    }

    pub fn set_state(&self, state: ClientState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn state(&self) -> ClientState {
        *self.state.lock().unwrap()
    }

    /// Merges freshly-announced peers into `known_peers`, keyed by
    /// `peer_id` rather than address so a reconnecting peer updates its
    /// existing record instead of duplicating it.
    fn merge_known_peers(&self, fresh: Vec<PeerRecord>) {
        let mut known = self.known_peers.lock().unwrap();
        for peer in fresh {
            match known.iter_mut().find(|p| p.peer_id == peer.peer_id) {
                Some(existing) => {
                    existing.ip = peer.ip;
                    existing.port = peer.port;
                    existing.touch();
                }
                None => known.push(peer),
            }
        }
    }
}

/// Top-level controller for one torrent: owns the piece manager and
/// tracker bookkeeping, and runs the scheduler and upload server.
pub struct Swarm {
    ctx: Arc<SwarmContext>,
}

impl Swarm {
    pub fn new(metainfo: MetaInfo, config: TorrentConfig, client_config: ClientConfig) -> Result<Self> {
        let store_info = StoreInfo::new(
            metainfo.files(),
            metainfo.piece_len(),
            metainfo.num_pieces() as usize,
            config.output_dir.clone(),
        );
        let piece_manager = PieceManager::new(store_info, metainfo.piece_hashes())?;

        let (listener, listen_port) = bind_with_fallback(config.listen_address, &client_config)?;
        // Listener is only needed to claim the port up front and hand off
        // to the upload server; drop it here and let the upload server
        // re-bind the exact address it already proved is free.
        let listen_address = listener.local_addr()?;
        drop(listener);

        let ctx = SwarmContext {
            info_hash: metainfo.info_hash(),
            client_id: client_config.client_id,
            piece_manager,
            peer_stats: PeerStatsTable::new(),
            trackers: Mutex::new(metainfo.trackers()),
            tracker_client: TrackerClient::new(),
            known_peers: Mutex::new(Vec::new()),
            active_peers: Mutex::new(Vec::new()),
            listen_port,
            config: TorrentConfig { listen_address, ..config },
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            state: Mutex::new(ClientState::Stopped),
        };

        Ok(Self { ctx: Arc::new(ctx) })
    }

    /// Runs the torrent: announces to trackers, spawns the upload server
    /// and housekeeping threads, and drives the download scheduler on the
    /// calling thread. If the torrent completes and `config.seed` is set,
    /// transitions to `Seeding` and blocks serving uploads until `stop` is
    /// called; otherwise tears down once the scheduler (or an already
    /// complete piece manager) is done.
    #[tracing::instrument(skip(self))]
    pub fn start(&self) -> Result<()> {
        self.ctx.running.store(true, Ordering::SeqCst);
        let already_complete = self.ctx.piece_manager.all_complete();
        self.ctx.set_state(if already_complete { ClientState::Seeding } else { ClientState::Downloading });
        tracing::info!("starting torrent, info_hash={}", hex::encode(self.ctx.info_hash));

        self.announce(Some(Event::Started))?;

        let sweep_handle = {
            let ctx = self.ctx.clone();
            std::thread::spawn(move || run_stats_sweep(ctx))
        };

        let tracker_handle = {
            let ctx = self.ctx.clone();
            std::thread::spawn(move || run_tracker_loop(ctx))
        };

        let upload_handle = if self.ctx.config.seed {
            let ctx = self.ctx.clone();
            Some(std::thread::spawn(move || upload::run(ctx)))
        } else {
            None
        };

        if self.ctx.config.download {
            scheduler::run(self.ctx.clone());
        } else {
            tracing::info!("--download not set, seeding existing pieces only");
        }

        let seeding = self.ctx.config.seed && self.ctx.piece_manager.all_complete();
        if seeding {
            self.ctx.set_state(ClientState::Seeding);
            self.announce(Some(Event::Completed))?;
            tracing::info!("download complete, seeding until stopped");
            // Block here for as long as the torrent seeds; `stop()` clears
            // `running`, which unwinds the upload/tracker/sweep loops and
            // lets these joins return.
            if let Some(handle) = upload_handle {
                handle.join().ok();
            }
            tracker_handle.join().ok();
            sweep_handle.join().ok();
        } else {
            self.ctx.running.store(false, Ordering::SeqCst);
            self.ctx.set_state(ClientState::Stopped);
            self.announce(Some(Event::Stopped))?;

            tracker_handle.join().ok();
            sweep_handle.join().ok();
            if let Some(handle) = upload_handle {
                handle.join().ok();
            }
        }

        Ok(())
    }

    pub fn stop(&self) {
        self.ctx.running.store(false, Ordering::SeqCst);
        self.ctx.set_state(ClientState::Stopped);
    }

    pub fn pause(&self) {
        self.ctx.paused.store(true, Ordering::SeqCst);
        self.ctx.set_state(ClientState::Paused);
    }

    pub fn resume(&self) {
        self.ctx.paused.store(false, Ordering::SeqCst);
        let resumed = if self.ctx.piece_manager.all_complete() { ClientState::Seeding } else { ClientState::Downloading };
        self.ctx.set_state(resumed);
    }

    fn announce(&self, event: Option<Event>) -> Result<()> {
        let mut tiers = self.ctx.trackers.lock().unwrap();
        for tier in tiers.iter_mut() {
            for tracker in tier {
                let left = self.ctx.piece_manager.missing_pieces().len() as u64
                    * self.ctx.piece_manager.info().piece_len as u64;
                let params = AnnounceParams {
                    info_hash: self.ctx.info_hash,
                    peer_id: self.ctx.peer_id(),
                    port: self.ctx.listen_port,
                    uploaded: 0,
                    downloaded: 0,
                    left,
                    event,
                    seeding: self.ctx.piece_manager.all_complete(),
                };
                let peers = self.ctx.tracker_client.announce(tracker, params);
                self.ctx.merge_known_peers(peers);
            }
        }
        Ok(())
    }
}

fn bind_with_fallback(preferred: SocketAddr, client_config: &ClientConfig) -> Result<(TcpListener, u16)> {
    if let Ok(listener) = TcpListener::bind(preferred) {
        let port = listener.local_addr()?.port();
        return Ok((listener, port));
    }
    for port in client_config.port_search_range.clone() {
        let candidate = SocketAddr::new(preferred.ip(), port);
        if let Ok(listener) = TcpListener::bind(candidate) {
            return Ok((listener, port));
        }
    }
    Err(SwarmError::NoPortAvailable)
}

fn run_stats_sweep(ctx: Arc<SwarmContext>) {
    while ctx.running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_secs(5));
        if ctx.paused.load(Ordering::SeqCst) {
            continue;
        }
        ctx.peer_stats.sweep(ctx.config.scheduler.stats_ttl);
    }
}

fn run_tracker_loop(ctx: Arc<SwarmContext>) {
    let mut last = Instant::now();
    while ctx.running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_secs(1));
        if ctx.paused.load(Ordering::SeqCst) {
            continue;
        }
        if last.elapsed() < Duration::from_secs(15) {
            continue;
        }
        last = Instant::now();

        let mut tiers = ctx.trackers.lock().unwrap();
        for tier in tiers.iter_mut() {
            for tracker in tier {
                if !tracker.should_announce(Instant::now()) {
                    continue;
                }
                let left = ctx.piece_manager.missing_pieces().len() as u64 * ctx.piece_manager.info().piece_len as u64;
                let params = AnnounceParams {
                    info_hash: ctx.info_hash,
                    peer_id: ctx.peer_id(),
                    port: ctx.listen_port,
                    uploaded: 0,
                    downloaded: 0,
                    left,
                    event: None,
                    seeding: ctx.piece_manager.all_complete(),
                };
                let peers = ctx.tracker_client.announce(tracker, params);
                ctx.merge_known_peers(peers);
            }
        }
    }
}
