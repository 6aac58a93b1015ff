use std::{
    collections::HashMap,
    net::{SocketAddr, TcpListener},
    sync::{atomic::Ordering, Arc, Mutex},
    time::{Duration, Instant},
};

use rand::Rng;

use crate::{peer::PeerSession, swarm::SwarmContext};

const ACCEPT_TIMEOUT: Duration = Duration::from_secs(1);

/// Runs the upload server: accepts inbound connections and serves pieces
/// to admitted peers, subject to the choke/unchoke slot discipline.
/// Returns once `ctx.running` is cleared.
pub fn run(ctx: Arc<SwarmContext>) {
    let listener = match TcpListener::bind(ctx.config.listen_address) {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("upload server could not bind {}: {}", ctx.config.listen_address, e);
            return;
        }
    };
    if let Err(e) = listener.set_nonblocking(false) {
        tracing::warn!("failed to set blocking mode on upload listener: {}", e);
    }
    tracing::info!("upload server listening on {}", ctx.config.listen_address);

    let slots: Arc<Mutex<HashMap<String, Instant>>> = Arc::new(Mutex::new(HashMap::new()));

    let rotation_handle = {
        let ctx = ctx.clone();
        let slots = slots.clone();
        std::thread::spawn(move || run_slot_rotation(ctx, slots))
    };

    while ctx.running.load(Ordering::SeqCst) {
        if ctx.paused.load(Ordering::SeqCst) {
            std::thread::sleep(ACCEPT_TIMEOUT);
            continue;
        }
        match accept_with_timeout(&listener) {
            Ok(Some((stream, addr))) => {
                let ctx = ctx.clone();
                let slots = slots.clone();
                std::thread::spawn(move || {
                    if let Err(e) = serve_peer(ctx, slots, stream, addr) {
                        tracing::debug!("upload session with {} ended: {}", addr, e);
                    }
                });
            }
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!("accept error: {}", e);
            }
        }
    }

    rotation_handle.join().ok();
}

fn accept_with_timeout(listener: &TcpListener) -> std::io::Result<Option<(std::net::TcpStream, SocketAddr)>> {
    // std::net has no accept-with-timeout; polling set_nonblocking with a
    // short sleep gives the same "wake up, check the running flag" shape
    // the reference client gets from `socket.settimeout`.
    listener.set_nonblocking(true)?;
    match listener.accept() {
        Ok((stream, addr)) => {
            stream.set_nonblocking(false)?;
            Ok(Some((stream, addr)))
        }
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
            std::thread::sleep(ACCEPT_TIMEOUT);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn is_admitted(slots: &Mutex<HashMap<String, Instant>>, key: &str, ctx: &SwarmContext) -> bool {
    let mut slots = slots.lock().unwrap();
    if slots.contains_key(key) {
        slots.insert(key.to_string(), Instant::now());
        return true;
    }
    if slots.len() < ctx.config.scheduler.max_slots {
        slots.insert(key.to_string(), Instant::now());
        return true;
    }
    if rand::thread_rng().gen_bool(ctx.config.scheduler.optimistic_unchoke_probability) {
        slots.insert(key.to_string(), Instant::now());
        return true;
    }
    false
}

fn touch_slot(slots: &Mutex<HashMap<String, Instant>>, key: &str) {
    if let Some(activity) = slots.lock().unwrap().get_mut(key) {
        *activity = Instant::now();
    }
}

/// Reads the handshake, decides admission once, and either serves
/// requests for the life of the connection or refuses and closes it —
/// admission is a per-connection decision, not re-checked per request.
fn serve_peer(
    ctx: Arc<SwarmContext>,
    slots: Arc<Mutex<HashMap<String, Instant>>>,
    stream: std::net::TcpStream,
    addr: SocketAddr,
) -> Result<(), crate::peer::PeerError> {
    let pending = PeerSession::accept(stream, addr)?;
    let peer_key = pending.peer_id().map(|id| id.to_string()).unwrap_or_else(|| addr.to_string());

    if ctx.paused.load(Ordering::SeqCst) || !is_admitted(&slots, &peer_key, &ctx) {
        pending.refuse()?;
        return Ok(());
    }

    let mut session = pending.admit()?;
    session.send_bitfield(&ctx.piece_manager.bitfield())?;
    let _peer_bitfield = session.recv_bitfield(ctx.piece_manager.info().num_pieces)?;

    loop {
        if !ctx.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        let index = session.recv_request()?;

        match ctx.piece_manager.read_piece(index) {
            Ok(data) => {
                let len = data.len() as u64;
                session.send_piece(index, &data)?;
                ctx.peer_stats.record_upload(&peer_key, len);
                touch_slot(&slots, &peer_key);
            }
            Err(e) => {
                tracing::debug!("read_piece({}) for {} failed: {}", index, peer_key, e);
                session.send_choked()?;
            }
        }
    }
}

/// Every `slot_rotation_interval`, collapses the slot table down to only
/// its most-recently-active entry, forcing the rest to re-earn admission
/// (either by already holding a slot again later, or via optimistic
/// unchoke) rather than squatting indefinitely.
fn run_slot_rotation(ctx: Arc<SwarmContext>, slots: Arc<Mutex<HashMap<String, Instant>>>) {
    while ctx.running.load(Ordering::SeqCst) {
        std::thread::sleep(ctx.config.scheduler.slot_rotation_interval);
        let mut slots = slots.lock().unwrap();
        if let Some((key, _)) = slots.iter().max_by_key(|(_, &t)| t).map(|(k, t)| (k.clone(), *t)) {
            slots.retain(|k, _| *k == key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{SchedulerConfig, TorrentConfig},
        piece_manager::{FileInfo, PieceManager, StoreInfo},
        stats::PeerStatsTable,
        swarm::ClientState,
        tracker::TrackerClient,
    };
    use std::sync::{atomic::AtomicBool, Mutex as StdMutex};

    fn test_context(max_slots: usize, optimistic_unchoke_probability: f64) -> SwarmContext {
        let dir = tempfile::tempdir().unwrap();
        let info = StoreInfo::new(
            vec![FileInfo { path: "a.bin".into(), length: 10, offset: 0, md5sum: None }],
            10,
            1,
            dir.path().to_path_buf(),
        );
        let mut hasher = sha1::Sha1::new();
        sha1::Digest::update(&mut hasher, [1u8; 10]);
        let hash: [u8; 20] = sha1::Digest::finalize(hasher).into();

        SwarmContext {
            info_hash: [0u8; 20],
            client_id: [0u8; 20],
            piece_manager: PieceManager::new(info, vec![hash]).unwrap(),
            peer_stats: PeerStatsTable::new(),
            trackers: StdMutex::new(Vec::new()),
            tracker_client: TrackerClient::new(),
            known_peers: StdMutex::new(Vec::new()),
            active_peers: StdMutex::new(Vec::new()),
            listen_port: 0,
            config: TorrentConfig {
                scheduler: SchedulerConfig { max_slots, optimistic_unchoke_probability, ..Default::default() },
                ..Default::default()
            },
            running: AtomicBool::new(true),
            paused: AtomicBool::new(false),
            state: StdMutex::new(ClientState::Stopped),
        }
    }

    #[test]
    fn admits_returning_peer_even_when_full() {
        let ctx = test_context(1, 0.0);
        let slots: Mutex<HashMap<String, Instant>> = Mutex::new(HashMap::new());
        assert!(is_admitted(&slots, "peer-a", &ctx));
        assert!(!is_admitted(&slots, "peer-b", &ctx));
        assert!(is_admitted(&slots, "peer-a", &ctx));
    }

    #[test]
    fn never_admits_new_peer_when_full_and_no_optimistic_unchoke() {
        let ctx = test_context(0, 0.0);
        let slots: Mutex<HashMap<String, Instant>> = Mutex::new(HashMap::new());
        assert!(!is_admitted(&slots, "peer-a", &ctx));
    }

    #[test]
    fn rotation_keeps_only_most_recently_active_slot() {
        let slots: Mutex<HashMap<String, Instant>> = Mutex::new(HashMap::new());
        slots.lock().unwrap().insert("old".to_string(), Instant::now() - Duration::from_secs(5));
        slots.lock().unwrap().insert("new".to_string(), Instant::now());

        let mut guard = slots.lock().unwrap();
        if let Some((key, _)) = guard.iter().max_by_key(|(_, &t)| t).map(|(k, t)| (k.clone(), *t)) {
            guard.retain(|k, _| *k == key);
        }
        drop(guard);

        let remaining = slots.lock().unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(remaining.contains_key("new"));
    }

    #[test]
    fn denied_peer_is_choked_and_connection_closes_without_bitfield_exchange() {
        let ctx = Arc::new(test_context(0, 0.0));
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let slots: Arc<Mutex<HashMap<String, Instant>>> = Arc::new(Mutex::new(HashMap::new()));
        let server_ctx = ctx.clone();
        let server = std::thread::spawn(move || {
            let (stream, peer_addr) = listener.accept().unwrap();
            serve_peer(server_ctx, slots, stream, peer_addr)
        });

        let client = PeerSession::connect(addr, "client-denied");
        assert!(matches!(client, Err(crate::peer::PeerError::Refused)));

        server.join().unwrap().unwrap();
    }
}
