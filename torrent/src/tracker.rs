use std::{
    collections::HashSet,
    net::IpAddr,
    time::{Duration, Instant},
};

use serde::Deserialize;
use url::Url;

use crate::peer::PeerRecord;

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("tracker returned malformed response")]
    MalformedResponse,
}

pub type Result<T> = std::result::Result<T, TrackerError>;

/// Announce events, sent on the first and last request of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Started,
    Stopped,
    Completed,
}

impl Event {
    fn as_str(self) -> &'static str {
        match self {
            Event::Started => "started",
            Event::Stopped => "stopped",
            Event::Completed => "completed",
        }
    }
}

pub struct AnnounceParams {
    pub info_hash: [u8; 20],
    pub peer_id: String,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Option<Event>,
    pub seeding: bool,
}

/// One tracker URL, with its own announce bookkeeping. A torrent usually
/// has several of these grouped into priority tiers (`MetaInfo::trackers`).
#[derive(Debug, Clone)]
pub struct Tracker {
    pub url: Url,
    pub tracker_id: Option<String>,
    pub last_announce: Option<Instant>,
    pub interval: Duration,
}

impl Tracker {
    pub fn new(url: Url) -> Self {
        Self { url, tracker_id: None, last_announce: None, interval: Duration::from_secs(1800) }
    }

    /// Whether enough time has passed since the last announce that we're
    /// allowed to contact this tracker again (doesn't force it).
    pub fn can_announce(&self, now: Instant) -> bool {
        match self.last_announce {
            None => true,
            Some(last) => now.duration_since(last) >= Duration::from_secs(5),
        }
    }

    /// Whether the tracker's advertised interval has elapsed and we
    /// should re-announce even without a specific event to report.
    pub fn should_announce(&self, now: Instant) -> bool {
        match self.last_announce {
            None => true,
            Some(last) => now.duration_since(last) >= self.interval,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AnnounceResponse {
    #[serde(default)]
    interval: Option<u64>,
    #[serde(default)]
    tracker_id: Option<String>,
    #[serde(default)]
    peers: Vec<PeerEntry>,
}

#[derive(Debug, Deserialize)]
struct PeerEntry {
    peer_id: String,
    ip: IpAddr,
    port: u16,
}

const EXPECTED_PORT_RANGE: std::ops::RangeInclusive<u16> = 6881..=6890;
const EPHEMERAL_PORT_RANGE: std::ops::RangeInclusive<u16> = 49152..=65535;
const MAX_RETRIES: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_secs(10);

/// Stateless helper that performs one JSON announce over HTTP, with
/// retries and self/garbage-port filtering. `Tracker` holds the
/// per-tracker state this consults and updates.
pub struct TrackerClient {
    http: reqwest::blocking::Client,
}

impl TrackerClient {
    pub fn new() -> Self {
        Self { http: reqwest::blocking::Client::new() }
    }

    /// Announces to `tracker`, retrying transient HTTP failures up to
    /// `MAX_RETRIES` times with a fixed backoff. Exhausting retries is
    /// non-fatal: the caller just gets no new peers this round.
    pub fn announce(&self, tracker: &mut Tracker, params: AnnounceParams) -> Vec<PeerRecord> {
        let self_peer_id = params.peer_id.clone();
        let mut attempt = 0;
        loop {
            match self.try_announce(tracker, &params) {
                Ok(peers) => {
                    tracker.last_announce = Some(Instant::now());
                    return self.filter_peers(peers, &self_peer_id);
                }
                Err(e) => {
                    attempt += 1;
                    tracing::warn!("announce to {} failed (attempt {}/{}): {}", tracker.url, attempt, MAX_RETRIES, e);
                    if attempt >= MAX_RETRIES {
                        tracing::error!("giving up announcing to {} after {} attempts", tracker.url, attempt);
                        return Vec::new();
                    }
                    std::thread::sleep(RETRY_BACKOFF);
                }
            }
        }
    }

    fn try_announce(&self, tracker: &Tracker, params: &AnnounceParams) -> Result<Vec<PeerEntry>> {
        // `tracker.url` is already the complete announce endpoint, per the
        // metainfo `announce` key convention — no path to append.
        let mut request = self.http
            .get(tracker.url.clone())
            .query(&[
                ("torrent_hash", hex::encode(params.info_hash)),
                ("peer_id", params.peer_id.clone()),
                ("port", params.port.to_string()),
                ("downloaded", params.downloaded.to_string()),
                ("uploaded", params.uploaded.to_string()),
                ("left", params.left.to_string()),
                ("seeding", params.seeding.to_string()),
            ]);
        if let Some(event) = params.event {
            request = request.query(&[("event", event.as_str())]);
        }

        let response: AnnounceResponse = request.send()?.error_for_status()?.json()?;
        Ok(response.peers)
    }

    /// Drops our own entry (matched by peer id, not address), duplicate
    /// peer ids, and anything outside the expected peer port ranges,
    /// matching the filtering the reference client applies before
    /// dialing out.
    fn filter_peers(&self, peers: Vec<PeerEntry>, self_peer_id: &str) -> Vec<PeerRecord> {
        let mut seen = HashSet::new();
        peers
            .into_iter()
            .filter(|p| p.peer_id != self_peer_id)
            .filter(|p| EXPECTED_PORT_RANGE.contains(&p.port) || EPHEMERAL_PORT_RANGE.contains(&p.port))
            .filter(|p| seen.insert(p.peer_id.clone()))
            .map(|p| PeerRecord::new(p.peer_id, p.ip, p.port))
            .collect()
    }
}

impl Default for TrackerClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_announces_on_first_call_regardless_of_interval() {
        let tracker = Tracker::new(Url::parse("http://tracker.example/").unwrap());
        let now = Instant::now();
        assert!(tracker.can_announce(now));
        assert!(tracker.should_announce(now));
    }

    #[test]
    fn filter_peers_drops_self_duplicates_and_out_of_range_ports() {
        let client = TrackerClient::new();
        let peers = vec![
            PeerEntry { peer_id: "self".to_string(), ip: "127.0.0.1".parse().unwrap(), port: 6881 },
            PeerEntry { peer_id: "peer-a".to_string(), ip: "127.0.0.1".parse().unwrap(), port: 6882 },
            PeerEntry { peer_id: "peer-a".to_string(), ip: "127.0.0.1".parse().unwrap(), port: 6882 },
            PeerEntry { peer_id: "peer-b".to_string(), ip: "127.0.0.1".parse().unwrap(), port: 12345 },
        ];
        let filtered = client.filter_peers(peers, "self");
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].peer_id, "peer-a");
        assert_eq!(filtered[0].port, 6882);
    }
}
