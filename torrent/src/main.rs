use std::{net::SocketAddr, path::PathBuf};

use anyhow::Context;
use clap::Parser;
use torrent::{ClientConfig, MetaInfo, Swarm, TorrentConfig};

const DEFAULT_PORT: u16 = 6881;

/// Peer-side BitTorrent-style file distribution client.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the .torrent metainfo file.
    torrent_file: PathBuf,

    /// Directory to write downloaded files into.
    #[arg(long, default_value = "downloads")]
    base_path: PathBuf,

    /// Start downloading the torrent's content; otherwise the client
    /// just seeds whatever pieces are already present on disk.
    #[arg(long, default_value_t = true)]
    download: bool,

    /// Disable the upload server; only download, never seed.
    #[arg(long, default_value_t = false)]
    no_seed: bool,

    /// Listen port for incoming peer connections and the upload server.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,
}

fn main() -> anyhow::Result<()> {
    let sub = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(sub).expect("setting global tracing subscriber");

    let args = Args::parse();

    let metainfo = MetaInfo::new(&args.torrent_file)
        .with_context(|| format!("reading metainfo from {}", args.torrent_file.display()))?;

    let config = TorrentConfig {
        output_dir: args.base_path,
        listen_address: SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), args.port),
        seed: !args.no_seed,
        download: args.download,
        ..TorrentConfig::default()
    };

    let swarm = Swarm::new(metainfo, config, ClientConfig::default())
        .context("initializing torrent")?;

    swarm.start().context("running torrent")?;

    Ok(())
}
