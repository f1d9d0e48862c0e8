//! A small CLI driver for the peer-wire engine (§11).
//!
//! This binary is a pure driver: it parses arguments, wires the library
//! together, installs the logger, handles Ctrl-C, and renders progress. It
//! contains no protocol or storage logic of its own.

use std::{path::PathBuf, time::Duration};

use clap::{Parser, Subcommand};
use peerswarm::{conf::Conf, metainfo::TorrentInfo, engine::PeerEngine};

#[derive(Parser, Debug)]
#[command(name = "peer", version, about = "A single-file BitTorrent peer")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Computes piece hashes for `file` and writes a `.torrent` metainfo
    /// file describing it.
    Generate {
        file: PathBuf,
        #[arg(long, default_value = "http://localhost:6969/announce")]
        tracker: String,
        #[arg(long, default_value_t = peerswarm::BLOCK_LEN * 2)]
        piece_length: u32,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Parses a `.torrent` file and downloads (or seeds) it until the
    /// download completes or the process is interrupted.
    Download {
        torrent: PathBuf,
        #[arg(long)]
        dest: PathBuf,
        #[arg(long, default_value_t = 6881)]
        port: u16,
        /// Obfuscate the wire protocol with the engine's DH/RC4 handshake
        /// (§4.4). Not interoperable with clients expecting BEP10 MSE.
        #[arg(long)]
        encrypt: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Generate {
            file,
            tracker,
            piece_length,
            output,
        } => generate(file, tracker, piece_length, output),
        Command::Download {
            torrent,
            dest,
            port,
            encrypt,
        } => download(torrent, dest, port, encrypt).await,
    }
}

fn generate(
    file: PathBuf,
    tracker: String,
    piece_length: u32,
    output: PathBuf,
) -> anyhow::Result<()> {
    let bytes = std::fs::read(&file)?;
    let name = file
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed".to_string());

    let metainfo = TorrentInfo::generate(&bytes, name, tracker, piece_length);
    std::fs::write(&output, metainfo.to_bytes()?)?;

    println!("wrote {}", output.display());
    Ok(())
}

async fn download(torrent: PathBuf, dest: PathBuf, port: u16, encrypt: bool) -> anyhow::Result<()> {
    let bytes = std::fs::read(&torrent)?;
    let info = TorrentInfo::from_bencoded(&bytes)?;

    let mut conf = Conf::new(dest.join(&info.name));
    conf.engine.listen_port = port;
    conf.torrent.encrypt = encrypt;

    let engine = PeerEngine::new(info, conf).await?;
    let storage = engine.storage();
    let num_pieces = storage.info().num_pieces();

    let progress_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        loop {
            ticker.tick().await;
            let done = storage.bitfield().await.count_ones();
            println!("{}/{} pieces", done, num_pieces);
            if storage.is_complete().await {
                println!("download complete");
                break;
            }
        }
    });

    let result = engine.run(shutdown_signal()).await;
    progress_task.abort();
    result?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::warn!("failed to install Ctrl-C handler: {}", e);
    }
}
