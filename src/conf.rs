//! This module defines types used to configure the engine and its parts.

use std::{path::PathBuf, time::Duration};

use crate::PeerId;

/// The default peer id prefix used by this client in the handshake and in
/// tracker announces, following the Azureus-style convention.
pub const DEFAULT_CLIENT_ID: &PeerId = b"-PW0001-000000000000";

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the engine configuration with reasonable defaults, except for
    /// the download destination, as it is not sensible to guess that for the
    /// user. It uses the default client id, [`DEFAULT_CLIENT_ID`].
    pub fn new(download_path: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf {
                client_id: *DEFAULT_CLIENT_ID,
                listen_port: 6881,
            },
            torrent: TorrentConf::new(download_path),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to the tracker and other peers.
    pub client_id: PeerId,
    /// The TCP port the engine listens on for inbound peer connections.
    pub listen_port: u16,
}

/// Configuration for a torrent download.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The path at which the downloaded file is placed / from which it is
    /// seeded.
    pub download_path: PathBuf,

    /// The number of concurrent unchoke permits we hand out to peers that
    /// want to download from us.
    pub upload_slots: usize,

    /// The maximum number of outstanding block requests a session keeps
    /// pipelined to a single peer.
    pub request_queue_len: usize,

    /// Timeout for establishing the TCP connection and completing the
    /// initial handshake.
    pub handshake_timeout: Duration,

    /// Timeout for the client role waiting for an `unchoke` after having
    /// sent `interested`.
    pub unchoke_timeout: Duration,

    /// Idle-read timeout for the server role's message loop.
    pub idle_timeout: Duration,

    /// Timeout for the tracker announce HTTP request.
    pub tracker_timeout: Duration,

    /// Whether to wrap every connection in the DH/RC4 obfuscation handshake
    /// before the BitTorrent handshake. Off by default: it is not BEP10 MSE
    /// and gains nothing against a peer that doesn't also speak it, so it's
    /// opt-in per torrent.
    pub encrypt: bool,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download path, as it is not sensible to guess that for the user.
    pub fn new(download_path: impl Into<PathBuf>) -> Self {
        Self {
            download_path: download_path.into(),
            upload_slots: 4,
            request_queue_len: 4,
            handshake_timeout: Duration::from_secs(5),
            unchoke_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            tracker_timeout: Duration::from_secs(15),
            encrypt: false,
        }
    }
}
