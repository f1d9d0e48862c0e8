//! Engine lifecycle: binds the listener, announces to the tracker, dials
//! and accepts peers, and coordinates the resources shared across sessions.
//!
//! There is no engine-scoped `pending_pieces`, `peer_bitfields` or
//! `choked_peers` map keyed on the peer's address: every peer-local
//! attribute is a field on its own [`PeerSession`]. The engine only owns
//! what's genuinely shared: the storage manager, the upload-slot semaphore,
//! and the registry of live sessions needed to fan a completed piece's
//! `have` out to everyone else.

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use tokio::{net::TcpListener, sync::Semaphore, task::JoinHandle};

use crate::{
    conf::Conf,
    error::{Error, Result},
    metainfo::TorrentInfo,
    peer::{self, PeerSession},
    storage::StorageManager,
    tracker::{AnnounceParams, Event, TrackerClient},
    upnp, PieceIndex,
};

struct Session {
    cmd: peer::Sender,
    handle: JoinHandle<()>,
}

/// The running engine for a single torrent download/seed.
///
/// Owned resources shared across every peer session: the storage manager
/// and the upload-slot semaphore. Everything else is session-local.
pub struct PeerEngine {
    conf: Arc<Conf>,
    info: TorrentInfo,
    storage: Arc<StorageManager>,
    upload_slots: Arc<Semaphore>,
    sessions: HashMap<SocketAddr, Session>,
    piece_done_tx: peer::PieceDoneSender,
    piece_done_rx: tokio::sync::mpsc::UnboundedReceiver<PieceIndex>,
}

impl PeerEngine {
    /// Opens/resumes the backing file and constructs an engine ready to
    /// [`run`](Self::run).
    pub async fn new(info: TorrentInfo, conf: Conf) -> Result<Self> {
        let storage = StorageManager::new(info.clone(), &conf.torrent).await?;
        let (piece_done_tx, piece_done_rx) = tokio::sync::mpsc::unbounded_channel();
        Ok(Self {
            upload_slots: Arc::new(Semaphore::new(conf.torrent.upload_slots)),
            conf: Arc::new(conf),
            info,
            storage: Arc::new(storage),
            sessions: HashMap::new(),
            piece_done_tx,
            piece_done_rx,
        })
    }

    /// Runs the engine until `shutdown` resolves: binds the listener,
    /// kicks off the best-effort UPnP mapping, announces once, dials every
    /// peer the tracker returned, and accepts inbound connections until
    /// told to stop. Every piece that any session validates and writes is
    /// fanned out as `have` to every other live session.
    pub async fn run(mut self, shutdown: impl std::future::Future<Output = ()>) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.conf.engine.listen_port))
            .await
            .map_err(Error::Io)?;
        let local_port = listener.local_addr().map_err(Error::Io)?.port();
        log::info!("listening for peers on port {}", local_port);

        tokio::spawn(upnp::map_port(local_port));

        for peer_addr in self.announce(local_port).await {
            self.spawn_outbound(peer_addr);
        }

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, addr)) => self.spawn_inbound(socket, addr),
                        Err(e) => log::warn!("failed to accept inbound connection: {}", e),
                    }
                }
                Some(index) = self.piece_done_rx.recv() => {
                    self.broadcast_have(index);
                }
                _ = &mut shutdown => {
                    log::info!("shutting down engine");
                    break;
                }
            }
        }

        self.shutdown_sessions().await;

        Ok(())
    }

    /// Tells every live session to shut down and gives each one a grace
    /// period to drain (release claimed pieces, flush its command channel)
    /// before forcibly aborting stragglers. This is what makes `have(i)`
    /// broadcasts and claimed-piece releases observable before the process
    /// exits, rather than severing connections mid-write.
    async fn shutdown_sessions(&mut self) {
        const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(5);

        let sessions: Vec<Session> = self.sessions.drain().map(|(_, s)| s).collect();
        for session in &sessions {
            let _ = session.cmd.send(peer::Command::Shutdown);
        }
        let waits = sessions.into_iter().map(|session| async move {
            let abort_handle = session.handle.abort_handle();
            if tokio::time::timeout(SHUTDOWN_GRACE, session.handle).await.is_err() {
                log::warn!("session did not shut down within the grace period, aborting");
                abort_handle.abort();
            }
        });
        futures::future::join_all(waits).await;
    }

    /// Issues the single, one-shot tracker announce (periodic re-announcement
    /// is out of scope) and returns every peer endpoint other than
    /// ourselves. Tracker failure is logged and swallowed: the engine still
    /// serves inbound peers even with an empty peer list.
    async fn announce(&self, local_port: u16) -> Vec<SocketAddr> {
        let client = TrackerClient::new(
            self.info.announce_url.clone(),
            &self.conf.engine,
            self.conf.torrent.tracker_timeout,
        );
        let params = AnnounceParams {
            info_hash: self.info.info_hash,
            peer_id: self.conf.engine.client_id,
            port: local_port,
            uploaded: 0,
            downloaded: 0,
            left: self.info.total_length,
            event: Event::Started,
        };

        match client.announce(params).await {
            Ok(response) => response
                .peers
                .into_iter()
                .map(|peer| peer.addr)
                .filter(|addr| addr.port() != local_port || !addr.ip().is_loopback())
                .collect(),
            Err(e) => {
                log::warn!("tracker announce failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Tells every session other than `index`'s originator that a new
    /// piece is available. Dead sessions (the mpsc receiver dropped because
    /// the task already exited) are pruned as they're found.
    fn broadcast_have(&mut self, index: PieceIndex) {
        self.sessions
            .retain(|_, session| session.cmd.send(peer::Command::Have(index)).is_ok());
    }

    fn spawn_outbound(&mut self, addr: SocketAddr) {
        let (mut session, cmd) = PeerSession::outbound(
            addr,
            self.info.info_hash,
            self.conf.engine.client_id,
            Arc::new(self.conf.torrent.clone()),
            Arc::clone(&self.storage),
            Arc::clone(&self.upload_slots),
            self.piece_done_tx.clone(),
        );
        let handle = tokio::spawn(async move {
            if let Err(e) = session.start(None).await {
                log::warn!("outbound session to {} ended: {}", addr, e);
            }
        });
        self.sessions.insert(addr, Session { cmd, handle });
    }

    fn spawn_inbound(&mut self, socket: tokio::net::TcpStream, addr: SocketAddr) {
        let (mut session, cmd) = PeerSession::inbound(
            addr,
            self.info.info_hash,
            self.conf.engine.client_id,
            Arc::new(self.conf.torrent.clone()),
            Arc::clone(&self.storage),
            Arc::clone(&self.upload_slots),
            self.piece_done_tx.clone(),
        );
        let handle = tokio::spawn(async move {
            if let Err(e) = session.start(Some(socket)).await {
                log::warn!("inbound session from {} ended: {}", addr, e);
            }
        });
        self.sessions.insert(addr, Session { cmd, handle });
    }

    /// Hands out a clone of the shared storage handle so a driver (e.g. the
    /// CLI's progress display) can watch `bitfield()`/`is_complete()`
    /// without needing a borrow of the engine itself while `run` is driving
    /// it to completion.
    pub fn storage(&self) -> Arc<StorageManager> {
        Arc::clone(&self.storage)
    }
}
