//! A single peer connection's session state machine.
//!
//! A session plays both roles at once: it downloads pieces the peer has
//! that we don't, and serves pieces we have that the peer requests. There
//! is no shared, torrent-wide piece picker; each session independently
//! claims pieces from the [`StorageManager`], which is the only state
//! shared across sessions.

use std::{net::SocketAddr, pin::Pin, sync::Arc};

use futures::{
    pin_mut, select,
    stream::{Fuse, SplitSink, SplitStream},
    FutureExt, SinkExt, StreamExt,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        Semaphore,
    },
    time::{timeout, Instant},
};
use tokio_util::codec::{Framed, FramedParts};

use crate::{
    codec::{Handshake, HandshakeCodec, Message, PeerCodec},
    conf::TorrentConf,
    crypto::EncryptedStream,
    error::{Result, SessionError},
    storage::{Piece, StorageManager},
    Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash,
};

/// The channel a session uses to tell the engine it just validated and
/// wrote a piece, so the engine can broadcast `have` to every other live
/// session. `write_piece(i)` happens-before any `have(i)` observed
/// elsewhere, since this send happens only after `write_piece` returns `Ok`.
pub type PieceDoneSender = UnboundedSender<PieceIndex>;

/// Any duplex byte stream a session can run over, whether a plain TCP
/// socket or one wrapped in [`EncryptedStream`] obfuscation.
trait PeerStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> PeerStream for T {}

type BoxedStream = Pin<Box<dyn PeerStream>>;

/// The channel on which other parts of the engine can send commands to a
/// running peer session task.
pub type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

/// Commands a peer session understands from the rest of the engine.
pub enum Command {
    /// The storage layer just finished validating a new piece; tell the
    /// peer about it if the session is past the handshake.
    Have(crate::PieceIndex),
    /// Eventually shut down the session, e.g. on engine shutdown.
    Shutdown,
}

/// Whether we initiated the TCP connection or accepted it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Role {
    Outbound,
    Inbound,
}

/// A single peer session, either initiated by us (outbound) or accepted by
/// our listener (inbound).
pub struct PeerSession {
    role: Role,
    addr: SocketAddr,
    info_hash: Sha1Hash,
    client_id: PeerId,
    conf: Arc<TorrentConf>,
    storage: Arc<StorageManager>,
    upload_slots: Arc<Semaphore>,
    piece_done_tx: PieceDoneSender,
    cmd_port: Fuse<Receiver>,
    status: Status,
    peer_info: Option<PeerInfo>,
    /// Pieces this session has claimed and is currently assembling. Several
    /// may be in flight at once so the request pipeline can stay full.
    downloads: Vec<PieceDownload>,
    /// Requests we've sent to the peer and are still awaiting a `piece`
    /// message for. Cleared whenever the peer chokes us, since we can no
    /// longer expect them to be served.
    outgoing_requests: Vec<BlockInfo>,
}

impl PeerSession {
    /// Creates a new session that will dial `addr`.
    pub fn outbound(
        addr: SocketAddr,
        info_hash: Sha1Hash,
        client_id: PeerId,
        conf: Arc<TorrentConf>,
        storage: Arc<StorageManager>,
        upload_slots: Arc<Semaphore>,
        piece_done_tx: PieceDoneSender,
    ) -> (Self, Sender) {
        Self::new(
            Role::Outbound,
            addr,
            info_hash,
            client_id,
            conf,
            storage,
            upload_slots,
            piece_done_tx,
        )
    }

    /// Creates a new session over an already-accepted inbound socket.
    pub fn inbound(
        addr: SocketAddr,
        info_hash: Sha1Hash,
        client_id: PeerId,
        conf: Arc<TorrentConf>,
        storage: Arc<StorageManager>,
        upload_slots: Arc<Semaphore>,
        piece_done_tx: PieceDoneSender,
    ) -> (Self, Sender) {
        Self::new(
            Role::Inbound,
            addr,
            info_hash,
            client_id,
            conf,
            storage,
            upload_slots,
            piece_done_tx,
        )
    }

    fn new(
        role: Role,
        addr: SocketAddr,
        info_hash: Sha1Hash,
        client_id: PeerId,
        conf: Arc<TorrentConf>,
        storage: Arc<StorageManager>,
        upload_slots: Arc<Semaphore>,
        piece_done_tx: PieceDoneSender,
    ) -> (Self, Sender) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        (
            Self {
                role,
                addr,
                info_hash,
                client_id,
                conf,
                storage,
                upload_slots,
                piece_done_tx,
                cmd_port: cmd_port.fuse(),
                status: Status::default(),
                peer_info: None,
                downloads: Vec::new(),
                outgoing_requests: Vec::new(),
            },
            cmd_chan,
        )
    }

    /// Drives the session to completion: connecting (if outbound),
    /// handshaking, and running the message loop until the peer disconnects,
    /// we're told to shut down, or an error occurs.
    pub async fn start(&mut self, socket: Option<TcpStream>) -> Result<()> {
        log::info!("starting peer {} session", self.addr);

        let socket: BoxedStream = match socket {
            Some(socket) => Box::pin(socket),
            None => {
                debug_assert_eq!(self.role, Role::Outbound);
                let socket = timeout(self.conf.handshake_timeout, TcpStream::connect(self.addr))
                    .await
                    .map_err(|_| SessionError::Timeout)??;
                Box::pin(socket)
            }
        };

        let socket: BoxedStream = if self.conf.encrypt {
            match self.role {
                Role::Outbound => Box::pin(EncryptedStream::handshake_as_initiator(socket).await?),
                Role::Inbound => Box::pin(EncryptedStream::handshake_as_responder(socket).await?),
            }
        } else {
            socket
        };

        let mut framed = Framed::new(socket, HandshakeCodec);
        let our_handshake = Handshake::new(self.info_hash, self.client_id);

        let peer_handshake = match self.role {
            Role::Outbound => {
                framed.send(our_handshake).await?;
                self.recv_handshake(&mut framed).await?
            }
            Role::Inbound => {
                let peer_handshake = self.recv_handshake(&mut framed).await?;
                framed.send(our_handshake).await?;
                peer_handshake
            }
        };

        if peer_handshake.info_hash != self.info_hash {
            return Err(SessionError::InvalidInfoHash.into());
        }
        self.peer_info = Some(PeerInfo {
            peer_id: peer_handshake.peer_id,
            bitfield: Bitfield::repeat(false, self.storage.info().num_pieces()),
        });

        let old_parts = framed.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let socket = Framed::from_parts(new_parts);

        let (mut sink, stream) = socket.split();

        let our_bitfield = self.storage.bitfield().await;
        if our_bitfield.any() {
            sink.send(Message::Bitfield(our_bitfield)).await?;
        }

        self.run(sink, stream.fuse()).await
    }

    async fn recv_handshake(
        &self,
        framed: &mut Framed<BoxedStream, HandshakeCodec>,
    ) -> Result<Handshake> {
        match timeout(self.conf.handshake_timeout, framed.next()).await {
            Ok(Some(handshake)) => Ok(handshake?),
            Ok(None) => Err(SessionError::Timeout.into()),
            Err(_) => Err(SessionError::Timeout.into()),
        }
    }

    /// Drives the message/command loop. Two deadlines bound how long the
    /// session will sit idle: the 30-second "waiting for unchoke"
    /// budget once we've sent `interested` (cleared the moment we're
    /// unchoked), and the 60-second idle-read timeout that resets on every
    /// message or command. Whichever is sooner fires first.
    async fn run(
        &mut self,
        mut sink: SplitSink<Framed<BoxedStream, PeerCodec>, Message>,
        mut stream: Fuse<SplitStream<Framed<BoxedStream, PeerCodec>>>,
    ) -> Result<()> {
        let mut idle_deadline = Instant::now() + self.conf.idle_timeout;

        loop {
            let deadline = match self.status.unchoke_deadline {
                Some(d) if d < idle_deadline => d,
                _ => idle_deadline,
            };
            let sleep = tokio::time::sleep_until(deadline).fuse();
            pin_mut!(sleep);

            select! {
                msg = stream.select_next_some() => {
                    idle_deadline = Instant::now() + self.conf.idle_timeout;
                    let msg = msg?;
                    log::trace!("peer {} sent {:?}", self.addr, msg);
                    self.handle_msg(&mut sink, msg).await?;
                }
                cmd = self.cmd_port.select_next_some() => {
                    idle_deadline = Instant::now() + self.conf.idle_timeout;
                    match cmd {
                        Command::Have(index) => {
                            sink.send(Message::Have { piece_index: index }).await?;
                        }
                        Command::Shutdown => {
                            log::info!("shutting down peer {} session", self.addr);
                            break;
                        }
                    }
                }
                _ = sleep => {
                    let now = Instant::now();
                    if self.status.unchoke_deadline.is_some_and(|d| now >= d) {
                        log::info!("peer {} timed out waiting for unchoke", self.addr);
                    } else {
                        log::info!("peer {} idle timeout", self.addr);
                    }
                    break;
                }
            }
        }

        for download in self.downloads.drain(..) {
            self.storage.release_piece(download.index()).await;
        }

        Ok(())
    }

    async fn handle_msg(
        &mut self,
        sink: &mut SplitSink<Framed<BoxedStream, PeerCodec>, Message>,
        msg: Message,
    ) -> Result<()> {
        match msg {
            Message::KeepAlive => {}
            Message::Choke => {
                if !self.status.is_choked {
                    log::info!("peer {} choked us", self.addr);
                    self.status.is_choked = true;
                    for download in self.downloads.drain(..) {
                        self.storage.release_piece(download.index()).await;
                    }
                    self.outgoing_requests.clear();
                    // re-enter the "wait for unchoke" sub-state: if we never
                    // hear back within the budget, the session is closed and
                    // the caller re-claims from another peer.
                    if self.status.is_interested {
                        self.status.unchoke_deadline =
                            Some(Instant::now() + self.conf.unchoke_timeout);
                    }
                }
            }
            Message::Unchoke => {
                if self.status.is_choked {
                    log::info!("peer {} unchoked us", self.addr);
                    self.status.is_choked = false;
                    self.status.unchoke_deadline = None;
                    self.make_requests(sink).await?;
                }
            }
            Message::Interested => {
                self.status.is_peer_interested = true;
                self.maybe_unchoke_peer(sink).await?;
            }
            Message::NotInterested => {
                self.status.is_peer_interested = false;
            }
            Message::Have { piece_index } => {
                if let Some(peer_info) = &mut self.peer_info {
                    if piece_index < peer_info.bitfield.len() {
                        peer_info.bitfield.set(piece_index, true);
                    }
                }
                self.become_interested_if_needed(sink).await?;
            }
            Message::Bitfield(mut bitfield) => {
                bitfield.resize(self.storage.info().num_pieces(), false);
                if let Some(peer_info) = &mut self.peer_info {
                    peer_info.bitfield = bitfield;
                }
                self.become_interested_if_needed(sink).await?;
            }
            Message::Request(block_info) => {
                self.handle_request(sink, block_info).await?;
            }
            Message::Cancel(_) => {
                // we serve requests synchronously and don't queue them, so
                // there's nothing to cancel
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                let block_info = BlockInfo {
                    piece_index,
                    offset,
                    len: data.len() as u32,
                };
                self.handle_block_msg(block_info, data).await?;
                self.make_requests(sink).await?;
            }
            Message::Unknown(id) => {
                log::debug!("ignoring unknown message id {} from peer {}", id, self.addr);
            }
        }

        Ok(())
    }

    /// If the peer now has a piece we need and we aren't already marked
    /// interested, send `interested`. We judge this by bitfield comparison
    /// alone, without claiming anything from storage yet; claiming happens
    /// lazily in [`PeerSession::make_requests`] once we're unchoked.
    async fn become_interested_if_needed(
        &mut self,
        sink: &mut SplitSink<Framed<BoxedStream, PeerCodec>, Message>,
    ) -> Result<()> {
        if self.status.is_interested {
            return Ok(());
        }
        let Some(peer_info) = &self.peer_info else {
            return Ok(());
        };
        let our_bitfield = self.storage.bitfield().await;
        let has_needed_piece = peer_info
            .bitfield
            .iter()
            .zip(our_bitfield.iter())
            .any(|(peer_has, we_have)| *peer_has && !*we_have);
        if !has_needed_piece {
            return Ok(());
        }

        self.status.is_interested = true;
        if self.status.is_choked {
            self.status.unchoke_deadline = Some(Instant::now() + self.conf.unchoke_timeout);
        }
        sink.send(Message::Interested).await?;
        Ok(())
    }

    /// Grants the peer an upload slot if one is free and we aren't already
    /// serving them.
    async fn maybe_unchoke_peer(
        &mut self,
        sink: &mut SplitSink<Framed<BoxedStream, PeerCodec>, Message>,
    ) -> Result<()> {
        if !self.status.is_peer_choked {
            return Ok(());
        }
        if let Ok(permit) = Arc::clone(&self.upload_slots).try_acquire_owned() {
            self.status.upload_permit = Some(permit);
            self.status.is_peer_choked = false;
            sink.send(Message::Unchoke).await?;
        } else {
            sink.send(Message::Choke).await?;
        }
        Ok(())
    }

    async fn handle_request(
        &mut self,
        sink: &mut SplitSink<Framed<BoxedStream, PeerCodec>, Message>,
        block_info: BlockInfo,
    ) -> Result<()> {
        if self.status.is_peer_choked {
            log::debug!("ignoring request from choked peer {}", self.addr);
            return Ok(());
        }
        if !self.storage.has_piece(block_info.piece_index).await {
            log::warn!(
                "peer {} requested piece {} we don't have",
                self.addr,
                block_info.piece_index
            );
            return Ok(());
        }
        let data = self
            .storage
            .read_block(block_info.piece_index, block_info.offset, block_info.len)
            .await?;
        sink.send(Message::Block {
            piece_index: block_info.piece_index,
            offset: block_info.offset,
            data,
        })
        .await?;
        Ok(())
    }

    /// Fills the session's pipeline up to the configured request queue
    /// length, claiming new pieces from storage as needed.
    async fn make_requests(
        &mut self,
        sink: &mut SplitSink<Framed<BoxedStream, PeerCodec>, Message>,
    ) -> Result<()> {
        if self.status.is_choked {
            return Ok(());
        }
        let queue_len = self.conf.request_queue_len;
        let mut blocks = Vec::new();

        for download in self.downloads.iter_mut() {
            let to_request = queue_len.saturating_sub(self.outgoing_requests.len() + blocks.len());
            if to_request == 0 {
                break;
            }
            download.pick_blocks(to_request, &mut blocks);
        }

        while self.outgoing_requests.len() + blocks.len() < queue_len {
            let Some(peer_info) = &self.peer_info else {
                break;
            };
            let Some(index) = self.storage.claim_needed_piece(&peer_info.bitfield).await else {
                break;
            };
            let piece_len = self.storage.info().piece_len(index);
            let hash = self.storage.info().piece_hashes[index];
            let mut download = PieceDownload::new(index, piece_len, hash);
            let remaining = queue_len.saturating_sub(self.outgoing_requests.len() + blocks.len());
            download.pick_blocks(remaining, &mut blocks);
            self.downloads.push(download);
        }

        self.outgoing_requests.extend_from_slice(&blocks);
        for block in &blocks {
            sink.send(Message::Request(*block)).await?;
        }

        Ok(())
    }

    async fn handle_block_msg(&mut self, block_info: BlockInfo, data: Vec<u8>) -> Result<()> {
        let Some(request_pos) = self.outgoing_requests.iter().position(|b| *b == block_info) else {
            log::warn!("peer {} sent unrequested block {:?}", self.addr, block_info);
            return Ok(());
        };
        self.outgoing_requests.remove(request_pos);

        let Some(download_pos) = self
            .downloads
            .iter()
            .position(|d| d.index() == block_info.piece_index)
        else {
            return Ok(());
        };
        self.downloads[download_pos].received_block(block_info, data)?;

        if self.downloads[download_pos].is_complete() {
            let download = self.downloads.remove(download_pos);
            let piece = download.into_piece();
            let index = piece.index();
            match self.storage.write_piece(piece).await {
                Ok(()) => {
                    self.status.downloaded_block_bytes_count += self.storage.info().piece_len(index) as u64;
                    // `write_piece` has already returned by the time this
                    // send happens, so any session that acts on it sees a
                    // storage that already has the piece.
                    let _ = self.piece_done_tx.send(index);
                }
                Err(err) => {
                    log::warn!("piece {} failed validation from peer {}: {}", index, self.addr, err);
                }
            }
        }

        Ok(())
    }
}

/// Session-local bookkeeping for one peer.
#[derive(Debug)]
struct Status {
    is_choked: bool,
    is_interested: bool,
    is_peer_choked: bool,
    is_peer_interested: bool,
    downloaded_block_bytes_count: u64,
    upload_permit: Option<tokio::sync::OwnedSemaphorePermit>,
    /// Set while we're interested and still choked; if this elapses before
    /// an `unchoke` arrives, the session gives up.
    unchoke_deadline: Option<Instant>,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            is_choked: true,
            is_interested: false,
            is_peer_choked: true,
            is_peer_interested: false,
            downloaded_block_bytes_count: 0,
            upload_permit: None,
            unchoke_deadline: None,
        }
    }
}

struct PeerInfo {
    peer_id: PeerId,
    bitfield: Bitfield,
}

/// Tracks an in-progress download of a single piece within a session:
/// which blocks have been requested and the partially assembled piece.
struct PieceDownload {
    piece: Piece,
    piece_len: u32,
    next_offset: u32,
}

impl PieceDownload {
    fn new(index: crate::PieceIndex, piece_len: u32, expected_hash: Sha1Hash) -> Self {
        Self {
            piece: Piece::new(index, piece_len, expected_hash),
            piece_len,
            next_offset: 0,
        }
    }

    fn index(&self) -> crate::PieceIndex {
        self.piece.index()
    }

    fn is_complete(&self) -> bool {
        self.piece.is_complete()
    }

    fn into_piece(self) -> Piece {
        self.piece
    }

    /// Appends up to `count` new block requests to `out`, advancing past
    /// blocks already requested.
    fn pick_blocks(&mut self, count: usize, out: &mut Vec<BlockInfo>) {
        let mut picked = 0;
        while picked < count && self.next_offset < self.piece_len {
            let index_in_piece = (self.next_offset / crate::BLOCK_LEN) as usize;
            let len = crate::block_len(self.piece_len, index_in_piece);
            out.push(BlockInfo {
                piece_index: self.piece.index(),
                offset: self.next_offset,
                len,
            });
            self.next_offset += len;
            picked += 1;
        }
    }

    fn received_block(&mut self, block_info: BlockInfo, data: Vec<u8>) -> Result<()> {
        self.piece.store_block(block_info.offset, &data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn piece_download_pick_blocks_stops_at_piece_end() {
        let piece_len = crate::BLOCK_LEN + 100;
        let mut download = PieceDownload::new(0, piece_len, [0u8; 20]);
        let mut blocks = Vec::new();
        download.pick_blocks(10, &mut blocks);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].offset, 0);
        assert_eq!(blocks[0].len, crate::BLOCK_LEN);
        assert_eq!(blocks[1].offset, crate::BLOCK_LEN);
        assert_eq!(blocks[1].len, 100);

        let mut more = Vec::new();
        download.pick_blocks(10, &mut more);
        assert!(more.is_empty());
    }

    #[test]
    fn piece_download_tracks_completion() {
        let mut download = PieceDownload::new(0, 16, [0u8; 20]);
        let mut blocks = Vec::new();
        download.pick_blocks(1, &mut blocks);
        assert!(!download.is_complete());
        download
            .received_block(blocks[0], vec![0u8; 16])
            .unwrap();
        assert!(download.is_complete());
    }
}
