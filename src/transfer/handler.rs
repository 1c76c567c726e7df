//! Packet dispatch for the file transfer protocol.

use super::manager::{ChunkProgress, FileTransferManager};
use super::packets::{decode_notice, encode_notice, FileChunk, FilePacketId, FileRequest, TransferId};
use super::TransferError;
use crate::runtime::{PacketError, PacketHandler, PacketHeader, SendContext, Session};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default directory for received files.
pub const DEFAULT_RECEIVE_DIR: &str = "./received_files";

/// Handles file transfer frames on one session.
///
/// Receives announced files into `receive_dir`. With an outgoing file
/// configured, it also announces that file on connect and streams it
/// once the peer accepts.
pub struct FilePacketHandler {
    manager: Arc<FileTransferManager>,
    receive_dir: PathBuf,
    outgoing: Option<(PathBuf, u32)>,
}

impl FilePacketHandler {
    pub fn new(manager: Arc<FileTransferManager>, receive_dir: impl Into<PathBuf>) -> Self {
        Self {
            manager,
            receive_dir: receive_dir.into(),
            outgoing: None,
        }
    }

    /// Send `path` in chunks of `chunk_size` bytes as soon as the session connects.
    pub fn with_outgoing(mut self, path: impl Into<PathBuf>, chunk_size: u32) -> Self {
        self.outgoing = Some((path.into(), chunk_size));
        self
    }

    pub fn manager(&self) -> &Arc<FileTransferManager> {
        &self.manager
    }

    pub fn receive_dir(&self) -> &Path {
        &self.receive_dir
    }

    /// Announce a file to the peer. Chunks follow the peer's response.
    pub fn send_file(
        &self,
        session: &Arc<Session>,
        path: &Path,
        chunk_size: u32,
    ) -> Result<TransferId, TransferError> {
        self.manager.start_file_send(session, path, chunk_size)
    }

    /// Handle one frame if it belongs to the file transfer protocol.
    ///
    /// Returns `false` for any other packet id. A malformed transfer frame
    /// disconnects the session.
    pub fn handle_packet(&self, session: &Arc<Session>, cx: &mut SendContext, packet: &[u8]) -> bool {
        let Some(id) = PacketHeader::parse(packet).and_then(|h| FilePacketId::from_u16(h.id)) else {
            return false;
        };

        if let Err(e) = self.dispatch(session, cx, id, packet) {
            warn!(session = session.id(), error = %e, "Malformed file transfer frame");
            session.disconnect("malformed file transfer frame");
        }
        true
    }

    fn dispatch(
        &self,
        session: &Arc<Session>,
        cx: &mut SendContext,
        id: FilePacketId,
        packet: &[u8],
    ) -> Result<(), PacketError> {
        match id {
            FilePacketId::Request => {
                let request = FileRequest::decode(packet)?;
                self.on_request(session, cx, &request);
            }
            FilePacketId::Response => {
                let transfer_id = decode_notice(packet)?;
                debug!(session = session.id(), transfer = transfer_id, "Peer accepted transfer");
                self.manager.start_sending(session, transfer_id);
            }
            FilePacketId::Chunk => {
                let (chunk, payload) = FileChunk::decode(packet)?;
                match self.manager.process_file_chunk(&chunk, payload) {
                    Ok(ChunkProgress::More) => {}
                    Ok(ChunkProgress::Done) => {
                        reply(session, cx, FilePacketId::Complete, chunk.transfer_id)
                    }
                    Err(_) => reply(session, cx, FilePacketId::Error, chunk.transfer_id),
                }
            }
            FilePacketId::Complete => {
                let transfer_id = decode_notice(packet)?;
                info!(session = session.id(), transfer = transfer_id, "Peer confirmed transfer");
            }
            FilePacketId::Error => {
                let transfer_id = decode_notice(packet)?;
                warn!(session = session.id(), transfer = transfer_id, "Peer rejected transfer");
                match self.manager.notice_target(transfer_id) {
                    Some(local) => {
                        self.manager.abort_transfer(local);
                    }
                    None => debug!(transfer = transfer_id, "Error notice for unknown transfer"),
                }
            }
        }
        Ok(())
    }

    fn on_request(&self, session: &Arc<Session>, cx: &mut SendContext, request: &FileRequest) {
        match self.manager.start_file_receive(&self.receive_dir, request) {
            Ok(_) => {
                reply(session, cx, FilePacketId::Response, request.transfer_id);
                if request.file_size == 0 {
                    reply(session, cx, FilePacketId::Complete, request.transfer_id);
                }
            }
            Err(e) => {
                warn!(
                    session = session.id(),
                    transfer = request.transfer_id,
                    file = %request.filename,
                    error = %e,
                    "Rejecting file transfer"
                );
                reply(session, cx, FilePacketId::Error, request.transfer_id);
            }
        }
    }
}

fn reply(session: &Arc<Session>, cx: &mut SendContext, id: FilePacketId, transfer_id: TransferId) {
    match encode_notice(cx, id, transfer_id) {
        Some(frame) => session.send(frame),
        None => warn!(session = session.id(), ?id, "No send buffer for transfer notice"),
    }
}

impl PacketHandler for FilePacketHandler {
    fn on_connected(&self, session: &Arc<Session>, _cx: &mut SendContext) {
        let Some((path, chunk_size)) = &self.outgoing else {
            return;
        };
        if let Err(e) = self.send_file(session, path, *chunk_size) {
            warn!(session = session.id(), path = %path.display(), error = %e, "Cannot send file");
            self.manager.report_failed_send(path);
        }
    }

    fn on_connect_failed(&self, session: &Arc<Session>, error: &std::io::Error) {
        let Some((path, _)) = &self.outgoing else {
            return;
        };
        warn!(
            session = session.id(),
            path = %path.display(),
            error = %error,
            "Cannot reach receiver"
        );
        self.manager.report_failed_send(path);
    }

    fn on_recv_packet(&self, session: &Arc<Session>, cx: &mut SendContext, packet: &[u8]) {
        if !self.handle_packet(session, cx, packet) {
            debug!(session = session.id(), "Ignoring non-transfer packet");
        }
    }

    fn on_disconnected(&self, session: &Arc<Session>) {
        let failed = self.manager.fail_active_transfers("connection closed");
        if failed > 0 {
            warn!(session = session.id(), failed, "Disconnected with transfers in progress");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{
        MemoryPoolManager, PacketSession, Service, ServiceConfig, SessionHandler,
    };
    use crate::runtime::SendBufferManager;
    use crate::transfer::TransferDirection;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::runtime::Handle;
    use tokio::sync::mpsc;

    type Outcome = (TransferId, bool, PathBuf);

    fn manager(outcomes: mpsc::UnboundedSender<Outcome>) -> Arc<FileTransferManager> {
        let manager = FileTransferManager::with_chunk_delay(
            Arc::new(MemoryPoolManager::new()),
            Duration::from_millis(1),
        );
        manager.set_transfer_complete_callback(move |id, success, path| {
            let _ = outcomes.send((id, success, path.to_path_buf()));
        });
        manager
    }

    fn receiving_server(dir: &Path) -> (Arc<Service>, mpsc::UnboundedReceiver<Outcome>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dir = dir.to_path_buf();
        let server = Service::server(
            ServiceConfig::new("127.0.0.1:0".parse().unwrap(), 4),
            Handle::current(),
            Arc::new(move || {
                // One manager per connection keeps peer ids unambiguous
                let files = FilePacketHandler::new(manager(tx.clone()), dir.clone());
                Box::new(PacketSession::new(files)) as Box<dyn SessionHandler>
            }),
        );
        server.start().unwrap();
        (server, rx)
    }

    fn sending_client(
        addr: SocketAddr,
        path: &Path,
        chunk_size: u32,
    ) -> (Arc<Service>, mpsc::UnboundedReceiver<Outcome>, Arc<FileTransferManager>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = manager(tx);
        let factory_manager = Arc::clone(&manager);
        let path = path.to_path_buf();

        let client = Service::client(
            ServiceConfig::new(addr, 1),
            Handle::current(),
            Arc::new(move || {
                let files = FilePacketHandler::new(Arc::clone(&factory_manager), "unused")
                    .with_outgoing(path.clone(), chunk_size);
                Box::new(PacketSession::new(files)) as Box<dyn SessionHandler>
            }),
        );
        client.start().unwrap();
        (client, rx, manager)
    }

    async fn next(outcomes: &mut mpsc::UnboundedReceiver<Outcome>) -> Outcome {
        tokio::time::timeout(Duration::from_secs(10), outcomes.recv())
            .await
            .expect("transfer did not finish")
            .unwrap()
    }

    #[tokio::test]
    async fn test_file_transfer_end_to_end() {
        let source = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        let data: Vec<u8> = (0..50_000u32).map(|i| (i % 253) as u8).collect();
        let path = source.path().join("archive.bin");
        std::fs::write(&path, &data).unwrap();

        let (server, mut received) = receiving_server(target.path());
        let (client, mut sent, sender) = sending_client(server.local_addr().unwrap(), &path, 4096);

        let (_, ok, sent_path) = next(&mut sent).await;
        assert!(ok);
        assert_eq!(sent_path, path);

        let (_, ok, received_path) = next(&mut received).await;
        assert!(ok);
        assert_eq!(received_path, target.path().join("archive.bin"));
        assert_eq!(std::fs::read(&received_path).unwrap(), data);

        let progress = sender.progress(1).unwrap();
        assert_eq!(progress.direction, TransferDirection::Sending);
        assert_eq!(progress.chunks_completed, 13);
        assert!(progress.completed);

        client.close_service();
        server.close_service();
    }

    #[tokio::test]
    async fn test_empty_file_transfer() {
        let source = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        let path = source.path().join("empty.txt");
        std::fs::write(&path, b"").unwrap();

        let (server, mut received) = receiving_server(target.path());
        let (client, mut sent, _sender) = sending_client(server.local_addr().unwrap(), &path, 4096);

        assert!(next(&mut received).await.1);
        assert!(next(&mut sent).await.1);
        assert_eq!(std::fs::metadata(target.path().join("empty.txt")).unwrap().len(), 0);

        client.close_service();
        server.close_service();
    }

    #[tokio::test]
    async fn test_rejected_request_aborts_sender() {
        let source = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        // Receive directory is a file, so the receiver cannot create it
        let blocked = target.path().join("not-a-dir");
        std::fs::write(&blocked, b"x").unwrap();

        let path = source.path().join("doc.txt");
        std::fs::write(&path, b"hello").unwrap();

        let (server, _received) = receiving_server(&blocked);
        let (client, mut sent, sender) = sending_client(server.local_addr().unwrap(), &path, 4096);

        assert_eq!(next(&mut sent).await, (1, false, path));
        assert!(sender.progress(1).is_none());
        assert_eq!(sender.active_transfers(), 0);

        client.close_service();
        server.close_service();
    }

    #[tokio::test]
    async fn test_peer_drop_fails_sender() {
        let source = TempDir::new().unwrap();
        let path = source.path().join("large.bin");
        std::fs::write(&path, vec![7u8; 100_000]).unwrap();

        // Takes the request, never answers, then hangs up
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, mut sent, sender) = sending_client(addr, &path, 4096);
        let (mut peer, _) = listener.accept().await.unwrap();
        let mut request = [0u8; 280];
        peer.read_exact(&mut request).await.unwrap();
        assert_eq!(FileRequest::decode(&request).unwrap().file_size, 100_000);
        drop(peer);

        assert_eq!(next(&mut sent).await, (1, false, path));
        assert_eq!(sender.active_transfers(), 0);
        assert!(sender.progress(1).is_none());

        client.close_service();
    }

    #[tokio::test]
    async fn test_client_drop_fails_receiver() {
        let target = TempDir::new().unwrap();
        let (server, mut received) = receiving_server(target.path());

        let mut peer = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
        let request = FileRequest {
            filename: "big.bin".into(),
            file_size: 10_000,
            chunks_total: 3,
            chunk_size: 4096,
            transfer_id: 9,
        };
        let frame = request.encode(&mut SendBufferManager::new().context()).unwrap();
        peer.write_all(frame.as_ref()).await.unwrap();

        let mut response = [0u8; 8];
        peer.read_exact(&mut response).await.unwrap();
        assert_eq!(PacketHeader::parse(&response).unwrap().id, FilePacketId::Response as u16);
        assert_eq!(decode_notice(&response).unwrap(), 9);
        drop(peer);

        assert_eq!(next(&mut received).await, (1, false, target.path().join("big.bin")));

        server.close_service();
    }

    #[tokio::test]
    async fn test_connect_failure_reports_send() {
        let source = TempDir::new().unwrap();
        let path = source.path().join("unsent.bin");
        std::fs::write(&path, b"data").unwrap();

        let addr = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();
        let (client, mut sent, sender) = sending_client(addr, &path, 4096);

        assert_eq!(next(&mut sent).await, (1, false, path));
        assert_eq!(sender.active_transfers(), 0);

        client.close_service();
    }

    #[tokio::test]
    async fn test_missing_file_reports_send() {
        let source = TempDir::new().unwrap();
        let path = source.path().join("missing.bin");

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, mut sent, _sender) = sending_client(addr, &path, 4096);
        let _peer = listener.accept().await.unwrap();

        let (_, ok, reported) = next(&mut sent).await;
        assert!(!ok);
        assert_eq!(reported, path);

        client.close_service();
    }
}
