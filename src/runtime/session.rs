//! Connection state machine.
//!
//! A `Session` owns one TCP connection and drives it through two
//! pipelines that each keep at most one operation outstanding:
//!
//! - the receive loop: read into the receive buffer, hand the unread span
//!   to the handler's framing hook, consume, compact, read again
//! - the flush loop: drain the whole send queue into one vectored write,
//!   keep every drained buffer alive until the write completes, repeat
//!   while the queue is non-empty
//!
//! ## State Machine
//!
//! ```text
//! New -> Connecting -> Connected -> Disconnected
//! ```
//!
//! `Disconnected` is terminal; a new session is created per connection
//! attempt. `disconnect` is a compare-and-swap on the state, so only the
//! first caller tears the connection down.

use crate::runtime::recv_buffer::RecvBuffer;
use crate::runtime::send_buffer::{SendBuffer, SendBufferManager, SendContext};
use crate::runtime::service::Service;
use std::collections::VecDeque;
use std::io::{self, IoSlice};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

/// Default nominal receive size per read (64KB).
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 0x10000;

/// Registry key of a session that is not registered.
const UNREGISTERED: usize = usize::MAX;

/// Connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    /// Created, never connected.
    New = 0,
    /// Outbound connect or accept hand-off in progress.
    Connecting = 1,
    /// Socket is live; reads and writes are running.
    Connected = 2,
    /// Torn down. Terminal.
    Disconnected = 3,
}

impl ConnState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnState::New,
            1 => ConnState::Connecting,
            2 => ConnState::Connected,
            _ => ConnState::Disconnected,
        }
    }
}

/// Hooks invoked by a session.
///
/// Hooks run on whichever worker thread completed the I/O, never
/// concurrently with another `on_recv` of the same session.
pub trait SessionHandler: Send + Sync + 'static {
    /// Connection established and registered; fires before the first read.
    fn on_connected(&self, _session: &Arc<Session>, _cx: &mut SendContext) {}

    /// Framing hook over all unread bytes.
    ///
    /// Returns the number of bytes consumed. A negative value or a value
    /// larger than `data.len()` is treated as protocol corruption and
    /// disconnects the session.
    fn on_recv(&self, _session: &Arc<Session>, _cx: &mut SendContext, data: &[u8]) -> isize {
        data.len() as isize
    }

    /// A flush completed with `len` bytes written.
    fn on_send(&self, _session: &Arc<Session>, _len: usize) {}

    /// Connection torn down. Fires exactly once per connected session.
    fn on_disconnected(&self, _session: &Arc<Session>) {}

    /// Outbound connect failed; the session is now `Disconnected`.
    fn on_connect_failed(&self, _session: &Arc<Session>, _error: &io::Error) {}
}

/// One TCP connection.
pub struct Session {
    id: u64,
    state: AtomicU8,
    handler: Box<dyn SessionHandler>,
    service: Weak<Service>,
    send_buffers: Arc<SendBufferManager>,
    runtime: Handle,
    recv_buffer_size: usize,
    registry_key: AtomicUsize,
    peer_addr: OnceLock<SocketAddr>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    send_queue: Mutex<VecDeque<SendBuffer>>,
    send_registered: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl Session {
    pub(crate) fn new(
        id: u64,
        runtime: Handle,
        handler: Box<dyn SessionHandler>,
        send_buffers: Arc<SendBufferManager>,
        recv_buffer_size: usize,
        service: Weak<Service>,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            id,
            state: AtomicU8::new(ConnState::New as u8),
            handler,
            service,
            send_buffers,
            runtime,
            recv_buffer_size,
            registry_key: AtomicUsize::new(UNREGISTERED),
            peer_addr: OnceLock::new(),
            writer: tokio::sync::Mutex::new(None),
            send_queue: Mutex::new(VecDeque::new()),
            send_registered: AtomicBool::new(false),
            shutdown,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    /// Remote address once connected.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr.get().copied()
    }

    /// Owning service, if it is still alive.
    pub fn service(&self) -> Option<Arc<Service>> {
        self.service.upgrade()
    }

    /// Send buffer pool shared with the owning service.
    pub fn send_buffers(&self) -> &Arc<SendBufferManager> {
        &self.send_buffers
    }

    /// Runtime the session's tasks are spawned on.
    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub(crate) fn registry_key(&self) -> Option<usize> {
        match self.registry_key.load(Ordering::Acquire) {
            UNREGISTERED => None,
            key => Some(key),
        }
    }

    pub(crate) fn set_registry_key(&self, key: Option<usize>) {
        self.registry_key
            .store(key.unwrap_or(UNREGISTERED), Ordering::Release);
    }

    fn transition(&self, from: ConnState, to: ConnState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Open an outbound connection.
    ///
    /// Only valid on a `New` session; returns `false` otherwise. The result
    /// is reported through `on_connected` or `on_connect_failed`.
    pub fn connect(self: &Arc<Self>, addr: SocketAddr) -> bool {
        if !self.transition(ConnState::New, ConnState::Connecting) {
            return false;
        }

        trace!(session = self.id, %addr, "Connecting");
        let session = Arc::clone(self);
        self.runtime.spawn(async move {
            match TcpStream::connect(addr).await {
                Ok(stream) => session.process_connect(stream).await,
                Err(e) => session.process_connect_failed(addr, e),
            }
        });
        true
    }

    /// Adopt an accepted socket.
    pub(crate) async fn accept(self: &Arc<Self>, stream: TcpStream) {
        if !self.transition(ConnState::New, ConnState::Connecting) {
            return;
        }
        self.process_connect(stream).await;
    }

    async fn process_connect(self: &Arc<Self>, stream: TcpStream) {
        if let Ok(addr) = stream.peer_addr() {
            let _ = self.peer_addr.set(addr);
        }
        if let Err(e) = stream.set_nodelay(true) {
            debug!(session = self.id, error = %e, "Failed to set TCP_NODELAY");
        }

        let (reader, writer) = stream.into_split();
        *self.writer.lock().await = Some(writer);

        if !self.transition(ConnState::Connecting, ConnState::Connected) {
            return;
        }

        if let Some(service) = self.service() {
            if !service.add_session(self) {
                warn!(
                    session = self.id,
                    max = service.max_session_count(),
                    "Session limit reached, dropping connection"
                );
                if self.transition(ConnState::Connected, ConnState::Disconnected) {
                    self.shutdown.send_replace(true);
                }
                self.writer.lock().await.take();
                return;
            }
        }

        debug!(session = self.id, peer = ?self.peer_addr(), "Session connected");
        let session = Arc::clone(self);
        self.runtime.spawn(session.receive_loop(reader));
    }

    fn process_connect_failed(self: &Arc<Self>, addr: SocketAddr, error: io::Error) {
        warn!(session = self.id, %addr, error = %error, "Connect failed");
        if self.transition(ConnState::Connecting, ConnState::Disconnected) {
            self.handler.on_connect_failed(self, &error);
        }
    }

    /// Queue a buffer for sending.
    ///
    /// Safe to call from any thread. Dropped silently when not connected.
    pub fn send(self: &Arc<Self>, buffer: SendBuffer) {
        if !self.is_connected() {
            trace!(session = self.id, len = buffer.len(), "Send on closed session dropped");
            return;
        }

        let register = {
            let mut queue = self.send_queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.push_back(buffer);
            !self.send_registered.swap(true, Ordering::AcqRel)
        };

        if register {
            let session = Arc::clone(self);
            self.runtime.spawn(session.flush_loop());
        }
    }

    /// Tear the connection down.
    ///
    /// Idempotent: only the first call closes the socket, fires
    /// `on_disconnected` and deregisters from the service.
    pub fn disconnect(self: &Arc<Self>, cause: &str) {
        if !self.transition(ConnState::Connected, ConnState::Disconnected) {
            return;
        }

        debug!(session = self.id, cause, "Disconnecting");
        self.shutdown.send_replace(true);
        self.send_queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();

        let session = Arc::clone(self);
        self.runtime.spawn(async move {
            if let Some(mut writer) = session.writer.lock().await.take() {
                let _ = writer.shutdown().await;
            }
        });

        self.handler.on_disconnected(self);

        if let Some(service) = self.service() {
            service.release_session(self);
        }
    }

    /// Route an I/O error to disconnect.
    fn handle_error(self: &Arc<Self>, error: &io::Error) {
        match error.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => {
                debug!(session = self.id, error = %error, "Connection error");
            }
            _ => {
                warn!(session = self.id, error = %error, "Socket error");
            }
        }
        self.disconnect(&error.to_string());
    }

    async fn receive_loop(self: Arc<Self>, mut reader: OwnedReadHalf) {
        let mut shutdown = self.shutdown.subscribe();
        let mut recv_buffer = RecvBuffer::new(self.recv_buffer_size);
        let mut cx = self.send_buffers.context();

        self.handler.on_connected(&self, &mut cx);

        loop {
            if !self.is_connected() {
                break;
            }

            // A frame that cannot fit will never complete
            if recv_buffer.free_size() == 0 {
                warn!(
                    session = self.id,
                    capacity = recv_buffer.capacity(),
                    "Receive buffer full"
                );
                self.disconnect("read overflow");
                break;
            }

            let result = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                result = reader.read(recv_buffer.free_mut()) => result,
            };

            let n = match result {
                Ok(0) => {
                    trace!(session = self.id, "Connection closed by peer");
                    self.disconnect("connection closed by peer");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    self.handle_error(&e);
                    break;
                }
            };

            if !recv_buffer.on_write(n) {
                self.disconnect("write overflow");
                break;
            }

            let data_size = recv_buffer.data_size();
            let processed = self.handler.on_recv(&self, &mut cx, recv_buffer.data());
            let consumed = match usize::try_from(processed) {
                Ok(consumed) if consumed <= data_size => consumed,
                _ => {
                    warn!(session = self.id, processed, data_size, "Invalid consumed length");
                    self.disconnect("read overflow");
                    break;
                }
            };
            if !recv_buffer.on_read(consumed) {
                self.disconnect("read overflow");
                break;
            }

            recv_buffer.clean();
        }

        trace!(session = self.id, "Receive loop finished");
    }

    async fn flush_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut writer = self.writer.lock().await;

        loop {
            let pending: Vec<SendBuffer> = {
                let mut queue = self.send_queue.lock().unwrap_or_else(|e| e.into_inner());
                if queue.is_empty() || !self.is_connected() {
                    self.send_registered.store(false, Ordering::Release);
                    return;
                }
                queue.drain(..).collect()
            };

            let Some(stream) = writer.as_mut() else {
                self.send_registered.store(false, Ordering::Release);
                return;
            };

            // `pending` keeps the chunks alive until the write completes
            let result = tokio::select! {
                biased;
                _ = shutdown.changed() => return,
                result = write_all_vectored(stream, &pending) => result,
            };

            match result {
                Ok(written) => {
                    trace!(session = self.id, buffers = pending.len(), written, "Flushed");
                    self.handler.on_send(&self, written);
                }
                Err(e) => {
                    drop(writer);
                    self.handle_error(&e);
                    return;
                }
            }
        }
    }
}

/// Write every buffer in order with scatter/gather I/O.
///
/// Returns the total number of bytes written.
async fn write_all_vectored<W>(writer: &mut W, buffers: &[SendBuffer]) -> io::Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let mut slices: Vec<IoSlice<'_>> = buffers
        .iter()
        .filter(|buffer| !buffer.is_empty())
        .map(|buffer| IoSlice::new(buffer.as_ref()))
        .collect();
    let total: usize = slices.iter().map(|slice| slice.len()).sum();

    let mut remaining = &mut slices[..];
    while !remaining.is_empty() {
        let n = writer.write_vectored(remaining).await?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
        }
        IoSlice::advance_slices(&mut remaining, n);
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    #[derive(Debug, PartialEq)]
    enum Event {
        Connected,
        Recv(Vec<u8>),
        Disconnected,
        ConnectFailed,
    }

    /// Reports every hook call on a channel and consumes all bytes.
    struct Recorder {
        events: mpsc::UnboundedSender<Event>,
    }

    impl SessionHandler for Recorder {
        fn on_connected(&self, _session: &Arc<Session>, _cx: &mut SendContext) {
            let _ = self.events.send(Event::Connected);
        }

        fn on_recv(&self, _session: &Arc<Session>, _cx: &mut SendContext, data: &[u8]) -> isize {
            let _ = self.events.send(Event::Recv(data.to_vec()));
            data.len() as isize
        }

        fn on_disconnected(&self, _session: &Arc<Session>) {
            let _ = self.events.send(Event::Disconnected);
        }

        fn on_connect_failed(&self, _session: &Arc<Session>, _error: &io::Error) {
            let _ = self.events.send(Event::ConnectFailed);
        }
    }

    /// Claims to have consumed more than it was given.
    struct Overconsumer;

    impl SessionHandler for Overconsumer {
        fn on_recv(&self, _session: &Arc<Session>, _cx: &mut SendContext, data: &[u8]) -> isize {
            data.len() as isize + 1
        }
    }

    /// Never consumes anything.
    struct Hoarder;

    impl SessionHandler for Hoarder {
        fn on_recv(&self, _session: &Arc<Session>, _cx: &mut SendContext, _data: &[u8]) -> isize {
            0
        }
    }

    fn session_with(handler: Box<dyn SessionHandler>, recv_buffer_size: usize) -> Arc<Session> {
        Session::new(
            1,
            Handle::current(),
            handler,
            SendBufferManager::new(),
            recv_buffer_size,
            Weak::new(),
        )
    }

    fn recorder() -> (Box<dyn SessionHandler>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Box::new(Recorder { events: tx }), rx)
    }

    async fn wait_for_state(session: &Session, state: ConnState) {
        for _ in 0..200 {
            if session.state() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session never reached {state:?}, stuck in {:?}", session.state());
    }

    async fn connected_pair(
        handler: Box<dyn SessionHandler>,
        recv_buffer_size: usize,
    ) -> (Arc<Session>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let session = session_with(handler, recv_buffer_size);
        assert!(session.connect(listener.local_addr().unwrap()));
        let (peer, _) = listener.accept().await.unwrap();
        wait_for_state(&session, ConnState::Connected).await;
        (session, peer)
    }

    async fn read_to_end(mut peer: TcpStream) -> Vec<u8> {
        let mut received = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), peer.read_to_end(&mut received))
            .await
            .expect("peer read timed out")
            .unwrap();
        received
    }

    #[tokio::test]
    async fn test_connect_receive_disconnect() {
        let (handler, mut events) = recorder();
        let (session, mut peer) = connected_pair(handler, 1024).await;

        assert_eq!(events.recv().await, Some(Event::Connected));
        assert!(session.peer_addr().is_some());

        peer.write_all(b"ping").await.unwrap();
        assert_eq!(events.recv().await, Some(Event::Recv(b"ping".to_vec())));

        drop(peer);
        assert_eq!(events.recv().await, Some(Event::Disconnected));
        assert_eq!(session.state(), ConnState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_only_from_new() {
        let (handler, _events) = recorder();
        let (session, _peer) = connected_pair(handler, 1024).await;
        let addr = session.peer_addr().unwrap();

        assert!(!session.connect(addr));
        session.disconnect("test");
        // Terminal state: no reconnect
        assert!(!session.connect(addr));
    }

    #[tokio::test]
    async fn test_connect_failure_reported() {
        // Bind then drop to get a port with nothing listening
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let (handler, mut events) = recorder();
        let session = session_with(handler, 1024);
        assert!(session.connect(addr));

        assert_eq!(events.recv().await, Some(Event::ConnectFailed));
        assert_eq!(session.state(), ConnState::Disconnected);
    }

    #[tokio::test]
    async fn test_send_order_from_many_threads() {
        let (handler, _events) = recorder();
        let (session, peer) = connected_pair(handler, 1024).await;

        let threads: Vec<_> = (0..4u8)
            .map(|t| {
                let session = Arc::clone(&session);
                std::thread::spawn(move || {
                    for seq in 0..100u8 {
                        session.send(SendBuffer::copy_from_slice(&[t, seq, 0xEE, 0xFF]));
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        // Let the flushes drain, then close
        tokio::time::sleep(Duration::from_millis(200)).await;
        session.disconnect("done");

        let received = read_to_end(peer).await;
        assert_eq!(received.len(), 4 * 100 * 4);

        let mut next_seq = [0u8; 4];
        for record in received.chunks(4) {
            assert_eq!(&record[2..], &[0xEE, 0xFF], "records interleaved");
            let t = record[0] as usize;
            assert_eq!(record[1], next_seq[t], "out of order for thread {t}");
            next_seq[t] += 1;
        }
    }

    #[tokio::test]
    async fn test_disconnect_with_pending_sends() {
        let (handler, mut events) = recorder();
        let (session, peer) = connected_pair(handler, 1024).await;
        assert_eq!(events.recv().await, Some(Event::Connected));

        let record = [0x5Au8; 512];
        for _ in 0..3 {
            session.send(SendBuffer::copy_from_slice(&record));
        }
        session.disconnect("closing with pending sends");
        // After disconnect returns, sends are dropped
        session.send(SendBuffer::copy_from_slice(&[0x00; 16]));

        let received = read_to_end(peer).await;
        assert!(received.iter().all(|&b| b == 0x5A), "garbage on the wire");
        assert!(received.len() <= 3 * record.len());

        assert_eq!(events.recv().await, Some(Event::Disconnected));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (handler, mut events) = recorder();
        let (session, _peer) = connected_pair(handler, 1024).await;
        assert_eq!(events.recv().await, Some(Event::Connected));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let session = Arc::clone(&session);
                std::thread::spawn(move || session.disconnect("racing"))
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(events.recv().await, Some(Event::Disconnected));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(events.try_recv().is_err(), "teardown ran more than once");
    }

    #[tokio::test]
    async fn test_overconsumption_disconnects() {
        let (session, mut peer) = connected_pair(Box::new(Overconsumer), 1024).await;

        peer.write_all(b"abc").await.unwrap();
        wait_for_state(&session, ConnState::Disconnected).await;
    }

    #[tokio::test]
    async fn test_full_receive_buffer_disconnects() {
        // Capacity is 16 * 10 bytes
        let (session, mut peer) = connected_pair(Box::new(Hoarder), 16).await;

        let _ = peer.write_all(&[1u8; 400]).await;
        wait_for_state(&session, ConnState::Disconnected).await;
    }

    #[tokio::test]
    async fn test_write_all_vectored_skips_empty_buffers() {
        let buffers = vec![
            SendBuffer::from_static(b"ab"),
            SendBuffer::from_static(b""),
            SendBuffer::from_static(b"cd"),
        ];
        let mut out: Vec<u8> = Vec::new();
        let written = write_all_vectored(&mut out, &buffers).await.unwrap();
        assert_eq!(written, 4);
        assert_eq!(out, b"abcd");
    }
}
