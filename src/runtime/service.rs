//! Session ownership and lifecycle.
//!
//! A `Service` owns the set of live sessions for one endpoint, either a
//! server accepting on a local address or a client dialing a remote one.
//! Sessions register themselves when their connection is established and
//! deregister on disconnect; the registry enforces `max_sessions`.

use crate::runtime::listener::Listener;
use crate::runtime::send_buffer::{SendBuffer, SendBufferManager};
use crate::runtime::session::{Session, SessionHandler, DEFAULT_RECV_BUFFER_SIZE};
use slab::Slab;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

/// Role of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceType {
    /// Accepts inbound connections on `address`.
    Server,
    /// Opens outbound connections to `address`.
    Client,
}

/// Builds the handler for each new session.
pub type SessionFactory = Arc<dyn Fn() -> Box<dyn SessionHandler> + Send + Sync>;

/// Service errors.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service is at capacity ({max} sessions)")]
    AtCapacity { max: usize },

    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("service is already listening")]
    AlreadyStarted,
}

/// Service settings.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Bind address for servers, remote address for clients.
    pub address: SocketAddr,
    pub max_sessions: usize,
    /// Nominal receive size per read.
    pub recv_buffer_size: usize,
}

impl ServiceConfig {
    pub fn new(address: SocketAddr, max_sessions: usize) -> Self {
        Self {
            address,
            max_sessions,
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
        }
    }
}

/// Registry of live sessions using slab allocation.
struct SessionRegistry {
    sessions: Slab<Arc<Session>>,
    max_sessions: usize,
}

impl SessionRegistry {
    fn new(max_sessions: usize) -> Self {
        Self {
            sessions: Slab::new(),
            max_sessions,
        }
    }

    /// Returns `None` if the registry is at capacity.
    fn insert(&mut self, session: Arc<Session>) -> Option<usize> {
        if self.sessions.len() >= self.max_sessions {
            return None;
        }
        Some(self.sessions.insert(session))
    }

    /// Remove `session` if it still occupies `key`.
    fn remove(&mut self, key: usize, session: &Arc<Session>) -> bool {
        match self.sessions.get(key) {
            Some(registered) if Arc::ptr_eq(registered, session) => {
                self.sessions.remove(key);
                true
            }
            _ => false,
        }
    }

    fn len(&self) -> usize {
        self.sessions.len()
    }

    fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|(_, s)| Arc::clone(s)).collect()
    }
}

/// Owner of a set of sessions.
pub struct Service {
    service_type: ServiceType,
    config: ServiceConfig,
    runtime: Handle,
    factory: SessionFactory,
    send_buffers: Arc<SendBufferManager>,
    registry: Mutex<SessionRegistry>,
    listener: Mutex<Option<Listener>>,
    next_session_id: AtomicU64,
    this: Weak<Service>,
}

impl Service {
    /// Create a service. Sessions and I/O run on `runtime`.
    pub fn new(
        service_type: ServiceType,
        config: ServiceConfig,
        runtime: Handle,
        factory: SessionFactory,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            service_type,
            registry: Mutex::new(SessionRegistry::new(config.max_sessions)),
            config,
            runtime,
            factory,
            send_buffers: SendBufferManager::new(),
            listener: Mutex::new(None),
            next_session_id: AtomicU64::new(1),
            this: this.clone(),
        })
    }

    /// Server accepting on `config.address`.
    pub fn server(config: ServiceConfig, runtime: Handle, factory: SessionFactory) -> Arc<Self> {
        Self::new(ServiceType::Server, config, runtime, factory)
    }

    /// Client dialing `config.address`.
    pub fn client(config: ServiceConfig, runtime: Handle, factory: SessionFactory) -> Arc<Self> {
        Self::new(ServiceType::Client, config, runtime, factory)
    }

    /// Start the service.
    ///
    /// A server binds and begins accepting. A client opens connections
    /// for every free slot and fails if there is none.
    pub fn start(&self) -> Result<(), ServiceError> {
        match self.service_type {
            ServiceType::Server => self.start_listener(),
            ServiceType::Client => self.start_clients(),
        }
    }

    fn start_listener(&self) -> Result<(), ServiceError> {
        let mut slot = self.listener.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return Err(ServiceError::AlreadyStarted);
        }

        // Only reachable while an Arc is held by the caller
        let Some(service) = self.this.upgrade() else {
            return Err(ServiceError::Bind {
                addr: self.config.address,
                source: io::Error::new(io::ErrorKind::Other, "service dropped"),
            });
        };

        let listener = Listener::start(&service).map_err(|source| ServiceError::Bind {
            addr: self.config.address,
            source,
        })?;
        *slot = Some(listener);
        Ok(())
    }

    fn start_clients(&self) -> Result<(), ServiceError> {
        let available = self
            .config
            .max_sessions
            .saturating_sub(self.session_count());
        if available == 0 {
            return Err(ServiceError::AtCapacity {
                max: self.config.max_sessions,
            });
        }

        info!(address = %self.config.address, sessions = available, "Connecting client sessions");
        for _ in 0..available {
            let session = self.create_session();
            session.connect(self.config.address);
        }
        Ok(())
    }

    /// Stop accepting and disconnect every session.
    pub fn close_service(&self) {
        if let Some(listener) = self.listener.lock().unwrap_or_else(|e| e.into_inner()).take() {
            listener.stop();
        }

        // Disconnect re-enters the registry lock
        let sessions = self.sessions();
        info!(sessions = sessions.len(), "Closing service");
        for session in sessions {
            session.disconnect("service closed");
        }
    }

    /// Create a new, unconnected session with a handler from the factory.
    pub fn create_session(&self) -> Arc<Session> {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        Session::new(
            id,
            self.runtime.clone(),
            (self.factory)(),
            Arc::clone(&self.send_buffers),
            self.config.recv_buffer_size,
            self.this.clone(),
        )
    }

    /// Register a connected session. Returns `false` at capacity.
    pub fn add_session(&self, session: &Arc<Session>) -> bool {
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        match registry.insert(Arc::clone(session)) {
            Some(key) => {
                session.set_registry_key(Some(key));
                debug!(session = session.id(), sessions = registry.len(), "Session registered");
                true
            }
            None => false,
        }
    }

    /// Deregister a session. Unknown sessions are ignored.
    pub fn release_session(&self, session: &Arc<Session>) {
        let Some(key) = session.registry_key() else {
            return;
        };

        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        if registry.remove(key, session) {
            session.set_registry_key(None);
            debug!(session = session.id(), sessions = registry.len(), "Session released");
        } else {
            warn!(session = session.id(), key, "Release of unregistered session");
        }
    }

    /// Send `buffer` on every live session.
    ///
    /// The buffer is shared, not copied.
    pub fn broadcast(&self, buffer: SendBuffer) {
        for session in self.sessions() {
            session.send(buffer.clone());
        }
    }

    /// Snapshot of the live sessions.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .snapshot()
    }

    pub fn session_count(&self) -> usize {
        self.registry.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn max_session_count(&self) -> usize {
        self.config.max_sessions
    }

    pub fn service_type(&self) -> ServiceType {
        self.service_type
    }

    /// Configured address.
    pub fn address(&self) -> SocketAddr {
        self.config.address
    }

    /// Bound address of a started server.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(Listener::local_addr)
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub fn send_buffers(&self) -> &Arc<SendBufferManager> {
        &self.send_buffers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::packet::{build_packet, packet_body, PacketHandler, PacketSession};
    use crate::runtime::send_buffer::SendContext;
    use crate::runtime::session::ConnState;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Echoes every frame back unchanged.
    struct Echo;

    impl PacketHandler for Echo {
        fn on_recv_packet(&self, session: &Arc<Session>, _cx: &mut SendContext, packet: &[u8]) {
            session.send(SendBuffer::copy_from_slice(packet));
        }
    }

    /// Sends one frame on connect and forwards replies.
    struct Greeter {
        replies: mpsc::UnboundedSender<Vec<u8>>,
    }

    impl PacketHandler for Greeter {
        fn on_connected(&self, session: &Arc<Session>, cx: &mut SendContext) {
            let packet = build_packet(cx, 9, 5, |body| body.copy_from_slice(b"hello")).unwrap();
            session.send(packet);
        }

        fn on_recv_packet(&self, _session: &Arc<Session>, _cx: &mut SendContext, packet: &[u8]) {
            let (_, body) = packet_body(packet, 0).unwrap();
            let _ = self.replies.send(body.to_vec());
        }
    }

    fn echo_server(max_sessions: usize) -> Arc<Service> {
        let config = ServiceConfig::new("127.0.0.1:0".parse().unwrap(), max_sessions);
        let service = Service::server(
            config,
            Handle::current(),
            Arc::new(|| Box::new(PacketSession::new(Echo)) as Box<dyn SessionHandler>),
        );
        service.start().unwrap();
        service
    }

    fn greeter_client(
        addr: SocketAddr,
        max_sessions: usize,
    ) -> (Arc<Service>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let service = Service::client(
            ServiceConfig::new(addr, max_sessions),
            Handle::current(),
            Arc::new(move || {
                Box::new(PacketSession::new(Greeter {
                    replies: tx.clone(),
                })) as Box<dyn SessionHandler>
            }),
        );
        (service, rx)
    }

    async fn wait_for_count(service: &Service, expected: usize) {
        for _ in 0..200 {
            if service.session_count() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {expected} sessions, have {}",
            service.session_count()
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_round_trip_through_services() {
        let server = echo_server(10);
        let addr = server.local_addr().unwrap();

        let (client, mut replies) = greeter_client(addr, 3);
        client.start().unwrap();

        for _ in 0..3 {
            assert_eq!(replies.recv().await.unwrap(), b"hello");
        }
        wait_for_count(&server, 3).await;
        wait_for_count(&client, 3).await;

        client.close_service();
        wait_for_count(&client, 0).await;
        wait_for_count(&server, 0).await;

        server.close_service();
    }

    #[tokio::test]
    async fn test_client_start_at_capacity_fails() {
        let server = echo_server(10);
        let (client, mut replies) = greeter_client(server.local_addr().unwrap(), 1);

        tokio_test::assert_ok!(client.start());
        replies.recv().await.unwrap();
        wait_for_count(&client, 1).await;

        assert!(matches!(
            client.start(),
            Err(ServiceError::AtCapacity { max: 1 })
        ));
        server.close_service();
    }

    #[tokio::test]
    async fn test_server_enforces_max_sessions() {
        let server = echo_server(2);
        let addr = server.local_addr().unwrap();

        let (client, mut replies) = greeter_client(addr, 2);
        client.start().unwrap();
        replies.recv().await.unwrap();
        replies.recv().await.unwrap();
        wait_for_count(&server, 2).await;

        // Third connection is accepted by the kernel then dropped
        let mut extra = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(
            Duration::from_secs(5),
            tokio::io::AsyncReadExt::read(&mut extra, &mut buf),
        )
        .await
        .unwrap()
        .unwrap_or(0);
        assert_eq!(n, 0);
        assert_eq!(server.session_count(), 2);

        server.close_service();
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_session() {
        let server = echo_server(10);
        let (client, mut replies) = greeter_client(server.local_addr().unwrap(), 2);
        client.start().unwrap();
        replies.recv().await.unwrap();
        replies.recv().await.unwrap();
        wait_for_count(&server, 2).await;

        let packet = {
            let mut cx = server.send_buffers().context();
            build_packet(&mut cx, 9, 3, |body| body.copy_from_slice(b"all")).unwrap()
        };
        server.broadcast(packet);

        assert_eq!(replies.recv().await.unwrap(), b"all");
        assert_eq!(replies.recv().await.unwrap(), b"all");
        server.close_service();
    }

    #[tokio::test]
    async fn test_close_service_disconnects_sessions() {
        let server = echo_server(10);
        let (client, mut replies) = greeter_client(server.local_addr().unwrap(), 2);
        client.start().unwrap();
        replies.recv().await.unwrap();
        replies.recv().await.unwrap();
        wait_for_count(&server, 2).await;

        let sessions = server.sessions();
        server.close_service();

        assert_eq!(server.session_count(), 0);
        assert!(server.local_addr().is_none());
        for session in sessions {
            assert_eq!(session.state(), ConnState::Disconnected);
        }
        wait_for_count(&client, 0).await;
    }

    #[tokio::test]
    async fn test_release_unknown_session_is_ignored() {
        let server = echo_server(1);
        let session = server.create_session();

        server.release_session(&session);
        assert_eq!(server.session_count(), 0);
        assert_eq!(session.state(), ConnState::New);
    }
}
