//! TCP accept loop for server services.

use crate::runtime::service::Service;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Bound listening socket with its accept task.
///
/// The accept task holds only a weak reference to the service, so a
/// dropped service ends the loop on the next accept.
pub struct Listener {
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl Listener {
    /// Bind the service address and start accepting.
    pub fn start(service: &Arc<Service>) -> io::Result<Self> {
        let std_listener = create_listener(service.address())?;

        let _guard = service.runtime().enter();
        let listener = TcpListener::from_std(std_listener)?;
        let local_addr = listener.local_addr()?;

        info!(address = %local_addr, "Listener started");

        let accept_task = service
            .runtime()
            .spawn(accept_loop(listener, Arc::downgrade(service)));

        Ok(Self {
            local_addr,
            accept_task,
        })
    }

    /// Address actually bound, useful when the configured port is 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting. Established sessions are unaffected.
    pub fn stop(&self) {
        if !self.accept_task.is_finished() {
            self.accept_task.abort();
            debug!(address = %self.local_addr, "Listener stopped");
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(listener: TcpListener, service: Weak<Service>) {
    loop {
        let accepted = listener.accept().await;

        let Some(service) = service.upgrade() else {
            break;
        };

        match accepted {
            Ok((stream, peer)) => {
                if service.session_count() >= service.max_session_count() {
                    warn!(
                        peer = %peer,
                        max = service.max_session_count(),
                        "Session limit reached, rejecting connection"
                    );
                    continue;
                }

                let session = service.create_session();
                debug!(peer = %peer, session = session.id(), "Accepted connection");

                // Hand off so the next accept is posted immediately
                service.runtime().spawn(async move {
                    session.accept(stream).await;
                });
            }
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
            }
        }
    }
}

/// Create a nonblocking listening socket with SO_REUSEADDR.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}
