//! Asynchronous TCP session runtime.
//!
//! Building blocks, bottom-up:
//! - `MemoryPoolManager`: size-classed block pool
//! - `SendBufferManager` / `SendContext`: pooled, bump-allocated output
//!   buffers shared with in-flight writes
//! - `RecvBuffer`: per-connection sliding receive buffer
//! - `Session`: connection state machine with one outstanding read and
//!   one outstanding vectored write
//! - `PacketSession`: length-prefixed framing over a session
//! - `Service` / `Listener`: session registry, accept loop, client dialing
//!
//! All I/O runs on a multi-threaded tokio runtime whose worker threads
//! play the role of the completion workers.

mod listener;
mod memory;
mod packet;
mod recv_buffer;
mod send_buffer;
mod service;
mod session;

pub use listener::Listener;
pub use memory::{ClassStats, MemoryPoolManager, PooledBlock};
pub use packet::{
    build_packet, packet_body, split_frames, PacketError, PacketHandler, PacketHeader,
    PacketSession, PACKET_HEADER_SIZE,
};
pub use recv_buffer::RecvBuffer;
pub use send_buffer::{
    SendBuffer, SendBufferManager, SendBufferWriter, SendContext, SEND_BUFFER_CHUNK_SIZE,
};
pub use service::{Service, ServiceConfig, ServiceError, ServiceType, SessionFactory};
pub use session::{ConnState, Session, SessionHandler, DEFAULT_RECV_BUFFER_SIZE};

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::runtime::{Builder, Runtime};
use tracing::info;

/// Build the worker pool that drives every service.
///
/// `workers` threads each pump completions until the runtime is dropped.
pub fn run_workers(workers: usize) -> io::Result<Runtime> {
    let workers = workers.max(1);
    info!(workers, "Starting workers");

    Builder::new_multi_thread()
        .worker_threads(workers)
        .thread_name_fn(|| {
            static NEXT: AtomicUsize = AtomicUsize::new(0);
            format!("worker-{}", NEXT.fetch_add(1, Ordering::Relaxed))
        })
        .enable_all()
        .build()
}

/// Default worker count.
pub fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_workers() {
        let runtime = run_workers(2).unwrap();
        let name = runtime.block_on(async {
            tokio::spawn(async { std::thread::current().name().map(str::to_owned) })
                .await
                .unwrap()
        });
        assert!(name.unwrap().starts_with("worker-"));
    }

    #[test]
    fn test_zero_workers_clamped() {
        tokio_test::assert_ok!(run_workers(0));
        assert!(num_cpus() >= 1);
    }
}
