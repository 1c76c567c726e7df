//! Length-prefixed packet framing.
//!
//! Every frame starts with a 4-byte header:
//!
//! ```text
//! +----------------+----------------+----------------------+
//! | size: u16 (LE) |  id: u16 (LE)  | body (size - 4 bytes) |
//! +----------------+----------------+----------------------+
//! ```
//!
//! `size` counts the whole frame including the header. A header whose
//! size is smaller than the header itself is a protocol violation and
//! closes the connection.

use crate::runtime::send_buffer::{SendBuffer, SendContext};
use crate::runtime::session::{Session, SessionHandler};
use bytes::{Buf, BufMut};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// Size of the packet header in bytes.
pub const PACKET_HEADER_SIZE: usize = 4;

/// Errors produced while framing or decoding packets.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet size {size} is smaller than the 4-byte header")]
    InvalidSize { size: u16 },

    #[error("packet {id} truncated: need {needed} bytes, have {available}")]
    Truncated {
        id: u16,
        needed: usize,
        available: usize,
    },

    #[error("unexpected packet id {0}")]
    UnexpectedId(u16),
}

/// Frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Total frame length including the header.
    pub size: u16,
    pub id: u16,
}

impl PacketHeader {
    /// Parse a header from the front of `buf`.
    ///
    /// Returns `None` if fewer than 4 bytes are available.
    pub fn parse(mut buf: &[u8]) -> Option<Self> {
        if buf.len() < PACKET_HEADER_SIZE {
            return None;
        }
        let size = buf.get_u16_le();
        let id = buf.get_u16_le();
        Some(Self { size, id })
    }

    /// Encode into the first 4 bytes of `out`.
    pub fn write(&self, mut out: &mut [u8]) {
        out.put_u16_le(self.size);
        out.put_u16_le(self.id);
    }

    /// Body length declared by the header.
    pub fn body_len(&self) -> usize {
        (self.size as usize).saturating_sub(PACKET_HEADER_SIZE)
    }
}

/// Split complete frames off the front of `data`.
///
/// `dispatch` receives each whole frame (header included) and returns
/// `false` to stop early. Returns the number of bytes consumed; a partial
/// trailing frame is left for the next read.
pub fn split_frames<F>(data: &[u8], mut dispatch: F) -> Result<usize, PacketError>
where
    F: FnMut(&[u8]) -> bool,
{
    let mut processed = 0;

    while let Some(header) = PacketHeader::parse(&data[processed..]) {
        let size = header.size as usize;
        if size < PACKET_HEADER_SIZE {
            return Err(PacketError::InvalidSize { size: header.size });
        }
        if data.len() - processed < size {
            break;
        }

        let frame = &data[processed..processed + size];
        processed += size;
        if !dispatch(frame) {
            break;
        }
    }

    Ok(processed)
}

/// Build one frame in the context's current chunk.
///
/// `fill` writes exactly `body_len` bytes of body. Returns `None` when
/// the frame does not fit in a send buffer chunk or a u16 size.
pub fn build_packet<F>(cx: &mut SendContext, id: u16, body_len: usize, fill: F) -> Option<SendBuffer>
where
    F: FnOnce(&mut [u8]),
{
    let size = PACKET_HEADER_SIZE + body_len;
    let header = PacketHeader {
        size: u16::try_from(size).ok()?,
        id,
    };

    let mut writer = cx.open(size)?;
    let buf = writer.buffer_mut();
    header.write(&mut buf[..PACKET_HEADER_SIZE]);
    fill(&mut buf[PACKET_HEADER_SIZE..size]);
    Some(writer.close(size))
}

/// Body of a frame, after checking it holds at least `needed` bytes.
pub fn packet_body(packet: &[u8], needed: usize) -> Result<(PacketHeader, &[u8]), PacketError> {
    let header = PacketHeader::parse(packet).ok_or(PacketError::Truncated {
        id: 0,
        needed: PACKET_HEADER_SIZE,
        available: packet.len(),
    })?;
    let body = &packet[PACKET_HEADER_SIZE..];
    if body.len() < needed {
        return Err(PacketError::Truncated {
            id: header.id,
            needed,
            available: body.len(),
        });
    }
    Ok((header, body))
}

/// Frame-level hooks.
pub trait PacketHandler: Send + Sync + 'static {
    fn on_connected(&self, _session: &Arc<Session>, _cx: &mut SendContext) {}

    /// One complete frame, header included.
    fn on_recv_packet(&self, session: &Arc<Session>, cx: &mut SendContext, packet: &[u8]);

    fn on_send(&self, _session: &Arc<Session>, _len: usize) {}

    fn on_disconnected(&self, _session: &Arc<Session>) {}

    fn on_connect_failed(&self, _session: &Arc<Session>, _error: &std::io::Error) {}
}

/// Adapter turning a [`PacketHandler`] into a [`SessionHandler`].
pub struct PacketSession<H> {
    handler: H,
}

impl<H: PacketHandler> PacketSession<H> {
    pub fn new(handler: H) -> Self {
        Self { handler }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }
}

impl<H: PacketHandler> SessionHandler for PacketSession<H> {
    fn on_connected(&self, session: &Arc<Session>, cx: &mut SendContext) {
        self.handler.on_connected(session, cx);
    }

    fn on_recv(&self, session: &Arc<Session>, cx: &mut SendContext, data: &[u8]) -> isize {
        let result = split_frames(data, |frame| {
            self.handler.on_recv_packet(session, cx, frame);
            // Nothing is dispatched once the handler has disconnected
            session.is_connected()
        });

        match result {
            Ok(processed) => processed as isize,
            Err(e) => {
                warn!(session = session.id(), error = %e, "Protocol violation");
                -1
            }
        }
    }

    fn on_send(&self, session: &Arc<Session>, len: usize) {
        self.handler.on_send(session, len);
    }

    fn on_disconnected(&self, session: &Arc<Session>) {
        self.handler.on_disconnected(session);
    }

    fn on_connect_failed(&self, session: &Arc<Session>, error: &std::io::Error) {
        self.handler.on_connect_failed(session, error);
    }
}
