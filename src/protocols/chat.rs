//! Chat frames.
//!
//! ```text
//! [header: size=104, id=1|2][message: 100 bytes, NUL-terminated]
//! ```
//!
//! The server answers every message frame with one reply frame carrying
//! `"echo: " + message`.

use crate::runtime::{
    build_packet, packet_body, PacketError, PacketHandler, SendBuffer, SendContext, Session,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Chat message request.
pub const CHAT_MESSAGE: u16 = 1;
/// Chat message reply.
pub const CHAT_REPLY: u16 = 2;

/// Fixed size of the message field, terminator included.
pub const CHAT_MESSAGE_LEN: usize = 100;

/// Encode a chat frame. Messages longer than 99 bytes are truncated on a
/// character boundary.
pub fn encode_chat(cx: &mut SendContext, id: u16, message: &str) -> Option<SendBuffer> {
    let text = truncate_utf8(message, CHAT_MESSAGE_LEN - 1);
    build_packet(cx, id, CHAT_MESSAGE_LEN, |body| {
        body.fill(0);
        body[..text.len()].copy_from_slice(text.as_bytes());
    })
}

/// Decode a chat frame into its id and message text.
pub fn decode_chat(packet: &[u8]) -> Result<(u16, String), PacketError> {
    let (header, body) = packet_body(packet, CHAT_MESSAGE_LEN)?;
    let field = &body[..CHAT_MESSAGE_LEN];
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    Ok((header.id, String::from_utf8_lossy(&field[..end]).into_owned()))
}

pub(crate) fn truncate_utf8(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Server side: echoes each message back as a reply.
#[derive(Debug, Default)]
pub struct ChatEchoHandler;

impl PacketHandler for ChatEchoHandler {
    fn on_recv_packet(&self, session: &Arc<Session>, cx: &mut SendContext, packet: &[u8]) {
        let message = match decode_chat(packet) {
            Ok((CHAT_MESSAGE, message)) => message,
            Ok((id, _)) => {
                debug!(session = session.id(), id, "Ignoring chat frame");
                return;
            }
            Err(e) => {
                warn!(session = session.id(), error = %e, "Malformed chat frame");
                session.disconnect("malformed chat frame");
                return;
            }
        };

        info!(session = session.id(), message = %message, "Chat message");
        match encode_chat(cx, CHAT_REPLY, &format!("echo: {message}")) {
            Some(reply) => session.send(reply),
            None => warn!(session = session.id(), "No send buffer for chat reply"),
        }
    }
}

/// Client side: sends a greeting on connect and reports replies.
pub struct ChatClientHandler {
    greeting: String,
    replies: Option<mpsc::UnboundedSender<String>>,
}

impl ChatClientHandler {
    pub fn new(greeting: impl Into<String>) -> Self {
        Self {
            greeting: greeting.into(),
            replies: None,
        }
    }

    /// Forward every reply text to `replies`.
    pub fn with_replies(mut self, replies: mpsc::UnboundedSender<String>) -> Self {
        self.replies = Some(replies);
        self
    }
}

impl PacketHandler for ChatClientHandler {
    fn on_connected(&self, session: &Arc<Session>, cx: &mut SendContext) {
        if let Some(greeting) = encode_chat(cx, CHAT_MESSAGE, &self.greeting) {
            session.send(greeting);
        }
    }

    fn on_recv_packet(&self, session: &Arc<Session>, _cx: &mut SendContext, packet: &[u8]) {
        match decode_chat(packet) {
            Ok((CHAT_REPLY, reply)) => {
                info!(session = session.id(), reply = %reply, "Chat reply");
                if let Some(replies) = &self.replies {
                    let _ = replies.send(reply);
                }
            }
            Ok((id, _)) => debug!(session = session.id(), id, "Ignoring chat frame"),
            Err(e) => {
                warn!(session = session.id(), error = %e, "Malformed chat frame");
                session.disconnect("malformed chat frame");
            }
        }
    }

    fn on_connect_failed(&self, session: &Arc<Session>, error: &std::io::Error) {
        warn!(session = session.id(), error = %error, "Chat client could not connect");
    }
}
