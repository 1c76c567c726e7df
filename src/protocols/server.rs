//! Combined server handler.
//!
//! Routes each frame by packet id to chat, stress or file transfer.

use super::chat::{ChatEchoHandler, CHAT_MESSAGE, CHAT_REPLY};
use super::stress::{StressReceiver, STRESS_DATA, STRESS_RESULT, STRESS_START};
use crate::runtime::{PacketHandler, PacketHeader, SendContext, Session};
use crate::transfer::FilePacketHandler;
use std::sync::Arc;
use tracing::{debug, info};

pub struct ServerHandler {
    chat: ChatEchoHandler,
    stress: StressReceiver,
    files: FilePacketHandler,
}

impl ServerHandler {
    pub fn new(files: FilePacketHandler) -> Self {
        Self {
            chat: ChatEchoHandler,
            stress: StressReceiver::new(),
            files,
        }
    }

    pub fn files(&self) -> &FilePacketHandler {
        &self.files
    }
}

impl PacketHandler for ServerHandler {
    fn on_connected(&self, session: &Arc<Session>, _cx: &mut SendContext) {
        info!(session = session.id(), peer = ?session.peer_addr(), "Client connected");
    }

    fn on_recv_packet(&self, session: &Arc<Session>, cx: &mut SendContext, packet: &[u8]) {
        if self.files.handle_packet(session, cx, packet) {
            return;
        }

        let Some(header) = PacketHeader::parse(packet) else {
            return;
        };
        match header.id {
            CHAT_MESSAGE | CHAT_REPLY => self.chat.on_recv_packet(session, cx, packet),
            STRESS_START | STRESS_DATA | STRESS_RESULT => {
                self.stress.on_recv_packet(session, cx, packet)
            }
            id => debug!(session = session.id(), id, "Ignoring unknown packet id"),
        }
    }

    fn on_disconnected(&self, session: &Arc<Session>) {
        info!(session = session.id(), "Client disconnected");
        self.files.on_disconnected(session);
    }
}
