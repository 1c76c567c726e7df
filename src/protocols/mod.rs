//! Application packet handlers.
//!
//! Thin protocols built on [`crate::runtime::PacketHandler`].
//!
//! ## Packet Ids
//! - `chat`: 1 message, 2 reply
//! - `stress`: 10 start, 11 data, 12 result
//! - file transfer (see [`crate::transfer`]): 100..=104

pub mod chat;
pub mod stress;
pub mod server;

pub use server::ServerHandler;
