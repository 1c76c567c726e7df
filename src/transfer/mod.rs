//! Chunked file transfer over packet sessions.
//!
//! ## Flow
//!
//! ```text
//! sender                              receiver
//!   | -- request(100) ------------------> |  start_file_receive
//!   | <------------------ response(101) -- |
//!   | -- chunk(102) x N ----------------> |  process_file_chunk
//!   | <------------------ complete(103) -- |
//! ```
//!
//! Chunks are paced by a fixed delay on the sending side. There is no
//! retransmission or resume: a dropped connection abandons the transfer.

mod handler;
mod manager;
mod packets;

pub use handler::{FilePacketHandler, DEFAULT_RECEIVE_DIR};
pub use manager::{
    ChunkProgress, FileTransferManager, TransferCompleteCallback, TransferDirection,
    TransferProgress, DEFAULT_CHUNK_DELAY, DEFAULT_CHUNK_SIZE,
};
pub use packets::{
    decode_notice, encode_notice, FileChunk, FilePacketId, FileRequest, TransferId,
    CHUNK_HEADER_LEN, FILENAME_LEN, MAX_CHUNK_PAYLOAD,
};

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// File transfer errors.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{} is not a regular file", .0.display())]
    NotAFile(PathBuf),

    #[error("invalid file name {0:?}")]
    InvalidFileName(String),

    #[error("file of {size} bytes needs more than u32::MAX chunks")]
    FileTooLarge { size: u64 },

    #[error("invalid transfer request: {0}")]
    InvalidRequest(String),

    #[error("unknown transfer {0}")]
    UnknownTransfer(TransferId),

    #[error("transfer {0} is not in the expected direction")]
    WrongDirection(TransferId),

    #[error("chunk {chunk_id} of transfer {transfer_id} is outside the file")]
    ChunkOutOfRange {
        transfer_id: TransferId,
        chunk_id: u32,
    },

    #[error("no send buffer available")]
    SendBufferUnavailable,

    #[error("session closed during transfer {0}")]
    Disconnected(TransferId),
}

impl TransferError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
