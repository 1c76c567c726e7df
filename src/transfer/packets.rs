//! File transfer frames.
//!
//! ```text
//! 100 request   [filename: 256][file_size: u64][chunks_total: u32]
//!               [chunk_size: u32][transfer_id: u32]
//! 101 response  [transfer_id: u32]
//! 102 chunk     [transfer_id: u32][chunk_id: u32][chunk_size: u32]
//!               [is_last: u8][payload: chunk_size]
//! 103 complete  [transfer_id: u32]
//! 104 error     [transfer_id: u32]
//! ```
//!
//! `transfer_id` is always the sender's id, so both peers can correlate
//! notices with their own bookkeeping.

use crate::protocols::chat::truncate_utf8;
use crate::runtime::{
    build_packet, packet_body, PacketError, SendBuffer, SendContext, PACKET_HEADER_SIZE,
    SEND_BUFFER_CHUNK_SIZE,
};
use bytes::{Buf, BufMut};

/// Transfer id assigned by the sending peer.
pub type TransferId = u32;

/// Frame ids of the file transfer protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum FilePacketId {
    Request = 100,
    Response = 101,
    Chunk = 102,
    Complete = 103,
    Error = 104,
}

impl FilePacketId {
    pub fn from_u16(id: u16) -> Option<Self> {
        match id {
            100 => Some(Self::Request),
            101 => Some(Self::Response),
            102 => Some(Self::Chunk),
            103 => Some(Self::Complete),
            104 => Some(Self::Error),
            _ => None,
        }
    }
}

/// Size of the NUL-padded file name field.
pub const FILENAME_LEN: usize = 256;

const REQUEST_BODY_LEN: usize = FILENAME_LEN + 8 + 4 + 4 + 4;
const NOTICE_BODY_LEN: usize = 4;

/// Chunk header bytes following the packet header.
pub const CHUNK_HEADER_LEN: usize = 4 + 4 + 4 + 1;

/// Largest payload that fits a chunk frame in one send buffer chunk.
pub const MAX_CHUNK_PAYLOAD: usize = SEND_BUFFER_CHUNK_SIZE - PACKET_HEADER_SIZE - CHUNK_HEADER_LEN;

/// Announces a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRequest {
    /// Bare file name; truncated to 255 bytes on the wire.
    pub filename: String,
    pub file_size: u64,
    pub chunks_total: u32,
    pub chunk_size: u32,
    pub transfer_id: TransferId,
}

impl FileRequest {
    pub fn encode(&self, cx: &mut SendContext) -> Option<SendBuffer> {
        let name = truncate_utf8(&self.filename, FILENAME_LEN - 1);
        build_packet(cx, FilePacketId::Request as u16, REQUEST_BODY_LEN, |body| {
            let (field, mut rest) = body.split_at_mut(FILENAME_LEN);
            field.fill(0);
            field[..name.len()].copy_from_slice(name.as_bytes());
            rest.put_u64_le(self.file_size);
            rest.put_u32_le(self.chunks_total);
            rest.put_u32_le(self.chunk_size);
            rest.put_u32_le(self.transfer_id);
        })
    }

    pub fn decode(packet: &[u8]) -> Result<Self, PacketError> {
        let (_, body) = packet_body(packet, REQUEST_BODY_LEN)?;
        let (field, mut rest) = body.split_at(FILENAME_LEN);
        let end = field.iter().position(|&b| b == 0).unwrap_or(FILENAME_LEN);

        Ok(Self {
            filename: String::from_utf8_lossy(&field[..end]).into_owned(),
            file_size: rest.get_u64_le(),
            chunks_total: rest.get_u32_le(),
            chunk_size: rest.get_u32_le(),
            transfer_id: rest.get_u32_le(),
        })
    }
}

/// Header of a data chunk frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileChunk {
    pub transfer_id: TransferId,
    pub chunk_id: u32,
    pub chunk_size: u32,
    pub is_last: bool,
}

impl FileChunk {
    /// Encode the header followed by `payload`.
    ///
    /// Returns `None` if the payload exceeds [`MAX_CHUNK_PAYLOAD`].
    pub fn encode(&self, cx: &mut SendContext, payload: &[u8]) -> Option<SendBuffer> {
        if payload.len() > MAX_CHUNK_PAYLOAD {
            return None;
        }
        build_packet(cx, FilePacketId::Chunk as u16, CHUNK_HEADER_LEN + payload.len(), |mut body| {
            body.put_u32_le(self.transfer_id);
            body.put_u32_le(self.chunk_id);
            body.put_u32_le(payload.len() as u32);
            body.put_u8(self.is_last as u8);
            body.copy_from_slice(payload);
        })
    }

    /// Decode a chunk frame into its header and payload.
    pub fn decode(packet: &[u8]) -> Result<(Self, &[u8]), PacketError> {
        let (header, mut body) = packet_body(packet, CHUNK_HEADER_LEN)?;
        let chunk = Self {
            transfer_id: body.get_u32_le(),
            chunk_id: body.get_u32_le(),
            chunk_size: body.get_u32_le(),
            is_last: body.get_u8() != 0,
        };

        let len = chunk.chunk_size as usize;
        if body.len() < len {
            return Err(PacketError::Truncated {
                id: header.id,
                needed: CHUNK_HEADER_LEN + len,
                available: CHUNK_HEADER_LEN + body.len(),
            });
        }
        Ok((chunk, &body[..len]))
    }
}

/// Encode a response, complete or error notice.
pub fn encode_notice(cx: &mut SendContext, id: FilePacketId, transfer_id: TransferId) -> Option<SendBuffer> {
    build_packet(cx, id as u16, NOTICE_BODY_LEN, |mut body| {
        body.put_u32_le(transfer_id);
    })
}

/// Decode the transfer id of a notice.
pub fn decode_notice(packet: &[u8]) -> Result<TransferId, PacketError> {
    let (_, mut body) = packet_body(packet, NOTICE_BODY_LEN)?;
    Ok(body.get_u32_le())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{PacketHeader, SendBufferManager};

    #[test]
    fn test_request_layout() {
        let manager = SendBufferManager::new();
        let mut cx = manager.context();

        let request = FileRequest {
            filename: "report.pdf".into(),
            file_size: 10_000,
            chunks_total: 3,
            chunk_size: 4096,
            transfer_id: 7,
        };
        let frame = request.encode(&mut cx).unwrap();
        assert_eq!(frame.len(), PACKET_HEADER_SIZE + 276);

        let header = PacketHeader::parse(frame.as_ref()).unwrap();
        assert_eq!(header.id, 100);
        assert_eq!(header.size as usize, frame.len());

        assert_eq!(FileRequest::decode(frame.as_ref()).unwrap(), request);
    }

    #[test]
    fn test_long_filename_truncated() {
        let manager = SendBufferManager::new();
        let mut cx = manager.context();

        let request = FileRequest {
            filename: "x".repeat(400),
            file_size: 0,
            chunks_total: 0,
            chunk_size: 4096,
            transfer_id: 1,
        };
        let frame = request.encode(&mut cx).unwrap();
        let decoded = FileRequest::decode(frame.as_ref()).unwrap();
        assert_eq!(decoded.filename.len(), FILENAME_LEN - 1);
    }

    #[test]
    fn test_chunk_payload_limits() {
        let manager = SendBufferManager::new();
        let mut cx = manager.context();
        let chunk = FileChunk {
            transfer_id: 3,
            chunk_id: 9,
            chunk_size: 0,
            is_last: true,
        };

        let payload = vec![0x42; MAX_CHUNK_PAYLOAD];
        let frame = chunk.encode(&mut cx, &payload).unwrap();
        assert_eq!(frame.len(), SEND_BUFFER_CHUNK_SIZE);

        let (decoded, body) = FileChunk::decode(frame.as_ref()).unwrap();
        assert_eq!(decoded.chunk_size as usize, MAX_CHUNK_PAYLOAD);
        assert_eq!(decoded.chunk_id, 9);
        assert!(decoded.is_last);
        assert_eq!(body, payload.as_slice());

        assert!(chunk.encode(&mut cx, &[0; MAX_CHUNK_PAYLOAD + 1]).is_none());
    }

    #[test]
    fn test_chunk_with_short_payload_rejected() {
        let manager = SendBufferManager::new();
        let mut cx = manager.context();
        let frame = FileChunk {
            transfer_id: 1,
            chunk_id: 0,
            chunk_size: 0,
            is_last: false,
        }
        .encode(&mut cx, b"abcd")
        .unwrap();

        // Drop the last payload byte but keep the declared size
        let mut bytes = frame.as_ref().to_vec();
        bytes.pop();
        bytes[0] -= 1;
        assert!(matches!(
            FileChunk::decode(&bytes),
            Err(PacketError::Truncated { id: 102, .. })
        ));
    }

    #[test]
    fn test_notice() {
        let manager = SendBufferManager::new();
        let mut cx = manager.context();

        let frame = encode_notice(&mut cx, FilePacketId::Error, 42).unwrap();
        assert_eq!(PacketHeader::parse(frame.as_ref()).unwrap().id, 104);
        assert_eq!(decode_notice(frame.as_ref()), Ok(42));
        assert_eq!(FilePacketId::from_u16(104), Some(FilePacketId::Error));
        assert_eq!(FilePacketId::from_u16(105), None);
    }
}
