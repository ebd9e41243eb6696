use bitflags::bitflags;

/// Size of the fixed header in front of every chunk payload.
pub const CHUNK_HEADER_LEN: usize = 48;
/// `next` value of the last chunk in a chain.
pub const LINK_TERMINATOR: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChunkOp {
    Empty = 0,
    HttpRequest = 1,
    HttpResponse = 2,
    WsFrame = 3,
    RawData = 4,
    /// The gateway dropped the socket; the backend should forget the session.
    Disconnect = 5,
    /// The backend wants the socket closed once the payload is sent.
    SendAndDisconnect = 6,
}

impl ChunkOp {
    fn from_u8(raw: u8) -> ChunkOp {
        match raw {
            1 => ChunkOp::HttpRequest,
            2 => ChunkOp::HttpResponse,
            3 => ChunkOp::WsFrame,
            4 => ChunkOp::RawData,
            5 => ChunkOp::Disconnect,
            6 => ChunkOp::SendAndDisconnect,
            _ => ChunkOp::Empty,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Direction {
    ToBackend = 0,
    FromBackend = 1,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ChunkFlags: u16 {
        const WEBSOCKET_UPGRADE = 0b0000_0001;
        const STREAMING = 0b0000_0010;
        const KEEP_ALIVE = 0b0000_0100;
        /// WebSocket payload is text rather than binary.
        const WS_TEXT = 0b0000_1000;
    }
}

/// Typed view over the first `CHUNK_HEADER_LEN` bytes of a chunk.
///
/// Layout (little-endian):
/// `op u8 | direction u8 | handler u16 | linked u32 | next u32 | len u32 |
///  salt u64 | slot u32 | total_len u32 | worker u8 | backend u8 | flags u16 |
///  port u16 | reserved u16 | stamp u64`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub op: ChunkOp,
    pub direction: Direction,
    pub handler: u16,
    /// Chunks following the head in this chain.
    pub linked: u32,
    pub next: u32,
    /// Payload bytes stored in this particular chunk.
    pub len: u32,
    pub salt: u64,
    pub slot: u32,
    /// Payload bytes across the whole chain.
    pub total_len: u32,
    pub worker: u8,
    pub backend: u8,
    pub flags: ChunkFlags,
    pub port: u16,
    pub stamp: u64,
}

impl Default for ChunkHeader {
    fn default() -> Self {
        ChunkHeader {
            op: ChunkOp::Empty,
            direction: Direction::ToBackend,
            handler: 0,
            linked: 0,
            next: LINK_TERMINATOR,
            len: 0,
            salt: 0,
            slot: 0,
            total_len: 0,
            worker: 0,
            backend: 0,
            flags: ChunkFlags::empty(),
            port: 0,
            stamp: 0,
        }
    }
}

#[inline(always)]
fn get_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

#[inline(always)]
fn get_u32(buf: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(raw)
}

#[inline(always)]
fn get_u64(buf: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(raw)
}

impl ChunkHeader {
    pub fn read_from(buf: &[u8]) -> ChunkHeader {
        assert!(buf.len() >= CHUNK_HEADER_LEN, "chunk shorter than its header");
        ChunkHeader {
            op: ChunkOp::from_u8(buf[0]),
            direction: if buf[1] == 1 {
                Direction::FromBackend
            } else {
                Direction::ToBackend
            },
            handler: get_u16(buf, 2),
            linked: get_u32(buf, 4),
            next: get_u32(buf, 8),
            len: get_u32(buf, 12),
            salt: get_u64(buf, 16),
            slot: get_u32(buf, 24),
            total_len: get_u32(buf, 28),
            worker: buf[32],
            backend: buf[33],
            flags: ChunkFlags::from_bits_truncate(get_u16(buf, 34)),
            port: get_u16(buf, 36),
            stamp: get_u64(buf, 40),
        }
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        assert!(buf.len() >= CHUNK_HEADER_LEN, "chunk shorter than its header");
        buf[0] = self.op as u8;
        buf[1] = self.direction as u8;
        buf[2..4].copy_from_slice(&self.handler.to_le_bytes());
        buf[4..8].copy_from_slice(&self.linked.to_le_bytes());
        buf[8..12].copy_from_slice(&self.next.to_le_bytes());
        buf[12..16].copy_from_slice(&self.len.to_le_bytes());
        buf[16..24].copy_from_slice(&self.salt.to_le_bytes());
        buf[24..28].copy_from_slice(&self.slot.to_le_bytes());
        buf[28..32].copy_from_slice(&self.total_len.to_le_bytes());
        buf[32] = self.worker;
        buf[33] = self.backend;
        buf[34..36].copy_from_slice(&self.flags.bits().to_le_bytes());
        buf[36..38].copy_from_slice(&self.port.to_le_bytes());
        buf[38..40].copy_from_slice(&[0, 0]);
        buf[40..48].copy_from_slice(&self.stamp.to_le_bytes());
    }
}
