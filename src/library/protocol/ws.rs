use crate::library::{
    error::{GatewayError, GatewayResult},
    protocol::http::{HeaderField, HttpRequest},
};
use base64::{Engine, engine::general_purpose::STANDARD};
use bytes::{BufMut, BytesMut};
use sha1::{Digest, Sha1};

const WS_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const WS_VERSION: &[u8] = b"13";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    fn from_u8(raw: u8) -> GatewayResult<Opcode> {
        Ok(match raw {
            0x0 => Opcode::Continuation,
            0x1 => Opcode::Text,
            0x2 => Opcode::Binary,
            0x8 => Opcode::Close,
            0x9 => Opcode::Ping,
            0xA => Opcode::Pong,
            _ => return Err(GatewayError::MalformedWebSocket("reserved opcode")),
        })
    }

    #[inline(always)]
    pub fn is_control(self) -> bool {
        (self as u8) & 0x8 != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub fin: bool,
    pub opcode: Opcode,
    pub mask: Option<[u8; 4]>,
    pub header_len: usize,
    pub payload_len: usize,
}

impl FrameHeader {
    #[inline(always)]
    pub fn frame_len(&self) -> usize {
        self.header_len + self.payload_len
    }
}

/// Where a frame sits in a fragmented message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePart {
    Single,
    First,
    Continuation,
    Last,
}

/// `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(key: &[u8]) -> String {
    let mut sha = Sha1::new();
    sha.update(key);
    sha.update(WS_GUID);
    STANDARD.encode(sha.finalize())
}

/// Builds the `101` reply for an upgrade request found in `buf`.
pub fn upgrade_response(request: &HttpRequest, buf: &[u8], out: &mut BytesMut) -> GatewayResult<()> {
    let key = request
        .header_value(buf, HeaderField::WsKey)
        .filter(|k| !k.is_empty())
        .ok_or(GatewayError::MalformedWebSocket("missing Sec-WebSocket-Key"))?;
    match request.header_value(buf, HeaderField::WsVersion) {
        Some(WS_VERSION) => {}
        _ => return Err(GatewayError::WsUnsupportedVersion),
    }
    out.put_slice(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: ");
    out.put_slice(accept_key(key).as_bytes());
    out.put_slice(b"\r\n");
    if let Some(protocol) = request.header_value(buf, HeaderField::WsProtocol) {
        // Echo the first offered sub-protocol.
        let first = protocol.split(|b| *b == b',').next().unwrap_or(protocol);
        out.put_slice(b"Sec-WebSocket-Protocol: ");
        out.put_slice(first.trim_ascii());
        out.put_slice(b"\r\n");
    }
    out.put_slice(b"\r\n");
    Ok(())
}

/// Parses a frame header. `Ok(None)` means more bytes are needed.
pub fn parse_frame_header(buf: &[u8]) -> GatewayResult<Option<FrameHeader>> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let fin = buf[0] & 0x80 != 0;
    if buf[0] & 0x70 != 0 {
        return Err(GatewayError::MalformedWebSocket("reserved bits set"));
    }
    let opcode = Opcode::from_u8(buf[0] & 0x0F)?;
    let masked = buf[1] & 0x80 != 0;
    let (payload_len, mut at) = match buf[1] & 0x7F {
        126 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            (u16::from_be_bytes([buf[2], buf[3]]) as usize, 4)
        }
        127 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[2..10]);
            let len = u64::from_be_bytes(raw);
            if len >> 63 != 0 {
                return Err(GatewayError::MalformedWebSocket("64-bit length with high bit set"));
            }
            (usize::try_from(len).map_err(|_| GatewayError::PayloadTooLarge(usize::MAX))?, 10)
        }
        short => (short as usize, 2),
    };
    if opcode.is_control() && (payload_len > 125 || !fin) {
        return Err(GatewayError::MalformedWebSocket("bad control frame"));
    }
    let mask = if masked {
        if buf.len() < at + 4 {
            return Ok(None);
        }
        let key = [buf[at], buf[at + 1], buf[at + 2], buf[at + 3]];
        at += 4;
        Some(key)
    } else {
        None
    };
    Ok(Some(FrameHeader {
        fin,
        opcode,
        mask,
        header_len: at,
        payload_len,
    }))
}

/// XORs `payload` in place. `offset` is the position of `payload[0]`
/// within the frame payload, for unmasking in pieces.
pub fn apply_mask(payload: &mut [u8], key: [u8; 4], offset: usize) {
    for (i, b) in payload.iter_mut().enumerate() {
        *b ^= key[(offset + i) & 3];
    }
}

/// Writes an unmasked server frame.
pub fn write_frame(out: &mut BytesMut, opcode: Opcode, part: FramePart, payload: &[u8]) {
    let (fin, code) = match part {
        FramePart::Single => (true, opcode as u8),
        FramePart::First => (false, opcode as u8),
        FramePart::Continuation => (false, Opcode::Continuation as u8),
        FramePart::Last => (true, Opcode::Continuation as u8),
    };
    out.reserve(payload.len() + 10);
    let fin_bit: u8 = if fin { 0x80 } else { 0 };
    out.put_u8(fin_bit | code);
    match payload.len() {
        len if len < 126 => out.put_u8(len as u8),
        len if len <= u16::MAX as usize => {
            out.put_u8(126);
            out.put_u16(len as u16);
        }
        len => {
            out.put_u8(127);
            out.put_u64(len as u64);
        }
    }
    out.put_slice(payload);
}
