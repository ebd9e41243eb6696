//! Byte templates for replies the gateway produces without a backend.

use bytes::{BufMut, BytesMut};

pub const NO_CONTENT: &[u8] = b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n";
pub const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n";
pub const SERVICE_UNAVAILABLE: &[u8] = b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\n\r\n";
pub const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\n\r\n";
pub const TOO_LARGE: &[u8] = b"HTTP/1.1 413 Request Entity Too Large\r\n\
Content-Type: text/plain; charset=UTF-8\r\n\
Content-Length: 50\r\n\
\r\n\
Request content exceeds the maximum supported size";

pub const PONG: &[u8] = b"HTTP/1.1 200 OK\r\n\
Content-Type: text/plain; charset=UTF-8\r\n\
Content-Length: 5\r\n\
\r\n\
Pong!";

/// Fast path for the 8-byte echo diagnostic; the body goes over the `@`s.
pub const ECHO_8: &[u8] = b"HTTP/1.1 200 OK\r\n\
Content-Type: text/plain\r\n\
Content-Length: 8\r\n\
\r\n\
@@@@@@@@";
pub const ECHO_8_BODY_AT: usize = ECHO_8.len() - 8;

/// Header with a fixed-width length slot. The template length never changes.
pub const ECHO_HEADER: &[u8] = b"HTTP/1.1 200 OK\r\n\
Content-Type: text/plain\r\n\
Content-Length: @@@@@@@@\r\n\
\r\n";
pub const STATS_HEADER: &[u8] = b"HTTP/1.1 200 OK\r\n\
Content-Type: application/json; charset=UTF-8\r\n\
Content-Length: @@@@@@@@\r\n\
\r\n";
pub const LENGTH_PLACEHOLDER: &[u8] = b"@@@@@@@@";
pub const LENGTH_WIDTH: usize = LENGTH_PLACEHOLDER.len();

/// Offset of the length placeholder inside `template`.
pub const fn placeholder_at(template: &[u8]) -> usize {
    let mut i = 0;
    while i + LENGTH_WIDTH <= template.len() {
        if template[i] == b'@' {
            return i;
        }
        i += 1;
    }
    panic!("template without length placeholder");
}

pub const ECHO_LENGTH_AT: usize = placeholder_at(ECHO_HEADER);
pub const STATS_LENGTH_AT: usize = placeholder_at(STATS_HEADER);

/// Writes `value` zero-padded into `slot`, exactly `slot.len()` digits.
/// Returns false if the value does not fit.
pub fn write_num_fixed(slot: &mut [u8], mut value: usize) -> bool {
    for digit in slot.iter_mut().rev() {
        *digit = b'0' + (value % 10) as u8;
        value /= 10;
    }
    value == 0
}

/// Appends `header` and `body`, filling the length slot at `length_at`.
/// Bodies too long for the slot get a 413 instead.
pub fn write_with_length(out: &mut BytesMut, header: &[u8], length_at: usize, body: &[u8]) {
    let start = out.len();
    out.reserve(header.len() + body.len());
    out.put_slice(header);
    if !write_num_fixed(&mut out[start + length_at..start + length_at + LENGTH_WIDTH], body.len()) {
        out.truncate(start);
        out.put_slice(TOO_LARGE);
        return;
    }
    out.put_slice(body);
}

pub fn write_echo(out: &mut BytesMut, body: &[u8]) {
    if body.len() == 8 {
        let start = out.len();
        out.put_slice(ECHO_8);
        out[start + ECHO_8_BODY_AT..start + ECHO_8.len()].copy_from_slice(body);
    } else {
        write_with_length(out, ECHO_HEADER, ECHO_LENGTH_AT, body);
    }
}
