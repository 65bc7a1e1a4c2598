//! Record header framing: the 8-byte FastCGI header, padding arithmetic,
//! and fragmentation of oversized payloads into consecutive same-type
//! records.
mod pairs;
mod protocol_status;
mod role;

pub use pairs::{decode_pairs, encode_pairs, DecodeError, MAX_KEYLEN, MAX_VALUELEN};
pub use protocol_status::ProtocolStatus;
pub use role::Role;

pub const VERSION_1: u8 = 1;
pub const HEADER_LEN: usize = 8;

pub const FCGI_BEGIN_REQUEST: u8 = 1;
pub const FCGI_ABORT_REQUEST: u8 = 2;
pub const FCGI_END_REQUEST: u8 = 3;
pub const FCGI_PARAMS: u8 = 4;
pub const FCGI_STDIN: u8 = 5;
pub const FCGI_STDOUT: u8 = 6;
pub const FCGI_STDERR: u8 = 7;
pub const FCGI_DATA: u8 = 8;
pub const FCGI_GET_VALUES: u8 = 9;
pub const FCGI_GET_VALUES_RESULT: u8 = 10;
pub const FCGI_UNKNOWN_TYPE: u8 = 11;

/// `FCGI_KEEP_CONN`: bit 0 of the flags byte carried in `BEGIN_REQUEST`.
pub const KEEP_CONN: u8 = 0x01;

/// A decoded 8-byte FastCGI record header.
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub version: u8,
    pub type_id: u8,
    pub request_id: u16,
    pub content_length: u16,
    pub padding_length: u8,
}

impl Header {
    pub fn decode(buf: [u8; HEADER_LEN]) -> Self {
        Header {
            version: buf[0],
            type_id: buf[1],
            request_id: u16::from_be_bytes([buf[2], buf[3]]),
            content_length: u16::from_be_bytes([buf[4], buf[5]]),
            padding_length: buf[6],
        }
    }
}

/// Padding needed to make `content_length + padding` a multiple of 8.
pub fn padding_for(content_length: u16) -> u8 {
    (8 - (content_length & 7) as u8) & 7
}

/// Encodes an 8-byte record header for `type_id`/`request_id` carrying
/// `content_length` bytes of payload. Returns the header bytes and the
/// padding length the caller must append after the payload.
pub fn encode_header(type_id: u8, request_id: u16, content_length: u16) -> ([u8; HEADER_LEN], u8) {
    let padding = padding_for(content_length);
    let [id_hi, id_lo] = request_id.to_be_bytes();
    let [len_hi, len_lo] = content_length.to_be_bytes();
    (
        [VERSION_1, type_id, id_hi, id_lo, len_hi, len_lo, padding, 0],
        padding,
    )
}

/// Encodes a single complete record (header + content + zero padding) for
/// a payload known to fit in one record (`payload.len() <= 65535`).
fn encode_one_record(type_id: u8, request_id: u16, payload: &[u8]) -> Vec<u8> {
    debug_assert!(payload.len() <= u16::MAX as usize);
    let (header, padding) = encode_header(type_id, request_id, payload.len() as u16);
    let mut record = Vec::with_capacity(HEADER_LEN + payload.len() + padding as usize);
    record.extend_from_slice(&header);
    record.extend_from_slice(payload);
    record.resize(record.len() + padding as usize, 0);
    record
}

/// Encodes `payload` as one or more consecutive `STDOUT`/`STDERR`/`DATA`
/// records of the same type and request id, splitting at 65535-byte
/// boundaries. An empty payload encodes as a single empty record -- the
/// embedder's explicit end-of-stream marker.
pub fn encode_stream(type_id: u8, request_id: u16, payload: &[u8]) -> Vec<u8> {
    if payload.is_empty() {
        return encode_one_record(type_id, request_id, &[]);
    }

    let mut out = Vec::with_capacity(payload.len() + payload.len() / 8 + HEADER_LEN);
    for chunk in payload.chunks(u16::MAX as usize) {
        out.extend_from_slice(&encode_one_record(type_id, request_id, chunk));
    }
    out
}

/// Encodes an `END_REQUEST` record: 8 bytes of content (`app_status` as a
/// big-endian i32, `protocol_status`, then 3 reserved zero bytes).
pub fn encode_end_request(
    request_id: u16,
    app_status: i32,
    protocol_status: ProtocolStatus,
) -> Vec<u8> {
    let mut content = [0u8; 8];
    content[..4].copy_from_slice(&app_status.to_be_bytes());
    content[4] = protocol_status.id();
    encode_one_record(FCGI_END_REQUEST, request_id, &content)
}

/// Encodes a `GET_VALUES_RESULT` record answering the subset of `asked`
/// variable names this core knows about.
pub fn encode_get_values_result(asked: &[Vec<u8>], max_conns: usize) -> Vec<u8> {
    let mut pairs = Vec::new();
    for name in asked {
        let value = match name.as_slice() {
            b"FCGI_MAX_CONNS" => Some(max_conns.to_string().into_bytes()),
            b"FCGI_MAX_REQS" => Some(max_conns.to_string().into_bytes()),
            b"FCGI_MPXS_CONNS" => Some(b"0".to_vec()),
            _ => None,
        };
        if let Some(value) = value {
            pairs.push((name.clone(), value));
        }
    }

    let mut payload = Vec::new();
    encode_pairs(&pairs, &mut payload);
    encode_one_record(FCGI_GET_VALUES_RESULT, 0, &payload)
}
