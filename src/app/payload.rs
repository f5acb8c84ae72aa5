//! Periodic uplink payload
//!
//! Layout: a 4-byte ASCII header followed by the packet counter as a
//! big-endian `u32`.
//!
//!   'R' 'A' 'K' ' ' | counter (4, BE)

use bytes::{BufMut, BytesMut};

pub const HEADER: [u8; 4] = *b"RAK ";

pub const PAYLOAD_LEN: usize = HEADER.len() + 4;

/// Build the uplink payload for `counter`
pub fn counter_payload(counter: u32) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(PAYLOAD_LEN);
    buf.put_slice(&HEADER);
    buf.put_u32(counter);
    buf.to_vec()
}
