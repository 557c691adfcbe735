//! Nibble codec of the PSU serial dongle.
//!
//! Each 4-bit nibble travels as one byte whose bit pairs are `01` for a 0 bit
//! and `10` for a 1 bit. A frame is the command symbol, the data bytes as
//! low-nibble/high-nibble symbol pairs, and a `0x00` terminator.

use crate::error::{Error, Result};

/// Nibble → wire symbol.
pub const ENCODE_TABLE: [u8; 16] = [
    0x55, 0x56, 0x59, 0x5A, 0x65, 0x66, 0x69, 0x6A, 0x95, 0x96, 0x99, 0x9A, 0xA5, 0xA6, 0xA9, 0xAA,
];

/// Marks a byte that is not a valid symbol in [`DECODE_TABLE`].
pub const INVALID: u8 = 0xFF;

/// Wire symbol → nibble, [`INVALID`] for every other byte.
pub const DECODE_TABLE: [u8; 256] = build_decode_table();

/// End of a frame on the wire.
pub const TERMINATOR: u8 = 0x00;

const fn build_decode_table() -> [u8; 256] {
    let mut table = [INVALID; 256];
    let mut nibble = 0;
    while nibble < 16 {
        table[ENCODE_TABLE[nibble] as usize] = nibble as u8;
        nibble += 1;
    }
    table
}

/// Encode `command` (low nibble) and `data` into a terminated frame.
pub fn encode(command: u8, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + data.len() * 2);
    out.push(ENCODE_TABLE[(command & 0x0F) as usize]);
    for b in data {
        out.push(ENCODE_TABLE[(b & 0x0F) as usize]);
        out.push(ENCODE_TABLE[(b >> 4) as usize]);
    }
    out.push(TERMINATOR);
    out
}

fn nibble(symbol: u8) -> Result<u8> {
    match DECODE_TABLE[symbol as usize] {
        INVALID => Err(Error::Protocol(format!("invalid symbol 0x{symbol:02X}"))),
        n => Ok(n),
    }
}

/// Decode one frame, with or without its terminator, into
/// `(command, data)`.
pub fn decode(frame: &[u8]) -> Result<(u8, Vec<u8>)> {
    let body = match frame.split_last() {
        Some((&TERMINATOR, rest)) => rest,
        _ => frame,
    };
    let (&first, rest) = body
        .split_first()
        .ok_or_else(|| Error::Protocol("empty frame".into()))?;
    if rest.len() % 2 != 0 {
        return Err(Error::Protocol(format!("odd symbol count {}", rest.len())));
    }
    let command = nibble(first)?;
    let data = rest
        .chunks_exact(2)
        .map(|pair| Ok(nibble(pair[0])? | (nibble(pair[1])? << 4)))
        .collect::<Result<Vec<u8>>>()?;
    Ok((command, data))
}
