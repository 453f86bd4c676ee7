//! Basic and advanced packet filters
//!
//! The basic filter is keyless: it checks that every chonkle byte sits
//! inside the range its bit-slicing can produce, so random noise and
//! reflection junk die before any hashing happens. Byte 4 carries a
//! raw hash byte and is not checked. The advanced filter recomputes
//! chonkle and pittle from the (from, to, length, magic) tuple and
//! compares against the bytes in the packet.

use crate::chonkle::{generate_chonkle, generate_pittle, CHONKLE_BYTES, PITTLE_BYTES};
use setu_common::Address;

/// Smallest non-passthrough packet: type + chonkle + pittle.
pub const MIN_FILTERED_PACKET_BYTES: usize = 1 + CHONKLE_BYTES + PITTLE_BYTES;

/// Keyless constant-range check over bytes 0..16.
#[must_use]
pub fn basic_packet_filter(data: &[u8]) -> bool {
    if data.is_empty() {
        return false;
    }

    if data[0] == 0 {
        return true;
    }

    if data.len() < MIN_FILTERED_PACKET_BYTES {
        return false;
    }

    if data[0] < 0x01 || data[0] > 0x63 {
        return false;
    }
    if data[1] < 0x2A || data[1] > 0x2D {
        return false;
    }
    if data[2] < 0xC8 || data[2] > 0xE7 {
        return false;
    }
    if data[3] < 0x05 || data[3] > 0x44 {
        return false;
    }
    if data[5] < 0x4E || data[5] > 0x51 {
        return false;
    }
    if data[6] < 0x60 || data[6] > 0xDF {
        return false;
    }
    if data[7] < 0x64 || data[7] > 0xA3 {
        return false;
    }
    if data[8] != 0x07 && data[8] != 0x4F {
        return false;
    }
    if data[9] != 0x25 && data[9] != 0x53 {
        return false;
    }
    if data[10] < 0x7C || data[10] > 0x83 {
        return false;
    }
    if data[11] < 0xAF || data[11] > 0xB6 {
        return false;
    }
    if data[12] < 0x21 || data[12] > 0x60 {
        return false;
    }
    if data[13] != 0x05 && data[13] != 0x0D && data[13] != 0x2B && data[13] != 0x61 {
        return false;
    }
    if data[14] < 0xD2 || data[14] > 0xF1 {
        return false;
    }
    if data[15] < 0x11 || data[15] > 0x90 {
        return false;
    }

    true
}

/// Recompute-and-compare check of the embedded chonkle and pittle.
#[must_use]
pub fn advanced_packet_filter(
    data: &[u8],
    magic: &[u8; 8],
    from: &Address,
    to: &Address,
) -> bool {
    if data.is_empty() {
        return false;
    }

    if data[0] == 0 {
        return true;
    }

    if data.len() < MIN_FILTERED_PACKET_BYTES {
        return false;
    }

    let packet_length = data.len() as u32;

    let mut chonkle = [0u8; CHONKLE_BYTES];
    generate_chonkle(&mut chonkle, magic, from, to, packet_length);
    if data[1..1 + CHONKLE_BYTES] != chonkle {
        return false;
    }

    let mut pittle = [0u8; PITTLE_BYTES];
    generate_pittle(&mut pittle, from, to, packet_length);
    if data[data.len() - PITTLE_BYTES..] != pittle {
        return false;
    }

    true
}

/// Stamp a non-passthrough packet in place so both filters accept it.
/// `data[0]` must already hold the packet type.
pub fn stamp_packet(data: &mut [u8], magic: &[u8; 8], from: &Address, to: &Address) {
    debug_assert!(data.len() >= MIN_FILTERED_PACKET_BYTES);
    debug_assert!(data[0] != 0);

    let packet_length = data.len() as u32;

    let mut chonkle = [0u8; CHONKLE_BYTES];
    generate_chonkle(&mut chonkle, magic, from, to, packet_length);
    data[1..1 + CHONKLE_BYTES].copy_from_slice(&chonkle);

    let mut pittle = [0u8; PITTLE_BYTES];
    generate_pittle(&mut pittle, from, to, packet_length);
    let len = data.len();
    data[len - PITTLE_BYTES..].copy_from_slice(&pittle);
}
