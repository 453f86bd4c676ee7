//! Chonkle and pittle generation
//!
//! The chonkle is a fixed bit-slicing of an FNV-1a 64 hash over
//! magic || from address data || to address data || packet length.
//! Address data is IP bytes followed by the port little-endian; the
//! length is hashed as four little-endian bytes. The pittle folds a
//! 16-bit byte sum of the same tuple minus the magic into two bytes.
//! The byte constants here are protocol-defined; the basic filter's
//! ranges are exactly the value ranges this slicing can produce.

use setu_common::address::MAX_ADDRESS_DATA_BYTES;
use setu_common::{Address, Fnv64};

pub const CHONKLE_BYTES: usize = 15;
pub const PITTLE_BYTES: usize = 2;

/// Write the 15-byte chonkle for a packet of `packet_length` bytes
/// sent `from` -> `to` under `magic`.
pub fn generate_chonkle(
    output: &mut [u8; CHONKLE_BYTES],
    magic: &[u8; 8],
    from: &Address,
    to: &Address,
    packet_length: u32,
) {
    let mut from_data = [0u8; MAX_ADDRESS_DATA_BYTES];
    let mut to_data = [0u8; MAX_ADDRESS_DATA_BYTES];
    let from_bytes = from.address_data(&mut from_data);
    let to_bytes = to.address_data(&mut to_data);

    let mut hasher = Fnv64::new();
    hasher.write(magic);
    hasher.write(&from_data[..from_bytes]);
    hasher.write(&to_data[..to_bytes]);
    hasher.write(&packet_length.to_le_bytes());
    let hash = hasher.finish().to_le_bytes();

    output[0] = ((hash[6] & 0xC0) >> 6) + 42;
    output[1] = (hash[3] & 0x1F) + 200;
    output[2] = ((hash[2] & 0xFC) >> 2) + 5;
    output[3] = hash[0];
    output[4] = (hash[2] & 0x03) + 78;
    output[5] = (hash[4] & 0x7F) + 96;
    output[6] = ((hash[1] & 0xFC) >> 2) + 100;
    output[7] = if hash[7] & 0x01 == 0 { 79 } else { 7 };
    output[8] = if hash[4] & 0x80 == 0 { 37 } else { 83 };
    output[9] = (hash[5] & 0x07) + 124;
    output[10] = ((hash[1] & 0xE0) >> 5) + 175;
    output[11] = (hash[6] & 0x3F) + 33;
    output[12] = match hash[1] & 0x03 {
        0 => 97,
        1 => 5,
        2 => 43,
        _ => 13,
    };
    output[13] = ((hash[5] & 0xF8) >> 3) + 210;
    output[14] = ((hash[7] & 0xFE) >> 1) + 17;
}

/// Write the 2-byte pittle for a packet of `packet_length` bytes sent
/// `from` -> `to`. The magic is deliberately absent; the chonkle binds
/// it.
pub fn generate_pittle(
    output: &mut [u8; PITTLE_BYTES],
    from: &Address,
    to: &Address,
    packet_length: u32,
) {
    let mut from_data = [0u8; MAX_ADDRESS_DATA_BYTES];
    let mut to_data = [0u8; MAX_ADDRESS_DATA_BYTES];
    let from_bytes = from.address_data(&mut from_data);
    let to_bytes = to.address_data(&mut to_data);

    let mut sum: u16 = 0;
    for &byte in &from_data[..from_bytes] {
        sum = sum.wrapping_add(u16::from(byte));
    }
    for &byte in &to_data[..to_bytes] {
        sum = sum.wrapping_add(u16::from(byte));
    }
    for byte in packet_length.to_le_bytes() {
        sum = sum.wrapping_add(u16::from(byte));
    }

    let sum_data = sum.to_le_bytes();
    output[0] = 1 | (sum_data[0] ^ sum_data[1] ^ 193);
    output[1] = 1 | ((255 - output[0]) ^ 113);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_endpoints() -> (Address, Address, [u8; 8]) {
        (
            Address::ipv4([127, 0, 0, 1], 55000),
            Address::ipv4([127, 0, 0, 1], 65000),
            [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88],
        )
    }

    #[test]
    fn chonkle_is_deterministic() {
        let (from, to, magic) = sample_endpoints();
        let mut a = [0u8; CHONKLE_BYTES];
        let mut b = [0u8; CHONKLE_BYTES];
        generate_chonkle(&mut a, &magic, &from, &to, 100);
        generate_chonkle(&mut b, &magic, &from, &to, 100);
        assert_eq!(a, b);
    }

    #[test]
    fn chonkle_depends_on_every_input() {
        let (from, to, magic) = sample_endpoints();
        let mut base = [0u8; CHONKLE_BYTES];
        generate_chonkle(&mut base, &magic, &from, &to, 100);

        let mut other = [0u8; CHONKLE_BYTES];
        let mut magic2 = magic;
        magic2[0] ^= 1;
        generate_chonkle(&mut other, &magic2, &from, &to, 100);
        assert_ne!(base, other);

        generate_chonkle(&mut other, &magic, &to, &from, 100);
        assert_ne!(base, other);

        generate_chonkle(&mut other, &magic, &from, &to, 101);
        assert_ne!(base, other);
    }

    #[test]
    fn chonkle_bytes_stay_in_protocol_ranges() {
        // exhaustively-ish: many tuples, every output byte must fall in
        // the range the basic filter accepts
        let (from, to, _) = sample_endpoints();
        for seed in 0u32..256 {
            let magic = u64::from(seed)
                .wrapping_mul(0x9E37_79B9_7F4A_7C15)
                .to_le_bytes();
            let mut out = [0u8; CHONKLE_BYTES];
            generate_chonkle(&mut out, &magic, &from, &to, 18 + seed);
            assert!((42..=45).contains(&out[0]));
            assert!((200..=231).contains(&out[1]));
            assert!((5..=68).contains(&out[2]));
            assert!((78..=81).contains(&out[4]));
            assert!((96..=223).contains(&out[5]));
            assert!((100..=163).contains(&out[6]));
            assert!(out[7] == 7 || out[7] == 79);
            assert!(out[8] == 37 || out[8] == 83);
            assert!((124..=131).contains(&out[9]));
            assert!((175..=182).contains(&out[10]));
            assert!((33..=96).contains(&out[11]));
            assert!([97, 5, 43, 13].contains(&out[12]));
            assert!((210..=241).contains(&out[13]));
            assert!((17..=144).contains(&out[14]));
        }
    }

    #[test]
    fn pittle_low_bits_are_set() {
        let (from, to, _) = sample_endpoints();
        for length in [18u32, 100, 1500] {
            let mut out = [0u8; PITTLE_BYTES];
            generate_pittle(&mut out, &from, &to, length);
            assert_eq!(out[0] & 1, 1);
            assert_eq!(out[1] & 1, 1);
        }
    }

    #[test]
    fn pittle_depends_on_length_and_endpoints() {
        // deltas of 1 only touch the masked low bit, so step by 2
        let (from, to, _) = sample_endpoints();
        let mut a = [0u8; PITTLE_BYTES];
        let mut b = [0u8; PITTLE_BYTES];
        generate_pittle(&mut a, &from, &to, 100);
        generate_pittle(&mut b, &from, &to, 102);
        assert_ne!(a, b);
        generate_pittle(&mut b, &Address::ipv4([10, 0, 0, 1], 55000), &to, 100);
        assert_ne!(a, b);
    }
}
