//! FNV-1a 64 hashing
//!
//! Used to bucket session-table keys and to pick the ingress socket for
//! return traffic. The address hash covers the 2 port bytes followed by
//! the 4 IPv4 bytes, matching the in-memory layout of the key tuple.

use crate::address::Address;

pub const FNV_OFFSET_BASIS: u64 = 0xCBF2_9CE4_8422_2325;
pub const FNV_PRIME: u64 = 0x0000_0100_0000_01B3;

/// Streaming FNV-1a 64 hasher.
#[derive(Debug, Clone, Copy)]
pub struct Fnv64(u64);

impl Fnv64 {
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Fnv64(FNV_OFFSET_BASIS)
    }

    #[inline]
    pub fn write(&mut self, data: &[u8]) {
        for &byte in data {
            self.0 ^= u64::from(byte);
            self.0 = self.0.wrapping_mul(FNV_PRIME);
        }
    }

    #[inline]
    #[must_use]
    pub const fn finish(self) -> u64 {
        self.0
    }
}

impl Default for Fnv64 {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot FNV-1a 64 over a byte slice.
#[inline]
#[must_use]
pub fn fnv1a(data: &[u8]) -> u64 {
    let mut hasher = Fnv64::new();
    hasher.write(data);
    hasher.finish()
}

/// Hash an address for session keying and return-path fan-in.
///
/// IPv4 only on the fast path: 2 port bytes (little-endian) then the 4
/// IP bytes. Other variants fall back to their full data bytes.
#[must_use]
pub fn hash_address(address: &Address) -> u64 {
    match address {
        Address::Ipv4 { ip, port } => {
            let mut hasher = Fnv64::new();
            hasher.write(&port.to_le_bytes());
            hasher.write(ip);
            hasher.finish()
        }
        _ => {
            let mut data = [0u8; crate::address::MAX_ADDRESS_DATA_BYTES];
            let len = address.address_data(&mut data);
            fnv1a(&data[..len])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vectors() {
        // standard FNV-1a 64 test vectors
        assert_eq!(fnv1a(b""), 0xCBF2_9CE4_8422_2325);
        assert_eq!(fnv1a(b"a"), 0xAF63_DC4C_8601_EC8C);
        assert_eq!(fnv1a(b"foobar"), 0x85944171F73967E8);
    }

    #[test]
    fn streaming_matches_one_shot() {
        let mut hasher = Fnv64::new();
        hasher.write(b"foo");
        hasher.write(b"bar");
        assert_eq!(hasher.finish(), fnv1a(b"foobar"));
    }

    #[test]
    fn address_hash_covers_port_then_ip() {
        let a = Address::ipv4([1, 2, 3, 4], 0x1234);
        assert_eq!(hash_address(&a), fnv1a(&[0x34, 0x12, 1, 2, 3, 4]));
    }

    #[test]
    fn distinct_ports_hash_differently() {
        let a = Address::ipv4([127, 0, 0, 1], 55001);
        let b = Address::ipv4([127, 0, 0, 1], 55002);
        assert_ne!(hash_address(&a), hash_address(&b));
    }
}
