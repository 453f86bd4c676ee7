//! Proxy <-> accelerator loopback envelope
//!
//! Eleven-byte prefix carried on every frame between the dispatch/slot
//! plane and the accelerator: packet type, client IPv4, client port,
//! and the (dispatch, slot) pair that owns the client. Ports and
//! indices are big-endian on the wire.

use setu_common::Address;

pub const ENVELOPE_BYTES: usize = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    pub packet_type: u8,
    /// Originating client; must be IPv4.
    pub client: Address,
    pub dispatch_index: u16,
    pub slot_index: u16,
}

impl Envelope {
    /// Serialize into `out[..ENVELOPE_BYTES]`. Returns false for a
    /// non-IPv4 client, which never happens on the data plane.
    pub fn write(&self, out: &mut [u8]) -> bool {
        let Address::Ipv4 { ip, port } = self.client else {
            return false;
        };
        out[0] = self.packet_type;
        out[1..5].copy_from_slice(&ip);
        out[5..7].copy_from_slice(&port.to_be_bytes());
        out[7..9].copy_from_slice(&self.dispatch_index.to_be_bytes());
        out[9..11].copy_from_slice(&self.slot_index.to_be_bytes());
        true
    }

    /// Parse the leading envelope of a frame.
    #[must_use]
    pub fn read(data: &[u8]) -> Option<Envelope> {
        if data.len() < ENVELOPE_BYTES {
            return None;
        }
        Some(Envelope {
            packet_type: data[0],
            client: Address::Ipv4 {
                ip: [data[1], data[2], data[3], data[4]],
                port: u16::from_be_bytes([data[5], data[6]]),
            },
            dispatch_index: u16::from_be_bytes([data[7], data[8]]),
            slot_index: u16::from_be_bytes([data[9], data[10]]),
        })
    }
}
