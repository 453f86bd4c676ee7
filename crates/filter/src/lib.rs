//! Setu Filter - packet classification and authentication
//!
//! Every non-passthrough datagram on the wire carries two small
//! checksums: a 15-byte chonkle at bytes 1..16 and a 2-byte pittle in
//! the last two bytes. Both are derived from the (from, to, length,
//! magic) tuple. The basic filter rejects on constant byte ranges
//! without any key material; the advanced filter recomputes both
//! checksums and compares.

pub mod chonkle;
pub mod filter;
pub mod types;

pub use chonkle::{generate_chonkle, generate_pittle, CHONKLE_BYTES, PITTLE_BYTES};
pub use filter::{
    advanced_packet_filter, basic_packet_filter, stamp_packet, MIN_FILTERED_PACKET_BYTES,
};
pub use types::packet_type;
