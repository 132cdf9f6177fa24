//! Fuzz target for inbound transport decoding.
//!
//! Feeds arbitrary bytes to an unkeyed codec, split at a fuzzer-chosen
//! point, and decodes until the buffer runs dry. Looks for:
//! - Panics on hostile length fields
//! - Unbounded buffering
//! - Packets that decode differently depending on how bytes arrive
//!
//! Run with:
//! ```bash
//! cd crates/proto
//! cargo +nightly fuzz run transport_decode -- -max_total_time=300
//! ```

#![no_main]
use libfuzzer_sys::fuzz_target;
use tether_proto::ssh::transport::{Decoded, TransportCodec};

fn decode_all(chunks: &[&[u8]]) -> Vec<Vec<u8>> {
    let mut codec = TransportCodec::new();
    let mut packets = Vec::new();
    for chunk in chunks {
        codec.feed(chunk);
        loop {
            match codec.decode() {
                Ok(Decoded::Packet(payload)) => packets.push(payload),
                Ok(Decoded::Incomplete) => break,
                Err(_) => return packets,
            }
        }
    }
    packets
}

fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }
    let split = data[0] as usize % data.len();
    let body = &data[1..];
    let split = split.min(body.len());

    let whole = decode_all(&[body]);
    let pieces = decode_all(&[&body[..split], &body[split..]]);
    assert_eq!(whole, pieces);
});
