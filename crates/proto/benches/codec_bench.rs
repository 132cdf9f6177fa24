//! Transport codec benchmarks.
//!
//! Measures packet encode and decode throughput for each cipher suite and
//! the cost of a curve25519 key agreement.
//!
//! Run with: `cargo bench --bench codec_bench`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tether_proto::ssh::crypto::{CipherAlgorithm, DirectionKeys, MacAlgorithm};
use tether_proto::ssh::kex_dh::{KexMethod, KeyAgreement};
use tether_proto::ssh::transport::{Decoded, TransportCodec};
use zeroize::Zeroizing;

const PAYLOAD_SIZES: [usize; 3] = [64, 1024, 32 * 1024];

fn suites() -> Vec<(CipherAlgorithm, Option<MacAlgorithm>)> {
    vec![
        (CipherAlgorithm::ChaCha20Poly1305, None),
        (CipherAlgorithm::Aes256Gcm, None),
        (CipherAlgorithm::Aes128Ctr, Some(MacAlgorithm::HmacSha256)),
    ]
}

fn keys(cipher: CipherAlgorithm, mac: Option<MacAlgorithm>) -> DirectionKeys {
    DirectionKeys {
        cipher,
        mac,
        iv: Zeroizing::new(vec![0x11; cipher.iv_size()]),
        key: Zeroizing::new(vec![0x22; cipher.key_size()]),
        mac_key: Zeroizing::new(vec![0x33; mac.map_or(0, |m| m.key_size())]),
    }
}

/// Codec pair sharing one direction's keys.
fn codec_pair(cipher: CipherAlgorithm, mac: Option<MacAlgorithm>) -> (TransportCodec, TransportCodec) {
    let mut sender = TransportCodec::new();
    let mut receiver = TransportCodec::new();
    let k = keys(cipher, mac);
    sender.install_outbound(&k).expect("install outbound keys");
    receiver.install_inbound(&k).expect("install inbound keys");
    (sender, receiver)
}

/// Benchmark sealing payloads into packets.
fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec_encode");

    for (cipher, mac) in suites() {
        for size in PAYLOAD_SIZES {
            let (mut sender, _) = codec_pair(cipher, mac);
            let payload = vec![0xA5u8; size];
            group.throughput(Throughput::Bytes(size as u64));
            group.bench_with_input(BenchmarkId::new(cipher.name(), size), &payload, |b, payload| {
                b.iter(|| black_box(sender.encode(black_box(payload)).expect("encode")));
            });
        }
    }

    group.finish();
}

/// Benchmark opening packets back into payloads.
fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec_decode");

    for (cipher, mac) in suites() {
        for size in PAYLOAD_SIZES {
            let payload = vec![0x5Au8; size];
            group.throughput(Throughput::Bytes(size as u64));
            group.bench_function(BenchmarkId::new(cipher.name(), size), |b| {
                // Each packet is sealed at the receiver's next sequence number
                let (mut sender, mut receiver) = codec_pair(cipher, mac);
                b.iter(|| {
                    let wire = sender.encode(&payload).expect("encode");
                    receiver.feed(&wire);
                    match receiver.decode().expect("decode") {
                        Decoded::Packet(p) => black_box(p),
                        Decoded::Incomplete => panic!("incomplete packet"),
                    }
                });
            });
        }
    }

    group.finish();
}

/// Benchmark one curve25519 agreement, both sides.
fn bench_key_agreement(c: &mut Criterion) {
    c.bench_function("curve25519_agreement", |b| {
        b.iter(|| {
            let client = KeyAgreement::new(KexMethod::Curve25519Sha256).expect("client key");
            let server = KeyAgreement::new(KexMethod::Curve25519Sha256).expect("server key");
            let server_public = server.public_field();
            black_box(client.agree(&server_public).expect("shared secret"))
        });
    });
}

criterion_group!(benches, bench_encode, bench_decode, bench_key_agreement);
criterion_main!(benches);
