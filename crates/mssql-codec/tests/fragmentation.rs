//! Framing must be exact across arbitrary transport fragmentation.
//!
//! A TDS response stream re-chunked at any boundaries (including splits
//! inside a packet header) must decode to the identical packet sequence.

#![allow(clippy::unwrap_used)]

use bytes::{BufMut, BytesMut};
use mssql_codec::{Packet, TdsCodec};
use proptest::prelude::*;
use tds_protocol::packet::{PACKET_HEADER_SIZE, PacketHeader, PacketStatus, PacketType};
use tokio_util::codec::Decoder;

/// Build a multi-packet response stream totalling roughly 10 KiB.
fn build_stream(payload_sizes: &[usize]) -> BytesMut {
    let mut raw = BytesMut::new();
    let last = payload_sizes.len() - 1;
    for (i, &size) in payload_sizes.iter().enumerate() {
        let status = if i == last {
            PacketStatus::END_OF_MESSAGE
        } else {
            PacketStatus::BATCH
        };
        let mut header = PacketHeader::new(
            PacketType::TabularResult,
            status,
            (PACKET_HEADER_SIZE + size) as u16,
        );
        header.packet_id = (i % 255) as u8 + 1;
        header.encode(&mut raw);
        for j in 0..size {
            raw.put_u8((i + j) as u8);
        }
    }
    raw
}

/// Decode a byte stream delivered in the given chunk sizes.
fn decode_chunked(raw: &[u8], chunk_sizes: &[usize]) -> Vec<Packet> {
    let mut codec = TdsCodec::new();
    let mut buffer = BytesMut::new();
    let mut packets = Vec::new();
    let mut offset = 0;
    let mut chunks = chunk_sizes.iter().cycle();

    while offset < raw.len() {
        let take = (*chunks.next().unwrap()).min(raw.len() - offset);
        buffer.extend_from_slice(&raw[offset..offset + take]);
        offset += take;

        while let Some(packet) = codec.decode(&mut buffer).unwrap() {
            packets.push(packet);
        }
    }
    packets
}

fn assert_same_packets(a: &[Packet], b: &[Packet]) {
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(b) {
        assert_eq!(x.header, y.header);
        assert_eq!(&x.payload[..], &y.payload[..]);
    }
}

#[test]
fn ten_kib_response_survives_fixed_chunk_grid() {
    // Three full packets and a short tail, ~10 KiB total.
    let raw = build_stream(&[4088, 4088, 2000, 123]);
    let undivided = decode_chunked(&raw, &[raw.len()]);
    assert_eq!(undivided.len(), 4);

    for &chunk in &[1usize, 2, 3, 7, 8, 9, 4096] {
        let fragmented = decode_chunked(&raw, &[chunk]);
        assert_same_packets(&undivided, &fragmented);
    }
}

proptest! {
    #[test]
    fn decoding_is_fragmentation_invariant(
        payload_sizes in proptest::collection::vec(1usize..2048, 1..6),
        chunk_pattern in proptest::collection::vec(
            proptest::sample::select(&[1usize, 2, 3, 7, 8, 9, 4096][..]),
            1..5,
        ),
    ) {
        let raw = build_stream(&payload_sizes);
        let undivided = decode_chunked(&raw, &[raw.len()]);
        let fragmented = decode_chunked(&raw, &chunk_pattern);

        prop_assert_eq!(undivided.len(), payload_sizes.len());
        assert_same_packets(&undivided, &fragmented);
    }
}
