//! Property-based tests using proptest
//!
//! These tests check the framing invariants across randomly generated
//! payloads, chunk sizes and read boundaries.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bytes::Bytes;
use packet_channel::core::{fixed_sizer, Frame, FrameHeader, Message, Packetizer};
use proptest::prelude::*;

fn wire_bytes(packetizer: &Packetizer, payload: &[u8]) -> Vec<u8> {
    packetizer
        .pack(Bytes::copy_from_slice(payload))
        .flat_map(|frame| frame.to_bytes().to_vec())
        .collect()
}

// Property: any payload survives packing and reassembly under any read slicing
proptest! {
    #[test]
    fn prop_roundtrip_any_slicing(
        payload in prop::collection::vec(any::<u8>(), 1..6000),
        chunk in 1usize..700,
        cuts in prop::collection::vec(1usize..97, 1..64),
    ) {
        let packetizer = Packetizer::new().with_chunk_sizer(fixed_sizer(chunk));
        let wire = wire_bytes(&packetizer, &payload);

        let mut reassembler = packetizer.reassembler();
        let mut out: Vec<Message> = Vec::new();
        let mut offset = 0;
        let mut cut = cuts.iter().cycle();
        while offset < wire.len() {
            let end = (offset + *cut.next().unwrap()).min(wire.len());
            reassembler.feed(&wire[offset..end], &mut out).unwrap();
            if end < wire.len() {
                prop_assert!(out.is_empty(), "message emitted before its last byte");
            }
            offset = end;
        }

        prop_assert_eq!(out.len(), 1);
        prop_assert_eq!(out[0].as_bytes().unwrap().as_ref(), &payload[..]);
        prop_assert_eq!(reassembler.entries_created(), 1);
        prop_assert_eq!(reassembler.entries_finalized(), 1);
        prop_assert_eq!(reassembler.pending_entries(), 0);
        prop_assert!(!reassembler.is_mid_frame());
    }
}

// Property: frames carry the shared header fields and never exceed the chunk size
proptest! {
    #[test]
    fn prop_frames_respect_chunk_size(len in 0usize..20000, chunk in 1usize..4096) {
        let packetizer = Packetizer::new().with_chunk_sizer(fixed_sizer(chunk));
        let packed = packetizer.pack(Bytes::from(vec![0u8; len]));
        let sequence_id = packed.sequence_id();
        let frames: Vec<Frame> = packed.collect();

        let expected = if len == 0 { 1 } else { len.div_ceil(chunk) };
        prop_assert_eq!(frames.len(), expected);

        let mut content_total = 0u64;
        for frame in &frames {
            prop_assert_eq!(frame.header.sequence_id, sequence_id);
            prop_assert_eq!(frame.header.total_length, len as u64);
            prop_assert!(frame.header.content_length as usize <= chunk);
            content_total += u64::from(frame.header.content_length);
        }
        prop_assert_eq!(content_total, len as u64);
    }
}

// Property: the header layout is a bijection over its fields
proptest! {
    #[test]
    fn prop_header_bytes_roundtrip(sequence_id: u64, total_length: u64, content_length: u32) {
        let header = FrameHeader { sequence_id, total_length, content_length };
        prop_assert_eq!(FrameHeader::from_bytes(&header.to_bytes()), header);
    }
}

// Property: keep-alives interleaved anywhere between frames never change the result
proptest! {
    #[test]
    fn prop_keep_alives_are_transparent(
        payload in prop::collection::vec(any::<u8>(), 1..3000),
        chunk in 1usize..512,
        keep_alive_every in 1usize..5,
    ) {
        let packetizer = Packetizer::new().with_chunk_sizer(fixed_sizer(chunk));
        let mut wire = Vec::new();
        for (i, frame) in packetizer.pack(Bytes::copy_from_slice(&payload)).enumerate() {
            if i % keep_alive_every == 0 {
                wire.extend_from_slice(&packetizer.keep_alive().to_bytes());
            }
            wire.extend_from_slice(&frame.to_bytes());
        }

        let mut reassembler = packetizer.reassembler();
        let mut out = Vec::new();
        reassembler.feed(&wire, &mut out).unwrap();
        prop_assert_eq!(out.len(), 1);
        prop_assert_eq!(out[0].as_bytes().unwrap().as_ref(), &payload[..]);
        prop_assert!(reassembler.keep_alives() > 0);
    }
}
