//! Frames split arbitrarily across reads decode exactly as if they
//! had arrived in one piece.

use flatdb_core::protocol::{Operation, Request};
use flatdb_core::PartitionId;
use flatdb_net::{BufferPool, Reassembly};
use proptest::prelude::*;

fn request() -> impl Strategy<Value = Request> {
    (
        any::<i32>(),
        prop_oneof![Just(Operation::Read), Just(Operation::Write)],
        any::<i32>(),
        proptest::collection::vec(any::<u8>(), 0..64),
    )
        .prop_map(|(id, op, partition, body)| Request::new(id, op, PartitionId(partition), body))
}

/// Feed `wire` to a fresh reassembly in pieces ending at `cuts`.
fn decode_in_pieces(wire: &[u8], cuts: &[usize], buffer_size: usize) -> (Vec<Request>, BufferPool) {
    let mut pool = BufferPool::new(buffer_size, 64);
    let mut r = Reassembly::new();
    let mut out = Vec::new();
    let mut start = 0;
    for &end in cuts.iter().chain(std::iter::once(&wire.len())) {
        let end = end.clamp(start, wire.len());
        r.extend_from_slice(&wire[start..end], &mut pool);
        while let Some(req) = r.next_frame(&mut pool, 1 << 16).unwrap() {
            out.push(req);
        }
        start = end;
    }
    assert!(!r.is_pending());
    (out, pool)
}

proptest! {
    #[test]
    fn prop_split_pipeline_matches_contiguous(
        reqs in proptest::collection::vec(request(), 1..6),
        cuts in proptest::collection::vec(0usize..512, 0..12),
        buffer_size in 1usize..24,
    ) {
        let mut wire = Vec::new();
        for req in &reqs {
            req.encode_into(&mut wire);
        }
        let mut cuts = cuts;
        cuts.sort_unstable();
        let (decoded, pool) = decode_in_pieces(&wire, &cuts, buffer_size);
        prop_assert_eq!(decoded, reqs);
        prop_assert_eq!(pool.in_use(), 0);
    }
}

#[test]
fn test_every_header_offset_every_buffer_size() {
    let req = Request::new(-1, Operation::Write, PartitionId(i32::MAX), b"xyz".to_vec());
    let wire = req.encode();
    // Size prefix plus fixed header: 13 bytes, every cut inside them.
    for cut in 0..=13 {
        for buffer_size in 1..=16 {
            let (decoded, _) = decode_in_pieces(&wire, &[cut], buffer_size);
            assert_eq!(decoded, vec![req.clone()], "cut={cut} buffer={buffer_size}");
        }
    }
}
