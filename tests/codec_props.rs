use meshfm::protocol_core::{encode_frame, prepare_upload_chunk, FrameDecoder, CHUNK_ESCAPE};
use proptest::prelude::*;

fn frames() -> impl Strategy<Value = Vec<(Vec<u8>, bool)>> {
    prop::collection::vec(
        (prop::collection::vec(any::<u8>(), 0..300), any::<bool>()),
        1..8,
    )
}

proptest! {
    #[test]
    fn decoder_output_is_independent_of_split_points(
        frames in frames(),
        cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..12),
    ) {
        let mut stream = Vec::new();
        for (payload, is_final) in &frames {
            stream.extend(encode_frame(payload, *is_final).unwrap());
        }

        let mut points: Vec<usize> = cuts.iter().map(|c| c.index(stream.len() + 1)).collect();
        points.push(0);
        points.push(stream.len());
        points.sort_unstable();
        points.dedup();

        let mut decoder = FrameDecoder::new();
        let mut out = Vec::new();
        for pair in points.windows(2) {
            decoder
                .push(&stream[pair[0]..pair[1]], |p, f| out.push((p.to_vec(), f)))
                .unwrap();
        }

        prop_assert_eq!(out, frames);
        prop_assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn escaped_chunks_never_start_like_control_traffic(chunk in prop::collection::vec(any::<u8>(), 1..64)) {
        let wire = prepare_upload_chunk(&chunk);
        if chunk[0] == CHUNK_ESCAPE || chunk[0] == b'{' {
            prop_assert_eq!(wire[0], CHUNK_ESCAPE);
            prop_assert_eq!(&wire[1..], &chunk[..]);
        } else {
            prop_assert_eq!(wire, chunk);
        }
    }
}
