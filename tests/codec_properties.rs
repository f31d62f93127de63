//! Codec behaviour over randomized frames and chunkings

use bytes::{Bytes, BytesMut};
use harpcom_core::core::protocol::{decode, encode, DEVICE_PORT};
use harpcom_core::{DataType, DecodeError, Frame, HarpCodec, HarpTimestamp, MessageType};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::codec::Decoder;

const MESSAGE_TYPES: [MessageType; 5] = [
    MessageType::Read,
    MessageType::Write,
    MessageType::Event,
    MessageType::ReadError,
    MessageType::WriteError,
];

fn random_frame(rng: &mut StdRng) -> Frame {
    let data_type = DataType::all()[rng.gen_range(0..DataType::all().len())];
    let count = rng.gen_range(0..8);
    let payload: Vec<u8> = (0..count * data_type.size()).map(|_| rng.gen()).collect();
    let frame = Frame::new(
        MESSAGE_TYPES[rng.gen_range(0..MESSAGE_TYPES.len())],
        rng.gen(),
        DEVICE_PORT,
        data_type,
        Bytes::from(payload),
    );
    if rng.gen_bool(0.5) {
        frame.timestamped(HarpTimestamp::new(rng.gen(), rng.gen_range(0..31_250)))
    } else {
        frame
    }
}

#[test]
fn every_frame_decodes_to_itself() {
    let mut rng = StdRng::seed_from_u64(1);
    for _ in 0..500 {
        let frame = random_frame(&mut rng);
        let bytes = encode(&frame).unwrap();
        let (decoded, used) = decode(&bytes).unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(decoded, frame);
    }
}

#[test]
fn flips_outside_length_are_checksum_failures() {
    let mut rng = StdRng::seed_from_u64(2);
    for _ in 0..200 {
        let frame = random_frame(&mut rng);
        let mut bytes = encode(&frame).unwrap();
        let index = match rng.gen_range(1..bytes.len()) {
            1 => 0,
            i => i,
        };
        bytes[index] ^= rng.gen_range(1..=u8::MAX);
        assert!(matches!(decode(&bytes), Err(DecodeError::Checksum { .. })));
    }
}

#[test]
fn arbitrary_chunking_preserves_order() {
    let mut rng = StdRng::seed_from_u64(3);
    let frames: Vec<Frame> = (0..100).map(|_| random_frame(&mut rng)).collect();
    let mut stream = Vec::new();
    for frame in &frames {
        stream.extend(encode(frame).unwrap());
    }

    let mut codec = HarpCodec::new();
    let mut buffer = BytesMut::new();
    let mut decoded = Vec::new();
    let mut rest = stream.as_slice();
    while !rest.is_empty() {
        let n = rng.gen_range(1..=rest.len().min(17));
        buffer.extend_from_slice(&rest[..n]);
        rest = &rest[n..];
        while let Some(frame) = codec.decode(&mut buffer).unwrap() {
            decoded.push(frame);
        }
    }

    assert_eq!(decoded, frames);
    assert_eq!(codec.discarded(), 0);
}

#[test]
fn junk_between_frames_is_skipped() {
    let mut rng = StdRng::seed_from_u64(4);
    let frames: Vec<Frame> = (0..20).map(|_| random_frame(&mut rng)).collect();
    let mut stream = Vec::new();
    for frame in &frames {
        // 0x00 is never a message type
        stream.extend(std::iter::repeat(0u8).take(rng.gen_range(1..4)));
        stream.extend(encode(frame).unwrap());
    }

    let mut codec = HarpCodec::new();
    let mut buffer = BytesMut::from(stream.as_slice());
    let mut decoded = Vec::new();
    let mut errors = 0;
    loop {
        match codec.decode(&mut buffer) {
            Ok(Some(frame)) => decoded.push(frame),
            Ok(None) => break,
            Err(_) => errors += 1,
        }
    }

    assert_eq!(decoded, frames);
    assert_eq!(errors, frames.len());
}
