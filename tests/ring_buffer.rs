use std::sync::Arc;
use std::thread;

use ringwatch::{BufferError, Frame, FrameShape, PixelDepth, RingFrameBuffer};

fn unit_shape() -> FrameShape {
    FrameShape::new(1, 1, 1, PixelDepth::U8)
}

fn contents(buffer: &RingFrameBuffer) -> Vec<u8> {
    buffer
        .get_range(..)
        .expect("range")
        .iter()
        .map(|frame| frame.as_bytes()[0])
        .collect()
}

#[test]
fn capacity_ten_keeps_last_ten_of_fourteen() {
    let buffer = RingFrameBuffer::new(10, unit_shape()).expect("buffer");
    for value in 0..=13u8 {
        buffer
            .append(&Frame::filled(unit_shape(), value).expect("frame"))
            .expect("append");
    }
    assert_eq!(contents(&buffer), vec![4, 5, 6, 7, 8, 9, 10, 11, 12, 13]);
    assert_eq!(buffer.sequence().expect("sequence"), 14);
    assert_eq!(buffer.get(0).expect("oldest").as_bytes(), &[4]);
    assert_eq!(buffer.get(-1).expect("newest").as_bytes(), &[13]);
    assert_eq!(buffer.pop_oldest().expect("pop").as_bytes(), &[4]);
    assert_eq!(buffer.pop_newest().expect("pop").as_bytes(), &[13]);
    assert_eq!(buffer.len().expect("len"), 8);
}

#[test]
fn empty_and_invalid_accesses_fail_cleanly() {
    let buffer = RingFrameBuffer::new(3, unit_shape()).expect("buffer");
    assert!(matches!(buffer.newest(), Err(BufferError::EmptyBuffer)));
    assert!(matches!(buffer.pop_oldest(), Err(BufferError::EmptyBuffer)));
    assert!(matches!(
        RingFrameBuffer::new(0, unit_shape()),
        Err(BufferError::ZeroCapacity)
    ));

    let wrong = Frame::filled(FrameShape::rgb8(2, 2), 1).expect("frame");
    assert!(matches!(
        buffer.append(&wrong),
        Err(BufferError::ShapeMismatch { .. })
    ));
    assert_eq!(buffer.len().expect("len"), 0);
}

#[test]
fn concurrent_readers_never_see_torn_frames() {
    let shape = FrameShape::rgb8(32, 24);
    let buffer = Arc::new(RingFrameBuffer::new(8, shape).expect("buffer"));

    let writer = {
        let buffer = buffer.clone();
        thread::spawn(move || {
            for i in 0..2000u32 {
                let frame = Frame::filled(shape, (i % 251) as u8).expect("frame");
                buffer.append(&frame).expect("append");
            }
        })
    };

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let buffer = buffer.clone();
            thread::spawn(move || {
                let mut last_sequence = 0;
                for _ in 0..2000 {
                    let sequence = buffer.sequence().expect("sequence");
                    assert!(sequence >= last_sequence);
                    last_sequence = sequence;
                    match buffer.newest() {
                        Ok(frame) => {
                            let bytes = frame.as_bytes();
                            assert_eq!(bytes.len(), shape.byte_len());
                            assert!(bytes.iter().all(|b| *b == bytes[0]), "torn frame");
                        }
                        Err(BufferError::EmptyBuffer) => {}
                        Err(err) => panic!("unexpected error {err}"),
                    }
                }
            })
        })
        .collect();

    writer.join().expect("writer");
    for reader in readers {
        reader.join().expect("reader");
    }
    assert_eq!(buffer.sequence().expect("sequence"), 2000);
    assert_eq!(buffer.len().expect("len"), 8);
}
