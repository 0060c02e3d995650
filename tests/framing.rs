use qpio::message::{decode_all, decode_frame, encode_frame, Batcher, Frame, HEADER_LEN};

#[test]
fn trailing_partial_frame_is_not_consumed() {
    let mut buf = Vec::new();
    encode_frame(
        &mut buf,
        Frame {
            message_id: 1,
            message_type: 3,
            payload: b"complete",
        },
    );
    let partial_start = buf.len();
    encode_frame(
        &mut buf,
        Frame {
            message_id: 2,
            message_type: 3,
            payload: b"truncated-payload",
        },
    );
    buf.truncate(partial_start + HEADER_LEN + 3);

    let frames = decode_all(&buf);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].0, 1);
    assert_eq!(frames[0].2, b"complete");
}

#[test]
fn empty_payload_frame_roundtrips() {
    let mut buf = Vec::new();
    encode_frame(
        &mut buf,
        Frame {
            message_id: 99,
            message_type: 0,
            payload: b"",
        },
    );
    assert_eq!(buf.len(), HEADER_LEN);
    let (frame, consumed) = decode_frame(&buf).unwrap();
    assert_eq!(consumed, HEADER_LEN);
    assert!(frame.payload.is_empty());
}

#[test]
fn batcher_coalesces_small_writes_then_flush_drains_the_rest() {
    let mut batcher = Batcher::new(1024);
    for i in 0..5u64 {
        let payload = [i as u8; 2];
        assert!(batcher.push(Frame {
            message_id: i,
            message_type: 1,
            payload: &payload,
        })
        .is_none());
    }
    assert!(!batcher.is_empty());
    let batch = batcher.flush().expect("flush should return the coalesced batch");
    assert!(batcher.is_empty());

    let frames = decode_all(&batch);
    assert_eq!(frames.len(), 5);
    for (i, frame) in frames.iter().enumerate() {
        assert_eq!(frame.0, i as u64);
        assert_eq!(frame.2, vec![i as u8; 2]);
    }
}

#[test]
fn batch_exactly_at_capacity_does_not_trigger_early_flush() {
    let mut batcher = Batcher::new(HEADER_LEN * 2);
    assert!(batcher
        .push(Frame {
            message_id: 1,
            message_type: 1,
            payload: b"",
        })
        .is_none());
    assert!(batcher
        .push(Frame {
            message_id: 2,
            message_type: 1,
            payload: b"",
        })
        .is_none());
    let batch = batcher.flush().unwrap();
    assert_eq!(decode_all(&batch).len(), 2);
}
