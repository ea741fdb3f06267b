use super::*;

fn sample_request() -> Message {
    let mut headers = Headers::new();
    headers.insert("accept".to_owned(), "application/json".to_owned());
    Message::Request {
        id: 7,
        method: Some("POST".to_owned()),
        path: Some("/items".to_owned()),
        route: None,
        headers,
        payload: Some(serde_json::json!({
            "name": "widget",
            "tags": ["a", "b"],
            "nested": {"k": "v"},
            "nil": null
        })),
    }
}

#[test]
fn encode_decode_round_trip_preserves_request() {
    let message = sample_request();
    let frame = encode(&message);
    let decoded = decode(&frame).expect("decode should succeed");
    assert_eq!(decoded, message);
}

#[test]
fn encode_decode_round_trip_preserves_hello_both_directions() {
    let client_hello = Message::Hello {
        id: 1,
        version: Some(PROTOCOL_VERSION.to_owned()),
        socket: None,
        heartbeat: None,
    };
    let server_hello = Message::Hello {
        id: 1,
        version: None,
        socket: Some("1712000000000:42:00001".to_owned()),
        heartbeat: Some(Heartbeat { interval: 15_000, timeout: 5_000 }),
    };

    for message in [client_hello, server_hello] {
        let decoded = decode(&encode(&message)).expect("decode should succeed");
        assert_eq!(decoded, message);
    }
}

#[test]
fn encode_decode_round_trip_preserves_response() {
    let message = Message::response(
        7,
        200,
        Headers::new(),
        serde_json::json!({"rows": [{"id": 1.0}], "meta": {"next": null}}),
    );
    let decoded = decode(&encode(&message)).expect("decode should succeed");
    assert_eq!(decoded, message);
}

#[test]
fn response_uses_status_code_wire_casing() {
    let message = Message::error(Some(3), 404, "not found");
    let text = String::from_utf8(encode(&message)).expect("frame is UTF-8");
    assert!(text.contains("\"statusCode\":404"));
    assert!(!text.contains("status_code"));
}

#[test]
fn request_with_route_identifier_round_trips() {
    let message = Message::Request {
        id: 9,
        method: None,
        path: None,
        route: Some("items.list".to_owned()),
        headers: Headers::new(),
        payload: None,
    };
    let decoded = decode(&encode(&message)).expect("decode should succeed");
    assert_eq!(decoded, message);
}

#[test]
fn decode_rejects_short_frame() {
    let err = decode(b"{").expect_err("frame should be too short");
    assert!(matches!(err, CodecError::TooShort(1)));
}

#[test]
fn decode_rejects_invalid_json() {
    let err = decode(b"not json at all").expect_err("frame should fail");
    assert!(matches!(err, CodecError::Malformed(_)));
}

#[test]
fn decode_rejects_invalid_utf8() {
    let err = decode(&[0xff, 0xfe, 0x01]).expect_err("frame should fail");
    assert!(matches!(err, CodecError::NotUtf8(_)));
}

#[test]
fn decode_rejects_missing_type() {
    let err = decode(br#"{"id": 1}"#).expect_err("frame should fail");
    assert!(matches!(err, CodecError::MissingType));
}

#[test]
fn decode_surfaces_unknown_type_with_id() {
    let err = decode(br#"{"id": 12, "type": "subscription"}"#).expect_err("type is unknown");
    match err {
        CodecError::UnknownType { id, kind } => {
            assert_eq!(id, Some(12));
            assert_eq!(kind, "subscription");
        }
        other => panic!("expected UnknownType, got {other:?}"),
    }
}

#[test]
fn decode_rejects_structurally_invalid_known_type() {
    // `request` without an id is not a conforming encoding.
    let err = decode(br#"{"type": "request", "path": "/x"}"#).expect_err("id is required");
    assert!(matches!(err, CodecError::Malformed(_)));
}

#[test]
fn split_frame_passes_small_frames_through() {
    let frame = encode(&Message::Ping { id: 1 });
    let fragments = split_frame(frame.clone(), Some(1024));
    assert_eq!(fragments, vec![frame]);
}

#[test]
fn split_frame_with_chunking_disabled_passes_through() {
    let frame = vec![b'x'; 4096];
    let fragments = split_frame(frame.clone(), None);
    assert_eq!(fragments, vec![frame]);
}

#[test]
fn split_frame_marks_fragments() {
    let fragments = split_frame(vec![b'a'; 10], Some(4));
    assert_eq!(fragments.len(), 3);
    assert_eq!(fragments[0][0], CHUNK_MORE);
    assert_eq!(fragments[1][0], CHUNK_MORE);
    assert_eq!(fragments[2][0], CHUNK_FINAL);
    assert_eq!(fragments[0].len(), 5);
    assert_eq!(fragments[2].len(), 3);
}

#[test]
fn fragmented_frame_decodes_identically_to_whole_frame() {
    let message = sample_request();
    let frame = encode(&message);
    assert!(frame.len() > 16, "sample must exceed the chunk size");

    let mut reassembler = Reassembler::new(None);
    let mut complete = None;
    for fragment in split_frame(frame, Some(16)) {
        complete = reassembler.push(&fragment).expect("fragment should buffer");
    }

    let complete = complete.expect("final fragment completes the frame");
    assert_eq!(decode(&complete).expect("decode"), message);
}

#[test]
fn reassembler_passes_unfragmented_frames_through() {
    let mut reassembler = Reassembler::new(None);
    let frame = encode(&Message::Ping { id: 4 });
    let complete = reassembler
        .push(&frame)
        .expect("push should succeed")
        .expect("frame is already complete");
    assert_eq!(complete, frame);
}

#[test]
fn reassembler_rejects_complete_frame_mid_reassembly() {
    let mut reassembler = Reassembler::new(None);
    assert!(reassembler.push(b"+partial").expect("buffers").is_none());

    let err = reassembler.push(b"{\"id\":1}").expect_err("interleave is malformed");
    assert!(matches!(err, CodecError::InterruptedChunk));

    // The partial buffer is discarded, so a standalone frame works again.
    let frame = encode(&Message::Ping { id: 2 });
    let complete = reassembler.push(&frame).expect("push").expect("complete");
    assert_eq!(complete, frame);
}

#[test]
fn reassembler_enforces_payload_ceiling_on_standalone_frames() {
    let mut reassembler = Reassembler::new(Some(8));
    let err = reassembler.push(b"{\"id\":123456}").expect_err("frame exceeds ceiling");
    assert!(matches!(err, CodecError::PayloadTooLarge { max: 8, .. }));
}

#[test]
fn reassembler_enforces_payload_ceiling_across_fragments() {
    let mut reassembler = Reassembler::new(Some(8));
    assert!(reassembler.push(b"+12345").expect("first fragment fits").is_none());

    let err = reassembler.push(b"$67890").expect_err("total exceeds ceiling");
    assert!(matches!(err, CodecError::PayloadTooLarge { .. }));

    // The oversized partial is discarded with the error.
    assert!(matches!(
        reassembler.push(b"$ok"),
        Ok(Some(bytes)) if bytes == b"ok"
    ));
}

#[test]
fn reassembler_reset_discards_partial_state() {
    let mut reassembler = Reassembler::new(None);
    assert!(reassembler.push(b"+partial").expect("buffers").is_none());

    reassembler.reset();

    let complete = reassembler.push(b"$done").expect("push").expect("complete");
    assert_eq!(complete, b"done");
}

#[test]
fn message_id_helper_covers_all_variants() {
    assert_eq!(Message::Ping { id: 1 }.id(), Some(1));
    assert_eq!(sample_request().id(), Some(7));
    assert_eq!(Message::error(None, 400, "bad").id(), None);
    assert_eq!(Message::error(Some(2), 400, "bad").id(), Some(2));
}

#[test]
fn error_response_carries_message_payload() {
    let Message::Response { status_code, payload, .. } = Message::error(Some(1), 429, "slow down")
    else {
        panic!("error builds a response");
    };
    assert_eq!(status_code, 429);
    assert_eq!(payload.get("message").and_then(serde_json::Value::as_str), Some("slow down"));
}
