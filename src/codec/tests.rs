use super::*;

#[test]
fn test_encode_ping_without_body() {
    let frame = encode_event("ping", "").unwrap();
    assert_eq!(
        frame.as_ref(),
        &[0x04, b'p', b'i', b'n', b'g', 0x00, 0x00, 0x00, 0x00]
    );

    let decoded = decode_event(&frame).unwrap();
    assert_eq!(decoded.event_name, "ping");
    assert_eq!(decoded.body, "");
}

#[test]
fn test_event_roundtrip_with_json_body() {
    let body = r#"{"order":"A-17","qty":3}"#;
    let frame = encode_event("order.created", body).unwrap();
    let decoded = decode_event(&frame).unwrap();
    assert_eq!(
        decoded,
        EventFrame {
            event_name: "order.created".to_string(),
            body: body.to_string(),
        }
    );
}

#[test]
fn test_event_roundtrip_multibyte_utf8() {
    let frame = encode_event("问候", "你好").unwrap();
    // 6 name bytes, 6 body bytes
    assert_eq!(frame[0], 6);
    assert_eq!(&frame[7..11], &[0, 0, 0, 6]);

    let decoded = decode_event(&frame).unwrap();
    assert_eq!(decoded.event_name, "问候");
    assert_eq!(decoded.body, "你好");
}

#[test]
fn test_encode_event_name_at_limit() {
    let name = "n".repeat(MAX_EVENT_NAME_LEN);
    let frame = encode_event(&name, "{}").unwrap();
    assert_eq!(frame[0], 255);
    assert_eq!(decode_event(&frame).unwrap().event_name, name);
}

#[test]
fn test_encode_event_name_too_long() {
    let name = "n".repeat(MAX_EVENT_NAME_LEN + 1);
    assert_eq!(
        encode_event(&name, ""),
        Err(EncodeError::EventNameTooLong { len: 256 })
    );
}

#[test]
fn test_encode_event_name_limit_counts_bytes_not_chars() {
    // 86 three-byte characters = 258 bytes
    let name = "界".repeat(86);
    assert!(matches!(
        encode_event(&name, ""),
        Err(EncodeError::EventNameTooLong { len: 258 })
    ));
}

#[test]
fn test_body_length_is_big_endian() {
    let body = "x".repeat(0x0102);
    let frame = encode_event("e", &body).unwrap();
    assert_eq!(&frame[2..6], &[0x00, 0x00, 0x01, 0x02]);
}

#[test]
fn test_decode_event_too_short() {
    for len in 0..MIN_FRAME_LEN {
        let data = vec![0u8; len];
        assert_eq!(decode_event(&data), Err(FrameError::TooShort { len }));
    }
}

#[test]
fn test_decode_event_name_overrun() {
    let data = [0x09, b'a', b'b', b'c', b'd'];
    assert_eq!(
        decode_event(&data),
        Err(FrameError::NameOverrun {
            declared: 9,
            remaining: 4,
        })
    );
}

#[test]
fn test_decode_event_missing_body_length() {
    let data = [0x04, b'p', b'i', b'n', b'g', 0x00];
    assert_eq!(
        decode_event(&data),
        Err(FrameError::MissingBodyLength { remaining: 1 })
    );
}

#[test]
fn test_decode_event_body_overrun() {
    let data = [0x01, b'e', 0x00, 0x00, 0x00, 0x05, b'a', b'b'];
    assert_eq!(
        decode_event(&data),
        Err(FrameError::BodyOverrun {
            declared: 5,
            remaining: 2,
        })
    );
}

#[test]
fn test_decode_event_negative_body_length() {
    let data = [0x01, b'e', 0xFF, 0xFF, 0xFF, 0xFF];
    assert_eq!(
        decode_event(&data),
        Err(FrameError::NegativeLength { declared: -1 })
    );
}

#[test]
fn test_decode_event_rejects_trailing_bytes() {
    let mut data = encode_event("ping", "{}").unwrap().to_vec();
    data.extend_from_slice(&[0, 0, 0]);
    assert_eq!(
        decode_event(&data),
        Err(FrameError::TrailingBytes { count: 3 })
    );
}

#[test]
fn test_decode_event_invalid_utf8_name() {
    let data = [0x02, 0xC3, 0x28, 0x00, 0x00, 0x00, 0x00];
    assert_eq!(
        decode_event(&data),
        Err(FrameError::InvalidUtf8 {
            field: "event name"
        })
    );
}

#[test]
fn test_response_roundtrip_success_and_failure() {
    for (success, body) in [(true, "{\"ok\":1}"), (false, "boom"), (true, ""), (false, "")] {
        let frame = encode_response(success, body).unwrap();
        let decoded = decode_response(&frame).unwrap();
        assert_eq!(decoded.success, success);
        assert_eq!(decoded.body, body);
    }
}

#[test]
fn test_encode_response_layout() {
    let frame = encode_response(false, "no").unwrap();
    assert_eq!(frame.as_ref(), &[0x00, 0x00, 0x00, 0x00, 0x02, b'n', b'o']);
}

#[test]
fn test_decode_response_too_short() {
    assert_eq!(
        decode_response(&[1, 0, 0, 0]),
        Err(FrameError::TooShort { len: 4 })
    );
}

#[test]
fn test_decode_response_body_overrun() {
    let data = [0x01, 0x00, 0x00, 0x00, 0x10, b'x'];
    assert_eq!(
        decode_response(&data),
        Err(FrameError::BodyOverrun {
            declared: 16,
            remaining: 1,
        })
    );
}

#[test]
fn test_decode_response_unknown_flag_is_failure() {
    let data = [0x07, 0x00, 0x00, 0x00, 0x00];
    assert!(!decode_response(&data).unwrap().success);
}
