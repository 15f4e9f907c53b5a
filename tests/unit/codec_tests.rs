//! Line framing of process stdout.

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use callwarden::process::codec::{EventLineCodec, MAX_LINE_BYTES};
use callwarden::AppError;

#[test]
fn complete_line_is_decoded_without_newline() {
    let mut codec = EventLineCodec::new();
    let mut buf = BytesMut::from("{\"type\":\"session\",\"session_id\":\"s1\"}\n");

    let line = codec.decode(&mut buf).expect("decode");
    assert_eq!(
        line,
        Some("{\"type\":\"session\",\"session_id\":\"s1\"}".to_owned())
    );
    assert!(buf.is_empty());
}

#[test]
fn batched_lines_are_decoded_in_order() {
    let mut codec = EventLineCodec::new();
    let mut buf = BytesMut::from("first\nsecond\nthird\n");

    let mut lines = Vec::new();
    while let Some(line) = codec.decode(&mut buf).expect("decode") {
        lines.push(line);
    }
    assert_eq!(lines, vec!["first", "second", "third"]);
}

#[test]
fn partial_line_carries_across_chunks() {
    let mut codec = EventLineCodec::new();
    let mut buf = BytesMut::from("{\"type\":\"mes");

    assert_eq!(codec.decode(&mut buf).expect("decode"), None);

    buf.extend_from_slice(b"sage\",\"text\":\"hi\"}\n");
    assert_eq!(
        codec.decode(&mut buf).expect("decode"),
        Some("{\"type\":\"message\",\"text\":\"hi\"}".to_owned())
    );
}

#[test]
fn unterminated_tail_is_flushed_at_eof() {
    let mut codec = EventLineCodec::new();
    let mut buf = BytesMut::from("done\ntrailing");

    assert_eq!(codec.decode(&mut buf).expect("decode"), Some("done".into()));
    assert_eq!(codec.decode(&mut buf).expect("decode"), None);
    assert_eq!(
        codec.decode_eof(&mut buf).expect("decode_eof"),
        Some("trailing".into())
    );
}

#[test]
fn crlf_line_endings_are_stripped() {
    let mut codec = EventLineCodec::new();
    let mut buf = BytesMut::from("line\r\n");
    assert_eq!(codec.decode(&mut buf).expect("decode"), Some("line".into()));
}

#[test]
fn overlong_line_is_rejected_then_skipped() {
    let mut codec = EventLineCodec::with_max_length(8);
    let mut buf = BytesMut::from("0123456789abcdef\nok\n");

    let err = codec.decode(&mut buf).expect_err("line too long");
    assert!(matches!(err, AppError::Io(ref msg) if msg.contains("line too long")));

    let mut next = None;
    for _ in 0..3 {
        if let Some(line) = codec.decode(&mut buf).expect("decode after discard") {
            next = Some(line);
            break;
        }
    }
    assert_eq!(next, Some("ok".into()));
}

#[test]
fn default_limit_is_one_mebibyte() {
    assert_eq!(MAX_LINE_BYTES, 1_048_576);
}
