//! gRPC-Web text/proto framing for the NSFW-enablement endpoints (C4).
//!
//! Grounded on `app/services/reverse/utils/grpc.py`: each message is
//! `[1-byte flags][4-byte big-endian length][payload]`; the high bit of the
//! flag byte marks a trailer frame of `key: value` lines. `grpc-status`
//! carries the status code, mapped to a pseudo-HTTP status.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

const TRAILER_FLAG: u8 = 0x80;

/// Decoded gRPC status from a trailer frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrpcStatus {
    pub code: u32,
    pub message: Option<String>,
}

impl GrpcStatus {
    pub fn ok(&self) -> bool {
        self.code == 0
    }

    /// Maps the gRPC status code to a pseudo-HTTP status per spec.md §4.4.
    pub fn http_equiv(&self) -> u16 {
        match self.code {
            0 => 200,
            16 => 401,
            7 => 403,
            8 => 429,
            4 => 504,
            14 => 503,
            _ => 502,
        }
    }
}

/// Encodes one gRPC-Web data frame around `payload`.
pub fn encode_payload(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + payload.len());
    buf.put_u8(0);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// One decoded frame: either a data payload or a trailer block.
#[derive(Debug, Clone)]
pub enum GrpcFrame {
    Data(Bytes),
    Trailer(HashMap<String, String>),
}

fn parse_trailer_block(block: &[u8]) -> HashMap<String, String> {
    let text = String::from_utf8_lossy(block);
    let mut trailers = HashMap::new();
    for line in text.split("\r\n") {
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim().to_ascii_lowercase();
            let mut value = value.trim().to_string();
            if key == "grpc-message" {
                value = percent_decode(&value);
            }
            trailers.insert(key, value);
        }
    }
    trailers
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(value) = u8::from_str_radix(&input[i + 1..i + 3], 16) {
                out.push(value);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Parses a full gRPC-Web body (one or more concatenated frames) into a
/// frame sequence, then reduces it to a single [`GrpcStatus`]. Frames with
/// the compressed flag bit (0x01) set are not supported and surface as an
/// internal error, matching the original's behavior (no compression is used
/// by the upstream's NSFW endpoints).
pub fn parse_response(mut body: Bytes) -> anyhow::Result<(Vec<GrpcFrame>, GrpcStatus)> {
    let mut frames = Vec::new();
    let mut status = GrpcStatus {
        code: 0,
        message: None,
    };

    while body.len() >= 5 {
        let flags = body[0];
        let len = u32::from_be_bytes([body[1], body[2], body[3], body[4]]) as usize;
        if body.len() < 5 + len {
            anyhow::bail!("truncated gRPC-Web frame: need {len} bytes, have {}", body.len() - 5);
        }
        if flags & 0x01 != 0 {
            anyhow::bail!("compressed gRPC-Web frames are not supported");
        }
        body.advance(5);
        let payload = body.split_to(len);

        if flags & TRAILER_FLAG != 0 {
            let trailers = parse_trailer_block(&payload);
            if let Some(code) = trailers.get("grpc-status").and_then(|v| v.parse::<u32>().ok()) {
                status.code = code;
            }
            status.message = trailers.get("grpc-message").cloned();
            frames.push(GrpcFrame::Trailer(trailers));
        } else {
            frames.push(GrpcFrame::Data(payload));
        }
    }

    Ok((frames, status))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trips_arbitrary_payload() {
        let payload = b"hello world, this is a proto-shaped blob".to_vec();
        let encoded = encode_payload(&payload);
        let (frames, status) = parse_response(encoded).unwrap();
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            GrpcFrame::Data(data) => assert_eq!(data.as_ref(), payload.as_slice()),
            GrpcFrame::Trailer(_) => panic!("expected data frame"),
        }
        assert!(status.ok());
    }

    #[test]
    fn trailer_frame_maps_status_codes() {
        let trailer = b"grpc-status: 8\r\ngrpc-message: quota%20exceeded\r\n";
        let mut buf = BytesMut::new();
        buf.put_u8(TRAILER_FLAG);
        buf.put_u32(trailer.len() as u32);
        buf.put_slice(trailer);

        let (frames, status) = parse_response(buf.freeze()).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(status.code, 8);
        assert_eq!(status.http_equiv(), 429);
        assert_eq!(status.message.as_deref(), Some("quota exceeded"));
    }

    #[test]
    fn status_mapping_covers_all_named_codes() {
        let cases = [(0, 200), (16, 401), (7, 403), (8, 429), (4, 504), (14, 503), (2, 502)];
        for (code, expected) in cases {
            let status = GrpcStatus { code, message: None };
            assert_eq!(status.http_equiv(), expected);
        }
    }
}
