//! Payload codecs.  The format is picked once per connection, either from
//! the handshake's negotiated value or from explicit configuration.

use crate::envelope::Envelope;
use crate::ProtocolError;

/// One transport frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Text(_) => "text",
            Frame::Binary(_) => "binary",
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Frame::Text(t) => t.len(),
            Frame::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Serializes envelopes to frames and back.
pub trait Codec: Send + Sync + 'static {
    /// Format name as negotiated with the broker.
    fn format(&self) -> &'static str;
    fn encode(&self, envelope: &Envelope) -> Result<Frame, ProtocolError>;
    fn decode(&self, frame: &Frame) -> Result<Envelope, ProtocolError>;
}

/// Human-readable format; travels in text frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn format(&self) -> &'static str {
        "json"
    }

    fn encode(&self, envelope: &Envelope) -> Result<Frame, ProtocolError> {
        Ok(Frame::Text(serde_json::to_string(envelope)?))
    }

    fn decode(&self, frame: &Frame) -> Result<Envelope, ProtocolError> {
        match frame {
            Frame::Text(text) => Ok(serde_json::from_str(text)?),
            Frame::Binary(bytes) => Ok(serde_json::from_slice(bytes)?),
        }
    }
}

/// Compact binary map format; travels in binary frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct MsgPackCodec;

impl Codec for MsgPackCodec {
    fn format(&self) -> &'static str {
        "msgpack"
    }

    fn encode(&self, envelope: &Envelope) -> Result<Frame, ProtocolError> {
        Ok(Frame::Binary(rmp_serde::to_vec_named(envelope)?))
    }

    fn decode(&self, frame: &Frame) -> Result<Envelope, ProtocolError> {
        match frame {
            Frame::Binary(bytes) => Ok(rmp_serde::from_slice(bytes)?),
            Frame::Text(_) => Err(ProtocolError::FrameKind {
                codec: "msgpack",
                frame: "text",
            }),
        }
    }
}

/// Pick a codec by format name.  Returns `None` for formats this SDK does
/// not speak.
pub fn codec_for(format: &str) -> Option<Box<dyn Codec>> {
    match format.to_ascii_lowercase().as_str() {
        "json" => Some(Box::new(JsonCodec)),
        "msgpack" => Some(Box::new(MsgPackCodec)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{RawRequest, Response};
    use crate::variant::Variant;

    fn sample() -> Envelope {
        Envelope {
            msg: Some(4),
            ack: None,
            requests: Some(vec![RawRequest {
                rid: Some(1),
                method: Some("list".into()),
                path: Some("/".into()),
                ..Default::default()
            }]),
            responses: Some(vec![Response::subscription_updates(vec![Variant::List(vec![
                Variant::Int(1),
                Variant::Binary(vec![9, 8, 7]),
                Variant::from("2026-01-01T00:00:00.000+00:00"),
            ])])]),
        }
    }

    #[test]
    fn json_frames_are_text() {
        let frame = JsonCodec.encode(&sample()).unwrap();
        assert_eq!(frame.kind(), "text");
        assert_eq!(JsonCodec.decode(&frame).unwrap(), sample());
    }

    #[test]
    fn msgpack_frames_are_binary_maps() {
        let frame = MsgPackCodec.encode(&sample()).unwrap();
        let Frame::Binary(bytes) = &frame else {
            panic!("expected binary frame");
        };
        // fixmap with three entries (msg, requests, responses)
        assert_eq!(bytes[0], 0x83);
        assert_eq!(MsgPackCodec.decode(&frame).unwrap(), sample());
    }

    #[test]
    fn msgpack_rejects_text_frames() {
        let err = MsgPackCodec.decode(&Frame::Text("{}".into())).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameKind { .. }));
    }

    #[test]
    fn codec_lookup_by_name() {
        assert_eq!(codec_for("JSON").unwrap().format(), "json");
        assert_eq!(codec_for("msgpack").unwrap().format(), "msgpack");
        assert!(codec_for("xml").is_none());
    }
}
