//! DSA link protocol: wire envelope, request/response objects, value
//! variants, permissions, and the two payload codecs.
//!
//! A link talks to its broker over one duplex channel.  Every frame carries
//! one [`Envelope`]; the envelope batches `requests` (peer → this link's
//! responder) and `responses` (peer → this link's requester).

pub mod codec;
pub mod envelope;
pub mod permission;
pub mod variant;

pub use codec::{codec_for, Codec, Frame, JsonCodec, MsgPackCodec};
pub use envelope::{Envelope, RawRequest, Request, Response, StreamState, SubscribePath};
pub use permission::Permission;
pub use variant::Variant;

/// Protocol version advertised during the handshake.
pub const PROTOCOL_VERSION: &str = "1.1.2";

/// Payload formats this SDK can speak, in order of preference.
pub const SUPPORTED_FORMATS: [&str; 2] = ["msgpack", "json"];

/// Errors raised while decoding or dispatching protocol payloads.
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error("method {0} not implemented")]
    MethodNotImplemented(String),
    #[error("request is missing field `{0}`")]
    MissingField(&'static str),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("msgpack encode: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),
    #[error("msgpack decode: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),
    #[error("{codec} codec cannot decode a {frame} frame")]
    FrameKind {
        codec: &'static str,
        frame: &'static str,
    },
}
