//! Envelope, request, and response objects.
//!
//! Requests arrive as loosely-typed [`RawRequest`] maps and are decoded once
//! into the closed [`Request`] enum.  Decoding happens per request so one
//! malformed entry never spoils the rest of its batch.

use serde::{Deserialize, Deserializer, Serialize};

use crate::variant::Variant;
use crate::ProtocolError;

/// One frame's worth of protocol traffic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sender-side message id; echoed back by the peer as `ack`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<Vec<RawRequest>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responses: Option<Vec<Response>>,
}

impl Envelope {
    /// `true` when the envelope carries no requests and no responses
    /// (a keepalive ping).
    pub fn is_empty(&self) -> bool {
        self.requests.as_ref().map_or(true, Vec::is_empty)
            && self.responses.as_ref().map_or(true, Vec::is_empty)
    }
}

/// A request as it appears on the wire.
///
/// Decoding never fails: an entry that is not a map, or a field of the
/// wrong type, reads as absent and is rejected later by
/// [`Request::try_from`] for that entry alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RawRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rid: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Variant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Variant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paths: Option<Vec<Variant>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sids: Option<Vec<Variant>>,
}

impl From<Variant> for RawRequest {
    fn from(value: Variant) -> Self {
        let Variant::Map(mut map) = value else {
            return Self::default();
        };
        let text = |v: Option<Variant>| match v {
            Some(Variant::String(s)) => Some(s),
            _ => None,
        };
        let list = |v: Option<Variant>| match v {
            Some(Variant::List(l)) => Some(l),
            _ => None,
        };
        Self {
            rid: map.swap_remove("rid").as_ref().and_then(Variant::as_i64),
            method: text(map.swap_remove("method")),
            path: text(map.swap_remove("path")),
            value: map.swap_remove("value"),
            permit: text(map.swap_remove("permit")),
            params: map.swap_remove("params"),
            paths: list(map.swap_remove("paths")),
            sids: list(map.swap_remove("sids")),
        }
    }
}

impl<'de> Deserialize<'de> for RawRequest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Variant::deserialize(deserializer).map(Self::from)
    }
}

/// One `{path, sid}` pair of a subscribe request.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribePath {
    pub path: String,
    pub sid: i64,
}

/// A decoded request.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    List {
        rid: i64,
        path: String,
    },
    Set {
        rid: i64,
        path: String,
        value: Variant,
        permit: Option<String>,
    },
    Remove {
        rid: i64,
        path: String,
    },
    Invoke {
        rid: i64,
        path: String,
        permit: Option<String>,
        params: Variant,
    },
    Subscribe {
        rid: i64,
        paths: Vec<SubscribePath>,
    },
    Unsubscribe {
        rid: i64,
        sids: Vec<i64>,
    },
    Close {
        rid: Option<i64>,
    },
}

impl Request {
    pub fn method(&self) -> &'static str {
        match self {
            Request::List { .. } => "list",
            Request::Set { .. } => "set",
            Request::Remove { .. } => "remove",
            Request::Invoke { .. } => "invoke",
            Request::Subscribe { .. } => "subscribe",
            Request::Unsubscribe { .. } => "unsubscribe",
            Request::Close { .. } => "close",
        }
    }

    pub fn rid(&self) -> Option<i64> {
        match self {
            Request::List { rid, .. }
            | Request::Set { rid, .. }
            | Request::Remove { rid, .. }
            | Request::Invoke { rid, .. }
            | Request::Subscribe { rid, .. }
            | Request::Unsubscribe { rid, .. } => Some(*rid),
            Request::Close { rid } => *rid,
        }
    }
}

impl TryFrom<RawRequest> for Request {
    type Error = ProtocolError;

    fn try_from(raw: RawRequest) -> Result<Self, Self::Error> {
        let method = raw.method.ok_or(ProtocolError::MissingField("method"))?;
        let rid = raw.rid.ok_or(ProtocolError::MissingField("rid"));
        let path = raw.path.ok_or(ProtocolError::MissingField("path"));

        let request = match method.as_str() {
            "list" => Request::List {
                rid: rid?,
                path: path?,
            },
            "set" => Request::Set {
                rid: rid?,
                path: path?,
                value: raw.value.unwrap_or_default(),
                permit: raw.permit,
            },
            "remove" => Request::Remove {
                rid: rid?,
                path: path?,
            },
            "invoke" => Request::Invoke {
                rid: rid?,
                path: path?,
                permit: raw.permit,
                params: raw.params.unwrap_or_default(),
            },
            "subscribe" => Request::Subscribe {
                rid: rid?,
                paths: raw
                    .paths
                    .unwrap_or_default()
                    .iter()
                    .filter_map(subscribe_pair)
                    .collect(),
            },
            "unsubscribe" => Request::Unsubscribe {
                rid: rid?,
                sids: raw
                    .sids
                    .unwrap_or_default()
                    .iter()
                    .filter_map(Variant::as_i64)
                    .collect(),
            },
            "close" => Request::Close { rid: rid.ok() },
            _ => return Err(ProtocolError::MethodNotImplemented(method)),
        };
        Ok(request)
    }
}

/// Pairs with a non-string path or a non-integer sid are dropped.
fn subscribe_pair(pair: &Variant) -> Option<SubscribePath> {
    let path = pair.get("path")?.as_str()?;
    let sid = match pair.get("sid")? {
        Variant::Int(i) => *i,
        _ => return None,
    };
    Some(SubscribePath {
        path: path.to_owned(),
        sid,
    })
}

/// Lifecycle marker of a response stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Initialize,
    Open,
    Closed,
}

/// A response object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub rid: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<StreamState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updates: Option<Vec<Variant>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<Variant>>,
}

impl Response {
    /// `{rid, stream: "closed"}`
    pub fn closed(rid: i64) -> Self {
        Self {
            rid,
            stream: Some(StreamState::Closed),
            updates: None,
            columns: None,
        }
    }

    /// `{rid, stream: "open", updates}`
    pub fn open(rid: i64, updates: Vec<Variant>) -> Self {
        Self {
            rid,
            stream: Some(StreamState::Open),
            updates: Some(updates),
            columns: None,
        }
    }

    /// Subscription value push: `{rid: 0, updates: [[sid, value, ts], ...]}`
    pub fn subscription_updates(updates: Vec<Variant>) -> Self {
        Self {
            rid: 0,
            stream: None,
            updates: Some(updates),
            columns: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: serde_json::Value) -> RawRequest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn decodes_set_with_permit() {
        let req = Request::try_from(raw(json!({
            "rid": 3, "method": "set", "path": "/a", "value": 5, "permit": "write"
        })))
        .unwrap();
        assert_eq!(
            req,
            Request::Set {
                rid: 3,
                path: "/a".into(),
                value: Variant::Int(5),
                permit: Some("write".into()),
            }
        );
    }

    #[test]
    fn unknown_method_is_rejected() {
        let err = Request::try_from(raw(json!({"rid": 1, "method": "frobnicate"}))).unwrap_err();
        assert!(matches!(err, ProtocolError::MethodNotImplemented(m) if m == "frobnicate"));
    }

    #[test]
    fn list_without_path_is_missing_field() {
        let err = Request::try_from(raw(json!({"rid": 1, "method": "list"}))).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingField("path")));
    }

    #[test]
    fn subscribe_skips_malformed_pairs() {
        let req = Request::try_from(raw(json!({
            "rid": 2,
            "method": "subscribe",
            "paths": [
                {"path": "/a", "sid": 1},
                {"path": 7, "sid": 2},
                {"path": "/b", "sid": "x"},
                {"sid": 4},
                {"path": "/c", "sid": 5}
            ]
        })))
        .unwrap();
        let Request::Subscribe { paths, .. } = req else {
            panic!("expected subscribe");
        };
        let sids: Vec<i64> = paths.iter().map(|p| p.sid).collect();
        assert_eq!(sids, vec![1, 5]);
    }

    #[test]
    fn ill_typed_request_does_not_spoil_its_batch() {
        let envelope: Envelope = serde_json::from_value(json!({
            "msg": 4,
            "requests": [
                {"rid": "oops", "method": "list", "path": "/"},
                "not a request",
                {"rid": 3, "method": "list", "path": 12},
                {"rid": 2, "method": "list", "path": "/"}
            ]
        }))
        .unwrap();
        let results: Vec<_> = envelope
            .requests
            .unwrap()
            .into_iter()
            .map(Request::try_from)
            .collect();
        assert!(matches!(results[0], Err(ProtocolError::MissingField("rid"))));
        assert!(matches!(results[1], Err(ProtocolError::MissingField("method"))));
        assert!(matches!(results[2], Err(ProtocolError::MissingField("path"))));
        assert_eq!(
            results[3].as_ref().unwrap(),
            &Request::List {
                rid: 2,
                path: "/".into()
            }
        );
    }

    #[test]
    fn close_tolerates_missing_rid() {
        let req = Request::try_from(raw(json!({"method": "close"}))).unwrap();
        assert_eq!(req, Request::Close { rid: None });
    }

    #[test]
    fn closed_response_omits_empty_fields() {
        let text = serde_json::to_string(&Response::closed(9)).unwrap();
        assert_eq!(text, r#"{"rid":9,"stream":"closed"}"#);
    }

    #[test]
    fn empty_envelope_is_a_ping() {
        assert!(Envelope::default().is_empty());
        let env = Envelope {
            responses: Some(vec![Response::closed(1)]),
            ..Default::default()
        };
        assert!(!env.is_empty());
    }
}
