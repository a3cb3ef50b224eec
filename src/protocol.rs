//! Messages exchanged between the coordinator and worker routers
//!
//! Both directions carry JSON text. A dispatch request looks like
//!
//! ```text
//! {"id":7,"requestType":"HTTP","url":"/svc/data","headers":{"host":"proxy"},"body":null,"deadlineMs":30000}
//! ```
//!
//! and a reply carries either a body or an error code with its message:
//!
//! ```text
//! {"id":7,"data":"..."}
//! {"id":7,"errorCode":"404","error":"Rules not found"}
//! ```
//!
//! Every decoded message is validated before use. Anything that does not
//! match its shape exactly is rejected with a [`ProtocolError`].

use crate::error::ProxyErrorCode;
use hyper::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Validation failure for a message crossing the coordinator/worker boundary
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("dispatch request body must be empty")]
    BodyNotEmpty,
    #[error("dispatch request deadline must be non-zero")]
    ZeroDeadline,
    #[error("reply carries both data and an error")]
    AmbiguousReply,
    #[error("reply carries neither data nor an error")]
    EmptyReply,
    #[error("error reply is missing its {0}")]
    IncompleteError(&'static str),
    #[error("invalid error code {0:?}")]
    InvalidErrorCode(String),
}

/// Kind of request being proxied. Only plain HTTP exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestType {
    #[serde(rename = "HTTP")]
    Http,
}

/// Request handed from the coordinator to one worker router
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DispatchRequest {
    /// Correlation id echoed back in the reply
    pub id: u64,
    pub request_type: RequestType,
    /// Path and query of the inbound request
    pub url: String,
    /// Inbound headers; carried along but not used for routing
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Always empty, request bodies are not forwarded
    pub body: Option<String>,
    /// Time budget for the whole dispatch in milliseconds
    pub deadline_ms: u64,
}

impl DispatchRequest {
    pub fn new(id: u64, url: impl Into<String>, headers: BTreeMap<String, String>, deadline: Duration) -> Self {
        Self {
            id,
            request_type: RequestType::Http,
            url: url.into(),
            headers,
            body: None,
            deadline_ms: deadline.as_millis().try_into().unwrap_or(u64::MAX),
        }
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.body.as_deref().is_some_and(|b| !b.is_empty()) {
            return Err(ProtocolError::BodyNotEmpty);
        }
        if self.deadline_ms == 0 {
            return Err(ProtocolError::ZeroDeadline);
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        let request: DispatchRequest = serde_json::from_str(raw)?;
        request.validate()?;
        Ok(request)
    }
}

/// Result carried by a reply: exactly one of a body or an error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// Full upstream response body
    Data(String),
    /// Status to send to the client with a plain-text message
    Error { status: StatusCode, message: String },
}

/// Reply from a worker router, matched to its request by `id`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReply {
    pub id: u64,
    pub outcome: ReplyOutcome,
}

impl DispatchReply {
    pub fn data(id: u64, body: impl Into<String>) -> Self {
        Self {
            id,
            outcome: ReplyOutcome::Data(body.into()),
        }
    }

    pub fn failure(id: u64, code: ProxyErrorCode) -> Self {
        Self {
            id,
            outcome: ReplyOutcome::Error {
                status: code.status_code(),
                message: code.message().to_string(),
            },
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(&WireReply::from(self))?)
    }

    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        let wire: WireReply = serde_json::from_str(raw)?;
        Self::try_from(wire)
    }
}

/// Reply as it appears on the wire, before the one-variant check
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct WireReply {
    id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl From<&DispatchReply> for WireReply {
    fn from(reply: &DispatchReply) -> Self {
        match &reply.outcome {
            ReplyOutcome::Data(body) => WireReply {
                id: reply.id,
                data: Some(body.clone()),
                error_code: None,
                error: None,
            },
            ReplyOutcome::Error { status, message } => WireReply {
                id: reply.id,
                data: None,
                error_code: Some(status.as_u16().to_string()),
                error: Some(message.clone()),
            },
        }
    }
}

impl TryFrom<WireReply> for DispatchReply {
    type Error = ProtocolError;

    fn try_from(wire: WireReply) -> Result<Self, ProtocolError> {
        let outcome = match (wire.data, wire.error_code, wire.error) {
            (Some(_), Some(_), _) | (Some(_), _, Some(_)) => return Err(ProtocolError::AmbiguousReply),
            (Some(data), None, None) => ReplyOutcome::Data(data),
            (None, None, None) => return Err(ProtocolError::EmptyReply),
            (None, Some(_), None) => return Err(ProtocolError::IncompleteError("message")),
            (None, None, Some(_)) => return Err(ProtocolError::IncompleteError("code")),
            (None, Some(code), Some(message)) => ReplyOutcome::Error {
                status: parse_error_code(&code)?,
                message,
            },
        };

        Ok(DispatchReply { id: wire.id, outcome })
    }
}

fn parse_error_code(code: &str) -> Result<StatusCode, ProtocolError> {
    code.parse::<u16>()
        .ok()
        .filter(|n| (100..=599).contains(n))
        .and_then(|n| StatusCode::from_u16(n).ok())
        .ok_or_else(|| ProtocolError::InvalidErrorCode(code.to_string()))
}

/// Best-effort extraction of the correlation id from a message that failed
/// validation, so only that request is failed.
pub fn recover_id(raw: &str) -> Option<u64> {
    serde_json::from_str::<serde_json::Value>(raw)
        .ok()?
        .get("id")?
        .as_u64()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(url: &str) -> DispatchRequest {
        DispatchRequest::new(1, url, BTreeMap::new(), Duration::from_secs(30))
    }

    #[test]
    fn test_request_wire_shape() {
        let mut headers = BTreeMap::new();
        headers.insert("host".to_string(), "proxy.local".to_string());
        let req = DispatchRequest::new(7, "/svc/data?x=1", headers, Duration::from_secs(2));

        let json: serde_json::Value = serde_json::from_str(&req.encode().unwrap()).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["requestType"], "HTTP");
        assert_eq!(json["url"], "/svc/data?x=1");
        assert_eq!(json["headers"]["host"], "proxy.local");
        assert!(json["body"].is_null());
        assert_eq!(json["deadlineMs"], 2000);
    }

    #[test]
    fn test_request_decode() {
        let raw = r#"{"id":3,"requestType":"HTTP","url":"/a","headers":{},"body":null,"deadlineMs":100}"#;
        let req = DispatchRequest::decode(raw).unwrap();
        assert_eq!(req.id, 3);
        assert_eq!(req.url, "/a");
        assert_eq!(req.deadline(), Duration::from_millis(100));
    }

    #[test]
    fn test_request_rejects_body() {
        let mut req = request("/a");
        req.body = Some("payload".to_string());
        let raw = serde_json::to_string(&req).unwrap();
        assert!(matches!(
            DispatchRequest::decode(&raw),
            Err(ProtocolError::BodyNotEmpty)
        ));
    }

    #[test]
    fn test_request_rejects_bad_shapes() {
        // unknown request type
        let raw = r#"{"id":1,"requestType":"FTP","url":"/a","body":null,"deadlineMs":1}"#;
        assert!(matches!(DispatchRequest::decode(raw), Err(ProtocolError::Json(_))));

        // unknown field
        let raw = r#"{"id":1,"requestType":"HTTP","url":"/a","body":null,"deadlineMs":1,"extra":true}"#;
        assert!(matches!(DispatchRequest::decode(raw), Err(ProtocolError::Json(_))));

        // url missing
        let raw = r#"{"id":1,"requestType":"HTTP","body":null,"deadlineMs":1}"#;
        assert!(matches!(DispatchRequest::decode(raw), Err(ProtocolError::Json(_))));

        // asterisk-form targets are carried verbatim
        let raw = r#"{"id":1,"requestType":"HTTP","url":"*","body":null,"deadlineMs":1}"#;
        assert_eq!(DispatchRequest::decode(raw).unwrap().url, "*");

        // zero deadline
        let raw = r#"{"id":1,"requestType":"HTTP","url":"/a","body":null,"deadlineMs":0}"#;
        assert!(matches!(DispatchRequest::decode(raw), Err(ProtocolError::ZeroDeadline)));
    }

    #[test]
    fn test_reply_wire_shapes() {
        let ok = DispatchReply::data(5, "hello").encode().unwrap();
        assert_eq!(ok, r#"{"id":5,"data":"hello"}"#);

        let err = DispatchReply::failure(6, ProxyErrorCode::RulesNotFound).encode().unwrap();
        assert_eq!(err, r#"{"id":6,"errorCode":"404","error":"Rules not found"}"#);
    }

    #[test]
    fn test_reply_decode_error() {
        let reply = DispatchReply::decode(r#"{"id":9,"errorCode":"500","error":"Upstream not found"}"#).unwrap();
        assert_eq!(reply.id, 9);
        assert_eq!(
            reply.outcome,
            ReplyOutcome::Error {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: "Upstream not found".to_string(),
            }
        );
    }

    #[test]
    fn test_reply_empty_data_is_success() {
        let reply = DispatchReply::decode(r#"{"id":1,"data":""}"#).unwrap();
        assert_eq!(reply.outcome, ReplyOutcome::Data(String::new()));
    }

    #[test]
    fn test_reply_requires_exactly_one_variant() {
        assert!(matches!(
            DispatchReply::decode(r#"{"id":1,"data":"x","errorCode":"404","error":"no"}"#),
            Err(ProtocolError::AmbiguousReply)
        ));
        assert!(matches!(
            DispatchReply::decode(r#"{"id":1}"#),
            Err(ProtocolError::EmptyReply)
        ));
        assert!(matches!(
            DispatchReply::decode(r#"{"id":1,"errorCode":"404"}"#),
            Err(ProtocolError::IncompleteError("message"))
        ));
        assert!(matches!(
            DispatchReply::decode(r#"{"id":1,"error":"no"}"#),
            Err(ProtocolError::IncompleteError("code"))
        ));
    }

    #[test]
    fn test_reply_rejects_invalid_error_codes() {
        for code in ["abc", "42", "600", "-1", ""] {
            let raw = format!(r#"{{"id":1,"errorCode":"{}","error":"x"}}"#, code);
            assert!(
                matches!(DispatchReply::decode(&raw), Err(ProtocolError::InvalidErrorCode(_))),
                "code {:?} should be rejected",
                code
            );
        }
    }

    #[test]
    fn test_recover_id() {
        assert_eq!(recover_id(r#"{"id":42,"data":1}"#), Some(42));
        assert_eq!(recover_id(r#"{"data":"x"}"#), None);
        assert_eq!(recover_id("not json"), None);
    }
}
