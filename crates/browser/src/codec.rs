//! CDP wire message: one JSON shape that is a request, a response, or an
//! event depending on which of `id`/`method` is present.
//!
//! Kept as a single `serde(untagged)`-free struct (not an enum) because the
//! multiplexer needs to inspect `id` and `method` independently before it
//! knows which of the three kinds a message is - see `Message::kind`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Monotonic request id, assigned by the writer task.
pub type RequestId = i64;

/// Chrome's `targetId`, identifying a page/worker/browser target.
pub type TargetId = String;

/// Chrome's CDP session id, returned by `Target.attachToTarget`.
pub type CdpSessionId = String;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A single CDP message in either direction.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,

    #[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<CdpSessionId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

/// Which of the three CDP message shapes a `Message` is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// `id` set, `method` absent.
    Response,
    /// `method` set, `id` absent.
    Event,
    /// Both set - only ever produced locally before a request is sent.
    Request,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match (self.id.is_some(), self.method.is_some()) {
            (true, false) => MessageKind::Response,
            (false, true) => MessageKind::Event,
            (true, true) => MessageKind::Request,
            (false, false) => MessageKind::Event,
        }
    }

    pub fn is_response(&self) -> bool {
        self.method.is_none()
    }

    pub fn request(
        id: RequestId,
        method: impl Into<String>,
        params: Option<Value>,
        session_id: Option<CdpSessionId>,
    ) -> Self {
        Self {
            id: Some(id),
            session_id,
            method: Some(method.into()),
            params,
            result: None,
            error: None,
        }
    }

    /// Build a synthetic error response for a transport-level failure, per
    /// §4.D: code 0, message is the underlying error's text.
    pub fn synthetic_error(id: RequestId, message: impl Into<String>) -> Self {
        Self {
            id: Some(id),
            session_id: None,
            method: None,
            params: None,
            result: None,
            error: Some(ErrorObject {
                code: 0,
                message: message.into(),
                data: None,
            }),
        }
    }
}
