//! Wire types, key grammar, and error taxonomy shared by the author-side
//! publisher and the server-side coordinator.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Base URL the author-side publisher talks to when no override is set.
pub const DEFAULT_COORDINATOR_URL: &str = "https://api.dev.opencode.ai";

// ---------------------------------------------------------------------------
// Key grammar (spec §6.2)
// ---------------------------------------------------------------------------

/// Which of the three key families a validated key belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyFamily {
    /// `session/info/<sesID>`
    Info { ses_id: String },
    /// `session/message/<sesID>/<msgID>`
    Message { ses_id: String, msg_id: String },
    /// `session/part/<sesID>/<msgID>/<partID>`
    Part {
        ses_id: String,
        msg_id: String,
        part_id: String,
    },
}

impl KeyFamily {
    pub fn ses_id(&self) -> &str {
        match self {
            KeyFamily::Info { ses_id } => ses_id,
            KeyFamily::Message { ses_id, .. } => ses_id,
            KeyFamily::Part { ses_id, .. } => ses_id,
        }
    }
}

/// Validate `key` against the grammar in spec §6.2 and §3-I1. Any deviation
/// — including the richer `session/info/<sesID>/...` shape some older
/// clients send — is rejected; see DESIGN.md for why the stricter form was
/// chosen.
pub fn validate_key(key: &str) -> Result<KeyFamily, ShareError> {
    let parts: Vec<&str> = key.split('/').collect();
    let non_empty = !parts.iter().any(|p| p.is_empty());
    if !non_empty {
        return Err(ShareError::BadRequest(format!("empty key segment in {key:?}")));
    }
    match parts.as_slice() {
        ["session", "info", ses_id] => Ok(KeyFamily::Info {
            ses_id: (*ses_id).to_owned(),
        }),
        ["session", "message", ses_id, msg_id] => Ok(KeyFamily::Message {
            ses_id: (*ses_id).to_owned(),
            msg_id: (*msg_id).to_owned(),
        }),
        ["session", "part", ses_id, msg_id, part_id] => Ok(KeyFamily::Part {
            ses_id: (*ses_id).to_owned(),
            msg_id: (*msg_id).to_owned(),
            part_id: (*part_id).to_owned(),
        }),
        _ => Err(ShareError::BadRequest(format!("key {key:?} does not match a known family"))),
    }
}

/// `true` if `key`'s first path segment is `session` — the cheap filter the
/// publisher pipeline applies before it even looks at shared-session state.
pub fn is_session_key(key: &str) -> bool {
    key.split('/').next() == Some("session")
}

// ---------------------------------------------------------------------------
// Wire payloads (spec §6.1)
// ---------------------------------------------------------------------------

/// `POST /share_create` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareCreateRequest {
    #[serde(rename = "sessionID")]
    pub session_id: String,
}

/// `POST /share_create` response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareCreateResponse {
    pub secret: String,
    pub url: String,
}

/// `POST /share_sync` request body — also the shape relayed between the
/// publisher pipeline and the coordinator, so it doubles as `PublishEnvelope`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishEnvelope {
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub secret: String,
    pub key: String,
    pub content: serde_json::Value,
}

/// `POST /share_delete` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareDeleteRequest {
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub secret: String,
}

/// One frame sent from the coordinator to an attached viewer — both during
/// backlog replay and live delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewerFrame {
    pub key: String,
    pub content: serde_json::Value,
}

/// `GET /share_data` response body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShareDataResponse {
    pub info: Option<serde_json::Value>,
    pub messages: BTreeMap<String, serde_json::Value>,
}

/// Frozen HTTP error envelope used by every non-2xx response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpErrorEnvelope {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Error taxonomy (spec §7)
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ShareError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("unauthorized: missing secret")]
    Unauthorized,
    #[error("forbidden: secret mismatch")]
    Forbidden,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("transient downstream failure: {0}")]
    Transient(String),
    #[error("cancelled")]
    Cancelled,
    #[error("internal error: {0}")]
    Internal(String),
}

impl ShareError {
    /// HTTP status code this error maps to on the coordinator's surface.
    pub fn status_code(&self) -> u16 {
        match self {
            ShareError::BadRequest(_) => 400,
            ShareError::Unauthorized => 401,
            ShareError::Forbidden => 403,
            ShareError::NotFound(_) => 404,
            ShareError::Transient(_) => 503,
            ShareError::Cancelled => 499,
            ShareError::Internal(_) => 500,
        }
    }

    /// The machine-readable code carried in [`HttpErrorEnvelope::code`].
    pub fn code(&self) -> &'static str {
        match self {
            ShareError::BadRequest(_) => "BAD_REQUEST",
            ShareError::Unauthorized => "UNAUTHORIZED",
            ShareError::Forbidden => "FORBIDDEN",
            ShareError::NotFound(_) => "NOT_FOUND",
            ShareError::Transient(_) => "TRANSIENT",
            ShareError::Cancelled => "CANCELLED",
            ShareError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn to_envelope(&self) -> HttpErrorEnvelope {
        HttpErrorEnvelope {
            code: self.code().to_owned(),
            message: self.to_string(),
            details: None,
        }
    }
}

/// Connection/IO failures are retryable and surface as `Transient`;
/// constraint violations are a logic bug (the caller should have checked
/// first-wins/idempotency before issuing the write) and surface as
/// `Internal` so they aren't mistaken for a retryable condition.
impl From<sqlx::Error> for ShareError {
    fn from(err: sqlx::Error) -> Self {
        if let Some(db_err) = err.as_database_error() {
            if db_err.is_unique_violation() || db_err.is_check_violation() {
                return ShareError::Internal(db_err.to_string());
            }
        }
        ShareError::Transient(err.to_string())
    }
}

/// Constant-time byte comparison for bearer secrets (spec §3: "`secret` is
/// compared by constant-time equality on every write").
pub fn secrets_match(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Derive the public shareName from a sesID: the last 8 characters (spec §3,
/// §9 open question resolution).
pub fn share_name_for(ses_id: &str) -> String {
    let len = ses_id.len();
    if len <= 8 {
        ses_id.to_owned()
    } else {
        ses_id[len - 8..].to_owned()
    }
}
