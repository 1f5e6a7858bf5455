//! Edit protocol messages: inbound requests and outbound notices.
//!
//! ARCHITECTURE
//! ============
//! Clients send `EditRequest` JSON text frames over the picture-edit socket.
//! The server answers with `EditNotice` frames, either broadcast to the
//! picture's watchers or sent to the requester alone.
//!
//! DESIGN
//! ======
//! - Wire field names are camelCase, message types SCREAMING_SNAKE_CASE.
//! - The `editAction` payload is opaque: it is relayed verbatim, never parsed.
//! - Optional notice fields are omitted when absent, so a relayed action is
//!   exactly `{"type":"EDIT_ACTION","editAction":...}`.
//! - Rejections are `ERROR` notices carrying a grepable `code`.

use serde::{Deserialize, Serialize};

// =============================================================================
// FIELD CONSTANTS
// =============================================================================

/// Error code for frames that fail to decode or validate.
pub const CODE_INVALID_MESSAGE: &str = "E_INVALID_MESSAGE";

// =============================================================================
// ERROR CODES
// =============================================================================

/// Grepable error code and retryable flag for structured error notices.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

// =============================================================================
// USER
// =============================================================================

/// Verified identity attached to a connection. Supplied by the access gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditUser {
    pub id: i64,
    pub user_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_avatar: Option<String>,
}

// =============================================================================
// INBOUND
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EditMessageType {
    EnterEdit,
    ExitEdit,
    EditAction,
}

/// Client → server edit request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditRequest {
    #[serde(rename = "type")]
    pub kind: EditMessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edit_action: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("editAction required for EDIT_ACTION")]
    MissingEditAction,
}

impl ErrorCode for DecodeError {
    fn error_code(&self) -> &'static str {
        CODE_INVALID_MESSAGE
    }
}

impl EditRequest {
    /// Parse and validate one inbound text frame.
    ///
    /// # Errors
    ///
    /// Returns `Json` for malformed JSON or an unknown `type`, and
    /// `MissingEditAction` when an `EDIT_ACTION` carries no payload.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let req: Self = serde_json::from_str(text)?;
        if req.kind == EditMessageType::EditAction && req.edit_action.is_none() {
            return Err(DecodeError::MissingEditAction);
        }
        Ok(req)
    }
}

// =============================================================================
// OUTBOUND
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NoticeType {
    Info,
    Error,
    EnterEdit,
    ExitEdit,
    EditAction,
}

/// Server → client notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditNotice {
    #[serde(rename = "type")]
    pub kind: NoticeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edit_action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<EditUser>,
}

impl EditNotice {
    fn bare(kind: NoticeType) -> Self {
        Self { kind, code: None, message: None, retryable: None, edit_action: None, user: None }
    }

    /// Informational notice (joins, departures, welcome).
    pub fn info(message: impl Into<String>) -> Self {
        Self { message: Some(message.into()), ..Self::bare(NoticeType::Info) }
    }

    /// `user` now holds edit rights.
    #[must_use]
    pub fn entered(user: &EditUser) -> Self {
        Self {
            message: Some(format!("{} started editing", user.user_name)),
            user: Some(user.clone()),
            ..Self::bare(NoticeType::EnterEdit)
        }
    }

    /// `user` released edit rights.
    #[must_use]
    pub fn exited(user: &EditUser) -> Self {
        Self {
            message: Some(format!("{} stopped editing", user.user_name)),
            user: Some(user.clone()),
            ..Self::bare(NoticeType::ExitEdit)
        }
    }

    /// Relay of an accepted edit action. Payload passes through untouched.
    pub fn action(edit_action: impl Into<String>) -> Self {
        Self { edit_action: Some(edit_action.into()), ..Self::bare(NoticeType::EditAction) }
    }

    /// Structured error notice from a typed error.
    #[must_use]
    pub fn error_from(err: &(impl ErrorCode + ?Sized)) -> Self {
        Self {
            code: Some(err.error_code().to_string()),
            message: Some(err.to_string()),
            retryable: Some(err.retryable()),
            ..Self::bare(NoticeType::Error)
        }
    }

    #[must_use]
    pub fn with_user(mut self, user: &EditUser) -> Self {
        self.user = Some(user.clone());
        self
    }
}

#[cfg(test)]
#[path = "message_test.rs"]
mod tests;
