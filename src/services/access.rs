//! Access gate: identity and picture permission checks before upgrade.
//!
//! SYSTEM CONTEXT
//! ==============
//! Users, pictures and spaces are owned by the REST side of the product.
//! This module only asks two questions of that data: who does this ws
//! ticket belong to, and may that user edit this picture.
//!
//! DESIGN
//! ======
//! `PictureAccess` is the seam; `PgPictureAccess` answers from Postgres.
//! Tickets are consumed destructively (`DELETE ... RETURNING`) so each one
//! opens at most one socket. Collaborative editing is offered only for
//! pictures in a team space, to members whose role grants `picture:edit`.

use async_trait::async_trait;
use sqlx::{PgPool, Row};

use crate::message::{EditUser, ErrorCode};
use crate::services::registry::PictureId;

// =============================================================================
// PERMISSIONS
// =============================================================================

pub const PICTURE_VIEW: &str = "picture:view";
pub const PICTURE_UPLOAD: &str = "picture:upload";
pub const PICTURE_EDIT: &str = "picture:edit";
pub const PICTURE_DELETE: &str = "picture:delete";
pub const SPACE_USER_MANAGE: &str = "spaceUser:manage";

/// `space.space_type` value for team spaces.
const SPACE_TYPE_TEAM: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceRole {
    Viewer,
    Editor,
    Admin,
}

impl SpaceRole {
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "viewer" => Some(Self::Viewer),
            "editor" => Some(Self::Editor),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }

    #[must_use]
    pub fn permissions(self) -> &'static [&'static str] {
        match self {
            Self::Viewer => &[PICTURE_VIEW],
            Self::Editor => &[PICTURE_VIEW, PICTURE_UPLOAD, PICTURE_EDIT, PICTURE_DELETE],
            Self::Admin => &[PICTURE_VIEW, PICTURE_UPLOAD, PICTURE_EDIT, PICTURE_DELETE, SPACE_USER_MANAGE],
        }
    }

    #[must_use]
    pub fn allows(self, permission: &str) -> bool {
        self.permissions().contains(&permission)
    }
}

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditAccess {
    Granted,
    NotFound,
    Denied,
}

#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ErrorCode for AccessError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Database(_) => "E_DATABASE",
        }
    }

    fn retryable(&self) -> bool {
        true
    }
}

/// What the picture lookup returns for one (picture, user) pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PictureAccessRow {
    pub space_id: Option<i64>,
    pub space_type: Option<i32>,
    pub space_role: Option<String>,
}

#[async_trait]
pub trait PictureAccess: Send + Sync {
    /// Consume a ws ticket. `None` if unknown, expired or already used.
    async fn resolve_ticket(&self, ticket: &str) -> Result<Option<EditUser>, AccessError>;

    async fn edit_access(&self, picture_id: PictureId, user_id: i64) -> Result<EditAccess, AccessError>;
}

/// Decide edit access from the picture lookup. `None` means no such picture.
#[must_use]
pub fn decide(row: Option<&PictureAccessRow>) -> EditAccess {
    let Some(row) = row else {
        return EditAccess::NotFound;
    };
    if row.space_id.is_none() || row.space_type != Some(SPACE_TYPE_TEAM) {
        return EditAccess::Denied;
    }
    let allowed = row
        .space_role
        .as_deref()
        .and_then(SpaceRole::parse)
        .is_some_and(|role| role.allows(PICTURE_EDIT));
    if allowed { EditAccess::Granted } else { EditAccess::Denied }
}

// =============================================================================
// POSTGRES
// =============================================================================

pub struct PgPictureAccess {
    pool: PgPool,
}

impl PgPictureAccess {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PictureAccess for PgPictureAccess {
    async fn resolve_ticket(&self, ticket: &str) -> Result<Option<EditUser>, AccessError> {
        let row = sqlx::query(
            r#"DELETE FROM ws_tickets t
               USING "user" u
               WHERE t.ticket = $1 AND t.expires_at > now() AND u.id = t.user_id AND u.is_delete = 0
               RETURNING u.id, u.user_name, u.user_avatar"#,
        )
        .bind(ticket)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| EditUser {
            id: r.get("id"),
            user_name: r.get("user_name"),
            user_avatar: r.get("user_avatar"),
        }))
    }

    async fn edit_access(&self, picture_id: PictureId, user_id: i64) -> Result<EditAccess, AccessError> {
        let row = sqlx::query(
            "SELECT p.space_id, s.space_type, su.space_role
             FROM picture p
             LEFT JOIN space s ON s.id = p.space_id AND s.is_delete = 0
             LEFT JOIN space_user su ON su.space_id = p.space_id AND su.user_id = $2
             WHERE p.id = $1 AND p.is_delete = 0",
        )
        .bind(picture_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        let row = row.map(|r| PictureAccessRow {
            space_id: r.get("space_id"),
            space_type: r.get("space_type"),
            space_role: r.get("space_role"),
        });
        Ok(decide(row.as_ref()))
    }
}

// =============================================================================
// IN-MEMORY (tests)
// =============================================================================


#[cfg(test)]
#[path = "access_test.rs"]
mod tests;
