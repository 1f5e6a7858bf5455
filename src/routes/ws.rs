//! WebSocket handler: picture edit sessions.
//!
//! DESIGN
//! ======
//! Before upgrading, the handler resolves the ws ticket to a user and checks
//! that user may edit the requested picture. After upgrade it enters a
//! `select!` loop:
//! - Incoming client text → decode → publish into the edit pipeline
//! - Notices queued for this connection → forward to client
//!
//! The handler never touches room state. Decode failures and pipeline
//! saturation are answered directly; everything else is answered by the
//! edit workers through the connection's outbound channel.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → publish join → worker sends the welcome
//! 2. Client sends requests → pipeline → worker applies + broadcasts
//! 3. Close or error → publish leave → worker releases lock, notifies peers

use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::message::{EditNotice, EditRequest, EditUser};
use crate::services::access::EditAccess;
use crate::services::registry::PictureId;
use crate::services::session::Session;
use crate::state::AppState;

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    match authorize(&state, &params).await {
        Ok((picture_id, user)) => ws.on_upgrade(move |socket| run_ws(socket, state, picture_id, user)),
        Err(rejection) => rejection.into_response(),
    }
}

/// Resolve the caller and check edit permission for the requested picture.
async fn authorize(
    state: &AppState,
    params: &HashMap<String, String>,
) -> Result<(PictureId, EditUser), (StatusCode, &'static str)> {
    let Some(picture_id) = params
        .get("pictureId")
        .and_then(|v| v.parse::<PictureId>().ok())
    else {
        return Err((StatusCode::BAD_REQUEST, "pictureId required"));
    };
    let Some(ticket) = params.get("ticket") else {
        return Err((StatusCode::UNAUTHORIZED, "ticket required"));
    };

    let user = match state.access.resolve_ticket(ticket).await {
        Ok(Some(user)) => user,
        Ok(None) => return Err((StatusCode::UNAUTHORIZED, "invalid or expired ticket")),
        Err(e) => {
            error!(error = %e, "ws ticket validation failed");
            return Err((StatusCode::INTERNAL_SERVER_ERROR, "ticket validation error"));
        }
    };

    match state.access.edit_access(picture_id, user.id).await {
        Ok(EditAccess::Granted) => Ok((picture_id, user)),
        Ok(EditAccess::NotFound) => Err((StatusCode::NOT_FOUND, "picture not found")),
        Ok(EditAccess::Denied) => {
            warn!(%picture_id, user_id = user.id, "ws: edit permission denied");
            Err((StatusCode::FORBIDDEN, "no edit permission for picture"))
        }
        Err(e) => {
            error!(error = %e, %picture_id, "picture access check failed");
            Err((StatusCode::INTERNAL_SERVER_ERROR, "access check error"))
        }
    }
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState, picture_id: PictureId, user: EditUser) {
    // Per-connection channel for notices from the edit workers.
    let (client_tx, mut client_rx) = mpsc::channel::<EditNotice>(state.config.outbound_buffer);
    let session = Session::new(picture_id, user, client_tx);
    let client_id = session.id();

    if let Err(e) = session.connect(&state.pipeline).await {
        warn!(%client_id, error = %e, "ws: join not published");
        let _ = send_notice(&mut socket, &EditNotice::error_from(&e)).await;
        return;
    }
    info!(%client_id, %picture_id, user_id = session.handle.user.id, "ws: client connected");

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(msg) = msg else { break };
                let Ok(msg) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        let replies = process_inbound_text(&state, &session, &text).await;
                        if send_all(&mut socket, &replies).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(notice) = client_rx.recv() => {
                if send_notice(&mut socket, &notice).await.is_err() {
                    break;
                }
            }
        }
    }

    let last_state = session.state(&state.registry).await;
    session.disconnect(&state.pipeline).await;
    info!(%client_id, %picture_id, ?last_state, "ws: client disconnected");
}

// =============================================================================
// INBOUND
// =============================================================================

/// Decode one inbound text frame and publish it. Returns notices for the
/// sender that must be sent directly (decode errors, saturation).
async fn process_inbound_text(state: &AppState, session: &Session, text: &str) -> Vec<EditNotice> {
    let request = match EditRequest::decode(text) {
        Ok(r) => r,
        Err(e) => {
            warn!(client_id = %session.id(), error = %e, "ws: invalid inbound frame");
            return vec![EditNotice::error_from(&e)];
        }
    };

    match session.submit(&state.pipeline, request).await {
        Ok(seq) => {
            tracing::debug!(client_id = %session.id(), seq, "ws: request published");
            vec![]
        }
        Err(e) => {
            warn!(client_id = %session.id(), picture_id = %session.picture_id, error = %e, "ws: request not published");
            vec![EditNotice::error_from(&e)]
        }
    }
}

// =============================================================================
// HELPERS
// =============================================================================

async fn send_all(socket: &mut WebSocket, notices: &[EditNotice]) -> Result<(), ()> {
    for notice in notices {
        send_notice(socket, notice).await?;
    }
    Ok(())
}

async fn send_notice(socket: &mut WebSocket, notice: &EditNotice) -> Result<(), ()> {
    let json = match serde_json::to_string(notice) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, "ws: failed to serialize notice");
            return Err(());
        }
    };
    socket
        .send(Message::Text(json.into()))
        .await
        .map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
