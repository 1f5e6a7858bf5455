use super::*;
use crate::message::NoticeType;
use crate::services::registry::{ConnectionHandle, SessionState};
use crate::state::test_helpers::{TEST_PICTURE_ID, user};
use tokio::sync::mpsc;

const PICTURE: PictureId = TEST_PICTURE_ID;

struct Client {
    handle: ConnectionHandle,
    rx: mpsc::Receiver<EditNotice>,
}

impl Client {
    fn new(id: i64, name: &str) -> Self {
        let (tx, rx) = mpsc::channel(32);
        Self { handle: ConnectionHandle::new(user(id, name), tx), rx }
    }

    /// Everything queued so far, INFO notices removed.
    fn drain(&mut self) -> Vec<EditNotice> {
        let mut out = Vec::new();
        while let Ok(notice) = self.rx.try_recv() {
            if notice.kind != NoticeType::Info {
                out.push(notice);
            }
        }
        out
    }

    fn drain_all(&mut self) -> Vec<EditNotice> {
        let mut out = Vec::new();
        while let Ok(notice) = self.rx.try_recv() {
            out.push(notice);
        }
        out
    }
}

struct Harness {
    registry: Arc<RoomRegistry>,
    processor: EditProcessor,
    sequence: u64,
}

impl Harness {
    fn new() -> Self {
        let registry = Arc::new(RoomRegistry::new());
        let processor = EditProcessor::new(Arc::clone(&registry));
        Self { registry, processor, sequence: 0 }
    }

    async fn send(&mut self, session: &ConnectionHandle, kind: EventKind) -> Result<(), DispatchFault> {
        self.sequence += 1;
        let event = EditEvent { sequence: self.sequence, picture_id: PICTURE, session: session.clone(), kind };
        self.processor.handle(&event).await
    }

    async fn join(&mut self, client: &Client) {
        self.send(&client.handle, EventKind::Join).await.expect("join");
    }

    async fn leave(&mut self, client: &Client) {
        self.send(&client.handle, EventKind::Leave).await.expect("leave");
    }

    async fn request(&mut self, client: &Client, kind: EditMessageType, action: Option<&str>) {
        let req = EditRequest { kind, edit_action: action.map(str::to_owned) };
        self.send(&client.handle, EventKind::Request(req)).await.expect("request");
    }

    async fn enter(&mut self, client: &Client) {
        self.request(client, EditMessageType::EnterEdit, None).await;
    }

    async fn exit(&mut self, client: &Client) {
        self.request(client, EditMessageType::ExitEdit, None).await;
    }

    async fn act(&mut self, client: &Client, payload: &str) {
        self.request(client, EditMessageType::EditAction, Some(payload)).await;
    }
}

fn single(notices: Vec<EditNotice>) -> EditNotice {
    assert_eq!(notices.len(), 1, "expected exactly one notice, got {notices:?}");
    notices.into_iter().next().expect("one notice")
}

fn assert_error(notices: Vec<EditNotice>, code: &str) {
    let notice = single(notices);
    assert_eq!(notice.kind, NoticeType::Error);
    assert_eq!(notice.code.as_deref(), Some(code));
}

// =============================================================================
// join / leave
// =============================================================================

#[tokio::test]
async fn join_welcomes_self_and_announces_to_others() {
    let mut h = Harness::new();
    let mut a = Client::new(1, "alice");
    let mut b = Client::new(2, "bob");

    h.join(&a).await;
    let welcome = single(a.drain_all());
    assert_eq!(welcome.kind, NoticeType::Info);
    assert_eq!(welcome.user.map(|u| u.id), Some(1));

    h.join(&b).await;
    let seen_by_a = single(a.drain_all());
    assert_eq!(seen_by_a.message.as_deref(), Some("bob joined"));
    assert_eq!(single(b.drain_all()).kind, NoticeType::Info);
    assert_eq!(h.registry.state_of(PICTURE, b.handle.id).await, Some(SessionState::Watching));
}

#[tokio::test]
async fn late_joiner_learns_current_editor() {
    let mut h = Harness::new();
    let mut a = Client::new(1, "alice");
    let mut d = Client::new(4, "dave");
    h.join(&a).await;
    h.enter(&a).await;
    a.drain();

    h.join(&d).await;

    let notice = single(d.drain());
    assert_eq!(notice.kind, NoticeType::EnterEdit);
    assert_eq!(notice.user.map(|u| u.user_name), Some("alice".to_owned()));
    assert_eq!(h.registry.state_of(PICTURE, d.handle.id).await, Some(SessionState::Watching));
}

#[tokio::test]
async fn join_to_closed_connection_reports_fault() {
    let mut h = Harness::new();
    let Client { handle, rx } = Client::new(1, "alice");
    drop(rx);

    let result = h.send(&handle, EventKind::Join).await;

    assert!(matches!(result, Err(DispatchFault::Closed(id)) if id == handle.id));
}

#[tokio::test]
async fn joiner_with_closed_channel_is_still_announced() {
    let mut h = Harness::new();
    let mut a = Client::new(1, "alice");
    h.join(&a).await;
    h.enter(&a).await;
    a.drain_all();
    let Client { handle, rx } = Client::new(2, "bob");
    drop(rx);

    let result = h.send(&handle, EventKind::Join).await;

    assert!(matches!(result, Err(DispatchFault::Closed(id)) if id == handle.id));
    let notice = single(a.drain_all());
    assert_eq!(notice.message.as_deref(), Some("bob joined"));
    assert_eq!(h.registry.state_of(PICTURE, handle.id).await, Some(SessionState::Watching));
}

#[tokio::test]
async fn reenter_with_full_channel_is_not_an_error() {
    let mut h = Harness::new();
    let (tx, mut rx) = mpsc::channel(1);
    let holder = ConnectionHandle::new(user(1, "alice"), tx);
    h.send(&holder, EventKind::Join).await.expect("join");
    rx.recv().await.expect("welcome");
    h.send(&holder, EventKind::Request(EditRequest { kind: EditMessageType::EnterEdit, edit_action: None }))
        .await
        .expect("enter");

    // Buffer still holds the first ENTER_EDIT, so the acknowledgement is dropped.
    let again = EditRequest { kind: EditMessageType::EnterEdit, edit_action: None };
    assert!(h.send(&holder, EventKind::Request(again)).await.is_ok());
    assert_eq!(h.registry.state_of(PICTURE, holder.id).await, Some(SessionState::Editing));
    assert_eq!(rx.try_recv().map(|n| n.kind), Ok(NoticeType::EnterEdit));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn leave_of_watcher_does_not_emit_exit_edit() {
    let mut h = Harness::new();
    let mut a = Client::new(1, "alice");
    let b = Client::new(2, "bob");
    h.join(&a).await;
    h.join(&b).await;
    a.drain_all();

    h.leave(&b).await;

    let notice = single(a.drain_all());
    assert_eq!(notice.kind, NoticeType::Info);
    assert_eq!(notice.message.as_deref(), Some("bob left"));
}

#[tokio::test]
async fn duplicate_leave_is_ignored() {
    let mut h = Harness::new();
    let mut a = Client::new(1, "alice");
    let b = Client::new(2, "bob");
    h.join(&a).await;
    h.join(&b).await;
    h.leave(&b).await;
    a.drain_all();

    h.leave(&b).await;

    assert!(a.drain_all().is_empty());
}

// =============================================================================
// editing
// =============================================================================

#[tokio::test]
async fn collaborative_session_walkthrough() {
    let mut h = Harness::new();
    let mut a = Client::new(1, "alice");
    let mut b = Client::new(2, "bob");
    let mut c = Client::new(3, "carol");
    for client in [&a, &b, &c] {
        h.join(client).await;
    }
    for client in [&mut a, &mut b, &mut c] {
        client.drain_all();
    }

    // A takes the pen; everyone hears about it, A included.
    h.enter(&a).await;
    for client in [&mut a, &mut b, &mut c] {
        let notice = single(client.drain());
        assert_eq!(notice.kind, NoticeType::EnterEdit);
        assert_eq!(notice.user.as_ref().map(|u| u.id), Some(1));
    }

    // B is refused; nobody else notices.
    h.enter(&b).await;
    assert_error(b.drain(), "E_CONFLICT");
    assert!(a.drain().is_empty());
    assert!(c.drain().is_empty());

    // A's action reaches B and C, not A.
    h.act(&a, "draw:circle").await;
    for client in [&mut b, &mut c] {
        let notice = single(client.drain());
        assert_eq!(notice.kind, NoticeType::EditAction);
        assert_eq!(notice.edit_action.as_deref(), Some("draw:circle"));
    }
    assert!(a.drain().is_empty());

    // B may not act.
    h.act(&b, "draw:square").await;
    assert_error(b.drain(), "E_FORBIDDEN");
    assert!(c.drain().is_empty());

    // A vanishes: exactly one EXIT_EDIT per remaining watcher.
    h.leave(&a).await;
    for client in [&mut b, &mut c] {
        let notice = single(client.drain());
        assert_eq!(notice.kind, NoticeType::ExitEdit);
        assert_eq!(notice.user.as_ref().map(|u| u.id), Some(1));
    }
    assert_eq!(h.registry.editor_of(PICTURE).await, None);

    // The pen is free again.
    h.enter(&b).await;
    assert_eq!(single(c.drain()).kind, NoticeType::EnterEdit);
    assert_eq!(h.registry.editor_of(PICTURE).await, Some(b.handle.id));
}

#[tokio::test]
async fn conflict_is_retryable_and_names_editor() {
    let mut h = Harness::new();
    let mut a = Client::new(1, "alice");
    let mut b = Client::new(2, "bob");
    h.join(&a).await;
    h.join(&b).await;
    h.enter(&a).await;
    a.drain();
    b.drain();

    h.enter(&b).await;

    let notice = single(b.drain());
    assert_eq!(notice.retryable, Some(true));
    assert!(notice.message.is_some_and(|m| m.contains("alice")));
}

#[tokio::test]
async fn reenter_by_holder_acknowledges_only_holder() {
    let mut h = Harness::new();
    let mut a = Client::new(1, "alice");
    let mut b = Client::new(2, "bob");
    h.join(&a).await;
    h.join(&b).await;
    h.enter(&a).await;
    a.drain();
    b.drain();

    h.enter(&a).await;

    assert_eq!(single(a.drain()).kind, NoticeType::EnterEdit);
    assert!(b.drain().is_empty());
}

#[tokio::test]
async fn exit_by_holder_notifies_everyone() {
    let mut h = Harness::new();
    let mut a = Client::new(1, "alice");
    let mut b = Client::new(2, "bob");
    h.join(&a).await;
    h.join(&b).await;
    h.enter(&a).await;
    a.drain();
    b.drain();

    h.exit(&a).await;

    for client in [&mut a, &mut b] {
        assert_eq!(single(client.drain()).kind, NoticeType::ExitEdit);
    }
    assert_eq!(h.registry.state_of(PICTURE, a.handle.id).await, Some(SessionState::Watching));
}

#[tokio::test]
async fn exit_by_non_holder_is_forbidden() {
    let mut h = Harness::new();
    let mut a = Client::new(1, "alice");
    let mut b = Client::new(2, "bob");
    h.join(&a).await;
    h.join(&b).await;
    h.enter(&a).await;
    a.drain();
    b.drain();

    h.exit(&b).await;

    assert_error(b.drain(), "E_FORBIDDEN");
    assert!(a.drain().is_empty());
    assert_eq!(h.registry.editor_of(PICTURE).await, Some(a.handle.id));
}

#[tokio::test]
async fn action_without_payload_is_invalid() {
    let mut h = Harness::new();
    let mut a = Client::new(1, "alice");
    let mut b = Client::new(2, "bob");
    h.join(&a).await;
    h.join(&b).await;
    h.enter(&a).await;
    a.drain();
    b.drain();

    h.request(&a, EditMessageType::EditAction, None).await;

    assert_error(a.drain(), crate::message::CODE_INVALID_MESSAGE);
    assert!(b.drain().is_empty());
}

#[tokio::test]
async fn action_while_watching_is_forbidden_even_with_no_editor() {
    let mut h = Harness::new();
    let mut a = Client::new(1, "alice");
    h.join(&a).await;
    a.drain_all();

    h.act(&a, "draw:line").await;

    assert_error(a.drain(), "E_FORBIDDEN");
}

#[tokio::test]
async fn request_before_join_is_unknown_room() {
    let mut h = Harness::new();
    let mut a = Client::new(1, "alice");

    h.enter(&a).await;

    assert_error(a.drain(), "E_UNKNOWN_ROOM");
    assert_eq!(h.registry.editor_of(PICTURE).await, None);
}

#[test]
fn error_codes() {
    let conflict = EditError::Conflict { picture_id: 1, editor: "alice".into() };
    assert_eq!(conflict.error_code(), "E_CONFLICT");
    assert!(conflict.retryable());
    assert_eq!(EditError::Forbidden(1).error_code(), "E_FORBIDDEN");
    assert!(!EditError::Forbidden(1).retryable());
    assert_eq!(EditError::UnknownRoom(1).error_code(), "E_UNKNOWN_ROOM");
    assert_eq!(EditError::InvalidRequest("x").error_code(), crate::message::CODE_INVALID_MESSAGE);
}
