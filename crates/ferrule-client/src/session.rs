//! Client sessions.
//!
//! A [`Session`] is a cheap handle over shared state: its lifecycle, the
//! user's [`MessageHandler`], the outbound channel to the writer task, and
//! the mailbox of events waiting to be delivered on the worker pool.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use ferrule_core::{Payload, SessionId};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::ClientError;
use crate::registry::SessionRegistry;
use crate::transport::Frame;

/// Lifecycle of a session. Transitions only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
#[repr(u8)]
pub enum SessionState {
    /// Accepted by the origin policy, transport not yet confirmed.
    Connecting = 0,
    /// Messages flow.
    Open = 1,
    /// Close requested; pending work is finishing.
    Closing = 2,
    /// `on_close` has run.
    Closed = 3,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }

    /// Lowercase name for logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum CloseReason {
    /// The local side called [`Session::close`].
    Normal,
    /// The peer sent a close frame or hung up.
    PeerClosed,
    /// The runtime idled out and tore itself down.
    IdleTimeout,
    /// The transport failed.
    TransportFailure(String),
    /// The runtime was shut down.
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => f.write_str("normal"),
            Self::PeerClosed => f.write_str("peer closed"),
            Self::IdleTimeout => f.write_str("idle timeout"),
            Self::TransportFailure(detail) => write!(f, "transport failure: {detail}"),
            Self::Shutdown => f.write_str("shutdown"),
        }
    }
}

/// User callbacks for one session.
///
/// Every callback runs on a worker-pool thread, never on an I/O task, so a
/// handler may block. Callbacks for one session never overlap and arrive
/// in order: `on_open`, then messages as received, then `on_close` exactly
/// once.
pub trait MessageHandler: Send + Sync + 'static {
    /// The session is open.
    fn on_open(&self, _session: &Session) {}

    /// An inbound message. `Ok(Some(reply))` sends `reply` back.
    fn on_message(&self, session: &Session, payload: Payload) -> anyhow::Result<Option<Payload>>;

    /// `on_message` returned an error or panicked. The session stays open.
    fn on_error(&self, _session: &Session, _error: &anyhow::Error) {}

    /// The session ended.
    fn on_close(&self, _session: &Session, _reason: &CloseReason) {}
}

#[derive(Debug)]
pub(crate) enum MailboxItem {
    Open,
    Message(Payload),
    Close(CloseReason),
}

#[derive(Default)]
struct Mailbox {
    items: VecDeque<MailboxItem>,
    scheduled: bool,
}

pub(crate) struct SessionCore {
    pub(crate) id: SessionId,
    target: String,
    state: AtomicU8,
    pub(crate) handler: Arc<dyn MessageHandler>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    mailbox: Mutex<Mailbox>,
    close_reason: Mutex<Option<CloseReason>>,
    pub(crate) cancel: CancellationToken,
    pub(crate) registry: OnceLock<Weak<SessionRegistry>>,
}

impl SessionCore {
    pub(crate) fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Move to `Closing` and stop outbound traffic. Only the first caller
    /// wins.
    pub(crate) fn begin_close(&self, reason: &CloseReason) -> bool {
        let won = self.transition(SessionState::Open, SessionState::Closing)
            || self.transition(SessionState::Connecting, SessionState::Closing);
        if !won {
            return false;
        }
        *self.close_reason.lock() = Some(reason.clone());
        if let Some(tx) = self.outbound.lock().take() {
            let _ = tx.send(Frame::Close);
        }
        self.cancel.cancel();
        true
    }

    /// Queue an item; returns whether the caller must schedule a drain.
    /// Messages are refused once the session is no longer open.
    pub(crate) fn enqueue(&self, item: MailboxItem) -> Option<bool> {
        let mut mailbox = self.mailbox.lock();
        if matches!(item, MailboxItem::Message(_)) && self.state() != SessionState::Open {
            return None;
        }
        mailbox.items.push_back(item);
        Some(!std::mem::replace(&mut mailbox.scheduled, true))
    }

    /// Queue the close notification behind any messages already received.
    /// Returns whether a drain must be scheduled and how many messages are
    /// still ahead of it.
    pub(crate) fn enqueue_close(&self, reason: CloseReason) -> (bool, usize) {
        let mut mailbox = self.mailbox.lock();
        let pending = mailbox
            .items
            .iter()
            .filter(|item| matches!(item, MailboxItem::Message(_)))
            .count();
        mailbox.items.push_back(MailboxItem::Close(reason));
        (!std::mem::replace(&mut mailbox.scheduled, true), pending)
    }

    /// Next item, clearing the scheduled flag when the mailbox is empty.
    pub(crate) fn next_item(&self) -> Option<MailboxItem> {
        let mut mailbox = self.mailbox.lock();
        let item = mailbox.items.pop_front();
        if item.is_none() {
            mailbox.scheduled = false;
        }
        item
    }

    /// After handling one item: whether more are waiting. Clears the
    /// scheduled flag when not.
    pub(crate) fn has_more(&self) -> bool {
        let mut mailbox = self.mailbox.lock();
        if mailbox.items.is_empty() {
            mailbox.scheduled = false;
            false
        } else {
            true
        }
    }
}

/// Handle to one client session. Clones refer to the same session.
#[derive(Clone)]
pub struct Session {
    core: Arc<SessionCore>,
}

impl Session {
    pub(crate) fn new(target: &str, handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            core: Arc::new(SessionCore {
                id: SessionId::new(),
                target: target.to_owned(),
                state: AtomicU8::new(SessionState::Connecting as u8),
                handler,
                outbound: Mutex::new(None),
                mailbox: Mutex::new(Mailbox::default()),
                close_reason: Mutex::new(None),
                cancel: CancellationToken::new(),
                registry: OnceLock::new(),
            }),
        }
    }

    pub(crate) fn from_core(core: Arc<SessionCore>) -> Self {
        Self { core }
    }

    pub(crate) fn core(&self) -> &Arc<SessionCore> {
        &self.core
    }

    /// Unique session id.
    pub fn id(&self) -> &SessionId {
        &self.core.id
    }

    /// URI this session connected to.
    pub fn target(&self) -> &str {
        &self.core.target
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.core.state()
    }

    /// Whether messages can be sent.
    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Reason the session ended, once closing has begun.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.core.close_reason.lock().clone()
    }

    /// Queue `payload` for the peer. Safe from handler callbacks.
    pub fn send(&self, payload: impl Into<Payload>) -> Result<(), ClientError> {
        let outbound = self.core.outbound.lock();
        match outbound.as_ref() {
            Some(tx) if self.is_open() => tx
                .send(Frame::Message(payload.into()))
                .map_err(|_| ClientError::SessionClosed(self.core.id.to_string())),
            _ => Err(ClientError::SessionClosed(self.core.id.to_string())),
        }
    }

    /// Close the session from the local side. `on_close` fires once, after
    /// any in-flight handler call for this session returns. Idempotent.
    pub fn close(&self) {
        let registry = self.core.registry.get().and_then(Weak::upgrade);
        if let Some(registry) = registry.filter(|r| r.get(&self.core.id).is_some()) {
            let _ = registry.on_close(&self.core.id, CloseReason::Normal);
        } else if self.core.begin_close(&CloseReason::Normal) {
            debug!(session_id = %self.core.id, "untracked session closed");
            self.core.set_state(SessionState::Closed);
        }
    }

    /// `Connecting -> Open` once the transport confirmed the upgrade.
    pub(crate) fn open(&self, outbound: mpsc::UnboundedSender<Frame>) -> bool {
        let mut slot = self.core.outbound.lock();
        if !self.core.transition(SessionState::Connecting, SessionState::Open) {
            return false;
        }
        *slot = Some(outbound);
        true
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

impl Eq for Session {}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.core.id)
            .field("target", &self.core.target)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    struct Silent;

    impl MessageHandler for Silent {
        fn on_message(&self, _session: &Session, _payload: Payload) -> anyhow::Result<Option<Payload>> {
            Ok(None)
        }
    }

    fn session() -> Session {
        Session::new("ws://h/e", Arc::new(Silent))
    }

    #[test]
    fn new_session_is_connecting_and_cannot_send() {
        let s = session();
        assert_eq!(s.state(), SessionState::Connecting);
        assert_matches!(s.send("hi"), Err(ClientError::SessionClosed(_)));
    }

    #[test]
    fn open_then_send_reaches_outbound_channel() {
        let s = session();
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(s.open(tx));
        assert!(s.is_open());
        s.send("hi").unwrap();
        assert_matches!(rx.try_recv(), Ok(Frame::Message(Payload::Text(t))) if t == "hi");
    }

    #[test]
    fn open_happens_once() {
        let s = session();
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(s.open(tx.clone()));
        assert!(!s.open(tx));
    }

    #[test]
    fn unregistered_close_sends_close_frame_and_cancels() {
        let s = session();
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(s.open(tx));
        s.close();
        s.close();
        assert_eq!(s.state(), SessionState::Closed);
        assert_eq!(s.close_reason(), Some(CloseReason::Normal));
        assert!(s.core().cancel.is_cancelled());
        assert_matches!(rx.try_recv(), Ok(Frame::Close));
        assert_matches!(rx.try_recv(), Err(_));
        assert_matches!(s.send("late"), Err(ClientError::SessionClosed(_)));
    }

    #[test]
    fn begin_close_has_a_single_winner() {
        let s = session();
        assert!(s.core().begin_close(&CloseReason::PeerClosed));
        assert!(!s.core().begin_close(&CloseReason::Normal));
        assert_eq!(s.close_reason(), Some(CloseReason::PeerClosed));
    }

    #[test]
    fn mailbox_refuses_messages_unless_open() {
        let s = session();
        assert_eq!(s.core().enqueue(MailboxItem::Message("x".into())), None);
        assert_eq!(s.core().enqueue(MailboxItem::Open), Some(true));
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(s.open(tx));
        assert_eq!(s.core().enqueue(MailboxItem::Message("a".into())), Some(false));
    }

    #[test]
    fn close_queues_behind_pending_messages() {
        let s = session();
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(s.open(tx));
        let core = s.core();
        let _ = core.enqueue(MailboxItem::Open);
        let _ = core.enqueue(MailboxItem::Message("a".into()));
        let _ = core.enqueue(MailboxItem::Message("b".into()));
        assert!(core.begin_close(&CloseReason::Normal));
        let (schedule, pending) = core.enqueue_close(CloseReason::Normal);
        assert!(!schedule, "drain was already scheduled");
        assert_eq!(pending, 2);
        assert_matches!(core.next_item(), Some(MailboxItem::Open));
        assert_matches!(core.next_item(), Some(MailboxItem::Message(Payload::Text(t))) if t == "a");
        assert_matches!(core.next_item(), Some(MailboxItem::Message(Payload::Text(t))) if t == "b");
        assert_matches!(core.next_item(), Some(MailboxItem::Close(CloseReason::Normal)));
        assert!(!core.has_more());
        assert_eq!(core.enqueue(MailboxItem::Message("late".into())), None);
    }

    #[test]
    fn close_reason_display() {
        assert_eq!(CloseReason::PeerClosed.to_string(), "peer closed");
        assert_eq!(
            CloseReason::TransportFailure("reset".into()).to_string(),
            "transport failure: reset"
        );
        assert_eq!(SessionState::Closing.to_string(), "closing");
    }
}
