//! Live sessions and their dispatch onto the worker pool.
//!
//! Each session owns a mailbox. Routing a message appends to it and, when
//! no drain is already pending, submits one [`WorkUnit`]. A drain handles a
//! single item and resubmits itself while items remain, so a session never
//! occupies more than one worker and its callbacks stay in order, while
//! other sessions interleave fairly in the pool's FIFO queue.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use ferrule_core::{Payload, SessionId};
use metrics::{counter, gauge};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::pool::{WorkUnit, WorkerPool, panic_message};
use crate::session::{CloseReason, MailboxItem, Session, SessionCore, SessionState};

/// Maps session ids to live sessions and delivers their events.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<SessionCore>>,
    pool: Arc<WorkerPool>,
    opened: AtomicU64,
    closed: AtomicU64,
    emptied: Notify,
    this: Weak<SessionRegistry>,
}

impl SessionRegistry {
    /// Registry dispatching on `pool`.
    pub fn new(pool: Arc<WorkerPool>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            sessions: DashMap::new(),
            pool,
            opened: AtomicU64::new(0),
            closed: AtomicU64::new(0),
            emptied: Notify::new(),
            this: this.clone(),
        })
    }

    /// Pool handlers run on.
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Track `session` and schedule its `on_open` callback.
    pub fn register(&self, session: &Session) {
        let core = Arc::clone(session.core());
        let _ = core.registry.set(self.this.clone());
        let _ = self.sessions.insert(core.id.clone(), Arc::clone(&core));
        let _ = self.opened.fetch_add(1, Ordering::Relaxed);
        gauge!("ws_client_sessions_active").increment(1.0);
        debug!(session_id = %core.id, sessions = self.sessions.len(), "session registered");
        if core.enqueue(MailboxItem::Open) == Some(true) {
            self.schedule(&core);
        }
    }

    /// Stop tracking a session without running its close callbacks.
    pub fn unregister(&self, id: &SessionId) -> Option<Session> {
        let (_, core) = self.sessions.remove(id)?;
        gauge!("ws_client_sessions_active").decrement(1.0);
        debug!(session_id = %id, "session unregistered");
        if self.sessions.is_empty() {
            self.emptied.notify_waiters();
        }
        Some(Session::from_core(core))
    }

    /// Deliver an inbound message to its session's handler. Returns `false`
    /// (and does nothing) when the session is unknown or not open.
    pub fn route(&self, id: &SessionId, payload: Payload) -> bool {
        let Some(core) = self.core(id) else {
            debug!(session_id = %id, "message for unknown session dropped");
            return false;
        };
        match core.enqueue(MailboxItem::Message(payload)) {
            None => {
                debug!(session_id = %id, state = %core.state(), "message for inactive session dropped");
                false
            }
            Some(schedule) => {
                if schedule {
                    self.schedule(&core);
                }
                true
            }
        }
    }

    /// Begin closing a session. The first call per session wins; its
    /// `reason` is the one `on_close` sees, after any in-flight callback
    /// returns. Later calls return `false`.
    pub fn on_close(&self, id: &SessionId, reason: CloseReason) -> bool {
        let Some(core) = self.core(id) else {
            return false;
        };
        if !core.begin_close(&reason) {
            debug!(session_id = %id, "close already in progress");
            return false;
        }
        debug!(session_id = %id, reason = %reason, "session closing");
        let (schedule, pending) = core.enqueue_close(reason);
        if pending > 0 {
            debug!(session_id = %id, pending, "close queued behind pending messages");
        }
        if schedule {
            self.schedule(&core);
        }
        true
    }

    /// Close every live session with `reason`. Returns how many closes this
    /// call initiated.
    pub fn close_all(&self, reason: &CloseReason) -> usize {
        self.ids()
            .iter()
            .filter(|id| self.on_close(id, reason.clone()))
            .count()
    }

    /// Wait until no session is registered.
    pub async fn wait_empty(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let emptied = self.emptied.notified();
                if self.sessions.is_empty() {
                    return;
                }
                emptied.await;
            }
        })
        .await
        .is_ok()
    }

    /// Handle for a live session.
    pub fn get(&self, id: &SessionId) -> Option<Session> {
        self.core(id).map(Session::from_core)
    }

    /// Ids of live sessions.
    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is live.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Sessions ever registered.
    pub fn opened_total(&self) -> u64 {
        self.opened.load(Ordering::Relaxed)
    }

    /// Sessions whose `on_close` has run.
    pub fn closed_total(&self) -> u64 {
        self.closed.load(Ordering::Relaxed)
    }

    fn core(&self, id: &SessionId) -> Option<Arc<SessionCore>> {
        self.sessions.get(id).map(|e| Arc::clone(e.value()))
    }

    fn schedule(&self, core: &Arc<SessionCore>) {
        let session = Arc::downgrade(core);
        let registry = self.this.clone();
        let unit = WorkUnit::for_session(core.id.clone(), move || drain(&session, &registry));
        if let Err(err) = self.pool.submit(unit) {
            warn!(session_id = %core.id, error = %err, "pool unavailable, finishing session inline");
            self.drain_inline(core);
        }
    }

    /// With the pool gone only closes still matter.
    fn drain_inline(&self, core: &Arc<SessionCore>) {
        while let Some(item) = core.next_item() {
            match item {
                MailboxItem::Close(reason) => self.finish_close(core, &reason),
                MailboxItem::Open | MailboxItem::Message(_) => {
                    debug!(session_id = %core.id, "event dropped, pool shut down");
                }
            }
        }
    }

    fn finish_close(&self, core: &Arc<SessionCore>, reason: &CloseReason) {
        notify_close(core, reason);
        if self.sessions.remove(&core.id).is_some() {
            gauge!("ws_client_sessions_active").decrement(1.0);
        }
        let _ = self.closed.fetch_add(1, Ordering::Relaxed);
        info!(session_id = %core.id, reason = %reason, "session closed");
        if self.sessions.is_empty() {
            self.emptied.notify_waiters();
        }
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.sessions.len())
            .field("opened", &self.opened_total())
            .field("closed", &self.closed_total())
            .finish_non_exhaustive()
    }
}

/// Handle one mailbox item for a session, then resubmit if more wait.
fn drain(session: &Weak<SessionCore>, registry: &Weak<SessionRegistry>) {
    let Some(core) = session.upgrade() else {
        return;
    };
    let Some(item) = core.next_item() else {
        return;
    };
    handle(&core, item, registry);
    if core.has_more() {
        match registry.upgrade() {
            Some(registry) => registry.schedule(&core),
            None => {
                debug!(session_id = %core.id, "registry dropped, finishing session on this worker");
                while let Some(item) = core.next_item() {
                    handle(&core, item, registry);
                }
            }
        }
    }
}

fn handle(core: &Arc<SessionCore>, item: MailboxItem, registry: &Weak<SessionRegistry>) {
    match item {
        MailboxItem::Open => open(core),
        MailboxItem::Message(payload) => deliver(core, payload),
        MailboxItem::Close(reason) => match registry.upgrade() {
            Some(registry) => registry.finish_close(core, &reason),
            None => notify_close(core, &reason),
        },
    }
}

/// Run `on_close` and mark the session `Closed`.
fn notify_close(core: &Arc<SessionCore>, reason: &CloseReason) {
    let session = Session::from_core(Arc::clone(core));
    if let Err(payload) =
        panic::catch_unwind(AssertUnwindSafe(|| core.handler.on_close(&session, reason)))
    {
        error!(session_id = %core.id, panic = %panic_message(payload.as_ref()), "on_close panicked");
    }
    core.set_state(SessionState::Closed);
}

fn open(core: &Arc<SessionCore>) {
    let session = Session::from_core(Arc::clone(core));
    if let Err(payload) =
        panic::catch_unwind(AssertUnwindSafe(|| core.handler.on_open(&session)))
    {
        error!(session_id = %core.id, panic = %panic_message(payload.as_ref()), "on_open panicked");
    }
}

/// Messages queued before a close are still delivered while `Closing`.
fn deliver(core: &Arc<SessionCore>, payload: Payload) {
    let session = Session::from_core(Arc::clone(core));
    let handler = Arc::clone(&core.handler);
    let result = panic::catch_unwind(AssertUnwindSafe(|| handler.on_message(&session, payload)));
    let err = match result {
        Ok(Ok(Some(reply))) => {
            if let Err(err) = session.send(reply) {
                debug!(session_id = %core.id, error = %err, "reply dropped");
            }
            return;
        }
        Ok(Ok(None)) => return,
        Ok(Err(err)) => {
            warn!(session_id = %core.id, error = %err, "message handler failed");
            err
        }
        Err(panic) => {
            let detail = panic_message(panic.as_ref());
            error!(session_id = %core.id, panic = %detail, "message handler panicked");
            anyhow::anyhow!("message handler panicked: {detail}")
        }
    };
    counter!("ws_client_handler_errors_total").increment(1);
    if let Err(payload) =
        panic::catch_unwind(AssertUnwindSafe(|| handler.on_error(&session, &err)))
    {
        error!(session_id = %core.id, panic = %panic_message(payload.as_ref()), "on_error panicked");
    }
}
