//! Client runtime (container): owns the worker pool and the session
//! registry, establishes connections, and tears itself down when idle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use ferrule_core::RuntimeId;
use ferrule_settings::ClientSettings;
use futures::{SinkExt, StreamExt};
use metrics::counter;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, instrument, warn};

use crate::endpoint::EndpointConfig;
use crate::errors::ClientError;
use crate::handshake::HandshakeOutcome;
use crate::pool::{PoolStats, WorkerPool};
use crate::registry::SessionRegistry;
use crate::session::{CloseReason, MessageHandler, Session};
use crate::transport::{Connection, Frame, Transport, WsTransport};

/// How long [`ClientRuntime::shutdown`] waits for sessions to finish closing.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Connects sessions and dispatches their traffic onto a bounded pool.
///
/// Cheap to clone; clones share one runtime.
#[derive(Clone)]
pub struct ClientRuntime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    id: RuntimeId,
    settings: ClientSettings,
    transport: Arc<dyn Transport>,
    registry: Arc<SessionRegistry>,
    cancel: CancellationToken,
    closed: AtomicBool,
    connecting: AtomicUsize,
    watchdog_started: AtomicBool,
}

impl RuntimeInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn pool(&self) -> &WorkerPool {
        self.registry.pool()
    }

    /// No sessions, no handshakes in flight, no pending or running work.
    fn is_idle(&self) -> bool {
        self.registry.is_empty()
            && self.connecting.load(Ordering::SeqCst) == 0
            && self.pool().active() == 0
            && self.pool().queued() == 0
    }

    /// Mark closed and close every session. `false` if already closed.
    fn begin_teardown(&self, reason: &CloseReason) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let closing = self.registry.close_all(reason);
        debug!(runtime_id = %self.id, closing, reason = %reason, "runtime closing sessions");
        true
    }

    fn finish_teardown(&self) {
        self.pool().shutdown();
        self.cancel.cancel();
    }
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Decrements the in-flight handshake count when the connect attempt ends.
struct ConnectingGuard<'a>(&'a AtomicUsize);

impl<'a> ConnectingGuard<'a> {
    fn new(count: &'a AtomicUsize) -> Self {
        let _ = count.fetch_add(1, Ordering::SeqCst);
        Self(count)
    }
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        let _ = self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ClientRuntime {
    /// Runtime speaking WebSocket over `tokio-tungstenite`.
    pub fn new(settings: ClientSettings) -> Result<Self, ClientError> {
        Self::with_transport(settings, Arc::new(WsTransport))
    }

    /// Runtime using a custom transport.
    pub fn with_transport(
        settings: ClientSettings,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ClientError> {
        settings.validate()?;
        let pool = Arc::new(WorkerPool::new(&settings.pool)?);
        let id = RuntimeId::new();
        info!(
            runtime_id = %id,
            max_pool_size = settings.pool.max_pool_size,
            shared = settings.container.shared,
            idle_timeout_ms = ?settings.container.idle_timeout().map(|d| d.as_millis()),
            "client runtime created"
        );
        Ok(Self {
            inner: Arc::new(RuntimeInner {
                id,
                registry: SessionRegistry::new(pool),
                settings,
                transport,
                cancel: CancellationToken::new(),
                closed: AtomicBool::new(false),
                connecting: AtomicUsize::new(0),
                watchdog_started: AtomicBool::new(false),
            }),
        })
    }

    /// Connect to `endpoint`, delivering the session's events to `handler`.
    ///
    /// The endpoint's origin policy runs first; a refusal fails with
    /// [`ClientError::HandshakeRejected`] before any network traffic and no
    /// handler callback runs. On success the session is open, registered,
    /// and `on_open` has been scheduled.
    #[instrument(skip_all, fields(runtime_id = %self.inner.id, uri = endpoint.uri()))]
    pub async fn connect(
        &self,
        endpoint: &EndpointConfig,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Session, ClientError> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(ClientError::RuntimeClosed);
        }
        let _connecting = ConnectingGuard::new(&inner.connecting);
        self.ensure_watchdog();

        let request = endpoint.handshake_request();
        let session = match endpoint.validator().validate(&request, handler) {
            HandshakeOutcome::Accepted(session) => session,
            HandshakeOutcome::Rejected(rejection) => {
                counter!("ws_client_handshake_rejections_total").increment(1);
                return Err(rejection.into());
            }
        };

        let timeout = inner.settings.handshake_timeout();
        let connection = match tokio::time::timeout(timeout, inner.transport.open(&request)).await {
            Ok(Ok(connection)) => connection,
            Ok(Err(err)) => {
                if err.is_rejection() {
                    counter!("ws_client_handshake_rejections_total").increment(1);
                    info!(status = ?err.status(), "peer rejected handshake");
                } else {
                    warn!(error = %err, "handshake failed");
                }
                return Err(err);
            }
            Err(_) => {
                warn!(?timeout, "handshake timed out");
                return Err(ClientError::HandshakeTimeout(timeout));
            }
        };

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        if !session.open(outbound_tx) {
            return Err(ClientError::SessionClosed(session.id().to_string()));
        }
        inner.registry.register(&session);
        if inner.is_closed() {
            let _ = inner.registry.on_close(session.id(), CloseReason::Shutdown);
            return Err(ClientError::RuntimeClosed);
        }
        self.spawn_io(&session, connection, outbound_rx);

        counter!("ws_client_connections_total").increment(1);
        info!(session_id = %session.id(), "session opened");
        Ok(session)
    }

    /// One writer task draining the outbound channel into the sink, one
    /// reader task routing inbound frames to the registry.
    fn spawn_io(
        &self,
        session: &Session,
        connection: Connection,
        mut outbound: mpsc::UnboundedReceiver<Frame>,
    ) {
        let Connection { mut sink, mut stream } = connection;
        let span = info_span!("session_io", session_id = %session.id());

        let _writer = tokio::spawn(
            async move {
                while let Some(frame) = outbound.recv().await {
                    let closing = matches!(frame, Frame::Close);
                    if let Err(err) = sink.send(frame).await {
                        debug!(error = %err, "outbound send failed");
                        break;
                    }
                    if closing {
                        break;
                    }
                }
                let _ = sink.close().await;
            }
            .instrument(span.clone()),
        );

        let registry = Arc::clone(&self.inner.registry);
        let session_id = session.id().clone();
        let session_cancel = session.core().cancel.clone();
        let runtime_cancel = self.inner.cancel.clone();
        let _reader = tokio::spawn(
            async move {
                let reason = loop {
                    tokio::select! {
                        () = session_cancel.cancelled() => break None,
                        () = runtime_cancel.cancelled() => break Some(CloseReason::Shutdown),
                        frame = stream.next() => match frame {
                            Some(Ok(Frame::Message(payload))) => {
                                let _ = registry.route(&session_id, payload);
                            }
                            Some(Ok(Frame::Close)) | None => break Some(CloseReason::PeerClosed),
                            Some(Err(err)) => {
                                warn!(error = %err, "transport failed");
                                break Some(CloseReason::TransportFailure(err.to_string()));
                            }
                        },
                    }
                };
                if let Some(reason) = reason {
                    let _ = registry.on_close(&session_id, reason);
                }
            }
            .instrument(span),
        );
    }

    /// Start the idle watchdog once, if the container has an idle timeout.
    fn ensure_watchdog(&self) {
        let Some(idle_timeout) = self.inner.settings.container.idle_timeout() else {
            return;
        };
        if self.inner.watchdog_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::downgrade(&self.inner);
        let cancel = self.inner.cancel.clone();
        let tick = (idle_timeout / 4).clamp(Duration::from_millis(10), Duration::from_secs(1));
        let _watchdog = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            let mut idle_since: Option<Instant> = None;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                if !inner.is_idle() {
                    idle_since = None;
                    continue;
                }
                let since = *idle_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= idle_timeout {
                    if inner.begin_teardown(&CloseReason::IdleTimeout) {
                        info!(runtime_id = %inner.id, ?idle_timeout, "runtime idle, torn down");
                        inner.finish_teardown();
                    }
                    break;
                }
            }
        });
    }

    /// Close every session, wait for their `on_close` callbacks, then stop
    /// the pool. Idempotent; later [`connect`](Self::connect) calls fail
    /// with [`ClientError::RuntimeClosed`].
    pub async fn shutdown(&self) {
        self.shutdown_with_timeout(DEFAULT_SHUTDOWN_TIMEOUT).await;
    }

    /// [`shutdown`](Self::shutdown) with an explicit bound on the wait for
    /// sessions to close.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) {
        let inner = &self.inner;
        if !inner.begin_teardown(&CloseReason::Shutdown) {
            debug!(runtime_id = %inner.id, "runtime already closed");
            return;
        }
        if !inner.registry.wait_empty(timeout).await {
            warn!(
                runtime_id = %inner.id,
                remaining = inner.registry.len(),
                "sessions still closing after {timeout:?}"
            );
        }
        inner.finish_teardown();
        info!(runtime_id = %inner.id, "client runtime shut down");
    }

    /// Runtime id.
    pub fn id(&self) -> &RuntimeId {
        &self.inner.id
    }

    /// Settings the runtime was built with.
    pub fn settings(&self) -> &ClientSettings {
        &self.inner.settings
    }

    /// The worker pool.
    pub fn pool(&self) -> &WorkerPool {
        self.inner.pool()
    }

    /// Pool counters.
    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool().stats()
    }

    /// The session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.inner.registry
    }

    /// Live sessions.
    pub fn session_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Whether the runtime was shut down or idled out.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

impl std::fmt::Debug for ClientRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRuntime")
            .field("id", &self.inner.id)
            .field("sessions", &self.session_count())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
