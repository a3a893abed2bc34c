//! The pool ceiling bounds how many handlers run at once, over real
//! connections: with every handler blocked, exactly `max_pool_size`
//! messages are in delivery and the rest wait. Releasing them and closing
//! every session still delivers each waiting message before its close.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use ferrule_client::{
    ClientRuntime, ClientSettings, CloseReason, EndpointConfig, HandshakeValidator, MessageHandler,
    Payload, Session, ThreadPoolConfig,
};

use common::Gate;

const EXTRA_SESSIONS: usize = 10;

#[derive(Default)]
struct BlockingHandler {
    delivered: AtomicUsize,
    closed: AtomicUsize,
    gate: Gate,
}

impl MessageHandler for BlockingHandler {
    fn on_message(&self, _session: &Session, _payload: Payload) -> anyhow::Result<Option<Payload>> {
        let _ = self.delivered.fetch_add(1, Ordering::SeqCst);
        self.gate.wait();
        Ok(None)
    }

    fn on_close(&self, _session: &Session, _reason: &CloseReason) {
        let _ = self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

async fn run_saturation(pool: ThreadPoolConfig) {
    let max = pool.max_pool_size;
    let base = common::spawn_server(HandshakeValidator::default()).await;
    let mut settings = ClientSettings::with_pool(pool);
    settings.container.idle_timeout_ms = None;
    let rt = ClientRuntime::new(settings).unwrap();
    let handler = Arc::new(BlockingHandler::default());
    let endpoint = EndpointConfig::new(format!("{base}/echo"));

    let mut sessions = Vec::with_capacity(max + EXTRA_SESSIONS);
    for _ in 0..max + EXTRA_SESSIONS {
        let session = rt.connect(&endpoint, handler.clone()).await.unwrap();
        session.send("hi").unwrap();
        sessions.push(session);
    }

    assert!(
        common::wait_for(Duration::from_secs(10), || handler.delivered.load(Ordering::SeqCst) >= max).await,
        "pool never saturated"
    );
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(handler.delivered.load(Ordering::SeqCst), max);
    assert_eq!(rt.pool().active(), max);
    assert!(rt.pool().workers() <= max);

    handler.gate.release();
    for session in &sessions {
        session.close();
    }
    assert!(
        common::wait_for(Duration::from_secs(10), || {
            handler.closed.load(Ordering::SeqCst) == max + EXTRA_SESSIONS
        })
        .await,
        "not every session was notified of its close"
    );
    assert_eq!(
        handler.delivered.load(Ordering::SeqCst),
        max + EXTRA_SESSIONS,
        "queued messages were lost on close"
    );
    assert_eq!(rt.session_count(), 0);
    rt.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn default_pool_size_bounds_concurrent_handlers() {
    let pool = ThreadPoolConfig::default();
    assert!(pool.max_pool_size >= 20);
    run_saturation(pool).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn explicit_pool_size_bounds_concurrent_handlers() {
    run_saturation(ThreadPoolConfig::default().with_max_pool_size(15)).await;
}
