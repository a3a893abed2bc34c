//! Bounded worker pool that runs handler invocations.
//!
//! Workers are OS threads so a blocking handler never stalls the async I/O
//! tasks. At most `max_pool_size` workers exist at once; surplus work waits
//! in an unbounded FIFO queue. Workers are spawned on demand and exit after
//! `idle_timeout` without work.

use std::any::Any;
use std::cell::Cell;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use ferrule_core::SessionId;
use ferrule_settings::ThreadPoolConfig;
use metrics::gauge;
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::errors::ClientError;

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    /// Pool whose worker is running on this thread, 0 if none.
    static CURRENT_POOL: Cell<usize> = const { Cell::new(0) };
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Starts a named worker thread running the given body.
type Spawner = fn(String, Job) -> io::Result<()>;

fn spawn_thread(name: String, body: Job) -> io::Result<()> {
    std::thread::Builder::new().name(name).spawn(body).map(drop)
}

/// One task for the pool, optionally tagged with the session it serves.
pub struct WorkUnit {
    session_id: Option<SessionId>,
    job: Job,
}

impl WorkUnit {
    /// Untagged unit.
    pub fn new(job: impl FnOnce() + Send + 'static) -> Self {
        Self {
            session_id: None,
            job: Box::new(job),
        }
    }

    /// Unit working on behalf of `session_id`.
    pub fn for_session(session_id: SessionId, job: impl FnOnce() + Send + 'static) -> Self {
        Self {
            session_id: Some(session_id),
            job: Box::new(job),
        }
    }

    /// Session this unit serves, if any.
    pub fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }
}

impl fmt::Debug for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkUnit")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

/// Point-in-time pool counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    /// Configured ceiling.
    pub max_pool_size: usize,
    /// Live worker threads.
    pub workers: usize,
    /// Workers parked waiting for work.
    pub idle: usize,
    /// Units currently executing.
    pub active: usize,
    /// Units waiting for a worker.
    pub queued: usize,
    /// Units finished (including ones that panicked).
    pub completed: u64,
    /// Units that panicked.
    pub panicked: u64,
    /// Whether [`WorkerPool::shutdown`] has been called.
    pub shutdown: bool,
}

struct PoolState {
    queue: VecDeque<WorkUnit>,
    workers: usize,
    idle: usize,
    active: usize,
    spawned: u64,
    completed: u64,
    panicked: u64,
    shutdown: bool,
}

struct Shared {
    id: usize,
    name: String,
    config: ThreadPoolConfig,
    spawner: Spawner,
    state: Mutex<PoolState>,
    work_available: Condvar,
    terminated: Condvar,
}

/// Bounded pool of worker threads with an unbounded FIFO queue.
pub struct WorkerPool {
    shared: Arc<Shared>,
}

impl WorkerPool {
    /// Pool named `ferrule-worker`.
    pub fn new(config: &ThreadPoolConfig) -> Result<Self, ClientError> {
        Self::named("ferrule-worker", config)
    }

    /// Pool whose threads are named `{name}-{n}`.
    pub fn named(name: impl Into<String>, config: &ThreadPoolConfig) -> Result<Self, ClientError> {
        Self::with_spawner(name.into(), config, spawn_thread)
    }

    fn with_spawner(name: String, config: &ThreadPoolConfig, spawner: Spawner) -> Result<Self, ClientError> {
        config.validate()?;
        debug!(
            pool = %name,
            max_pool_size = config.max_pool_size,
            idle_timeout_ms = config.idle_timeout_ms,
            "worker pool created"
        );
        Ok(Self {
            shared: Arc::new(Shared {
                id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
                name,
                config: config.clone(),
                spawner,
                state: Mutex::new(PoolState {
                    queue: VecDeque::new(),
                    workers: 0,
                    idle: 0,
                    active: 0,
                    spawned: 0,
                    completed: 0,
                    panicked: 0,
                    shutdown: false,
                }),
                work_available: Condvar::new(),
                terminated: Condvar::new(),
            }),
        })
    }

    /// Queue `unit`, starting a worker if none is free and the ceiling
    /// allows. Never blocks on pool capacity.
    ///
    /// Fails with [`ClientError::WorkerSpawn`] only when a thread could not
    /// be started and no worker is left to run `unit`; the unit is then not
    /// queued. A later submit retries the spawn.
    pub fn submit(&self, unit: WorkUnit) -> Result<(), ClientError> {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return Err(ClientError::PoolShutdown);
        }
        state.queue.push_back(unit);
        if state.queue.len() > state.idle && state.workers < self.shared.config.max_pool_size {
            // Spawned under the lock so a failure can take back this unit.
            state.spawned += 1;
            let name = format!("{}-{}", self.shared.name, state.spawned);
            let shared = Arc::clone(&self.shared);
            match (self.shared.spawner)(name, Box::new(move || worker_loop(&shared))) {
                Ok(()) => state.workers += 1,
                Err(err) if state.workers == 0 => {
                    let _ = state.queue.pop_back();
                    error!(pool = %self.shared.name, error = %err, "failed to spawn worker thread, unit rejected");
                    return Err(ClientError::WorkerSpawn(err.to_string()));
                }
                Err(err) => {
                    warn!(pool = %self.shared.name, error = %err, workers = state.workers, "failed to spawn extra worker thread");
                }
            }
        }
        drop(state);
        let _ = self.shared.work_available.notify_one();
        Ok(())
    }

    /// Stop accepting work. Queued and running units still complete, then
    /// the workers exit. Idempotent, non-blocking, and safe to call from
    /// inside a running unit.
    pub fn shutdown(&self) {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return;
        }
        state.shutdown = true;
        let (queued, active) = (state.queue.len(), state.active);
        drop(state);
        let _ = self.shared.work_available.notify_all();
        debug!(pool = %self.shared.name, queued, active, "worker pool shutting down");
    }

    /// Block until every worker thread has exited or `timeout` elapses.
    ///
    /// Returns `false` on timeout, and immediately when called from one of
    /// this pool's own workers (which could never observe its own exit).
    pub fn await_termination(&self, timeout: Duration) -> bool {
        if CURRENT_POOL.with(Cell::get) == self.shared.id {
            warn!(pool = %self.shared.name, "await_termination called from a worker of the same pool");
            return false;
        }
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while state.workers > 0 {
            if self.shared.terminated.wait_until(&mut state, deadline).timed_out() {
                return state.workers == 0;
            }
        }
        true
    }

    /// Units executing right now.
    pub fn active(&self) -> usize {
        self.shared.state.lock().active
    }

    /// Units waiting for a worker.
    pub fn queued(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Live worker threads.
    pub fn workers(&self) -> usize {
        self.shared.state.lock().workers
    }

    /// Configured ceiling.
    pub fn max_pool_size(&self) -> usize {
        self.shared.config.max_pool_size
    }

    /// Pool name (thread name prefix).
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shutdown(&self) -> bool {
        self.shared.state.lock().shutdown
    }

    /// Whether the calling thread is one of this pool's workers.
    pub fn is_worker_thread(&self) -> bool {
        CURRENT_POOL.with(Cell::get) == self.shared.id
    }

    /// Snapshot of every counter.
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            max_pool_size: self.shared.config.max_pool_size,
            workers: state.workers,
            idle: state.idle,
            active: state.active,
            queued: state.queue.len(),
            completed: state.completed,
            panicked: state.panicked,
            shutdown: state.shutdown,
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.shared.name)
            .field("stats", &self.stats())
            .finish()
    }
}

fn worker_loop(shared: &Shared) {
    CURRENT_POOL.with(|c| c.set(shared.id));
    let idle_timeout = shared.config.idle_timeout();
    let mut state = shared.state.lock();
    loop {
        if let Some(unit) = state.queue.pop_front() {
            state.active += 1;
            gauge!("ws_client_pool_active").increment(1.0);
            let ok = MutexGuard::unlocked(&mut state, || run_unit(shared, unit));
            gauge!("ws_client_pool_active").decrement(1.0);
            state.active -= 1;
            state.completed += 1;
            if !ok {
                state.panicked += 1;
            }
            continue;
        }
        if state.shutdown {
            break;
        }
        state.idle += 1;
        let timed_out = shared.work_available.wait_for(&mut state, idle_timeout).timed_out();
        state.idle -= 1;
        if timed_out && state.queue.is_empty() && !state.shutdown {
            debug!(pool = %shared.name, "idle worker reclaimed");
            break;
        }
    }
    state.workers -= 1;
    if state.workers == 0 {
        let _ = shared.terminated.notify_all();
    }
    drop(state);
    CURRENT_POOL.with(|c| c.set(0));
}

fn run_unit(shared: &Shared, unit: WorkUnit) -> bool {
    let WorkUnit { session_id, job } = unit;
    match panic::catch_unwind(AssertUnwindSafe(job)) {
        Ok(()) => true,
        Err(payload) => {
            error!(
                pool = %shared.name,
                session_id = ?session_id,
                panic = %panic_message(payload.as_ref()),
                "work unit panicked"
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc;

    fn config(max: usize, idle_ms: u64) -> ThreadPoolConfig {
        ThreadPoolConfig::default()
            .with_max_pool_size(max)
            .with_idle_timeout(Duration::from_millis(idle_ms))
    }

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    /// Latch that blocks callers until opened.
    #[derive(Default)]
    struct Gate {
        open: Mutex<bool>,
        cv: Condvar,
    }

    impl Gate {
        fn wait(&self) {
            let mut open = self.open.lock();
            while !*open {
                self.cv.wait(&mut open);
            }
        }

        fn release(&self) {
            *self.open.lock() = true;
            let _ = self.cv.notify_all();
        }
    }

    #[test]
    fn concurrency_never_exceeds_ceiling() {
        let pool = WorkerPool::new(&config(4, 10_000)).unwrap();
        let gate = Arc::new(Gate::default());
        let started = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let gate = Arc::clone(&gate);
            let started = Arc::clone(&started);
            pool.submit(WorkUnit::new(move || {
                let _ = started.fetch_add(1, Ordering::SeqCst);
                gate.wait();
            }))
            .unwrap();
        }

        assert!(wait_until(Duration::from_secs(5), || pool.active() == 4));
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(started.load(Ordering::SeqCst), 4);
        assert_eq!(pool.active(), 4);
        assert_eq!(pool.queued(), 6);
        assert_eq!(pool.workers(), 4);

        gate.release();
        assert!(wait_until(Duration::from_secs(5), || pool.stats().completed == 10));
        assert_eq!(started.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn single_worker_runs_in_submission_order() {
        let pool = WorkerPool::new(&config(1, 10_000)).unwrap();
        let (tx, rx) = mpsc::channel();
        for i in 0..50 {
            let tx = tx.clone();
            pool.submit(WorkUnit::new(move || tx.send(i).unwrap())).unwrap();
        }
        let seen: Vec<i32> = (0..50)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(seen, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn idle_workers_are_reclaimed() {
        let pool = WorkerPool::new(&config(3, 50)).unwrap();
        for _ in 0..3 {
            pool.submit(WorkUnit::new(|| std::thread::sleep(Duration::from_millis(20))))
                .unwrap();
        }
        assert!(wait_until(Duration::from_secs(5), || pool.stats().completed == 3));
        assert!(wait_until(Duration::from_secs(5), || pool.workers() == 0));

        let (tx, rx) = mpsc::channel();
        pool.submit(WorkUnit::new(move || tx.send(()).unwrap())).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn shutdown_is_idempotent_and_rejects_new_work() {
        let pool = WorkerPool::new(&config(2, 10_000)).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let ran = Arc::clone(&ran);
            pool.submit(WorkUnit::new(move || {
                std::thread::sleep(Duration::from_millis(10));
                let _ = ran.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }
        pool.shutdown();
        pool.shutdown();
        assert!(pool.is_shutdown());
        assert_matches!(
            pool.submit(WorkUnit::new(|| {})),
            Err(ClientError::PoolShutdown)
        );
        assert!(pool.await_termination(Duration::from_secs(5)));
        assert_eq!(ran.load(Ordering::SeqCst), 5, "queued work drains on shutdown");
        assert_eq!(pool.workers(), 0);
    }

    #[test]
    fn shutdown_from_inside_a_unit_does_not_deadlock() {
        let pool = Arc::new(WorkerPool::new(&config(2, 10_000)).unwrap());
        let (tx, rx) = mpsc::channel();
        let inner = Arc::clone(&pool);
        pool.submit(WorkUnit::new(move || {
            inner.shutdown();
            inner.shutdown();
            let waited = inner.await_termination(Duration::from_secs(5));
            tx.send(waited).unwrap();
        }))
        .unwrap();
        let waited = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(!waited, "a worker cannot wait for its own pool");
        assert!(pool.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn panicking_unit_does_not_kill_the_pool() {
        let pool = WorkerPool::new(&config(1, 10_000)).unwrap();
        pool.submit(WorkUnit::new(|| panic!("boom"))).unwrap();
        let (tx, rx) = mpsc::channel();
        pool.submit(WorkUnit::new(move || tx.send(42).unwrap())).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
        assert!(wait_until(Duration::from_secs(5), || pool.stats().panicked == 1));
    }

    #[test]
    fn worker_threads_know_their_pool() {
        let pool = Arc::new(WorkerPool::named("relay", &config(1, 10_000)).unwrap());
        assert!(!pool.is_worker_thread());
        let inside = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();
        let (p, flag) = (Arc::clone(&pool), Arc::clone(&inside));
        pool.submit(WorkUnit::new(move || {
            flag.store(p.is_worker_thread(), Ordering::SeqCst);
            let name = std::thread::current().name().map(str::to_owned);
            tx.send(name).unwrap();
        }))
        .unwrap();
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(inside.load(Ordering::SeqCst));
        assert_eq!(name.as_deref(), Some("relay-1"));
    }

    #[test]
    fn invalid_config_is_rejected() {
        assert_matches!(
            WorkerPool::new(&config(0, 10)),
            Err(ClientError::Settings(_))
        );
    }

    #[test]
    fn work_units_carry_session_tags() {
        let id = SessionId::from("sess_a");
        let unit = WorkUnit::for_session(id.clone(), || {});
        assert_eq!(unit.session_id(), Some(&id));
        assert!(WorkUnit::new(|| {}).session_id().is_none());
    }

    fn refuse_threads(_name: String, _body: Job) -> io::Result<()> {
        Err(io::Error::other("thread limit reached"))
    }

    #[test]
    fn spawn_failure_without_workers_rejects_the_unit() {
        let pool = WorkerPool::with_spawner("starved".into(), &config(2, 1_000), refuse_threads).unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let err = pool
            .submit(WorkUnit::new(move || flag.store(true, Ordering::SeqCst)))
            .unwrap_err();
        assert_matches!(err, ClientError::WorkerSpawn(msg) if msg.contains("thread limit"));
        assert_eq!(pool.queued(), 0);
        assert_eq!(pool.workers(), 0);
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn spawn_failure_with_a_live_worker_keeps_the_unit_queued() {
        static SPAWNS: AtomicUsize = AtomicUsize::new(0);
        fn first_only(name: String, body: Job) -> io::Result<()> {
            if SPAWNS.fetch_add(1, Ordering::SeqCst) == 0 {
                spawn_thread(name, body)
            } else {
                refuse_threads(name, body)
            }
        }

        let pool = WorkerPool::with_spawner("thin".into(), &config(3, 10_000), first_only).unwrap();
        let gate = Arc::new(Gate::default());
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let (gate, done) = (Arc::clone(&gate), Arc::clone(&done));
            pool.submit(WorkUnit::new(move || {
                gate.wait();
                let _ = done.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }
        assert_eq!(pool.workers(), 1);
        gate.release();
        assert!(wait_until(Duration::from_secs(5), || done.load(Ordering::SeqCst) == 3));
    }
}
