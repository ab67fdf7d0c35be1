//! Session pool: warm turn controllers keyed by caller identity.
//!
//! ```text
//! slots: Mutex<HashMap<IdentityKey, Arc<SessionSlot>>>   lookup / insert / remove only
//!            │
//!            └─► SessionSlot { controller: Mutex<Option<TurnController>>, last_used, evicted }
//!                   ├─ acquire(): locks the slot, builds the controller lazily
//!                   └─ sweep():   try_lock, so a slot in use is skipped
//! ```
//!
//! The map lock is never held across controller construction, a turn or a
//! shutdown. A slot removed by the sweep is flagged `evicted` before its
//! controller is stopped; an `acquire` that raced with the sweep sees the flag
//! after locking and retries with a fresh slot.

pub mod coordinator;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ChorusError, Result};
use crate::ipc::{EventBus, TurnStatusEvent};
use crate::turn::TurnController;
use crate::worker;

pub use coordinator::{ChunkAck, Coordinator};

/// Caller identity a session is kept warm for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityKey {
    pub teacher_id: String,
    pub student_id: String,
}

impl IdentityKey {
    pub fn new(teacher_id: impl Into<String>, student_id: impl Into<String>) -> Self {
        Self {
            teacher_id: teacher_id.into(),
            student_id: student_id.into(),
        }
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.teacher_id, self.student_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PoolConfig {
    /// Sessions unused for longer than this are stopped and removed. Default: 600 s.
    pub idle_threshold_secs: u64,
    /// Period of the background sweep. Default: 60 s.
    pub sweep_interval_secs: u64,
    /// Upper bound on warm sessions; the least recently used idle one is
    /// evicted to make room. `None` means unbounded.
    pub max_sessions: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_threshold_secs: 600,
            sweep_interval_secs: 60,
            max_sessions: None,
        }
    }
}

impl PoolConfig {
    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_threshold_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Builds the (expensive) controller for a new session.
pub type ControllerFactory = Box<dyn Fn(&IdentityKey) -> Result<TurnController> + Send + Sync>;

struct SessionSlot {
    key: IdentityKey,
    controller: Mutex<Option<TurnController>>,
    last_used: Mutex<Instant>,
    evicted: AtomicBool,
}

impl SessionSlot {
    fn new(key: IdentityKey) -> Self {
        Self {
            key,
            controller: Mutex::new(None),
            last_used: Mutex::new(Instant::now()),
            evicted: AtomicBool::new(false),
        }
    }

    fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_used.lock().elapsed()
    }
}

struct PoolInner {
    config: PoolConfig,
    factory: ControllerFactory,
    events: EventBus,
    slots: Mutex<HashMap<IdentityKey, Arc<SessionSlot>>>,
}

impl PoolInner {
    /// Find or insert the slot for `key`. Returns a capacity victim that was
    /// already unlinked from the map and still has to be stopped.
    fn slot_for(&self, key: &IdentityKey) -> (Arc<SessionSlot>, Option<Arc<SessionSlot>>) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get(key) {
            return (Arc::clone(slot), None);
        }

        let mut victim = None;
        if let Some(max) = self.config.max_sessions {
            if slots.len() >= max {
                victim = slots
                    .values()
                    .filter(|s| s.controller.try_lock().is_some())
                    .max_by_key(|s| s.idle_for())
                    .cloned();
                match victim.as_ref() {
                    Some(v) => {
                        v.evicted.store(true, Ordering::SeqCst);
                        slots.remove(&v.key);
                    }
                    None => warn!(max, "session pool full and every session is busy"),
                }
            }
        }

        let slot = Arc::new(SessionSlot::new(key.clone()));
        slots.insert(key.clone(), Arc::clone(&slot));
        (slot, victim)
    }

    /// Stop the controller of a slot that is already unlinked and flagged.
    fn retire(&self, slot: &SessionSlot, reason: &str) {
        let idle_secs = slot.idle_for().as_secs();
        if let Some(mut controller) = slot.controller.lock().take() {
            controller.shutdown();
        }
        info!(identity = %slot.key, idle_secs, reason, "session evicted");
        self.events.emit(TurnStatusEvent::SessionEvicted {
            identity: slot.key.to_string(),
            idle_secs,
        });
    }

    fn unlink(&self, slot: &Arc<SessionSlot>) {
        let mut slots = self.slots.lock();
        if slots.get(&slot.key).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            slots.remove(&slot.key);
        }
    }

    fn sweep(&self, threshold: Duration) -> usize {
        let candidates: Vec<Arc<SessionSlot>> = self.slots.lock().values().cloned().collect();
        let mut evicted = 0;
        for slot in candidates {
            let Some(mut guard) = slot.controller.try_lock() else {
                debug!(identity = %slot.key, "session busy; sweep skips it");
                continue;
            };
            let idle = slot.idle_for();
            if idle < threshold {
                continue;
            }
            slot.evicted.store(true, Ordering::SeqCst);
            self.unlink(&slot);
            if let Some(mut controller) = guard.take() {
                controller.shutdown();
            }
            drop(guard);
            info!(identity = %slot.key, idle_secs = idle.as_secs(), "idle session evicted");
            self.events.emit(TurnStatusEvent::SessionEvicted {
                identity: slot.key.to_string(),
                idle_secs: idle.as_secs(),
            });
            evicted += 1;
        }
        evicted
    }
}

struct Sweeper {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

pub struct SessionPool {
    inner: Arc<PoolInner>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl SessionPool {
    pub fn new(config: PoolConfig, events: EventBus, factory: ControllerFactory) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                factory,
                events,
                slots: Mutex::new(HashMap::new()),
            }),
            sweeper: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Number of sessions currently in the pool.
    pub fn len(&self) -> usize {
        self.inner.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &IdentityKey) -> bool {
        self.inner.slots.lock().contains_key(key)
    }

    /// Run `f` on the warm controller for `key`, constructing it on first use.
    ///
    /// Only this key's slot is locked while `f` runs.
    ///
    /// # Errors
    /// Controller construction failure, or whatever `f` returns.
    pub fn acquire<R>(
        &self,
        key: &IdentityKey,
        f: impl FnOnce(&mut TurnController) -> Result<R>,
    ) -> Result<R> {
        loop {
            let (slot, victim) = self.inner.slot_for(key);
            if let Some(victim) = victim {
                self.inner.retire(&victim, "capacity");
            }

            let mut guard = slot.controller.lock();
            if slot.evicted.load(Ordering::SeqCst) {
                debug!(identity = %key, "slot evicted while acquiring; retrying");
                continue;
            }
            if guard.is_none() {
                info!(identity = %key, "constructing session");
                *guard = Some((self.inner.factory)(key)?);
            }
            slot.touch();
            let result = match guard.as_mut() {
                Some(controller) => f(controller),
                None => Err(ChorusError::SessionEvicted),
            };
            slot.touch();
            return result;
        }
    }

    /// Run `f` on the controller for `key` without creating one.
    ///
    /// # Errors
    /// `SessionEvicted` if the session is gone.
    pub fn with_existing<R>(
        &self,
        key: &IdentityKey,
        f: impl FnOnce(&mut TurnController) -> Result<R>,
    ) -> Result<R> {
        let Some(slot) = self.inner.slots.lock().get(key).cloned() else {
            return Err(ChorusError::SessionEvicted);
        };
        let mut guard = slot.controller.lock();
        if slot.evicted.load(Ordering::SeqCst) {
            return Err(ChorusError::SessionEvicted);
        }
        let controller = guard.as_mut().ok_or(ChorusError::SessionEvicted)?;
        slot.touch();
        let result = f(controller);
        slot.touch();
        result
    }

    /// Evict sessions idle for longer than the configured threshold.
    pub fn sweep(&self) -> usize {
        self.inner.sweep(self.inner.config.idle_threshold())
    }

    /// Evict sessions idle for at least `threshold`.
    pub fn sweep_older_than(&self, threshold: Duration) -> usize {
        self.inner.sweep(threshold)
    }

    /// Start the periodic sweep thread. A second call is a no-op.
    pub fn start_sweeper(&self) -> Result<()> {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return Ok(());
        }
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let inner = Arc::clone(&self.inner);
        let interval = inner.config.sweep_interval();
        let handle = worker::spawn("chorus-pool-sweeper", move || loop {
            select! {
                recv(stop_rx) -> _ => break,
                default(interval) => {
                    let evicted = inner.sweep(inner.config.idle_threshold());
                    if evicted > 0 {
                        debug!(evicted, "periodic sweep");
                    }
                }
            }
        })?;
        *sweeper = Some(Sweeper { stop_tx, handle });
        Ok(())
    }

    /// Stop the sweeper and every session. Idempotent.
    pub fn shutdown(&self) {
        if let Some(sweeper) = self.sweeper.lock().take() {
            let _ = sweeper.stop_tx.send(());
            worker::join_logged(sweeper.handle);
        }
        let slots: Vec<Arc<SessionSlot>> = self.inner.slots.lock().drain().map(|(_, s)| s).collect();
        for slot in slots {
            slot.evicted.store(true, Ordering::SeqCst);
            if let Some(mut controller) = slot.controller.lock().take() {
                controller.shutdown();
            }
        }
    }
}

impl Drop for SessionPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::Path;
    use std::sync::atomic::AtomicUsize;

    use crate::adapter::{Adapter, AdapterState, BatchAdapter, Completion, EngineAdapter, TurnBinding};
    use crate::fanout::RecordingInfo;
    use crate::turn::TurnConfig;

    /// Batch adapter that completes instantly and records `stop()`.
    struct CountingAdapter {
        stops: Arc<AtomicUsize>,
        binding: Option<TurnBinding>,
    }

    impl EngineAdapter for CountingAdapter {
        fn name(&self) -> &str {
            "counter"
        }

        fn state(&self) -> AdapterState {
            AdapterState::Idle
        }

        fn start(&mut self, binding: TurnBinding) -> Result<()> {
            self.binding = Some(binding);
            Ok(())
        }

        fn wait_for_completion(&mut self, _timeout: Duration) -> Completion {
            if let Some(binding) = self.binding.take() {
                binding.writer.complete(&Completion::Ok);
            }
            Completion::Ok
        }

        fn stop(&mut self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl BatchAdapter for CountingAdapter {
        fn process_batch(&mut self, _recording: &RecordingInfo) -> Result<()> {
            Ok(())
        }

        fn skip(&mut self, reason: &str) {
            if let Some(binding) = self.binding.take() {
                binding.writer.complete(&Completion::Partial(reason.into()));
            }
        }
    }

    struct Fixture {
        pool: SessionPool,
        built: Arc<AtomicUsize>,
        stops: Arc<AtomicUsize>,
        _dir: tempfile::TempDir,
    }

    fn fixture(config: PoolConfig, events: EventBus) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let recordings = dir.path().to_path_buf();
        let built = Arc::new(AtomicUsize::new(0));
        let stops = Arc::new(AtomicUsize::new(0));
        let (built_in, stops_in, bus) = (Arc::clone(&built), Arc::clone(&stops), events.clone());
        let factory: ControllerFactory = Box::new(move |_key| {
            built_in.fetch_add(1, Ordering::SeqCst);
            let cfg = TurnConfig {
                recordings_dir: recordings.clone(),
                ..TurnConfig::default()
            };
            let counter = CountingAdapter {
                stops: Arc::clone(&stops_in),
                binding: None,
            };
            TurnController::new(cfg, vec![Adapter::batch(counter)], bus.clone())
        });
        Fixture {
            pool: SessionPool::new(config, events, factory),
            built,
            stops,
            _dir: dir,
        }
    }

    fn run_turn(pool: &SessionPool, key: &IdentityKey) {
        pool.acquire(key, |c| {
            c.begin("hallo", 16_000)?;
            c.publish_pcm(&[0i16; 160])?;
            c.stop().map(|_| ())
        })
        .expect("turn");
    }

    fn wav_count(dir: &Path) -> usize {
        std::fs::read_dir(dir).expect("read dir").count()
    }

    #[test]
    fn controllers_are_built_once_and_reused() {
        let fx = fixture(PoolConfig::default(), EventBus::new());
        let key = IdentityKey::new("t1", "s1");
        run_turn(&fx.pool, &key);
        run_turn(&fx.pool, &key);
        run_turn(&fx.pool, &IdentityKey::new("t1", "s2"));
        assert_eq!(fx.built.load(Ordering::SeqCst), 2);
        assert_eq!(fx.pool.len(), 2);
        let served = fx.pool.with_existing(&key, |c| Ok(c.turns_served())).expect("existing");
        assert_eq!(served, 2);
        assert_eq!(wav_count(fx._dir.path()), 3);
    }

    #[test]
    fn sweep_stops_and_removes_idle_sessions() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let fx = fixture(PoolConfig::default(), bus);
        let key = IdentityKey::new("t1", "s1");
        run_turn(&fx.pool, &key);

        assert_eq!(fx.pool.sweep(), 0, "fresh session is not idle");
        assert_eq!(fx.pool.sweep_older_than(Duration::ZERO), 1);
        assert!(fx.pool.is_empty());
        assert_eq!(fx.stops.load(Ordering::SeqCst), 1);
        assert!(matches!(
            fx.pool.with_existing(&key, |_| Ok(())),
            Err(ChorusError::SessionEvicted)
        ));

        let mut evicted = false;
        while let Ok(event) = rx.try_recv() {
            evicted |= matches!(event, TurnStatusEvent::SessionEvicted { ref identity, .. } if identity == "t1/s1");
        }
        assert!(evicted);

        run_turn(&fx.pool, &key);
        assert_eq!(fx.built.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn sweep_skips_busy_sessions_and_other_keys_proceed() {
        let fx = Arc::new(fixture(PoolConfig::default(), EventBus::new()));
        let busy = IdentityKey::new("t1", "busy");
        run_turn(&fx.pool, &busy);

        let (entered_tx, entered_rx) = bounded::<()>(1);
        let (release_tx, release_rx) = bounded::<()>(1);
        let holder = {
            let fx = Arc::clone(&fx);
            let busy = busy.clone();
            std::thread::spawn(move || {
                fx.pool
                    .acquire(&busy, |_| {
                        entered_tx.send(()).expect("signal");
                        release_rx.recv().expect("release");
                        Ok(())
                    })
                    .expect("hold");
            })
        };
        entered_rx.recv().expect("holder entered");

        assert_eq!(fx.pool.sweep_older_than(Duration::ZERO), 0);
        run_turn(&fx.pool, &IdentityKey::new("t1", "other"));
        assert!(fx.pool.contains(&busy));

        release_tx.send(()).expect("release");
        holder.join().expect("join holder");
        assert_eq!(fx.pool.sweep_older_than(Duration::ZERO), 2);
        assert_eq!(fx.stops.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn max_sessions_evicts_least_recently_used() {
        let config = PoolConfig {
            max_sessions: Some(2),
            ..PoolConfig::default()
        };
        let fx = fixture(config, EventBus::new());
        let (a, b, c) = (
            IdentityKey::new("t", "a"),
            IdentityKey::new("t", "b"),
            IdentityKey::new("t", "c"),
        );
        run_turn(&fx.pool, &a);
        std::thread::sleep(Duration::from_millis(5));
        run_turn(&fx.pool, &b);
        std::thread::sleep(Duration::from_millis(5));
        run_turn(&fx.pool, &c);

        assert_eq!(fx.pool.len(), 2);
        assert!(!fx.pool.contains(&a));
        assert!(fx.pool.contains(&b) && fx.pool.contains(&c));
        assert_eq!(fx.stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn factory_failure_is_retried_on_next_acquire() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&attempts);
        let dir = tempfile::tempdir().expect("tempdir");
        let recordings = dir.path().to_path_buf();
        let factory: ControllerFactory = Box::new(move |_| {
            if counted.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(ChorusError::Remote("connect refused".into()));
            }
            let cfg = TurnConfig {
                recordings_dir: recordings.clone(),
                ..TurnConfig::default()
            };
            TurnController::new(cfg, Vec::new(), EventBus::new())
        });
        let pool = SessionPool::new(PoolConfig::default(), EventBus::new(), factory);
        let key = IdentityKey::new("t", "s");
        assert!(pool.acquire(&key, |_| Ok(())).is_err());
        assert!(pool.acquire(&key, |_| Ok(())).is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn sweeper_thread_stops_on_shutdown() {
        let config = PoolConfig {
            idle_threshold_secs: 0,
            sweep_interval_secs: 1,
            max_sessions: None,
        };
        let fx = fixture(config, EventBus::new());
        fx.pool.start_sweeper().expect("sweeper");
        fx.pool.start_sweeper().expect("second start is a no-op");
        run_turn(&fx.pool, &IdentityKey::new("t", "s"));
        fx.pool.shutdown();
        fx.pool.shutdown();
        assert!(fx.pool.is_empty());
        assert_eq!(fx.stops.load(Ordering::SeqCst), 1);
    }
}
