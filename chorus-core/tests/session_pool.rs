use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chorus_core::adapter::{
    Adapter, AdapterState, BatchAdapter, ChunkedModelAdapter, Completion, EngineAdapter,
    FileModelAdapter, StreamingAdapter, TurnBinding,
};
use chorus_core::buffering::chunk::ModelInput;
use chorus_core::fanout::{ConsumerHandle, RecordingInfo};
use chorus_core::inference::stub::StubScorer;
use chorus_core::inference::{FileModelHandle, ModelHandle};
use chorus_core::session::ControllerFactory;
use chorus_core::{
    ChorusError, Coordinator, EventBus, IdentityKey, PoolConfig, SessionPool, SpeechModel,
    TurnConfig, TurnController, TurnStatusEvent,
};
use crossbeam_channel::bounded;
use parking_lot::Mutex;

/// Phoneme model that keeps a token alive for as long as it exists.
struct TokenModel {
    _token: Arc<()>,
}

impl SpeechModel for TokenModel {
    fn warm_up(&mut self) -> std::result::Result<(), ChorusError> {
        Ok(())
    }

    fn transcribe(&mut self, _input: &ModelInput) -> std::result::Result<String, ChorusError> {
        Ok("a".into())
    }

    fn reset(&mut self) {}
}

/// Last state each adapter reported, keyed by `student/engine`.
type StateLog = Arc<Mutex<HashMap<String, AdapterState>>>;

/// Forwards to a real adapter and logs its state after every call, so the
/// state stays observable once the pool has dropped the controller.
struct Logged<A> {
    inner: A,
    key: String,
    log: StateLog,
}

impl<A: EngineAdapter> Logged<A> {
    fn new(inner: A, student: &str, log: &StateLog) -> Self {
        let key = format!("{student}/{}", inner.name());
        Self {
            inner,
            key,
            log: Arc::clone(log),
        }
    }

    fn record(&self) {
        self.log.lock().insert(self.key.clone(), self.inner.state());
    }
}

impl<A: EngineAdapter> EngineAdapter for Logged<A> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn state(&self) -> AdapterState {
        self.inner.state()
    }

    fn start(&mut self, binding: TurnBinding) -> chorus_core::Result<()> {
        let started = self.inner.start(binding);
        self.record();
        started
    }

    fn wait_for_completion(&mut self, timeout: Duration) -> Completion {
        let completion = self.inner.wait_for_completion(timeout);
        self.record();
        completion
    }

    fn stop(&mut self) {
        self.inner.stop();
        self.record();
    }
}

impl<A: StreamingAdapter> StreamingAdapter for Logged<A> {
    fn attach(&mut self, queue: ConsumerHandle) -> chorus_core::Result<()> {
        self.inner.attach(queue)
    }

    fn wait_end_of_turn(&mut self, timeout: Duration) -> bool {
        let acked = self.inner.wait_end_of_turn(timeout);
        self.record();
        acked
    }
}

impl<A: BatchAdapter> BatchAdapter for Logged<A> {
    fn process_batch(&mut self, recording: &RecordingInfo) -> chorus_core::Result<()> {
        let scheduled = self.inner.process_batch(recording);
        self.record();
        scheduled
    }

    fn skip(&mut self, reason: &str) {
        self.inner.skip(reason);
        self.record();
    }
}

fn factory(dir: &Path, token: &Arc<()>, events: &EventBus, log: &StateLog) -> ControllerFactory {
    let dir: PathBuf = dir.to_path_buf();
    let token = Arc::clone(token);
    let events = events.clone();
    let log = Arc::clone(log);
    Box::new(move |key: &IdentityKey| {
        let cfg = TurnConfig {
            recordings_dir: dir.join(&key.student_id),
            liveness_poll_ms: 20,
            ..TurnConfig::default()
        };
        let phonemes = ChunkedModelAdapter::new(
            "phonemes",
            ModelHandle::new(TokenModel {
                _token: Arc::clone(&token),
            }),
            cfg.chunk_duration(),
            cfg.liveness_poll(),
        );
        let assessment = FileModelAdapter::new("assessment", FileModelHandle::new(StubScorer));
        let adapters = vec![
            Adapter::streaming(Logged::new(phonemes, &key.student_id, &log)),
            Adapter::batch(Logged::new(assessment, &key.student_id, &log)),
        ];
        TurnController::new(cfg, adapters, events.clone())
    })
}

fn logged_state(log: &StateLog, key: &str) -> Option<AdapterState> {
    log.lock().get(key).copied()
}

#[test]
fn idle_session_is_evicted_and_its_engines_released() {
    let dir = tempfile::tempdir().expect("tempdir");
    let token = Arc::new(());
    let log = StateLog::default();
    let events = EventBus::new();
    let mut rx = events.subscribe();
    let pool = SessionPool::new(
        PoolConfig::default(),
        events.clone(),
        factory(dir.path(), &token, &events, &log),
    );
    let coord = Coordinator::new(pool);
    let key = IdentityKey::new("juf-anna", "leerling-1");

    let turn_id = coord.start(&key, "de kat", 16_000).expect("start");
    coord.chunk(&turn_id, &[0u8; 3_200]).expect("chunk");
    coord.stop(&turn_id).expect("stop");
    // Ours, the factory's and the live model's.
    assert_eq!(Arc::strong_count(&token), 3);
    assert_eq!(logged_state(&log, "leerling-1/phonemes"), Some(AdapterState::Completed));
    assert_eq!(logged_state(&log, "leerling-1/assessment"), Some(AdapterState::Completed));

    assert_eq!(coord.pool().sweep(), 0, "fresh session must survive the default threshold");
    assert_eq!(coord.pool().sweep_older_than(Duration::ZERO), 1);
    assert!(!coord.pool().contains(&key));
    assert_eq!(Arc::strong_count(&token), 2, "evicted engines still alive");
    assert_eq!(logged_state(&log, "leerling-1/phonemes"), Some(AdapterState::Stopped));
    assert_eq!(logged_state(&log, "leerling-1/assessment"), Some(AdapterState::Stopped));

    let evicted = loop {
        match rx.try_recv().expect("status event") {
            TurnStatusEvent::SessionEvicted { identity, .. } => break identity,
            _ => continue,
        }
    };
    assert_eq!(evicted, "juf-anna/leerling-1");

    // The identity comes back with a fresh session.
    let again = coord.start(&key, "", 16_000).expect("restart");
    coord.stop(&again).expect("stop");
    assert_eq!(coord.pool().len(), 1);
    coord.shutdown();
    assert_eq!(Arc::strong_count(&token), 2);
}

#[test]
fn busy_session_does_not_block_other_identities() {
    let dir = tempfile::tempdir().expect("tempdir");
    let token = Arc::new(());
    let log = StateLog::default();
    let events = EventBus::new();
    let pool = SessionPool::new(
        PoolConfig::default(),
        events.clone(),
        factory(dir.path(), &token, &events, &log),
    );
    let busy = IdentityKey::new("t", "busy");
    let idle = IdentityKey::new("t", "idle");
    pool.acquire(&idle, |_| Ok(())).expect("warm idle session");

    let (entered_tx, entered_rx) = bounded::<()>(1);
    let (release_tx, release_rx) = bounded::<()>(1);

    thread::scope(|s| {
        let holder = s.spawn(|| {
            pool.acquire(&busy, |controller| {
                let turn_id = controller.begin("", 16_000)?;
                entered_tx.send(()).expect("signal entered");
                release_rx.recv().expect("release");
                controller.stop().map(|r| assert_eq!(r.turn_id, turn_id))
            })
        });

        entered_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("busy session entered");

        // The busy slot is skipped, the idle one goes.
        assert_eq!(pool.sweep_older_than(Duration::ZERO), 1);
        assert!(pool.contains(&busy));
        assert!(!pool.contains(&idle));
        assert_eq!(logged_state(&log, "idle/assessment"), Some(AdapterState::Stopped));
        assert_eq!(logged_state(&log, "busy/assessment"), Some(AdapterState::Running));

        let start = Instant::now();
        let other = IdentityKey::new("t", "other");
        let turn_id = pool
            .acquire(&other, |c| {
                let id = c.begin("", 16_000)?;
                c.publish_pcm(&[0; 1_600])?;
                c.stop().map(|_| id)
            })
            .expect("other identity turn");
        assert!(!turn_id.as_str().is_empty());
        assert!(start.elapsed() < Duration::from_secs(5));

        release_tx.send(()).expect("release busy session");
        holder.join().expect("holder thread").expect("busy turn");
    });

    assert_eq!(pool.len(), 2);
    pool.shutdown();
    assert!(pool.is_empty());
}

#[test]
fn background_sweeper_evicts_idle_sessions() {
    let dir = tempfile::tempdir().expect("tempdir");
    let token = Arc::new(());
    let log = StateLog::default();
    let events = EventBus::new();
    let config = PoolConfig {
        idle_threshold_secs: 0,
        sweep_interval_secs: 1,
        max_sessions: None,
    };
    let pool = SessionPool::new(config, events.clone(), factory(dir.path(), &token, &events, &log));
    let key = IdentityKey::new("t", "s");
    pool.acquire(&key, |_| Ok(())).expect("warm session");
    pool.start_sweeper().expect("sweeper");

    let deadline = Instant::now() + Duration::from_secs(5);
    // Unlinked first, then stopped; wait for both.
    while pool.contains(&key) || Arc::strong_count(&token) > 2 {
        assert!(Instant::now() < deadline, "sweeper never evicted the session");
        thread::sleep(Duration::from_millis(50));
    }
    assert_eq!(logged_state(&log, "s/phonemes"), Some(AdapterState::Stopped));
    pool.shutdown();
}
