//! Worker census checks. Kept in a binary of its own: the census is
//! process-wide, so no other test may spawn workers concurrently.

use std::time::{Duration, Instant};

use chorus_core::adapter::{Adapter, ChunkedModelAdapter, FileModelAdapter, RemoteStreamAdapter};
use chorus_core::inference::stub::{LoopbackRecognizer, StubPhonemeModel, StubScorer};
use chorus_core::inference::{FileModelHandle, ModelHandle, RecognizerFactory, RemoteRecognizer};
use chorus_core::worker::live_workers;
use chorus_core::{EventBus, IdentityKey, PoolConfig, SessionPool, TurnConfig, TurnController};

fn controller(dir: &std::path::Path) -> TurnController {
    let cfg = TurnConfig {
        recordings_dir: dir.to_path_buf(),
        liveness_poll_ms: 20,
        remote_settle_ms: 20,
        ..TurnConfig::default()
    };
    let factory: RecognizerFactory = Box::new(|| {
        Ok(Box::new(LoopbackRecognizer::new(Duration::from_millis(5))) as Box<dyn RemoteRecognizer>)
    });
    let adapters = vec![
        Adapter::streaming(ChunkedModelAdapter::new(
            "phonemes",
            ModelHandle::new(StubPhonemeModel::default()),
            cfg.chunk_duration(),
            cfg.liveness_poll(),
        )),
        Adapter::streaming(
            RemoteStreamAdapter::new("transcript", factory, cfg.remote_settle(), cfg.liveness_poll())
                .expect("remote adapter"),
        ),
        Adapter::batch(FileModelAdapter::new("assessment", FileModelHandle::new(StubScorer))),
    ];
    TurnController::new(cfg, adapters, EventBus::new()).expect("controller")
}

/// Workers exit right after being joined; allow the census guard to drop.
fn wait_for_baseline(baseline: usize) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while live_workers() != baseline {
        assert!(
            Instant::now() < deadline,
            "live workers {} never returned to baseline {baseline}",
            live_workers()
        );
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn every_stop_path_returns_the_census_to_baseline() {
    let dir = tempfile::tempdir().expect("tempdir");
    let baseline = live_workers();

    // Reset and double shutdown without any turn.
    {
        let mut ctrl = controller(dir.path());
        assert!(live_workers() > baseline);
        ctrl.reset();
        ctrl.shutdown();
        ctrl.shutdown();
    }
    wait_for_baseline(baseline);

    // A finished turn, an aborted turn and a turn left in flight at drop.
    {
        let mut ctrl = controller(dir.path());
        ctrl.begin("de kat", 16_000).expect("begin");
        ctrl.publish_pcm(&[500; 24_000]).expect("publish");
        ctrl.stop().expect("stop");

        ctrl.begin("de kat", 16_000).expect("begin");
        ctrl.publish_pcm(&[500; 4_000]).expect("publish");
        ctrl.abort().expect("abort");

        ctrl.begin("de kat", 16_000).expect("begin");
        ctrl.publish_pcm(&[500; 4_000]).expect("publish");
    }
    wait_for_baseline(baseline);

    // Pool with a sweeper and two sessions.
    {
        let recordings = dir.path().to_path_buf();
        let pool = SessionPool::new(
            PoolConfig::default(),
            EventBus::new(),
            Box::new(move |_| Ok(controller(&recordings))),
        );
        pool.start_sweeper().expect("sweeper");
        for student in ["s1", "s2"] {
            pool.acquire(&IdentityKey::new("t", student), |c| {
                c.begin("", 16_000)?;
                c.publish_pcm(&[0; 1_600])?;
                c.stop().map(drop)
            })
            .expect("turn");
        }
        assert_eq!(pool.sweep_older_than(Duration::ZERO), 2);
        pool.shutdown();
        pool.shutdown();
    }
    wait_for_baseline(baseline);
}
