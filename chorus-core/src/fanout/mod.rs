//! Single-producer fan-out of PCM frames to N analysis queues.
//!
//! ```text
//!                         ┌─► RecordingSink (WAV, never drops)
//! producer ─► publish() ──┼─► queue "phonemes"  ─► adapter worker
//!                         ├─► queue "assessor"  ─► adapter feed thread
//!                         └─► …
//! end_turn() ─► exactly one EndMarker per queue
//! ```
//!
//! Queues are bounded crossbeam channels. When a queue is full the
//! [`OverflowPolicy`] decides between evicting the oldest queued item and
//! waiting a bounded time; either way the producer is never stalled
//! indefinitely. The broadcaster keeps a clone of every queue's receiver so it
//! can evict and drain without the consumer's cooperation.

pub mod recording;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ChorusError, Result};

pub use recording::{RecordingInfo, RecordingSink};

/// Immutable block of mono i16 samples, shared by every consumer.
pub type Frame = Arc<[i16]>;

/// How a turn ended, as seen by a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnEnd {
    /// Normal end: flush buffered audio and produce a result.
    Finished,
    /// Discard buffered audio.
    Aborted,
}

#[derive(Debug, Clone)]
pub enum QueueItem {
    Frame(Frame),
    EndMarker(TurnEnd),
}

/// Behaviour when a consumer queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "mode")]
pub enum OverflowPolicy {
    /// Evict the oldest queued frame to make room.
    DropOldest,
    /// Wait up to `timeout_ms` for room, then drop the new frame.
    BlockWithTimeout { timeout_ms: u64 },
}

impl Default for OverflowPolicy {
    fn default() -> Self {
        Self::BlockWithTimeout { timeout_ms: 50 }
    }
}

/// Consumer side of one fan-out queue.
pub struct ConsumerHandle {
    id: String,
    rx: Receiver<QueueItem>,
    dropped: Arc<AtomicU64>,
}

impl ConsumerHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Underlying receiver, for use in `crossbeam_channel::select!`.
    pub fn receiver(&self) -> &Receiver<QueueItem> {
        &self.rx
    }

    pub fn recv_timeout(&self, timeout: Duration) -> std::result::Result<QueueItem, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    /// Frames dropped for this consumer during the current turn.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Shareable view of this queue's drop count.
    pub fn drop_counter(&self) -> DropCounter {
        DropCounter(Arc::clone(&self.dropped))
    }
}

#[derive(Debug, Clone)]
pub struct DropCounter(Arc<AtomicU64>);

impl DropCounter {
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

struct ConsumerQueue {
    id: String,
    tx: Sender<QueueItem>,
    /// Receiver clone used only for eviction and draining.
    evict_rx: Receiver<QueueItem>,
    dropped: Arc<AtomicU64>,
    markers_sent: u32,
}

impl ConsumerQueue {
    fn evict_one(&self) -> bool {
        self.evict_rx.try_recv().is_ok()
    }

    fn drain(&self) -> usize {
        self.evict_rx.try_iter().count()
    }
}

/// Per-consumer delivery counters for one turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerStats {
    pub id: String,
    pub dropped_frames: u64,
}

pub struct Broadcaster {
    queues: Vec<ConsumerQueue>,
    policy: OverflowPolicy,
    depth: usize,
    recording: Option<RecordingSink>,
    ended: bool,
    published_frames: u64,
    published_samples: u64,
}

impl Broadcaster {
    pub fn new(policy: OverflowPolicy, depth: usize) -> Self {
        Self {
            queues: Vec::new(),
            policy,
            depth: depth.max(1),
            recording: None,
            ended: false,
            published_frames: 0,
            published_samples: 0,
        }
    }

    /// Register a consumer queue. Registration is permanent for the lifetime
    /// of the broadcaster; queues are reused across turns.
    pub fn register(&mut self, consumer_id: impl Into<String>) -> ConsumerHandle {
        let id = consumer_id.into();
        let (tx, rx) = bounded(self.depth);
        let dropped = Arc::new(AtomicU64::new(0));
        self.queues.push(ConsumerQueue {
            id: id.clone(),
            tx,
            evict_rx: rx.clone(),
            dropped: Arc::clone(&dropped),
            markers_sent: 0,
        });
        debug!(consumer = %id, depth = self.depth, "consumer registered");
        ConsumerHandle { id, rx, dropped }
    }

    pub fn consumer_count(&self) -> usize {
        self.queues.len()
    }

    /// Attach the recording sink for the current turn.
    pub fn attach_recording(&mut self, sink: RecordingSink) {
        if let Some(old) = self.recording.replace(sink) {
            warn!(path = %old.path().display(), "replacing an unfinalised recording");
            old.discard();
        }
    }

    pub fn has_ended(&self) -> bool {
        self.ended
    }

    pub fn published_samples(&self) -> u64 {
        self.published_samples
    }

    pub fn published_frames(&self) -> u64 {
        self.published_frames
    }

    /// Deliver `frame` to the recording and every queue, in that order.
    ///
    /// # Errors
    /// `ChorusError::TurnEnded` after [`Self::end_turn`]; a recording failure
    /// is returned as-is and is fatal to the turn.
    pub fn publish(&mut self, frame: Frame) -> Result<()> {
        if self.ended {
            return Err(ChorusError::TurnEnded);
        }
        if let Some(sink) = self.recording.as_mut() {
            sink.write(&frame)?;
        }
        self.published_frames += 1;
        self.published_samples += frame.len() as u64;

        for queue in &self.queues {
            deliver_frame(queue, QueueItem::Frame(Arc::clone(&frame)), self.policy);
        }
        Ok(())
    }

    /// Enqueue exactly one end marker per consumer and reject further
    /// publishing until [`Self::reset_turn`]. Calling it twice is a no-op.
    pub fn end_turn(&mut self, end: TurnEnd) {
        if self.ended {
            return;
        }
        self.ended = true;
        for queue in &mut self.queues {
            deliver_marker(queue, end, self.policy);
            queue.markers_sent += 1;
        }
        debug!(
            ?end,
            frames = self.published_frames,
            samples = self.published_samples,
            "end markers delivered"
        );
    }

    /// Finalise and detach the recording. `Ok(None)` when no sink is attached.
    pub fn close_recording(&mut self) -> Result<Option<RecordingInfo>> {
        match self.recording.take() {
            Some(sink) => sink.finalize().map(Some),
            None => Ok(None),
        }
    }

    /// Close the recording and delete its file.
    pub fn discard_recording(&mut self) {
        if let Some(sink) = self.recording.take() {
            sink.discard();
        }
    }

    /// Drain every queue and accept publishing again.
    ///
    /// After this returns no queue holds an item from the previous turn.
    pub fn reset_turn(&mut self) {
        for queue in &mut self.queues {
            let stale = queue.drain();
            if stale > 0 {
                debug!(consumer = %queue.id, stale, "drained stale queue items");
            }
            queue.dropped.store(0, Ordering::Relaxed);
            queue.markers_sent = 0;
        }
        self.discard_recording();
        self.ended = false;
        self.published_frames = 0;
        self.published_samples = 0;
    }

    pub fn stats(&self) -> Vec<ConsumerStats> {
        self.queues
            .iter()
            .map(|q| ConsumerStats {
                id: q.id.clone(),
                dropped_frames: q.dropped.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Markers delivered to `consumer_id` since the last reset.
    pub fn markers_sent(&self, consumer_id: &str) -> Option<u32> {
        self.queues
            .iter()
            .find(|q| q.id == consumer_id)
            .map(|q| q.markers_sent)
    }
}

fn deliver_frame(queue: &ConsumerQueue, item: QueueItem, policy: OverflowPolicy) {
    match policy {
        OverflowPolicy::DropOldest => {
            let mut item = item;
            loop {
                match queue.tx.try_send(item) {
                    Ok(()) => return,
                    Err(TrySendError::Disconnected(_)) => return,
                    Err(TrySendError::Full(back)) => {
                        if queue.evict_one() {
                            queue.dropped.fetch_add(1, Ordering::Relaxed);
                        }
                        item = back;
                    }
                }
            }
        }
        OverflowPolicy::BlockWithTimeout { timeout_ms } => {
            match queue.tx.send_timeout(item, Duration::from_millis(timeout_ms)) {
                Ok(()) | Err(SendTimeoutError::Disconnected(_)) => {}
                Err(SendTimeoutError::Timeout(_)) => {
                    let total = queue.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(consumer = %queue.id, total, "queue full, frame dropped");
                }
            }
        }
    }
}

fn deliver_marker(queue: &ConsumerQueue, end: TurnEnd, policy: OverflowPolicy) {
    let mut item = QueueItem::EndMarker(end);
    if let OverflowPolicy::BlockWithTimeout { timeout_ms } = policy {
        match queue.tx.send_timeout(item, Duration::from_millis(timeout_ms)) {
            Ok(()) | Err(SendTimeoutError::Disconnected(_)) => return,
            Err(SendTimeoutError::Timeout(back)) => item = back,
        }
    }
    // Markers are never dropped: make room by evicting the oldest frame.
    loop {
        match queue.tx.try_send(item) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => return,
            Err(TrySendError::Full(back)) => {
                if queue.evict_one() {
                    queue.dropped.fetch_add(1, Ordering::Relaxed);
                }
                item = back;
            }
        }
    }
}
