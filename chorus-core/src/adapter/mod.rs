//! Engine adapters: one uniform lifecycle over heterogeneous engines.
//!
//! ```text
//!            start()            end marker / process_batch()        final event or timeout
//!   Idle ───────────► Running ─────────────────────────► Draining ─────────────────────► Completed
//!     ▲                                                                                     │
//!     └──────────────────────────── start() (next turn, warm reuse) ◄───────────────────────┘
//!
//!   any state ── stop() ──► Stopped (terminal; start() is rejected)
//! ```
//!
//! Streaming adapters consume a fan-out queue while the turn is live; batch
//! adapters run once the finalised recording exists. The split is fixed at
//! construction through [`Adapter`]. An engine that supports both modes is
//! given one or the other from its `realtime` setting; the offline models in
//! [`offline`] let the streaming backends run as batch engines. `stop()` is
//! valid in every state and idempotent.

pub mod batch;
pub mod chunked;
pub(crate) mod feed;
pub mod offline;
pub mod remote;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::fanout::{ConsumerHandle, RecordingInfo};
use crate::inference::TurnContext;
use crate::turn::{SlotWriter, TurnId};

pub use batch::FileModelAdapter;
pub use chunked::{ChunkOutput, ChunkedModelAdapter};
pub use offline::{ChunkedFileModel, RecognizerFileModel};
pub use remote::RemoteStreamAdapter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterState {
    Idle,
    Running,
    Draining,
    Completed,
    /// Torn down by `stop()`; never serves another turn.
    Stopped,
}

/// How an adapter finished its turn. Never an error: engine failures are
/// isolated to the engine's own slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Ok,
    /// Best-effort result, e.g. after a timeout.
    Partial(String),
    Failed(String),
}

impl Completion {
    pub fn is_ok(&self) -> bool {
        matches!(self, Completion::Ok)
    }
}

impl fmt::Display for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Completion::Ok => f.write_str("ok"),
            Completion::Partial(reason) => write!(f, "partial: {reason}"),
            Completion::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Everything an adapter needs to serve one turn.
#[derive(Debug)]
pub struct TurnBinding {
    pub turn_id: TurnId,
    pub sample_rate: u32,
    pub context: TurnContext,
    pub writer: SlotWriter,
}

/// Lifecycle shared by every adapter.
pub trait EngineAdapter: Send {
    /// Engine name; also the results key.
    fn name(&self) -> &str;

    fn state(&self) -> AdapterState;

    /// Begin serving a new turn: `Idle | Completed → Running`.
    ///
    /// Warm adapters re-arm here instead of reconstructing.
    fn start(&mut self, binding: TurnBinding) -> Result<()>;

    /// Block until the adapter reaches `Completed` or `timeout` elapses.
    ///
    /// A timeout yields `Completion::Partial`; the adapter is then considered
    /// completed for this turn and anything it reports later is discarded.
    /// Once completed, further calls return the same completion.
    fn wait_for_completion(&mut self, timeout: Duration) -> Completion;

    /// Release every resource and join every thread. Idempotent.
    fn stop(&mut self);
}

/// Adapter fed live from a fan-out queue.
pub trait StreamingAdapter: EngineAdapter {
    /// Hand the adapter its queue. Called once, before the first `start`.
    fn attach(&mut self, queue: ConsumerHandle) -> Result<()>;

    /// Wait until the adapter has consumed the end marker and flushed its
    /// buffers (`Running → Draining`). Returns `false` on timeout.
    fn wait_end_of_turn(&mut self, timeout: Duration) -> bool;
}

/// Adapter run on the finalised recording.
pub trait BatchAdapter: EngineAdapter {
    /// Start processing the recording (`Running → Draining`). Returns as soon
    /// as the work is scheduled.
    fn process_batch(&mut self, recording: &RecordingInfo) -> Result<()>;

    /// Finish the turn without processing it (`Running → Completed`), as
    /// when the turn is aborted.
    fn skip(&mut self, reason: &str);
}

/// An adapter with its streaming/batch variant fixed at construction.
pub enum Adapter {
    Streaming(Box<dyn StreamingAdapter>),
    Batch(Box<dyn BatchAdapter>),
}

impl Adapter {
    pub fn streaming(adapter: impl StreamingAdapter + 'static) -> Self {
        Adapter::Streaming(Box::new(adapter))
    }

    pub fn batch(adapter: impl BatchAdapter + 'static) -> Self {
        Adapter::Batch(Box::new(adapter))
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, Adapter::Streaming(_))
    }

    pub fn name(&self) -> &str {
        match self {
            Adapter::Streaming(a) => a.name(),
            Adapter::Batch(a) => a.name(),
        }
    }

    pub fn state(&self) -> AdapterState {
        match self {
            Adapter::Streaming(a) => a.state(),
            Adapter::Batch(a) => a.state(),
        }
    }

    pub fn start(&mut self, binding: TurnBinding) -> Result<()> {
        match self {
            Adapter::Streaming(a) => a.start(binding),
            Adapter::Batch(a) => a.start(binding),
        }
    }

    pub fn wait_for_completion(&mut self, timeout: Duration) -> Completion {
        match self {
            Adapter::Streaming(a) => a.wait_for_completion(timeout),
            Adapter::Batch(a) => a.wait_for_completion(timeout),
        }
    }

    pub fn stop(&mut self) {
        match self {
            Adapter::Streaming(a) => a.stop(),
            Adapter::Batch(a) => a.stop(),
        }
    }
}

impl fmt::Debug for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_streaming() { "Streaming" } else { "Batch" };
        f.debug_struct("Adapter")
            .field("kind", &kind)
            .field("name", &self.name())
            .finish()
    }
}
