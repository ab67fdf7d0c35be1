//! Turn lifecycle API over the session pool: `start / chunk / stop`.
//!
//! Callers address turns by id only. The coordinator keeps a turn-id →
//! identity index; when a session starts a new turn, the id of its previous
//! turn is dropped from the index, so stale ids are rejected as unknown.
//!
//! Byte chunks carry raw 16-bit little-endian mono PCM. A chunk may end in
//! the middle of a sample; the controller holds the odd byte for the next
//! chunk of the same turn, so decoding and publishing happen under the same
//! session lock.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ChorusError, Result};
use crate::session::{IdentityKey, SessionPool};
use crate::turn::{TurnController, TurnId, TurnResults};

/// Reply to one `chunk` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAck {
    pub turn_id: TurnId,
    /// Samples accepted for this turn so far, including this chunk.
    pub samples_received: u64,
}

struct TurnEntry {
    key: IdentityKey,
}

#[derive(Default)]
struct TurnIndex {
    turns: HashMap<TurnId, TurnEntry>,
    current: HashMap<IdentityKey, TurnId>,
}

impl TurnIndex {
    fn forget(&mut self, turn_id: &TurnId) -> Option<TurnEntry> {
        let entry = self.turns.remove(turn_id)?;
        if self.current.get(&entry.key) == Some(turn_id) {
            self.current.remove(&entry.key);
        }
        Some(entry)
    }
}

pub struct Coordinator {
    pool: SessionPool,
    index: Mutex<TurnIndex>,
}

impl Coordinator {
    pub fn new(pool: SessionPool) -> Self {
        Self {
            pool,
            index: Mutex::new(TurnIndex::default()),
        }
    }

    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    /// Turn ids currently accepted by `chunk` and `stop`.
    pub fn open_turns(&self) -> usize {
        self.index.lock().turns.len()
    }

    /// Start a turn for `key`, reusing its warm controller when there is one.
    pub fn start(&self, key: &IdentityKey, reference_text: &str, sample_rate: u32) -> Result<TurnId> {
        let turn_id = self
            .pool
            .acquire(key, |c| c.begin(reference_text, sample_rate))?;

        let mut index = self.index.lock();
        if let Some(previous) = index.current.insert(key.clone(), turn_id.clone()) {
            if index.turns.remove(&previous).is_some() {
                debug!(identity = %key, %previous, "superseded turn id dropped");
            }
        }
        index.turns.insert(
            turn_id.clone(),
            TurnEntry { key: key.clone() },
        );
        Ok(turn_id)
    }

    /// Append a chunk of PCM bytes to the turn.
    ///
    /// # Errors
    /// `UnknownTurn` for ids that were never issued, already stopped or
    /// superseded; recording failures from the controller.
    pub fn chunk(&self, turn_id: &TurnId, pcm: &[u8]) -> Result<ChunkAck> {
        let key = self
            .index
            .lock()
            .turns
            .get(turn_id)
            .map(|entry| entry.key.clone())
            .ok_or_else(|| ChorusError::UnknownTurn(turn_id.clone()))?;

        let samples_received = self.pool.with_existing(&key, |c| {
            ensure_current(c, turn_id)?;
            c.publish_pcm_bytes(pcm)
        })?;
        Ok(ChunkAck {
            turn_id: turn_id.clone(),
            samples_received,
        })
    }

    /// Finish the turn and return its sealed results.
    pub fn stop(&self, turn_id: &TurnId) -> Result<TurnResults> {
        self.finish(turn_id, TurnController::stop)
    }

    /// Abort the turn; buffered audio is discarded.
    pub fn abort(&self, turn_id: &TurnId) -> Result<TurnResults> {
        self.finish(turn_id, TurnController::abort)
    }

    fn finish(
        &self,
        turn_id: &TurnId,
        end: fn(&mut TurnController) -> Result<TurnResults>,
    ) -> Result<TurnResults> {
        let entry = self
            .index
            .lock()
            .forget(turn_id)
            .ok_or_else(|| ChorusError::UnknownTurn(turn_id.clone()))?;
        self.pool.with_existing(&entry.key, |c| {
            ensure_current(c, turn_id)?;
            end(c)
        })
    }

    /// Stop the pool and every session.
    pub fn shutdown(&self) {
        self.pool.shutdown();
        let mut index = self.index.lock();
        index.turns.clear();
        index.current.clear();
    }
}

fn ensure_current(controller: &TurnController, turn_id: &TurnId) -> Result<()> {
    if controller.current_turn() == Some(turn_id) {
        Ok(())
    } else {
        Err(ChorusError::UnknownTurn(turn_id.clone()))
    }
}
