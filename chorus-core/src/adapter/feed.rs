//! Turn-serving loop shared by streaming adapter threads.
//!
//! A persistent thread blocks on its control channel while idle. Once a
//! `Begin` arrives it reads its fan-out queue until the end marker, then
//! goes idle again. Control is always checked before a queue item is
//! handled, so an item is never applied to a superseded turn.

use std::time::{Duration, Instant};

use crossbeam_channel::{select, Receiver, RecvTimeoutError};
use tracing::{debug, warn};

use crate::adapter::Completion;
use crate::fanout::{ConsumerHandle, QueueItem, TurnEnd};
use crate::turn::TurnId;

pub(crate) enum Control<T> {
    Begin(T),
    Shutdown,
}

/// Sent by a streaming thread once it has consumed a turn's end marker.
#[derive(Debug)]
pub(crate) struct TurnAck {
    pub turn_id: TurnId,
    pub completion: Completion,
}

pub(crate) trait TurnHandler {
    type Turn;

    /// Start serving `turn`. Returns `false` if the turn was rejected; the
    /// handler must have acknowledged it already.
    fn begin(&mut self, turn: Self::Turn) -> bool;

    fn frame(&mut self, frame: &[i16]);

    /// Consume the end marker and acknowledge the turn.
    fn end(&mut self, end: TurnEnd);

    /// Give up on the active turn without an end marker.
    fn abandon(&mut self, reason: &str);
}

enum Step<T> {
    Continue,
    Item(QueueItem),
    Begin(T, Option<QueueItem>),
    Shutdown,
}

/// Serve turns until shutdown or until either channel disconnects.
pub(crate) fn run_turn_loop<H: TurnHandler>(
    queue: &ConsumerHandle,
    control_rx: &Receiver<Control<H::Turn>>,
    liveness: Duration,
    handler: &mut H,
) {
    let mut active = false;
    loop {
        let step = if active {
            next_step(queue, control_rx, liveness)
        } else {
            match control_rx.recv() {
                Ok(Control::Begin(turn)) => Step::Begin(turn, None),
                Ok(Control::Shutdown) | Err(_) => Step::Shutdown,
            }
        };

        match step {
            Step::Continue => {}
            Step::Item(item) => active = apply(handler, item),
            Step::Begin(turn, pending) => {
                if active {
                    warn!("turn superseded before its end marker");
                    handler.abandon("superseded by a new turn");
                }
                active = handler.begin(turn);
                if let (true, Some(item)) = (active, pending) {
                    active = apply(handler, item);
                }
            }
            Step::Shutdown => break,
        }
    }
    if active {
        handler.abandon("adapter stopped mid-turn");
    }
    debug!("turn loop exited");
}

/// Returns whether the turn is still active afterwards.
fn apply<H: TurnHandler>(handler: &mut H, item: QueueItem) -> bool {
    match item {
        QueueItem::Frame(frame) => {
            handler.frame(&frame);
            true
        }
        QueueItem::EndMarker(end) => {
            handler.end(end);
            false
        }
    }
}

fn next_step<T>(
    queue: &ConsumerHandle,
    control_rx: &Receiver<Control<T>>,
    liveness: Duration,
) -> Step<T> {
    select! {
        recv(control_rx) -> msg => match msg {
            Ok(Control::Begin(turn)) => Step::Begin(turn, None),
            Ok(Control::Shutdown) | Err(_) => Step::Shutdown,
        },
        recv(queue.receiver()) -> item => {
            let Ok(item) = item else {
                return Step::Shutdown;
            };
            match control_rx.try_recv() {
                Ok(Control::Begin(turn)) => Step::Begin(turn, Some(item)),
                Ok(Control::Shutdown) => Step::Shutdown,
                Err(_) => Step::Item(item),
            }
        },
        default(liveness) => Step::Continue,
    }
}

pub(crate) enum AckWait {
    Acked(Completion),
    TimedOut,
    Disconnected,
}

/// Wait for the ack of `current`, discarding acks of earlier turns.
pub(crate) fn await_ack(rx: &Receiver<TurnAck>, current: &TurnId, timeout: Duration) -> AckWait {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(ack) if &ack.turn_id == current => return AckWait::Acked(ack.completion),
            Ok(stale) => debug!(turn_id = %stale.turn_id, "discarding stale ack"),
            Err(RecvTimeoutError::Timeout) => return AckWait::TimedOut,
            Err(RecvTimeoutError::Disconnected) => return AckWait::Disconnected,
        }
    }
}
