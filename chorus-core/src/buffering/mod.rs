//! Audio buffering: the capture ring, typed chunks, and the per-engine
//! chunking buffer.
//!
//! The capture ring uses `ringbuf::HeapRb<i16>`, whose `push_slice` is
//! wait-free and safe to call from the real-time audio callback. Everything
//! downstream of the ring (fan-out, chunking, resampling) runs on ordinary
//! threads where allocation is allowed.

pub mod chunk;
pub mod chunker;

use ringbuf::{traits::Split, HeapRb};

pub use chunker::ChunkingBuffer;
pub use ringbuf::traits::{Consumer, Observer, Producer};

/// Type alias for the producer half, held by the audio callback thread.
pub type AudioProducer = ringbuf::HeapProd<i16>;

/// Type alias for the consumer half, held by the capture pump thread.
pub type AudioConsumer = ringbuf::HeapCons<i16>;

/// Buffer capacity: 2^20 = 1 048 576 samples ≈ 21.8 s at 48 kHz.
/// The pump drains every few milliseconds; the headroom only matters when a
/// slow recording disk stalls the pump.
pub const RING_CAPACITY: usize = 1 << 20;

/// Create a matched producer/consumer pair backed by a heap-allocated ring buffer.
pub fn create_audio_ring() -> (AudioProducer, AudioConsumer) {
    HeapRb::<i16>::new(RING_CAPACITY).split()
}
