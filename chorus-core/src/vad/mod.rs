//! Voice activity detection over capture frames.
//!
//! Only the capture producer uses it, to end a live turn after the speaker
//! falls silent. Engines always see the full stream.

pub mod energy;

pub use energy::EnergyVad;

/// Whether a given audio frame contains speech or silence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadDecision {
    /// The frame contains speech energy above threshold.
    Speech,
    /// The frame is silent (or below threshold, including hangover period).
    Silence,
}

impl VadDecision {
    pub fn is_speech(self) -> bool {
        self == VadDecision::Speech
    }
}

/// Trait for all VAD implementations.
///
/// Implementors may be stateful (hangover counters and the like).
pub trait VoiceActivityDetector: Send + 'static {
    /// Classify one frame of mono i16 samples.
    fn classify(&mut self, frame: &[i16]) -> VadDecision;

    /// Reset any internal state between turns.
    fn reset(&mut self);
}
