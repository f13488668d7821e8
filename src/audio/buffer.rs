//! Bounded buffer for audio captured before the room connection is up.
//!
//! Pre-connect buffering starts the microphone immediately so the candidate's
//! first words are not lost while the handshake completes. When the buffer is
//! full the oldest chunks are evicted to keep memory bounded.
//!
//! # Memory Budget
//!
//! At 48kHz mono PCM16 with ~10ms callback chunks:
//! - 10 seconds: 480,000 samples × 2 bytes ≈ 940 KB

use std::collections::VecDeque;

/// A chunk of captured PCM16 samples
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub samples: Vec<i16>,
    /// Sequence number for ordering (monotonically increasing)
    pub sequence: u64,
}

impl AudioChunk {
    pub fn new(samples: Vec<i16>, sequence: u64) -> Self {
        Self { samples, sequence }
    }
}

/// Sample-bounded FIFO of pre-connect audio.
///
/// Not internally synchronized; the room's forwarding task owns it.
#[derive(Debug)]
pub struct PreConnectBuffer {
    chunks: VecDeque<AudioChunk>,
    max_samples: usize,
    buffered_samples: usize,
    next_sequence: u64,
    evicted_chunks: u64,
}

impl PreConnectBuffer {
    /// Buffer holding at most `max_duration_secs` of audio at the given format.
    pub fn new(max_duration_secs: f32, sample_rate: u32, channels: u16) -> Self {
        let max_samples =
            (max_duration_secs.max(0.0) * sample_rate as f32 * channels.max(1) as f32) as usize;
        Self {
            chunks: VecDeque::new(),
            max_samples,
            buffered_samples: 0,
            next_sequence: 0,
            evicted_chunks: 0,
        }
    }

    /// Push captured samples, evicting from the front if over budget.
    /// Returns the sequence number assigned to the chunk.
    pub fn push(&mut self, samples: Vec<i16>) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        self.buffered_samples += samples.len();
        self.chunks.push_back(AudioChunk::new(samples, sequence));

        while self.buffered_samples > self.max_samples {
            match self.chunks.pop_front() {
                Some(evicted) => {
                    self.buffered_samples -= evicted.samples.len();
                    self.evicted_chunks += 1;
                }
                None => break,
            }
        }
        sequence
    }

    /// Drain all chunks in capture order. The buffer is empty afterwards.
    pub fn drain_all(&mut self) -> Vec<AudioChunk> {
        self.buffered_samples = 0;
        self.chunks.drain(..).collect()
    }

    /// Chunks dropped because the connection took longer than the budget.
    pub fn evicted_chunks(&self) -> u64 {
        self.evicted_chunks
    }
}
