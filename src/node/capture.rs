//! FFT spectrum reassembly from FftChunkData packets.
//!
//! Chunk `n` holds bins `n * 32 .. n * 32 + 32`. The transfer size comes from
//! the chunk-count field of the first chunk received. The capture completes
//! when the last sequence number arrives; chunks lost on the way stay zero.

use crate::protocol::radio::{FftChunkData, FFT_CHUNK_BINS};
use log::warn;
use std::fmt;

/// Chunk count the nodes use for a full spectrum.
pub const DEFAULT_CHUNK_COUNT: u8 = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// Chunk announces a transfer of zero chunks.
    EmptyTransfer,
    /// Chunk count differs from the one this transfer started with.
    ChunkCountChanged { expected: u8, found: u8 },
    /// Sequence number is past the end of the transfer.
    SequenceOutOfRange { sequence: u8, chunk_count: u8 },
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyTransfer => write!(f, "chunk announces an empty transfer"),
            Self::ChunkCountChanged { expected, found } => {
                write!(f, "chunk count changed from {} to {}", expected, found)
            }
            Self::SequenceOutOfRange {
                sequence,
                chunk_count,
            } => write!(f, "chunk {} outside transfer of {}", sequence, chunk_count),
        }
    }
}

impl std::error::Error for CaptureError {}

/// A finished spectrum.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedCapture {
    /// Node time of the first received chunk.
    pub time: u32,
    pub bins: Vec<f32>,
    /// Sequence numbers that never arrived.
    pub missing: Vec<u8>,
}

/// In-progress chunk transfer.
#[derive(Debug, Default)]
pub struct FftCapture {
    chunk_count: u8,
    bins: Vec<f32>,
    received: Vec<bool>,
    time: Option<u32>,
}

impl FftCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of chunks received so far.
    pub fn received(&self) -> usize {
        self.received.iter().filter(|r| **r).count()
    }

    /// Store one chunk. Returns the finished capture on the last sequence.
    pub fn accept(&mut self, chunk: &FftChunkData) -> Result<Option<CompletedCapture>, CaptureError> {
        if chunk.chunk_count == 0 {
            return Err(CaptureError::EmptyTransfer);
        }
        if self.chunk_count == 0 {
            self.chunk_count = chunk.chunk_count;
            self.bins = vec![0.0; usize::from(chunk.chunk_count) * FFT_CHUNK_BINS];
            self.received = vec![false; usize::from(chunk.chunk_count)];
        } else if self.chunk_count != chunk.chunk_count {
            return Err(CaptureError::ChunkCountChanged {
                expected: self.chunk_count,
                found: chunk.chunk_count,
            });
        }
        if chunk.sequence >= self.chunk_count {
            return Err(CaptureError::SequenceOutOfRange {
                sequence: chunk.sequence,
                chunk_count: self.chunk_count,
            });
        }

        let offset = usize::from(chunk.sequence) * FFT_CHUNK_BINS;
        self.bins[offset..offset + FFT_CHUNK_BINS].copy_from_slice(&chunk.bins);
        self.received[usize::from(chunk.sequence)] = true;
        self.time.get_or_insert(chunk.time);

        if chunk.sequence + 1 < self.chunk_count {
            return Ok(None);
        }

        let missing: Vec<u8> = self
            .received
            .iter()
            .enumerate()
            .filter(|(_, r)| !**r)
            .map(|(i, _)| i as u8)
            .collect();
        if !missing.is_empty() {
            warn!(
                "FFT capture finished with {} of {} chunks missing: {:?}",
                missing.len(),
                self.chunk_count,
                missing
            );
        }

        let done = CompletedCapture {
            time: self.time.unwrap_or(chunk.time),
            bins: std::mem::take(&mut self.bins),
            missing,
        };
        *self = Self::default();
        Ok(Some(done))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(sequence: u8, chunk_count: u8, fill: f32) -> FftChunkData {
        FftChunkData {
            session_id: 1,
            sequence,
            chunk_count,
            time: 1000 + u32::from(sequence),
            bins: [fill; FFT_CHUNK_BINS],
        }
    }

    #[test]
    fn test_full_transfer() {
        let mut capture = FftCapture::new();
        assert_eq!(capture.accept(&chunk(0, 3, 1.0)), Ok(None));
        assert_eq!(capture.accept(&chunk(1, 3, 2.0)), Ok(None));
        let done = capture.accept(&chunk(2, 3, 3.0)).unwrap().unwrap();

        assert_eq!(done.bins.len(), 96);
        assert_eq!(done.bins[0], 1.0);
        assert_eq!(done.bins[32], 2.0);
        assert_eq!(done.bins[95], 3.0);
        assert_eq!(done.time, 1000);
        assert!(done.missing.is_empty());
        assert_eq!(capture.received(), 0);
    }

    #[test]
    fn test_missing_chunk_stays_zero() {
        let mut capture = FftCapture::new();
        capture.accept(&chunk(0, 3, 1.0)).unwrap();
        let done = capture.accept(&chunk(2, 3, 3.0)).unwrap().unwrap();
        assert_eq!(done.missing, vec![1]);
        assert!(done.bins[32..64].iter().all(|b| *b == 0.0));
    }

    #[test]
    fn test_out_of_range_sequence() {
        let mut capture = FftCapture::new();
        assert_eq!(
            capture.accept(&chunk(4, 3, 1.0)),
            Err(CaptureError::SequenceOutOfRange {
                sequence: 4,
                chunk_count: 3
            })
        );
        capture.accept(&chunk(0, 3, 1.0)).unwrap();
        assert_eq!(
            capture.accept(&chunk(1, 5, 1.0)),
            Err(CaptureError::ChunkCountChanged {
                expected: 3,
                found: 5
            })
        );
        assert_eq!(capture.accept(&chunk(0, 0, 1.0)), Err(CaptureError::EmptyTransfer));
    }
}
