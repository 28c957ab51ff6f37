//! Delivery statistics for stream sessions

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Counters updated on the chunk delivery path
///
/// All fields are atomics so the output reader can update them without
/// taking the subscriber set lock for longer than a delivery pass.
#[derive(Debug)]
pub struct SessionStats {
    started_at: Instant,
    /// Chunks read from the transcoder
    chunks_in: AtomicU64,
    /// Bytes read from the transcoder
    bytes_in: AtomicU64,
    /// Chunk copies handed to subscriber queues
    chunks_delivered: AtomicU64,
    /// Subscribers dropped because their queue was full
    slow_drops: AtomicU64,
}

impl Default for SessionStats {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStats {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            chunks_in: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            chunks_delivered: AtomicU64::new(0),
            slow_drops: AtomicU64::new(0),
        }
    }

    /// Record one chunk from the transcoder and how many queues received it
    pub fn record_chunk(&self, len: usize, delivered: usize) {
        self.chunks_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(len as u64, Ordering::Relaxed);
        self.chunks_delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
    }

    pub fn record_slow_drop(&self) {
        self.slow_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn duration(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Input bitrate in bits per second
    pub fn bitrate(&self) -> u64 {
        let secs = self.duration().as_secs();
        if secs > 0 {
            (self.bytes_in.load(Ordering::Relaxed) * 8) / secs
        } else {
            0
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            chunks_in: self.chunks_in.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            chunks_delivered: self.chunks_delivered.load(Ordering::Relaxed),
            slow_drops: self.slow_drops.load(Ordering::Relaxed),
            bitrate: self.bitrate(),
        }
    }
}

/// Point-in-time copy of [`SessionStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub chunks_in: u64,
    pub bytes_in: u64,
    pub chunks_delivered: u64,
    pub slow_drops: u64,
    pub bitrate: u64,
}
