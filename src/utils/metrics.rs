//! Per-session capture metrics
//!
//! Counters live behind shared atomics so the capture thread updates them
//! without taking the collection mutex.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counters for one capture session.
#[derive(Debug, Clone)]
pub struct SessionMetrics {
    /// Packets handed to the decoder
    packets_processed: Arc<AtomicU64>,
    /// Bytes handed to the decoder
    bytes_processed: Arc<AtomicU64>,
    /// Driver read errors (packet skipped)
    read_errors: Arc<AtomicU64>,
    /// Non-benign decode failures
    decode_errors: Arc<AtomicU64>,
}

impl Default for SessionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionMetrics {
    pub fn new() -> Self {
        Self {
            packets_processed: Arc::new(AtomicU64::new(0)),
            bytes_processed: Arc::new(AtomicU64::new(0)),
            read_errors: Arc::new(AtomicU64::new(0)),
            decode_errors: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn record_packet(&self, size: usize) {
        self.packets_processed.fetch_add(1, Ordering::Relaxed);
        self.bytes_processed.fetch_add(size as u64, Ordering::Relaxed);
    }

    pub fn record_read_error(&self) {
        self.read_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packets_processed(&self) -> u64 {
        self.packets_processed.load(Ordering::Relaxed)
    }

    pub fn bytes_processed(&self) -> u64 {
        self.bytes_processed.load(Ordering::Relaxed)
    }

    pub fn read_errors(&self) -> u64 {
        self.read_errors.load(Ordering::Relaxed)
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    /// One-line summary logged when a capture loop exits.
    pub fn summary(&self) -> String {
        format!(
            "{} packets, {} bytes, {} read errors, {} decode errors",
            self.packets_processed(),
            self.bytes_processed(),
            self.read_errors(),
            self.decode_errors()
        )
    }
}
