// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-channel transfer statistics.
//!
//! Counters are plain atomics with relaxed ordering. They are only ever
//! incremented from the owning pipeline's strand, so the coherent way to
//! read them is through [`Channel::total_sent`] / [`Channel::total_received`]
//! which dispatch onto that strand. [`ChannelStats::reset`] deliberately
//! does not synchronize (caller-beware; reset an idle channel).
//!
//! [`Channel::total_sent`]: crate::Channel::total_sent
//! [`Channel::total_received`]: crate::Channel::total_received

use std::sync::atomic::{AtomicU64, Ordering};

/// Byte counters for one channel.
#[derive(Debug, Default)]
pub struct ChannelStats {
    /// Payload bytes moved by successful send operations.
    bytes_sent: AtomicU64,

    /// Payload bytes moved by successful recv operations.
    bytes_received: AtomicU64,
}

impl ChannelStats {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record bytes moved by a send operation.
    pub fn record_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record bytes moved by a recv operation.
    pub fn record_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Raw read of the sent counter.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Raw read of the received counter.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Capture both counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_sent: self.bytes_sent(),
            bytes_received: self.bytes_received(),
        }
    }

    /// Zero both counters. Not synchronized with in-flight transfers.
    pub fn reset(&self) {
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time copy of the counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Payload bytes sent.
    pub bytes_sent: u64,

    /// Payload bytes received.
    pub bytes_received: u64,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let stats = ChannelStats::new();
        stats.record_sent(4);
        stats.record_sent(16);
        stats.record_received(8);

        let snap = stats.snapshot();
        assert_eq!(snap.bytes_sent, 20);
        assert_eq!(snap.bytes_received, 8);
    }

    #[test]
    fn test_reset() {
        let stats = ChannelStats::new();
        stats.record_sent(100);
        stats.record_received(200);
        stats.reset();

        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }
}
