// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Channel configuration.
//!
//! [`ChannelConfig`] controls socket options, connect retry policy, framing
//! limits, and the size of the callback worker pool. All fields have
//! defaults suitable for low-latency loopback and LAN use:
//!
//! ```
//! use netchan::ChannelConfig;
//! use std::time::Duration;
//!
//! let config = ChannelConfig {
//!     max_message_size: 1024 * 1024,
//!     ..Default::default()
//! };
//! assert_eq!(config.initial_backoff, Duration::from_millis(10));
//! ```

use std::time::Duration;

/// Configuration shared by every channel created from one [`IoCore`].
///
/// [`IoCore`]: crate::IoCore
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    // === Socket ===
    /// Enable TCP_NODELAY (disable Nagle's algorithm) on every stream.
    pub nodelay: bool,

    /// TCP listen backlog for server sessions.
    pub listen_backlog: u32,

    // === Connect retry ===
    /// Delay before the first connect retry.
    pub initial_backoff: Duration,

    /// Multiplier applied to the backoff after each failed attempt.
    pub backoff_factor: f64,

    /// Upper bound on the retry delay. Once the backoff has grown to this
    /// value, persistent connect errors are logged.
    pub max_backoff: Duration,

    // === Framing ===
    /// Maximum incoming message size in bytes (anti-OOM protection).
    ///
    /// A recv operation whose announced size exceeds this limit fails the
    /// channel rather than allocating the buffer.
    pub max_message_size: usize,

    // === Executor ===
    /// Number of worker threads draining completion callbacks.
    pub worker_threads: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            nodelay: true, // Low latency
            listen_backlog: 128,

            initial_backoff: Duration::from_millis(10),
            backoff_factor: 1.2,
            max_backoff: Duration::from_millis(1000),

            max_message_size: 16 * 1024 * 1024, // 16 MB

            worker_threads: 2,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ChannelConfig::default();

        assert!(config.nodelay);
        assert_eq!(config.listen_backlog, 128);
        assert_eq!(config.initial_backoff, Duration::from_millis(10));
        assert_eq!(config.backoff_factor, 1.2);
        assert_eq!(config.max_backoff, Duration::from_millis(1000));
        assert_eq!(config.max_message_size, 16 * 1024 * 1024);
        assert_eq!(config.worker_threads, 2);
    }

    #[test]
    fn test_struct_update() {
        let config = ChannelConfig {
            worker_threads: 4,
            ..Default::default()
        };
        assert_eq!(config.worker_threads, 4);
        assert!(config.nodelay);
    }
}
