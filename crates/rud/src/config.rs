// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Interface configuration.
//!
//! All knobs an interface recognizes, with their defaults. Validation runs
//! once in `Iface::new`; a violation fails the open with
//! [`crate::Error::InvalidParam`].

use std::time::Duration;

/// Smallest congestion window.
pub const MIN_WINDOW: u16 = 2;
/// Hard ceiling on the congestion window (and on `max_window`).
pub const MAX_WINDOW_LIMIT: u16 = 1024;
/// A data send is signaled once every this many posts, so the send queue can
/// be reaped without signaling every completion.
pub const TX_MODERATION: u16 = 64;
/// Lower bound on the retransmission backoff multiplier.
pub const MIN_TIMER_BACKOFF: f64 = 1.0;

/// Interface configuration.
#[derive(Debug, Clone)]
pub struct IfaceConfig {
    /// Keep a closed endpoint alive internally for this long to drain
    /// retransmits before freeing it.
    pub linger_timeout: Duration,
    /// Consider the remote peer unreachable if no acknowledgment arrived
    /// after this amount of time.
    pub peer_timeout: Duration,
    /// Initial timeout for retransmissions.
    pub timer_tick: Duration,
    /// Timeout multiplier per retransmission epoch (>= 1.0).
    pub timer_backoff: f64,
    /// Period of the asynchronous progress timer.
    pub async_timer_tick: Duration,
    /// Minimal interval between solicited ACK requests, to wake a remote
    /// peer that is not actively calling progress.
    pub min_poke_time: Duration,
    /// Verify the GRH destination GID of incoming packets on Ethernet
    /// fabrics; mismatched packets are silently dropped.
    pub eth_dgid_check: bool,
    /// Max congestion avoidance window, in `[MIN_WINDOW, MAX_WINDOW_LIMIT]`.
    pub max_window: u16,
    /// Max receive completions picked up during one asynchronous poll.
    pub rx_async_max_poll: u32,
    /// Send queue length (also the TX skb pool size).
    pub tx_qp_len: u16,
    /// Receive queue length (also the RX skb table size).
    pub rx_qp_len: u16,
    /// Receive capacity granted before `progress_enable(RECV)`; the rest is
    /// withheld as quota.
    pub rx_queue_len_init: u16,
    /// Max packet size including the network header; clamped to the fabric
    /// payload limit at open.
    pub seg_size: usize,
    /// Send an explicit ACK after this many unacknowledged received packets.
    pub ack_threshold: u16,
    /// Reorder tolerance: packets at most this far ahead of the expected PSN
    /// are buffered, anything further is dropped and NAKed.
    pub ooo_psn_limit: u16,
    /// First PSN of every new endpoint. The protocol only needs both sides
    /// to agree; values near the wrap point exercise circular arithmetic.
    pub initial_psn: u16,
}

impl Default for IfaceConfig {
    fn default() -> Self {
        Self {
            linger_timeout: Duration::from_secs(5 * 60),
            peer_timeout: Duration::from_secs(30),
            timer_tick: Duration::from_millis(10),
            timer_backoff: 2.0,
            async_timer_tick: Duration::from_millis(100),
            min_poke_time: Duration::from_millis(250),
            eth_dgid_check: true,
            max_window: MAX_WINDOW_LIMIT,
            rx_async_max_poll: 64,
            tx_qp_len: 256,
            rx_qp_len: 4096,
            rx_queue_len_init: 64,
            seg_size: 8192,
            ack_threshold: 8,
            ooo_psn_limit: 16,
            initial_psn: 1,
        }
    }
}

impl IfaceConfig {
    /// Validate the configuration.
    pub(crate) fn validate(&self) -> crate::Result<()> {
        if self.timer_tick.is_zero() {
            return Err(crate::Error::InvalidParam(
                "timer tick must be > 0".into(),
            ));
        }
        if self.timer_backoff < MIN_TIMER_BACKOFF {
            return Err(crate::Error::InvalidParam(format!(
                "timer backoff must be >= {} (got {})",
                MIN_TIMER_BACKOFF, self.timer_backoff
            )));
        }
        if self.async_timer_tick.is_zero() {
            return Err(crate::Error::InvalidParam(
                "async timer tick must be > 0".into(),
            ));
        }
        if self.max_window < MIN_WINDOW || self.max_window > MAX_WINDOW_LIMIT {
            return Err(crate::Error::InvalidParam(format!(
                "max window must be in [{}, {}] (got {})",
                MIN_WINDOW, MAX_WINDOW_LIMIT, self.max_window
            )));
        }
        if self.tx_qp_len <= TX_MODERATION {
            return Err(crate::Error::InvalidParam(format!(
                "tx queue is too short ({} <= {})",
                self.tx_qp_len, TX_MODERATION
            )));
        }
        if self.rx_qp_len == 0 || self.rx_queue_len_init == 0 {
            return Err(crate::Error::InvalidParam(
                "rx queue lengths must be > 0".into(),
            ));
        }
        if self.seg_size <= crate::proto::NETH_LEN {
            return Err(crate::Error::InvalidParam(
                "segment size must exceed the header length".into(),
            ));
        }
        if self.ooo_psn_limit == 0 {
            return Err(crate::Error::InvalidParam(
                "reorder tolerance must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_are_valid() {
        assert!(IfaceConfig::default().validate().is_ok());
    }

    #[test]
    fn test_config_rejects_bad_backoff() {
        let cfg = IfaceConfig {
            timer_backoff: 0.5,
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(crate::Error::InvalidParam(_))
        ));
    }

    #[test]
    fn test_config_rejects_zero_tick() {
        let cfg = IfaceConfig {
            timer_tick: Duration::ZERO,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_config_rejects_window_out_of_range() {
        let cfg = IfaceConfig {
            max_window: 1,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
        let cfg = IfaceConfig {
            max_window: MAX_WINDOW_LIMIT + 1,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_config_rejects_short_tx_queue() {
        let cfg = IfaceConfig {
            tx_qp_len: TX_MODERATION,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
