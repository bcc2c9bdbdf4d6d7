// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Observability counters and read-only snapshots.
//!
//! Counters are plain atomics bumped from under the interface lock and read
//! lock-free by the snapshot API. Exclusively informational.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::psn::Psn;
use crate::core::EpId;

/// Per-interface counters.
#[derive(Debug, Default)]
pub struct IfaceMetrics {
    pub rx_packets: AtomicU64,
    /// Datagrams discarded: GID mismatch, unknown endpoint, malformed
    /// header, or receive capacity exhausted.
    pub rx_drop: AtomicU64,
    pub rx_dup: AtomicU64,
    pub tx_packets: AtomicU64,
    pub retransmits: AtomicU64,
    pub acks_sent: AtomicU64,
    pub naks_sent: AtomicU64,
    pub comps_dispatched: AtomicU64,
    pub ep_timeouts: AtomicU64,
}

impl IfaceMetrics {
    #[inline]
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Interface snapshot.
#[derive(Debug, Clone)]
pub struct IfaceStats {
    pub tx_available: u16,
    pub rx_available: u16,
    pub tx_qp_len: u16,
    pub rx_qp_len: u16,
    pub num_eps: usize,
    pub rx_packets: u64,
    pub rx_drop: u64,
    pub rx_dup: u64,
    pub tx_packets: u64,
    pub retransmits: u64,
    pub acks_sent: u64,
    pub naks_sent: u64,
    pub comps_dispatched: u64,
    pub ep_timeouts: u64,
}

/// Per-endpoint snapshot.
#[derive(Debug, Clone)]
pub struct EpInfo {
    pub ep_id: EpId,
    pub dest_ep_id: EpId,
    pub conn_sn: u32,
    pub state: &'static str,
    pub flags: u16,
    pub psn: Psn,
    pub acked_psn: Psn,
    pub max_psn: Psn,
    pub rx_acked_psn: Psn,
    pub cwnd: u16,
    pub unack_len: usize,
    pub resend_count: u16,
}
