// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-peer endpoint: the reliability state machine.
//!
//! An endpoint owns one direction pair of PSN spaces towards a single remote
//! endpoint:
//!
//! - the **TX window** `(acked_psn, psn]` of sent-but-unacknowledged
//!   packets, bounded by `max_psn = acked_psn + cwnd`;
//! - the **RX cursor** `rx.acked_psn`, the last in-order PSN consumed, plus
//!   a bounded reorder buffer.
//!
//! ## Connection states
//!
//! ```text
//! Closed -> CreqSent -> CrepRcvd -> Connected -> Disconnecting -> Closed
//!                                      |
//!                                      +--> Failed
//! ```
//!
//! `CrepRcvd` covers the race where the peer's reply arrives before the
//! cumulative ACK that covers our own request; the next advancing ACK
//! promotes to `Connected`. A passively created endpoint (PRIVATE flag)
//! jumps to `Connected` once its reply is posted. Flag bits are orthogonal
//! to the state.
//!
//! Send/receive processing lives in [`tx`] and [`rx`]; the congestion
//! window in [`ca`].

pub mod ca;
pub mod rx;
pub mod tx;

use std::collections::VecDeque;
use std::time::Instant;

use crate::config::MIN_WINDOW;
use crate::conn_match::ConnSn;
use crate::core::psn::{self, Psn};
use crate::core::skb::{RxSkbId, SkbId};
use crate::core::{EpId, EP_NULL_ID};

/// Created internally in response to a received connection request; owned by
/// the interface until a local `create_ep` adopts it.
pub const EP_FLAG_PRIVATE: u16 = 0x01;
/// Present in one queue of the connection-match registry.
pub const EP_FLAG_ON_CEP: u16 = 0x02;
/// Connection request has been posted.
pub const EP_FLAG_CREQ_SENT: u16 = 0x04;
/// Connection reply has been posted.
pub const EP_FLAG_CREP_SENT: u16 = 0x08;
/// Closed by the user; draining until empty or linger expiry.
pub const EP_FLAG_DISCONNECTED: u16 = 0x10;
/// The error callback already fired for this endpoint.
pub const EP_FLAG_ERR_REPORTED: u16 = 0x20;
/// A retransmission epoch has shadows in flight.
pub const EP_FLAG_RESEND_IN_PROGRESS: u16 = 0x40;
/// Interface teardown is purging this endpoint.
pub const EP_FLAG_CANCEL_PENDING: u16 = 0x80;
/// A connection request from the peer has been consumed.
pub const EP_FLAG_CREQ_RCVD: u16 = 0x100;

/// Connection state (see module docs for the transition diagram).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpState {
    Closed,
    CreqSent,
    CrepRcvd,
    Connected,
    Disconnecting,
    Failed,
}

impl EpState {
    pub fn name(self) -> &'static str {
        match self {
            EpState::Closed => "closed",
            EpState::CreqSent => "creq-sent",
            EpState::CrepRcvd => "crep-rcvd",
            EpState::Connected => "connected",
            EpState::Disconnecting => "disconnecting",
            EpState::Failed => "failed",
        }
    }
}

/// TX-side window state.
pub struct EpTx {
    /// Next PSN to stamp.
    pub psn: Psn,
    /// Highest cumulatively acknowledged PSN.
    pub acked_psn: Psn,
    /// Send horizon; a send is admitted while `psn != max_psn`.
    pub max_psn: Psn,
    /// Sent-but-unacknowledged skbs, oldest first, PSNs contiguous.
    pub unack: VecDeque<SkbId>,
    /// Retransmission shadows currently in flight.
    pub resend_count: u16,
    /// Last time the cumulative ACK advanced (or an epoch restarted);
    /// the retransmit/peer-timeout reference point.
    pub ack_time: Instant,
    /// Last time anything was posted on this endpoint.
    pub send_time: Instant,
    /// Last time an ACK-REQ was solicited.
    pub poke_time: Instant,
}

/// RX-side state.
pub struct EpRx {
    /// Last in-order PSN consumed; also the piggy-back ACK value.
    pub acked_psn: Psn,
    /// Reorder buffer, circularly ascending, bounded by `ooo_psn_limit`.
    pub ooo: VecDeque<(Psn, RxSkbId)>,
    /// Packets consumed since the last ACK we sent (piggy-backed or
    /// explicit).
    pub unacked: u16,
    /// Peer solicited an explicit ACK.
    pub ack_req_pending: bool,
    /// Last time any packet arrived from the peer.
    pub last_time: Instant,
}

pub struct Ep {
    pub ep_id: EpId,
    /// Peer's endpoint id, learned during the handshake.
    pub dest_ep_id: EpId,
    pub conn_sn: ConnSn,
    pub path_index: u8,
    /// Fabric destination blob; doubles as the registry key.
    pub peer_addr: Option<Box<[u8]>>,
    pub state: EpState,
    pub flags: u16,
    pub tx: EpTx,
    pub rx: EpRx,
    /// Congestion window, within `[MIN_WINDOW, max_window]`.
    pub cwnd: u16,
    /// Retransmission backoff exponent.
    pub backoff_k: u32,
    /// Timer-wheel generation; stale wheel entries are ignored.
    pub timer_gen: u64,
    pub timer_armed: bool,
    /// Free-by deadline once the user closed the endpoint.
    pub linger_deadline: Option<Instant>,
}

impl Ep {
    pub fn new(
        conn_sn: ConnSn,
        path_index: u8,
        peer_addr: Option<Box<[u8]>>,
        initial_psn: Psn,
        now: Instant,
    ) -> Self {
        Self {
            ep_id: EP_NULL_ID,
            dest_ep_id: EP_NULL_ID,
            conn_sn,
            path_index,
            peer_addr,
            state: EpState::Closed,
            flags: 0,
            tx: EpTx {
                psn: initial_psn,
                acked_psn: initial_psn.wrapping_sub(1),
                // Room for the handshake packet only; opens to the full
                // congestion window once the peer endpoint id is known.
                max_psn: initial_psn.wrapping_add(1),
                unack: VecDeque::new(),
                resend_count: 0,
                ack_time: now,
                send_time: now,
                poke_time: now,
            },
            rx: EpRx {
                acked_psn: initial_psn.wrapping_sub(1),
                ooo: VecDeque::new(),
                unacked: 0,
                ack_req_pending: false,
                last_time: now,
            },
            cwnd: MIN_WINDOW,
            backoff_k: 0,
            timer_gen: 0,
            timer_armed: false,
            linger_deadline: None,
        }
    }

    #[inline]
    pub fn has_flag(&self, flag: u16) -> bool {
        (self.flags & flag) != 0
    }

    #[inline]
    pub fn set_flag(&mut self, flag: u16) {
        self.flags |= flag;
    }

    #[inline]
    pub fn clear_flag(&mut self, flag: u16) {
        self.flags &= !flag;
    }

    /// Sent-but-unacknowledged packet count.
    #[inline]
    pub fn in_flight(&self) -> u16 {
        psn::dist(self.tx.psn, self.tx.acked_psn).saturating_sub(1)
    }

    /// Sends admitted before the window closes.
    #[inline]
    pub fn tx_window_avail(&self) -> u16 {
        if psn::lt(self.tx.psn, self.tx.max_psn) {
            psn::dist(self.tx.max_psn, self.tx.psn)
        } else {
            0
        }
    }

    /// Recompute the send horizon. Before the peer endpoint id is known the
    /// window stays pinned to the handshake packet. A shrinking congestion
    /// window never moves the horizon behind the send cursor: admission
    /// simply stalls until the cumulative ACK catches up.
    pub fn update_max_psn(&mut self) {
        if self.dest_ep_id != EP_NULL_ID {
            let horizon = self.tx.acked_psn.wrapping_add(self.cwnd);
            self.tx.max_psn = if psn::lt(horizon, self.tx.psn) {
                self.tx.psn
            } else {
                horizon
            };
        }
    }

    /// Nothing in flight, no shadows pending.
    #[inline]
    pub fn tx_drained(&self) -> bool {
        self.tx.unack.is_empty() && self.tx.resend_count == 0
    }

    /// Invalidate any armed timer.
    pub fn cancel_timer(&mut self) {
        self.timer_gen = self.timer_gen.wrapping_add(1);
        self.timer_armed = false;
    }

    #[cfg(test)]
    pub(crate) fn new_for_test() -> Self {
        Self::new(0, 0, None, 1, Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ep_initial_window_is_handshake_only() {
        let ep = Ep::new(0, 0, None, 1, Instant::now());
        assert_eq!(ep.tx.psn, 1);
        assert_eq!(ep.tx.acked_psn, 0);
        assert_eq!(ep.tx_window_avail(), 1);
        assert_eq!(ep.in_flight(), 0);
    }

    #[test]
    fn test_ep_window_opens_when_dest_known() {
        let mut ep = Ep::new(0, 0, None, 1, Instant::now());
        ep.update_max_psn();
        assert_eq!(ep.tx_window_avail(), 1, "window pinned while dest unknown");
        ep.dest_ep_id = 42;
        ep.cwnd = 8;
        ep.update_max_psn();
        // psn sits one past acked_psn, so the admissible count is cwnd - 1
        // (invariant: psn <= max_psn = acked_psn + cwnd).
        assert_eq!(ep.tx_window_avail(), ep.cwnd - 1);
    }

    #[test]
    fn test_ep_window_math_across_wrap() {
        let mut ep = Ep::new(0, 0, None, 0xFFFE, Instant::now());
        ep.dest_ep_id = 1;
        ep.update_max_psn();
        // Window straddles the wrap point.
        assert_eq!(ep.tx.max_psn, 0xFFFDu16.wrapping_add(ep.cwnd));
        assert_eq!(ep.tx_window_avail(), ep.cwnd.saturating_sub(1));
        ep.tx.psn = ep.tx.psn.wrapping_add(1);
        assert_eq!(ep.in_flight(), 1);
    }

    #[test]
    fn test_ep_window_closed_when_cwnd_shrinks_below_flight() {
        let mut ep = Ep::new(0, 0, None, 1, Instant::now());
        ep.dest_ep_id = 1;
        ep.cwnd = 4;
        ep.update_max_psn(); // max = 0 + 4
        ep.tx.psn = 5; // 4 in flight
        ep.cwnd = 2;
        ep.update_max_psn(); // max = 2 < psn
        assert_eq!(ep.tx_window_avail(), 0);
    }

    #[test]
    fn test_ep_flags() {
        let mut ep = Ep::new_for_test();
        assert!(!ep.has_flag(EP_FLAG_PRIVATE));
        ep.set_flag(EP_FLAG_PRIVATE | EP_FLAG_ON_CEP);
        assert!(ep.has_flag(EP_FLAG_PRIVATE));
        ep.clear_flag(EP_FLAG_PRIVATE);
        assert!(!ep.has_flag(EP_FLAG_PRIVATE));
        assert!(ep.has_flag(EP_FLAG_ON_CEP));
    }

    #[test]
    fn test_ep_timer_generation() {
        let mut ep = Ep::new_for_test();
        let g = ep.timer_gen;
        ep.cancel_timer();
        assert_ne!(ep.timer_gen, g);
        assert!(!ep.timer_armed);
    }
}
