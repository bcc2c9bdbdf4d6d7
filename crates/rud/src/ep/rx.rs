// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Endpoint receive path.
//!
//! Every incoming packet first yields its piggy-back cumulative ACK. A
//! packet that consumes a PSN (active message, put, CREQ/CREP) then runs
//! through the in-order check: deliver and drain the reorder buffer, buffer
//! within the tolerance, or drop-and-NAK beyond it. Duplicates are dropped
//! and re-acknowledged. Delivery defers to `pending_rx_q` in asynchronous
//! context; handshake effects apply inline in any context.

use std::time::Instant;

use crate::core::psn;
use crate::core::skb::{RecvKind, RecvSkb};
use crate::core::{EpId, EP_NULL_ID};
use crate::ep::{
    ca, tx as ep_tx, Ep, EpState, EP_FLAG_CREQ_RCVD, EP_FLAG_DISCONNECTED, EP_FLAG_ON_CEP,
    EP_FLAG_PRIVATE,
};
use crate::iface::stats::IfaceMetrics;
use crate::iface::{Dispatch, State};
use crate::proto::{self, CtlMsg, Neth};

/// Process one packet already routed to its endpoint.
pub(crate) fn rx_packet(
    st: &mut State,
    ep_id: EpId,
    neth: &Neth,
    data: Vec<u8>,
    now: Instant,
    dispatch: &mut Vec<Dispatch>,
) {
    {
        let Some(ep) = st.eps.get_mut(ep_id) else {
            IfaceMetrics::inc(&st.metrics.rx_drop);
            return;
        };
        ep.rx.last_time = now;
        if neth.ack_req {
            ep.rx.ack_req_pending = true;
        }
    }

    process_ack(st, ep_id, neth.ack_psn, now, dispatch);

    if neth.is_ctl {
        let addr_len = st.cep.address_length();
        match proto::decode_ctl(&data[proto::NETH_LEN..], addr_len) {
            Some(CtlMsg::Creq { .. }) | Some(CtlMsg::Crep { .. }) => {
                let len = data.len() - proto::NETH_LEN;
                let skb = RecvSkb {
                    kind: RecvKind::Ctl,
                    off: proto::NETH_LEN,
                    len,
                    psn: neth.psn,
                    data,
                };
                rx_reliable(st, ep_id, skb, now, dispatch);
            }
            Some(CtlMsg::Nak { expected }) => on_nak(st, ep_id, expected, now),
            Some(CtlMsg::ResendStart { .. }) => {
                // The sender is replaying; answer with the true cumulative
                // ACK immediately so a lost-ACK episode resolves in one RTT.
                let _ = ep_tx::send_ctl_ack(st, ep_id);
            }
            None => IfaceMetrics::inc(&st.metrics.rx_drop),
        }
    } else if neth.is_put {
        match proto::decode_put_hdr(&data[proto::NETH_LEN..]) {
            Some(rva) => {
                let off = proto::NETH_LEN + proto::PUT_HDR_LEN;
                let len = data.len() - off;
                let skb = RecvSkb {
                    kind: RecvKind::Put(rva),
                    off,
                    len,
                    psn: neth.psn,
                    data,
                };
                rx_reliable(st, ep_id, skb, now, dispatch);
            }
            None => IfaceMetrics::inc(&st.metrics.rx_drop),
        }
    } else if data.len() > proto::NETH_LEN {
        let len = data.len() - proto::NETH_LEN;
        let skb = RecvSkb {
            kind: RecvKind::Am(neth.am_id),
            off: proto::NETH_LEN,
            len,
            psn: neth.psn,
            data,
        };
        rx_reliable(st, ep_id, skb, now, dispatch);
    }
    // else: bare acknowledgment, fully handled above.

    check_tx_ack(st, ep_id);
}

/// Apply a cumulative acknowledgment.
fn process_ack(
    st: &mut State,
    ep_id: EpId,
    ack_psn: u16,
    now: Instant,
    dispatch: &mut Vec<Dispatch>,
) {
    let max_window = st.cfg.max_window;
    let Some(ep) = st.eps.get_mut(ep_id) else {
        return;
    };
    // Accept only ACKs that advance and stay within what was actually sent.
    if !psn::lt(ep.tx.acked_psn, ack_psn) || !psn::lt(ack_psn, ep.tx.psn) {
        return;
    }
    ep.tx.acked_psn = ack_psn;
    ep.tx.ack_time = now;
    ep.backoff_k = 0;
    ca::on_ack_advance(ep, max_window);

    ep_tx::window_release_completed(st, ep_id, dispatch);

    let Some(ep) = st.eps.get_mut(ep_id) else {
        return;
    };
    if ep.state == EpState::CrepRcvd && ep.in_flight() == 0 {
        ep.state = EpState::Connected;
        log::debug!("[ep] id={} connected", ep_id);
    }
}

/// In-order check for a PSN-consuming packet.
fn rx_reliable(
    st: &mut State,
    ep_id: EpId,
    skb: RecvSkb,
    now: Instant,
    dispatch: &mut Vec<Dispatch>,
) {
    let psn_in = skb.psn;
    let ooo_limit = st.cfg.ooo_psn_limit;
    let Some(ep) = st.eps.get_mut(ep_id) else {
        IfaceMetrics::inc(&st.metrics.rx_drop);
        return;
    };
    let expected = ep.rx.acked_psn.wrapping_add(1);

    if psn_in == expected {
        ep.rx.acked_psn = psn_in;
        let Some(id) = st.rx_slot_insert(skb) else {
            // Receive capacity exhausted: pretend the wire lost it.
            let ep = st.eps.get_mut(ep_id).expect("ep alive");
            ep.rx.acked_psn = ep.rx.acked_psn.wrapping_sub(1);
            IfaceMetrics::inc(&st.metrics.rx_drop);
            return;
        };
        deliver(st, ep_id, id, now, dispatch);
        drain_ooo(st, ep_id, now, dispatch);
    } else if psn::lt(psn_in, expected) {
        // Duplicate: drop and re-acknowledge.
        IfaceMetrics::inc(&st.metrics.rx_dup);
        ep.rx.ack_req_pending = true;
    } else if psn::dist(psn_in, expected) <= ooo_limit {
        if ep.rx.ooo.len() >= ooo_limit as usize
            || ep.rx.ooo.iter().any(|&(p, _)| p == psn_in)
        {
            IfaceMetrics::inc(&st.metrics.rx_drop);
            return;
        }
        let pos = ep
            .rx
            .ooo
            .iter()
            .position(|&(p, _)| psn::dist(p, expected) > psn::dist(psn_in, expected));
        let Some(id) = st.rx_slot_insert(skb) else {
            IfaceMetrics::inc(&st.metrics.rx_drop);
            return;
        };
        let ep = st.eps.get_mut(ep_id).expect("ep alive");
        match pos {
            Some(i) => ep.rx.ooo.insert(i, (psn_in, id)),
            None => ep.rx.ooo.push_back((psn_in, id)),
        }
    } else {
        // Beyond reorder tolerance: drop and ask for the retransmit.
        IfaceMetrics::inc(&st.metrics.rx_drop);
        ep_tx::send_nak(st, ep_id, expected);
    }
}

/// Consume one in-order packet: dispatch to the user (or defer), or apply
/// handshake effects inline.
fn deliver(st: &mut State, ep_id: EpId, id: crate::core::skb::RxSkbId, now: Instant, dispatch: &mut Vec<Dispatch>) {
    // Count the consumption first: a handshake reply sent below piggy-backs
    // the advanced cursor and clears this debt again.
    if let Some(ep) = st.eps.get_mut(ep_id) {
        ep.rx.unacked = ep.rx.unacked.saturating_add(1);
    }
    let kind = st.rx.pool.get(id).kind;
    match kind {
        RecvKind::Ctl => {
            let skb = st.rx_slot_take(id);
            let addr_len = st.cep.address_length();
            match proto::decode_ctl(&skb.data[skb.off..], addr_len) {
                Some(CtlMsg::Creq {
                    src_ep, peer_addr, ..
                }) => apply_creq(st, ep_id, src_ep, &peer_addr, now),
                Some(CtlMsg::Crep { src_ep }) => apply_crep(st, ep_id, src_ep),
                _ => {}
            }
        }
        RecvKind::Am(am_id) => {
            let disconnecting = st
                .eps
                .get(ep_id)
                .is_some_and(|ep| ep.has_flag(EP_FLAG_DISCONNECTED));
            if disconnecting {
                // The user is gone; consume without delivering so the
                // sender's window keeps draining.
                st.rx_slot_release(id);
            } else if st.in_async {
                st.rx.pending_q.push_back(id);
            } else {
                let skb = st.rx_slot_take(id);
                dispatch.push(Dispatch::Am { am_id, skb });
            }
        }
        RecvKind::Put(rva) => {
            let disconnecting = st
                .eps
                .get(ep_id)
                .is_some_and(|ep| ep.has_flag(EP_FLAG_DISCONNECTED));
            if disconnecting {
                st.rx_slot_release(id);
            } else if st.in_async {
                st.rx.pending_q.push_back(id);
            } else {
                let skb = st.rx_slot_take(id);
                dispatch.push(Dispatch::Put { rva, skb });
            }
        }
    }
}

/// Deliver any reorder-buffer prefix made contiguous by an advance.
fn drain_ooo(st: &mut State, ep_id: EpId, now: Instant, dispatch: &mut Vec<Dispatch>) {
    loop {
        let Some(ep) = st.eps.get_mut(ep_id) else {
            return;
        };
        let Some(&(p, id)) = ep.rx.ooo.front() else {
            return;
        };
        if psn::le(p, ep.rx.acked_psn) {
            // Stale duplicate buffered before the retransmit won the race.
            ep.rx.ooo.pop_front();
            st.rx_slot_release(id);
            continue;
        }
        if p == ep.rx.acked_psn.wrapping_add(1) {
            ep.rx.ooo.pop_front();
            ep.rx.acked_psn = p;
            deliver(st, ep_id, id, now, dispatch);
            continue;
        }
        return;
    }
}

/// Send an explicit ACK if the debt crossed the threshold or the peer asked.
fn check_tx_ack(st: &mut State, ep_id: EpId) {
    let threshold = st.cfg.ack_threshold;
    let Some(ep) = st.eps.get(ep_id) else {
        return;
    };
    if ep.dest_ep_id == EP_NULL_ID {
        return;
    }
    if ep.rx.unacked >= threshold || ep.rx.ack_req_pending {
        let _ = ep_tx::send_ctl_ack(st, ep_id);
    }
}

/// Loss signal from the receiver: enter a retransmission epoch at once.
fn on_nak(st: &mut State, ep_id: EpId, expected: u16, now: Instant) {
    let Some(ep) = st.eps.get(ep_id) else {
        return;
    };
    log::debug!(
        "[ep] id={} nak expected={} acked={}",
        ep_id,
        expected,
        ep.tx.acked_psn
    );
    if !ep.tx.unack.is_empty() {
        ep_tx::start_resend_epoch(st, ep_id, now);
    }
}

/// Bind a consumed connection request to this endpoint and reply.
fn apply_creq(st: &mut State, ep_id: EpId, src_ep: EpId, creq_peer_addr: &[u8], now: Instant) {
    {
        let Some(ep) = st.eps.get_mut(ep_id) else {
            return;
        };
        ep.set_flag(EP_FLAG_CREQ_RCVD);
        if ep.dest_ep_id == EP_NULL_ID {
            ep.dest_ep_id = src_ep;
        }
        if ep.peer_addr.is_none() {
            ep.peer_addr = Some(creq_peer_addr.into());
        }
        ep.update_max_psn();
        if ep.state == EpState::Closed {
            // Passively created endpoint: serving once the reply is out.
            ep.state = EpState::Connected;
        }
        log::debug!("[ep] id={} creq bound dest={}", ep_id, src_ep);
    }
    if ep_tx::send_crep(st, ep_id, now).is_err() {
        // Pool pressure; the endpoint timer retries.
        let tick = st.cfg.timer_tick;
        st.ensure_ep_timer(ep_id, now + tick);
    }
}

/// Bind a consumed connection reply.
fn apply_crep(st: &mut State, ep_id: EpId, src_ep: EpId) {
    let Some(ep) = st.eps.get_mut(ep_id) else {
        return;
    };
    ep.dest_ep_id = src_ep;
    ep.update_max_psn();
    if matches!(ep.state, EpState::CreqSent | EpState::Closed) {
        ep.state = if ep.in_flight() == 0 {
            EpState::Connected
        } else {
            EpState::CrepRcvd
        };
    }
    log::debug!(
        "[ep] id={} crep bound dest={} state={}",
        ep_id,
        src_ep,
        ep.state.name()
    );
}

/// Resolve the endpoint a connection request addresses, creating a private
/// one when nothing matches. Returns `None` when the request must be
/// ignored (closed endpoint, malformed address).
pub(crate) fn handle_creq(
    st: &mut State,
    src_ep: EpId,
    conn_sn: u32,
    path_index: u8,
    peer_addr: &[u8],
    creq_psn: u16,
    now: Instant,
) -> Option<EpId> {
    if peer_addr.len() != st.cep.address_length() {
        IfaceMetrics::inc(&st.metrics.rx_drop);
        return None;
    }

    if let Some(ep_id) = st
        .cep
        .get(peer_addr, conn_sn, crate::conn_match::QueueType::Any, false)
    {
        let ep = st.eps.get(ep_id)?;
        if ep.has_flag(EP_FLAG_DISCONNECTED) {
            return None;
        }
        return Some(ep_id);
    }

    // A retransmitted request can arrive after its private endpoint was
    // adopted (and left the registry); route it to the adopted endpoint
    // instead of creating a twin.
    for id in st.eps.ids() {
        let ep = st.eps.get(id).expect("listed ep alive");
        if ep.conn_sn == conn_sn && ep.peer_addr.as_deref() == Some(peer_addr) {
            if ep.has_flag(EP_FLAG_DISCONNECTED) {
                return None;
            }
            return Some(id);
        }
    }

    let mut ep = Ep::new(
        conn_sn,
        path_index,
        Some(peer_addr.into()),
        st.cfg.initial_psn,
        now,
    );
    // Expect exactly the request's PSN next.
    ep.rx.acked_psn = creq_psn.wrapping_sub(1);
    ep.dest_ep_id = src_ep;
    ep.set_flag(EP_FLAG_PRIVATE | EP_FLAG_ON_CEP);
    let ep_id = st.eps.insert(Box::new(ep));
    st.cep
        .insert(peer_addr, conn_sn, ep_id, crate::conn_match::QueueType::Unexp);
    log::debug!(
        "[ep] id={} private created for conn_sn={} src={}",
        ep_id,
        conn_sn,
        src_ep
    );
    Some(ep_id)
}
