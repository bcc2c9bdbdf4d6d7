// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Progress engine.
//!
//! One tick, in this order: TX completions, deferred receive drain (sync
//! only), RX poll and routing, timer wheel, pending arbiter, deferred
//! completion drain. Everything runs under the interface lock; the
//! collected [`Dispatch`] actions are invoked after it drops.
//!
//! The asynchronous tick runs the same pipeline with `in_async` set, which
//! reroutes deliveries into `pending_rx_q`, acknowledged completions into
//! `async_comp_q`, and error actions into the deferral vector, then wakes
//! the user thread. No user code ever runs from the timer thread.

use std::io;
use std::time::Instant;

use crate::core::psn;
use crate::core::skb::{RecvKind, SkbId, SKB_FLAG_INVALID, SKB_FLAG_RESENDING};
use crate::core::{EpId, EP_NULL_ID};
use crate::ep::{rx as ep_rx, tx as ep_tx, EP_FLAG_CANCEL_PENDING, EP_FLAG_ON_CEP,
    EP_FLAG_RESEND_IN_PROGRESS};
use crate::iface::pending::{PendingMsg, PendingOp};
use crate::iface::stats::IfaceMetrics;
use crate::iface::{Dispatch, IfaceInner, State};
use crate::proto::{self, CtlMsg};
use crate::Error;

/// Bounded batch for the deferred-completion drain.
const ASYNC_COMP_BATCH: usize = 64;
/// Round guard for the pending arbiter.
const PENDING_MAX_ROUNDS: usize = 64;

/// One progress tick. Returns the actions to dispatch (always empty for the
/// asynchronous tick, which defers instead).
pub(crate) fn progress_once(inner: &IfaceInner, is_async: bool) -> Vec<Dispatch> {
    let mut dispatch = Vec::new();
    let mut st = inner.state.lock();
    if st.closing {
        return dispatch;
    }
    st.in_async = is_async;
    let now = Instant::now();

    // A device-level fatal event fails every endpoint before any other
    // work of this tick observes the interface.
    if let Some(err) = st.fabric.poll_fatal() {
        handle_device_fatal(&mut st, &mut dispatch, &err);
    }

    poll_tx(&mut st, &mut dispatch);
    if !is_async {
        drain_pending_rx(&mut st, &mut dispatch);
    }
    poll_rx(&mut st, &mut dispatch, now);
    advance_timers(&mut st, &mut dispatch, now);
    dispatch_pending(&mut st, now);
    if !is_async {
        drain_async_comps(&mut st, &mut dispatch);
        let mut deferred = std::mem::take(&mut st.deferred);
        dispatch.append(&mut deferred);
    }
    st.in_async = false;

    let wake = is_async
        && (!st.rx.pending_q.is_empty()
            || !st.tx.async_comp_q.is_empty()
            || !st.deferred.is_empty());
    drop(st);
    if wake {
        let _ = inner.wake_tx.try_send(());
    }
    dispatch
}

/// Timer-thread entry point.
pub(crate) fn progress_async(inner: &IfaceInner) {
    let actions = progress_once(inner, true);
    debug_assert!(actions.is_empty(), "async tick must defer all actions");
}

/// Fan a device-level fatal event out to every live endpoint: all of them
/// transition to `Failed` (completions and the error callback carry the
/// device error) under the same lock hold that consumed the event, so no
/// observer ever sees a partially failed interface.
fn handle_device_fatal(st: &mut State, dispatch: &mut Vec<Dispatch>, err: &Error) {
    log::error!("[iface] fatal device event: {}", err);
    let msg = err.to_string();
    for ep_id in st.eps.ids() {
        let m = msg.clone();
        let mk = move || Error::Io(io::Error::new(io::ErrorKind::Other, m.clone()));
        st.fail_ep(ep_id, dispatch, &mk);
    }
}

/// Reap fabric send completions and retire outstanding control skbs.
fn poll_tx(st: &mut State, dispatch: &mut Vec<Dispatch>) {
    let comps = st.fabric.poll_tx();
    for c in comps {
        if st.tx.ordered {
            // A completion covers every post up to its sequence.
            let n = psn::dist(c.sn, st.tx.last_comp_sn);
            st.tx.last_comp_sn = c.sn;
            st.tx.available = st.tx.available.saturating_add(n).min(st.tx.qp_len);
            loop {
                let Some(&front) = st.tx.outstanding_q.front() else {
                    break;
                };
                let sn = st
                    .tx
                    .pool
                    .get(front)
                    .ctl
                    .as_ref()
                    .expect("outstanding skb has ctl desc")
                    .sn;
                if psn::le(sn, c.sn) {
                    st.tx.outstanding_q.pop_front();
                    ctl_skb_complete(st, front, dispatch);
                } else {
                    break;
                }
            }
        } else {
            st.tx.available = st.tx.available.saturating_add(1).min(st.tx.qp_len);
            if let Some(id) = st.tx.outstanding_map.remove(&c.sn) {
                ctl_skb_complete(st, id, dispatch);
            }
        }
    }
}

/// Retire one signaled control skb: a completed retransmission shadow
/// clears `RESENDING` on its original and decrements the owner's shadow
/// count; any window prefix that became releasable is released.
pub(crate) fn ctl_skb_complete(st: &mut State, skb_id: SkbId, dispatch: &mut Vec<Dispatch>) {
    let desc = st
        .tx
        .pool
        .get_mut(skb_id)
        .ctl
        .take()
        .expect("ctl skb has desc");

    if let Some(orig) = desc.resent_skb {
        let orig_skb = st.tx.pool.get_mut(orig);
        // The original may already be gone if the endpoint failed while the
        // shadow was in flight.
        if !orig_skb.has(SKB_FLAG_INVALID) {
            orig_skb.flags &= !SKB_FLAG_RESENDING;
        }
        if let Some(ep) = st.eps.get_mut(desc.ep) {
            ep.tx.resend_count = ep.tx.resend_count.saturating_sub(1);
            if ep.tx.resend_count == 0 {
                ep.clear_flag(EP_FLAG_RESEND_IN_PROGRESS);
                // Next epoch runs after the backed-off delay (the timer
                // gates on ack_time + tick * backoff^k).
                let tick = st.cfg.timer_tick;
                st.ensure_ep_timer(desc.ep, Instant::now() + tick);
            }
        }
    }

    ep_tx::window_release_completed(st, desc.ep, dispatch);
    st.tx.pool.release(skb_id);
}

/// Poll the fabric for datagrams and route them.
fn poll_rx(st: &mut State, dispatch: &mut Vec<Dispatch>, now: Instant) {
    let mut budget = st.rx.available as usize;
    if st.in_async {
        budget = budget.min(st.cfg.rx_async_max_poll as usize);
    }
    if budget == 0 {
        return;
    }
    let dgs = st.fabric.poll_rx(budget);
    for dg in dgs {
        IfaceMetrics::inc(&st.metrics.rx_packets);
        if let Some(filter) = &st.gid_filter {
            if !filter.contains(&dg.dgid) {
                // Wrong destination GID: silently dropped.
                IfaceMetrics::inc(&st.metrics.rx_drop);
                continue;
            }
        }
        let Some(neth) = proto::decode_neth(&dg.data) else {
            IfaceMetrics::inc(&st.metrics.rx_drop);
            continue;
        };
        route_packet(st, &neth, dg.data, now, dispatch);
    }
}

fn route_packet(
    st: &mut State,
    neth: &proto::Neth,
    data: Vec<u8>,
    now: Instant,
    dispatch: &mut Vec<Dispatch>,
) {
    if neth.dest_ep == EP_NULL_ID {
        // Only connection requests travel without a destination endpoint.
        if neth.is_ctl {
            let addr_len = st.cep.address_length();
            if let Some(CtlMsg::Creq {
                src_ep,
                conn_sn,
                path_index,
                peer_addr,
            }) = proto::decode_ctl(&data[proto::NETH_LEN..], addr_len)
            {
                if let Some(ep_id) = ep_rx::handle_creq(
                    st, src_ep, conn_sn, path_index, &peer_addr, neth.psn, now,
                ) {
                    ep_rx::rx_packet(st, ep_id, neth, data, now, dispatch);
                    return;
                }
            }
        }
        IfaceMetrics::inc(&st.metrics.rx_drop);
        return;
    }

    if st.eps.get(neth.dest_ep).is_some() {
        ep_rx::rx_packet(st, neth.dest_ep, neth, data, now, dispatch);
    } else {
        IfaceMetrics::inc(&st.metrics.rx_drop);
    }
}

/// Advance the wheel and fire per-endpoint timers.
fn advance_timers(st: &mut State, dispatch: &mut Vec<Dispatch>, now: Instant) {
    let fired = st.wheel.expire(now);
    for (ep_id, gen) in fired {
        let valid = st
            .eps
            .get(ep_id)
            .map(|ep| ep.timer_armed && ep.timer_gen == gen)
            .unwrap_or(false);
        if valid {
            ep_tx::ep_timer_fire(st, ep_id, now, dispatch);
        }
    }
}

/// Deliver receives deferred out of asynchronous context (bounded batch).
fn drain_pending_rx(st: &mut State, dispatch: &mut Vec<Dispatch>) {
    let max = st.cfg.rx_async_max_poll as usize;
    for _ in 0..max {
        let Some(id) = st.rx.pending_q.pop_front() else {
            break;
        };
        let kind = st.rx.pool.get(id).kind;
        let skb = st.rx_slot_take(id);
        match kind {
            RecvKind::Am(am_id) => dispatch.push(Dispatch::Am { am_id, skb }),
            RecvKind::Put(rva) => dispatch.push(Dispatch::Put { rva, skb }),
            // Handshake packets apply inline and never defer.
            RecvKind::Ctl => {}
        }
    }
}

/// Round-robin the endpoints with parked messages.
fn dispatch_pending(st: &mut State, now: Instant) {
    for _ in 0..PENDING_MAX_ROUNDS {
        let Some(ep_id) = st.pending.next_ep() else {
            return;
        };
        loop {
            let Some(msg) = st.pending.pop_msg(ep_id) else {
                break;
            };
            match try_send_pending(st, ep_id, msg, now) {
                Ok(()) => {}
                Err(Some(mut msg)) => {
                    // Still no resources: keep FIFO order and stop the
                    // round so a stalled window does not spin the arbiter.
                    msg.once = true;
                    st.pending.push_front(ep_id, msg);
                    st.pending.requeue_ep(ep_id);
                    return;
                }
                Err(None) => {
                    // Message failed terminally; its completion already
                    // carried the status.
                }
            }
        }
    }
}

/// Attempt one parked message. `Err(Some(msg))` hands it back on transient
/// exhaustion; `Err(None)` means it was consumed by a terminal failure.
fn try_send_pending(
    st: &mut State,
    ep_id: EpId,
    msg: PendingMsg,
    now: Instant,
) -> Result<(), Option<PendingMsg>> {
    if !ep_tx::can_send(st, ep_id) {
        return Err(Some(msg));
    }
    let PendingMsg { op, comp, .. } = msg;
    let res = match &op {
        PendingOp::Am { am_id, data } => ep_tx::am_send(st, ep_id, *am_id, data, None, comp, now),
        PendingOp::Put { rva, data } => ep_tx::put_send(st, ep_id, *rva, data, comp, now),
    };
    match res {
        Ok(()) => Ok(()),
        Err(Error::NoResource) => {
            // Lost a race against a control send inside this tick; the
            // completion was not consumed before admission.
            match op {
                PendingOp::Am { am_id, data } => Err(Some(PendingMsg {
                    op: PendingOp::Am { am_id, data },
                    comp: None,
                    once: true,
                })),
                PendingOp::Put { rva, data } => Err(Some(PendingMsg {
                    op: PendingOp::Put { rva, data },
                    comp: None,
                    once: true,
                })),
            }
        }
        Err(e) => {
            log::debug!("[iface] pending send failed ep={} err={}", ep_id, e);
            Err(None)
        }
    }
}

/// Drain acknowledged completions deferred from asynchronous context.
fn drain_async_comps(st: &mut State, dispatch: &mut Vec<Dispatch>) {
    for _ in 0..ASYNC_COMP_BATCH {
        let Some(id) = st.tx.async_comp_q.pop_front() else {
            break;
        };
        let skb = st.tx.pool.get_mut(id);
        if let Some(cdesc) = skb.comp.take() {
            dispatch.push(Dispatch::Comp {
                comp: cdesc.comp,
                status: Ok(()),
            });
        }
        st.tx.pool.release(id);
    }
}

/// Invoke collected actions with no interface state lock held. Handlers are
/// taken out of the table around each call, so handler code may re-enter
/// the API, including progress itself.
pub(crate) fn dispatch_actions(inner: &IfaceInner, actions: Vec<Dispatch>) -> usize {
    let count = actions.len();
    if count == 0 {
        return 0;
    }
    let metrics = inner.state.lock().metrics.clone();
    for action in actions {
        match action {
            Dispatch::Am { am_id, skb } => {
                let handler = inner.callbacks.lock().am[am_id as usize].take();
                match handler {
                    Some(mut h) => {
                        h(skb.payload());
                        let mut cbs = inner.callbacks.lock();
                        let slot = &mut cbs.am[am_id as usize];
                        if slot.is_none() {
                            *slot = Some(h);
                        }
                    }
                    None => log::debug!("[iface] no handler for am id {}", am_id),
                }
            }
            Dispatch::Put { rva, skb } => {
                let handler = inner.callbacks.lock().put.take();
                match handler {
                    Some(mut h) => {
                        h(rva, skb.payload());
                        let mut cbs = inner.callbacks.lock();
                        if cbs.put.is_none() {
                            cbs.put = Some(h);
                        }
                    }
                    None => log::debug!("[iface] no put handler"),
                }
            }
            Dispatch::Comp { comp, status } => {
                IfaceMetrics::inc(&metrics.comps_dispatched);
                comp(status);
            }
            Dispatch::PeerError { ep, err } => {
                let handler = inner.callbacks.lock().error.take();
                match handler {
                    Some(mut h) => {
                        h(ep, &err);
                        let mut cbs = inner.callbacks.lock();
                        if cbs.error.is_none() {
                            cbs.error = Some(h);
                        }
                    }
                    None => log::warn!("[iface] peer failure ep={} err={}", ep, err),
                }
            }
        }
    }
    count
}

/// Interface teardown: purge every endpoint and queue, cancel in-flight
/// completions, destroy the queue pair.
pub(crate) fn teardown(inner: &IfaceInner) -> Vec<Dispatch> {
    let mut dispatch = Vec::new();
    let mut st = inner.state.lock();
    if st.closing {
        return dispatch;
    }
    let st = &mut *st;
    // Forked child: the fabric resources belong to the parent. Mark the
    // handles dead and leak everything instead of closing it.
    if inner.check_fork().is_err() {
        st.closing = true;
        return dispatch;
    }
    st.closing = true;
    st.in_async = false;
    log::debug!("[iface] teardown eps={}", st.eps.len());

    // Detach everything from the registry first (purge callback contract),
    // then purge and free each endpoint.
    st.cep.cleanup(|_| {});
    let ids = st.eps.ids();
    for &id in &ids {
        let ep = st.eps.get_mut(id).expect("listed ep alive");
        ep.clear_flag(EP_FLAG_ON_CEP);
        ep.set_flag(EP_FLAG_CANCEL_PENDING);
    }
    for id in ids {
        st.purge_ep_tx(id, &mut dispatch, &|| Error::Canceled);
        st.free_ep(id);
    }

    // Acknowledged completions deferred from async context completed
    // successfully; deliver them as such.
    while let Some(id) = st.tx.async_comp_q.pop_front() {
        let skb = st.tx.pool.get_mut(id);
        if let Some(cdesc) = skb.comp.take() {
            dispatch.push(Dispatch::Comp {
                comp: cdesc.comp,
                status: Ok(()),
            });
        }
        st.tx.pool.release(id);
    }

    // Outstanding signaled control skbs never saw their completion.
    let outstanding: Vec<SkbId> = st
        .tx
        .outstanding_q
        .drain(..)
        .chain(st.tx.outstanding_map.drain().map(|(_, id)| id))
        .collect();
    for id in outstanding {
        st.tx.pool.release(id);
    }

    while let Some(id) = st.rx.pending_q.pop_front() {
        st.rx_slot_release(id);
    }
    for msg in st.pending.purge_all() {
        if let Some(comp) = msg.comp {
            dispatch.push(Dispatch::Comp {
                comp,
                status: Err(Error::Canceled),
            });
        }
    }
    let mut deferred = std::mem::take(&mut st.deferred);
    dispatch.append(&mut deferred);

    st.fabric.destroy_qp();
    dispatch
}
