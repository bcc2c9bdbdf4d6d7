// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Endpoint send path.
//!
//! Everything that stamps a PSN goes through the TX window: active
//! messages, puts, and the reliable handshake packets (CREQ/CREP), which
//! ride the same unacknowledged list and retransmission machinery as data.
//! Explicit ACKs, NAKs and RESEND_START are unreliable control datagrams
//! freed on send completion.

use std::time::Instant;

use crate::config::TX_MODERATION;
use crate::core::skb::{
    CompDesc, CtlDesc, SendCompletion, SkbId, SKB_FLAG_CTL_ACK, SKB_FLAG_CTL_RESEND,
    SKB_FLAG_RESENDING,
};
use crate::core::{psn, EpId, EP_NULL_ID};
use crate::ep::{
    ca, EpState, EP_FLAG_CREQ_RCVD, EP_FLAG_CREQ_SENT, EP_FLAG_CREP_SENT, EP_FLAG_PRIVATE,
    EP_FLAG_RESEND_IN_PROGRESS,
};
use crate::iface::stats::IfaceMetrics;
use crate::iface::{Dispatch, State};
use crate::proto::{self, CtlMsg, Neth};
use crate::{Error, Result};

/// Admission for PSN-consuming sends.
fn tx_check(st: &State, ep_id: EpId, need_dest: bool) -> Result<()> {
    let Some(ep) = st.eps.get(ep_id) else {
        return Err(Error::InvalidParam("endpoint gone".into()));
    };
    match ep.state {
        EpState::Failed => return Err(Error::EndpointTimeout),
        EpState::Disconnecting => {
            return Err(Error::InvalidParam("endpoint closed".into()));
        }
        _ => {}
    }
    if need_dest && ep.dest_ep_id == EP_NULL_ID {
        // Handshake still in flight; the window stays pinned until the
        // peer's endpoint id is learned.
        return Err(Error::NoResource);
    }
    if ep.tx_window_avail() == 0 || st.tx.available == 0 {
        return Err(Error::NoResource);
    }
    Ok(())
}

/// Whether a data send would be admitted right now (used by the pending
/// arbiter to avoid consuming a message it cannot post).
pub(crate) fn can_send(st: &State, ep_id: EpId) -> bool {
    tx_check(st, ep_id, true).is_ok() && st.tx.pool.available() > 0
}

/// Decide the ACK-REQ bit for a data send and account the poke.
fn take_ack_req(st: &mut State, ep_id: EpId, now: Instant) -> bool {
    let min_poke = st.cfg.min_poke_time;
    let ep = st.eps.get_mut(ep_id).expect("ep alive");
    let near_full = ep.tx_window_avail().saturating_sub(1) <= ep.cwnd / 4;
    let poke_due = now.duration_since(ep.tx.poke_time) >= min_poke;
    if near_full || poke_due {
        ep.tx.poke_time = now;
        true
    } else {
        false
    }
}

/// Post an skb towards the endpoint's peer.
///
/// `tracked` marks control skbs that are freed on send completion; they are
/// always signaled and entered into the outstanding-send index. Data posts
/// are signaled once every [`TX_MODERATION`] (every post on fabrics with
/// unordered completions).
fn post_skb(st: &mut State, ep_id: EpId, skb_id: SkbId, tracked: bool) -> Result<()> {
    let State {
        eps, tx, fabric, metrics, ..
    } = st;
    let ep = eps.get(ep_id).ok_or_else(|| Error::InvalidParam("endpoint gone".into()))?;
    let dest = ep
        .peer_addr
        .as_deref()
        .ok_or_else(|| Error::InvalidParam("peer address unknown".into()))?;

    let sn = tx.sn;
    tx.sn = tx.sn.wrapping_add(1);

    let mut signaled = tracked || !tx.ordered;
    if !signaled {
        tx.unsignaled += 1;
        if tx.unsignaled >= TX_MODERATION {
            signaled = true;
        }
    }
    if signaled {
        tx.unsignaled = 0;
    }

    if tracked {
        let desc = tx.pool.get_mut(skb_id).ctl.as_mut().expect("ctl desc set");
        desc.sn = sn;
    }

    let skb = tx.pool.get(skb_id);
    let hdr = &skb.buf[..skb.len];
    let res = match skb.zdata.as_deref() {
        Some(z) => fabric.post_send(dest, &[hdr, z], signaled, sn),
        None => fabric.post_send(dest, &[hdr], signaled, sn),
    };
    res?;

    tx.available -= 1;
    IfaceMetrics::inc(&metrics.tx_packets);
    if tracked {
        if tx.ordered {
            tx.outstanding_q.push_back(skb_id);
        } else {
            tx.outstanding_map.insert(sn, skb_id);
        }
    }
    Ok(())
}

/// Stamp a PSN on a freshly built skb, post it, and append it to the
/// unacknowledged list.
fn commit_window_send(st: &mut State, ep_id: EpId, skb_id: SkbId, now: Instant) -> Result<()> {
    if let Err(e) = post_skb(st, ep_id, skb_id, false) {
        st.tx.pool.release(skb_id);
        return Err(e);
    }
    let tick = st.cfg.timer_tick;
    let ep = st.eps.get_mut(ep_id).expect("ep alive");
    ep.tx.unack.push_back(skb_id);
    ep.tx.psn = ep.tx.psn.wrapping_add(1);
    ep.tx.send_time = now;
    // Outgoing packets piggy-back the receive cursor.
    ep.rx.unacked = 0;
    ep.rx.ack_req_pending = false;
    st.ensure_ep_timer(ep_id, now + tick);
    Ok(())
}

/// Send an active message. `data` is copied inline; `zdata`, if given, is
/// posted by reference and held until acknowledgment.
pub(crate) fn am_send(
    st: &mut State,
    ep_id: EpId,
    am_id: u8,
    data: &[u8],
    zdata: Option<std::sync::Arc<[u8]>>,
    comp: Option<SendCompletion>,
    now: Instant,
) -> Result<()> {
    if am_id > proto::AM_ID_MAX {
        return Err(Error::InvalidParam(format!("am id {} out of range", am_id)));
    }
    let payload_len = data.len() + zdata.as_deref().map_or(0, |z| z.len());
    if payload_len == 0 {
        return Err(Error::InvalidParam(
            "active messages must carry at least one payload byte".into(),
        ));
    }
    if proto::NETH_LEN + payload_len > st.seg_size {
        return Err(Error::InvalidParam(format!(
            "payload {} exceeds segment size", payload_len
        )));
    }
    tx_check(st, ep_id, true)?;

    let Some(skb_id) = st.tx.pool.alloc() else {
        return Err(Error::NoResource);
    };
    let ack_req = take_ack_req(st, ep_id, now);
    let ep = st.eps.get(ep_id).expect("ep alive");
    let mut neth = Neth::am(ep.dest_ep_id, am_id, ep.tx.psn, ep.rx.acked_psn);
    neth.ack_req = ack_req;

    let skb = st.tx.pool.get_mut(skb_id);
    proto::encode_neth(&neth, &mut skb.buf);
    skb.buf[proto::NETH_LEN..proto::NETH_LEN + data.len()].copy_from_slice(data);
    skb.len = proto::NETH_LEN + data.len();
    skb.psn = neth.psn;
    if let Some(z) = zdata {
        skb.flags |= crate::core::skb::SKB_FLAG_ZCOPY;
        skb.zdata = Some(z);
    }
    if let Some(comp) = comp {
        skb.flags |= crate::core::skb::SKB_FLAG_COMP;
        skb.comp = Some(CompDesc { ep: ep_id, comp });
    }

    commit_window_send(st, ep_id, skb_id, now)
}

/// Send an active message through a caller-provided packer.
pub(crate) fn am_send_bcopy(
    st: &mut State,
    ep_id: EpId,
    am_id: u8,
    pack: impl FnOnce(&mut [u8]) -> usize,
    comp: Option<SendCompletion>,
    now: Instant,
) -> Result<usize> {
    if am_id > proto::AM_ID_MAX {
        return Err(Error::InvalidParam(format!("am id {} out of range", am_id)));
    }
    tx_check(st, ep_id, true)?;

    let seg_size = st.seg_size;
    let Some(skb_id) = st.tx.pool.alloc() else {
        return Err(Error::NoResource);
    };
    let skb = st.tx.pool.get_mut(skb_id);
    let len = pack(&mut skb.buf[proto::NETH_LEN..seg_size]);
    if len == 0 || proto::NETH_LEN + len > seg_size {
        st.tx.pool.release(skb_id);
        return Err(Error::InvalidParam(format!("bad bcopy length {}", len)));
    }

    let ack_req = take_ack_req(st, ep_id, now);
    let ep = st.eps.get(ep_id).expect("ep alive");
    let mut neth = Neth::am(ep.dest_ep_id, am_id, ep.tx.psn, ep.rx.acked_psn);
    neth.ack_req = ack_req;

    let skb = st.tx.pool.get_mut(skb_id);
    proto::encode_neth(&neth, &mut skb.buf);
    skb.len = proto::NETH_LEN + len;
    skb.psn = neth.psn;
    if let Some(comp) = comp {
        skb.flags |= crate::core::skb::SKB_FLAG_COMP;
        skb.comp = Some(CompDesc { ep: ep_id, comp });
    }

    commit_window_send(st, ep_id, skb_id, now)?;
    Ok(len)
}

/// Send a put: the PUT sub-header carries the remote virtual address.
pub(crate) fn put_send(
    st: &mut State,
    ep_id: EpId,
    rva: u64,
    data: &[u8],
    comp: Option<SendCompletion>,
    now: Instant,
) -> Result<()> {
    if data.is_empty() {
        return Err(Error::InvalidParam("puts must carry a payload".into()));
    }
    if proto::NETH_LEN + proto::PUT_HDR_LEN + data.len() > st.seg_size {
        return Err(Error::InvalidParam(format!(
            "payload {} exceeds segment size", data.len()
        )));
    }
    tx_check(st, ep_id, true)?;

    let Some(skb_id) = st.tx.pool.alloc() else {
        return Err(Error::NoResource);
    };
    let ack_req = take_ack_req(st, ep_id, now);
    let ep = st.eps.get(ep_id).expect("ep alive");
    let mut neth = Neth::am(ep.dest_ep_id, 0, ep.tx.psn, ep.rx.acked_psn);
    neth.is_put = true;
    neth.ack_req = ack_req;

    let skb = st.tx.pool.get_mut(skb_id);
    proto::encode_neth(&neth, &mut skb.buf);
    proto::encode_put_hdr(rva, &mut skb.buf[proto::NETH_LEN..]);
    let off = proto::NETH_LEN + proto::PUT_HDR_LEN;
    skb.buf[off..off + data.len()].copy_from_slice(data);
    skb.len = off + data.len();
    skb.psn = neth.psn;
    if let Some(comp) = comp {
        skb.flags |= crate::core::skb::SKB_FLAG_COMP;
        skb.comp = Some(CompDesc { ep: ep_id, comp });
    }

    commit_window_send(st, ep_id, skb_id, now)
}

/// Reliable control send (CREQ/CREP): PSN-stamped and window-tracked.
fn send_reliable_ctl(
    st: &mut State,
    ep_id: EpId,
    dest_ep: EpId,
    msg: &CtlMsg,
    now: Instant,
) -> Result<()> {
    tx_check(st, ep_id, false)?;
    let Some(skb_id) = st.tx.pool.alloc() else {
        return Err(Error::NoResource);
    };

    let ep = st.eps.get_mut(ep_id).expect("ep alive");
    let mut neth = Neth::ctl(dest_ep, ep.tx.psn, ep.rx.acked_psn);
    // Handshake packets always solicit an explicit acknowledgment.
    neth.ack_req = true;
    ep.tx.poke_time = now;

    let mut body = Vec::new();
    proto::encode_ctl(msg, &mut body);
    let skb = st.tx.pool.get_mut(skb_id);
    proto::encode_neth(&neth, &mut skb.buf);
    skb.buf[proto::NETH_LEN..proto::NETH_LEN + body.len()].copy_from_slice(&body);
    skb.len = proto::NETH_LEN + body.len();
    skb.psn = neth.psn;

    commit_window_send(st, ep_id, skb_id, now)
}

/// Post the connection request (idempotent via `CREQ_SENT`).
pub(crate) fn send_creq(st: &mut State, ep_id: EpId, now: Instant) -> Result<()> {
    let ep = st.eps.get(ep_id).ok_or_else(|| Error::InvalidParam("endpoint gone".into()))?;
    if ep.has_flag(EP_FLAG_CREQ_SENT) {
        return Ok(());
    }
    let msg = CtlMsg::Creq {
        src_ep: ep_id,
        conn_sn: ep.conn_sn,
        path_index: ep.path_index,
        peer_addr: st.local_addr.to_vec(),
    };
    send_reliable_ctl(st, ep_id, EP_NULL_ID, &msg, now)?;
    let ep = st.eps.get_mut(ep_id).expect("ep alive");
    ep.set_flag(EP_FLAG_CREQ_SENT);
    if ep.state == EpState::Closed {
        ep.state = EpState::CreqSent;
    }
    log::debug!("[ep] id={} creq sent conn_sn={}", ep_id, ep.conn_sn);
    Ok(())
}

/// Post the connection reply (idempotent via `CREP_SENT`).
pub(crate) fn send_crep(st: &mut State, ep_id: EpId, now: Instant) -> Result<()> {
    let ep = st.eps.get(ep_id).ok_or_else(|| Error::InvalidParam("endpoint gone".into()))?;
    if ep.has_flag(EP_FLAG_CREP_SENT) || ep.dest_ep_id == EP_NULL_ID {
        return Ok(());
    }
    let dest = ep.dest_ep_id;
    send_reliable_ctl(st, ep_id, dest, &CtlMsg::Crep { src_ep: ep_id }, now)?;
    let ep = st.eps.get_mut(ep_id).expect("ep alive");
    ep.set_flag(EP_FLAG_CREP_SENT);
    log::debug!("[ep] id={} crep sent dest={}", ep_id, dest);
    Ok(())
}

/// Build and post an unreliable control skb (freed on send completion):
/// bare ACK when `msg` is `None`, NAK/RESEND_START otherwise.
fn send_unreliable(st: &mut State, ep_id: EpId, msg: Option<&CtlMsg>) -> Result<()> {
    let Some(ep) = st.eps.get(ep_id) else {
        return Err(Error::InvalidParam("endpoint gone".into()));
    };
    if ep.dest_ep_id == EP_NULL_ID {
        return Err(Error::NoResource);
    }
    if st.tx.available == 0 {
        return Err(Error::NoResource);
    }
    let Some(skb_id) = st.tx.pool.alloc() else {
        return Err(Error::NoResource);
    };

    let ep = st.eps.get(ep_id).expect("ep alive");
    let neth = match msg {
        // PSN field carries the current cursor without consuming it.
        Some(_) => Neth::ctl(ep.dest_ep_id, ep.tx.psn, ep.rx.acked_psn),
        None => Neth::ack(ep.dest_ep_id, ep.tx.psn, ep.rx.acked_psn),
    };
    let skb = st.tx.pool.get_mut(skb_id);
    proto::encode_neth(&neth, &mut skb.buf);
    skb.len = proto::NETH_LEN;
    if let Some(msg) = msg {
        let mut body = Vec::new();
        proto::encode_ctl(msg, &mut body);
        skb.buf[proto::NETH_LEN..proto::NETH_LEN + body.len()].copy_from_slice(&body);
        skb.len += body.len();
    }
    skb.flags |= SKB_FLAG_CTL_ACK;
    skb.ctl = Some(CtlDesc {
        sn: 0,
        ep: ep_id,
        resent_skb: None,
    });

    if let Err(e) = post_skb(st, ep_id, skb_id, true) {
        st.tx.pool.release(skb_id);
        return Err(e);
    }
    Ok(())
}

/// Send an explicit acknowledgment and reset the ACK debt.
pub(crate) fn send_ctl_ack(st: &mut State, ep_id: EpId) -> Result<()> {
    send_unreliable(st, ep_id, None)?;
    let ep = st.eps.get_mut(ep_id).expect("ep alive");
    ep.rx.unacked = 0;
    ep.rx.ack_req_pending = false;
    IfaceMetrics::inc(&st.metrics.acks_sent);
    Ok(())
}

/// Ask the peer to retransmit from `expected`.
pub(crate) fn send_nak(st: &mut State, ep_id: EpId, expected: u16) {
    if send_unreliable(st, ep_id, Some(&CtlMsg::Nak { expected })).is_ok() {
        IfaceMetrics::inc(&st.metrics.naks_sent);
    }
}

/// Begin a retransmission epoch: halve the window, announce the replay,
/// and post a shadow for every unacknowledged skb (as resources allow).
pub(crate) fn start_resend_epoch(st: &mut State, ep_id: EpId, now: Instant) {
    let Some(ep) = st.eps.get_mut(ep_id) else {
        return;
    };
    if ep.tx.unack.is_empty()
        || ep.tx.resend_count > 0
        || ep.has_flag(EP_FLAG_RESEND_IN_PROGRESS)
    {
        return;
    }
    ca::on_resend(ep);
    ep.set_flag(EP_FLAG_RESEND_IN_PROGRESS);
    ep.backoff_k = (ep.backoff_k + 1).min(16);
    ep.tx.ack_time = now;
    let from = ep.tx.acked_psn.wrapping_add(1);
    let ids: Vec<SkbId> = ep.tx.unack.iter().copied().collect();
    log::debug!(
        "[ep] id={} resend epoch from={} depth={} cwnd={}",
        ep_id,
        from,
        ids.len(),
        ep.cwnd
    );

    let _ = send_unreliable(st, ep_id, Some(&CtlMsg::ResendStart { from }));

    for orig in ids {
        if st.tx.pool.get(orig).has(SKB_FLAG_RESENDING) {
            continue;
        }
        if st.tx.available == 0 {
            break;
        }
        let Some(shadow) = st.tx.pool.alloc() else {
            break;
        };
        st.tx.pool.clone_for_resend(orig, shadow);
        let ack_psn = st.eps.get(ep_id).expect("ep alive").rx.acked_psn;
        let skb = st.tx.pool.get_mut(shadow);
        proto::patch_ack_psn(&mut skb.buf, ack_psn);
        skb.flags |= SKB_FLAG_CTL_RESEND;
        skb.ctl = Some(CtlDesc {
            sn: 0,
            ep: ep_id,
            resent_skb: Some(orig),
        });
        if post_skb(st, ep_id, shadow, true).is_err() {
            st.tx.pool.release(shadow);
            break;
        }
        st.tx.pool.get_mut(orig).flags |= SKB_FLAG_RESENDING;
        let ep = st.eps.get_mut(ep_id).expect("ep alive");
        ep.tx.resend_count += 1;
        IfaceMetrics::inc(&st.metrics.retransmits);
    }

    // Nothing could be shadowed (pools dry): drop the epoch marker so the
    // next timer tick retries.
    let ep = st.eps.get_mut(ep_id).expect("ep alive");
    if ep.tx.resend_count == 0 {
        ep.clear_flag(EP_FLAG_RESEND_IN_PROGRESS);
    }
}

/// Per-endpoint timer: retransmission, peer timeout, idle ACKs, handshake
/// retries, and linger teardown.
pub(crate) fn ep_timer_fire(
    st: &mut State,
    ep_id: EpId,
    now: Instant,
    dispatch: &mut Vec<Dispatch>,
) {
    let Some(ep) = st.eps.get_mut(ep_id) else {
        return;
    };
    ep.timer_armed = false;

    match ep.state {
        EpState::Failed => return,
        EpState::Disconnecting => {
            let drained = ep.tx_drained() && !st.pending.has_ep(ep_id);
            let expired = ep.linger_deadline.is_some_and(|d| now >= d);
            if drained || expired {
                st.purge_ep_tx(ep_id, dispatch, &|| Error::Canceled);
                st.free_ep(ep_id);
                return;
            }
        }
        _ => {}
    }

    // Handshake packets deferred by pool pressure. A private endpoint never
    // initiates, so no CREQ retry for it.
    let ep = st.eps.get(ep_id).expect("ep alive");
    if !ep.has_flag(EP_FLAG_CREQ_SENT)
        && !ep.has_flag(EP_FLAG_PRIVATE)
        && ep.peer_addr.is_some()
    {
        let _ = send_creq(st, ep_id, now);
    }
    let ep = st.eps.get(ep_id).expect("ep alive");
    if ep.has_flag(EP_FLAG_CREQ_RCVD) && !ep.has_flag(EP_FLAG_CREP_SENT) {
        let _ = send_crep(st, ep_id, now);
    }

    // Retransmission and peer-failure detection.
    let ep = st.eps.get(ep_id).expect("ep alive");
    if !ep.tx.unack.is_empty() {
        let peer_timeout = st.cfg.peer_timeout;
        if now.duration_since(ep.rx.last_time) >= peer_timeout {
            st.fail_ep(ep_id, dispatch, &|| Error::EndpointTimeout);
            return;
        }
        if ep.tx.resend_count == 0 && !ep.has_flag(EP_FLAG_RESEND_IN_PROGRESS) {
            let delay = st.cfg.timer_tick.mul_f64(st.cfg.timer_backoff.powi(ep.backoff_k as i32));
            if now.duration_since(ep.tx.ack_time) >= delay {
                start_resend_epoch(st, ep_id, now);
            }
        }
    }

    // RX-idle epoch: flush the ACK debt.
    let ep = st.eps.get(ep_id).expect("ep alive");
    if (ep.rx.unacked > 0 || ep.rx.ack_req_pending) && ep.dest_ep_id != EP_NULL_ID {
        let _ = send_ctl_ack(st, ep_id);
    }

    // Keep ticking while anything is pending.
    let ep = st.eps.get(ep_id).expect("ep alive");
    let busy = !ep.tx.unack.is_empty()
        || ep.tx.resend_count > 0
        || ep.rx.unacked > 0
        || ep.state == EpState::Disconnecting
        || !ep.has_flag(EP_FLAG_CREQ_SENT)
        || (ep.has_flag(EP_FLAG_CREQ_RCVD) && !ep.has_flag(EP_FLAG_CREP_SENT));
    if busy {
        let tick = st.cfg.timer_tick;
        st.ensure_ep_timer(ep_id, now + tick);
    }
}

/// Release acknowledged skbs from the window front, skipping any that a
/// still-in-flight shadow references.
pub(crate) fn window_release_completed(
    st: &mut State,
    ep_id: EpId,
    dispatch: &mut Vec<Dispatch>,
) {
    loop {
        let Some(ep) = st.eps.get(ep_id) else {
            return;
        };
        let Some(&front) = ep.tx.unack.front() else {
            return;
        };
        let acked = ep.tx.acked_psn;
        let skb = st.tx.pool.get(front);
        if !psn::le(skb.psn, acked) || skb.has(SKB_FLAG_RESENDING) {
            return;
        }
        let ep = st.eps.get_mut(ep_id).expect("ep alive");
        ep.tx.unack.pop_front();
        release_acked_skb(st, front, dispatch);
    }
}

/// Free an acknowledged skb, routing its completion by context.
pub(crate) fn release_acked_skb(st: &mut State, skb_id: SkbId, dispatch: &mut Vec<Dispatch>) {
    let skb = st.tx.pool.get_mut(skb_id);
    if skb.comp.is_some() {
        if st.in_async {
            // Deferred: drained (and freed) by the synchronous tick.
            st.tx.async_comp_q.push_back(skb_id);
            return;
        }
        let cdesc = skb.comp.take().expect("comp present");
        dispatch.push(Dispatch::Comp {
            comp: cdesc.comp,
            status: Ok(()),
        });
    }
    st.tx.pool.release(skb_id);
}
