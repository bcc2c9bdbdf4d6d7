// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The interface: the shared datagram-sending resource and everything the
//! endpoints on it have in common.
//!
//! One interface owns one fabric queue pair, the bounded send/receive skb
//! pools, the dense endpoint array, the connection-match registry, the timer
//! wheel, the outstanding-send index, the pending-send arbiter, and the
//! queues that defer work out of asynchronous context.
//!
//! ## Locking
//!
//! A single `parking_lot::Mutex` around [`State`] is the interface lock; it
//! is held across every operation that touches endpoint, pool, queue,
//! registry, or timer state, and released before any user callback runs.
//! Callbacks are collected under the lock as [`Dispatch`] actions and
//! invoked afterwards, so handler code may freely re-enter the API.
//!
//! ## Progress
//!
//! [`Iface::progress`] is the synchronous tick: poll TX completions, route
//! receives, advance timers, drain the pending arbiter and the deferred
//! completion queue, then dispatch callbacks. The asynchronous tick (a
//! timer thread started by [`Iface::progress_enable`]) does the same
//! polling but never invokes user code: deliveries park in `pending_rx_q`,
//! completions in `async_comp_q`, and a wake token is sent for
//! [`Iface::wait`].

pub mod pending;
pub mod progress;
pub mod stats;
pub mod twheel;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;

use crate::config::IfaceConfig;
use crate::conn_match::{ConnMatchCtx, QueueType};
use crate::core::ep_table::EpTable;
use crate::core::pool::{RxPool, TxPool};
use crate::core::skb::{RecvSkb, RxSkbId, SendCompletion, SkbId};
use crate::core::EpId;
use crate::ep::{tx as ep_tx, Ep, EpState, EP_FLAG_DISCONNECTED, EP_FLAG_ON_CEP, EP_FLAG_PRIVATE};
use crate::fabric::{Fabric, Gid};
use crate::fork;
use crate::proto;
use crate::{Error, FlushState, Result};

use pending::PendingArbiter;
use stats::{EpInfo, IfaceMetrics, IfaceStats};
use twheel::TimerWheel;

/// Enable send-side progress (TX completion reaping).
pub const PROGRESS_SEND: u32 = 0x1;
/// Enable receive-side progress; releases the withheld receive quota.
pub const PROGRESS_RECV: u32 = 0x2;

/// Deferred user-visible action, dispatched after the interface lock drops.
pub(crate) enum Dispatch {
    Am { am_id: u8, skb: RecvSkb },
    Put { rva: u64, skb: RecvSkb },
    Comp { comp: SendCompletion, status: Result<()> },
    PeerError { ep: EpId, err: Error },
}

/// TX-side shared state.
pub(crate) struct TxState {
    pub pool: TxPool,
    /// Send queue credits: posts not yet completed by the fabric.
    pub available: u16,
    pub qp_len: u16,
    /// Next fabric post sequence.
    pub sn: u16,
    /// Last completed post sequence (ordered fabrics).
    pub last_comp_sn: u16,
    /// Posts since the last signaled one.
    pub unsignaled: u16,
    pub ordered: bool,
    /// Outstanding signaled control skbs, FIFO by `sn` (ordered fabrics).
    pub outstanding_q: VecDeque<SkbId>,
    /// Outstanding signaled control skbs keyed by `sn` (unordered fabrics).
    pub outstanding_map: HashMap<u16, SkbId>,
    /// Successfully acknowledged completion skbs deferred out of
    /// asynchronous context.
    pub async_comp_q: VecDeque<SkbId>,
}

impl TxState {
    pub fn outstanding_is_empty(&self) -> bool {
        if self.ordered {
            self.outstanding_q.is_empty()
        } else {
            self.outstanding_map.is_empty()
        }
    }
}

/// RX-side shared state.
pub(crate) struct RxState {
    pub pool: RxPool,
    /// Receive credits currently grantable.
    pub available: u16,
    /// Capacity withheld until `progress_enable(PROGRESS_RECV)`.
    pub quota: u16,
    pub qp_len: u16,
    /// Deliveries deferred out of asynchronous context.
    pub pending_q: VecDeque<RxSkbId>,
}

/// Everything behind the interface lock.
pub(crate) struct State {
    pub cfg: IfaceConfig,
    pub seg_size: usize,
    pub fabric: Box<dyn Fabric>,
    pub eps: EpTable,
    pub cep: ConnMatchCtx,
    pub tx: TxState,
    pub rx: RxState,
    pub wheel: TimerWheel,
    pub pending: PendingArbiter,
    pub metrics: Arc<IfaceMetrics>,
    /// Accepted GRH destination GIDs; `None` disables the check.
    pub gid_filter: Option<HashSet<Gid>>,
    pub local_addr: Box<[u8]>,
    /// Set while the asynchronous tick runs; routes deliveries and
    /// completions into the deferral queues.
    pub in_async: bool,
    /// Error-path actions deferred out of asynchronous context.
    pub deferred: Vec<Dispatch>,
    pub closing: bool,
}

impl State {
    /// Accept a datagram into the RX table, consuming one receive credit.
    pub fn rx_slot_insert(&mut self, skb: RecvSkb) -> Option<RxSkbId> {
        if self.rx.available == 0 {
            return None;
        }
        let id = self.rx.pool.insert(skb)?;
        self.rx.available -= 1;
        Some(id)
    }

    /// Remove a receive skb, returning its credit.
    pub fn rx_slot_take(&mut self, id: RxSkbId) -> RecvSkb {
        let skb = self.rx.pool.take(id);
        self.rx.available = (self.rx.available + 1).min(self.rx.qp_len - self.rx.quota);
        skb
    }

    pub fn rx_slot_release(&mut self, id: RxSkbId) {
        let _ = self.rx_slot_take(id);
    }

    /// Arm the endpoint timer if it is not armed already.
    pub fn ensure_ep_timer(&mut self, ep_id: EpId, deadline: Instant) {
        let Some(ep) = self.eps.get_mut(ep_id) else {
            return;
        };
        if ep.timer_armed {
            return;
        }
        ep.timer_gen = ep.timer_gen.wrapping_add(1);
        ep.timer_armed = true;
        let gen = ep.timer_gen;
        self.wheel.schedule(ep_id, gen, deadline);
    }

    /// Arm the endpoint timer unconditionally, superseding any armed one.
    pub fn rearm_ep_timer(&mut self, ep_id: EpId, deadline: Instant) {
        let Some(ep) = self.eps.get_mut(ep_id) else {
            return;
        };
        ep.timer_gen = ep.timer_gen.wrapping_add(1);
        ep.timer_armed = true;
        let gen = ep.timer_gen;
        self.wheel.schedule(ep_id, gen, deadline);
    }

    /// Push a user-visible action: directly into the tick's dispatch vector
    /// in synchronous context, into the deferral queue otherwise.
    pub fn emit(&mut self, dispatch: &mut Vec<Dispatch>, action: Dispatch) {
        if self.in_async {
            self.deferred.push(action);
        } else {
            dispatch.push(action);
        }
    }

    /// Transition an endpoint to `Failed`: purge its window with the given
    /// status, report the peer failure once, detach it from the registry.
    pub fn fail_ep(&mut self, ep_id: EpId, dispatch: &mut Vec<Dispatch>, err: &dyn Fn() -> Error) {
        let Some(ep) = self.eps.get_mut(ep_id) else {
            return;
        };
        if ep.state == EpState::Failed {
            return;
        }
        log::debug!(
            "[ep] id={} failing state={} unack={}",
            ep_id,
            ep.state.name(),
            ep.tx.unack.len()
        );
        ep.state = EpState::Failed;
        ep.cancel_timer();
        IfaceMetrics::inc(&self.metrics.ep_timeouts);

        self.purge_ep_tx(ep_id, dispatch, err);
        self.cep_detach(ep_id);

        let ep = self.eps.get_mut(ep_id).expect("ep alive");
        if !ep.has_flag(crate::ep::EP_FLAG_ERR_REPORTED) {
            ep.set_flag(crate::ep::EP_FLAG_ERR_REPORTED);
            self.emit(dispatch, Dispatch::PeerError { ep: ep_id, err: err() });
        }

        // Nobody holds a handle to a private or already-closed endpoint;
        // free it now that the window is purged.
        let ep = self.eps.get(ep_id).expect("ep alive");
        if ep.has_flag(EP_FLAG_PRIVATE) || ep.has_flag(EP_FLAG_DISCONNECTED) {
            self.free_ep(ep_id);
        }
    }

    /// Release every unacknowledged skb and parked message with `err`.
    pub fn purge_ep_tx(
        &mut self,
        ep_id: EpId,
        dispatch: &mut Vec<Dispatch>,
        err: &dyn Fn() -> Error,
    ) {
        let Some(ep) = self.eps.get_mut(ep_id) else {
            return;
        };
        let unack: Vec<SkbId> = ep.tx.unack.drain(..).collect();

        // Shadows still in flight for this endpoint reference skbs freed
        // below; their completions must not touch the recycled slots.
        let outstanding: Vec<SkbId> = self
            .tx
            .outstanding_q
            .iter()
            .copied()
            .chain(self.tx.outstanding_map.values().copied())
            .collect();
        for id in outstanding {
            if let Some(desc) = self.tx.pool.get_mut(id).ctl.as_mut() {
                if desc.ep == ep_id {
                    desc.resent_skb = None;
                }
            }
        }
        for id in unack {
            let skb = self.tx.pool.get_mut(id);
            if let Some(cdesc) = skb.comp.take() {
                let action = Dispatch::Comp {
                    comp: cdesc.comp,
                    status: Err(err()),
                };
                if self.in_async {
                    self.deferred.push(action);
                } else {
                    dispatch.push(action);
                }
            }
            self.tx.pool.release(id);
        }
        for msg in self.pending.purge_ep(ep_id) {
            if let Some(comp) = msg.comp {
                let action = Dispatch::Comp {
                    comp,
                    status: Err(err()),
                };
                if self.in_async {
                    self.deferred.push(action);
                } else {
                    dispatch.push(action);
                }
            }
        }
        // Acknowledged-but-deferred completions for this endpoint stay in
        // async_comp_q; they completed successfully before the failure.
    }

    /// Remove the endpoint from the connection-match registry if present.
    pub fn cep_detach(&mut self, ep_id: EpId) {
        let Some(ep) = self.eps.get_mut(ep_id) else {
            return;
        };
        if !ep.has_flag(EP_FLAG_ON_CEP) {
            return;
        }
        let queue = if ep.has_flag(EP_FLAG_PRIVATE) {
            QueueType::Unexp
        } else {
            QueueType::Exp
        };
        let addr = ep.peer_addr.clone();
        ep.clear_flag(EP_FLAG_ON_CEP);
        if let Some(addr) = addr {
            self.cep.remove(&addr, ep_id, queue);
        }
    }

    /// Drop the endpoint from the table. The TX window must already be
    /// purged; buffered out-of-order receives are released here.
    pub fn free_ep(&mut self, ep_id: EpId) {
        self.cep_detach(ep_id);
        if let Some(mut ep) = self.eps.remove(ep_id) {
            debug_assert!(ep.tx.unack.is_empty(), "freeing ep with live window");
            ep.cancel_timer();
            for (_, rx_id) in ep.rx.ooo.drain(..) {
                let skb = self.rx.pool.take(rx_id);
                self.rx.available = (self.rx.available + 1).min(self.rx.qp_len - self.rx.quota);
                drop(skb);
            }
            log::debug!("[ep] id={} freed", ep_id);
        }
    }

    pub fn snapshot_ep(&self, ep: &Ep) -> EpInfo {
        EpInfo {
            ep_id: ep.ep_id,
            dest_ep_id: ep.dest_ep_id,
            conn_sn: ep.conn_sn,
            state: ep.state.name(),
            flags: ep.flags,
            psn: ep.tx.psn,
            acked_psn: ep.tx.acked_psn,
            max_psn: ep.tx.max_psn,
            rx_acked_psn: ep.rx.acked_psn,
            cwnd: ep.cwnd,
            unack_len: ep.tx.unack.len(),
            resend_count: ep.tx.resend_count,
        }
    }
}

type AmHandler = Box<dyn FnMut(&[u8]) + Send>;
type PutHandler = Box<dyn FnMut(u64, &[u8]) + Send>;
type ErrorHandler = Box<dyn FnMut(EpId, &Error) + Send>;

/// User callback tables, locked independently of [`State`].
pub(crate) struct Callbacks {
    pub am: Vec<Option<AmHandler>>,
    pub put: Option<PutHandler>,
    pub error: Option<ErrorHandler>,
}

struct AsyncCtl {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

pub(crate) struct IfaceInner {
    pub state: Mutex<State>,
    pub callbacks: Mutex<Callbacks>,
    pub wake_tx: Sender<()>,
    pub wake_rx: Receiver<()>,
    pub fork_gen: u64,
    async_ctl: Mutex<Option<AsyncCtl>>,
}

impl IfaceInner {
    fn check_fork(&self) -> Result<()> {
        if fork::generation() != self.fork_gen {
            return Err(Error::Canceled);
        }
        Ok(())
    }
}

/// The interface handle.
pub struct Iface {
    inner: Arc<IfaceInner>,
}

impl Iface {
    /// Open an interface over a fabric adapter.
    ///
    /// Validates the configuration, creates the queue pair, sizes the pools
    /// and installs the fork guard. Fails with [`Error::InvalidParam`] on a
    /// bad configuration and propagates fabric open errors
    /// ([`Error::NoDevice`], [`Error::Unreachable`]).
    pub fn new(mut fabric: Box<dyn Fabric>, cfg: IfaceConfig) -> Result<Iface> {
        cfg.validate()?;
        fork::install();

        fabric.create_qp(cfg.tx_qp_len, cfg.rx_qp_len)?;

        let seg_size = cfg.seg_size.min(fabric.max_payload());
        if seg_size <= proto::NETH_LEN {
            fabric.destroy_qp();
            return Err(Error::InvalidParam(
                "fabric payload limit below header size".into(),
            ));
        }

        let gid_filter = if cfg.eth_dgid_check && fabric.is_roce() {
            Some(fabric.local_gids().into_iter().collect())
        } else {
            None
        };

        let mut local_addr = vec![0u8; fabric.addr_len()].into_boxed_slice();
        fabric.local_addr(&mut local_addr);

        let now = Instant::now();
        let rx_available = cfg.rx_queue_len_init.min(cfg.rx_qp_len);
        let state = State {
            seg_size,
            eps: EpTable::new(),
            cep: ConnMatchCtx::new(fabric.addr_len()),
            tx: TxState {
                pool: TxPool::new(cfg.tx_qp_len as usize, seg_size),
                available: cfg.tx_qp_len,
                qp_len: cfg.tx_qp_len,
                sn: 0,
                last_comp_sn: u16::MAX,
                unsignaled: 0,
                ordered: fabric.ordered_send_comp(),
                outstanding_q: VecDeque::new(),
                outstanding_map: HashMap::new(),
                async_comp_q: VecDeque::new(),
            },
            rx: RxState {
                pool: RxPool::new(cfg.rx_qp_len as usize),
                available: rx_available,
                quota: cfg.rx_qp_len - rx_available,
                qp_len: cfg.rx_qp_len,
                pending_q: VecDeque::new(),
            },
            wheel: TimerWheel::new(cfg.timer_tick / 4, now),
            pending: PendingArbiter::new(),
            metrics: Arc::new(IfaceMetrics::default()),
            gid_filter,
            local_addr,
            in_async: false,
            deferred: Vec::new(),
            closing: false,
            fabric,
            cfg,
        };

        log::debug!(
            "[iface] open seg_size={} tx_qp_len={} rx_qp_len={}",
            seg_size,
            state.tx.qp_len,
            state.rx.qp_len
        );

        let (wake_tx, wake_rx) = channel::bounded(1);
        let inner = Arc::new(IfaceInner {
            state: Mutex::new(state),
            callbacks: Mutex::new(Callbacks {
                am: (0..=proto::AM_ID_MAX).map(|_| None).collect(),
                put: None,
                error: None,
            }),
            wake_tx,
            wake_rx,
            fork_gen: fork::generation(),
            async_ctl: Mutex::new(None),
        });
        Ok(Iface { inner })
    }

    /// This interface's packed address, for out-of-band exchange.
    pub fn address(&self) -> Vec<u8> {
        self.inner.state.lock().local_addr.to_vec()
    }

    /// Create an endpoint towards `peer_addr` (a packed address obtained
    /// from the peer's [`Iface::address`]).
    ///
    /// If an earlier connection request from that peer already created a
    /// private endpoint with the matching connection sequence number, it is
    /// adopted; otherwise a new endpoint is registered and a CREQ goes out.
    pub fn create_ep(&self, peer_addr: &[u8], path_index: u8) -> Result<Endpoint> {
        self.inner.check_fork()?;
        let mut st = self.inner.state.lock();
        if st.closing {
            return Err(Error::Canceled);
        }
        if peer_addr.len() != st.cep.address_length() {
            return Err(Error::InvalidParam(format!(
                "peer address must be {} bytes (got {})",
                st.cep.address_length(),
                peer_addr.len()
            )));
        }

        let conn_sn = st.cep.get_next_sn(peer_addr);

        // Adopt the private endpoint a peer-initiated request created, if
        // one matches.
        if let Some(ep_id) = st.cep.get(peer_addr, conn_sn, QueueType::Unexp, true) {
            let ep = st.eps.get_mut(ep_id).expect("registered ep alive");
            ep.clear_flag(EP_FLAG_PRIVATE | EP_FLAG_ON_CEP);
            log::debug!(
                "[iface] create_ep adopted private ep={} conn_sn={}",
                ep_id,
                conn_sn
            );
            return Ok(Endpoint {
                inner: Arc::clone(&self.inner),
                id: ep_id,
                closed: false,
            });
        }

        let now = Instant::now();
        let ep = Ep::new(
            conn_sn,
            path_index,
            Some(peer_addr.into()),
            st.cfg.initial_psn,
            now,
        );
        let ep_id = st.eps.insert(Box::new(ep));
        st.cep.insert(peer_addr, conn_sn, ep_id, QueueType::Exp);
        st.eps.get_mut(ep_id).expect("ep alive").set_flag(EP_FLAG_ON_CEP);

        // A full pool can defer the request; the endpoint timer retries it.
        if let Err(e) = ep_tx::send_creq(&mut st, ep_id, now) {
            log::debug!("[iface] creq deferred ep={} err={}", ep_id, e);
        }
        let tick = st.cfg.timer_tick;
        st.ensure_ep_timer(ep_id, now + tick);

        log::debug!("[iface] create_ep ep={} conn_sn={}", ep_id, conn_sn);
        Ok(Endpoint {
            inner: Arc::clone(&self.inner),
            id: ep_id,
            closed: false,
        })
    }

    /// Register the handler for an active-message id (0..=31).
    pub fn set_am_handler(
        &self,
        am_id: u8,
        handler: impl FnMut(&[u8]) + Send + 'static,
    ) -> Result<()> {
        if am_id > proto::AM_ID_MAX {
            return Err(Error::InvalidParam(format!("am id {} out of range", am_id)));
        }
        self.inner.callbacks.lock().am[am_id as usize] = Some(Box::new(handler));
        Ok(())
    }

    /// Register the put handler, receiving the remote virtual address and
    /// the payload.
    pub fn set_put_handler(&self, handler: impl FnMut(u64, &[u8]) + Send + 'static) {
        self.inner.callbacks.lock().put = Some(Box::new(handler));
    }

    /// Register the peer-failure callback.
    pub fn set_error_handler(&self, handler: impl FnMut(EpId, &Error) + Send + 'static) {
        self.inner.callbacks.lock().error = Some(Box::new(handler));
    }

    /// Synchronous progress tick. Returns the number of dispatched events.
    pub fn progress(&self) -> usize {
        if self.inner.check_fork().is_err() {
            return 0;
        }
        let actions = progress::progress_once(&self.inner, false);
        progress::dispatch_actions(&self.inner, actions)
    }

    /// Enable progress directions and start the asynchronous timer.
    pub fn progress_enable(&self, flags: u32) {
        {
            let mut st = self.inner.state.lock();
            if flags & PROGRESS_RECV != 0 {
                st.rx.available = (st.rx.available + st.rx.quota).min(st.rx.qp_len);
                st.rx.quota = 0;
            }
        }
        let mut ctl = self.inner.async_ctl.lock();
        if ctl.is_none() {
            let (stop_tx, stop_rx) = channel::bounded::<()>(1);
            let inner = Arc::clone(&self.inner);
            let tick = self.inner.state.lock().cfg.async_timer_tick;
            let handle = std::thread::Builder::new()
                .name("rud-async".into())
                .spawn(move || loop {
                    match stop_rx.recv_timeout(tick) {
                        Ok(()) | Err(channel::RecvTimeoutError::Disconnected) => break,
                        Err(channel::RecvTimeoutError::Timeout) => {
                            progress::progress_async(&inner);
                        }
                    }
                })
                .expect("spawn async progress thread");
            *ctl = Some(AsyncCtl { stop_tx, handle });
        }
    }

    /// Stop the asynchronous timer.
    pub fn progress_disable(&self, _flags: u32) {
        let ctl = self.inner.async_ctl.lock().take();
        if let Some(ctl) = ctl {
            let _ = ctl.stop_tx.send(());
            let _ = ctl.handle.join();
        }
    }

    /// Block until asynchronous progress deferred work for the user thread,
    /// or the timeout elapses. Returns whether a wake arrived.
    pub fn wait(&self, timeout: Duration) -> bool {
        self.inner.wake_rx.recv_timeout(timeout).is_ok()
    }

    /// Interface-wide flush: done once every endpoint's window is drained
    /// and no outstanding or deferred completion remains.
    pub fn flush(&self) -> Result<FlushState> {
        self.inner.check_fork()?;
        let st = self.inner.state.lock();
        if !st.tx.outstanding_is_empty()
            || !st.tx.async_comp_q.is_empty()
            || !st.deferred.is_empty()
        {
            return Ok(FlushState::InProgress);
        }
        for ep in st.eps.iter() {
            if !ep.tx_drained() || st.pending.has_ep(ep.ep_id) {
                return Ok(FlushState::InProgress);
            }
        }
        Ok(FlushState::Done)
    }

    /// Counter snapshot.
    pub fn stats(&self) -> IfaceStats {
        let st = self.inner.state.lock();
        let m = &st.metrics;
        IfaceStats {
            tx_available: st.tx.available,
            rx_available: st.rx.available,
            tx_qp_len: st.tx.qp_len,
            rx_qp_len: st.rx.qp_len,
            num_eps: st.eps.len(),
            rx_packets: IfaceMetrics::get(&m.rx_packets),
            rx_drop: IfaceMetrics::get(&m.rx_drop),
            rx_dup: IfaceMetrics::get(&m.rx_dup),
            tx_packets: IfaceMetrics::get(&m.tx_packets),
            retransmits: IfaceMetrics::get(&m.retransmits),
            acks_sent: IfaceMetrics::get(&m.acks_sent),
            naks_sent: IfaceMetrics::get(&m.naks_sent),
            comps_dispatched: IfaceMetrics::get(&m.comps_dispatched),
            ep_timeouts: IfaceMetrics::get(&m.ep_timeouts),
        }
    }

    /// Snapshot of one endpoint.
    pub fn ep_info(&self, ep_id: EpId) -> Option<EpInfo> {
        let st = self.inner.state.lock();
        st.eps.get(ep_id).map(|ep| st.snapshot_ep(ep))
    }

    /// Snapshot of every live endpoint.
    pub fn endpoints(&self) -> Vec<EpInfo> {
        let st = self.inner.state.lock();
        st.eps.iter().map(|ep| st.snapshot_ep(ep)).collect()
    }
}

impl Drop for Iface {
    fn drop(&mut self) {
        // A forked child inherits the interface but must leak it: the queue
        // pair (and the progress thread's join handle) belong to the
        // parent. Nothing is locked or joined on this path.
        if self.inner.check_fork().is_err() {
            return;
        }
        self.progress_disable(0);
        let actions = progress::teardown(&self.inner);
        progress::dispatch_actions(&self.inner, actions);
    }
}

/// Handle to one endpoint. Dropping it closes the endpoint (flush first for
/// a clean shutdown).
pub struct Endpoint {
    inner: Arc<IfaceInner>,
    id: EpId,
    closed: bool,
}

impl Endpoint {
    pub fn id(&self) -> EpId {
        self.id
    }

    fn send_guard(&self) -> Result<()> {
        if self.closed {
            return Err(Error::InvalidParam("endpoint closed".into()));
        }
        self.inner.check_fork()
    }

    /// Send a small active message by copying it into a pool buffer.
    pub fn am_short(&self, am_id: u8, data: &[u8]) -> Result<()> {
        self.send_guard()?;
        let mut st = self.inner.state.lock();
        ep_tx::am_send(&mut st, self.id, am_id, data, None, None, Instant::now())
    }

    /// Send an active message through a caller-provided packer writing into
    /// the skb buffer; returns the packed length.
    pub fn am_bcopy(
        &self,
        am_id: u8,
        pack: impl FnOnce(&mut [u8]) -> usize,
        comp: Option<SendCompletion>,
    ) -> Result<usize> {
        self.send_guard()?;
        let mut st = self.inner.state.lock();
        ep_tx::am_send_bcopy(&mut st, self.id, am_id, pack, comp, Instant::now())
    }

    /// Send an active message without copying the payload; the buffer is
    /// held until cumulative acknowledgment, then the completion fires.
    pub fn am_zcopy(
        &self,
        am_id: u8,
        payload: Arc<[u8]>,
        comp: Option<SendCompletion>,
    ) -> Result<()> {
        self.send_guard()?;
        let mut st = self.inner.state.lock();
        ep_tx::am_send(
            &mut st,
            self.id,
            am_id,
            &[],
            Some(payload),
            comp,
            Instant::now(),
        )
    }

    /// Put `data` at the peer's remote virtual address.
    pub fn put_short(&self, rva: u64, data: &[u8]) -> Result<()> {
        self.send_guard()?;
        let mut st = self.inner.state.lock();
        ep_tx::put_send(&mut st, self.id, rva, data, None, Instant::now())
    }

    /// Park an active message in the pending arbiter; it is sent in FIFO
    /// order once the endpoint has resources again.
    pub fn pending_am(
        &self,
        am_id: u8,
        data: Vec<u8>,
        comp: Option<SendCompletion>,
    ) -> Result<()> {
        self.send_guard()?;
        if am_id > proto::AM_ID_MAX {
            return Err(Error::InvalidParam(format!("am id {} out of range", am_id)));
        }
        let mut st = self.inner.state.lock();
        if st.eps.get(self.id).is_none() {
            return Err(Error::InvalidParam("endpoint gone".into()));
        }
        // Validate here so the arbiter can never hit a terminal error when
        // it finally posts the message.
        if data.is_empty() || proto::NETH_LEN + data.len() > st.seg_size {
            return Err(Error::InvalidParam(format!(
                "bad pending payload length {}",
                data.len()
            )));
        }
        st.pending.push(
            self.id,
            pending::PendingMsg {
                op: pending::PendingOp::Am { am_id, data },
                comp,
                once: false,
            },
        );
        Ok(())
    }

    /// Endpoint flush: done once every send issued so far is cumulatively
    /// acknowledged and no completion for this endpoint is still deferred.
    pub fn flush(&self) -> Result<FlushState> {
        self.send_guard()?;
        let st = self.inner.state.lock();
        let Some(ep) = st.eps.get(self.id) else {
            return Err(Error::InvalidParam("endpoint gone".into()));
        };
        if ep.state == EpState::Failed {
            return Err(Error::EndpointTimeout);
        }
        let comp_deferred = st
            .tx
            .async_comp_q
            .iter()
            .any(|&id| st.tx.pool.get(id).comp.as_ref().is_some_and(|c| c.ep == self.id));
        if ep.tx_drained() && !comp_deferred && !st.pending.has_ep(self.id) {
            Ok(FlushState::Done)
        } else {
            Ok(FlushState::InProgress)
        }
    }

    /// Close the endpoint. A drained endpoint is freed immediately; one
    /// with in-flight state keeps draining retransmits until empty or the
    /// linger timeout, then is freed.
    pub fn close(mut self) {
        self.do_close();
    }

    fn do_close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut actions = Vec::new();
        {
            let mut st = self.inner.state.lock();
            if st.closing {
                return;
            }
            let st = &mut *st;
            let now = Instant::now();
            let Some(ep) = st.eps.get_mut(self.id) else {
                return;
            };
            ep.set_flag(EP_FLAG_DISCONNECTED);
            if ep.state == EpState::Failed || (ep.tx_drained() && !st.pending.has_ep(self.id)) {
                st.purge_ep_tx(self.id, &mut actions, &|| Error::Canceled);
                st.free_ep(self.id);
            } else {
                // Parked messages die with the close; only the in-flight
                // window keeps draining.
                for msg in st.pending.purge_ep(self.id) {
                    if let Some(comp) = msg.comp {
                        actions.push(Dispatch::Comp {
                            comp,
                            status: Err(Error::Canceled),
                        });
                    }
                }
                let linger = st.cfg.linger_timeout;
                let tick = st.cfg.timer_tick;
                let ep = st.eps.get_mut(self.id).expect("ep alive");
                ep.state = EpState::Disconnecting;
                ep.linger_deadline = Some(now + linger);
                st.rearm_ep_timer(self.id, now + tick);
            }
        }
        progress::dispatch_actions(&self.inner, actions);
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.do_close();
    }
}
