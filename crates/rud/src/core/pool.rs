// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bounded, pre-allocated skb pools.
//!
//! Allocation is O(1) from a free list and never blocks: exhaustion returns
//! `None`, which callers surface as [`crate::Error::NoResource`], the
//! trigger for pending-queue deferral. All access happens under the
//! interface lock, so no internal synchronization is needed.
//!
//! The TX pool holds exactly `tx_qp_len` descriptors, the RX pool exactly
//! `rx_qp_len`; a descriptor is released exactly once (double release is a
//! `debug_assert!` failure and a silent no-op in release builds).

use crate::core::skb::{RecvSkb, RxSkbId, SendSkb, SkbId, SKB_FLAG_INVALID};

/// Fixed-capacity pool of send skbs.
pub struct TxPool {
    slots: Vec<SendSkb>,
    free: Vec<u32>,
}

impl TxPool {
    pub fn new(capacity: usize, seg_size: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| SendSkb::with_capacity(seg_size))
            .collect();
        let free = (0..capacity as u32).rev().collect();
        Self { slots, free }
    }

    /// Allocate a descriptor, resetting it to a clean state.
    pub fn alloc(&mut self) -> Option<SkbId> {
        let idx = self.free.pop()?;
        let skb = &mut self.slots[idx as usize];
        debug_assert!(skb.has(SKB_FLAG_INVALID), "allocating a live skb");
        skb.flags = 0;
        skb.psn = 0;
        skb.len = 0;
        skb.zdata = None;
        skb.comp = None;
        skb.ctl = None;
        Some(SkbId(idx))
    }

    #[inline]
    pub fn get(&self, id: SkbId) -> &SendSkb {
        &self.slots[id.0 as usize]
    }

    #[inline]
    pub fn get_mut(&mut self, id: SkbId) -> &mut SendSkb {
        &mut self.slots[id.0 as usize]
    }

    /// Return a descriptor to the pool, dropping any attached payload or
    /// completion still present.
    pub fn release(&mut self, id: SkbId) {
        let skb = &mut self.slots[id.0 as usize];
        if skb.has(SKB_FLAG_INVALID) {
            debug_assert!(false, "double release of skb {:?}", id);
            return;
        }
        skb.flags = SKB_FLAG_INVALID;
        skb.zdata = None;
        skb.comp = None;
        skb.ctl = None;
        self.free.push(id.0);
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Copy one skb's wire image into another (retransmission shadows).
    ///
    /// Clones the buffer prefix, length, PSN and any zero-copy payload
    /// reference; flags and descriptors stay untouched.
    pub fn clone_for_resend(&mut self, src: SkbId, dst: SkbId) {
        debug_assert_ne!(src, dst);
        let (src_ref, dst_ref): (&SendSkb, &mut SendSkb) = if src.0 < dst.0 {
            let (left, right) = self.slots.split_at_mut(dst.0 as usize);
            (&left[src.0 as usize], &mut right[0])
        } else {
            let (left, right) = self.slots.split_at_mut(src.0 as usize);
            (&right[0], &mut left[dst.0 as usize])
        };
        dst_ref.len = src_ref.len;
        dst_ref.psn = src_ref.psn;
        dst_ref.buf[..src_ref.len].copy_from_slice(&src_ref.buf[..src_ref.len]);
        dst_ref.zdata = src_ref.zdata.clone();
    }
}

/// Fixed-capacity table of in-flight receive skbs.
///
/// A slot is occupied between packet arrival and delivery (or drop); queues
/// such as the out-of-order buffer and `pending_rx_q` hold [`RxSkbId`]s into
/// this table.
pub struct RxPool {
    slots: Vec<Option<RecvSkb>>,
    free: Vec<u32>,
}

impl RxPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            free: (0..capacity as u32).rev().collect(),
        }
    }

    pub fn insert(&mut self, skb: RecvSkb) -> Option<RxSkbId> {
        let idx = self.free.pop()?;
        debug_assert!(self.slots[idx as usize].is_none());
        self.slots[idx as usize] = Some(skb);
        Some(RxSkbId(idx))
    }

    #[inline]
    pub fn get(&self, id: RxSkbId) -> &RecvSkb {
        self.slots[id.0 as usize].as_ref().expect("live rx skb")
    }

    /// Remove the descriptor, freeing the slot.
    pub fn take(&mut self, id: RxSkbId) -> RecvSkb {
        let skb = self.slots[id.0 as usize].take().expect("live rx skb");
        self.free.push(id.0);
        skb
    }

    /// Drop the descriptor without delivering it.
    pub fn release(&mut self, id: RxSkbId) {
        let _ = self.take(id);
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::skb::RecvKind;

    #[test]
    fn test_txpool_alloc_release_cycle() {
        let mut pool = TxPool::new(4, 128);
        let a = pool.alloc().expect("alloc");
        let b = pool.alloc().expect("alloc");
        assert_ne!(a, b);
        assert_eq!(pool.available(), 2);
        pool.release(a);
        assert_eq!(pool.available(), 3);
        // Freed slot is handed out again.
        let c = pool.alloc().expect("alloc");
        assert_eq!(a, c);
    }

    #[test]
    fn test_txpool_exhaustion_returns_none() {
        let mut pool = TxPool::new(2, 64);
        let _a = pool.alloc().expect("alloc");
        let _b = pool.alloc().expect("alloc");
        assert!(pool.alloc().is_none());
    }

    #[test]
    fn test_txpool_alloc_resets_state() {
        let mut pool = TxPool::new(1, 64);
        let a = pool.alloc().expect("alloc");
        pool.get_mut(a).len = 42;
        pool.get_mut(a).flags |= crate::core::skb::SKB_FLAG_COMP;
        pool.release(a);
        let b = pool.alloc().expect("alloc");
        assert_eq!(pool.get(b).len, 0);
        assert_eq!(pool.get(b).flags, 0);
    }

    #[test]
    fn test_txpool_clone_for_resend() {
        let mut pool = TxPool::new(4, 64);
        let a = pool.alloc().expect("alloc");
        let b = pool.alloc().expect("alloc");
        {
            let skb = pool.get_mut(a);
            skb.len = 5;
            skb.psn = 99;
            skb.buf[..5].copy_from_slice(b"hello");
        }
        pool.clone_for_resend(a, b);
        let shadow = pool.get(b);
        assert_eq!(shadow.len, 5);
        assert_eq!(shadow.psn, 99);
        assert_eq!(&shadow.buf[..5], b"hello");
        // Reverse direction as well.
        pool.clone_for_resend(b, a);
        assert_eq!(&pool.get(a).buf[..5], b"hello");
    }

    fn rx(psn: u16) -> RecvSkb {
        RecvSkb {
            kind: RecvKind::Am(0),
            off: 0,
            len: 4,
            psn,
            data: b"data".to_vec(),
        }
    }

    #[test]
    fn test_rxpool_insert_take() {
        let mut pool = RxPool::new(2);
        let a = pool.insert(rx(1)).expect("insert");
        let b = pool.insert(rx(2)).expect("insert");
        assert!(pool.insert(rx(3)).is_none());
        assert_eq!(pool.get(a).psn, 1);
        let skb = pool.take(b);
        assert_eq!(skb.psn, 2);
        assert_eq!(pool.available(), 1);
        pool.release(a);
        assert_eq!(pool.available(), 2);
    }
}
