// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Send/receive buffer descriptors ("skbs") drawn from the bounded pools.
//!
//! A send skb carries the encoded network header plus either an inline copy
//! of the payload or, for zero-copy sends, a reference-counted payload posted
//! as a second iovec frame. Two optional tail descriptors extend it:
//!
//! - the completion descriptor (present iff `SKB_FLAG_COMP` is set) holds the
//!   user completion and the owning endpoint;
//! - the control descriptor (set on every signaled post) holds the fabric
//!   send sequence `sn`, the owning endpoint, and for retransmission shadows
//!   a back-reference to the original skb still flagged `SKB_FLAG_RESENDING`.
//!
//! Skbs never own their endpoint; they refer to it by [`EpId`] and the lookup
//! happens at completion time, which is what allows the endpoint array to be
//! the single owner of endpoint state.

use std::sync::Arc;

use crate::core::psn::Psn;
use crate::core::EpId;

/// Skb is in the pool free list; must never be posted or released.
pub const SKB_FLAG_INVALID: u16 = 0x01;
/// A retransmission shadow referencing this skb is still in flight.
pub const SKB_FLAG_RESENDING: u16 = 0x02;
/// Explicit acknowledgment control skb; freed on send completion.
pub const SKB_FLAG_CTL_ACK: u16 = 0x04;
/// Retransmission shadow; freed on send completion, clears `RESENDING`
/// on the referenced original.
pub const SKB_FLAG_CTL_RESEND: u16 = 0x08;
/// Completion descriptor present; user completion fires on release.
pub const SKB_FLAG_COMP: u16 = 0x10;
/// Zero-copy payload attached; freed on cumulative acknowledgment.
pub const SKB_FLAG_ZCOPY: u16 = 0x20;
/// Pending-arbiter marker: the message already stopped one arbiter round.
pub const SKB_FLAG_PENDING_ONCE: u16 = 0x40;

/// User send completion, invoked exactly once with the final status.
pub type SendCompletion = Box<dyn FnOnce(crate::Result<()>) + Send>;

/// Completion descriptor (tail of a send skb with `SKB_FLAG_COMP`).
pub struct CompDesc {
    pub ep: EpId,
    pub comp: SendCompletion,
}

/// Control descriptor for signaled sends.
#[derive(Debug, Clone, Copy)]
pub struct CtlDesc {
    /// Fabric send sequence stamped on the post; the key into the
    /// outstanding-send index.
    pub sn: u16,
    pub ep: EpId,
    /// Original skb whose bytes this shadow replays, if any.
    pub resent_skb: Option<SkbId>,
}

/// Handle into the TX pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SkbId(pub u32);

/// Handle into the RX pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RxSkbId(pub u32);

/// Send buffer descriptor.
pub struct SendSkb {
    pub flags: u16,
    pub psn: Psn,
    /// Bytes of `buf` in use (network header + inline payload).
    pub len: usize,
    pub buf: Box<[u8]>,
    /// Zero-copy payload, posted as a second frame after `buf[..len]`.
    pub zdata: Option<Arc<[u8]>>,
    pub comp: Option<CompDesc>,
    pub ctl: Option<CtlDesc>,
}

impl SendSkb {
    pub(crate) fn with_capacity(seg_size: usize) -> Self {
        Self {
            flags: SKB_FLAG_INVALID,
            psn: 0,
            len: 0,
            buf: vec![0u8; seg_size].into_boxed_slice(),
            zdata: None,
            comp: None,
            ctl: None,
        }
    }

    #[inline]
    pub fn has(&self, flag: u16) -> bool {
        (self.flags & flag) != 0
    }

    /// Total on-wire length (header + inline + zero-copy payload).
    #[inline]
    pub fn wire_len(&self) -> usize {
        self.len + self.zdata.as_ref().map_or(0, |z| z.len())
    }
}

/// What a received packet resolves to once the header is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvKind {
    /// Active message for the handler registered under this id.
    Am(u8),
    /// Put with the remote virtual address from the sub-header.
    Put(u64),
    /// Reliable handshake control (CREQ/CREP); applied inline, never
    /// dispatched to a user handler.
    Ctl,
}

/// Receive buffer descriptor: an owned datagram plus its parsed routing.
pub struct RecvSkb {
    pub kind: RecvKind,
    /// Payload span inside `data` (past header and sub-headers).
    pub off: usize,
    pub len: usize,
    pub psn: Psn,
    pub data: Vec<u8>,
}

impl RecvSkb {
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.data[self.off..self.off + self.len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skb_flags() {
        let mut skb = SendSkb::with_capacity(64);
        assert!(skb.has(SKB_FLAG_INVALID));
        skb.flags = SKB_FLAG_CTL_RESEND | SKB_FLAG_RESENDING;
        assert!(skb.has(SKB_FLAG_CTL_RESEND));
        assert!(!skb.has(SKB_FLAG_COMP));
    }

    #[test]
    fn test_skb_wire_len_includes_zcopy() {
        let mut skb = SendSkb::with_capacity(64);
        skb.len = 8;
        assert_eq!(skb.wire_len(), 8);
        skb.zdata = Some(Arc::from(&b"abcd"[..]));
        assert_eq!(skb.wire_len(), 12);
    }

    #[test]
    fn test_recv_skb_payload_span() {
        let skb = RecvSkb {
            kind: RecvKind::Am(3),
            off: 8,
            len: 5,
            psn: 1,
            data: b"hdrhdrhdhello!!!".to_vec(),
        };
        assert_eq!(skb.payload(), b"hello");
    }
}
