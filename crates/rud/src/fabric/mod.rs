// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fabric adapter: the thin shim between the interface and the datagram
//! substrate.
//!
//! The interface consumes the fabric through [`Fabric`]: queue-pair setup
//! and teardown, posting sends, and polling completions in both directions.
//! Addresses are opaque byte blobs of a fabric-defined fixed length; the
//! reliability layer never parses them, it only hands them back for posting
//! and compares them bytewise in the connection-match registry.
//!
//! Two adapters ship with the crate: [`sim::SimNet`], an in-process hub used
//! by the protocol tests and tools, and [`udp::UdpFabric`], a UD emulation
//! over a UDP socket.

pub mod netdev;
pub mod sim;
pub mod udp;

/// 128-bit fabric address, as carried in the GRH.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Gid(pub [u8; 16]);

impl Gid {
    /// IPv4-mapped GID (`::ffff:a.b.c.d`), the RoCEv2 convention.
    pub fn from_ipv4(octets: [u8; 4]) -> Self {
        let mut raw = [0u8; 16];
        raw[10] = 0xFF;
        raw[11] = 0xFF;
        raw[12..16].copy_from_slice(&octets);
        Gid(raw)
    }
}

/// A completed signaled send, identified by its post sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxCompletion {
    pub sn: u16,
}

/// A received datagram: the GRH destination GID plus the post-GRH bytes.
#[derive(Debug)]
pub struct RecvDatagram {
    pub dgid: Gid,
    pub data: Vec<u8>,
}

/// The operations the interface needs from a datagram fabric.
pub trait Fabric: Send {
    /// Create the shared queue pair with the given queue depths.
    fn create_qp(&mut self, tx_qp_len: u16, rx_qp_len: u16) -> crate::Result<()>;

    /// Tear the queue pair down. Idempotent.
    fn destroy_qp(&mut self);

    /// Whether send completions are reported in posting order. Decides the
    /// shape of the interface's outstanding-send index.
    fn ordered_send_comp(&self) -> bool;

    /// Fixed length of peer-address blobs for this fabric.
    fn addr_len(&self) -> usize;

    /// Pack this fabric's own address into `buf` (`addr_len` bytes).
    fn local_addr(&self, buf: &mut [u8]);

    /// Local GIDs accepted as GRH destinations.
    fn local_gids(&self) -> Vec<Gid>;

    /// Whether this is an Ethernet (RoCE-style) fabric; enables the
    /// destination-GID check.
    fn is_roce(&self) -> bool;

    /// Largest post-GRH packet the path carries.
    fn max_payload(&self) -> usize;

    /// Post a send towards `dest`. `frames` are gathered in order onto the
    /// wire. `sn` identifies the post; a completion is reported for it only
    /// when `signaled` is set (unordered fabrics signal every post).
    fn post_send(
        &mut self,
        dest: &[u8],
        frames: &[&[u8]],
        signaled: bool,
        sn: u16,
    ) -> crate::Result<()>;

    /// Collect completed signaled sends.
    fn poll_tx(&mut self) -> Vec<TxCompletion>;

    /// Collect up to `max` received datagrams.
    fn poll_rx(&mut self, max: usize) -> Vec<RecvDatagram>;

    /// Drain a pending device-level fatal event.
    ///
    /// A reported event fails every endpoint on the interface before any
    /// other work of the progress tick runs; the event is consumed by this
    /// call. Fabrics without an asynchronous error channel keep the
    /// default.
    fn poll_fatal(&mut self) -> Option<crate::Error> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gid_from_ipv4_mapping() {
        let gid = Gid::from_ipv4([10, 0, 0, 1]);
        assert_eq!(&gid.0[..10], &[0u8; 10]);
        assert_eq!(&gid.0[10..12], &[0xFF, 0xFF]);
        assert_eq!(&gid.0[12..], &[10, 0, 0, 1]);
    }
}
