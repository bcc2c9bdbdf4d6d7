// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process simulated fabric.
//!
//! A [`SimNet`] hub connects any number of attached fabrics through
//! per-node datagram queues. Delivery is lossless and ordered unless a drop
//! hook is installed, which is how the protocol tests inject arbitrary loss
//! patterns. Send completions are immediate; the hub can be switched to
//! unordered completion reporting to exercise the map-based outstanding
//! index.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Fabric, Gid, RecvDatagram, TxCompletion};

/// Packed address blob length: a 4-byte node id.
pub const SIM_ADDR_LEN: usize = 4;

/// Drop decision hook: called with the post-GRH packet bytes; `true` drops.
pub type DropHook = Box<dyn FnMut(&[u8]) -> bool + Send>;

struct Node {
    queue: VecDeque<RecvDatagram>,
    gid: Gid,
}

struct NetInner {
    nodes: HashMap<u32, Node>,
    next_id: u32,
}

/// The hub. Cheap to clone; all attached fabrics share it.
#[derive(Clone)]
pub struct SimNet {
    inner: Arc<Mutex<NetInner>>,
}

impl SimNet {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(NetInner {
                nodes: HashMap::new(),
                next_id: 1,
            })),
        }
    }

    /// Attach a new node and return its fabric endpoint.
    pub fn attach(&self) -> SimFabric {
        let mut net = self.inner.lock();
        let id = net.next_id;
        net.next_id += 1;
        let gid = Gid::from_ipv4([172, 16, (id >> 8) as u8, id as u8]);
        net.nodes.insert(
            id,
            Node {
                queue: VecDeque::new(),
                gid,
            },
        );
        SimFabric {
            net: Arc::clone(&self.inner),
            id,
            gid,
            qp_up: false,
            ordered: true,
            roce: true,
            comps: VecDeque::new(),
            drop_hook: None,
            fatal: Arc::new(Mutex::new(None)),
        }
    }
}

impl Default for SimNet {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle for injecting a device-level fatal event into an attached
/// fabric after it has been handed to an interface.
#[derive(Clone)]
pub struct FatalInjector {
    slot: Arc<Mutex<Option<crate::Error>>>,
}

impl FatalInjector {
    /// Queue a fatal event; the next progress tick consumes it and fails
    /// every endpoint on the interface.
    pub fn inject(&self, err: crate::Error) {
        *self.slot.lock() = Some(err);
    }
}

/// One node's view of the simulated fabric.
pub struct SimFabric {
    net: Arc<Mutex<NetInner>>,
    id: u32,
    gid: Gid,
    qp_up: bool,
    ordered: bool,
    roce: bool,
    comps: VecDeque<TxCompletion>,
    drop_hook: Option<DropHook>,
    fatal: Arc<Mutex<Option<crate::Error>>>,
}

impl SimFabric {
    /// Install a loss-injection hook. Dropped packets still complete at the
    /// sender, exactly like a real wire.
    pub fn set_drop_hook(&mut self, hook: DropHook) {
        self.drop_hook = Some(hook);
    }

    /// Obtain an injector for device-level fatal events, usable after the
    /// fabric moved into an interface.
    pub fn fatal_injector(&self) -> FatalInjector {
        FatalInjector {
            slot: Arc::clone(&self.fatal),
        }
    }

    /// Report completions out of posting order (every post signaled).
    pub fn set_unordered_comp(&mut self) {
        self.ordered = false;
    }

    /// Pretend to be a non-Ethernet fabric (disables the GID check path).
    pub fn set_non_roce(&mut self) {
        self.roce = false;
    }

    pub fn node_id(&self) -> u32 {
        self.id
    }
}

impl Fabric for SimFabric {
    fn create_qp(&mut self, _tx_qp_len: u16, _rx_qp_len: u16) -> crate::Result<()> {
        if !self.net.lock().nodes.contains_key(&self.id) {
            return Err(crate::Error::NoDevice("sim node detached".into()));
        }
        self.qp_up = true;
        Ok(())
    }

    fn destroy_qp(&mut self) {
        self.qp_up = false;
    }

    fn ordered_send_comp(&self) -> bool {
        self.ordered
    }

    fn addr_len(&self) -> usize {
        SIM_ADDR_LEN
    }

    fn local_addr(&self, buf: &mut [u8]) {
        buf[..SIM_ADDR_LEN].copy_from_slice(&self.id.to_be_bytes());
    }

    fn local_gids(&self) -> Vec<Gid> {
        vec![self.gid]
    }

    fn is_roce(&self) -> bool {
        self.roce
    }

    fn max_payload(&self) -> usize {
        4096
    }

    fn post_send(
        &mut self,
        dest: &[u8],
        frames: &[&[u8]],
        signaled: bool,
        sn: u16,
    ) -> crate::Result<()> {
        if !self.qp_up {
            return Err(crate::Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "qp not created",
            )));
        }
        if dest.len() != SIM_ADDR_LEN {
            return Err(crate::Error::InvalidParam("bad sim address".into()));
        }
        let dest_id = u32::from_be_bytes([dest[0], dest[1], dest[2], dest[3]]);

        let mut packet = Vec::with_capacity(frames.iter().map(|f| f.len()).sum());
        for f in frames {
            packet.extend_from_slice(f);
        }

        let dropped = self
            .drop_hook
            .as_mut()
            .map(|hook| hook(&packet))
            .unwrap_or(false);

        if !dropped {
            let mut net = self.net.lock();
            if let Some(node) = net.nodes.get_mut(&dest_id) {
                let dgid = node.gid;
                node.queue.push_back(RecvDatagram { dgid, data: packet });
            }
            // Unknown destination: the datagram vanishes, like on a real
            // unreliable fabric.
        }

        if signaled || !self.ordered {
            self.comps.push_back(TxCompletion { sn });
        }
        Ok(())
    }

    fn poll_tx(&mut self) -> Vec<TxCompletion> {
        self.comps.drain(..).collect()
    }

    fn poll_rx(&mut self, max: usize) -> Vec<RecvDatagram> {
        let mut net = self.net.lock();
        let Some(node) = net.nodes.get_mut(&self.id) else {
            return Vec::new();
        };
        let n = max.min(node.queue.len());
        node.queue.drain(..n).collect()
    }

    fn poll_fatal(&mut self) -> Option<crate::Error> {
        self.fatal.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr_of(f: &SimFabric) -> Vec<u8> {
        let mut buf = vec![0u8; SIM_ADDR_LEN];
        f.local_addr(&mut buf);
        buf
    }

    #[test]
    fn test_sim_delivery_in_order() {
        let net = SimNet::new();
        let mut a = net.attach();
        let mut b = net.attach();
        a.create_qp(16, 16).expect("qp");
        b.create_qp(16, 16).expect("qp");

        let dest = addr_of(&b);
        a.post_send(&dest, &[&b"one"[..]], false, 1).expect("send");
        a.post_send(&dest, &[&b"tw"[..], &b"o"[..]], false, 2).expect("send");

        let got = b.poll_rx(8);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].data, b"one");
        assert_eq!(got[1].data, b"two");
        assert_eq!(got[0].dgid, b.local_gids()[0]);
    }

    #[test]
    fn test_sim_signaled_completions_only() {
        let net = SimNet::new();
        let mut a = net.attach();
        let b = net.attach();
        a.create_qp(16, 16).expect("qp");

        let dest = addr_of(&b);
        a.post_send(&dest, &[&b"x"[..]], false, 1).expect("send");
        a.post_send(&dest, &[&b"y"[..]], true, 2).expect("send");
        let comps = a.poll_tx();
        assert_eq!(comps, vec![TxCompletion { sn: 2 }]);
    }

    #[test]
    fn test_sim_unordered_signals_everything() {
        let net = SimNet::new();
        let mut a = net.attach();
        let b = net.attach();
        a.set_unordered_comp();
        a.create_qp(16, 16).expect("qp");
        let dest = addr_of(&b);
        a.post_send(&dest, &[&b"x"[..]], false, 3).expect("send");
        assert_eq!(a.poll_tx(), vec![TxCompletion { sn: 3 }]);
    }

    #[test]
    fn test_sim_drop_hook_still_completes() {
        let net = SimNet::new();
        let mut a = net.attach();
        let mut b = net.attach();
        a.create_qp(16, 16).expect("qp");
        b.create_qp(16, 16).expect("qp");
        a.set_drop_hook(Box::new(|_| true));

        let dest = addr_of(&b);
        a.post_send(&dest, &[&b"lost"[..]], true, 7).expect("send");
        assert!(b.poll_rx(8).is_empty());
        assert_eq!(a.poll_tx(), vec![TxCompletion { sn: 7 }]);
    }

    #[test]
    fn test_sim_fatal_injection_consumed_once() {
        let net = SimNet::new();
        let mut a = net.attach();
        let inj = a.fatal_injector();
        assert!(a.poll_fatal().is_none());

        inj.inject(crate::Error::NoDevice("port down".into()));
        assert!(matches!(a.poll_fatal(), Some(crate::Error::NoDevice(_))));
        // Consumed: no replay on the next poll.
        assert!(a.poll_fatal().is_none());
    }

    #[test]
    fn test_sim_poll_rx_bounded() {
        let net = SimNet::new();
        let mut a = net.attach();
        let mut b = net.attach();
        a.create_qp(16, 16).expect("qp");
        b.create_qp(16, 16).expect("qp");
        let dest = addr_of(&b);
        for i in 0..5u16 {
            a.post_send(&dest, &[&i.to_be_bytes()[..]], false, i).expect("send");
        }
        assert_eq!(b.poll_rx(3).len(), 3);
        assert_eq!(b.poll_rx(3).len(), 2);
    }
}
