// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UD emulation over a UDP socket.
//!
//! Each datagram is prefixed with a 40-byte pseudo-GRH laid out like the
//! in-band header of an Ethernet fabric: 8 reserved bytes, then the source
//! GID, then the destination GID in the last 16 bytes. Peer addresses are
//! 22-byte blobs: IPv4 (4) + port (2) + GID (16).

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};

use super::{Fabric, Gid, RecvDatagram, TxCompletion};

/// Pseudo-GRH length, matching the 40-byte reserved area of UD receive
/// buffers on real fabrics.
pub const GRH_LEN: usize = 40;
/// Packed address blob length: IPv4 + port + GID.
pub const UDP_ADDR_LEN: usize = 4 + 2 + 16;

const SGID_OFF: usize = 8;
const DGID_OFF: usize = 24;

/// UDP-backed fabric adapter.
pub struct UdpFabric {
    socket: Option<UdpSocket>,
    bind_addr: SocketAddrV4,
    local_ip: Ipv4Addr,
    port: u16,
    gid: Gid,
    comps: Vec<TxCompletion>,
    mtu: usize,
    /// First hard socket failure seen on the receive path; reported once
    /// through `poll_fatal`.
    fatal: Option<io::Error>,
}

impl UdpFabric {
    /// Bind to `addr`. Port 0 picks an ephemeral port; the resolved port is
    /// part of the packed address.
    pub fn new(addr: SocketAddrV4) -> crate::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(crate::Error::Io)?;
        socket.set_reuse_address(true).map_err(crate::Error::Io)?;
        socket.set_nonblocking(true).map_err(crate::Error::Io)?;
        socket
            .bind(&SocketAddr::V4(addr).into())
            .map_err(crate::Error::Io)?;

        let socket: UdpSocket = socket.into();
        let local = match socket.local_addr().map_err(crate::Error::Io)? {
            SocketAddr::V4(v4) => v4,
            SocketAddr::V6(_) => {
                return Err(crate::Error::Unsupported);
            }
        };
        let local_ip = if local.ip().is_unspecified() {
            Ipv4Addr::LOCALHOST
        } else {
            *local.ip()
        };
        let gid = Gid::from_ipv4(local_ip.octets());
        log::debug!(
            "[udp-fabric] bound addr={} port={} gid=::ffff:{}",
            local,
            local.port(),
            local_ip
        );

        Ok(Self {
            socket: Some(socket),
            bind_addr: local,
            local_ip,
            port: local.port(),
            gid,
            comps: Vec::new(),
            mtu: 4096,
            fatal: None,
        })
    }

    pub fn bind_addr(&self) -> SocketAddrV4 {
        self.bind_addr
    }

    fn unpack_dest(dest: &[u8]) -> crate::Result<(SocketAddrV4, Gid)> {
        if dest.len() != UDP_ADDR_LEN {
            return Err(crate::Error::InvalidParam("bad udp address blob".into()));
        }
        let ip = Ipv4Addr::new(dest[0], dest[1], dest[2], dest[3]);
        let port = u16::from_be_bytes([dest[4], dest[5]]);
        let mut raw = [0u8; 16];
        raw.copy_from_slice(&dest[6..22]);
        Ok((SocketAddrV4::new(ip, port), Gid(raw)))
    }
}

impl Fabric for UdpFabric {
    fn create_qp(&mut self, _tx_qp_len: u16, _rx_qp_len: u16) -> crate::Result<()> {
        if self.socket.is_none() {
            return Err(crate::Error::NoDevice("socket closed".into()));
        }
        Ok(())
    }

    fn destroy_qp(&mut self) {
        self.socket = None;
    }

    fn ordered_send_comp(&self) -> bool {
        true
    }

    fn addr_len(&self) -> usize {
        UDP_ADDR_LEN
    }

    fn local_addr(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.local_ip.octets());
        buf[4..6].copy_from_slice(&self.port.to_be_bytes());
        buf[6..22].copy_from_slice(&self.gid.0);
    }

    fn local_gids(&self) -> Vec<Gid> {
        vec![self.gid]
    }

    fn is_roce(&self) -> bool {
        true
    }

    fn max_payload(&self) -> usize {
        self.mtu - GRH_LEN
    }

    fn post_send(
        &mut self,
        dest: &[u8],
        frames: &[&[u8]],
        signaled: bool,
        sn: u16,
    ) -> crate::Result<()> {
        let Some(socket) = self.socket.as_ref() else {
            return Err(crate::Error::Canceled);
        };
        let (addr, dgid) = Self::unpack_dest(dest)?;

        let body_len: usize = frames.iter().map(|f| f.len()).sum();
        let mut packet = vec![0u8; GRH_LEN];
        packet.reserve(body_len);
        packet[SGID_OFF..SGID_OFF + 16].copy_from_slice(&self.gid.0);
        packet[DGID_OFF..DGID_OFF + 16].copy_from_slice(&dgid.0);
        for f in frames {
            packet.extend_from_slice(f);
        }

        match socket.send_to(&packet, SocketAddr::V4(addr)) {
            Ok(_) => {}
            // An unreliable fabric loses datagrams; a transient send failure
            // is the same thing from the protocol's point of view.
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                log::warn!("[udp-fabric] send_to {} failed: {}", addr, e);
            }
        }
        if signaled {
            self.comps.push(TxCompletion { sn });
        }
        Ok(())
    }

    fn poll_tx(&mut self) -> Vec<TxCompletion> {
        std::mem::take(&mut self.comps)
    }

    fn poll_rx(&mut self, max: usize) -> Vec<RecvDatagram> {
        let Some(socket) = self.socket.as_ref() else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let mut buf = vec![0u8; self.mtu];
        while out.len() < max {
            match socket.recv_from(&mut buf) {
                Ok((len, _src)) if len >= GRH_LEN => {
                    let mut raw = [0u8; 16];
                    raw.copy_from_slice(&buf[DGID_OFF..DGID_OFF + 16]);
                    out.push(RecvDatagram {
                        dgid: Gid(raw),
                        data: buf[GRH_LEN..len].to_vec(),
                    });
                }
                Ok(_) => {} // runt datagram, ignore
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                // Reflected ICMP from an earlier send; not a device failure.
                Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {}
                Err(e) => {
                    log::warn!("[udp-fabric] recv failed: {}", e);
                    if self.fatal.is_none() {
                        self.fatal = Some(e);
                    }
                    break;
                }
            }
        }
        out
    }

    fn poll_fatal(&mut self) -> Option<crate::Error> {
        self.fatal.take().map(crate::Error::Io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)
    }

    #[test]
    fn test_udp_addr_blob_roundtrip() {
        let fab = UdpFabric::new(loopback()).expect("bind");
        let mut blob = vec![0u8; UDP_ADDR_LEN];
        fab.local_addr(&mut blob);
        let (addr, gid) = UdpFabric::unpack_dest(&blob).expect("unpack");
        assert_eq!(addr.port(), fab.bind_addr().port());
        assert_eq!(gid, fab.local_gids()[0]);
    }

    #[test]
    fn test_udp_send_recv_with_grh() {
        let mut a = UdpFabric::new(loopback()).expect("bind a");
        let mut b = UdpFabric::new(loopback()).expect("bind b");
        a.create_qp(16, 16).expect("qp");
        b.create_qp(16, 16).expect("qp");

        let mut dest = vec![0u8; UDP_ADDR_LEN];
        b.local_addr(&mut dest);
        a.post_send(&dest, &[&b"he"[..], &b"llo"[..]], true, 5).expect("send");

        // Give the loopback a moment.
        let mut got = Vec::new();
        for _ in 0..50 {
            got = b.poll_rx(4);
            if !got.is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].data, b"hello");
        assert_eq!(got[0].dgid, b.local_gids()[0]);
        assert_eq!(a.poll_tx(), vec![TxCompletion { sn: 5 }]);
    }

    #[test]
    fn test_udp_destroy_qp_stops_io() {
        let mut a = UdpFabric::new(loopback()).expect("bind");
        a.create_qp(16, 16).expect("qp");
        a.destroy_qp();
        assert!(matches!(
            a.post_send(&[0u8; UDP_ADDR_LEN], &[&b"x"[..]], false, 0),
            Err(crate::Error::Canceled)
        ));
        assert!(a.poll_rx(1).is_empty());
    }
}
