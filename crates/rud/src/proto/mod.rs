// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire format: the per-packet network header and control sub-headers.
//!
//! Every datagram carries, after the fabric's GRH, an 8-byte header. All
//! multi-byte integers are big-endian.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |              destination EP-ID                |A|P|C| AM-id   |
//! +---------------+---------------+---------------+---------------+
//! |              PSN              |       piggy-back ACK-PSN      |
//! +-------------------------------+-------------------------------+
//! |  payload (AM data) / control sub-header / PUT sub-header ...  |
//! ```
//!
//! Flag bits: `A` = ACK-REQ (bit 0), `P` = PUT (bit 1), `C` = CTL (bit 2),
//! bits 3-7 carry the active-message id.
//!
//! When `C` is set, a 1-byte subtype follows the header:
//! CREQ=1, CREP=2, NAK=3, RESEND_START=4. When `P` is set, an 8-byte remote
//! virtual address follows, then the payload.
//!
//! A packet with `C` and `P` clear and no payload at all is a **bare
//! acknowledgment**: only its ACK-PSN (and ACK-REQ bit) are processed and it
//! consumes no PSN. Active messages therefore always carry at least one
//! payload byte.

use crate::conn_match::ConnSn;
use crate::core::psn::Psn;
use crate::core::{EpId, EP_NULL_ID};

/// Network header length.
pub const NETH_LEN: usize = 8;
/// PUT sub-header length (remote virtual address).
pub const PUT_HDR_LEN: usize = 8;

/// Request an explicit acknowledgment from the receiver.
pub const FLAG_ACK_REQ: u8 = 0x01;
/// PUT sub-header follows the network header.
pub const FLAG_PUT: u8 = 0x02;
/// Control sub-header follows the network header.
pub const FLAG_CTL: u8 = 0x04;

const AM_ID_SHIFT: u8 = 3;
/// Active-message ids occupy 5 bits.
pub const AM_ID_MAX: u8 = 31;

/// Control sub-header subtypes.
pub const CTL_CREQ: u8 = 1;
pub const CTL_CREP: u8 = 2;
pub const CTL_NAK: u8 = 3;
pub const CTL_RESEND_START: u8 = 4;

/// Decoded network header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Neth {
    pub dest_ep: EpId,
    pub am_id: u8,
    pub ack_req: bool,
    pub is_put: bool,
    pub is_ctl: bool,
    pub psn: Psn,
    pub ack_psn: Psn,
}

impl Neth {
    pub fn am(dest_ep: EpId, am_id: u8, psn: Psn, ack_psn: Psn) -> Self {
        Self {
            dest_ep,
            am_id,
            ack_req: false,
            is_put: false,
            is_ctl: false,
            psn,
            ack_psn,
        }
    }

    pub fn ctl(dest_ep: EpId, psn: Psn, ack_psn: Psn) -> Self {
        Self {
            dest_ep,
            am_id: 0,
            ack_req: false,
            is_put: false,
            is_ctl: true,
            psn,
            ack_psn,
        }
    }

    /// Bare acknowledgment header (header-only packet, CTL/PUT clear).
    pub fn ack(dest_ep: EpId, psn: Psn, ack_psn: Psn) -> Self {
        Self {
            dest_ep,
            am_id: 0,
            ack_req: false,
            is_put: false,
            is_ctl: false,
            psn,
            ack_psn,
        }
    }
}

/// Encode the header into `buf[..NETH_LEN]`.
pub fn encode_neth(neth: &Neth, buf: &mut [u8]) {
    debug_assert!(buf.len() >= NETH_LEN);
    debug_assert!(neth.dest_ep <= EP_NULL_ID);
    debug_assert!(neth.am_id <= AM_ID_MAX);

    let id = neth.dest_ep.to_be_bytes();
    buf[0] = id[1];
    buf[1] = id[2];
    buf[2] = id[3];

    let mut flags = neth.am_id << AM_ID_SHIFT;
    if neth.ack_req {
        flags |= FLAG_ACK_REQ;
    }
    if neth.is_put {
        flags |= FLAG_PUT;
    }
    if neth.is_ctl {
        flags |= FLAG_CTL;
    }
    buf[3] = flags;

    buf[4..6].copy_from_slice(&neth.psn.to_be_bytes());
    buf[6..8].copy_from_slice(&neth.ack_psn.to_be_bytes());
}

/// Decode a header; `None` if the slice is too short.
pub fn decode_neth(buf: &[u8]) -> Option<Neth> {
    if buf.len() < NETH_LEN {
        return None;
    }
    let dest_ep = u32::from_be_bytes([0, buf[0], buf[1], buf[2]]);
    let flags = buf[3];
    Some(Neth {
        dest_ep,
        am_id: flags >> AM_ID_SHIFT,
        ack_req: (flags & FLAG_ACK_REQ) != 0,
        is_put: (flags & FLAG_PUT) != 0,
        is_ctl: (flags & FLAG_CTL) != 0,
        psn: u16::from_be_bytes([buf[4], buf[5]]),
        ack_psn: u16::from_be_bytes([buf[6], buf[7]]),
    })
}

/// Overwrite the piggy-back ACK-PSN of an already-encoded packet.
///
/// Retransmission shadows replay the original bytes but refresh this field.
pub fn patch_ack_psn(buf: &mut [u8], ack_psn: Psn) {
    debug_assert!(buf.len() >= NETH_LEN);
    buf[6..8].copy_from_slice(&ack_psn.to_be_bytes());
}

/// Decoded control sub-header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CtlMsg {
    /// Connection request. `peer_addr` is the sender's opaque address blob
    /// of the transport-defined length.
    Creq {
        src_ep: EpId,
        conn_sn: ConnSn,
        path_index: u8,
        peer_addr: Vec<u8>,
    },
    /// Connection reply carrying the responder's endpoint id.
    Crep { src_ep: EpId },
    /// Receiver-side retransmit request: the PSN it expects next.
    Nak { expected: Psn },
    /// Sender is about to replay its window starting at this PSN.
    ResendStart { from: Psn },
}

/// Encode a control sub-header (subtype byte + body), appending to `out`.
pub fn encode_ctl(msg: &CtlMsg, out: &mut Vec<u8>) {
    match msg {
        CtlMsg::Creq {
            src_ep,
            conn_sn,
            path_index,
            peer_addr,
        } => {
            out.push(CTL_CREQ);
            let id = src_ep.to_be_bytes();
            out.extend_from_slice(&id[1..4]);
            out.extend_from_slice(&conn_sn.to_be_bytes());
            out.push(*path_index);
            out.extend_from_slice(peer_addr);
        }
        CtlMsg::Crep { src_ep } => {
            out.push(CTL_CREP);
            let id = src_ep.to_be_bytes();
            out.extend_from_slice(&id[1..4]);
        }
        CtlMsg::Nak { expected } => {
            out.push(CTL_NAK);
            out.extend_from_slice(&expected.to_be_bytes());
        }
        CtlMsg::ResendStart { from } => {
            out.push(CTL_RESEND_START);
            out.extend_from_slice(&from.to_be_bytes());
        }
    }
}

/// Decode a control sub-header. `addr_len` is the transport's peer-address
/// blob length (needed to bound the CREQ body).
pub fn decode_ctl(buf: &[u8], addr_len: usize) -> Option<CtlMsg> {
    let (&subtype, body) = buf.split_first()?;
    match subtype {
        CTL_CREQ => {
            if body.len() < 3 + 4 + 1 + addr_len {
                return None;
            }
            let src_ep = u32::from_be_bytes([0, body[0], body[1], body[2]]);
            let conn_sn = u32::from_be_bytes([body[3], body[4], body[5], body[6]]);
            let path_index = body[7];
            let peer_addr = body[8..8 + addr_len].to_vec();
            Some(CtlMsg::Creq {
                src_ep,
                conn_sn,
                path_index,
                peer_addr,
            })
        }
        CTL_CREP => {
            if body.len() < 3 {
                return None;
            }
            Some(CtlMsg::Crep {
                src_ep: u32::from_be_bytes([0, body[0], body[1], body[2]]),
            })
        }
        CTL_NAK => {
            if body.len() < 2 {
                return None;
            }
            Some(CtlMsg::Nak {
                expected: u16::from_be_bytes([body[0], body[1]]),
            })
        }
        CTL_RESEND_START => {
            if body.len() < 2 {
                return None;
            }
            Some(CtlMsg::ResendStart {
                from: u16::from_be_bytes([body[0], body[1]]),
            })
        }
        _ => None,
    }
}

/// Encode the PUT sub-header (remote virtual address).
pub fn encode_put_hdr(rva: u64, buf: &mut [u8]) {
    debug_assert!(buf.len() >= PUT_HDR_LEN);
    buf[..PUT_HDR_LEN].copy_from_slice(&rva.to_be_bytes());
}

/// Decode the PUT sub-header.
pub fn decode_put_hdr(buf: &[u8]) -> Option<u64> {
    if buf.len() < PUT_HDR_LEN {
        return None;
    }
    Some(u64::from_be_bytes([
        buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_neth_roundtrip() {
        let neth = Neth {
            dest_ep: 0x01_02_03,
            am_id: 17,
            ack_req: true,
            is_put: false,
            is_ctl: false,
            psn: 0xBEEF,
            ack_psn: 0xCAFE,
        };
        let mut buf = [0u8; NETH_LEN];
        encode_neth(&neth, &mut buf);
        assert_eq!(decode_neth(&buf), Some(neth));
    }

    #[test]
    fn test_neth_byte_layout() {
        let neth = Neth {
            dest_ep: 0x00_00_07,
            am_id: 1,
            ack_req: true,
            is_put: false,
            is_ctl: true,
            psn: 0x0102,
            ack_psn: 0x0304,
        };
        let mut buf = [0u8; NETH_LEN];
        encode_neth(&neth, &mut buf);
        // 3-byte big-endian EP-ID.
        assert_eq!(&buf[0..3], &[0x00, 0x00, 0x07]);
        // Flags: am_id=1 << 3 | CTL | ACK_REQ.
        assert_eq!(buf[3], 0x08 | 0x04 | 0x01);
        assert_eq!(&buf[4..6], &[0x01, 0x02]);
        assert_eq!(&buf[6..8], &[0x03, 0x04]);
    }

    #[test]
    fn test_neth_null_dest() {
        let mut buf = [0u8; NETH_LEN];
        encode_neth(&Neth::ctl(EP_NULL_ID, 1, 0), &mut buf);
        assert_eq!(&buf[0..3], &[0xFF, 0xFF, 0xFF]);
        assert_eq!(decode_neth(&buf).map(|n| n.dest_ep), Some(EP_NULL_ID));
    }

    #[test]
    fn test_neth_short_buffer_rejected() {
        assert!(decode_neth(&[0u8; 7]).is_none());
    }

    #[test]
    fn test_patch_ack_psn() {
        let mut buf = [0u8; NETH_LEN];
        encode_neth(&Neth::am(1, 0, 10, 5), &mut buf);
        patch_ack_psn(&mut buf, 9);
        assert_eq!(decode_neth(&buf).map(|n| n.ack_psn), Some(9));
    }

    #[test]
    fn test_ctl_creq_roundtrip() {
        let msg = CtlMsg::Creq {
            src_ep: 0x00_10_20,
            conn_sn: 0xDEAD_BEEF,
            path_index: 2,
            peer_addr: vec![1, 2, 3, 4],
        };
        let mut out = Vec::new();
        encode_ctl(&msg, &mut out);
        assert_eq!(out[0], CTL_CREQ);
        assert_eq!(decode_ctl(&out, 4), Some(msg));
    }

    #[test]
    fn test_ctl_creq_truncated_rejected() {
        let msg = CtlMsg::Creq {
            src_ep: 1,
            conn_sn: 7,
            path_index: 0,
            peer_addr: vec![9; 8],
        };
        let mut out = Vec::new();
        encode_ctl(&msg, &mut out);
        out.truncate(out.len() - 1);
        assert!(decode_ctl(&out, 8).is_none());
    }

    #[test]
    fn test_ctl_crep_nak_resend_roundtrip() {
        for msg in [
            CtlMsg::Crep { src_ep: 0x00_00_2A },
            CtlMsg::Nak { expected: 0xFFF1 },
            CtlMsg::ResendStart { from: 3 },
        ] {
            let mut out = Vec::new();
            encode_ctl(&msg, &mut out);
            assert_eq!(decode_ctl(&out, 0), Some(msg));
        }
    }

    #[test]
    fn test_ctl_unknown_subtype_rejected() {
        assert!(decode_ctl(&[0x7F, 0, 0], 0).is_none());
    }

    #[test]
    fn test_put_hdr_roundtrip() {
        let mut buf = [0u8; PUT_HDR_LEN];
        encode_put_hdr(0x1122_3344_5566_7788, &mut buf);
        assert_eq!(buf, [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]);
        assert_eq!(decode_put_hdr(&buf), Some(0x1122_3344_5566_7788));
    }
}
