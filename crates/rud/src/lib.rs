// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # RUD - Reliable Unreliable-Datagram transport
//!
//! A reliability layer over an Unreliable Datagram (UD) RDMA-style fabric:
//! the fabric delivers datagrams with no ordering, no acknowledgment and no
//! guaranteed delivery; this crate turns that substrate into a
//! connection-oriented, reliable, in-order stream abstraction with flow and
//! congestion control, suitable as the footing for a higher-level messaging
//! API.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rud::{Iface, IfaceConfig, SimNet, PROGRESS_RECV, PROGRESS_SEND};
//!
//! fn main() -> rud::Result<()> {
//!     let net = SimNet::new();
//!     let a = Iface::new(Box::new(net.attach()), IfaceConfig::default())?;
//!     let b = Iface::new(Box::new(net.attach()), IfaceConfig::default())?;
//!
//!     b.set_am_handler(7, |payload| println!("got {} bytes", payload.len()))?;
//!     b.progress_enable(PROGRESS_SEND | PROGRESS_RECV);
//!
//!     let ep = a.create_ep(&b.address(), 0)?;
//!     ep.am_short(7, b"hello")?;
//!     loop {
//!         a.progress();
//!         b.progress();
//!     }
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                        Messaging API (user)                        |
//! |        am_short / am_bcopy / am_zcopy / put_short / flush          |
//! +--------------------------------------------------------------------+
//! |  Endpoint (per peer)                                               |
//! |  PSN windows | unack list | retransmit | AIMD cwnd | CREQ/CREP    |
//! +--------------------------------------------------------------------+
//! |  Interface (shared)                                                |
//! |  skb pools | timer wheel | outstanding index | pending arbiter    |
//! |  async deferral queues | connection-match registry | counters     |
//! +--------------------------------------------------------------------+
//! |  Fabric adapter                                                    |
//! |  post_send / poll_tx / poll_rx   (sim hub, UDP emulation, ...)    |
//! +--------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Iface`] | The shared datagram resource; factory for endpoints |
//! | [`Endpoint`] | Reliable, in-order channel to one remote endpoint |
//! | [`IfaceConfig`] | Timeouts, window bounds, queue depths |
//! | [`Fabric`] | Adapter trait over the datagram substrate |
//! | [`SimNet`] | In-process fabric hub for tests and tools |
//!
//! Delivery is ordered per endpoint pair only; there is no ordering across
//! endpoints. Payloads never exceed the path MTU minus headers.

/// Interface configuration and protocol constants.
pub mod config;
/// Connection-match registry: symmetric connection establishment.
pub mod conn_match;
/// Sequence arithmetic, skb descriptors, pools, endpoint table.
pub mod core;
/// Per-peer reliability state machine.
pub mod ep;
/// Fabric adapters (trait, in-process hub, UDP emulation).
pub mod fabric;
mod fork;
/// The interface container: progress, timers, arbitration, observability.
pub mod iface;
/// Wire format.
pub mod proto;

pub use config::IfaceConfig;
pub use fabric::sim::{FatalInjector, SimFabric, SimNet};
pub use self::core::skb::SendCompletion;
pub use self::core::EpId;
pub use fabric::udp::UdpFabric;
pub use fabric::{Fabric, Gid};
pub use iface::stats::{EpInfo, IfaceStats};
pub use iface::{Endpoint, Iface, PROGRESS_RECV, PROGRESS_SEND};

/// Result of a flush: either everything issued so far is acknowledged, or a
/// later progress tick will get there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushState {
    Done,
    InProgress,
}

/// Errors returned by RUD operations.
///
/// Transient resource exhaustion ([`Error::NoResource`]) is the signal to
/// defer through the pending arbiter; peer-fatal conditions surface both as
/// operation completions and through the interface error callback.
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Transient
    // ========================================================================
    /// Send window closed or pools exhausted; retry after progress or park
    /// the message in the pending arbiter.
    NoResource,

    // ========================================================================
    // Caller errors
    // ========================================================================
    /// Malformed configuration or API misuse.
    InvalidParam(String),
    /// Feature not supported by this fabric.
    Unsupported,

    // ========================================================================
    // Device errors
    // ========================================================================
    /// Device disappeared or was never there.
    NoDevice(String),
    /// Port not active / peer not reachable at open.
    Unreachable(String),

    // ========================================================================
    // Runtime failures
    // ========================================================================
    /// No acknowledgment within the peer timeout; the endpoint is failed.
    EndpointTimeout,
    /// Unexpected fabric failure.
    Io(std::io::Error),
    /// Interface torn down (or forked away) while the operation was in
    /// flight.
    Canceled,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::NoResource => write!(f, "no resource"),
            Error::InvalidParam(msg) => write!(f, "invalid parameter: {}", msg),
            Error::Unsupported => write!(f, "unsupported operation"),
            Error::NoDevice(msg) => write!(f, "no device: {}", msg),
            Error::Unreachable(msg) => write!(f, "unreachable: {}", msg),
            Error::EndpointTimeout => write!(f, "endpoint timed out"),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Canceled => write!(f, "canceled"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
