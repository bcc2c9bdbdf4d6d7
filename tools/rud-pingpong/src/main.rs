// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! rud-pingpong - round-trip latency probe for the RUD reliability layer.
//!
//! Runs two interfaces over a loopback fabric (in-process hub or UDP) and
//! measures ping-pong round-trip times through the full reliability path:
//! window admission, PSN stamping, acknowledgment, delivery.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use rud::{Endpoint, Iface, IfaceConfig, SimNet, UdpFabric};

const AM_PING: u8 = 1;
const AM_PONG: u8 = 2;

/// RUD round-trip latency probe
#[derive(Parser, Debug)]
#[command(name = "rud-pingpong")]
#[command(about = "Measure RUD round-trip latency over a loopback pair")]
struct Args {
    /// Payload size in bytes
    #[arg(short = 's', long, default_value = "64")]
    size: usize,

    /// Number of measured round trips
    #[arg(short = 'n', long, default_value = "10000")]
    count: u64,

    /// Warmup round trips before measurement
    #[arg(short, long, default_value = "100")]
    warmup: u64,

    /// Use the UDP fabric emulation on 127.0.0.1 instead of the in-process
    /// hub
    #[arg(long)]
    udp: bool,
}

fn connect(a: &Iface, b: &Iface) -> Endpoint {
    let ep = a.create_ep(&b.address(), 0).expect("create endpoint");
    let id = ep.id();
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        a.progress();
        b.progress();
        if a.ep_info(id).map(|i| i.state == "connected").unwrap_or(false) {
            return ep;
        }
    }
    panic!("handshake did not complete");
}

fn send_blocking(a: &Iface, b: &Iface, ep: &Endpoint, am_id: u8, data: &[u8]) {
    loop {
        match ep.am_short(am_id, data) {
            Ok(()) => return,
            Err(rud::Error::NoResource) => {
                a.progress();
                b.progress();
            }
            Err(e) => panic!("send failed: {}", e),
        }
    }
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    assert!(args.size >= 1, "payload must be at least one byte");

    let (a, b) = if args.udp {
        let bind = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0);
        let fa = UdpFabric::new(bind).expect("bind a");
        let fb = UdpFabric::new(bind).expect("bind b");
        (
            Iface::new(Box::new(fa), IfaceConfig::default()).expect("iface a"),
            Iface::new(Box::new(fb), IfaceConfig::default()).expect("iface b"),
        )
    } else {
        let net = SimNet::new();
        (
            Iface::new(Box::new(net.attach()), IfaceConfig::default()).expect("iface a"),
            Iface::new(Box::new(net.attach()), IfaceConfig::default()).expect("iface b"),
        )
    };

    // Pong side: echo every ping back on its own endpoint.
    let pings = Arc::new(AtomicU64::new(0));
    let pongs = Arc::new(AtomicU64::new(0));
    {
        let pings = Arc::clone(&pings);
        b.set_am_handler(AM_PING, move |_| {
            pings.fetch_add(1, Ordering::Relaxed);
        })
        .expect("ping handler");
        let pongs = Arc::clone(&pongs);
        a.set_am_handler(AM_PONG, move |_| {
            pongs.fetch_add(1, Ordering::Relaxed);
        })
        .expect("pong handler");
    }

    let ep_ab = connect(&a, &b);
    let ep_ba = connect(&b, &a);

    let payload = vec![0u8; args.size];
    let mut samples = Vec::with_capacity(args.count as usize);

    for i in 0..args.warmup + args.count {
        let t0 = Instant::now();
        let seen_pings = pings.load(Ordering::Relaxed);
        send_blocking(&a, &b, &ep_ab, AM_PING, &payload);
        while pings.load(Ordering::Relaxed) == seen_pings {
            a.progress();
            b.progress();
        }
        let seen_pongs = pongs.load(Ordering::Relaxed);
        send_blocking(&b, &a, &ep_ba, AM_PONG, &payload);
        while pongs.load(Ordering::Relaxed) == seen_pongs {
            a.progress();
            b.progress();
        }
        if i >= args.warmup {
            samples.push(t0.elapsed());
        }
    }

    samples.sort_unstable();
    let total: Duration = samples.iter().sum();
    let pct = |p: f64| samples[((samples.len() - 1) as f64 * p) as usize];
    println!(
        "rud-pingpong: {} round trips, {} byte payload ({})",
        args.count,
        args.size,
        if args.udp { "udp" } else { "sim" }
    );
    println!("  mean: {:>10.2?}", total / samples.len() as u32);
    println!("  p50:  {:>10.2?}", pct(0.50));
    println!("  p99:  {:>10.2?}", pct(0.99));
    println!("  max:  {:>10.2?}", samples[samples.len() - 1]);

    let stats = a.stats();
    println!(
        "  tx_packets={} retransmits={} acks={} rx_drop={}",
        stats.tx_packets, stats.retransmits, stats.acks_sent, stats.rx_drop
    );
}
