// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Peer-failure detection: timeout transition, error reporting, completion
//! status, and post-failure behavior.

#![allow(clippy::uninlined_format_args)] // Test/bench code readability over pedantic
#![allow(clippy::missing_panics_doc)] // Tests panic on failure

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rud::{Endpoint, Iface, IfaceConfig, SimNet};

fn test_cfg() -> IfaceConfig {
    IfaceConfig {
        timer_tick: Duration::from_millis(2),
        min_poke_time: Duration::from_millis(5),
        peer_timeout: Duration::from_millis(120),
        async_timer_tick: Duration::from_millis(5),
        ..Default::default()
    }
}

fn progress_until(a: &Iface, b: &Iface, ms: u64, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_millis(ms);
    loop {
        a.progress();
        b.progress();
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn connect(a: &Iface, b: &Iface) -> Endpoint {
    let ep = a.create_ep(&b.address(), 0).expect("create ep");
    let id = ep.id();
    assert!(progress_until(a, b, 2000, || {
        a.ep_info(id).map(|i| i.state == "connected").unwrap_or(false)
    }));
    ep
}

/// Exchange a few acknowledged messages so the congestion window grows.
fn warm_up(a: &Iface, b: &Iface, ep: &Endpoint, n: u8) {
    let count = Arc::new(AtomicU64::new(0));
    let sink = Arc::clone(&count);
    b.set_am_handler(30, move |_| {
        sink.fetch_add(1, Ordering::SeqCst);
    })
    .expect("handler");
    for _ in 0..n {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match ep.am_short(30, &[0]) {
                Ok(()) => break,
                Err(rud::Error::NoResource) => {
                    assert!(Instant::now() < deadline);
                    a.progress();
                    b.progress();
                }
                Err(e) => panic!("warmup send failed: {}", e),
            }
        }
    }
    assert!(progress_until(a, b, 2000, || {
        count.load(Ordering::SeqCst) == u64::from(n)
    }));
}

#[test]
fn test_peer_death_times_out_endpoint() {
    let net = SimNet::new();
    let blackhole = Arc::new(AtomicBool::new(false));
    let hole = Arc::clone(&blackhole);
    let mut fab_a = net.attach();
    fab_a.set_drop_hook(Box::new(move |_| hole.load(Ordering::SeqCst)));

    let a = Iface::new(Box::new(fab_a), test_cfg()).expect("iface a");
    let b = Iface::new(Box::new(net.attach()), test_cfg()).expect("iface b");

    let err_calls = Arc::new(AtomicU64::new(0));
    let errs = Arc::clone(&err_calls);
    a.set_error_handler(move |_ep, err| {
        assert!(matches!(err, rud::Error::EndpointTimeout));
        errs.fetch_add(1, Ordering::SeqCst);
    });

    let ep = connect(&a, &b);
    warm_up(&a, &b, &ep, 8);

    // The peer goes dark: everything A sends now vanishes on the wire.
    blackhole.store(true, Ordering::SeqCst);

    let timeouts = Arc::new(AtomicU64::new(0));
    for _ in 0..3 {
        let t = Arc::clone(&timeouts);
        ep.am_bcopy(
            30,
            |buf| {
                buf[0] = 0xEE;
                1
            },
            Some(Box::new(move |status| {
                assert!(matches!(status, Err(rud::Error::EndpointTimeout)));
                t.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .expect("send into the void");
    }

    // Only A makes progress; B never answers.
    let deadline = Instant::now() + Duration::from_secs(3);
    while timeouts.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
        a.progress();
        std::thread::sleep(Duration::from_millis(1));
    }

    assert_eq!(timeouts.load(Ordering::SeqCst), 3, "completions must fail");
    assert_eq!(
        err_calls.load(Ordering::SeqCst),
        1,
        "error callback fires exactly once"
    );
    assert_eq!(
        a.ep_info(ep.id()).expect("info").state,
        "failed",
        "endpoint must transition to failed"
    );
    assert_eq!(a.stats().ep_timeouts, 1);
}

#[test]
fn test_failed_endpoint_rejects_sends_and_flush() {
    let net = SimNet::new();
    let blackhole = Arc::new(AtomicBool::new(false));
    let hole = Arc::clone(&blackhole);
    let mut fab_a = net.attach();
    fab_a.set_drop_hook(Box::new(move |_| hole.load(Ordering::SeqCst)));

    let a = Iface::new(Box::new(fab_a), test_cfg()).expect("iface a");
    let b = Iface::new(Box::new(net.attach()), test_cfg()).expect("iface b");

    let ep = connect(&a, &b);
    warm_up(&a, &b, &ep, 4);
    blackhole.store(true, Ordering::SeqCst);
    ep.am_short(30, &[1]).expect("send into the void");

    let id = ep.id();
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        a.progress();
        if a.ep_info(id).map(|i| i.state == "failed").unwrap_or(false) {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }

    assert!(matches!(
        ep.am_short(30, &[2]),
        Err(rud::Error::EndpointTimeout)
    ));
    assert!(matches!(ep.flush(), Err(rud::Error::EndpointTimeout)));
}

#[test]
fn test_idle_endpoint_does_not_time_out() {
    let net = SimNet::new();
    let a = Iface::new(Box::new(net.attach()), test_cfg()).expect("iface a");
    let b = Iface::new(Box::new(net.attach()), test_cfg()).expect("iface b");

    let ep = connect(&a, &b);
    warm_up(&a, &b, &ep, 2);

    // Nothing in flight: sit well past the peer timeout.
    std::thread::sleep(Duration::from_millis(300));
    a.progress();
    b.progress();
    assert_eq!(a.ep_info(ep.id()).expect("info").state, "connected");
    assert_eq!(a.stats().ep_timeouts, 0);
}

#[test]
fn test_device_fatal_fails_all_endpoints_atomically() {
    let net = SimNet::new();
    let fab_a = net.attach();
    let fatal = fab_a.fatal_injector();

    let a = Iface::new(Box::new(fab_a), test_cfg()).expect("iface a");
    let b = Iface::new(Box::new(net.attach()), test_cfg()).expect("iface b");
    let c = Iface::new(Box::new(net.attach()), test_cfg()).expect("iface c");

    let err_calls = Arc::new(AtomicU64::new(0));
    let errs = Arc::clone(&err_calls);
    a.set_error_handler(move |_ep, err| {
        assert!(matches!(err, rud::Error::Io(_)));
        errs.fetch_add(1, Ordering::SeqCst);
    });

    // Two endpoints on the failing device.
    let ep_ab = connect(&a, &b);
    let ep_ac = {
        let ep = a.create_ep(&c.address(), 0).expect("create ep");
        let id = ep.id();
        assert!(progress_until(&a, &c, 2000, || {
            a.ep_info(id).map(|i| i.state == "connected").unwrap_or(false)
        }));
        ep
    };

    // One unacknowledged send so a completion is in flight when the device
    // dies.
    let failed = Arc::new(AtomicU64::new(0));
    let f = Arc::clone(&failed);
    ep_ab
        .am_bcopy(
            30,
            |buf| {
                buf[0] = 1;
                1
            },
            Some(Box::new(move |status| {
                assert!(matches!(status, Err(rud::Error::Io(_))));
                f.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .expect("send");

    fatal.inject(rud::Error::NoDevice("port went down".into()));
    a.progress();

    // One tick: both endpoints failed, the error callback ran per endpoint,
    // and the in-flight completion carried the device error.
    assert_eq!(a.ep_info(ep_ab.id()).expect("info").state, "failed");
    assert_eq!(a.ep_info(ep_ac.id()).expect("info").state, "failed");
    assert_eq!(err_calls.load(Ordering::SeqCst), 2);
    assert_eq!(failed.load(Ordering::SeqCst), 1);
    assert!(matches!(
        ep_ab.am_short(30, &[2]),
        Err(rud::Error::EndpointTimeout)
    ));
}

#[test]
fn test_teardown_cancels_inflight_completions() {
    let net = SimNet::new();
    let blackhole = Arc::new(AtomicBool::new(false));
    let hole = Arc::clone(&blackhole);
    let mut fab_a = net.attach();
    fab_a.set_drop_hook(Box::new(move |_| hole.load(Ordering::SeqCst)));

    let a = Iface::new(Box::new(fab_a), test_cfg()).expect("iface a");
    let b = Iface::new(Box::new(net.attach()), test_cfg()).expect("iface b");

    let ep = connect(&a, &b);
    warm_up(&a, &b, &ep, 4);
    blackhole.store(true, Ordering::SeqCst);

    let canceled = Arc::new(AtomicU64::new(0));
    let c = Arc::clone(&canceled);
    ep.am_bcopy(
        30,
        |buf| {
            buf[0] = 1;
            1
        },
        Some(Box::new(move |status| {
            assert!(matches!(status, Err(rud::Error::Canceled)));
            c.fetch_add(1, Ordering::SeqCst);
        })),
    )
    .expect("send into the void");

    drop(ep);
    drop(a);
    assert_eq!(
        canceled.load(Ordering::SeqCst),
        1,
        "teardown must cancel in-flight completions"
    );
}
