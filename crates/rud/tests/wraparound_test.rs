// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sequence-number wraparound: the protocol runs identically when the PSN
//! space wraps mid-transfer.

#![allow(clippy::uninlined_format_args)] // Test/bench code readability over pedantic
#![allow(clippy::cast_possible_truncation)] // Test parameters
#![allow(clippy::missing_panics_doc)] // Tests panic on failure

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rud::{Iface, IfaceConfig, SimNet};

fn wrap_cfg() -> IfaceConfig {
    IfaceConfig {
        timer_tick: Duration::from_millis(2),
        min_poke_time: Duration::from_millis(5),
        peer_timeout: Duration::from_millis(500),
        async_timer_tick: Duration::from_millis(5),
        // A handful of sends away from 0xFFFF: the transfer below is
        // guaranteed to cross the wrap.
        initial_psn: 0xFFF0,
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

fn run_transfer(loss: bool) {
    const TOTAL: u16 = 64;

    let net = SimNet::new();
    let mut fab_a = net.attach();
    if loss {
        fastrand::seed(0x5EED_F00D);
        fab_a.set_drop_hook(Box::new(move |_| fastrand::u64(0..5) == 0));
    }
    let a = Iface::new(Box::new(fab_a), wrap_cfg()).expect("iface a");
    let b = Iface::new(Box::new(net.attach()), wrap_cfg()).expect("iface b");

    let received: Arc<Mutex<Vec<u16>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    b.set_am_handler(1, move |payload| {
        sink.lock()
            .push(u16::from_be_bytes([payload[0], payload[1]]));
    })
    .expect("handler");

    let ep = a.create_ep(&b.address(), 0).expect("create ep");
    let id = ep.id();
    assert!(progress_until(&a, &b, 2000, || {
        a.ep_info(id).map(|i| i.state == "connected").unwrap_or(false)
    }));

    for i in 0..TOTAL {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match ep.am_short(1, &i.to_be_bytes()) {
                Ok(()) => break,
                Err(rud::Error::NoResource) => {
                    assert!(Instant::now() < deadline, "send starved at {}", i);
                    a.progress();
                    b.progress();
                }
                Err(e) => panic!("send failed: {}", e),
            }
        }
    }

    assert!(
        progress_until(&a, &b, 10_000, || received.lock().len() as u16 == TOTAL),
        "wraparound transfer incomplete: {}",
        received.lock().len()
    );
    assert_eq!(*received.lock(), (0..TOTAL).collect::<Vec<_>>());

    // The transfer crossed the wrap: the cursor is now numerically below
    // the starting PSN.
    let info = a.ep_info(id).expect("info");
    assert!(info.psn < 0xFFF0, "psn did not wrap: {:#x}", info.psn);
}

#[test]
fn test_wraparound_lossless() {
    run_transfer(false);
}

#[test]
fn test_wraparound_with_loss() {
    run_transfer(true);
}
