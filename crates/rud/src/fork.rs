// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fork guard.
//!
//! Fabric resources do not survive `fork()`. A child process that inherited
//! an interface must neither use it nor close the parent's queue pair, so a
//! `pthread_atfork` child handler bumps a process-wide generation counter;
//! every interface remembers the generation it was created under and fails
//! operations with [`crate::Error::Canceled`] once the two diverge, leaking
//! (rather than closing) the inherited handles.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Once;

static GENERATION: AtomicU64 = AtomicU64::new(0);
static INSTALL: Once = Once::new();

extern "C" fn at_fork_child() {
    GENERATION.fetch_add(1, Ordering::SeqCst);
}

/// Install the atfork handler. Idempotent; called from `Iface::new`.
pub(crate) fn install() {
    INSTALL.call_once(|| {
        // SAFETY: at_fork_child is async-signal-safe (a single atomic add).
        let rc = unsafe { libc::pthread_atfork(None, None, Some(at_fork_child)) };
        if rc != 0 {
            log::warn!("[fork] pthread_atfork failed rc={}", rc);
        }
    });
}

/// Current fork generation of this process.
pub(crate) fn generation() -> u64 {
    GENERATION.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fork_install_idempotent() {
        install();
        install();
        let g = generation();
        assert_eq!(g, generation());
    }
}
