// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Process-wide device-name to netdev-index cache.
//!
//! Shared by every interface in the process, initialized on first use and
//! guarded by its own lock-free map; it must never rely on any interface
//! lock.

use std::ffi::CString;
use std::sync::OnceLock;

use dashmap::DashMap;

static CACHE: OnceLock<DashMap<String, u32>> = OnceLock::new();

fn cache() -> &'static DashMap<String, u32> {
    CACHE.get_or_init(DashMap::new)
}

/// Resolve a network device name to its interface index, caching the result.
///
/// Returns `None` for unknown devices (a zero index from the OS).
pub fn netdev_index(name: &str) -> Option<u32> {
    if let Some(idx) = cache().get(name) {
        return Some(*idx);
    }
    let cname = CString::new(name).ok()?;
    // SAFETY: cname is a valid NUL-terminated string for the duration of
    // the call; if_nametoindex does not retain the pointer.
    let idx = unsafe { libc::if_nametoindex(cname.as_ptr()) };
    if idx == 0 {
        return None;
    }
    cache().insert(name.to_string(), idx);
    Some(idx)
}
