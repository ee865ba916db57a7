// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Process-local producer bookkeeping.
//!
//! One producer per channel name per process; the map also lets diagnostic
//! code enumerate what this process currently owns.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::OnceLock;

fn producers() -> &'static DashMap<String, u64> {
    static PRODUCERS: OnceLock<DashMap<String, u64>> = OnceLock::new();
    PRODUCERS.get_or_init(DashMap::new)
}

/// Claim a channel name for this process. Returns false if a live producer
/// object in this process already holds it.
pub(crate) fn claim(channel: &str) -> bool {
    match producers().entry(channel.to_string()) {
        Entry::Occupied(_) => false,
        Entry::Vacant(v) => {
            v.insert(crate::platform::current_pid());
            true
        }
    }
}

/// Release a claim taken with [`claim`].
pub(crate) fn release(channel: &str) {
    producers().remove(channel);
}

/// Channel names owned by producers in this process.
#[must_use]
pub fn owned_channels() -> Vec<String> {
    producers().iter().map(|e| e.key().clone()).collect()
}
