// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Process identity and liveness.

use std::io;

/// Our pid, widened to the u64 stored in shared memory.
#[must_use]
pub fn current_pid() -> u64 {
    u64::from(std::process::id())
}

/// Check whether a pid refers to a live process.
///
/// Uses `kill(pid, 0)`: signal 0 performs permission and existence checks
/// without delivering anything. `EPERM` means the process exists but is not
/// ours, which still counts as alive.
///
/// Pid 0 (an unset heartbeat) is never alive.
#[must_use]
pub fn is_pid_alive(pid: u64) -> bool {
    if pid == 0 || pid > i32::MAX as u64 {
        return false;
    }
    // SAFETY: kill with signal 0 probes existence only; no signal is sent.
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if ret == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_is_alive() {
        assert!(is_pid_alive(current_pid()));
    }

    #[test]
    fn test_pid_zero_is_dead() {
        assert!(!is_pid_alive(0));
    }

    #[test]
    fn test_implausible_pid_is_dead() {
        // Above any realistic pid_max, and far above i32::MAX guards too.
        assert!(!is_pid_alive(u64::MAX));
    }
}
