//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

// §A.4: confines CAP_NET_ADMIN to the exact syscalls that need it
// (opening/binding the netlink socket, and the sysctl writes in
// `crate::sysctl`) rather than running the whole process privileged.

use capctl::caps::CapState;
use tracing::error;

/// Runs the provided closure with elevated capabilities.
pub fn raise<F, R>(cb: F) -> R
where
    F: FnOnce() -> R,
{
    let mut caps = CapState::get_current().unwrap();
    caps.effective = caps.permitted;
    if let Err(error) = caps.set_current() {
        error!("failed to update current capabilities: {}", error);
    }

    let ret = cb();

    caps.effective.clear();
    if let Err(error) = caps.set_current() {
        error!("failed to update current capabilities: {}", error);
    }

    ret
}
