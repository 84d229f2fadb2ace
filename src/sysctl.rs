//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

// §A.5: the source flips these at startup when configured to act as a
// forwarding router (`kr_init`'s `ip_forward`/`ipforwarding` sysctl
// writes). This is an ambient system-integration detail, not part of
// the KRSC data model, so it stays a thin module wrapping the `sysctl`
// crate behind the same capability bracket as the netlink socket.

use sysctl::{Ctl, Sysctl, SysctlError};

use crate::capabilities;

pub fn set_ipv4_forwarding(enable: bool) -> Result<(), SysctlError> {
    capabilities::raise(|| {
        let ctl = Ctl::new("net.ipv4.ip_forward")?;
        ctl.set_value_string(if enable { "1" } else { "0" })?;
        Ok(())
    })
}

pub fn set_ipv6_forwarding(enable: bool) -> Result<(), SysctlError> {
    capabilities::raise(|| {
        let ctl = Ctl::new("net.ipv6.conf.all.forwarding")?;
        ctl.set_value_string(if enable { "1" } else { "0" })?;
        Ok(())
    })
}
