//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

// Registered-nexthop tracking and resolution against the shadow FIB.
// A registration's back-reference to its resolved route is a plain
// `RouteId` (an arena index), never an owning pointer: resolving it
// always goes back through the owning table, which is what lets the
// route side drop entries without anyone needing to chase down a
// dangling back-pointer.

use std::collections::BTreeMap;
use std::net::IpAddr;

use ipnetwork::IpNetwork;
use tracing::warn;

use crate::addr::{AddressFamily, apply_mask, prefix_compare};
use crate::iface::Interfaces;
use crate::route::{PRIORITY_ANY, RouteEntry, RouteFlags, RouteId, RouteTable};

#[derive(Clone, Debug)]
pub struct NexthopRegistration {
    pub addr: IpAddr,
    pub resolved: Option<RouteId>,
    pub ifindex: u32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NexthopUpdate {
    pub addr: IpAddr,
    pub valid: bool,
    pub connected: bool,
    pub gateway: IpAddr,
    pub net: Option<(IpAddr, u8)>,
}

#[derive(Debug, Default)]
pub struct NexthopTable {
    regs: BTreeMap<IpAddr, NexthopRegistration>,
}

impl NexthopTable {
    pub fn register(
        &mut self,
        addr: IpAddr,
        v4: &mut RouteTable,
        v6: &mut RouteTable,
        ifaces: &Interfaces,
    ) -> Option<NexthopUpdate> {
        self.regs.insert(
            addr,
            NexthopRegistration {
                addr,
                resolved: None,
                ifindex: 0,
            },
        );
        self.validate(addr, v4, v6, ifaces)
    }

    // Exposes every registration for the control-query reply path
    // (§S.2's IMSG_CTL_SHOW_NEXTHOP); resolution itself never iterates
    // this, only walks `regs` through `addr`-keyed lookups.
    pub fn iter(&self) -> impl Iterator<Item = &NexthopRegistration> {
        self.regs.values()
    }

    pub fn unregister(&mut self, addr: IpAddr, v4: &mut RouteTable, v6: &mut RouteTable) {
        if let Some(reg) = self.regs.remove(&addr)
            && let Some(old_id) = reg.resolved
        {
            let table = match AddressFamily::of(&addr) {
                AddressFamily::V4 => v4,
                AddressFamily::V6 => v6,
                _ => return,
            };
            self.clear_dependent_if_unreferenced(old_id, table);
        }
    }

    // The core resolution algorithm: detach from the previously
    // resolved route, perform a fresh longest-prefix-match at priority
    // "any" (masking the address at decreasing lengths), and publish
    // an update only when the resolution actually changed.
    pub fn validate(
        &mut self,
        addr: IpAddr,
        v4: &mut RouteTable,
        v6: &mut RouteTable,
        ifaces: &Interfaces,
    ) -> Option<NexthopUpdate> {
        let family = AddressFamily::of(&addr);
        let table = match family {
            AddressFamily::V4 => v4,
            AddressFamily::V6 => v6,
            _ => return None,
        };

        let old = self.regs.get(&addr)?.resolved;
        // Detach first: clear our own reference before checking whether
        // anyone else still depends on `old_id`, otherwise the
        // registration being revalidated would count as its own
        // dependent.
        self.regs.get_mut(&addr)?.resolved = None;
        if let Some(old_id) = old {
            self.clear_dependent_if_unreferenced(old_id, table);
        }

        let max_len = family.max_prefixlen();
        let new = kroute_match(table, addr, max_len, false, nexthop_acceptable);

        let reg = self.regs.get_mut(&addr)?;
        reg.resolved = new;
        if let Some(new_id) = new {
            reg.ifindex = table.get(new_id).map(|e| e.ifindex).unwrap_or(0);
            table
                .get_mut(new_id)
                .expect("just resolved")
                .flags
                .insert(RouteFlags::HAS_NEXTHOP_DEPENDENT);
        } else {
            reg.ifindex = 0;
        }

        if new != old {
            Some(self.build_update(addr, new.and_then(|id| table.get(id)), ifaces))
        } else {
            None
        }
    }

    // Revalidates every registration currently resolved through the
    // given interface (used when the interface flaps).
    pub fn track(
        &mut self,
        ifindex: u32,
        v4: &mut RouteTable,
        v6: &mut RouteTable,
        ifaces: &Interfaces,
    ) -> Vec<NexthopUpdate> {
        let addrs: Vec<IpAddr> = self
            .regs
            .values()
            .filter(|r| r.ifindex == ifindex)
            .map(|r| r.addr)
            .collect();
        addrs
            .into_iter()
            .filter_map(|addr| self.validate(addr, v4, v6, ifaces))
            .collect()
    }

    // Re-sends the current resolution for every registration whose
    // address falls within the changed route's prefix. The resolution
    // itself is not redone here — only its published attributes may
    // have changed (e.g. the covering route's flags).
    pub fn on_route_change(
        &self,
        changed_prefix: IpAddr,
        changed_prefixlen: u8,
        v4: &RouteTable,
        v6: &RouteTable,
        ifaces: &Interfaces,
    ) -> Vec<NexthopUpdate> {
        let family = AddressFamily::of(&changed_prefix);
        let table = match family {
            AddressFamily::V4 => v4,
            AddressFamily::V6 => v6,
            _ => return Vec::new(),
        };
        self.regs
            .values()
            .filter(|reg| {
                AddressFamily::of(&reg.addr) == family
                    && prefix_compare(changed_prefix, reg.addr, changed_prefixlen)
            })
            .map(|reg| self.build_update(reg.addr, reg.resolved.and_then(|id| table.get(id)), ifaces))
            .collect()
    }

    // Re-resolves every registration whose address falls within the
    // given prefix. Used when a route is inserted (a new, possibly
    // more specific, covering route may now exist) or removed (the
    // previous covering route may have just disappeared) — unlike
    // `on_route_change`, this redoes the longest-prefix-match rather
    // than just re-publishing the current one.
    pub fn revalidate_covered(
        &mut self,
        prefix_addr: IpAddr,
        prefixlen: u8,
        v4: &mut RouteTable,
        v6: &mut RouteTable,
        ifaces: &Interfaces,
    ) -> Vec<NexthopUpdate> {
        let family = AddressFamily::of(&prefix_addr);
        let addrs: Vec<IpAddr> = self
            .regs
            .values()
            .filter(|reg| {
                AddressFamily::of(&reg.addr) == family && prefix_compare(prefix_addr, reg.addr, prefixlen)
            })
            .map(|reg| reg.addr)
            .collect();
        addrs
            .into_iter()
            .filter_map(|addr| self.validate(addr, v4, v6, ifaces))
            .collect()
    }

    // Given a daemon-proposed nexthop that is itself a registered
    // address, resolves it down to the underlying gateway. VPN families
    // never reach this (the caller short-circuits), matching the
    // source's unconditional `return 1` for those AIDs.
    pub fn resolve_true_nexthop(
        &self,
        nexthop: IpAddr,
        v4: &RouteTable,
        v6: &RouteTable,
    ) -> Option<IpAddr> {
        let reg = self.regs.get(&nexthop)?;
        let resolved_id = reg.resolved?;
        let table = match AddressFamily::of(&nexthop) {
            AddressFamily::V4 => v4,
            AddressFamily::V6 => v6,
            _ => return None,
        };
        let route = table.get(resolved_id)?;
        if route.flags.contains(RouteFlags::CONNECTED) {
            Some(nexthop)
        } else {
            Some(route.nexthop)
        }
    }

    // Clears `HAS_NEXTHOP_DEPENDENT` on the previously resolved route
    // if no other registration (besides the one currently being
    // revalidated, which was already detached above) still points at
    // it. This is the sweep the back-reference flag exists to make an
    // O(1) fast path for.
    fn clear_dependent_if_unreferenced(&mut self, old_id: RouteId, table: &mut RouteTable) {
        let still_referenced = self.regs.values().any(|r| r.resolved == Some(old_id));
        if !still_referenced
            && let Some(entry) = table.get_mut(old_id)
        {
            entry.flags.remove(RouteFlags::HAS_NEXTHOP_DEPENDENT);
        }
    }

    fn build_update(
        &self,
        addr: IpAddr,
        route: Option<&RouteEntry>,
        ifaces: &Interfaces,
    ) -> NexthopUpdate {
        match route {
            None => NexthopUpdate {
                addr,
                valid: false,
                connected: false,
                gateway: addr,
                net: None,
            },
            Some(route) => {
                let valid = route_validate(route, ifaces);
                let connected = route.flags.contains(RouteFlags::CONNECTED);
                if connected {
                    NexthopUpdate {
                        addr,
                        valid,
                        connected,
                        gateway: addr,
                        net: Some((route.prefix.addr, route.prefix.prefixlen)),
                    }
                } else {
                    NexthopUpdate {
                        addr,
                        valid,
                        connected,
                        gateway: route.nexthop,
                        net: None,
                    }
                }
            }
        }
    }
}

// Mask-descent longest-prefix-match at priority "any". `matchany=false`
// requires each candidate to pass `acceptable` before being accepted;
// a candidate that fails keeps the search descending to shorter
// prefixes rather than giving up, mirroring `kroute_match`/`kroute6_match`.
fn kroute_match(
    table: &RouteTable,
    addr: IpAddr,
    max_len: u8,
    matchany: bool,
    acceptable: impl Fn(&RouteEntry) -> bool,
) -> Option<RouteId> {
    for len in (0..=max_len).rev() {
        let masked = apply_mask(addr, len);
        let Ok(key) = IpNetwork::new(masked, len) else {
            continue;
        };
        if let Some(id) = table.find(&key, PRIORITY_ANY) {
            let entry = table.get(id).expect("id returned by find must be live");
            if matchany || acceptable(entry) {
                return Some(id);
            }
        }
    }
    None
}

// The policy hook referenced by §4.4: whether a resolved route's
// nexthop is acceptable to the BGP decision process. Policy evaluation
// of BGP attributes is out of scope for this crate, so this is an
// always-accept stub; it exists so the resolution algorithm has the
// documented seam rather than hard-coding "always accept" into the
// search loop itself.
fn nexthop_acceptable(_route: &RouteEntry) -> bool {
    true
}

// §S.4: whether a route is currently kernel-forwardable. Shared by the
// NexthopUpdate.valid computation and by fib-couple/decouple deciding
// which routes are safe to (re)install.
pub fn route_validate(route: &RouteEntry, ifaces: &Interfaces) -> bool {
    if route.flags.intersects(RouteFlags::REJECT | RouteFlags::BLACKHOLE) {
        return false;
    }
    match ifaces.find(route.ifindex) {
        Some(iface) => iface.nh_reachable(),
        None => {
            if route.ifindex != 0 {
                warn!(
                    ifindex = route.ifindex,
                    prefix = %route.prefix.addr,
                    prefixlen = route.prefix.prefixlen,
                    "interface not found, referenced from route"
                );
            }
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::addr::Prefix;
    use crate::iface::{InterfaceFlags, InterfaceRecord};
    use crate::route::RouteEntry;

    fn connected_route(addr: &str, len: u8, ifindex: u32) -> RouteEntry {
        RouteEntry {
            prefix: Prefix {
                family: AddressFamily::V4,
                addr: addr.parse().unwrap(),
                prefixlen: len,
                scope_id: 0,
                labels: Vec::new(),
            },
            nexthop: Ipv4Addr::UNSPECIFIED.into(),
            ifindex,
            priority: 32,
            flags: RouteFlags::CONNECTED,
            route_label: 0,
            mpls_label: None,
        }
    }

    #[test]
    fn resolution_picks_longest_match() {
        let mut v4 = RouteTable::default();
        let mut v6 = RouteTable::default();
        let mut ifaces = Interfaces::default();
        let mut iface = InterfaceRecord::new(3, "eth0".into(), 0);
        iface.flags.insert(InterfaceFlags::UP);
        ifaces.insert(iface);

        v4.insert(RouteEntry {
            priority: 32,
            ..connected_route("0.0.0.0", 0, 5)
        });
        v4.insert(connected_route("192.0.2.0", 24, 3));

        let mut nht = NexthopTable::default();
        let addr: IpAddr = "192.0.2.10".parse().unwrap();
        let update = nht.register(addr, &mut v4, &mut v6, &ifaces).unwrap();
        assert!(update.valid);
        assert!(update.connected);
        assert_eq!(update.net, Some((Ipv4Addr::new(192, 0, 2, 0).into(), 24)));
    }

    // `track` revalidates through `validate`, which only publishes an
    // update when the resolved route itself changes (kroute-linux.c's
    // `if (kr != oldk) knexthop_send_update(kn)`). Bringing the owning
    // interface down does not remove the covering connected route, so
    // the resolution is unchanged and `track` has nothing to report;
    // the `valid=false` signal instead comes from the route actually
    // disappearing (exercised via `fib_delete` in reconcile.rs).
    #[test]
    fn track_is_a_no_op_when_the_resolved_route_is_unchanged() {
        let mut v4 = RouteTable::default();
        let mut v6 = RouteTable::default();
        let mut ifaces = Interfaces::default();
        let mut iface = InterfaceRecord::new(3, "eth0".into(), 0);
        iface.flags.insert(InterfaceFlags::UP);
        ifaces.insert(iface);
        v4.insert(connected_route("192.0.2.0", 24, 3));

        let mut nht = NexthopTable::default();
        let addr: IpAddr = "192.0.2.10".parse().unwrap();
        nht.register(addr, &mut v4, &mut v6, &ifaces);

        ifaces.find_mut(3).unwrap().flags.remove(InterfaceFlags::UP);
        let updates = nht.track(3, &mut v4, &mut v6, &ifaces);
        assert!(updates.is_empty());
    }
}
