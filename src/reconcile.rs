//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

// Reconciler / state machine (§4.7): turns inbound netlink events into
// route-table mutations, nexthop revalidation, and redistribution
// updates, and drives the daemon-owned-route lifecycle the other way.
//
// This module is deliberately netlink-agnostic: it consumes already
// parsed `RouteUpdate`/`LinkUpdate` values and a raw `(pid, seq)` pair
// for self-echo filtering, and returns the events the caller (the
// netlink bridge and the IPC sink) should act on. Nothing here touches
// a socket.

use std::net::IpAddr;

use crate::addr::{AddressFamily, Prefix, unspecified};
use crate::iface::{InterfaceFlags, InterfaceRecord, Interfaces, LinkState};
use crate::ktable::RoutingTable;
use crate::nexthop::{NexthopTable, NexthopUpdate};
use crate::redist::{NetworkStatement, RedistEvent, RedistTable, RedistributionKey};
use crate::route::{RouteEntry, RouteFlags, RouteId, RouteMatch, RouteTable};

pub const RT_TABLE_MAIN: u32 = 254;
pub const RT_TABLE_LOCAL: u32 = 255;

// Resolves a raw kernel route-table id to the rtableid used internally,
// per §4.7: the local table is never shadowed, and the main table is
// normalised to rtableid 0.
pub fn normalize_table(raw_table: u32) -> Option<u32> {
    if raw_table == RT_TABLE_LOCAL {
        None
    } else if raw_table == RT_TABLE_MAIN {
        Some(0)
    } else {
        Some(raw_table)
    }
}

// Whether an inbound message should be ignored as our own echo: a pid
// match against the daemon's netlink port id, outside an active dump
// query window (§S.3 — a dump in progress correlates replies by
// `query_seq` instead, so this check is skipped for dump traffic).
pub fn is_self_echo(msg_pid: u32, msg_seq: u32, our_pid: u32, active_query_seq: Option<u32>) -> bool {
    if msg_pid != our_pid {
        return false;
    }
    match active_query_seq {
        Some(seq) => msg_seq != seq,
        None => true,
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MsgType {
    Add,
    Change,
}

// A parsed inbound route notification, family-agnostic; the reconciler
// picks v4 or v6 storage based on `prefix.family`.
#[derive(Clone, Debug)]
pub struct RouteUpdate {
    pub prefix: Prefix,
    // `None` means the kernel reported no gateway (a connected route).
    pub nexthop: Option<IpAddr>,
    pub ifindex: u32,
    pub priority: u8,
    pub flags: RouteFlags,
    pub route_label: u16,
    pub mpls_label: Option<u32>,
}

#[derive(Clone, Debug)]
pub enum ReconcileEvent {
    NetworkAnnounce { addr: IpAddr, prefixlen: u8 },
    NetworkWithdraw { addr: IpAddr, prefixlen: u8 },
    Nexthop(NexthopUpdate),
}

fn push_redist_event(event: Option<RedistEvent>, route: &RouteEntry, events: &mut Vec<ReconcileEvent>) {
    match event {
        Some(RedistEvent::Add) => events.push(ReconcileEvent::NetworkAnnounce {
            addr: route.prefix.addr,
            prefixlen: route.prefix.prefixlen,
        }),
        Some(RedistEvent::Remove) => events.push(ReconcileEvent::NetworkWithdraw {
            addr: route.prefix.addr,
            prefixlen: route.prefix.prefixlen,
        }),
        None => {}
    }
}

// §4.7 `fib_change`. `mpath` reflects whether the originating table is
// configured for multipath; `msg_type` distinguishes a kernel `ADD`
// from a kernel `CHANGE` so a multipath add can be told apart from an
// in-place update to one existing path.
pub fn fib_change(
    kt: &mut RoutingTable,
    nexthops: &mut NexthopTable,
    ifaces: &Interfaces,
    msg: RouteUpdate,
    msg_type: MsgType,
    mpath: bool,
) -> Vec<ReconcileEvent> {
    let family = msg.prefix.family;
    if !matches!(family, AddressFamily::V4 | AddressFamily::V6) {
        return Vec::new();
    }

    let RoutingTable {
        v4, v6, statements, redist, ..
    } = kt;
    // `kt.statements` carries reload bookkeeping this function doesn't
    // need; extract the bare match criteria.
    let statements: Vec<NetworkStatement> = statements.iter().map(|n| n.statement).collect();
    let statements = &statements[..];
    let (table, other) = match family {
        AddressFamily::V4 => (v4, v6),
        _ => (v6, v4),
    };
    let key = msg.prefix.network();

    let Some(existing_id) = table.find(&key, msg.priority) else {
        return insert_new(table, other, nexthops, statements, redist, ifaces, msg, family);
    };

    // Echo of our own install: the kernel has confirmed it, so there is
    // no longer a pending RTM_ADD in flight for this route.
    if msg.flags.contains(RouteFlags::BGPD_OWNED) {
        if let Some(entry) = table.get_mut(existing_id) {
            entry.flags.remove(RouteFlags::BGPD_INSERTED);
        }
        return Vec::new();
    }

    let target_id = if mpath {
        let template = RouteMatch {
            connected: msg.nexthop.is_none(),
            ifindex: msg.ifindex,
            nexthop: msg.nexthop.unwrap_or(unspecified(family)),
            scope_id: msg.prefix.scope_id,
        };
        match msg_type {
            MsgType::Add => {
                return insert_new(table, other, nexthops, statements, redist, ifaces, msg, family);
            }
            MsgType::Change => {
                let actual_priority = table
                    .get(existing_id)
                    .map(|e| e.priority)
                    .unwrap_or(msg.priority);
                match table.match_gw(&key, actual_priority, &template) {
                    Some(id) => id,
                    None => {
                        return insert_new(table, other, nexthops, statements, redist, ifaces, msg, family);
                    }
                }
            }
        }
    } else {
        existing_id
    };

    apply_update(table, other, nexthops, statements, redist, ifaces, target_id, msg, family)
}

fn insert_new(
    table: &mut RouteTable,
    other: &mut RouteTable,
    nexthops: &mut NexthopTable,
    statements: &[NetworkStatement],
    redist: &mut RedistTable,
    ifaces: &Interfaces,
    msg: RouteUpdate,
    family: AddressFamily,
) -> Vec<ReconcileEvent> {
    let prefix = msg.prefix.clone();
    let entry = RouteEntry {
        prefix: prefix.clone(),
        nexthop: msg.nexthop.unwrap_or(unspecified(prefix.family)),
        ifindex: msg.ifindex,
        priority: msg.priority,
        flags: msg.flags,
        route_label: msg.route_label,
        mpls_label: msg.mpls_label,
    };
    let outcome = table.insert(entry);

    let mut events = Vec::new();
    // A non-head multipath duplicate never triggers redistribution.
    if !outcome.multipath && !msg.flags.contains(RouteFlags::BGPD_OWNED) {
        let installed = table.get(outcome.id).expect("just inserted").clone();
        push_redist_event(redist.redistribute(&installed, statements), &installed, &mut events);
    }

    let (v4, v6) = match family {
        AddressFamily::V4 => (&mut *table, &mut *other),
        _ => (&mut *other, &mut *table),
    };
    let updates = nexthops.revalidate_covered(prefix.addr, prefix.prefixlen, v4, v6, ifaces);
    events.extend(updates.into_iter().map(ReconcileEvent::Nexthop));
    events
}

// The in-place update branch of `fib_change`: rewrites nexthop/ifindex,
// re-interns the route label, recomputes the flag set while preserving
// `has-nexthop-dependent`, and emits redistribution/nexthop events.
fn apply_update(
    table: &mut RouteTable,
    other: &mut RouteTable,
    nexthops: &mut NexthopTable,
    statements: &[NetworkStatement],
    redist: &mut RedistTable,
    ifaces: &Interfaces,
    target_id: RouteId,
    msg: RouteUpdate,
    family: AddressFamily,
) -> Vec<ReconcileEvent> {
    let mut events = Vec::new();
    let Some(entry) = table.get_mut(target_id) else {
        return events;
    };

    let mut changed = false;
    let new_nexthop = msg.nexthop.unwrap_or(unspecified(entry.prefix.family));
    if entry.nexthop != new_nexthop {
        changed = true;
    }
    entry.nexthop = new_nexthop;
    entry.ifindex = msg.ifindex;

    let mut new_flags = msg.flags;
    if entry.flags.contains(RouteFlags::HAS_NEXTHOP_DEPENDENT) {
        new_flags.insert(RouteFlags::HAS_NEXTHOP_DEPENDENT);
    }

    let label_changed = entry.route_label != msg.route_label;
    entry.route_label = msg.route_label;

    let old_flags = entry.flags;
    if old_flags != new_flags {
        changed = true;
    }
    entry.flags = new_flags;
    let had_dependent = new_flags.contains(RouteFlags::HAS_NEXTHOP_DEPENDENT);
    let prefix = entry.prefix.clone();

    if label_changed || old_flags != new_flags {
        let snapshot = table.get(target_id).expect("still present").clone();
        push_redist_event(redist.redistribute(&snapshot, statements), &snapshot, &mut events);
    }

    if had_dependent && changed {
        let (v4, v6) = match family {
            AddressFamily::V4 => (&*table, &*other),
            _ => (&*other, &*table),
        };
        let updates = nexthops.on_route_change(prefix.addr, prefix.prefixlen, v4, v6, ifaces);
        events.extend(updates.into_iter().map(ReconcileEvent::Nexthop));
    }

    events
}

// §4.7 `fib_delete`: `route.remove(kf, !mpath)`, then revalidates any
// registrations that had depended on the removed route and withdraws
// redistribution if the (prefix, prefixlen) key is now fully gone.
pub fn fib_delete(
    kt: &mut RoutingTable,
    nexthops: &mut NexthopTable,
    ifaces: &Interfaces,
    msg: RouteUpdate,
    mpath: bool,
) -> Vec<ReconcileEvent> {
    let family = msg.prefix.family;
    if !matches!(family, AddressFamily::V4 | AddressFamily::V6) {
        return Vec::new();
    }

    let RoutingTable { v4, v6, redist, .. } = kt;
    let (table, other) = match family {
        AddressFamily::V4 => (v4, v6),
        _ => (v6, v4),
    };
    let template = RouteMatch {
        connected: msg.nexthop.is_none(),
        ifindex: msg.ifindex,
        nexthop: msg.nexthop.unwrap_or(unspecified(family)),
        scope_id: msg.prefix.scope_id,
    };
    let Ok(removed) = table.remove(&msg.prefix, msg.priority, !mpath, &template) else {
        return Vec::new();
    };

    let mut events = Vec::new();
    if removed.entry.has_dependent() {
        let (v4, v6) = match family {
            AddressFamily::V4 => (&mut *table, &mut *other),
            _ => (&mut *other, &mut *table),
        };
        let updates = nexthops.revalidate_covered(
            removed.entry.prefix.addr,
            removed.entry.prefix.prefixlen,
            v4,
            v6,
            ifaces,
        );
        events.extend(updates.into_iter().map(ReconcileEvent::Nexthop));
    }

    if removed.key_exhausted && !removed.entry.flags.contains(RouteFlags::BGPD_OWNED) {
        let key = RedistributionKey {
            addr: removed.entry.prefix.addr,
            prefixlen: removed.entry.prefix.prefixlen,
            rd: 0,
        };
        if redist.withdraw_dynamic(key) {
            events.push(ReconcileEvent::NetworkWithdraw {
                addr: removed.entry.prefix.addr,
                prefixlen: removed.entry.prefix.prefixlen,
            });
        }
    }
    events
}

// A parsed inbound link notification.
#[derive(Clone, Debug)]
pub struct LinkUpdate {
    pub ifindex: u32,
    pub name: String,
    pub up: bool,
    pub link_state: LinkState,
    pub routing_domain: u32,
}

// §4.7 link add/delete: updates the shadow InterfaceRecord and, on a
// reachability transition, re-tracks every nexthop resolved through it.
pub fn link_change(
    ifaces: &mut Interfaces,
    nexthops: &mut NexthopTable,
    v4: &mut RouteTable,
    v6: &mut RouteTable,
    msg: LinkUpdate,
) -> Vec<NexthopUpdate> {
    let was_reachable = ifaces.find(msg.ifindex).map(|i| i.nh_reachable()).unwrap_or(false);

    if ifaces.find(msg.ifindex).is_none() {
        ifaces.insert(InterfaceRecord::new(msg.ifindex, msg.name.clone(), msg.routing_domain));
    }
    let iface = ifaces.find_mut(msg.ifindex).expect("just ensured present");
    iface.name = msg.name;
    iface.link_state = msg.link_state;
    if msg.up {
        iface.flags.insert(InterfaceFlags::UP);
    } else {
        iface.flags.remove(InterfaceFlags::UP);
    }
    let now_reachable = iface.nh_reachable();

    if was_reachable != now_reachable {
        nexthops.track(msg.ifindex, v4, v6, ifaces)
    } else {
        Vec::new()
    }
}

pub fn link_delete(
    ifaces: &mut Interfaces,
    nexthops: &mut NexthopTable,
    v4: &mut RouteTable,
    v6: &mut RouteTable,
    ifindex: u32,
) -> Vec<NexthopUpdate> {
    if ifaces.remove(ifindex).is_some() {
        nexthops.track(ifindex, v4, v6, ifaces)
    } else {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::addr::AddressFamily;
    use crate::ktable::KtableRegistry;

    fn prefix(addr: &str, len: u8) -> Prefix {
        Prefix {
            family: AddressFamily::V4,
            addr: addr.parse().unwrap(),
            prefixlen: len,
            scope_id: 0,
            labels: Vec::new(),
        }
    }

    #[test]
    fn self_echo_is_ignored_outside_dump_window() {
        assert!(is_self_echo(7, 10, 7, None));
        assert!(!is_self_echo(7, 10, 8, None));
        assert!(!is_self_echo(7, 10, 7, Some(10)));
        assert!(is_self_echo(7, 11, 7, Some(10)));
    }

    #[test]
    fn table_normalization() {
        assert_eq!(normalize_table(RT_TABLE_MAIN), Some(0));
        assert_eq!(normalize_table(RT_TABLE_LOCAL), None);
        assert_eq!(normalize_table(5), Some(5));
    }

    #[test]
    fn simple_learn_inserts_route() {
        let mut reg = KtableRegistry::default();
        reg.new_table(0, 0, "rdomain_0".into(), false);
        let kt = reg.get_mut(0).unwrap();
        let mut nht = NexthopTable::default();
        let ifaces = Interfaces::default();

        let msg = RouteUpdate {
            prefix: prefix("192.0.2.0", 24),
            nexthop: Some("203.0.113.1".parse().unwrap()),
            ifindex: 3,
            priority: 32,
            flags: RouteFlags::empty(),
            route_label: 0,
            mpls_label: None,
        };
        let events = fib_change(kt, &mut nht, &ifaces, msg, MsgType::Add, false);
        assert!(events.is_empty());
        assert_eq!(kt.v4.len(), 1);
    }

    #[test]
    fn echoed_daemon_route_clears_inserted_flag() {
        let mut reg = KtableRegistry::default();
        reg.new_table(0, 0, "rdomain_0".into(), false);
        let kt = reg.get_mut(0).unwrap();
        let mut nht = NexthopTable::default();
        let ifaces = Interfaces::default();

        let owned = RouteEntry {
            prefix: prefix("192.0.2.0", 24),
            nexthop: Ipv4Addr::UNSPECIFIED.into(),
            ifindex: 3,
            priority: 255,
            flags: RouteFlags::BGPD_OWNED | RouteFlags::BGPD_INSERTED,
            route_label: 0,
            mpls_label: None,
        };
        kt.v4.insert(owned);

        let echo = RouteUpdate {
            prefix: prefix("192.0.2.0", 24),
            nexthop: Some(Ipv4Addr::UNSPECIFIED.into()),
            ifindex: 3,
            priority: 255,
            flags: RouteFlags::BGPD_OWNED,
            route_label: 0,
            mpls_label: None,
        };
        let events = fib_change(kt, &mut nht, &ifaces, echo, MsgType::Add, false);
        assert!(events.is_empty());
        let (_, entry) = kt.v4.iter().next().unwrap();
        assert!(!entry.flags.contains(RouteFlags::BGPD_INSERTED));
    }

    #[test]
    fn removing_covering_route_invalidates_dependent_nexthop() {
        let mut reg = KtableRegistry::default();
        reg.new_table(0, 0, "rdomain_0".into(), false);
        let kt = reg.get_mut(0).unwrap();
        let mut nht = NexthopTable::default();
        let ifaces = Interfaces::default();

        let connected = RouteEntry {
            prefix: prefix("192.0.2.0", 24),
            nexthop: Ipv4Addr::UNSPECIFIED.into(),
            ifindex: 3,
            priority: 32,
            flags: RouteFlags::CONNECTED,
            route_label: 0,
            mpls_label: None,
        };
        kt.v4.insert(connected);
        let addr: IpAddr = "192.0.2.10".parse().unwrap();
        nht.register(addr, &mut kt.v4, &mut kt.v6, &ifaces);
        assert!(kt.v4.iter().next().unwrap().1.has_dependent());

        let del = RouteUpdate {
            prefix: prefix("192.0.2.0", 24),
            nexthop: None,
            ifindex: 3,
            priority: 32,
            flags: RouteFlags::CONNECTED,
            route_label: 0,
            mpls_label: None,
        };
        let events = fib_delete(kt, &mut nht, &ifaces, del, false);
        assert_eq!(events.len(), 1);
        match &events[0] {
            ReconcileEvent::Nexthop(update) => assert!(!update.valid),
            _ => panic!("expected a nexthop invalidation"),
        }
    }
}
