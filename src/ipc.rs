//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

// IPC message types (§6) emitted to the session/RDE processes, plus the
// control-query reply family (§S.2): `show-kroute`, `show-kroute-addr`,
// `show-nexthop`, `show-interface`, `show-fib-tables`, each terminated
// by a single `End` marker. This module only walks the in-memory model
// and builds reply values; actually writing them to the IPC channel is
// the external collaborator's job (§1).

use std::net::IpAddr;

use crate::addr::AddressFamily;
use crate::iface::Interfaces;
use crate::ktable::{KtableRegistry, ReconfState, RoutingTable};
use crate::nexthop::route_validate;
use crate::reconcile::ReconcileEvent;
use crate::route::{RouteEntry, RouteFlags};

// The steady-state events this crate publishes outward, folding in
// §4.7's `ReconcileEvent` plus the link-dependency notification
// (`session-dependon`) that the interface table's reachability
// transitions feed to the session process.
#[derive(Clone, Debug)]
pub enum IpcEvent {
    NetworkAdd { addr: IpAddr, prefixlen: u8 },
    NetworkRemove { addr: IpAddr, prefixlen: u8 },
    NexthopUpdate(crate::nexthop::NexthopUpdate),
    SessionDependOn { ifindex: u32, reachable: bool },
}

impl From<ReconcileEvent> for IpcEvent {
    fn from(event: ReconcileEvent) -> IpcEvent {
        match event {
            ReconcileEvent::NetworkAnnounce { addr, prefixlen } => {
                IpcEvent::NetworkAdd { addr, prefixlen }
            }
            ReconcileEvent::NetworkWithdraw { addr, prefixlen } => {
                IpcEvent::NetworkRemove { addr, prefixlen }
            }
            ReconcileEvent::Nexthop(update) => IpcEvent::NexthopUpdate(update),
        }
    }
}

// ===== control-query replies =====

#[derive(Clone, Debug)]
pub struct KrouteReply {
    pub addr: IpAddr,
    pub prefixlen: u8,
    pub nexthop: IpAddr,
    pub ifindex: u32,
    pub priority: u8,
    pub flags: RouteFlags,
    pub label: String,
}

#[derive(Clone, Debug)]
pub struct ShowInterfaceReply {
    pub ifindex: u32,
    pub name: String,
    pub up: bool,
    pub nh_reachable: bool,
}

#[derive(Clone, Debug)]
pub struct ShowNexthopReply {
    pub addr: IpAddr,
    pub valid: bool,
    pub kroute: Option<KrouteReply>,
    pub iface: Option<ShowInterfaceReply>,
}

#[derive(Clone, Debug)]
pub struct ShowFibTablesReply {
    pub rtableid: u32,
    pub nhtableid: u32,
    pub description: String,
    pub fib_sync_enabled: bool,
    pub fib_sync_configured: bool,
}

#[derive(Clone, Debug)]
pub enum CtlReply {
    Kroute(KrouteReply),
    Nexthop(ShowNexthopReply),
    Interface(ShowInterfaceReply),
    FibTable(ShowFibTablesReply),
    End,
}

fn to_kroute_reply(route: &RouteEntry, labels: &crate::rtlabel::RtLabelTable) -> KrouteReply {
    KrouteReply {
        addr: route.prefix.addr,
        prefixlen: route.prefix.prefixlen,
        nexthop: route.nexthop,
        ifindex: route.ifindex,
        priority: route.priority,
        flags: route.flags,
        label: labels.name(route.route_label).to_string(),
    }
}

// IMSG_CTL_KROUTE: every route in `kt`, optionally filtered by address
// family and/or a required flag subset, with every multipath sibling
// emitted (not just chain heads).
pub fn show_kroute(
    kt: &RoutingTable,
    labels: &crate::rtlabel::RtLabelTable,
    af: Option<AddressFamily>,
    flag_filter: RouteFlags,
) -> Vec<CtlReply> {
    let mut out = Vec::new();
    let tables: Vec<&crate::route::RouteTable> = match af {
        Some(AddressFamily::V4) => vec![&kt.v4],
        Some(AddressFamily::V6) => vec![&kt.v6],
        _ => vec![&kt.v4, &kt.v6],
    };
    for table in tables {
        for (_, entry) in table.iter() {
            if !flag_filter.is_empty() && !entry.flags.intersects(flag_filter) {
                continue;
            }
            out.push(CtlReply::Kroute(to_kroute_reply(entry, labels)));
        }
    }
    out.push(CtlReply::End);
    out
}

// IMSG_CTL_KROUTE_ADDR: resolved with `find(.., PRIORITY_ANY)` exactly
// as the source does, which is Open Question 3 from §9 — this returns
// only the lowest-priority entry at `addr`'s exact prefix, even when
// higher-priority entries coexist at the same key. Not silently fixed
// to enumerate every priority: this matches the single-entry reply the
// source's control socket has always returned for this query.
pub fn show_kroute_addr(
    kt: &RoutingTable,
    labels: &crate::rtlabel::RtLabelTable,
    addr: IpAddr,
    prefixlen: u8,
) -> Vec<CtlReply> {
    let family = AddressFamily::of(&addr);
    let table = match family {
        AddressFamily::V4 => &kt.v4,
        AddressFamily::V6 => &kt.v6,
        _ => {
            return vec![CtlReply::End];
        }
    };
    let Ok(key) = ipnetwork::IpNetwork::new(addr, prefixlen) else {
        return vec![CtlReply::End];
    };
    let mut out = Vec::new();
    if let Some(id) = table.find(&key, crate::route::PRIORITY_ANY)
        && let Some(entry) = table.get(id)
    {
        out.push(CtlReply::Kroute(to_kroute_reply(entry, labels)));
    }
    out.push(CtlReply::End);
    out
}

// IMSG_CTL_SHOW_NEXTHOP: one reply per registered nexthop in `kt`'s
// root table (or the table it borrows from), carrying the resolved
// route and owning interface when one exists.
pub fn show_nexthop(
    kt: &RoutingTable,
    reg: &KtableRegistry,
    labels: &crate::rtlabel::RtLabelTable,
    ifaces: &Interfaces,
) -> Vec<CtlReply> {
    let Some(root) = reg.get(kt.nhtableid).and_then(|root| root.nexthops.as_ref()) else {
        return vec![CtlReply::End];
    };
    let (v4, v6) = (&kt.v4, &kt.v6);
    let mut out: Vec<CtlReply> = root
        .iter()
        .map(|reg| {
            let family = AddressFamily::of(&reg.addr);
            let table = match family {
                AddressFamily::V4 => v4,
                _ => v6,
            };
            let route = reg.resolved.and_then(|id| table.get(id));
            let (valid, kroute, iface) = match route {
                Some(route) => (
                    route_validate(route, ifaces),
                    Some(to_kroute_reply(route, labels)),
                    ifaces.find(route.ifindex).map(|iface| ShowInterfaceReply {
                        ifindex: iface.ifindex,
                        name: iface.name.clone(),
                        up: iface.flags.contains(crate::iface::InterfaceFlags::UP),
                        nh_reachable: iface.nh_reachable(),
                    }),
                ),
                None => (false, None, None),
            };
            CtlReply::Nexthop(ShowNexthopReply {
                addr: reg.addr,
                valid,
                kroute,
                iface,
            })
        })
        .collect();
    out.push(CtlReply::End);
    out
}

pub fn show_interface(ifaces: &Interfaces) -> Vec<CtlReply> {
    let mut out: Vec<CtlReply> = ifaces
        .iter()
        .map(|iface| {
            CtlReply::Interface(ShowInterfaceReply {
                ifindex: iface.ifindex,
                name: iface.name.clone(),
                up: iface.flags.contains(crate::iface::InterfaceFlags::UP),
                nh_reachable: iface.nh_reachable(),
            })
        })
        .collect();
    out.push(CtlReply::End);
    out
}

// IMSG_CTL_SHOW_FIB_TABLES: metadata only, the source explicitly
// reinitializes the route/nexthop trees on its stack copy before
// sending "so as to not leak internal information"; this reply type
// simply never carries the tables to begin with.
pub fn show_fib_tables(reg: &KtableRegistry) -> Vec<CtlReply> {
    let mut out: Vec<CtlReply> = reg
        .iter()
        .filter(|(_, kt)| kt.state != ReconfState::Delete)
        .map(|(_, kt)| {
            CtlReply::FibTable(ShowFibTablesReply {
                rtableid: kt.rtableid,
                nhtableid: kt.nhtableid,
                description: kt.description.clone(),
                fib_sync_enabled: kt.fib_sync_enabled,
                fib_sync_configured: kt.fib_sync_configured,
            })
        })
        .collect();
    out.push(CtlReply::End);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::Prefix;

    fn route(addr: &str, len: u8) -> RouteEntry {
        RouteEntry {
            prefix: Prefix {
                family: AddressFamily::V4,
                addr: addr.parse().unwrap(),
                prefixlen: len,
                scope_id: 0,
                labels: Vec::new(),
            },
            nexthop: "203.0.113.1".parse().unwrap(),
            ifindex: 3,
            priority: 32,
            flags: RouteFlags::empty(),
            route_label: 0,
            mpls_label: None,
        }
    }

    #[test]
    fn show_kroute_is_always_terminated_by_end() {
        let mut reg = KtableRegistry::default();
        reg.new_table(0, 0, "rdomain_0".into(), false);
        let kt = reg.get(0).unwrap();
        let labels = crate::rtlabel::RtLabelTable::default();
        let replies = show_kroute(kt, &labels, None, RouteFlags::empty());
        assert!(matches!(replies.last(), Some(CtlReply::End)));
    }

    #[test]
    fn show_kroute_addr_returns_lowest_priority_only() {
        let mut reg = KtableRegistry::default();
        reg.new_table(0, 0, "rdomain_0".into(), false);
        let kt = reg.get_mut(0).unwrap();
        let mut low = route("192.0.2.0", 24);
        low.priority = 10;
        let mut high = route("192.0.2.0", 24);
        high.priority = 200;
        high.nexthop = "198.51.100.1".parse().unwrap();
        kt.v4.insert(low);
        kt.v4.insert(high);

        let labels = crate::rtlabel::RtLabelTable::default();
        let addr: IpAddr = "192.0.2.0".parse().unwrap();
        let replies = show_kroute_addr(kt, &labels, addr, 24);
        assert_eq!(replies.len(), 2); // one kroute + End
        match &replies[0] {
            CtlReply::Kroute(kr) => assert_eq!(kr.priority, 10),
            _ => panic!("expected a kroute reply"),
        }
    }

    #[test]
    fn show_fib_tables_hides_route_contents() {
        let mut reg = KtableRegistry::default();
        reg.new_table(0, 0, "rdomain_0".into(), false);
        reg.get_mut(0).unwrap().v4.insert(route("192.0.2.0", 24));
        let replies = show_fib_tables(&reg);
        assert_eq!(replies.len(), 2); // one table + End
        match &replies[0] {
            CtlReply::FibTable(t) => assert_eq!(t.rtableid, 0),
            _ => panic!("expected a fib-table reply"),
        }
    }
}
