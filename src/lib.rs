//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

// Kernel Route Synchronization Core (KRSC): mirrors the host kernel's
// FIB into an in-process shadow, installs/withdraws daemon-owned
// routes, tracks BGP nexthop reachability against the shadow, and
// redistributes kernel-learned routes as candidate BGP announcements.
//
// This crate owns the data model and the reconciliation logic (§1);
// the netlink transport and the IPC sink to the session/RDE processes
// are external collaborators this crate only shapes messages for.

pub mod addr;
pub mod capabilities;
pub mod config;
pub mod error;
pub mod iface;
pub mod ipc;
pub mod ktable;
pub mod netlink;
pub mod nexthop;
pub mod reconcile;
pub mod redist;
pub mod route;
pub mod rtlabel;
pub mod sysctl;

use std::net::IpAddr;

use tracing::{debug, warn};

use crate::addr::AddressFamily;
use crate::iface::Interfaces;
use crate::ktable::{KtableRegistry, RoutingTable};
use crate::netlink::InboundMessage;
use crate::nexthop::NexthopTable;
use crate::reconcile::{self, LinkUpdate, MsgType, RouteUpdate};
use crate::rtlabel::RtLabelTable;

pub use crate::ipc::IpcEvent;

/// Main routing-table id: the first root table, created unconditionally
/// at startup (`rtableid == nhtableid == 0`) regardless of whether any
/// VRF is configured.
pub const MAIN_RTABLEID: u32 = 0;

// §5: the shared process-wide state the entire KRSC runs against —
// every table, the interface set, the route-label interner, and the
// monotonic sequence counter used to correlate dump queries. A single
// cooperative loop owns this; nothing here is shared across threads.
pub struct Context {
    pub tables: KtableRegistry,
    pub ifaces: Interfaces,
    pub labels: RtLabelTable,
    pid: u32,
    seq: u32,
    // The sequence number of an in-flight bulk dump query, if any;
    // `None` once the dump's terminating reply has been seen. While
    // set, inbound messages carrying our own pid are not filtered as
    // self-echoes (§S.3) — a dump reply is never "from self" even when
    // it happens to carry our port id.
    active_dump: Option<u32>,
}

impl Context {
    pub fn new(pid: u32) -> Context {
        let mut tables = KtableRegistry::default();
        tables.new_table(MAIN_RTABLEID, MAIN_RTABLEID, "main".to_string(), false);
        Context {
            tables,
            ifaces: Interfaces::default(),
            labels: RtLabelTable::default(),
            pid,
            seq: 0,
            active_dump: None,
        }
    }

    // §5: process-wide monotonic sequence counter; zero is reserved, so
    // increments skip it on wrap.
    pub fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1);
        if self.seq == 0 {
            self.seq = 1;
        }
        self.seq
    }

    pub fn begin_dump(&mut self) -> u32 {
        let seq = self.next_seq();
        self.active_dump = Some(seq);
        seq
    }

    pub fn end_dump(&mut self) {
        self.active_dump = None;
    }

    // Dispatches one already-parsed inbound netlink message (§4.7),
    // filtering self-echoes first and routing route/link traffic to
    // the reconciler. Returns the outward-facing events the IPC sink
    // should forward.
    pub fn dispatch(&mut self, envelope: netlink::Envelope, msg: InboundMessage) -> Vec<IpcEvent> {
        if reconcile::is_self_echo(envelope.pid, envelope.seq, self.pid, self.active_dump) {
            return Vec::new();
        }

        match msg {
            InboundMessage::RouteAdd { table, msg_type, mpath, update } => {
                self.fib_change(table, update, msg_type, mpath)
            }
            InboundMessage::RouteDel { table, mpath, update } => self.fib_delete(table, update, mpath),
            InboundMessage::Link(update) => self.link_change(update),
            InboundMessage::LinkDel(ifindex) => self.link_delete(ifindex),
            InboundMessage::Ignored => Vec::new(),
        }
    }

    fn fib_change(&mut self, raw_table: u32, msg: RouteUpdate, msg_type: MsgType, mpath: bool) -> Vec<IpcEvent> {
        let Some(rtableid) = reconcile::normalize_table(raw_table) else {
            return Vec::new();
        };
        if self.tables.get(rtableid).is_none() {
            // UnknownTable: too noisy to log during reloads (§7).
            return Vec::new();
        }
        with_table_and_nexthops(&mut self.tables, rtableid, |kt, nexthops, ifaces| {
            reconcile::fib_change(kt, nexthops, ifaces, msg, msg_type, mpath)
        }, &self.ifaces)
        .into_iter()
        .map(IpcEvent::from)
        .collect()
    }

    fn fib_delete(&mut self, raw_table: u32, msg: RouteUpdate, mpath: bool) -> Vec<IpcEvent> {
        let Some(rtableid) = reconcile::normalize_table(raw_table) else {
            return Vec::new();
        };
        if self.tables.get(rtableid).is_none() {
            return Vec::new();
        }
        with_table_and_nexthops(&mut self.tables, rtableid, |kt, nexthops, ifaces| {
            reconcile::fib_delete(kt, nexthops, ifaces, msg, mpath)
        }, &self.ifaces)
        .into_iter()
        .map(IpcEvent::from)
        .collect()
    }

    fn link_change(&mut self, msg: LinkUpdate) -> Vec<IpcEvent> {
        debug!(ifindex = msg.ifindex, "processing link update");
        let rtableid = msg.routing_domain;
        with_ifaces_and_nexthops(&mut self.tables, &mut self.ifaces, rtableid, |ifaces, nexthops, v4, v6| {
            reconcile::link_change(ifaces, nexthops, v4, v6, msg)
        })
        .into_iter()
        .map(reconcile::ReconcileEvent::Nexthop)
        .map(IpcEvent::from)
        .collect()
    }

    fn link_delete(&mut self, ifindex: u32) -> Vec<IpcEvent> {
        let Some(rtableid) = self.ifaces.find(ifindex).map(|i| i.routing_domain) else {
            return Vec::new();
        };
        with_ifaces_and_nexthops(&mut self.tables, &mut self.ifaces, rtableid, |ifaces, nexthops, v4, v6| {
            reconcile::link_delete(ifaces, nexthops, v4, v6, ifindex)
        })
        .into_iter()
        .map(reconcile::ReconcileEvent::Nexthop)
        .map(IpcEvent::from)
        .collect()
    }

    // §4.5/§6: looks up a route covering `addr` with priority "any" in
    // `rtableid`'s shadow FIB, mirroring the non-installing half of
    // `resolve_true_nexthop` for diagnostic callers outside the
    // resolver itself.
    pub fn longest_match(&self, rtableid: u32, addr: IpAddr) -> bool {
        let Some(kt) = self.tables.get(rtableid) else {
            return false;
        };
        let table = match AddressFamily::of(&addr) {
            AddressFamily::V4 => &kt.v4,
            _ => &kt.v6,
        };
        table.longest_match(addr, AddressFamily::of(&addr).max_prefixlen()).is_some()
    }
}

// Link events need `&mut Interfaces` (the record itself is created or
// updated here) alongside a borrowed root `NexthopTable`, which
// `with_table_and_nexthops` cannot provide since it only hands out a
// shared `&Interfaces` for the route-message path. `rtableid` naming no
// registered table is normal for a link in a routing domain with no BGP
// shadow FIB; the interface mutation still needs to happen, just
// without any nexthop to re-track, so the call is a no-op in that case.
fn with_ifaces_and_nexthops<R: Default>(
    tables: &mut KtableRegistry,
    ifaces: &mut Interfaces,
    rtableid: u32,
    f: impl FnOnce(&mut Interfaces, &mut NexthopTable, &mut crate::route::RouteTable, &mut crate::route::RouteTable) -> R,
) -> R {
    let Some(nhtableid) = tables.get(rtableid).map(|kt| kt.nhtableid) else {
        return R::default();
    };
    let Some(mut nexthops) = tables.get_mut(nhtableid).and_then(|root| root.nexthops.take()) else {
        return R::default();
    };
    let result = match tables.get_mut(rtableid) {
        Some(kt) => f(ifaces, &mut nexthops, &mut kt.v4, &mut kt.v6),
        None => R::default(),
    };
    if let Some(root) = tables.get_mut(nhtableid) {
        root.nexthops = Some(nexthops);
    }
    result
}

// §3's root/non-root split means a non-root table's nexthop lookups
// live on a different `RoutingTable` in the same registry. Safe Rust
// cannot hand out two simultaneous `&mut` borrows into one `BTreeMap`
// for different keys, so the nexthop table is temporarily taken out of
// its owner, operated on alongside the target table, and put back —
// the same "detach, mutate, reattach" shape `NexthopTable::validate`
// itself uses for the back-reference flag.
fn with_table_and_nexthops<R: Default>(
    tables: &mut KtableRegistry,
    rtableid: u32,
    f: impl FnOnce(&mut RoutingTable, &mut NexthopTable, &Interfaces) -> R,
    ifaces: &Interfaces,
) -> R {
    let Some(nhtableid) = tables.get(rtableid).map(|kt| kt.nhtableid) else {
        warn!(rtableid, "dispatch against an unregistered routing table");
        return R::default();
    };
    let Some(mut nexthops) = tables.get_mut(nhtableid).and_then(|root| root.nexthops.take()) else {
        return R::default();
    };
    let result = match tables.get_mut(rtableid) {
        Some(kt) => f(kt, &mut nexthops, ifaces),
        None => R::default(),
    };
    if let Some(root) = tables.get_mut(nhtableid) {
        root.nexthops = Some(nexthops);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::Prefix;
    use crate::route::RouteFlags;

    #[test]
    fn context_seq_skips_zero_on_wrap() {
        let mut ctx = Context::new(1234);
        ctx.seq = u32::MAX;
        assert_eq!(ctx.next_seq(), 1);
    }

    #[test]
    fn dispatch_ignores_self_echo_outside_dump_window() {
        let mut ctx = Context::new(42);
        let msg = InboundMessage::RouteAdd {
            table: reconcile::RT_TABLE_MAIN,
            msg_type: MsgType::Add,
            mpath: false,
            update: RouteUpdate {
                prefix: Prefix {
                    family: AddressFamily::V4,
                    addr: "192.0.2.0".parse().unwrap(),
                    prefixlen: 24,
                    scope_id: 0,
                    labels: Vec::new(),
                },
                nexthop: Some("203.0.113.1".parse().unwrap()),
                ifindex: 3,
                priority: 32,
                flags: RouteFlags::empty(),
                route_label: 0,
                mpls_label: None,
            },
        };
        let envelope = netlink::Envelope { pid: 42, seq: 1 };
        let events = ctx.dispatch(envelope, msg);
        assert!(events.is_empty());
        assert!(ctx.tables.get(MAIN_RTABLEID).unwrap().v4.is_empty());
    }

    #[test]
    fn dispatch_learns_route_from_a_non_self_peer() {
        let mut ctx = Context::new(42);
        let msg = InboundMessage::RouteAdd {
            table: reconcile::RT_TABLE_MAIN,
            msg_type: MsgType::Add,
            mpath: false,
            update: RouteUpdate {
                prefix: Prefix {
                    family: AddressFamily::V4,
                    addr: "192.0.2.0".parse().unwrap(),
                    prefixlen: 24,
                    scope_id: 0,
                    labels: Vec::new(),
                },
                nexthop: Some("203.0.113.1".parse().unwrap()),
                ifindex: 3,
                priority: 32,
                flags: RouteFlags::empty(),
                route_label: 0,
                mpls_label: None,
            },
        };
        let envelope = netlink::Envelope { pid: 7, seq: 1 };
        ctx.dispatch(envelope, msg);
        assert_eq!(ctx.tables.get(MAIN_RTABLEID).unwrap().v4.len(), 1);
    }
}
