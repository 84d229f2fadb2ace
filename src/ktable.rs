//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

// Routing-table registry (§4.6): one `RoutingTable` per kernel routing
// domain, keyed by rtableid. Tables that only exist to be borrowed for
// nexthop lookups ("rdomain tables") and tables that hold a full BGP
// shadow FIB are both `RoutingTable`s; the distinction is purely
// whether `rtableid == nhtableid` (a root table owns its nexthop
// registrations, a non-root table borrows its root's).

use std::collections::BTreeMap;
use std::net::IpAddr;

use crate::addr::{AddressFamily, Prefix, unspecified};
use crate::error::fatal;
use crate::nexthop::NexthopTable;
use crate::redist::{NetworkStatement, RedistTable, RedistributionKey};
use crate::route::{PRIORITY_MINE, RouteEntry, RouteFlags, RouteMatch, RouteTable};
use crate::rtlabel::RtLabelTable;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReconfState {
    Reinit,
    Keep,
    Delete,
}

// One configured `network ... {static,connected,rtlabel,priority}`
// rule, with the `old` mark used by the preload/postload two-phase
// reload dance to decide whether it survived reconfiguration.
#[derive(Clone, Debug)]
pub struct ConfiguredNetwork {
    pub statement: NetworkStatement,
    // Present only for explicit `default` announcements, which are
    // installed directly rather than matched dynamically.
    pub default_prefix: Option<(IpAddr, u8)>,
    old: bool,
}

pub struct RoutingTable {
    pub rtableid: u32,
    pub nhtableid: u32,
    pub description: String,
    pub v4: RouteTable,
    pub v6: RouteTable,
    // `None` on a non-root table; nexthop lookups are borrowed from the
    // root table addressed by `nhtableid` instead.
    pub nexthops: Option<NexthopTable>,
    pub statements: Vec<ConfiguredNetwork>,
    pub redist: RedistTable,
    pub fib_sync_enabled: bool,
    pub fib_sync_configured: bool,
    pub state: ReconfState,
    nexthop_refcount: i32,
}

impl RoutingTable {
    fn new(rtableid: u32, nhtableid: u32, description: String, fib_sync_configured: bool) -> RoutingTable {
        RoutingTable {
            rtableid,
            nhtableid,
            description,
            v4: RouteTable::default(),
            v6: RouteTable::default(),
            nexthops: if rtableid == nhtableid {
                Some(NexthopTable::default())
            } else {
                None
            },
            statements: Vec::new(),
            redist: RedistTable::default(),
            fib_sync_enabled: fib_sync_configured,
            fib_sync_configured,
            state: ReconfState::Reinit,
            nexthop_refcount: 0,
        }
    }

    fn is_root(&self) -> bool {
        self.rtableid == self.nhtableid
    }
}

#[derive(Debug, Default)]
pub struct KtableRegistry {
    tables: BTreeMap<u32, RoutingTable>,
}

impl KtableRegistry {
    pub fn get(&self, rtableid: u32) -> Option<&RoutingTable> {
        self.tables.get(&rtableid)
    }

    pub fn get_mut(&mut self, rtableid: u32) -> Option<&mut RoutingTable> {
        self.tables.get_mut(&rtableid)
    }

    // §4.6 `ktable_new`: allocates a table, links it to its
    // nexthop-lookup root (bumping that root's refcount — a table
    // rooting itself bumps its own, exactly once), and leaves it in
    // `Reinit` state for the caller to bulk-load (§S.3).
    //
    // Aborts if `rtableid` already has a table, and if `nhtableid`
    // names a table that does not yet exist and is not `rtableid`
    // itself — both are caller invariants upstream (`ktable_update`
    // always creates the rdomain table before its dependents).
    pub fn new_table(
        &mut self,
        rtableid: u32,
        nhtableid: u32,
        description: String,
        fib_sync_configured: bool,
    ) {
        if self.tables.contains_key(&rtableid) {
            fatal("ktable_new: table already exists");
        }
        self.tables.insert(
            rtableid,
            RoutingTable::new(rtableid, nhtableid, description, fib_sync_configured),
        );
        match self.tables.get_mut(&nhtableid) {
            Some(root) => root.nexthop_refcount += 1,
            None => fatal("ktable_new: nexthop-lookup table does not exist"),
        }
    }

    // §4.6 `ktable_update`: reuses an existing table (raising its
    // `fib_sync_configured` preference and clearing a pending delete
    // mark) or creates a new one.
    pub fn update_table(
        &mut self,
        rtableid: u32,
        nhtableid: u32,
        description: String,
        fib_sync_configured: bool,
    ) {
        match self.tables.get_mut(&rtableid) {
            Some(kt) => {
                if kt.state == ReconfState::Delete {
                    kt.fib_sync_configured = fib_sync_configured;
                    kt.state = ReconfState::Keep;
                } else if !kt.fib_sync_configured {
                    kt.fib_sync_configured = fib_sync_configured;
                }
                kt.description = description;
            }
            None => self.new_table(rtableid, nhtableid, description, fib_sync_configured),
        }
    }

    // §4.6 `ktable_free`: decouples from the kernel, releases the
    // nexthop-table reference, and destroys either table once
    // unreferenced (invariant 6).
    pub fn free_table(&mut self, rtableid: u32, mut send_delete: impl FnMut(&RouteEntry) -> bool) {
        let Some(nhtableid) = self.tables.get(&rtableid).map(|kt| kt.nhtableid) else {
            return;
        };
        self.decouple(rtableid, &mut send_delete);

        let root_refcount_after = self
            .tables
            .get_mut(&nhtableid)
            .map(|root| {
                root.nexthop_refcount -= 1;
                root.nexthop_refcount
            })
            .unwrap_or(0);

        if rtableid != nhtableid && root_refcount_after <= 0 {
            self.destroy(nhtableid, &mut send_delete);
        }
        if self
            .tables
            .get(&rtableid)
            .map(|kt| kt.nexthop_refcount <= 0)
            .unwrap_or(false)
        {
            self.destroy(rtableid, &mut send_delete);
        }
    }

    fn destroy(&mut self, rtableid: u32, send_delete: &mut impl FnMut(&RouteEntry) -> bool) {
        self.decouple(rtableid, send_delete);
        self.tables.remove(&rtableid);
    }

    // §4.6 preload: marks every table `delete` and every configured
    // network statement `old`, the first half of the two-phase commit.
    // Configuration reapplication is expected to call `update_table`
    // and re-add surviving statements (clearing their marks) before
    // `postload` runs.
    pub fn preload(&mut self) {
        for kt in self.tables.values_mut() {
            kt.state = ReconfState::Delete;
            for net in &mut kt.statements {
                net.old = true;
            }
        }
    }

    // Marks a configured network statement as still current, either by
    // reusing a matching still-`old` entry or appending a fresh one.
    // Matches `kr_net_find`'s equality key, minus the BGP attribute set
    // that carries policy this crate does not model.
    pub fn reapply_statement(&mut self, rtableid: u32, statement: NetworkStatement, default_prefix: Option<(IpAddr, u8)>) {
        let Some(kt) = self.tables.get_mut(&rtableid) else {
            return;
        };
        if let Some(existing) = kt.statements.iter_mut().find(|n| {
            n.statement.family == statement.family
                && variant_eq(&n.statement.kind, &statement.kind)
                && n.statement.rd == statement.rd
                && n.default_prefix == default_prefix
        }) {
            existing.old = false;
        } else {
            kt.statements.push(ConfiguredNetwork {
                statement,
                default_prefix,
                old: false,
            });
        }
    }

    // §4.6 postload: frees tables still marked `delete`, drops network
    // statements still marked `old` (withdrawing any explicit `default`
    // announcement they held), and for newly `reinit` tables syncs
    // `fib_sync_enabled` to the configured value.
    pub fn postload(&mut self, mut send_delete: impl FnMut(&RouteEntry) -> bool) {
        let stale: Vec<u32> = self
            .tables
            .iter()
            .filter(|(_, kt)| kt.state == ReconfState::Delete)
            .map(|(id, _)| *id)
            .collect();
        for rtableid in stale {
            self.free_table(rtableid, &mut send_delete);
        }

        for kt in self.tables.values_mut() {
            if kt.state == ReconfState::Reinit {
                kt.fib_sync_enabled = kt.fib_sync_configured;
            }
            kt.statements.retain(|net| {
                if net.old {
                    if let Some((addr, prefixlen)) = net.default_prefix {
                        kt.redist.withdraw_static(RedistributionKey {
                            addr,
                            prefixlen,
                            rd: net.statement.rd,
                        });
                    }
                }
                !net.old
            });
        }
    }

    // §4.6 fib-couple: enables FIB sync and (re)installs every
    // daemon-owned route, marking it `bgpd-inserted` on success.
    pub fn couple(&mut self, rtableid: u32, mut send_add: impl FnMut(&RouteEntry) -> bool) {
        let Some(kt) = self.tables.get_mut(&rtableid) else {
            return;
        };
        if kt.fib_sync_enabled {
            return;
        }
        kt.fib_sync_enabled = true;
        install_owned(&mut kt.v4, &mut send_add);
        install_owned(&mut kt.v6, &mut send_add);
    }

    pub fn couple_all(&mut self, mut send_add: impl FnMut(&RouteEntry) -> bool) {
        let ids: Vec<u32> = self.tables.keys().copied().collect();
        for id in ids {
            self.couple(id, &mut send_add);
        }
    }

    fn decouple(&mut self, rtableid: u32, send_delete: &mut impl FnMut(&RouteEntry) -> bool) {
        let Some(kt) = self.tables.get_mut(&rtableid) else {
            return;
        };
        if !kt.fib_sync_enabled {
            return;
        }
        withdraw_inserted(&mut kt.v4, send_delete);
        withdraw_inserted(&mut kt.v6, send_delete);
        kt.fib_sync_enabled = false;
    }

    pub fn decouple_all(&mut self, mut send_delete: impl FnMut(&RouteEntry) -> bool) {
        let ids: Vec<u32> = self.tables.keys().copied().collect();
        for id in ids {
            self.decouple(id, &mut send_delete);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u32, &RoutingTable)> {
        self.tables.iter()
    }
}

// A daemon-originated path, as handed to `RoutingTable::kr_change` by
// the BGP decision process. Always carries priority `PRIORITY_MINE`
// and `BGPD_OWNED`; the caller supplies only what varies per install.
#[derive(Clone, Debug)]
pub struct OwnedRouteSpec {
    pub prefix: Prefix,
    pub nexthop: IpAddr,
    pub ifindex: u32,
    pub flags: RouteFlags,
    pub label: String,
    pub mpls_label: Option<u32>,
}

impl RoutingTable {
    // §4.7 "state machine of an owned route", `kr_change` transition:
    // insert-or-update the owned path, then send RTM_ADD/CHANGE if FIB
    // sync is currently enabled, marking `bgpd-inserted` on success.
    // `fib-sync-enabled == false` still updates the shadow (so a later
    // `couple` picks it up) but sends nothing, per §4.6.
    pub fn kr_change(
        &mut self,
        labels: &mut RtLabelTable,
        spec: OwnedRouteSpec,
        mut send: impl FnMut(&RouteEntry) -> bool,
    ) {
        let family = spec.prefix.family;
        let table = match family {
            AddressFamily::V4 => &mut self.v4,
            _ => &mut self.v6,
        };
        let key = spec.prefix.network();
        let new_label = labels.intern(&spec.label);

        let id = match table.find(&key, PRIORITY_MINE) {
            Some(id) => {
                let old_label = table.get(id).map(|e| e.route_label).unwrap_or(0);
                labels.unref(old_label);
                let entry = table.get_mut(id).expect("id just found");
                let had_dependent = entry.flags.contains(RouteFlags::HAS_NEXTHOP_DEPENDENT);
                entry.nexthop = spec.nexthop;
                entry.ifindex = spec.ifindex;
                entry.flags = spec.flags | RouteFlags::BGPD_OWNED;
                if had_dependent {
                    entry.flags.insert(RouteFlags::HAS_NEXTHOP_DEPENDENT);
                }
                entry.route_label = new_label;
                entry.mpls_label = spec.mpls_label;
                id
            }
            None => {
                let entry = RouteEntry {
                    prefix: spec.prefix,
                    nexthop: spec.nexthop,
                    ifindex: spec.ifindex,
                    priority: PRIORITY_MINE,
                    flags: spec.flags | RouteFlags::BGPD_OWNED,
                    route_label: new_label,
                    mpls_label: spec.mpls_label,
                };
                table.insert(entry).id
            }
        };

        if self.fib_sync_enabled {
            let snapshot = table.get(id).expect("just installed above").clone();
            if send(&snapshot)
                && let Some(entry) = table.get_mut(id)
            {
                entry.flags.insert(RouteFlags::BGPD_INSERTED);
            }
        }
    }

    // §4.7 `kr_delete` / `flush` transition for a single path: send
    // RTM_DELETE if currently installed, then remove the shadow entry
    // and release its label reference regardless of send outcome.
    // Returns false when no owned path exists at `prefix`.
    pub fn kr_delete(
        &mut self,
        labels: &mut RtLabelTable,
        prefix: &Prefix,
        mut send: impl FnMut(&RouteEntry) -> bool,
    ) -> bool {
        let family = prefix.family;
        let table = match family {
            AddressFamily::V4 => &mut self.v4,
            _ => &mut self.v6,
        };
        let template = RouteMatch {
            connected: false,
            ifindex: 0,
            nexthop: unspecified(family),
            scope_id: prefix.scope_id,
        };
        let Ok(removed) = table.remove(prefix, PRIORITY_MINE, true, &template) else {
            return false;
        };
        if removed.entry.flags.contains(RouteFlags::BGPD_INSERTED) {
            send(&removed.entry);
        }
        labels.unref(removed.entry.route_label);
        true
    }

    // §4.7 `flush`: withdraws every daemon-owned path in this table,
    // used on full reload or table teardown.
    pub fn flush(&mut self, labels: &mut RtLabelTable, mut send: impl FnMut(&RouteEntry) -> bool) {
        for family in [AddressFamily::V4, AddressFamily::V6] {
            let table = match family {
                AddressFamily::V4 => &self.v4,
                _ => &self.v6,
            };
            let prefixes: Vec<Prefix> = table
                .iter()
                .filter(|(_, e)| e.flags.contains(RouteFlags::BGPD_OWNED))
                .map(|(_, e)| e.prefix.clone())
                .collect();
            for prefix in prefixes {
                self.kr_delete(labels, &prefix, &mut send);
            }
        }
    }
}

fn install_owned(table: &mut RouteTable, send_add: &mut impl FnMut(&RouteEntry) -> bool) {
    let ids: Vec<_> = table
        .iter()
        .filter(|(_, e)| e.flags.contains(RouteFlags::BGPD_OWNED))
        .map(|(id, _)| id)
        .collect();
    for id in ids {
        let entry = table.get(id).expect("id just collected from this table").clone();
        if send_add(&entry)
            && let Some(entry) = table.get_mut(id)
        {
            entry.flags.insert(RouteFlags::BGPD_INSERTED);
        }
    }
}

fn withdraw_inserted(table: &mut RouteTable, send_delete: &mut impl FnMut(&RouteEntry) -> bool) {
    let ids: Vec<_> = table
        .iter()
        .filter(|(_, e)| e.flags.contains(RouteFlags::BGPD_INSERTED))
        .map(|(id, _)| id)
        .collect();
    for id in ids {
        let entry = table.get(id).expect("id just collected from this table").clone();
        if send_delete(&entry)
            && let Some(entry) = table.get_mut(id)
        {
            entry.flags.remove(RouteFlags::BGPD_INSERTED);
        }
    }
}

fn variant_eq(a: &crate::redist::NetworkStatementKind, b: &crate::redist::NetworkStatementKind) -> bool {
    use crate::redist::NetworkStatementKind::*;
    matches!(
        (a, b),
        (Default, Default) | (Static, Static) | (Connected, Connected)
    ) || matches!((a, b), (RouteLabel(x), RouteLabel(y)) if x == y)
        || matches!((a, b), (Priority(x), Priority(y)) if x == y)
}

// Validates a configured FIB priority against the legal range, per
// `kr_check_prio`: strictly above RTPROT_STATIC (the kernel's own
// static-route protocol id) and strictly below 255 (`PRIORITY_MINE`).
pub fn check_priority(priority: u8) -> bool {
    const RTPROT_STATIC: u8 = 4;
    priority > RTPROT_STATIC && priority < u8::MAX
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::Prefix;

    fn owned_route(addr: &str, len: u8) -> RouteEntry {
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
            priority: 255,
            flags: RouteFlags::BGPD_OWNED,
            route_label: 0,
            mpls_label: None,
        }
    }

    #[test]
    fn root_table_bumps_own_refcount_on_creation() {
        let mut reg = KtableRegistry::default();
        reg.new_table(0, 0, "rdomain_0".into(), false);
        assert!(reg.get(0).unwrap().is_root());
    }

    #[test]
    fn couple_installs_owned_routes_and_marks_inserted() {
        let mut reg = KtableRegistry::default();
        reg.new_table(0, 0, "rdomain_0".into(), false);
        reg.get_mut(0).unwrap().v4.insert(owned_route("192.0.2.0", 24));

        reg.couple(0, |_route| true);
        let kt = reg.get(0).unwrap();
        assert!(kt.fib_sync_enabled);
        let (_, entry) = kt.v4.iter().next().unwrap();
        assert!(entry.flags.contains(RouteFlags::BGPD_INSERTED));
    }

    #[test]
    fn decouple_withdraws_inserted_routes() {
        let mut reg = KtableRegistry::default();
        reg.new_table(0, 0, "rdomain_0".into(), false);
        reg.get_mut(0).unwrap().v4.insert(owned_route("192.0.2.0", 24));
        reg.couple(0, |_| true);

        reg.decouple_all(|_| true);
        let kt = reg.get(0).unwrap();
        assert!(!kt.fib_sync_enabled);
        let (_, entry) = kt.v4.iter().next().unwrap();
        assert!(!entry.flags.contains(RouteFlags::BGPD_INSERTED));
    }

    #[test]
    fn priority_bounds() {
        assert!(!check_priority(4));
        assert!(check_priority(5));
        assert!(check_priority(254));
        assert!(!check_priority(255));
    }

    #[test]
    fn preload_postload_frees_tables_not_reapplied() {
        let mut reg = KtableRegistry::default();
        reg.new_table(0, 0, "rdomain_0".into(), false);
        reg.new_table(1, 0, "vrf1".into(), false);

        reg.preload();
        // Only rdomain 0 survives reconfiguration.
        reg.get_mut(0).unwrap().state = ReconfState::Keep;
        reg.postload(|_| true);

        assert!(reg.get(0).is_some());
        assert!(reg.get(1).is_none());
    }

    #[test]
    fn kr_change_sends_only_while_coupled() {
        let mut reg = KtableRegistry::default();
        reg.new_table(0, 0, "rdomain_0".into(), false);
        let mut labels = RtLabelTable::default();
        let spec = OwnedRouteSpec {
            prefix: Prefix {
                family: AddressFamily::V4,
                addr: "198.51.100.0".parse().unwrap(),
                prefixlen: 24,
                scope_id: 0,
                labels: Vec::new(),
            },
            nexthop: "192.0.2.10".parse().unwrap(),
            ifindex: 3,
            flags: RouteFlags::empty(),
            label: String::new(),
            mpls_label: None,
        };

        let kt = reg.get_mut(0).unwrap();
        let mut sent = 0;
        kt.kr_change(&mut labels, spec.clone(), |_| {
            sent += 1;
            true
        });
        assert_eq!(sent, 0, "no send while decoupled");
        assert_eq!(kt.v4.len(), 1);
        let (_, entry) = kt.v4.iter().next().unwrap();
        assert!(entry.flags.contains(RouteFlags::BGPD_OWNED));
        assert!(!entry.flags.contains(RouteFlags::BGPD_INSERTED));

        kt.fib_sync_enabled = true;
        let mut sent = 0;
        kt.kr_change(&mut labels, spec, |_| {
            sent += 1;
            true
        });
        assert_eq!(sent, 1);
        let (_, entry) = kt.v4.iter().next().unwrap();
        assert!(entry.flags.contains(RouteFlags::BGPD_INSERTED));
    }

    #[test]
    fn kr_delete_sends_only_when_installed_and_frees_label() {
        let mut reg = KtableRegistry::default();
        reg.new_table(0, 0, "rdomain_0".into(), false);
        let mut labels = RtLabelTable::default();
        let prefix = Prefix {
            family: AddressFamily::V4,
            addr: "198.51.100.0".parse().unwrap(),
            prefixlen: 24,
            scope_id: 0,
            labels: Vec::new(),
        };
        let spec = OwnedRouteSpec {
            prefix: prefix.clone(),
            nexthop: "192.0.2.10".parse().unwrap(),
            ifindex: 3,
            flags: RouteFlags::empty(),
            label: "customer-a".into(),
            mpls_label: None,
        };

        let kt = reg.get_mut(0).unwrap();
        kt.fib_sync_enabled = true;
        kt.kr_change(&mut labels, spec, |_| true);
        assert_eq!(labels.refcount(kt.v4.iter().next().unwrap().1.route_label), 1);

        let mut sent = 0;
        let existed = kt.kr_delete(&mut labels, &prefix, |_| {
            sent += 1;
            true
        });
        assert!(existed);
        assert_eq!(sent, 1);
        assert!(kt.v4.is_empty());
        assert_eq!(labels.refcount(1), 0);

        // A second delete of the same (now absent) prefix is a no-op.
        assert!(!kt.kr_delete(&mut labels, &prefix, |_| true));
    }

    #[test]
    fn flush_withdraws_every_owned_route_in_the_table() {
        let mut reg = KtableRegistry::default();
        reg.new_table(0, 0, "rdomain_0".into(), false);
        let mut labels = RtLabelTable::default();
        let kt = reg.get_mut(0).unwrap();
        kt.fib_sync_enabled = true;
        for addr in ["198.51.100.0", "203.0.113.0"] {
            kt.kr_change(
                &mut labels,
                OwnedRouteSpec {
                    prefix: Prefix {
                        family: AddressFamily::V4,
                        addr: addr.parse().unwrap(),
                        prefixlen: 24,
                        scope_id: 0,
                        labels: Vec::new(),
                    },
                    nexthop: "192.0.2.10".parse().unwrap(),
                    ifindex: 3,
                    flags: RouteFlags::empty(),
                    label: String::new(),
                    mpls_label: None,
                },
                |_| true,
            );
        }
        assert_eq!(kt.v4.len(), 2);

        let mut deletes = 0;
        kt.flush(&mut labels, |_| {
            deletes += 1;
            true
        });
        assert_eq!(deletes, 2);
        assert!(kt.v4.is_empty());
    }
}
