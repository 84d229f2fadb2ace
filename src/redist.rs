//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

// Redistribution filter: matches non-daemon-owned routes against a
// configured list of network statements and maintains the set of keys
// currently announced as candidate BGP routes. A key can be announced
// dynamically (it matched a statement) or statically (configured as a
// literal network); a static announcement always wins a collision with
// a dynamic one for the same key.

use std::collections::BTreeMap;
use std::net::IpAddr;

use crate::addr::{AddressFamily, IpAddrExt, Prefix};
use crate::route::{RouteEntry, RouteFlags};

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct RedistributionKey {
    pub addr: IpAddr,
    pub prefixlen: u8,
    pub rd: u64,
}

#[derive(Clone, Copy, Debug)]
pub struct RedistEntry {
    pub dynamic: bool,
}

#[derive(Clone, Copy, Debug)]
pub enum NetworkStatementKind {
    // Matched elsewhere (explicit configuration), never by this filter.
    Default,
    Static,
    Connected,
    RouteLabel(u16),
    Priority(u8),
}

#[derive(Clone, Copy, Debug)]
pub struct NetworkStatement {
    pub family: AddressFamily,
    pub kind: NetworkStatementKind,
    pub rd: u64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RedistEvent {
    Add,
    Remove,
}

#[derive(Debug, Default)]
pub struct RedistTable {
    keys: BTreeMap<RedistributionKey, RedistEntry>,
}

impl RedistTable {
    // §4.5: on remove, drop the key only if it is marked dynamic,
    // mirroring `kr_net_redist_del(kt, net, /* dynamic */ 1)` being the
    // only caller reachable from withdrawal paths.
    pub fn withdraw_dynamic(&mut self, key: RedistributionKey) -> bool {
        self.redist_del(key, true)
    }

    // Used when an explicit (non-dynamic) `default` network statement
    // is torn down during config reload, mirroring the
    // `kr_net_redist_del(kt, &n->net, 0)` call in `kr_net_clear`.
    pub fn withdraw_static(&mut self, key: RedistributionKey) -> bool {
        self.redist_del(key, false)
    }

    // Counterpart used when an explicit `default` network statement is
    // applied directly, bypassing `net_match` entirely.
    pub fn announce_static(&mut self, key: RedistributionKey) -> bool {
        self.redist_add(key, false)
    }

    // §4.5 full add path: rejects daemon-owned routes, unroutable or
    // non-unicast sources, the default route, and unsupported families,
    // then matches the remaining candidate against `statements` and
    // inserts-or-updates a dynamic RedistributionKey on the first hit.
    // Returns the event to emit, if any: a match announces `Add`; a
    // route that no longer matches anything it previously matched is
    // withdrawn with `Remove`.
    pub fn redistribute(
        &mut self,
        route: &RouteEntry,
        statements: &[NetworkStatement],
    ) -> Option<RedistEvent> {
        if route.flags.contains(RouteFlags::BGPD_OWNED) {
            return None;
        }
        if !is_redistributable_source(&route.prefix) {
            return None;
        }
        // Never allow the default route to be redistributed dynamically;
        // it can only reach BGP via an explicit `default` statement,
        // which this filter never dynamic-matches (see below).
        if route.prefix.prefixlen == 0 {
            return None;
        }

        let key = RedistributionKey {
            addr: route.prefix.addr,
            prefixlen: route.prefix.prefixlen,
            rd: 0,
        };
        let nexthop_on_loopback = route.nexthop.is_loopback();

        if net_match(route, statements, nexthop_on_loopback) {
            if self.redist_add(key, true) {
                Some(RedistEvent::Add)
            } else {
                None
            }
        } else if self.withdraw_dynamic(key) {
            Some(RedistEvent::Remove)
        } else {
            None
        }
    }

    // Mirrors `kr_net_redist_add`: a fresh key is inserted outright. A
    // collision where the incoming announcement is dynamic and the
    // existing one is not leaves the existing (static) entry untouched
    // and reports no redistribution. Any other collision (equal
    // dynamic-ness, or the incoming announcement being non-dynamic)
    // resets the stored dynamic flag and redistributes.
    fn redist_add(&mut self, key: RedistributionKey, dynamic: bool) -> bool {
        match self.keys.get_mut(&key) {
            Some(existing) => {
                if dynamic && !existing.dynamic {
                    return false;
                }
                existing.dynamic = dynamic;
                true
            }
            None => {
                self.keys.insert(key, RedistEntry { dynamic });
                true
            }
        }
    }

    // Mirrors `kr_net_redist_del`: only removes the entry when it is
    // present and its dynamic flag matches; a static entry is never
    // dropped by a dynamic-withdrawal call.
    fn redist_del(&mut self, key: RedistributionKey, dynamic: bool) -> bool {
        match self.keys.get(&key) {
            Some(entry) if entry.dynamic == dynamic => {
                self.keys.remove(&key);
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, key: &RedistributionKey) -> bool {
        self.keys.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RedistributionKey, &RedistEntry)> {
        self.keys.iter()
    }

    pub fn clear(&mut self) {
        self.keys.clear();
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

// §4.5 rejection list: the daemon-owned check happens in the caller
// (it needs the route's flags, not just its prefix); this covers the
// per-family unroutable-source checks plus the family gate.
fn is_redistributable_source(prefix: &Prefix) -> bool {
    match prefix.family {
        AddressFamily::V4 | AddressFamily::V6 => prefix.addr.is_routable(),
        _ => false,
    }
}

// Walks the configured NetworkStatements looking for the first one the
// route satisfies. `default` statements are never dynamic-matched here
// (an explicit default announcement bypasses this filter entirely).
fn net_match(route: &RouteEntry, statements: &[NetworkStatement], nexthop_on_loopback: bool) -> bool {
    for stmt in statements {
        if stmt.family != route.prefix.family {
            continue;
        }
        let matched = match stmt.kind {
            NetworkStatementKind::Default => false,
            NetworkStatementKind::Static => {
                !nexthop_on_loopback && route.flags.contains(RouteFlags::STATIC)
            }
            NetworkStatementKind::Connected => {
                !nexthop_on_loopback && route.flags.contains(RouteFlags::CONNECTED)
            }
            NetworkStatementKind::RouteLabel(id) => route.route_label == id,
            NetworkStatementKind::Priority(priority) => route.priority == priority,
        };
        if matched {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::addr::AddressFamily;

    fn route(addr: &str, len: u8, nexthop: &str, flags: RouteFlags) -> RouteEntry {
        RouteEntry {
            prefix: Prefix {
                family: AddressFamily::V4,
                addr: addr.parse().unwrap(),
                prefixlen: len,
                scope_id: 0,
                labels: Vec::new(),
            },
            nexthop: nexthop.parse().unwrap(),
            ifindex: 3,
            priority: 32,
            flags,
            route_label: 0,
            mpls_label: None,
        }
    }

    #[test]
    fn default_route_never_redistributed() {
        let mut table = RedistTable::default();
        let statements = [NetworkStatement {
            family: AddressFamily::V4,
            kind: NetworkStatementKind::Static,
            rd: 0,
        }];
        let r = route("0.0.0.0", 0, "192.0.2.1", RouteFlags::STATIC);
        assert_eq!(table.redistribute(&r, &statements), None);
        assert!(table.is_empty());
    }

    #[test]
    fn static_match_is_announced() {
        let mut table = RedistTable::default();
        let statements = [NetworkStatement {
            family: AddressFamily::V4,
            kind: NetworkStatementKind::Static,
            rd: 0,
        }];
        let r = route("192.0.2.0", 24, "203.0.113.1", RouteFlags::STATIC);
        assert_eq!(table.redistribute(&r, &statements), Some(RedistEvent::Add));
        let key = RedistributionKey {
            addr: Ipv4Addr::new(192, 0, 2, 0).into(),
            prefixlen: 24,
            rd: 0,
        };
        assert!(table.contains(&key));
    }

    #[test]
    fn loopback_nexthop_disqualifies_static_and_connected() {
        let mut table = RedistTable::default();
        let statements = [NetworkStatement {
            family: AddressFamily::V4,
            kind: NetworkStatementKind::Connected,
            rd: 0,
        }];
        let r = route("192.0.2.0", 24, "127.0.0.1", RouteFlags::CONNECTED);
        assert_eq!(table.redistribute(&r, &statements), None);
    }

    #[test]
    fn static_announcement_beats_dynamic_collision() {
        let mut table = RedistTable::default();
        let key = RedistributionKey {
            addr: Ipv4Addr::new(192, 0, 2, 0).into(),
            prefixlen: 24,
            rd: 0,
        };
        assert!(table.redist_add(key, false));
        assert!(!table.redist_add(key, true));
        assert!(!table.keys.get(&key).unwrap().dynamic);
    }

    #[test]
    fn no_longer_matching_route_is_withdrawn() {
        let mut table = RedistTable::default();
        let key = RedistributionKey {
            addr: Ipv4Addr::new(192, 0, 2, 0).into(),
            prefixlen: 24,
            rd: 0,
        };
        table.redist_add(key, true);
        let statements: [NetworkStatement; 0] = [];
        let r = route("192.0.2.0", 24, "203.0.113.1", RouteFlags::STATIC);
        assert_eq!(table.redistribute(&r, &statements), Some(RedistEvent::Remove));
        assert!(table.is_empty());
    }

    #[test]
    fn multicast_and_loopback_sources_are_rejected() {
        let mut table = RedistTable::default();
        let statements = [NetworkStatement {
            family: AddressFamily::V4,
            kind: NetworkStatementKind::Connected,
            rd: 0,
        }];
        let mcast = route("224.0.0.0", 24, "203.0.113.1", RouteFlags::CONNECTED);
        assert_eq!(table.redistribute(&mcast, &statements), None);
        let lo = route("127.0.0.0", 8, "203.0.113.1", RouteFlags::CONNECTED);
        assert_eq!(table.redistribute(&lo, &statements), None);
    }
}
