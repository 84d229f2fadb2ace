//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

// Ordered route indexes over (prefix, prefixlen, priority), with a
// multipath list per key. The source threads multipath entries through
// a singly-linked list rooted at the RB-tree head and reinserts the
// successor into the tree when the head is removed; here each key maps
// directly to an ordered `Vec` of arena ids, which keeps insertion
// order trivial and removes the reinsertion dance entirely.

use std::collections::BTreeMap;
use std::net::IpAddr;

use bitflags::bitflags;
use generational_arena::{Arena, Index};
use ipnetwork::IpNetwork;

use crate::addr::Prefix;
use crate::error::{Error, multipath_corruption, not_found};

pub type RouteId = Index;

// Priority 0 is the wildcard "any" sentinel used only in lookups, never
// stored on a real entry. Priority 255 marks daemon-originated routes.
pub const PRIORITY_ANY: u8 = 0x00;
pub const PRIORITY_MINE: u8 = 0xff;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct RouteFlags: u16 {
        const CONNECTED             = 0x0001;
        const BLACKHOLE             = 0x0002;
        const REJECT                = 0x0004;
        const STATIC                = 0x0008;
        const BGPD_OWNED            = 0x0010;
        const BGPD_INSERTED         = 0x0020;
        const MPLS                  = 0x0040;
        const HAS_NEXTHOP_DEPENDENT = 0x0080;
    }
}

#[derive(Clone, Debug)]
pub struct RouteEntry {
    pub prefix: Prefix,
    pub nexthop: IpAddr,
    pub ifindex: u32,
    pub priority: u8,
    pub flags: RouteFlags,
    pub route_label: u16,
    pub mpls_label: Option<u32>,
}

impl RouteEntry {
    pub fn has_dependent(&self) -> bool {
        self.flags.contains(RouteFlags::HAS_NEXTHOP_DEPENDENT)
    }
}

// Template used to narrow a multipath chain down to one gateway, as
// `match_gw` does in the source.
#[derive(Clone, Copy, Debug)]
pub struct RouteMatch {
    pub connected: bool,
    pub ifindex: u32,
    pub nexthop: IpAddr,
    pub scope_id: u32,
}

pub struct InsertOutcome {
    pub id: RouteId,
    pub multipath: bool,
}

pub struct RemovedRoute {
    pub entry: RouteEntry,
    pub id: RouteId,
    // Whether other entries remain at the same (prefix, prefixlen,
    // priority) key after this removal.
    pub sibling_remains: bool,
    // Whether the (prefix, prefixlen) key has no entries left at *any*
    // priority, i.e. redistribution withdrawal is due.
    pub key_exhausted: bool,
}

type PriorityChains = BTreeMap<u8, Vec<RouteId>>;

#[derive(Debug, Default)]
pub struct RouteTable {
    arena: Arena<RouteEntry>,
    index: BTreeMap<IpNetwork, PriorityChains>,
}

impl RouteTable {
    pub fn get(&self, id: RouteId) -> Option<&RouteEntry> {
        self.arena.get(id)
    }

    pub fn get_mut(&mut self, id: RouteId) -> Option<&mut RouteEntry> {
        self.arena.get_mut(id)
    }

    // Returns the head of the multipath chain for (prefix, prefixlen,
    // priority). Priority "any" walks to the lowest-priority chain
    // sharing the same (prefix, prefixlen).
    pub fn find(&self, key: &IpNetwork, priority: u8) -> Option<RouteId> {
        let chains = self.index.get(key)?;
        if priority == PRIORITY_ANY {
            chains.values().next().and_then(|chain| chain.first().copied())
        } else {
            chains.get(&priority).and_then(|chain| chain.first().copied())
        }
    }

    // Walks the chain at (key, priority) looking for the entry matching
    // `template`: by ifindex when the template is connected, otherwise
    // by nexthop equality (v6 additionally compares scope id).
    pub fn match_gw(
        &self,
        key: &IpNetwork,
        priority: u8,
        template: &RouteMatch,
    ) -> Option<RouteId> {
        let chain = self.index.get(key)?.get(&priority)?;
        chain.iter().copied().find(|&id| {
            let entry = &self.arena[id];
            if template.connected {
                entry.ifindex == template.ifindex
            } else {
                entry.nexthop == template.nexthop
                    && (entry.prefix.family != crate::addr::AddressFamily::V6
                        || entry.prefix.scope_id == template.scope_id)
            }
        })
    }

    // Allocates a RouteEntry and attempts index insertion; on a
    // collision at the same (prefix, prefixlen, priority) the new
    // entry is appended to the tail of the existing chain, becoming a
    // multipath sibling rather than the head.
    pub fn insert(&mut self, entry: RouteEntry) -> InsertOutcome {
        let key = entry.prefix.network();
        let priority = entry.priority;
        let id = self.arena.insert(entry);
        let chain = self.index.entry(key).or_default().entry(priority).or_default();
        let multipath = !chain.is_empty();
        chain.push(id);
        InsertOutcome { id, multipath }
    }

    // Locates the target entry via `find`/`match_gw`, unlinks it from
    // its chain (the `Vec` ordering means the successor becomes the new
    // first element automatically, with no reinsertion step needed),
    // and reports whether siblings remain at that priority and whether
    // the (prefix, prefixlen) key is now empty at every priority.
    pub fn remove(
        &mut self,
        prefix: &Prefix,
        priority: u8,
        any: bool,
        template: &RouteMatch,
    ) -> Result<RemovedRoute, Error> {
        let key = prefix.network();
        let head_id = self
            .find(&key, priority)
            .ok_or_else(|| not_found(key, priority))?;
        let actual_priority = self.arena[head_id].priority;

        let target_id = if any {
            head_id
        } else {
            self.match_gw(&key, actual_priority, template)
                .ok_or_else(|| not_found(key, actual_priority))?
        };

        let chains = self.index.get_mut(&key).expect("key present, just found it");
        let chain = chains
            .get_mut(&actual_priority)
            .ok_or_else(|| multipath_corruption(key, actual_priority))?;
        let pos = chain
            .iter()
            .position(|&id| id == target_id)
            .ok_or_else(|| multipath_corruption(key, actual_priority))?;
        chain.remove(pos);

        let sibling_remains = !chain.is_empty();
        if chain.is_empty() {
            chains.remove(&actual_priority);
        }
        let key_exhausted = chains.is_empty();
        if key_exhausted {
            self.index.remove(&key);
        }

        let entry = self
            .arena
            .remove(target_id)
            .expect("id was just located in the index");

        Ok(RemovedRoute {
            entry,
            id: target_id,
            sibling_remains,
            key_exhausted,
        })
    }

    // Every registered nexthop address whose prefix falls within the
    // given (prefix, prefixlen) is revalidated by the caller; this just
    // exposes an iterator over ids sharing that exact key, used by the
    // "nexthop revalidation" trigger on insert.
    pub fn ids_at(&self, key: &IpNetwork) -> impl Iterator<Item = RouteId> + '_ {
        self.index
            .get(key)
            .into_iter()
            .flat_map(|chains| chains.values())
            .flat_map(|chain| chain.iter().copied())
    }

    // Iterative longest-prefix-match: masks the address at decreasing
    // lengths and looks up the exact key, returning the first hit at
    // priority "any" (i.e. the lowest-priority route for that key).
    pub fn longest_match(&self, addr: IpAddr, max_len: u8) -> Option<RouteId> {
        for len in (0..=max_len).rev() {
            let masked = crate::addr::apply_mask(addr, len);
            let key = IpNetwork::new(masked, len).ok()?;
            if let Some(id) = self.find(&key, PRIORITY_ANY) {
                return Some(id);
            }
        }
        None
    }

    pub fn iter(&self) -> impl Iterator<Item = (RouteId, &RouteEntry)> {
        self.arena.iter()
    }

    // Iteratively removes the minimum head until the table is empty.
    pub fn clear(&mut self) {
        self.index.clear();
        self.arena.clear();
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::addr::AddressFamily;

    fn route(addr: &str, len: u8, nexthop: &str, ifindex: u32, priority: u8) -> RouteEntry {
        RouteEntry {
            prefix: Prefix {
                family: AddressFamily::V4,
                addr: addr.parse().unwrap(),
                prefixlen: len,
                scope_id: 0,
                labels: Vec::new(),
            },
            nexthop: nexthop.parse().unwrap(),
            ifindex,
            priority,
            flags: RouteFlags::empty(),
            route_label: 0,
            mpls_label: None,
        }
    }

    #[test]
    fn multipath_chain_preserves_order_on_head_removal() {
        let mut table = RouteTable::default();
        let r1 = route("10.0.0.0", 24, "192.0.2.1", 3, 32);
        let r2 = route("10.0.0.0", 24, "192.0.2.2", 4, 32);
        let out1 = table.insert(r1.clone());
        assert!(!out1.multipath);
        let out2 = table.insert(r2.clone());
        assert!(out2.multipath);

        let key = IpNetwork::new(Ipv4Addr::new(10, 0, 0, 0).into(), 24).unwrap();
        assert_eq!(table.find(&key, 32), Some(out1.id));

        let template = RouteMatch {
            connected: false,
            ifindex: 3,
            nexthop: "192.0.2.1".parse().unwrap(),
            scope_id: 0,
        };
        let removed = table.remove(&r1.prefix, 32, false, &template).unwrap();
        assert_eq!(removed.id, out1.id);
        assert!(!removed.key_exhausted);
        assert_eq!(table.find(&key, 32), Some(out2.id));
    }

    #[test]
    fn removing_sole_entry_exhausts_key() {
        let mut table = RouteTable::default();
        let r1 = route("10.0.0.0", 24, "192.0.2.1", 3, 32);
        let out1 = table.insert(r1.clone());
        let template = RouteMatch {
            connected: false,
            ifindex: 3,
            nexthop: "192.0.2.1".parse().unwrap(),
            scope_id: 0,
        };
        let removed = table.remove(&r1.prefix, 32, true, &template).unwrap();
        assert_eq!(removed.id, out1.id);
        assert!(removed.key_exhausted);
        assert!(table.is_empty());
    }

    #[test]
    fn any_priority_finds_lowest() {
        let mut table = RouteTable::default();
        let low = table.insert(route("10.0.0.0", 24, "192.0.2.1", 3, 10));
        let _high = table.insert(route("10.0.0.0", 24, "192.0.2.2", 4, 200));
        let key = IpNetwork::new(Ipv4Addr::new(10, 0, 0, 0).into(), 24).unwrap();
        assert_eq!(table.find(&key, PRIORITY_ANY), Some(low.id));
    }

    #[test]
    fn longest_match_picks_most_specific() {
        let mut table = RouteTable::default();
        table.insert(route("0.0.0.0", 0, "203.0.113.1", 5, 32));
        let connected = table.insert(route("192.0.2.0", 24, "0.0.0.0", 3, 32));
        let addr: IpAddr = "192.0.2.10".parse().unwrap();
        assert_eq!(table.longest_match(addr, 32), Some(connected.id));
    }
}
