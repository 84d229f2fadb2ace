//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;

use bitflags::bitflags;
use derive_new::new;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct InterfaceFlags: u8 {
        const UP = 0x01;
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LinkState {
    Up,
    Down,
    Unknown,
}

// One kernel network interface as shadowed locally. `nh_reachable` is
// derived rather than stored, so link-state and flag updates can never
// leave it stale.
#[derive(Clone, Debug, new)]
pub struct InterfaceRecord {
    pub ifindex: u32,
    pub name: String,
    #[new(default)]
    pub flags: InterfaceFlags,
    #[new(value = "LinkState::Unknown")]
    pub link_state: LinkState,
    pub routing_domain: u32,
    #[new(default)]
    pub if_type: u8,
    #[new(default)]
    pub baudrate: u64,
    #[new(default)]
    pub depend_state: bool,
}

impl InterfaceRecord {
    // UP and link state not DOWN; an unknown link state counts as up,
    // matching the source's treatment of media types that never report
    // carrier state.
    pub fn nh_reachable(&self) -> bool {
        self.flags.contains(InterfaceFlags::UP) && self.link_state != LinkState::Down
    }
}

// Index→interface record table. Iteration order is never observed by
// any caller, so a `BTreeMap` keyed by ifindex is used purely for
// deterministic test output, not because ordering is otherwise required.
#[derive(Debug, Default)]
pub struct Interfaces {
    by_ifindex: BTreeMap<u32, InterfaceRecord>,
}

impl Interfaces {
    pub fn insert(&mut self, iface: InterfaceRecord) {
        self.by_ifindex.insert(iface.ifindex, iface);
    }

    // Removes the interface, returning it so the caller can run any
    // dependent-nexthop tracking before it is dropped. The source
    // invokes `nexthop_track(ifindex)` on the owning root table as the
    // very next step after this call; that dependency crosses into the
    // routing-table registry, so it is left to the caller rather than
    // threaded through here.
    pub fn remove(&mut self, ifindex: u32) -> Option<InterfaceRecord> {
        self.by_ifindex.remove(&ifindex)
    }

    pub fn find(&self, ifindex: u32) -> Option<&InterfaceRecord> {
        self.by_ifindex.get(&ifindex)
    }

    pub fn find_mut(&mut self, ifindex: u32) -> Option<&mut InterfaceRecord> {
        self.by_ifindex.get_mut(&ifindex)
    }

    pub fn iter(&self) -> impl Iterator<Item = &InterfaceRecord> {
        self.by_ifindex.values()
    }

    pub fn clear(&mut self) {
        self.by_ifindex.clear();
    }
}

// `validate(iface)`: true iff UP and link state not DOWN.
pub fn validate(iface: &InterfaceRecord) -> bool {
    iface.nh_reachable()
}
