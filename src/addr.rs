//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

// Address-family-tagged prefix and nexthop primitives, masking helpers,
// and the classful/contiguous-mask derivations inherited from the BSD
// routing socket world that the netlink attribute encoding still has to
// interoperate with.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

use crate::error::fatal;

pub type MplsLabel = u32;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum AddressFamily {
    V4,
    V6,
    VpnV4,
    VpnV6,
    Unspec,
}

impl AddressFamily {
    pub fn of(addr: &IpAddr) -> AddressFamily {
        match addr {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        }
    }

    pub fn is_vpn(&self) -> bool {
        matches!(self, AddressFamily::VpnV4 | AddressFamily::VpnV6)
    }

    pub fn max_prefixlen(&self) -> u8 {
        match self {
            AddressFamily::V4 | AddressFamily::VpnV4 => 32,
            AddressFamily::V6 | AddressFamily::VpnV6 => 128,
            AddressFamily::Unspec => 0,
        }
    }
}

// The all-zeros address for a family, used wherever a route's nexthop
// is absent (a connected route) and a concrete `IpAddr` is still needed
// to populate `RouteEntry.nexthop`.
pub fn unspecified(family: AddressFamily) -> IpAddr {
    match family {
        AddressFamily::V6 | AddressFamily::VpnV6 => Ipv6Addr::UNSPECIFIED.into(),
        _ => Ipv4Addr::UNSPECIFIED.into(),
    }
}

// A single reachability target: an address-family tag, the raw address,
// a prefix length, a v6 scope id, and an optional MPLS label stack for
// the VPN families. Ordinary (non-VPN) prefixes always carry an empty
// label stack.
#[derive(Clone, Debug, PartialEq)]
pub struct Prefix {
    pub family: AddressFamily,
    pub addr: IpAddr,
    pub prefixlen: u8,
    pub scope_id: u32,
    pub labels: Vec<MplsLabel>,
}

impl Prefix {
    pub fn new(addr: IpAddr, prefixlen: u8) -> Prefix {
        Prefix {
            family: AddressFamily::of(&addr),
            addr,
            prefixlen,
            scope_id: 0,
            labels: Vec::new(),
        }
    }

    // Truncates the prefix to `n` bits, zero-filling the tail.
    pub fn mask(&self, n: u8) -> Prefix {
        Prefix {
            addr: apply_mask(self.addr, n),
            prefixlen: n,
            ..self.clone()
        }
    }

    pub fn network(&self) -> IpNetwork {
        IpNetwork::new(self.addr, self.prefixlen)
            .expect("prefixlen already validated against the address family")
    }
}

// Zero-fills every bit past position `n` (0-indexed from the network's
// most significant bit). Equivalent to the source's in-place `mask()`.
pub fn apply_mask(addr: IpAddr, n: u8) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => IpAddr::V4(apply_mask4(v4, n)),
        IpAddr::V6(v6) => IpAddr::V6(apply_mask6(v6, n)),
    }
}

fn apply_mask4(addr: Ipv4Addr, n: u8) -> Ipv4Addr {
    let n = n.min(32);
    let bits = u32::from(addr);
    let masked = if n == 0 { 0 } else { bits & (u32::MAX << (32 - n)) };
    Ipv4Addr::from(masked)
}

fn apply_mask6(addr: Ipv6Addr, n: u8) -> Ipv6Addr {
    let n = n.min(128);
    let bits = u128::from(addr);
    let masked = if n == 0 { 0 } else { bits & (u128::MAX << (128 - n)) };
    Ipv6Addr::from(masked)
}

// Returns true iff the first `n` bits of `a` and `b` agree. Both
// addresses must share the same family; callers are expected to have
// already rejected family mismatches upstream (see `Unsupported`).
pub fn prefix_compare(a: IpAddr, b: IpAddr, n: u8) -> bool {
    apply_mask(a, n) == apply_mask(b, n)
}

// Derives a prefix length from a dotted-quad netmask, BSD routing-socket
// style: 33 minus the position of the lowest set bit, with the all-zero
// mask reported as prefixlen 0.
pub fn mask2prefixlen4(mask: Ipv4Addr) -> u8 {
    let bits = u32::from(mask);
    if bits == 0 {
        return 0;
    }
    33 - (bits.trailing_zeros() as u8 + 1)
}

// Counts contiguous leading one-bits in a v6 netmask. Aborts the process
// if the mask is not a run of ones followed by a run of zeros: such a
// mask cannot arise from a well-formed kernel notification and indicates
// a corrupted message we have no safe way to interpret.
pub fn mask2prefixlen6(mask: Ipv6Addr) -> u8 {
    let mut len: u32 = 0;
    let mut done = false;
    for byte in mask.octets() {
        if done {
            if byte != 0 {
                fatal("non contiguous inet6 netmask");
            }
            continue;
        }
        match byte {
            0xff => len += 8,
            0xfe => {
                len += 7;
                done = true;
            }
            0xfc => {
                len += 6;
                done = true;
            }
            0xf8 => {
                len += 5;
                done = true;
            }
            0xf0 => {
                len += 4;
                done = true;
            }
            0xe0 => {
                len += 3;
                done = true;
            }
            0xc0 => {
                len += 2;
                done = true;
            }
            0x80 => {
                len += 1;
                done = true;
            }
            0x00 => done = true,
            _ => fatal("non contiguous inet6 netmask"),
        }
    }
    len as u8
}

pub fn mask2prefixlen(mask: IpAddr) -> u8 {
    match mask {
        IpAddr::V4(m) => mask2prefixlen4(m),
        IpAddr::V6(m) => mask2prefixlen6(m),
    }
}

// Classful prefix length for a v4 address, kept for wire compatibility
// with legacy callers that never learned CIDR. Multicast (class D) is
// reported as prefixlen 4, which is not a typo.
pub fn classful_prefixlen(addr: Ipv4Addr) -> u8 {
    let ina = u32::from(addr);
    if ina >= 0xf000_0000 {
        32 // class E
    } else if ina >= 0xe000_0000 {
        4 // class D (multicast)
    } else if ina >= 0xc000_0000 {
        24 // class C
    } else if ina >= 0x8000_0000 {
        16 // class B
    } else {
        8 // class A
    }
}

// ===== IpAddr extension =====

pub trait IpAddrExt {
    // True iff this address is a sane source for static/connected
    // redistribution and for general route announcement: not loopback,
    // multicast, link-local, (deprecated) site-local, v4-mapped, or
    // v4-compatible.
    fn is_routable(&self) -> bool;
}

impl IpAddrExt for IpAddr {
    fn is_routable(&self) -> bool {
        match self {
            IpAddr::V4(addr) => {
                !(addr.is_loopback() || addr.is_multicast() || addr.is_link_local())
            }
            IpAddr::V6(addr) => {
                if addr.is_loopback() || addr.is_multicast() || addr.is_unicast_link_local() {
                    return false;
                }
                if is_site_local6(addr) {
                    return false;
                }
                if is_v4_mapped6(addr) || is_v4_compat6(addr) {
                    return false;
                }
                true
            }
        }
    }
}

// fec0::/10, deprecated but still seen on the wire.
fn is_site_local6(addr: &Ipv6Addr) -> bool {
    let o = addr.octets();
    o[0] == 0xfe && (o[1] & 0xc0) == 0xc0
}

// ::ffff:0:0/96
fn is_v4_mapped6(addr: &Ipv6Addr) -> bool {
    addr.to_ipv4_mapped().is_some()
}

// ::0.0.0.0/96, excluding ::/128 and ::1/128 which are handled above.
fn is_v4_compat6(addr: &Ipv6Addr) -> bool {
    let o = addr.octets();
    o[..12] == [0u8; 12] && !addr.is_unspecified() && !addr.is_loopback()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classful_boundaries() {
        assert_eq!(classful_prefixlen(Ipv4Addr::from(0x7fff_ffff)), 8);
        assert_eq!(classful_prefixlen(Ipv4Addr::from(0x8000_0000)), 16);
        assert_eq!(classful_prefixlen(Ipv4Addr::from(0xbfff_ffff)), 16);
        assert_eq!(classful_prefixlen(Ipv4Addr::from(0xc000_0000)), 24);
        assert_eq!(classful_prefixlen(Ipv4Addr::from(0xdfff_ffff)), 24);
        assert_eq!(classful_prefixlen(Ipv4Addr::from(0xe000_0000)), 4);
        assert_eq!(classful_prefixlen(Ipv4Addr::from(0xefff_ffff)), 4);
        assert_eq!(classful_prefixlen(Ipv4Addr::from(0xf000_0000)), 32);
    }

    #[test]
    fn mask2prefixlen4_values() {
        assert_eq!(mask2prefixlen4(Ipv4Addr::new(0, 0, 0, 0)), 0);
        assert_eq!(mask2prefixlen4(Ipv4Addr::new(255, 255, 255, 0)), 24);
        assert_eq!(mask2prefixlen4(Ipv4Addr::new(255, 255, 255, 255)), 32);
        assert_eq!(mask2prefixlen4(Ipv4Addr::new(255, 0, 0, 0)), 8);
    }

    #[test]
    fn mask2prefixlen6_values() {
        assert_eq!(mask2prefixlen6(Ipv6Addr::UNSPECIFIED), 0);
        assert_eq!(
            mask2prefixlen6("ffff:ffff:ffff:ffff::".parse().unwrap()),
            64
        );
        assert_eq!(
            mask2prefixlen6("ffff:ffff:ffff:fffe::".parse().unwrap()),
            63
        );
    }

    #[test]
    fn prefix_compare_respects_length() {
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.254".parse().unwrap();
        assert!(prefix_compare(a, b, 24));
        assert!(!prefix_compare(a, b, 25));
    }

    #[test]
    fn routable_rejects_special_ranges() {
        let loopback: IpAddr = "127.0.0.1".parse().unwrap();
        let mcast: IpAddr = "224.0.0.1".parse().unwrap();
        let routable: IpAddr = "192.0.2.1".parse().unwrap();
        assert!(!loopback.is_routable());
        assert!(!mcast.is_routable());
        assert!(routable.is_routable());
    }
}
