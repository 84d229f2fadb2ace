//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

#![allow(clippy::single_match)]

// Netlink bridge (§2, "external"): encodes outbound route add/replace/
// delete requests and parses inbound route/link notifications into the
// reconciler's transport-agnostic `RouteUpdate`/`LinkUpdate` values.
// Nothing here decides what to do with a parsed message — that is the
// reconciler's job.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use futures::TryStreamExt;
use futures::channel::mpsc::UnboundedReceiver;
use ipnetwork::IpNetwork;
use netlink_packet_core::{NetlinkMessage, NetlinkPayload};
use netlink_packet_route::constants::{
    AF_INET, AF_INET6, RTNLGRP_IPV4_ROUTE, RTNLGRP_IPV6_ROUTE, RTNLGRP_LINK, RTN_BLACKHOLE,
    RTN_PROHIBIT, RTN_UNREACHABLE, RTPROT_STATIC,
};
use netlink_packet_route::rtnl::RtnlMessage;
use netlink_packet_route::{LinkMessage, RouteMessage};
use netlink_sys::{AsyncSocket, SocketAddr};
use rtnetlink::{Handle, new_connection};
use tracing::{error, trace, warn};

use crate::addr::{AddressFamily, Prefix, mask2prefixlen};
use crate::capabilities;
use crate::iface::LinkState;
use crate::reconcile::{LinkUpdate, MsgType, RouteUpdate};
use crate::route::RouteEntry;

// The route protocol this crate stamps on routes it installs, so they
// can be told apart from kernel-learned ones on a fresh dump even
// before the `F_BGPD`-equivalent echo-correlation logic runs.
const RTPROT_BGPD: u8 = 186;

pub type NetlinkMonitor = UnboundedReceiver<(NetlinkMessage<RtnlMessage>, SocketAddr)>;

// One parsed inbound message, tagged with enough of the original
// envelope (pid/seq) for the reconciler's self-echo filter.
pub enum InboundMessage {
    RouteAdd {
        table: u32,
        msg_type: MsgType,
        mpath: bool,
        update: RouteUpdate,
    },
    RouteDel {
        table: u32,
        mpath: bool,
        update: RouteUpdate,
    },
    Link(LinkUpdate),
    LinkDel(u32),
    Ignored,
}

// ===== outbound =====

pub async fn route_install(handle: &Handle, route: &RouteEntry) -> bool {
    send_route(handle, route, true).await
}

pub async fn route_uninstall(handle: &Handle, route: &RouteEntry) -> bool {
    send_route(handle, route, false).await
}

async fn send_route(handle: &Handle, route: &RouteEntry, install: bool) -> bool {
    let prefix = match IpNetwork::new(route.prefix.addr, route.prefix.prefixlen) {
        Ok(prefix) => prefix,
        Err(error) => {
            warn!(%error, "refusing to send route with invalid prefix length");
            return false;
        }
    };

    let result = match prefix {
        IpNetwork::V4(prefix) => {
            let request = handle.route().add().v4().replace().protocol(RTPROT_BGPD);
            let mut request = request.destination_prefix(prefix.ip(), prefix.prefix());
            if let IpAddr::V4(gw) = route.nexthop {
                request = request.gateway(gw);
            }
            request = request.output_interface(route.ifindex);
            if install {
                request.execute().await
            } else {
                handle
                    .route()
                    .del(request.message_mut().clone())
                    .execute()
                    .await
            }
        }
        IpNetwork::V6(prefix) => {
            let request = handle.route().add().v6().replace().protocol(RTPROT_BGPD);
            let mut request = request.destination_prefix(prefix.ip(), prefix.prefix());
            if let IpAddr::V6(gw) = route.nexthop {
                request = request.gateway(gw);
            }
            request = request.output_interface(route.ifindex);
            if install {
                request.execute().await
            } else {
                handle
                    .route()
                    .del(request.message_mut().clone())
                    .execute()
                    .await
            }
        }
    };

    if let Err(error) = result {
        error!(prefix = %route.prefix.addr, prefixlen = route.prefix.prefixlen, %error,
            "failed to {} route", if install { "install" } else { "uninstall" });
        return false;
    }
    true
}

// ===== inbound parsing =====

fn parse_route_msg(msg: RouteMessage, msg_type: Option<&'static str>) -> Option<(u32, RouteUpdate)> {
    use netlink_packet_route::route::nlas::Nla;

    let family = match msg.header.address_family as u16 {
        AF_INET => AddressFamily::V4,
        AF_INET6 => AddressFamily::V6,
        _ => return None,
    };

    let mut dst = None;
    let mut gateway = None;
    let mut oif = 0u32;
    let mut priority = 0u8;
    let mut table = msg.header.table as u32;
    let mut route_label = 0u16;

    for nla in msg.nlas.into_iter() {
        match nla {
            Nla::Destination(bytes) => dst = parse_addr(family, &bytes),
            Nla::Gateway(bytes) => gateway = parse_addr(family, &bytes),
            Nla::Oif(ifindex) => oif = ifindex,
            Nla::Priority(prio) => priority = prio.min(u8::MAX as u32) as u8,
            Nla::Table(tbl) => table = tbl,
            Nla::Flow(label) => route_label = label.min(u16::MAX as u32) as u16,
            _ => (),
        }
    }

    let addr = dst.unwrap_or(match family {
        AddressFamily::V4 => Ipv4Addr::UNSPECIFIED.into(),
        _ => Ipv6Addr::UNSPECIFIED.into(),
    });

    let mut flags = crate::route::RouteFlags::empty();
    match msg.header.kind {
        k if k == RTN_BLACKHOLE => flags.insert(crate::route::RouteFlags::BLACKHOLE),
        k if k == RTN_UNREACHABLE || k == RTN_PROHIBIT => {
            flags.insert(crate::route::RouteFlags::REJECT)
        }
        _ => (),
    }
    if gateway.is_none() {
        flags.insert(crate::route::RouteFlags::CONNECTED);
    }
    if msg.header.protocol == RTPROT_STATIC {
        flags.insert(crate::route::RouteFlags::STATIC);
    }
    if msg.header.protocol == RTPROT_BGPD {
        flags.insert(crate::route::RouteFlags::BGPD_OWNED);
    }

    let prefix = Prefix {
        family,
        addr,
        prefixlen: msg.header.destination_prefix_length,
        scope_id: 0,
        labels: Vec::new(),
    };
    let update = RouteUpdate {
        prefix,
        nexthop: gateway,
        ifindex: oif,
        priority,
        flags,
        route_label,
        mpls_label: None,
    };
    let _ = msg_type;
    Some((table, update))
}

fn parse_addr(family: AddressFamily, bytes: &[u8]) -> Option<IpAddr> {
    match family {
        AddressFamily::V4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(Ipv4Addr::from(octets).into())
        }
        AddressFamily::V6 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(Ipv6Addr::from(octets).into())
        }
        _ => None,
    }
}

fn parse_link_msg(msg: LinkMessage) -> LinkUpdate {
    use netlink_packet_route::constants::IFF_RUNNING;
    use netlink_packet_route::link::nlas::Nla;

    let ifindex = msg.header.index;
    let up = msg.header.flags & IFF_RUNNING != 0;
    let mut name = String::new();
    for nla in msg.nlas.into_iter() {
        if let Nla::IfName(ifname) = nla {
            name = ifname;
        }
    }
    LinkUpdate {
        ifindex,
        name,
        up,
        link_state: if up { LinkState::Up } else { LinkState::Down },
        routing_domain: 0,
    }
}

// The envelope fields the reconciler's self-echo filter (§4.7, §S.3)
// correlates against: the netlink port id the message was sent from
// and its sequence number.
#[derive(Clone, Copy, Debug)]
pub struct Envelope {
    pub pid: u32,
    pub seq: u32,
}

pub fn process_msg(msg: NetlinkMessage<RtnlMessage>) -> (Envelope, InboundMessage) {
    let envelope = Envelope {
        pid: msg.header.port_number,
        seq: msg.header.sequence_number,
    };
    let NetlinkPayload::InnerMessage(msg) = msg.payload else {
        return (envelope, InboundMessage::Ignored);
    };
    let inbound = match msg {
        RtnlMessage::NewRoute(msg) => {
            trace!(?msg, "received RTM_NEWROUTE message");
            match parse_route_msg(msg, Some("add")) {
                Some((table, update)) => InboundMessage::RouteAdd {
                    table,
                    msg_type: MsgType::Add,
                    mpath: false,
                    update,
                },
                None => InboundMessage::Ignored,
            }
        }
        RtnlMessage::DelRoute(msg) => {
            trace!(?msg, "received RTM_DELROUTE message");
            match parse_route_msg(msg, Some("del")) {
                Some((table, update)) => InboundMessage::RouteDel {
                    table,
                    mpath: false,
                    update,
                },
                None => InboundMessage::Ignored,
            }
        }
        RtnlMessage::NewLink(msg) => InboundMessage::Link(parse_link_msg(msg)),
        RtnlMessage::DelLink(msg) => InboundMessage::LinkDel(msg.header.index),
        _ => InboundMessage::Ignored,
    };
    (envelope, inbound)
}

// ===== connection setup =====

// §A.4: opens two netlink connections, exactly as the source's
// `dispatch_rtmsg`/monitor split — one `Handle` for outbound requests
// (and startup dump queries, §S.3), one bound to the route/link
// multicast groups for asynchronous notifications. Capability
// elevation is confined to the thread driving each connection.
//
// The source binds its netlink socket explicitly to `getpid()` so the
// self-echo filter (§4.7, §S.3) can correlate inbound messages by pid
// without depending on whatever port id autobind happens to hand out;
// this does the same rather than trusting the request socket's default
// autobind to agree with the process id.
pub async fn init() -> (Handle, u32, NetlinkMonitor) {
    let pid = libc::getpid() as u32;
    let (mut conn, handle, _) = new_connection().expect("failed to create netlink socket");
    conn.socket_mut()
        .socket_mut()
        .bind(&SocketAddr::new(pid, 0))
        .expect("failed to bind netlink socket to our pid");
    std::thread::spawn(|| capabilities::raise(|| futures::executor::block_on(conn)));

    let (mut monitor_conn, _, monitor) = new_connection().expect("failed to create netlink socket");
    let groups = [RTNLGRP_LINK, RTNLGRP_IPV4_ROUTE, RTNLGRP_IPV6_ROUTE]
        .iter()
        .map(|group| 1 << (group - 1))
        .fold(0, std::ops::BitOr::bitor);
    let addr = SocketAddr::new(0, groups);
    monitor_conn
        .socket_mut()
        .socket_mut()
        .bind(&addr)
        .expect("failed to bind netlink socket");
    tokio::spawn(monitor_conn);

    (handle, pid, monitor)
}

// §S.3 bulk FIB load: dumps the kernel's route and link tables,
// parsing each reply through the same `process_msg` path as live
// notifications. The caller is responsible for routing the results
// through `fib_change`/link handling without the self-echo filter
// (dump replies are never "from self" even carrying our pid).
pub async fn dump_routes(handle: &Handle, family: rtnetlink::IpVersion) -> Vec<(u32, RouteUpdate)> {
    let mut routes = handle.route().get(family).execute();
    let mut out = Vec::new();
    loop {
        match routes.try_next().await {
            Ok(Some(msg)) => {
                if let Some(parsed) = parse_route_msg(msg, None) {
                    out.push(parsed);
                }
            }
            Ok(None) => break,
            Err(error) => {
                error!(%error, "failed to fetch kernel routing table");
                break;
            }
        }
    }
    out
}

pub async fn dump_links(handle: &Handle) -> Vec<LinkUpdate> {
    let mut links = handle.link().get().execute();
    let mut out = Vec::new();
    loop {
        match links.try_next().await {
            Ok(Some(msg)) => out.push(parse_link_msg(msg)),
            Ok(None) => break,
            Err(error) => {
                error!(%error, "failed to fetch interface information");
                break;
            }
        }
    }
    out
}

// `prefixlen_of_mask` equivalent exposed for callers that only receive
// a dotted netmask over the wire rather than a prefix length (some
// legacy RTA encodings do this); kept here rather than in `addr` since
// it is purely a netlink-ingestion concern.
pub fn prefixlen_from_netmask(mask: IpAddr) -> u8 {
    mask2prefixlen(mask)
}
