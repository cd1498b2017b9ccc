//! Receive steering through the root, VLAN and hash flow tables down to a
//! receive queue

mod common;

use common::datapath;
use nicq_datapath::flow::{ip_proto, BROADCAST_MAC};
use nicq_datapath::{FlowTuple, PacketMatch, TirRole};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const MAC: [u8; 6] = [0x02, 0x11, 0x22, 0x33, 0x44, 0x55];

fn v6_flow(port: u16) -> FlowTuple {
    FlowTuple {
        src: IpAddr::V6(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 1)),
        dst: IpAddr::V6(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 2)),
        sport: port,
        dport: 443,
    }
}

fn v4_flow(port: u16) -> FlowTuple {
    FlowTuple {
        src: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
        dst: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
        sport: port,
        dport: 53,
    }
}

#[test]
fn protocol_classes_reach_their_targets() {
    let (_h, dp) = datapath();
    dp.add_mac(0, MAC).unwrap();
    let group = &dp.rx_groups()[0];
    let rqs: HashSet<u32> = group.wqs().iter().map(|wq| wq.num()).collect();

    let udp6 = PacketMatch::to_mac(MAC).with_ip(6, ip_proto::UDP);
    assert_eq!(dp.classify(&udp6).unwrap().role(), TirRole::UdpV6);
    let tcp4 = PacketMatch::to_mac(MAC).with_ip(4, ip_proto::TCP);
    assert_eq!(dp.classify(&tcp4).unwrap().role(), TirRole::TcpV4);

    let icmp4 = PacketMatch::to_mac(MAC).with_ip(4, ip_proto::ICMP);
    let other = dp.classify(&icmp4).unwrap();
    assert_eq!(other.role(), TirRole::Other);
    assert!(other.key().is_empty());
    assert_eq!(dp.steer(&icmp4, &v4_flow(1)), Some(group.wqs()[0].num()));

    let mut hit = HashSet::new();
    for port in 1000..1064 {
        let flow = v6_flow(port);
        let rq = dp.steer(&udp6, &flow).unwrap();
        assert!(rqs.contains(&rq));
        // Symmetric keys keep both directions on one queue
        assert_eq!(dp.steer(&udp6, &flow.reversed()), Some(rq));
        hit.insert(rq);
    }
    assert_eq!(hit, rqs);
}

#[test]
fn unknown_destination_is_not_steered() {
    let (_h, dp) = datapath();
    dp.add_mac(0, MAC).unwrap();
    let stray = PacketMatch::to_mac([0x02, 0, 0, 0, 0, 0x99]).with_ip(4, ip_proto::UDP);
    assert!(dp.classify(&stray).is_none());
    assert!(dp.steer(&stray, &v4_flow(7)).is_none());

    // Broadcast waits for the first group to run
    let bcast = PacketMatch::to_mac(BROADCAST_MAC).with_ip(4, ip_proto::UDP);
    assert!(dp.classify(&bcast).is_none());
    dp.rx_ring_start(0, 0).unwrap();
    assert_eq!(dp.classify(&bcast).unwrap().role(), TirRole::UdpV4);
}

#[test]
fn vlan_filter_replaces_default_entry() {
    let (_h, dp) = datapath();
    dp.add_mac(0, MAC).unwrap();
    let untagged = PacketMatch::to_mac(MAC).with_ip(4, ip_proto::UDP);
    let tagged = untagged.with_vlan(10);
    let other_vlan = untagged.with_vlan(11);
    assert!(dp.classify(&untagged).is_some());

    dp.add_vlan(0, 10).unwrap();
    assert!(dp.classify(&tagged).is_some());
    assert!(dp.classify(&other_vlan).is_none());
    assert!(dp.classify(&untagged).is_none());

    dp.set_promisc(true).unwrap();
    assert!(dp.classify(&other_vlan).is_some());
    dp.set_promisc(false).unwrap();
    assert!(dp.classify(&other_vlan).is_none());

    dp.remove_vlan(0, 10).unwrap();
    assert!(dp.classify(&untagged).is_some());
    assert!(dp.classify(&other_vlan).is_some());
}

#[test]
fn teardown_removes_all_steering() {
    let (h, dp) = datapath();
    let pkt = PacketMatch::to_mac(MAC).with_ip(6, ip_proto::TCP);
    dp.add_mac(0, MAC).unwrap();
    dp.rx_ring_start(0, 0).unwrap();
    assert!(dp.classify(&pkt).is_some());

    dp.teardown();
    assert!(dp.classify(&pkt).is_none());
    assert!(dp.add_mac(0, MAC).is_err());
    for (create, destroy) in [
        ("CREATE_FLOW_TABLE", "DESTROY_FLOW_TABLE"),
        ("CREATE_FLOW_GROUP", "DESTROY_FLOW_GROUP"),
        ("CREATE_TIR", "DESTROY_TIR"),
        ("CREATE_RQT", "DESTROY_RQT"),
        ("CREATE_RQ", "DESTROY_RQ"),
        ("CREATE_SQ", "DESTROY_SQ"),
        ("CREATE_CQ", "DESTROY_CQ"),
    ] {
        assert_eq!(
            h.device.command_count(create),
            h.device.command_count(destroy),
            "{create}"
        );
    }
}
