// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::net::Ipv4Addr;

use shoal_rs::addr::AddrPort;

#[test]
fn test_cmp_id_packs_address_over_port() {
    let a = AddrPort::new(Ipv4Addr::new(10, 0, 0, 1), 65535);
    let b = AddrPort::new(Ipv4Addr::new(10, 0, 0, 2), 1);
    // A higher address always outranks any port.
    assert!(a < b);
    assert_eq!(a.cmp_id() >> 16, u32::from(a.ip()) as u64);
    assert_eq!(a.cmp_id() & 0xFFFF, 65535);
}

#[test]
fn test_ordering_is_deterministic() {
    let mut v = vec![
        AddrPort::new(Ipv4Addr::new(192, 168, 0, 2), 80),
        AddrPort::new(Ipv4Addr::new(10, 0, 0, 1), 9000),
        AddrPort::new(Ipv4Addr::new(192, 168, 0, 2), 79),
    ];
    v.sort();
    assert_eq!(v[0].ip(), Ipv4Addr::new(10, 0, 0, 1));
    assert_eq!(v[1].port(), 79);
    assert_eq!(v[2].port(), 80);
}

#[test]
fn test_round_trips_through_socket_addr() {
    let ap = AddrPort::new(Ipv4Addr::new(127, 0, 0, 1), 7077);
    let sa = ap.to_socket_addr();
    assert_eq!(sa.to_string(), "127.0.0.1:7077");
    assert_eq!(format!("{ap}"), "127.0.0.1:7077");
}
