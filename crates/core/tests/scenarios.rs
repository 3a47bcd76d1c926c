use std::net::SocketAddr;

use bytes::BytesMut;
use stun_server_codec::attribute::{ChangeRequest, ChangeRequestFlags, OtherAddress, XorMappedAddress};
use stun_server_codec::message::{Kind, MessageWriter};
use stun_server_codec::reader::StunReader;
use stun_server_core::endpoint::{Endpoint, TransportAddressSet};
use stun_server_core::handler::{NoopAuthenticator, RequestHandler, StunMessageIn};
use stun_server_core::role::Role;

fn full_mode_tsa() -> TransportAddressSet {
    let endpoint = |role, ip: &str, port: u16| Endpoint {
        role,
        bind_addr: format!("{ip}:{port}").parse().unwrap(),
        advertised_ip: ip.parse().unwrap(),
        valid: true,
    };

    TransportAddressSet::new([
        endpoint(Role::Pp, "198.51.100.1", 3478),
        endpoint(Role::Pa, "198.51.100.1", 3479),
        endpoint(Role::Ap, "198.51.100.2", 3478),
        endpoint(Role::Aa, "198.51.100.2", 3479),
    ])
    .unwrap()
}

fn basic_mode_tsa() -> TransportAddressSet {
    let pp = Endpoint {
        role: Role::Pp,
        bind_addr: "198.51.100.1:3478".parse().unwrap(),
        advertised_ip: "198.51.100.1".parse().unwrap(),
        valid: true,
    };
    let absent = |role| Endpoint {
        role,
        bind_addr: "198.51.100.1:3478".parse().unwrap(),
        advertised_ip: "198.51.100.1".parse().unwrap(),
        valid: false,
    };

    TransportAddressSet::new([pp, absent(Role::Pa), absent(Role::Ap), absent(Role::Aa)]).unwrap()
}

fn binding_request(change_ip: bool, change_port: bool) -> BytesMut {
    let token = [0x42u8; 12];
    let mut buf = BytesMut::new();
    let mut writer = MessageWriter::new(Kind::BindingRequest, &token, &mut buf);
    writer.append::<ChangeRequest>(ChangeRequestFlags { change_ip, change_port });
    writer.flush(None).unwrap();
    buf
}

fn process(tsa: &TransportAddressSet, role: Role, remote: SocketAddr, request: &BytesMut) -> stun_server_core::handler::StunMessageOut {
    let mut reader = StunReader::new();
    reader.add_bytes(request);

    let msg_in = StunMessageIn {
        remote,
        local: SocketAddr::new(tsa.lookup(role).bind_addr.ip(), tsa.lookup(role).bind_addr.port()),
        role,
        reader: &reader,
        raw: request,
    };

    let mut out_buf = BytesMut::new();
    RequestHandler::process(&msg_in, tsa, &NoopAuthenticator, &mut out_buf).unwrap()
}

fn xor_mapped_address(bytes: &BytesMut) -> SocketAddr {
    let mut reader = StunReader::new();
    reader.add_bytes(bytes);
    reader.get::<XorMappedAddress>(bytes).unwrap().unwrap()
}

#[test]
fn scenario_1_no_change_replies_from_pp() {
    let tsa = full_mode_tsa();
    let remote: SocketAddr = "203.0.113.5:40000".parse().unwrap();
    let request = binding_request(false, false);

    let out = process(&tsa, Role::Pp, remote, &request);

    assert_eq!(out.send_role, Role::Pp);
    assert_eq!(out.dest, remote);
    assert_eq!(xor_mapped_address(&out.bytes), remote);

    let mut reader = StunReader::new();
    reader.add_bytes(&out.bytes);
    let other: SocketAddr = reader.get::<OtherAddress>(&out.bytes).unwrap().unwrap();
    assert_eq!(other, "198.51.100.2:3479".parse().unwrap());
}

#[test]
fn scenario_2_change_ip_replies_from_ap() {
    let tsa = full_mode_tsa();
    let remote: SocketAddr = "203.0.113.5:40000".parse().unwrap();
    let request = binding_request(true, false);

    let out = process(&tsa, Role::Pp, remote, &request);
    assert_eq!(out.send_role, Role::Ap);
}

#[test]
fn scenario_3_change_port_replies_from_pa() {
    let tsa = full_mode_tsa();
    let remote: SocketAddr = "203.0.113.5:40000".parse().unwrap();
    let request = binding_request(false, true);

    let out = process(&tsa, Role::Pp, remote, &request);
    assert_eq!(out.send_role, Role::Pa);
}

#[test]
fn scenario_4_change_both_replies_from_aa() {
    let tsa = full_mode_tsa();
    let remote: SocketAddr = "203.0.113.5:40000".parse().unwrap();
    let request = binding_request(true, true);

    let out = process(&tsa, Role::Pp, remote, &request);
    assert_eq!(out.send_role, Role::Aa);
}

#[test]
fn scenario_5_basic_mode_invalid_toggle_errors_400() {
    let tsa = basic_mode_tsa();
    let remote: SocketAddr = "203.0.113.5:40000".parse().unwrap();
    let request = binding_request(true, false);

    let out = process(&tsa, Role::Pp, remote, &request);
    assert_eq!(out.send_role, Role::Pp);

    let mut reader = StunReader::new();
    reader.add_bytes(&out.bytes);
    assert_eq!(reader.kind(), Some(Kind::BindingError));
    assert_eq!(reader.error(&out.bytes).unwrap().code, 400);
}

#[test]
fn round_trip_preserves_transaction_id() {
    let tsa = full_mode_tsa();
    let remote: SocketAddr = "203.0.113.5:40000".parse().unwrap();
    let request = binding_request(false, false);

    let out = process(&tsa, Role::Pp, remote, &request);

    let mut reader = StunReader::new();
    reader.add_bytes(&out.bytes);
    assert_eq!(reader.token(), &[0x42u8; 12]);
}
