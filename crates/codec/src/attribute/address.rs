use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use anyhow::{anyhow, Result};
use bytes::BytesMut;

use super::{AttrKind, Property};
use crate::util;

const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;
const COOKIE: [u8; 4] = 0x2112_a442u32.to_be_bytes();

/// Shared encode/decode for every address-bearing attribute. `IS_XOR`
/// selects RFC 5389 XOR-MAPPED-ADDRESS framing over the legacy
/// MAPPED-ADDRESS framing; the port/address math is otherwise identical.
fn write_addr(addr: &SocketAddr, buf: &mut BytesMut, token: &[u8; 12], is_xor: bool) {
    let port = if is_xor {
        addr.port() ^ u16::from_be_bytes([COOKIE[0], COOKIE[1]])
    } else {
        addr.port()
    };

    buf.extend_from_slice(&[0, family(addr)]);
    buf.extend_from_slice(&port.to_be_bytes());

    match addr.ip() {
        IpAddr::V4(ip) => {
            let octets = if is_xor { xor_v4(ip) } else { ip.octets() };
            buf.extend_from_slice(&octets);
        }
        IpAddr::V6(ip) => {
            let octets = if is_xor { xor_v6(ip, token) } else { ip.octets() };
            buf.extend_from_slice(&octets);
        }
    }
}

fn read_addr(buf: &[u8], token: &[u8; 12], is_xor: bool) -> Result<SocketAddr> {
    if buf.len() < 8 {
        return Err(anyhow!("address attribute too short"));
    }

    let family = buf[1];
    let port_raw = util::as_u16(&buf[2..4]);
    let port = if is_xor {
        port_raw ^ u16::from_be_bytes([COOKIE[0], COOKIE[1]])
    } else {
        port_raw
    };

    let ip = match family {
        FAMILY_IPV4 => {
            if buf.len() < 8 {
                return Err(anyhow!("ipv4 address attribute too short"));
            }
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&buf[4..8]);
            if is_xor {
                octets = xor_v4(Ipv4Addr::from(octets));
            }
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        FAMILY_IPV6 => {
            if buf.len() < 20 {
                return Err(anyhow!("ipv6 address attribute too short"));
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[4..20]);
            let v6 = if is_xor {
                Ipv6Addr::from(xor_v6(Ipv6Addr::from(octets), token))
            } else {
                Ipv6Addr::from(octets)
            };
            IpAddr::V6(v6)
        }
        _ => return Err(anyhow!("unknown address family {family:#x}")),
    };

    Ok(SocketAddr::new(ip, port))
}

fn family(addr: &SocketAddr) -> u8 {
    match addr {
        SocketAddr::V4(_) => FAMILY_IPV4,
        SocketAddr::V6(_) => FAMILY_IPV6,
    }
}

/// XOR each octet of a v4 address against the corresponding octet of the
/// magic cookie, RFC 5389 §15.2.
fn xor_v4(ip: Ipv4Addr) -> [u8; 4] {
    let mut octets = ip.octets();
    for i in 0..4 {
        octets[i] ^= COOKIE[i];
    }
    octets
}

/// v6 addresses XOR the first 4 octets against the cookie and the remaining
/// 12 against the transaction id.
fn xor_v6(ip: Ipv6Addr, token: &[u8; 12]) -> [u8; 16] {
    let mut octets = ip.octets();
    for i in 0..4 {
        octets[i] ^= COOKIE[i];
    }
    for i in 0..12 {
        octets[4 + i] ^= token[i];
    }
    octets
}

macro_rules! address_attribute {
    ($name:ident, $kind:ident, $is_xor:expr) => {
        pub struct $name;

        impl<'a> Property<'a> for $name {
            type Error = anyhow::Error;
            type Inner = SocketAddr;

            fn kind() -> AttrKind {
                AttrKind::$kind
            }

            fn into(value: Self::Inner, buf: &mut BytesMut, token: &[u8; 12]) {
                write_addr(&value, buf, token, $is_xor);
            }

            fn try_from(buf: &'a [u8], token: &'a [u8; 12]) -> Result<Self::Inner, Self::Error> {
                read_addr(buf, token, $is_xor)
            }
        }
    };
}

address_attribute!(MappedAddress, MappedAddress, false);
address_attribute!(XorMappedAddress, XorMappedAddress, true);
address_attribute!(ResponseOrigin, ResponseOrigin, false);
address_attribute!(OtherAddress, OtherAddress, false);
address_attribute!(ChangedAddress, ChangedAddress, false);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xor_mapped_address_round_trips() {
        let token = [7u8; 12];
        let addr: SocketAddr = "203.0.113.5:40000".parse().unwrap();

        let mut buf = BytesMut::new();
        XorMappedAddress::into(addr, &mut buf, &token);

        let decoded = XorMappedAddress::try_from(&buf, &token).unwrap();
        assert_eq!(decoded, addr);
    }

    #[test]
    fn mapped_address_is_not_obfuscated() {
        let token = [0u8; 12];
        let addr: SocketAddr = "198.51.100.1:3478".parse().unwrap();

        let mut buf = BytesMut::new();
        MappedAddress::into(addr, &mut buf, &token);

        assert_eq!(&buf[4..8], &[198, 51, 100, 1]);
    }
}
