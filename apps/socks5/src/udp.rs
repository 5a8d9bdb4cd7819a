//! SOCKS5 UDP request header: `RSV(2) FRAG ATYP DST.ADDR DST.PORT DATA`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::socks::SocksAtyp;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDatagram<'a> {
    pub host: String,
    pub port: u16,
    pub data: &'a [u8],
}

/// Parse a datagram received from the SOCKS client. Truncated packets and
/// unknown address types yield `None` and are dropped by the caller.
pub fn parse_datagram(packet: &[u8]) -> Option<UdpDatagram<'_>> {
    let atyp = SocksAtyp::from_u8(*packet.get(3)?)?;
    let mut pos = 4;
    let host = match atyp {
        SocksAtyp::IPv4 => {
            let octets: [u8; 4] = packet.get(pos..pos + 4)?.try_into().ok()?;
            pos += 4;
            Ipv4Addr::from(octets).to_string()
        }
        SocksAtyp::IPv6 => {
            let octets: [u8; 16] = packet.get(pos..pos + 16)?.try_into().ok()?;
            pos += 16;
            Ipv6Addr::from(octets).to_string()
        }
        SocksAtyp::Domainname => {
            let len = *packet.get(pos)? as usize;
            pos += 1;
            let name = packet.get(pos..pos + len)?;
            pos += len;
            String::from_utf8_lossy(name).into_owned()
        }
    };
    let port = packet.get(pos..pos + 2)?;
    let port = u16::from_be_bytes([port[0], port[1]]);
    pos += 2;

    Some(UdpDatagram {
        host,
        port,
        data: &packet[pos..],
    })
}

/// Wrap a reply for the SOCKS client. IPv4-mapped IPv6 addresses are written
/// as IPv4; anything that is not an IP goes out as a domain name. Domains
/// longer than 255 bytes cannot be encoded.
pub fn build_datagram(host: &str, port: u16, data: &[u8]) -> Option<Vec<u8>> {
    let mut packet = Vec::with_capacity(4 + 1 + host.len() + 2 + data.len());
    packet.extend_from_slice(&[0, 0, 0]);
    match host.parse::<IpAddr>() {
        Ok(ip) => match ip {
            IpAddr::V4(v4) => push_v4(&mut packet, v4),
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => push_v4(&mut packet, v4),
                None => {
                    packet.push(SocksAtyp::IPv6 as u8);
                    packet.extend_from_slice(&v6.octets());
                }
            },
        },
        Err(_) => {
            let len = u8::try_from(host.len()).ok()?;
            packet.push(SocksAtyp::Domainname as u8);
            packet.push(len);
            packet.extend_from_slice(host.as_bytes());
        }
    }
    packet.extend_from_slice(&port.to_be_bytes());
    packet.extend_from_slice(data);
    Some(packet)
}

fn push_v4(packet: &mut Vec<u8>, ip: Ipv4Addr) {
    packet.push(SocksAtyp::IPv4 as u8);
    packet.extend_from_slice(&ip.octets());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ipv4_query() {
        let packet = [0, 0, 0, 1, 1, 2, 3, 4, 0, 53, b'q', b'u', b'e', b'r', b'y'];
        let datagram = parse_datagram(&packet).unwrap();
        assert_eq!(datagram.host, "1.2.3.4");
        assert_eq!(datagram.port, 53);
        assert_eq!(datagram.data, b"query");
    }

    #[test]
    fn parses_domain_and_rejects_truncation() {
        let mut packet = vec![0, 0, 0, 3, 7];
        packet.extend_from_slice(b"dns.lan");
        packet.extend_from_slice(&[0x14, 0xe9]);
        let datagram = parse_datagram(&packet).unwrap();
        assert_eq!((datagram.host.as_str(), datagram.port), ("dns.lan", 5353));
        assert!(datagram.data.is_empty());

        assert!(parse_datagram(&packet[..8]).is_none());
        assert!(parse_datagram(&[0, 0, 0]).is_none());
        assert!(parse_datagram(&[0, 0, 0, 2, 1, 1]).is_none());
    }

    #[test]
    fn builds_headers_by_address_kind() {
        assert_eq!(
            build_datagram("::ffff:10.1.2.3", 53, b"ok").unwrap(),
            vec![0, 0, 0, 1, 10, 1, 2, 3, 0, 53, b'o', b'k']
        );
        let v6 = build_datagram("2001:db8::1", 443, b"").unwrap();
        assert_eq!(v6[3], 4);
        assert_eq!(v6.len(), 4 + 16 + 2);
        let domain = build_datagram("example.org", 80, b"x").unwrap();
        assert_eq!(&domain[3..5], &[3, 11]);
        assert!(build_datagram(&"a".repeat(300), 80, b"").is_none());
    }

    #[test]
    fn built_headers_parse_back() {
        let packet = build_datagram("8.8.8.8", 53, b"answer").unwrap();
        let datagram = parse_datagram(&packet).unwrap();
        assert_eq!(
            (datagram.host.as_str(), datagram.port, datagram.data),
            ("8.8.8.8", 53, &b"answer"[..])
        );
    }
}
