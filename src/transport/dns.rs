//! Hostname resolution
//!
//! Resolution normally goes through the system resolver. When sockets are
//! bound to a device, the system resolver may route around the binding,
//! so a configured DNS server is queried directly over a bound UDP socket
//! with a minimal A-record lookup.

use super::DialConfig;
use crate::error::TunnelError;
use rand::Rng;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::net::UdpSocket;

const DNS_PORT: u16 = 53;
const DNS_MAX_RESPONSE: usize = 512;

/// Resolve a hostname to a single IP address
pub(crate) async fn resolve_host(
    host: &str,
    dial_config: &DialConfig,
) -> Result<IpAddr, TunnelError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }

    match dial_config.dns_server {
        Some(server) => {
            query_a(host, SocketAddr::new(server, DNS_PORT), dial_config).await
        }
        None => {
            let mut addrs = tokio::net::lookup_host((host, 0))
                .await
                .map_err(TunnelError::Dial)?;
            addrs
                .next()
                .map(|addr| addr.ip())
                .ok_or_else(|| {
                    TunnelError::Dial(io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("no addresses for {}", host),
                    ))
                })
        }
    }
}

/// Query the configured DNS server directly for an A record
async fn query_a(
    host: &str,
    server: SocketAddr,
    dial_config: &DialConfig,
) -> Result<IpAddr, TunnelError> {
    let bind_addr: SocketAddr = if server.is_ipv4() {
        (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind_addr).await.map_err(TunnelError::Dial)?;

    if let Some(binder) = &dial_config.device_binder {
        let sock_ref = socket2::SockRef::from(&socket);
        binder.bind_to_device(&sock_ref).map_err(TunnelError::Dial)?;
    }

    let query_id: u16 = rand::thread_rng().gen();
    let query = build_query(query_id, host).map_err(TunnelError::Dial)?;

    socket
        .send_to(&query, server)
        .await
        .map_err(TunnelError::Dial)?;

    let mut response = [0u8; DNS_MAX_RESPONSE];
    let received = tokio::time::timeout(
        dial_config.connect_timeout,
        socket.recv(&mut response),
    )
    .await
    .map_err(|_| {
        TunnelError::Dial(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("DNS query for {} timed out", host),
        ))
    })?
    .map_err(TunnelError::Dial)?;

    parse_a_response(&response[..received], query_id)
        .map(IpAddr::V4)
        .map_err(TunnelError::Dial)
}

/// Build a single-question recursive A query
fn build_query(id: u16, host: &str) -> io::Result<Vec<u8>> {
    let mut packet = Vec::with_capacity(32 + host.len());
    packet.extend_from_slice(&id.to_be_bytes());
    packet.extend_from_slice(&0x0100u16.to_be_bytes()); // RD
    packet.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    packet.extend_from_slice(&[0u8; 6]); // AN/NS/AR counts

    for label in host.trim_end_matches('.').split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid hostname: {}", host),
            ));
        }
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);
    packet.extend_from_slice(&1u16.to_be_bytes()); // QTYPE A
    packet.extend_from_slice(&1u16.to_be_bytes()); // QCLASS IN
    Ok(packet)
}

/// Extract the first A record from a response
fn parse_a_response(packet: &[u8], expected_id: u16) -> io::Result<Ipv4Addr> {
    let malformed = || io::Error::new(io::ErrorKind::InvalidData, "malformed DNS response");

    if packet.len() < 12 {
        return Err(malformed());
    }
    let id = u16::from_be_bytes([packet[0], packet[1]]);
    if id != expected_id {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "DNS response id mismatch",
        ));
    }
    let rcode = packet[3] & 0x0f;
    if rcode != 0 {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("DNS query failed with rcode {}", rcode),
        ));
    }
    let question_count = u16::from_be_bytes([packet[4], packet[5]]);
    let answer_count = u16::from_be_bytes([packet[6], packet[7]]);

    let mut offset = 12;
    for _ in 0..question_count {
        offset = skip_name(packet, offset).ok_or_else(malformed)?;
        offset += 4; // QTYPE + QCLASS
    }

    for _ in 0..answer_count {
        offset = skip_name(packet, offset).ok_or_else(malformed)?;
        if packet.len() < offset + 10 {
            return Err(malformed());
        }
        let rtype = u16::from_be_bytes([packet[offset], packet[offset + 1]]);
        let rdlength = u16::from_be_bytes([packet[offset + 8], packet[offset + 9]]) as usize;
        offset += 10;
        if packet.len() < offset + rdlength {
            return Err(malformed());
        }
        if rtype == 1 && rdlength == 4 {
            return Ok(Ipv4Addr::new(
                packet[offset],
                packet[offset + 1],
                packet[offset + 2],
                packet[offset + 3],
            ));
        }
        offset += rdlength;
    }

    Err(io::Error::new(
        io::ErrorKind::NotFound,
        "DNS response has no A records",
    ))
}

/// Advance past a possibly compressed name, returning the new offset
fn skip_name(packet: &[u8], mut offset: usize) -> Option<usize> {
    loop {
        let len = *packet.get(offset)? as usize;
        if len == 0 {
            return Some(offset + 1);
        }
        if len & 0xc0 == 0xc0 {
            // compression pointer ends the name
            return Some(offset + 2);
        }
        offset += 1 + len;
    }
}
