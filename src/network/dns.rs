//! # Captive DNS Responder
//!
//! Answers every A query with the portal address so that whatever host a
//! connecting client looks up lands on the configuration page.

use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

/// DNS header length
const HEADER_LEN: usize = 12;

/// Largest datagram we accept
const MAX_DATAGRAM: usize = 512;

/// Datagrams handled per pump, so a flood cannot stall the control loop
const MAX_PER_PUMP: usize = 16;

/// TTL of the synthesized answer, in seconds
const ANSWER_TTL: u32 = 60;

const QTYPE_A: u16 = 1;
const QTYPE_ANY: u16 = 255;
const QCLASS_IN: u16 = 1;

const FLAG_QR: u16 = 0x8000;
const FLAG_AA: u16 = 0x0400;
const FLAG_RD: u16 = 0x0100;
const FLAG_RA: u16 = 0x0080;
const OPCODE_MASK: u16 = 0x7800;

/// Build the response to `query`, resolving it to `address`.
///
/// Only the first question is answered. A and ANY queries in class IN get
/// one A record; other types get an empty NOERROR answer. Returns `None`
/// for anything that is not a well-formed standard query.
///
/// # Examples
///
/// ```
/// use std::net::Ipv4Addr;
/// use tank_gateway::network::dns::build_response;
///
/// // ID 0x1234, RD set, one question: example.com A IN
/// let mut query = vec![0x12, 0x34, 0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0];
/// query.extend_from_slice(b"\x07example\x03com\x00\x00\x01\x00\x01");
///
/// let response = build_response(&query, Ipv4Addr::new(10, 42, 0, 1)).unwrap();
/// assert_eq!(&response[..2], &[0x12, 0x34]);
/// assert_eq!(&response[response.len() - 4..], &[10, 42, 0, 1]);
/// ```
#[must_use]
pub fn build_response(query: &[u8], address: Ipv4Addr) -> Option<Vec<u8>> {
    if query.len() < HEADER_LEN {
        return None;
    }

    let flags = u16::from_be_bytes([query[2], query[3]]);
    let qdcount = u16::from_be_bytes([query[4], query[5]]);
    if flags & FLAG_QR != 0 || flags & OPCODE_MASK != 0 || qdcount == 0 {
        return None;
    }

    // Question name: labels up to the root label, no compression in queries
    let mut pos = HEADER_LEN;
    loop {
        let len = *query.get(pos)? as usize;
        if len == 0 {
            pos += 1;
            break;
        }
        if len & 0xC0 != 0 {
            return None;
        }
        pos += 1 + len;
    }
    let question_end = pos + 4;
    if question_end > query.len() {
        return None;
    }
    let qtype = u16::from_be_bytes([query[pos], query[pos + 1]]);
    let qclass = u16::from_be_bytes([query[pos + 2], query[pos + 3]]);
    let answer = qclass == QCLASS_IN && (qtype == QTYPE_A || qtype == QTYPE_ANY);

    let mut response = Vec::with_capacity(question_end + 16);
    response.extend_from_slice(&query[0..2]);
    let response_flags = FLAG_QR | FLAG_AA | FLAG_RA | (flags & FLAG_RD);
    response.extend_from_slice(&response_flags.to_be_bytes());
    response.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    response.extend_from_slice(&u16::from(answer).to_be_bytes()); // ANCOUNT
    response.extend_from_slice(&0u16.to_be_bytes()); // NSCOUNT
    response.extend_from_slice(&0u16.to_be_bytes()); // ARCOUNT
    response.extend_from_slice(&query[HEADER_LEN..question_end]);

    if answer {
        response.extend_from_slice(&[0xC0, HEADER_LEN as u8]); // pointer to the question name
        response.extend_from_slice(&QTYPE_A.to_be_bytes());
        response.extend_from_slice(&QCLASS_IN.to_be_bytes());
        response.extend_from_slice(&ANSWER_TTL.to_be_bytes());
        response.extend_from_slice(&4u16.to_be_bytes());
        response.extend_from_slice(&address.octets());
    }

    Some(response)
}

/// Catch-all DNS server for configuration mode.
#[derive(Debug)]
pub struct CaptiveDns {
    socket: UdpSocket,
    address: Ipv4Addr,
}

impl CaptiveDns {
    /// Bind on all interfaces at `port`, answering with `address`.
    pub async fn bind(port: u16, address: Ipv4Addr) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).await?;
        info!(port, address = %address, "Captive DNS listening");
        Ok(Self { socket, address })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Answer the queries already waiting on the socket. Never waits.
    ///
    /// Returns the number of responses sent.
    pub fn pump(&self) -> usize {
        let mut buf = [0u8; MAX_DATAGRAM];
        let mut answered = 0;

        for _ in 0..MAX_PER_PUMP {
            let (len, peer) = match self.socket.try_recv_from(&mut buf) {
                Ok(received) => received,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "DNS receive failed");
                    break;
                }
            };

            let Some(response) = build_response(&buf[..len], self.address) else {
                debug!(%peer, len, "Ignoring malformed DNS datagram");
                continue;
            };

            match self.socket.try_send_to(&response, peer) {
                Ok(_) => answered += 1,
                Err(e) => debug!(%peer, error = %e, "DNS reply dropped"),
            }
        }
        answered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const PORTAL: Ipv4Addr = Ipv4Addr::new(10, 42, 0, 1);

    fn query(id: u16, name: &[&str], qtype: u16) -> Vec<u8> {
        let mut q = Vec::new();
        q.extend_from_slice(&id.to_be_bytes());
        q.extend_from_slice(&[0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0]);
        for label in name {
            q.push(label.len() as u8);
            q.extend_from_slice(label.as_bytes());
        }
        q.push(0);
        q.extend_from_slice(&qtype.to_be_bytes());
        q.extend_from_slice(&QCLASS_IN.to_be_bytes());
        q
    }

    #[test]
    fn test_a_query_resolves_to_portal() {
        let q = query(0xBEEF, &["connectivitycheck", "gstatic", "com"], QTYPE_A);
        let r = build_response(&q, PORTAL).unwrap();

        assert_eq!(&r[0..2], &[0xBE, 0xEF]);
        let flags = u16::from_be_bytes([r[2], r[3]]);
        assert_ne!(flags & FLAG_QR, 0);
        assert_ne!(flags & FLAG_RD, 0);
        assert_eq!(u16::from_be_bytes([r[6], r[7]]), 1); // ANCOUNT
        // Question echoed
        assert_eq!(&r[HEADER_LEN..q.len()], &q[HEADER_LEN..]);
        // Answer: pointer, A, IN, TTL, len 4, address
        let answer = &r[q.len()..];
        assert_eq!(&answer[0..2], &[0xC0, 0x0C]);
        assert_eq!(&answer[2..6], &[0, 1, 0, 1]);
        assert_eq!(&answer[6..10], &60u32.to_be_bytes());
        assert_eq!(&answer[10..12], &[0, 4]);
        assert_eq!(&answer[12..], &PORTAL.octets());
    }

    #[test]
    fn test_aaaa_query_gets_empty_answer() {
        let q = query(7, &["captive", "apple", "com"], 28);
        let r = build_response(&q, PORTAL).unwrap();
        assert_eq!(u16::from_be_bytes([r[6], r[7]]), 0);
        assert_eq!(r.len(), q.len());
    }

    #[test]
    fn test_rejects_non_queries_and_truncation() {
        assert!(build_response(&[0u8; 5], PORTAL).is_none());

        let mut response_packet = query(1, &["a"], QTYPE_A);
        response_packet[2] |= 0x80;
        assert!(build_response(&response_packet, PORTAL).is_none());

        let q = query(1, &["example", "com"], QTYPE_A);
        assert!(build_response(&q[..q.len() - 2], PORTAL).is_none());

        let mut no_questions = query(1, &["a"], QTYPE_A);
        no_questions[5] = 0;
        assert!(build_response(&no_questions, PORTAL).is_none());
    }

    #[test]
    fn test_rejects_compressed_question_name() {
        let mut q = query(1, &[], QTYPE_A);
        q[HEADER_LEN] = 0xC0;
        assert!(build_response(&q, PORTAL).is_none());
    }

    #[tokio::test]
    async fn test_pump_answers_waiting_queries() {
        let dns = CaptiveDns::bind(0, PORTAL).await.unwrap();
        let port = dns.local_addr().unwrap().port();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(&query(42, &["example", "org"], QTYPE_A), ("127.0.0.1", port))
            .await
            .unwrap();

        let mut answered = 0;
        for _ in 0..100 {
            answered += dns.pump();
            if answered > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(answered, 1);

        let mut buf = [0u8; 512];
        let (len, _) = tokio::time::timeout(Duration::from_secs(1), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[len - 4..len], &PORTAL.octets());
    }

    #[tokio::test]
    async fn test_pump_without_queries_returns_immediately() {
        let dns = CaptiveDns::bind(0, PORTAL).await.unwrap();
        assert_eq!(dns.pump(), 0);
    }
}
