//! Local DNS listening service.
//!
//! # Responsibilities
//! - Answer A queries from the host table and the fake-IP pool
//! - Refuse everything else (upstream resolution is the forwarding engine's job)
//! - Rebind only when the listen address changes
//!
//! # Data Flow
//! ```text
//! UDP datagram → parse_question → LocalServer::answer_a → build_response → UDP reply
//! ```

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::dns::enhancer::Enhancer;
use crate::dns::resolver::Resolver;

const HEADER_LEN: usize = 12;
const TYPE_A: u16 = 1;
const CLASS_IN: u16 = 1;
const RCODE_FORMERR: u16 = 1;
const RCODE_REFUSED: u16 = 5;
const HOSTS_TTL: u32 = 10;
const FAKE_IP_TTL: u32 = 1;

/// Resolver and enhancer pair answering local queries.
pub struct LocalServer {
    resolver: Arc<Resolver>,
    enhancer: Arc<Enhancer>,
}

impl LocalServer {
    pub fn new(resolver: Arc<Resolver>, enhancer: Arc<Enhancer>) -> Self {
        Self { resolver, enhancer }
    }

    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }

    pub fn enhancer(&self) -> &Arc<Enhancer> {
        &self.enhancer
    }

    /// Local A answer and its TTL, if this server owns the name.
    pub fn answer_a(&self, name: &str) -> Option<(Vec<Ipv4Addr>, u32)> {
        let local: Vec<Ipv4Addr> = self
            .resolver
            .resolve_local(name)
            .into_iter()
            .filter_map(|ip| match ip {
                std::net::IpAddr::V4(v4) => Some(v4),
                std::net::IpAddr::V6(_) => None,
            })
            .collect();
        if !local.is_empty() {
            return Some((local, HOSTS_TTL));
        }
        self.enhancer
            .fake_ip_for(name)
            .map(|ip| (vec![ip], FAKE_IP_TTL))
    }

    /// Build the reply datagram for a query. `None` drops the datagram.
    pub fn handle(&self, query: &[u8]) -> Option<Vec<u8>> {
        let question = match parse_question(query) {
            Ok(q) => q,
            Err(WireError::TooShort) => return None,
            Err(WireError::Malformed) => return Some(error_response(query, RCODE_FORMERR)),
        };
        if question.qtype != TYPE_A || question.qclass != CLASS_IN {
            return Some(build_response(query, &question, RCODE_REFUSED, &[], 0));
        }
        match self.answer_a(&question.name) {
            Some((ips, ttl)) => Some(build_response(query, &question, 0, &ips, ttl)),
            None => Some(build_response(query, &question, RCODE_REFUSED, &[], 0)),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum WireError {
    TooShort,
    Malformed,
}

#[derive(Debug)]
struct Question {
    name: String,
    qtype: u16,
    qclass: u16,
    /// Offset just past the question section.
    end: usize,
}

fn read_u16(buf: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_be_bytes([*buf.get(at)?, *buf.get(at + 1)?]))
}

fn parse_question(buf: &[u8]) -> Result<Question, WireError> {
    if buf.len() < HEADER_LEN {
        return Err(WireError::TooShort);
    }
    let flags = read_u16(buf, 2).ok_or(WireError::TooShort)?;
    let qdcount = read_u16(buf, 4).ok_or(WireError::TooShort)?;
    // must be a standard query with exactly one question
    if flags & 0x8000 != 0 || (flags >> 11) & 0x0f != 0 || qdcount != 1 {
        return Err(WireError::Malformed);
    }

    let mut labels = Vec::new();
    let mut pos = HEADER_LEN;
    loop {
        let len = *buf.get(pos).ok_or(WireError::Malformed)? as usize;
        pos += 1;
        if len == 0 {
            break;
        }
        if len > 63 {
            return Err(WireError::Malformed);
        }
        let label = buf.get(pos..pos + len).ok_or(WireError::Malformed)?;
        labels.push(String::from_utf8_lossy(label).to_ascii_lowercase());
        pos += len;
    }
    let qtype = read_u16(buf, pos).ok_or(WireError::Malformed)?;
    let qclass = read_u16(buf, pos + 2).ok_or(WireError::Malformed)?;

    Ok(Question {
        name: labels.join("."),
        qtype,
        qclass,
        end: pos + 4,
    })
}

fn response_flags(query: &[u8], rcode: u16) -> u16 {
    let qflags = read_u16(query, 2).unwrap_or(0);
    // QR | opcode and RD from the query | RA | rcode
    0x8000 | (qflags & 0x7900) | 0x0080 | rcode
}

fn error_response(query: &[u8], rcode: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN);
    out.extend_from_slice(&query[..2]);
    out.extend_from_slice(&response_flags(query, rcode).to_be_bytes());
    out.extend_from_slice(&[0u8; 8]);
    out
}

fn build_response(query: &[u8], q: &Question, rcode: u16, ips: &[Ipv4Addr], ttl: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(q.end + ips.len() * 16);
    out.extend_from_slice(&query[..2]);
    out.extend_from_slice(&response_flags(query, rcode).to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes());
    out.extend_from_slice(&(ips.len() as u16).to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&query[HEADER_LEN..q.end]);
    for ip in ips {
        // pointer to the question name
        out.extend_from_slice(&0xc00cu16.to_be_bytes());
        out.extend_from_slice(&TYPE_A.to_be_bytes());
        out.extend_from_slice(&CLASS_IN.to_be_bytes());
        out.extend_from_slice(&ttl.to_be_bytes());
        out.extend_from_slice(&4u16.to_be_bytes());
        out.extend_from_slice(&ip.octets());
    }
    out
}

/// Control surface of the DNS listening service.
pub trait DnsServerControl: Send + Sync {
    /// (Re)start on `listen` with `handler`. An empty address or no handler stops the service.
    fn recreate(&self, listen: &str, handler: Option<Arc<LocalServer>>);
    fn local_addr(&self) -> Option<SocketAddr>;
}

struct Running {
    listen: String,
    local: SocketAddr,
    task: JoinHandle<()>,
}

#[derive(Default)]
pub struct DnsServer {
    running: Mutex<Option<Running>>,
    handler: Arc<ArcSwapOption<LocalServer>>,
}

impl DnsServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn stop(&self) {
        if let Some(running) = self.running.lock().take() {
            running.task.abort();
            tracing::info!(address = %running.local, "[DNS] server stopped");
        }
    }

    fn bind(listen: &str) -> std::io::Result<UdpSocket> {
        let addr: SocketAddr = listen
            .parse()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let socket = std::net::UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        UdpSocket::from_std(socket)
    }
}

async fn serve(socket: UdpSocket, handler: Arc<ArcSwapOption<LocalServer>>) {
    let mut buf = vec![0u8; 4096];
    loop {
        let (n, peer) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(error = %e, "[DNS] receive failed");
                continue;
            }
        };
        let reply = match handler.load_full() {
            Some(h) => h.handle(&buf[..n]),
            None if n >= HEADER_LEN => Some(error_response(&buf[..n], RCODE_REFUSED)),
            None => None,
        };
        if let Some(reply) = reply {
            if let Err(e) = socket.send_to(&reply, peer).await {
                tracing::debug!(peer = %peer, error = %e, "[DNS] reply failed");
            }
        }
    }
}

impl DnsServerControl for DnsServer {
    fn recreate(&self, listen: &str, handler: Option<Arc<LocalServer>>) {
        let enabled = handler.is_some() && !listen.is_empty();
        self.handler.store(handler);

        if !enabled {
            self.stop();
            return;
        }

        if let Some(running) = self.running.lock().as_ref() {
            if running.listen == listen && !running.task.is_finished() {
                return;
            }
        }
        self.stop();

        let socket = match Self::bind(listen) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(address = %listen, error = %e, "[DNS] server listen failed");
                return;
            }
        };
        let local = match socket.local_addr() {
            Ok(a) => a,
            Err(e) => {
                tracing::error!(address = %listen, error = %e, "[DNS] server listen failed");
                return;
            }
        };

        let task = tokio::spawn(serve(socket, self.handler.clone()));
        tracing::info!(address = %local, "[DNS] server listening");
        *self.running.lock() = Some(Running {
            listen: listen.to_string(),
            local,
            task,
        });
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::schema::{DnsConfig, EnhancedMode};
    use std::collections::HashMap;
    use std::time::Duration;

    pub(crate) fn query(name: &str, qtype: u16) -> Vec<u8> {
        let mut out = vec![0x12, 0x34, 0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0];
        for label in name.split('.') {
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
        out.push(0);
        out.extend_from_slice(&qtype.to_be_bytes());
        out.extend_from_slice(&CLASS_IN.to_be_bytes());
        out
    }

    pub(crate) fn answer_ip(reply: &[u8]) -> Option<Ipv4Addr> {
        let ancount = read_u16(reply, 6)?;
        if ancount == 0 {
            return None;
        }
        let n = reply.len();
        Some(Ipv4Addr::new(reply[n - 4], reply[n - 3], reply[n - 2], reply[n - 1]))
    }

    fn local_server() -> LocalServer {
        let cfg = DnsConfig {
            enable: true,
            enhanced_mode: EnhancedMode::FakeIp,
            ..Default::default()
        };
        let resolver = Resolver::new(&cfg, None, &HashMap::new(), true);
        let enhancer =
            Enhancer::new(cfg.enhanced_mode, cfg.fake_ip_range, cfg.fake_ip_filter.clone()).unwrap();
        LocalServer::new(Arc::new(resolver), Arc::new(enhancer))
    }

    #[test]
    fn test_fake_ip_answer() {
        let server = local_server();
        let reply = server.handle(&query("example.com", TYPE_A)).unwrap();
        assert_eq!(&reply[..2], &[0x12, 0x34]);
        assert_eq!(read_u16(&reply, 2).unwrap() & 0x000f, 0);
        assert_eq!(answer_ip(&reply), Some(Ipv4Addr::new(198, 18, 0, 2)));
    }

    #[test]
    fn test_non_a_is_refused() {
        let server = local_server();
        let reply = server.handle(&query("example.com", 28)).unwrap();
        assert_eq!(read_u16(&reply, 2).unwrap() & 0x000f, RCODE_REFUSED);
        assert_eq!(answer_ip(&reply), None);

        assert!(server.handle(&[0u8; 4]).is_none());
    }

    #[tokio::test]
    async fn test_server_answers_over_udp_and_stops() {
        let server = DnsServer::new();
        server.recreate("127.0.0.1:0", Some(Arc::new(local_server())));
        let addr = server.local_addr().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&query("example.com", TYPE_A), addr).await.unwrap();
        let mut buf = [0u8; 512];
        let n = tokio::time::timeout(Duration::from_secs(2), client.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(answer_ip(&buf[..n]), Some(Ipv4Addr::new(198, 18, 0, 2)));

        server.recreate("", None);
        assert!(server.local_addr().is_none());
    }
}
