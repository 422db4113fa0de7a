/*
FaF Firewall is a personal firewall verdict engine and DNS proxy
Copyright (C) 2022  James Bates

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/

//! One query attempt against one upstream resolver, over plain UDP, DNS over HTTPS or DNS over TLS.

use crate::dns::DnsResponse;
use crate::error::{Error, Result};
use crate::resolver::{Resolver, ResolverProtocol};

/// Largest UDP reply accepted from an upstream
const UDP_RESPONSE_BUF_LEN: usize = 4096;

const DNS_MESSAGE_MIME: &str = "application/dns-message";

/// Transport seam of the DNS server. Every call is a single attempt: retries and failure accounting belong to the
/// caller.
pub trait UpstreamClient: Send + Sync + 'static {
   fn query(
      &self,
      resolver: &Resolver,
      domain: &str,
      query_type: u16,
      timeout: std::time::Duration,
      cancel: &tokio_util::sync::CancellationToken,
   ) -> impl std::future::Future<Output = Result<DnsResponse>> + Send;

   /// Reverse lookup of `ip` through `resolver`
   fn query_ptr(
      &self,
      resolver: &Resolver,
      ip: std::net::IpAddr,
      timeout: std::time::Duration,
      cancel: &tokio_util::sync::CancellationToken,
   ) -> impl std::future::Future<Output = Result<crate::dns::DnsLookup>> + Send {
      async move {
         let ptr_domain = crate::dns::ptr_domain_for_ip(&ip);
         let response = self.query(resolver, &ptr_domain, crate::dns::TYPE_PTR, timeout, cancel).await?;
         Ok(crate::dns::DnsLookup {
            ip,
            ptr_records: response.ptr_records,
            resolved_by: response.resolved_by,
            resolved_in: response.resolved_in,
         })
      }
   }
}

/// The network backed client used by the running server
pub struct DnsClients {
   // DoH clients pin the resolver's address for its domain, so one client per resolver
   doh_clients: dashmap::DashMap<Resolver, reqwest::Client, ahash::RandomState>,
}

impl Default for DnsClients {
   fn default() -> Self {
      Self::new()
   }
}

impl DnsClients {
   pub fn new() -> Self {
      Self { doh_clients: dashmap::DashMap::with_hasher(ahash::RandomState::new()) }
   }

   async fn send(&self, resolver: &Resolver, query: &[u8]) -> Result<Vec<u8>> {
      match resolver.protocol {
         ResolverProtocol::Udp => query_udp(resolver, query).await,
         ResolverProtocol::Doh => {
            let client = self.doh_client(resolver)?;
            query_doh(&client, resolver, query).await
         }
         ResolverProtocol::Dot => query_dot(resolver, query).await,
      }
   }

   fn doh_client(&self, resolver: &Resolver) -> Result<reqwest::Client> {
      if let Some(client) = self.doh_clients.get(resolver) {
         return Ok(client.clone());
      }

      let mut builder = reqwest::ClientBuilder::new().min_tls_version(reqwest::tls::Version::TLS_1_2);
      if let Some(domain) = &resolver.domain {
         builder = builder.resolve(domain, resolver.socket_addr());
      }
      let client = builder.build()?;
      self.doh_clients.insert(resolver.clone(), client.clone());
      Ok(client)
   }
}

impl UpstreamClient for DnsClients {
   async fn query(
      &self,
      resolver: &Resolver,
      domain: &str,
      query_type: u16,
      timeout: std::time::Duration,
      cancel: &tokio_util::sync::CancellationToken,
   ) -> Result<DnsResponse> {
      let query = crate::dns::build_query(domain, query_type)?;
      let started = std::time::Instant::now();

      let raw = tokio::select! {
         biased;
         _ = cancel.cancelled() => Err(Error::Cancelled),
         reply = tokio::time::timeout(timeout, self.send(resolver, &query)) => match reply {
            Ok(reply) => reply,
            Err(_) => Err(Error::Timeout(timeout)),
         },
      };

      let raw = match raw {
         Ok(raw) => raw,
         Err(err) => {
            match &err {
               Error::Timeout(_) => tracing::warn!("DnsServerTimeout {}: {} using {}", resolver.protocol, domain, resolver.name),
               Error::Cancelled => (),
               _ => tracing::warn!("DnsServerFail {}: {} using {}: {}", resolver.protocol, domain, resolver.name, err),
            }
            return Err(err);
         }
      };

      let mut response = match DnsResponse::parse(&raw) {
         Ok(response) => response,
         Err(err) => {
            tracing::warn!("DnsServerFail {}: {} using {}: {}", resolver.protocol, domain, resolver.name, err);
            return Err(err);
         }
      };

      if response.domain.is_empty() {
         response.domain = domain.to_string();
         response.query_type = query_type;
      }
      response.resolved_by = resolver.name.clone();
      response.resolved_in = started.elapsed();

      if crate::dns::is_blocked_upstream(&raw, &response, resolver.blocked_if) {
         response.blocked = true;
         response.blocked_by = resolver.name.clone();
         response.blocked_reason = format!("Upstream {}", resolver.blocked_if);
      }

      Ok(response)
   }
}

async fn query_udp(resolver: &Resolver, query: &[u8]) -> Result<Vec<u8>> {
   let bind_addr: std::net::SocketAddr = match resolver.ip {
      std::net::IpAddr::V4(_) => (std::net::Ipv4Addr::UNSPECIFIED, 0).into(),
      std::net::IpAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, 0).into(),
   };

   let socket = tokio::net::UdpSocket::bind(bind_addr).await?;
   socket.connect(resolver.socket_addr()).await?;
   socket.send(query).await?;

   // replies to someone else's query are skipped; the caller's timeout bounds the wait
   let mut buf = vec![0; UDP_RESPONSE_BUF_LEN];
   loop {
      let read = socket.recv(&mut buf).await?;
      if read <= crate::dns::HEADER_LEN {
         return Err(Error::MalformedDns("reply too short"));
      }
      if !same_transaction(query, &buf[..read]) {
         tracing::debug!("Discarding reply with mismatched id from {}", resolver.name);
         continue;
      }
      buf.truncate(read);
      return Ok(buf);
   }
}

#[inline]
fn same_transaction(query: &[u8], reply: &[u8]) -> bool {
   query.len() >= 2 && reply.len() >= 2 && query[..2] == reply[..2]
}

async fn query_doh(client: &reqwest::Client, resolver: &Resolver, query: &[u8]) -> Result<Vec<u8>> {
   let url = match (&resolver.domain, resolver.ip) {
      (Some(domain), _) => format!("https://{}:{}/dns-query", domain, resolver.port),
      (None, std::net::IpAddr::V4(ip)) => format!("https://{}:{}/dns-query", ip, resolver.port),
      (None, std::net::IpAddr::V6(ip)) => format!("https://[{}]:{}/dns-query", ip, resolver.port),
   };

   let response = client
      .post(url)
      .header(reqwest::header::CONTENT_TYPE, DNS_MESSAGE_MIME)
      .header(reqwest::header::ACCEPT, DNS_MESSAGE_MIME)
      .body(query.to_vec())
      .send()
      .await?
      .error_for_status()?;

   let body = response.bytes().await?;
   if body.len() <= crate::dns::HEADER_LEN {
      return Err(Error::MalformedDns("reply too short"));
   }
   Ok(body.to_vec())
}

async fn query_dot(resolver: &Resolver, query: &[u8]) -> Result<Vec<u8>> {
   use tokio::io::{AsyncReadExt, AsyncWriteExt};

   let server_name = crate::tls::server_name(resolver.domain.as_deref(), resolver.ip)?;

   let tcp_stream = tokio::net::TcpStream::connect(resolver.socket_addr()).await?;
   let _ = tcp_stream.set_nodelay(true);

   let mut tls_stream = crate::tls::TLS_CONNECTOR
      .connect(server_name, tcp_stream)
      .await
      .map_err(|err| Error::Tls(format!("handshake with {} failed: {}", resolver.socket_addr(), err)))?;

   let mut framed = Vec::with_capacity(query.len() + 2);
   framed.extend_from_slice(&(query.len() as u16).to_be_bytes());
   framed.extend_from_slice(query);
   tls_stream.write_all(&framed).await?;
   tls_stream.flush().await?;

   let len = tls_stream.read_u16().await? as usize;
   if len <= crate::dns::HEADER_LEN {
      return Err(Error::MalformedDns("reply too short"));
   }
   let mut buf = vec![0; len];
   tls_stream.read_exact(&mut buf).await?;

   let _ = tls_stream.shutdown().await;
   Ok(buf)
}

#[cfg(test)]
mod tests {
   use super::*;

   fn answer_for(query: &[u8], ip: std::net::Ipv4Addr) -> Vec<u8> {
      let resolved = DnsResponse { ipv4: vec![ip], ttl: 60, ..Default::default() };
      crate::dns::build_response(query, &resolved).unwrap()
   }

   #[tokio::test]
   async fn udp_reply_with_foreign_id_is_ignored() {
      let upstream = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
      let upstream_addr = upstream.local_addr().unwrap();

      tokio::spawn(async move {
         let mut buf = vec![0; 512];
         let (read, from) = upstream.recv_from(&mut buf).await.unwrap();
         let mut spoofed = answer_for(&buf[..read], std::net::Ipv4Addr::new(6, 6, 6, 6));
         spoofed[0] ^= 0xff;
         upstream.send_to(&spoofed, from).await.unwrap();
         let genuine = answer_for(&buf[..read], std::net::Ipv4Addr::new(93, 184, 216, 34));
         upstream.send_to(&genuine, from).await.unwrap();
      });

      let resolver = Resolver::parse(&format!("dns://127.0.0.1:{}?name=Local", upstream_addr.port())).unwrap();
      let clients = DnsClients::new();
      let cancel = tokio_util::sync::CancellationToken::new();
      let response = clients
         .query(&resolver, "example.com", crate::dns::TYPE_A, std::time::Duration::from_secs(2), &cancel)
         .await
         .unwrap();

      assert_eq!(response.ipv4, vec![std::net::Ipv4Addr::new(93, 184, 216, 34)]);
   }

   #[test]
   fn transaction_ids_are_compared() {
      assert!(same_transaction(&[0x12, 0x34, 1], &[0x12, 0x34, 9]));
      assert!(!same_transaction(&[0x12, 0x34, 1], &[0x12, 0x35, 1]));
      assert!(!same_transaction(&[0x12], &[0x12, 0x34]));
   }

   #[tokio::test]
   async fn udp_query_parses_reply() {
      let upstream = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
      let upstream_addr = upstream.local_addr().unwrap();

      tokio::spawn(async move {
         let mut buf = vec![0; 512];
         let (read, from) = upstream.recv_from(&mut buf).await.unwrap();
         let reply = answer_for(&buf[..read], std::net::Ipv4Addr::new(93, 184, 216, 34));
         upstream.send_to(&reply, from).await.unwrap();
      });

      let resolver = Resolver::parse(&format!("dns://127.0.0.1:{}?name=Local", upstream_addr.port())).unwrap();
      let clients = DnsClients::new();
      let cancel = tokio_util::sync::CancellationToken::new();
      let response = clients
         .query(&resolver, "example.com", crate::dns::TYPE_A, std::time::Duration::from_secs(2), &cancel)
         .await
         .unwrap();

      assert_eq!(response.domain, "example.com");
      assert_eq!(response.ipv4, vec![std::net::Ipv4Addr::new(93, 184, 216, 34)]);
      assert_eq!(response.resolved_by, "Local");
      assert!(!response.blocked);
   }

   #[tokio::test]
   async fn zero_ip_reply_is_marked_blocked() {
      let upstream = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
      let upstream_addr = upstream.local_addr().unwrap();

      tokio::spawn(async move {
         let mut buf = vec![0; 512];
         let (read, from) = upstream.recv_from(&mut buf).await.unwrap();
         let reply = answer_for(&buf[..read], std::net::Ipv4Addr::UNSPECIFIED);
         upstream.send_to(&reply, from).await.unwrap();
      });

      let resolver = Resolver::parse(&format!("dns://127.0.0.1:{}?name=Filtered&blockedIf=zeroip", upstream_addr.port())).unwrap();
      let cancel = tokio_util::sync::CancellationToken::new();
      let response = DnsClients::new()
         .query(&resolver, "ads.example.com", crate::dns::TYPE_A, std::time::Duration::from_secs(2), &cancel)
         .await
         .unwrap();

      assert!(response.blocked);
      assert_eq!(response.blocked_by, "Filtered");
   }

   #[tokio::test]
   async fn silent_upstream_times_out() {
      // bound but never answers
      let upstream = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
      let upstream_addr = upstream.local_addr().unwrap();

      let resolver = Resolver::parse(&format!("dns://127.0.0.1:{}", upstream_addr.port())).unwrap();
      let cancel = tokio_util::sync::CancellationToken::new();
      let err = DnsClients::new()
         .query(&resolver, "example.com", crate::dns::TYPE_A, std::time::Duration::from_millis(100), &cancel)
         .await
         .unwrap_err();

      assert!(err.is_timeout());
      drop(upstream);
   }

   #[tokio::test]
   async fn cancellation_wins_over_a_pending_reply() {
      let upstream = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
      let upstream_addr = upstream.local_addr().unwrap();

      let resolver = Resolver::parse(&format!("dns://127.0.0.1:{}", upstream_addr.port())).unwrap();
      let cancel = tokio_util::sync::CancellationToken::new();
      cancel.cancel();
      let err = DnsClients::new()
         .query(&resolver, "example.com", crate::dns::TYPE_A, std::time::Duration::from_secs(5), &cancel)
         .await
         .unwrap_err();

      assert!(matches!(err, Error::Cancelled));
      drop(upstream);
   }

   #[tokio::test]
   async fn ptr_lookup_collects_names() {
      let upstream = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
      let upstream_addr = upstream.local_addr().unwrap();

      tokio::spawn(async move {
         let mut buf = vec![0; 512];
         let (read, from) = upstream.recv_from(&mut buf).await.unwrap();
         let reply = crate::dns::build_ptr_response(&buf[..read], &["one.one.one.one".to_string()], 300).unwrap();
         upstream.send_to(&reply, from).await.unwrap();
      });

      let resolver = Resolver::parse(&format!("dns://127.0.0.1:{}?name=Local", upstream_addr.port())).unwrap();
      let cancel = tokio_util::sync::CancellationToken::new();
      let lookup = DnsClients::new()
         .query_ptr(&resolver, "1.1.1.1".parse().unwrap(), std::time::Duration::from_secs(2), &cancel)
         .await
         .unwrap();

      assert_eq!(lookup.ptr_records, vec!["one.one.one.one".to_string()]);
      assert_eq!(lookup.resolved_by, "Local");
   }
}
