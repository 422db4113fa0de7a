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

//! Local DNS server: validation, cache, single-flight dedup, blocklists, CNAME chasing and resolver failover.
//!
//! A blocked answer is resolved and cached like any other but never sent, so the client times out instead of
//! learning that it was filtered.

use crate::cache::{CacheKey, CacheLookup};
use crate::clients::UpstreamClient;
use crate::dns::DnsResponse;
use crate::stats::DnsStats;

/// Largest datagram read from a client
const MAX_QUERY_LEN: usize = 4096;

const SWEEP_INTERVAL_MS: u64 = 1000;
const RESTART_DELAY_MS: u64 = 1000;

/// How a single client query ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryOutcome {
   Invalid,
   CacheHit,
   CacheHitBlocked,
   /// Joined a resolution already in flight for the same domain and type
   Deduplicated,
   Resolved { replies: usize },
   Blocked,
   Failed,
}

/// A client waiting on an in-flight resolution, with its own query to answer
struct PendingClient {
   addr: std::net::SocketAddr,
   query: Vec<u8>,
}

/// Host name lookup for remote addresses, used to label connections
pub trait ReverseLookup: Send + Sync {
   fn reverse_lookup(
      &self,
      ip: std::net::IpAddr,
   ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Option<String>> + Send + '_>>;
}

pub struct DnsServer<C> {
   settings: std::sync::Arc<crate::settings::SettingsHandle>,
   blocklists: std::sync::Arc<crate::blocklist::BlocklistManager>,
   client: C,
   pool: crate::resolver::ResolverPool,
   configured_resolvers: std::sync::Mutex<Vec<String>>,
   cache: crate::cache::DnsCache,
   store: crate::cache::ResponseStore,
   pending: dashmap::DashMap<CacheKey, Vec<PendingClient>, ahash::RandomState>,
   semaphore: arc_swap::ArcSwap<tokio::sync::Semaphore>,
   semaphore_size: std::sync::atomic::AtomicUsize,
   socket: tokio::sync::RwLock<Option<std::sync::Arc<tokio::net::UdpSocket>>>,
   listen_addr: std::net::SocketAddr,
   cancel: tokio_util::sync::CancellationToken,
   pub stats: DnsStats,
}

enum Received {
   Cancelled,
   SettingsChanged,
   Datagram(std::io::Result<(usize, std::net::SocketAddr)>),
}

impl<C: UpstreamClient> DnsServer<C> {
   pub fn new(
      settings: std::sync::Arc<crate::settings::SettingsHandle>,
      blocklists: std::sync::Arc<crate::blocklist::BlocklistManager>,
      client: C,
      listen_addr: std::net::SocketAddr,
      cancel: tokio_util::sync::CancellationToken,
   ) -> std::sync::Arc<Self> {
      let dns_settings = settings.settings().dns_server.clone();
      let pool = crate::resolver::ResolverPool::from_uris(&dns_settings.resolvers);
      tracing::info!("Loaded {} resolvers", pool.len());
      for state in pool.snapshot() {
         tracing::debug!("  {}", state.resolver);
      }

      let permits = dns_settings.max_concurrent_queries.max(1);
      std::sync::Arc::new(Self {
         settings,
         blocklists,
         client,
         pool,
         configured_resolvers: std::sync::Mutex::new(dns_settings.resolvers),
         cache: crate::cache::DnsCache::new(),
         store: crate::cache::ResponseStore::new(crate::statics::RESPONSE_STORE_CAPACITY),
         pending: dashmap::DashMap::with_hasher(ahash::RandomState::new()),
         semaphore: arc_swap::ArcSwap::from_pointee(tokio::sync::Semaphore::new(permits)),
         semaphore_size: std::sync::atomic::AtomicUsize::new(permits),
         socket: tokio::sync::RwLock::new(None),
         listen_addr,
         cancel,
         stats: DnsStats::default(),
      })
   }

   #[inline]
   pub fn cache(&self) -> &crate::cache::DnsCache {
      &self.cache
   }

   #[inline]
   pub fn store(&self) -> &crate::cache::ResponseStore {
      &self.store
   }

   #[inline]
   pub fn pool(&self) -> &crate::resolver::ResolverPool {
      &self.pool
   }

   /// Receive loop. Runs until cancelled, idling while the server is disabled in the settings and recreating the
   /// socket whenever a read fails.
   pub async fn run(self: std::sync::Arc<Self>) {
      tokio::spawn(self.clone().sweep_loop());

      let mut changes = self.settings.subscribe();
      let mut restarts: u64 = 0;

      loop {
         if self.cancel.is_cancelled() {
            break;
         }

         if !self.settings.settings().dns_server.is_enabled {
            if self.socket.write().await.take().is_some() {
               tracing::info!("DnsServerWorker disabling");
            }
            tokio::select! {
               _ = self.cancel.cancelled() => break,
               _ = changes.changed() => continue,
            }
         }

         let mut buf = vec![0; MAX_QUERY_LEN];
         let received = {
            // held for the whole read so a restart cannot swap the socket out from under it
            let guard = self.socket.read().await;
            match guard.as_ref() {
               Some(socket) => Some(tokio::select! {
                  biased;
                  _ = self.cancel.cancelled() => Received::Cancelled,
                  _ = changes.changed() => Received::SettingsChanged,
                  result = socket.recv_from(&mut buf) => Received::Datagram(result),
               }),
               None => None,
            }
         };

         match received {
            None => {
               restarts += 1;
               self.restart(restarts).await;
            }
            Some(Received::Cancelled) => break,
            Some(Received::SettingsChanged) => continue,
            Some(Received::Datagram(Ok((len, client)))) => {
               buf.truncate(len);
               let server = self.clone();
               tokio::spawn(async move {
                  server.handle_query(buf, client).await;
               });
            }
            Some(Received::Datagram(Err(err))) => {
               tracing::error!("DnsServerError in worker: {}", err);
               self.socket.write().await.take();
            }
         }
      }

      self.socket.write().await.take();
      tracing::info!("DnsServerWorker stopped");
   }

   async fn restart(&self, attempt: u64) {
      if attempt > 1 {
         tracing::info!("DnsServerWorker attempting restart...");
      }

      let mut socket = self.socket.write().await;
      socket.take();

      match bind(self.listen_addr).await {
         Ok(bound) => {
            tracing::info!("DnsServerWorker listening on {}", self.listen_addr);
            *socket = Some(std::sync::Arc::new(bound));
         }
         Err(err) => {
            drop(socket);
            if crate::util::is_power_of_2(attempt) {
               tracing::error!("DnsServerWorker restart failed {}x: {}", attempt, err);
            }
            tokio::select! {
               _ = self.cancel.cancelled() => (),
               _ = tokio::time::sleep(std::time::Duration::from_millis(RESTART_DELAY_MS)) => (),
            }
         }
      }
   }

   /// Runs one client query through the whole pipeline
   pub async fn handle_query(&self, raw: Vec<u8>, client: std::net::SocketAddr) -> QueryOutcome {
      DnsStats::increment(&self.stats.queries);

      let query = match crate::dns::validate_query(&raw) {
         Ok(query) => query,
         Err(err) => {
            tracing::debug!("DnsServerError: Invalid query received from {}: {}", client, err);
            DnsStats::increment(&self.stats.invalid);
            return QueryOutcome::Invalid;
         }
      };
      tracing::trace!(
         "DnsServerQuery: {} {} from {}",
         query.domain,
         crate::dns::query_type_to_string(query.query_type),
         client
      );

      match self.cache.lookup(&query.domain, query.query_type) {
         CacheLookup::Hit(response) => {
            tracing::debug!("DnsServerCache: {}", query.domain);
            DnsStats::increment(&self.stats.cache_hits);
            self.reply(client, &query.raw, query.query_type, &response).await;
            return QueryOutcome::CacheHit;
         }
         CacheLookup::HitBlocked(_) => {
            tracing::debug!("DnsServerCacheBlocked: {}", query.domain);
            return QueryOutcome::CacheHitBlocked;
         }
         CacheLookup::Miss => (),
      }

      let key = crate::cache::cache_key(&query.domain, query.query_type);
      match self.pending.entry(key.clone()) {
         dashmap::mapref::entry::Entry::Occupied(mut waiting) => {
            waiting.get_mut().push(PendingClient { addr: client, query: query.raw });
            DnsStats::increment(&self.stats.deduplicated);
            return QueryOutcome::Deduplicated;
         }
         dashmap::mapref::entry::Entry::Vacant(slot) => {
            slot.insert(vec![PendingClient { addr: client, query: query.raw.clone() }]);
         }
      }

      let settings = self.settings.settings();
      let query_cancel = self.cancel.child_token();
      let semaphore = self.semaphore.load_full();

      let permit = tokio::select! {
         biased;
         _ = query_cancel.cancelled() => None,
         permit = tokio::time::timeout(settings.dns_server.query_timeout(), semaphore.acquire_owned()) => {
            permit.ok().and_then(|permit| permit.ok())
         },
      };
      let Some(_permit) = permit else {
         tracing::debug!("DnsServerQueryCancelled while waiting: {}", query.domain);
         self.pending.remove(&key);
         DnsStats::increment(&self.stats.failed);
         return QueryOutcome::Failed;
      };

      // resolved even when listed so upstream usage looks the same either way
      let listed = self.blocklist_match(&settings, &query.domain);
      let resolved = self.resolve_recursively(&query.domain, query.query_type, &query_cancel).await;
      let clients = self.pending.remove(&key).map(|(_, clients)| clients).unwrap_or_default();

      let Some(mut response) = resolved else {
         tracing::debug!("DnsServerNoResponse: {} for {} clients", query.domain, clients.len());
         DnsStats::increment(&self.stats.failed);
         return QueryOutcome::Failed;
      };

      response.domain = query.domain.clone();
      response.query_type = query.query_type;
      if let Some((blocked_by, blocked_reason)) = listed {
         response.blocked = true;
         response.blocked_by = blocked_by;
         response.blocked_reason = blocked_reason;
      }

      self.cache.insert(response.clone());
      self.store.push(response.clone());
      tracing::info!("DnsServerResponse: {}", response);

      if response.blocked {
         DnsStats::increment(&self.stats.blocked);
         tracing::debug!("DnsServerPendingBlocked: {} for {} clients", query.domain, clients.len());
         return QueryOutcome::Blocked;
      }

      DnsStats::increment(&self.stats.resolved);
      for waiting in &clients {
         self.reply(waiting.addr, &waiting.query, query.query_type, &response).await;
      }
      QueryOutcome::Resolved { replies: clients.len() }
   }

   /// `(list name, reason)` of the first enabled domain list naming `domain`
   fn blocklist_match(&self, settings: &crate::settings::ApplicationSettings, domain: &str) -> Option<(String, String)> {
      let enabled = crate::blocklist::enabled_blocklist_names(&settings.blocklists, None);
      if let Some(list) = self.blocklists.match_domain(domain, &enabled) {
         return Some((list.name.clone(), format!("Blocklist {}", list.name)));
      }

      if settings.network_action.block_bypass_dns && self.blocklists.is_dns_domain(domain) {
         let name = crate::blocklist::DNS_DOMAINS.to_string();
         return Some((name.clone(), format!("Blocklist {name}")));
      }

      None
   }

   /// Resolves `domain`, following CNAMEs that come back without addresses. The chase stops on a repeated target or
   /// after `MAX_CNAME_CHAIN` hops and returns what it has so far.
   pub async fn resolve_recursively(
      &self,
      domain: &str,
      query_type: u16,
      cancel: &tokio_util::sync::CancellationToken,
   ) -> Option<DnsResponse> {
      let mut response = self.try_resolvers(domain, query_type, cancel).await?;
      let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();
      let mut current = response.clone();

      while !current.has_ip_address() {
         let Some(target) = current.cnames.last().cloned() else {
            break;
         };
         if seen.contains(&target) || seen.len() >= crate::statics::MAX_CNAME_CHAIN {
            break;
         }
         seen.insert(target.clone());

         let Some(deeper) = self.try_resolvers(&target, query_type, cancel).await else {
            break;
         };
         response.merge_from(&deeper);
         current = deeper;
      }

      Some(response)
   }

   /// One resolver, chosen up front, tried up to `max_retries` times with a fixed pause between attempts
   async fn try_resolvers(
      &self,
      domain: &str,
      query_type: u16,
      cancel: &tokio_util::sync::CancellationToken,
   ) -> Option<DnsResponse> {
      let settings = self.settings.settings();
      let dns_settings = &settings.dns_server;

      let Some(resolver) = self.pool.select(dns_settings.selection_strategy()) else {
         tracing::warn!("DnsServerNoResolvers: No available resolvers for {}", domain);
         return None;
      };

      let attempts = dns_settings.max_retries.max(1);
      for attempt in 0..attempts {
         if cancel.is_cancelled() {
            break;
         }

         match self.client.query(&resolver, domain, query_type, dns_settings.query_timeout(), cancel).await {
            Ok(response) => {
               self.pool.record_success(&resolver);
               return Some(response);
            }
            Err(crate::error::Error::Cancelled) => break,
            Err(err) => {
               let marked = self.pool.record_failure(&resolver, dns_settings.max_retries);
               tracing::debug!(
                  "DnsServerFailCount: {} ({}:{}) attempt {}/{} marked failing: {} - {}",
                  resolver.name,
                  resolver.protocol,
                  resolver.ip,
                  attempt + 1,
                  attempts,
                  marked,
                  err
               );

               if attempt + 1 < attempts {
                  tokio::select! {
                     _ = cancel.cancelled() => break,
                     _ = tokio::time::sleep(std::time::Duration::from_millis(crate::statics::RESOLVER_RETRY_DELAY_MS)) => (),
                  }
               }
            }
         }
      }

      None
   }

   async fn reply(&self, client: std::net::SocketAddr, query: &[u8], query_type: u16, response: &DnsResponse) {
      let packet = if query_type == crate::dns::TYPE_PTR && !response.ptr_records.is_empty() {
         crate::dns::build_ptr_response(query, &response.ptr_records, response.ttl)
      } else {
         crate::dns::build_response(query, response)
      };

      let packet = match packet {
         Ok(packet) => packet,
         Err(err) => {
            tracing::error!("Failed to build response for {}: {}", response.domain, err);
            return;
         }
      };

      let socket = self.socket.read().await.clone();
      if let Some(socket) = socket {
         match socket.send_to(&packet, client).await {
            Ok(0) => tracing::error!("Failed to write response to the client. 0 bytes written to {}", client),
            Ok(_) => (),
            Err(err) => tracing::error!("Failed to write response to {} with error: {}", client, err),
         }
      }
   }

   async fn sweep_loop(self: std::sync::Arc<Self>) {
      let mut interval = tokio::time::interval(std::time::Duration::from_millis(SWEEP_INTERVAL_MS));
      interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

      loop {
         tokio::select! {
            _ = self.cancel.cancelled() => return,
            _ = interval.tick() => self.sweep(std::time::Instant::now()),
         }
      }
   }

   /// Resolver recovery, cache and response store pruning, and pickup of changed DNS settings
   pub fn sweep(&self, now: std::time::Instant) {
      let settings = self.settings.settings();
      let dns_settings = &settings.dns_server;

      self.refresh_settings(dns_settings);

      for resolver in self.pool.recover(dns_settings.resolver_recovery_time(), now) {
         tracing::info!("DnsServerFailingRecover {}", resolver.name);
      }

      let evicted = self.cache.evict_expired();
      let pruned = self.store.prune(std::time::Duration::from_secs(dns_settings.response_store_time));
      if evicted > 0 || pruned > 0 {
         tracing::trace!("DNS sweep evicted {} cache entries, pruned {} stored responses", evicted, pruned);
      }
   }

   fn refresh_settings(&self, dns_settings: &crate::settings::DnsServerSettings) {
      {
         let mut configured = self.configured_resolvers.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
         if *configured != dns_settings.resolvers {
            self.pool.replace(crate::resolver::parse_resolvers(&dns_settings.resolvers));
            tracing::info!("Loaded {} resolvers", self.pool.len());
            *configured = dns_settings.resolvers.clone();
         }
      }

      let permits = dns_settings.max_concurrent_queries.max(1);
      if self.semaphore_size.swap(permits, std::sync::atomic::Ordering::Relaxed) != permits {
         self.semaphore.store(std::sync::Arc::new(tokio::sync::Semaphore::new(permits)));
      }
   }
}

impl<C: UpstreamClient> ReverseLookup for DnsServer<C> {
   fn reverse_lookup(
      &self,
      ip: std::net::IpAddr,
   ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Option<String>> + Send + '_>> {
      Box::pin(async move {
         let settings = self.settings.settings();
         if !settings.dns_server.is_enabled {
            return None;
         }
         let resolver = self.pool.select(settings.dns_server.selection_strategy())?;
         match self.client.query_ptr(&resolver, ip, settings.dns_server.query_timeout(), &self.cancel).await {
            Ok(lookup) => lookup.ptr_records.into_iter().next(),
            Err(err) => {
               tracing::trace!("Reverse lookup of {} failed: {}", ip, err);
               None
            }
         }
      })
   }
}

/// Dual-stack listener where the platform allows it, IPv4 only otherwise
async fn bind(listen_addr: std::net::SocketAddr) -> std::io::Result<tokio::net::UdpSocket> {
   match tokio::net::UdpSocket::bind(listen_addr).await {
      Ok(socket) => Ok(socket),
      Err(err) if listen_addr.is_ipv6() && listen_addr.ip().is_unspecified() => {
         tracing::debug!("IPv6 bind of {} failed ({}), falling back to IPv4", listen_addr, err);
         tokio::net::UdpSocket::bind((std::net::Ipv4Addr::UNSPECIFIED, listen_addr.port())).await
      }
      Err(err) => Err(err),
   }
}
