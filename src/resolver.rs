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

use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResolverProtocol {
   Udp,
   Doh,
   Dot,
}

impl ResolverProtocol {
   #[inline]
   pub fn default_port(self) -> u16 {
      match self {
         ResolverProtocol::Udp => 53,
         ResolverProtocol::Doh => 443,
         ResolverProtocol::Dot => 853,
      }
   }
}

impl std::fmt::Display for ResolverProtocol {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.write_str(match self {
         ResolverProtocol::Udp => "UDP",
         ResolverProtocol::Doh => "DOH",
         ResolverProtocol::Dot => "DOT",
      })
   }
}

/// How a resolver signals that it refuses to resolve a domain
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum BlockedIf {
   Refused,
   ZeroIp,
   Empty,
   #[default]
   Disabled,
}

impl std::str::FromStr for BlockedIf {
   type Err = Error;

   fn from_str(s: &str) -> Result<Self> {
      match s.to_ascii_lowercase().as_str() {
         "refused" => Ok(BlockedIf::Refused),
         "zeroip" => Ok(BlockedIf::ZeroIp),
         "empty" => Ok(BlockedIf::Empty),
         "disabled" => Ok(BlockedIf::Disabled),
         _ => Err(Error::InvalidResolver(format!("unknown blockedIf value '{s}'"))),
      }
   }
}

impl std::fmt::Display for BlockedIf {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.write_str(match self {
         BlockedIf::Refused => "Refused",
         BlockedIf::ZeroIp => "ZeroIP",
         BlockedIf::Empty => "Empty",
         BlockedIf::Disabled => "Disabled",
      })
   }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SelectionStrategy {
   #[default]
   First,
   Random,
}

/// An upstream resolver. Identity is protocol + address + port, the display fields do not take part in equality.
#[derive(Clone, Debug)]
pub struct Resolver {
   pub protocol: ResolverProtocol,
   pub ip: std::net::IpAddr,
   pub port: u16,
   pub name: String,
   pub domain: Option<String>,
   pub blocked_if: BlockedIf,
}

impl PartialEq for Resolver {
   fn eq(&self, other: &Self) -> bool {
      self.protocol == other.protocol && self.ip == other.ip && self.port == other.port
   }
}

impl Eq for Resolver {}

impl std::hash::Hash for Resolver {
   fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
      self.protocol.hash(state);
      self.ip.hash(state);
      self.port.hash(state);
   }
}

impl std::fmt::Display for Resolver {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      write!(f, "{} - {} - {}", self.name, self.socket_addr(), self.blocked_if)?;
      if let Some(domain) = &self.domain {
         write!(f, " - {domain}")?;
      }
      Ok(())
   }
}

impl Resolver {
   /// Parses `scheme://host[:port]?name=&domain=&blockedIf=` where scheme is one of dns, doh, dot.
   /// IPv6 hosts are written in brackets. The name falls back to the domain, then to the host.
   pub fn parse(uri: &str) -> Result<Self> {
      let invalid = |reason: &str| Error::InvalidResolver(format!("{uri}: {reason}"));

      let (scheme, rest) = uri.trim().split_once("://").ok_or_else(|| invalid("missing scheme"))?;
      let protocol = match scheme.to_ascii_lowercase().as_str() {
         "dns" => ResolverProtocol::Udp,
         "doh" => ResolverProtocol::Doh,
         "dot" => ResolverProtocol::Dot,
         _ => return Err(invalid("scheme must be dns, doh or dot")),
      };

      let (authority, query) = match rest.split_once('?') {
         Some((authority, query)) => (authority, query),
         None => (rest, ""),
      };
      let authority = authority.trim_end_matches('/');

      let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
         let (host, after) = bracketed.split_once(']').ok_or_else(|| invalid("unterminated IPv6 host"))?;
         let port = match after.strip_prefix(':') {
            Some(port) => Some(port),
            None if after.is_empty() => None,
            None => return Err(invalid("unexpected text after IPv6 host")),
         };
         (host, port)
      } else {
         match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
         }
      };

      let ip: std::net::IpAddr = host.parse().map_err(|_| invalid("host must be an IP address"))?;
      let port = match port {
         Some(port) => port.parse::<u16>().map_err(|_| invalid("invalid port"))?,
         None => protocol.default_port(),
      };

      let mut name = None;
      let mut domain = None;
      let mut blocked_if = BlockedIf::Disabled;
      for pair in query.split('&').filter(|pair| !pair.is_empty()) {
         let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
         match key {
            "name" if !value.is_empty() => name = Some(value.to_string()),
            "domain" if !value.is_empty() => domain = Some(value.to_string()),
            "blockedIf" if !value.is_empty() => blocked_if = value.parse()?,
            _ => {}
         }
      }

      let name = name.or_else(|| domain.clone()).unwrap_or_else(|| host.to_string());

      Ok(Self { protocol, ip, port, name, domain, blocked_if })
   }

   #[inline]
   pub fn socket_addr(&self) -> std::net::SocketAddr {
      std::net::SocketAddr::new(self.ip, self.port)
   }
}

#[derive(Clone, Debug)]
pub struct ResolverState {
   pub resolver: Resolver,
   pub is_failing: bool,
   pub failing_since: Option<std::time::Instant>,
   pub failure_count: u32,
}

impl ResolverState {
   fn new(resolver: Resolver) -> Self {
      Self { resolver, is_failing: false, failing_since: None, failure_count: 0 }
   }

   /// Idempotent, an already failing resolver keeps its original timestamp
   fn mark_as_failing(&mut self, now: std::time::Instant) -> bool {
      if self.is_failing {
         return false;
      }
      self.is_failing = true;
      self.failing_since = Some(now);
      true
   }

   fn restore(&mut self) {
      self.is_failing = false;
      self.failing_since = None;
      self.failure_count = 0;
   }
}

/// Picks a healthy resolver, `None` when every resolver is failing
pub fn select_resolver(states: &[ResolverState], strategy: SelectionStrategy) -> Option<Resolver> {
   let healthy: Vec<&ResolverState> = states.iter().filter(|state| !state.is_failing).collect();
   if healthy.is_empty() {
      return None;
   }

   let chosen = match strategy {
      SelectionStrategy::First => healthy[0],
      SelectionStrategy::Random => healthy[fastrand::usize(..healthy.len())],
   };
   Some(chosen.resolver.clone())
}

/// Upstream resolvers plus their failure accounting. Selection, failure counting and recovery all go through the
/// same lock so the recovery sweep and the query path observe state transitions atomically.
pub struct ResolverPool {
   states: std::sync::Mutex<Vec<ResolverState>>,
}

impl ResolverPool {
   pub fn new(resolvers: Vec<Resolver>) -> Self {
      let mut states: Vec<ResolverState> = Vec::with_capacity(resolvers.len());
      for resolver in resolvers {
         if !states.iter().any(|state| state.resolver == resolver) {
            states.push(ResolverState::new(resolver));
         }
      }
      Self { states: std::sync::Mutex::new(states) }
   }

   /// Builds the pool from configured URIs, skipping (and logging) the ones that do not parse
   pub fn from_uris(uris: &[String]) -> Self {
      Self::new(parse_resolvers(uris))
   }

   fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ResolverState>> {
      self.states.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
   }

   pub fn select(&self, strategy: SelectionStrategy) -> Option<Resolver> {
      select_resolver(&self.lock(), strategy)
   }

   /// Counts one failed attempt. Returns true when this failure transitioned the resolver to failing.
   pub fn record_failure(&self, resolver: &Resolver, max_retries: u32) -> bool {
      let mut states = self.lock();
      let Some(state) = states.iter_mut().find(|state| &state.resolver == resolver) else {
         return false;
      };

      state.failure_count = state.failure_count.saturating_add(1);
      if state.failure_count > max_retries && state.mark_as_failing(std::time::Instant::now()) {
         tracing::warn!("Resolver marked as failing: {}", state.resolver);
         return true;
      }
      false
   }

   pub fn record_success(&self, resolver: &Resolver) {
      let mut states = self.lock();
      if let Some(state) = states.iter_mut().find(|state| &state.resolver == resolver) {
         if !state.is_failing {
            state.failure_count = 0;
         }
      }
   }

   /// Restores every resolver that has been failing for at least `recovery_time` as of `now`
   pub fn recover(&self, recovery_time: std::time::Duration, now: std::time::Instant) -> Vec<Resolver> {
      let mut restored = Vec::new();
      for state in self.lock().iter_mut() {
         if let (true, Some(since)) = (state.is_failing, state.failing_since) {
            if now.saturating_duration_since(since) >= recovery_time {
               state.restore();
               tracing::info!("Resolver recovered: {}", state.resolver);
               restored.push(state.resolver.clone());
            }
         }
      }
      restored
   }

   /// Swaps in a new resolver list. Resolvers present before and after keep their failure state.
   pub fn replace(&self, resolvers: Vec<Resolver>) {
      let mut states = self.lock();
      let mut next: Vec<ResolverState> = Vec::with_capacity(resolvers.len());
      for resolver in resolvers {
         if next.iter().any(|state| state.resolver == resolver) {
            continue;
         }
         match states.iter().find(|state| state.resolver == resolver) {
            Some(existing) => next.push(ResolverState { resolver, ..existing.clone() }),
            None => next.push(ResolverState::new(resolver)),
         }
      }
      *states = next;
   }

   pub fn snapshot(&self) -> Vec<ResolverState> {
      self.lock().clone()
   }

   pub fn len(&self) -> usize {
      self.lock().len()
   }

   pub fn is_empty(&self) -> bool {
      self.len() == 0
   }
}

pub fn parse_resolvers(uris: &[String]) -> Vec<Resolver> {
   uris
      .iter()
      .filter_map(|uri| match Resolver::parse(uri) {
         Ok(resolver) => Some(resolver),
         Err(err) => {
            tracing::error!("Skipping resolver: {}", err);
            None
         }
      })
      .collect()
}

#[cfg(test)]
mod tests {
   use super::*;

   fn resolver(uri: &str) -> Resolver {
      Resolver::parse(uri).unwrap()
   }

   #[test]
   fn parses_all_schemes_with_default_ports() {
      let udp = resolver("dns://1.1.1.1?blockedIf=zeroip&name=Cloudflare3");
      assert_eq!(udp.protocol, ResolverProtocol::Udp);
      assert_eq!(udp.port, 53);
      assert_eq!(udp.name, "Cloudflare3");
      assert_eq!(udp.blocked_if, BlockedIf::ZeroIp);

      let doh = resolver("doh://1.1.1.1?domain=cloudflare-dns.com&blockedIf=zeroip&name=Cloudflare1");
      assert_eq!(doh.port, 443);
      assert_eq!(doh.domain.as_deref(), Some("cloudflare-dns.com"));

      let dot = resolver("dot://[2a07:e340::9]?domain=all.dns.mullvad.net&blockedIf=empty&name=Mullvad2_IPV6");
      assert_eq!(dot.port, 853);
      assert_eq!(dot.ip, "2a07:e340::9".parse::<std::net::IpAddr>().unwrap());
      assert_eq!(dot.to_string(), "Mullvad2_IPV6 - [2a07:e340::9]:853 - Empty - all.dns.mullvad.net");
   }

   #[test]
   fn explicit_port_name_fallback_and_defaults() {
      let r = resolver("dot://9.9.9.9:8853?domain=dns.quad9.net");
      assert_eq!(r.port, 8853);
      assert_eq!(r.name, "dns.quad9.net");
      assert_eq!(r.blocked_if, BlockedIf::Disabled);

      let bare = resolver("dns://[::1]:5353");
      assert_eq!(bare.port, 5353);
      assert_eq!(bare.name, "::1");
   }

   #[test]
   fn rejects_bad_uris() {
      assert!(Resolver::parse("tcp://1.1.1.1").is_err());
      assert!(Resolver::parse("1.1.1.1").is_err());
      assert!(Resolver::parse("dns://dns.google").is_err());
      assert!(Resolver::parse("dns://1.1.1.1:99999").is_err());
      assert!(Resolver::parse("dns://1.1.1.1?blockedIf=sometimes").is_err());
   }

   #[test]
   fn identity_ignores_display_fields() {
      let a = resolver("dns://1.1.1.1?name=A&blockedIf=refused");
      let b = resolver("dns://1.1.1.1?name=B");
      let c = resolver("doh://1.1.1.1?name=A");
      assert_eq!(a, b);
      assert_ne!(a, c);

      let mut set = std::collections::HashSet::new();
      set.insert(a);
      assert!(set.contains(&b));
   }

   #[test]
   fn selection_skips_failing_resolvers() {
      let pool = ResolverPool::new(vec![resolver("dns://1.1.1.1?name=one"), resolver("dns://9.9.9.9?name=two")]);
      assert_eq!(pool.select(SelectionStrategy::First).unwrap().name, "one");

      let first = resolver("dns://1.1.1.1");
      for _ in 0..4 {
         pool.record_failure(&first, 3);
      }
      assert_eq!(pool.select(SelectionStrategy::First).unwrap().name, "two");
      for _ in 0..20 {
         assert_eq!(pool.select(SelectionStrategy::Random).unwrap().name, "two");
      }

      let second = resolver("dns://9.9.9.9");
      for _ in 0..4 {
         pool.record_failure(&second, 3);
      }
      assert!(pool.select(SelectionStrategy::Random).is_none());
      assert!(pool.select(SelectionStrategy::First).is_none());
   }

   #[test]
   fn failing_transition_happens_once() {
      let r = resolver("dns://1.1.1.1");
      let pool = ResolverPool::new(vec![r.clone()]);

      for _ in 0..3 {
         assert!(!pool.record_failure(&r, 3));
      }
      assert!(!pool.snapshot()[0].is_failing);

      assert!(pool.record_failure(&r, 3));
      let since = pool.snapshot()[0].failing_since.unwrap();

      std::thread::sleep(std::time::Duration::from_millis(5));
      assert!(!pool.record_failure(&r, 3));
      assert_eq!(pool.snapshot()[0].failing_since.unwrap(), since);
   }

   #[test]
   fn recovery_waits_for_cooldown() {
      let r = resolver("dns://1.1.1.1");
      let pool = ResolverPool::new(vec![r.clone()]);
      for _ in 0..4 {
         pool.record_failure(&r, 3);
      }
      let since = pool.snapshot()[0].failing_since.unwrap();
      let cooldown = std::time::Duration::from_secs(10);

      assert!(pool.recover(cooldown, since + std::time::Duration::from_secs(9)).is_empty());
      assert!(pool.snapshot()[0].is_failing);

      assert_eq!(pool.recover(cooldown, since + cooldown).len(), 1);
      let state = &pool.snapshot()[0];
      assert!(!state.is_failing);
      assert_eq!(state.failure_count, 0);
      assert!(state.failing_since.is_none());
   }

   #[test]
   fn success_resets_consecutive_failures() {
      let r = resolver("dns://1.1.1.1");
      let pool = ResolverPool::new(vec![r.clone()]);
      for _ in 0..3 {
         pool.record_failure(&r, 3);
      }
      pool.record_success(&r);
      assert!(!pool.record_failure(&r, 3));
      assert_eq!(pool.snapshot()[0].failure_count, 1);
   }

   #[test]
   fn replace_keeps_state_of_surviving_resolvers() {
      let r = resolver("dns://1.1.1.1");
      let pool = ResolverPool::new(vec![r.clone()]);
      for _ in 0..4 {
         pool.record_failure(&r, 3);
      }
      pool.replace(vec![resolver("dns://1.1.1.1?name=renamed"), resolver("dns://8.8.8.8")]);
      let states = pool.snapshot();
      assert_eq!(states.len(), 2);
      assert!(states[0].is_failing);
      assert_eq!(states[0].resolver.name, "renamed");
      assert!(!states[1].is_failing);
   }
}
