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

use crate::dns::DnsResponse;

/// Lowercased domain and query type
pub type CacheKey = (String, u16);

#[inline]
pub fn cache_key(domain: &str, query_type: u16) -> CacheKey {
   (domain.to_lowercase(), query_type)
}

pub enum CacheLookup {
   Hit(DnsResponse),
   /// Fresh entry that was blocked, the query gets no reply
   HitBlocked(DnsResponse),
   Miss,
}

/// Resolved answers, served until `timestamp + ttl`
pub struct DnsCache {
   entries: dashmap::DashMap<CacheKey, DnsResponse, ahash::RandomState>,
}

impl Default for DnsCache {
   fn default() -> Self {
      Self::new()
   }
}

impl DnsCache {
   pub fn new() -> Self {
      Self { entries: dashmap::DashMap::with_capacity_and_hasher(4096, ahash::RandomState::new()) }
   }

   /// Looks up a fresh entry, evicting it if it went stale
   pub fn lookup(&self, domain: &str, query_type: u16) -> CacheLookup {
      let key = cache_key(domain, query_type);

      let cached = match self.entries.get(&key) {
         Some(entry) if entry.is_fresh() => Some(entry.clone()),
         Some(_) => None,
         None => return CacheLookup::Miss,
      };

      match cached {
         Some(response) if response.blocked => CacheLookup::HitBlocked(response),
         Some(response) => CacheLookup::Hit(response),
         None => {
            self.entries.remove_if(&key, |_, entry| !entry.is_fresh());
            CacheLookup::Miss
         }
      }
   }

   pub fn insert(&self, response: DnsResponse) {
      self.entries.insert(cache_key(&response.domain, response.query_type), response);
   }

   pub fn remove(&self, domain: &str, query_type: u16) -> Option<DnsResponse> {
      self.entries.remove(&cache_key(domain, query_type)).map(|(_, response)| response)
   }

   /// Drops every stale entry, returns how many went
   pub fn evict_expired(&self) -> usize {
      let before = self.entries.len();
      self.entries.retain(|_, entry| entry.is_fresh());
      before.saturating_sub(self.entries.len())
   }

   #[inline]
   pub fn len(&self) -> usize {
      self.entries.len()
   }

   #[inline]
   pub fn is_empty(&self) -> bool {
      self.entries.is_empty()
   }
}

/// History of resolved responses, newest last
pub struct ResponseStore {
   entries: std::sync::Mutex<std::collections::VecDeque<DnsResponse>>,
   capacity: usize,
}

impl ResponseStore {
   pub fn new(capacity: usize) -> Self {
      Self { entries: std::sync::Mutex::new(std::collections::VecDeque::with_capacity(capacity)), capacity }
   }

   fn lock(&self) -> std::sync::MutexGuard<'_, std::collections::VecDeque<DnsResponse>> {
      self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
   }

   pub fn push(&self, response: DnsResponse) {
      let mut entries = self.lock();
      while entries.len() >= self.capacity {
         entries.pop_front();
      }
      entries.push_back(response);
   }

   /// Drops responses older than `max_age`
   pub fn prune(&self, max_age: std::time::Duration) -> usize {
      let mut entries = self.lock();
      let before = entries.len();
      entries.retain(|response| response.timestamp.elapsed() <= max_age);
      before - entries.len()
   }

   pub fn snapshot(&self) -> Vec<DnsResponse> {
      self.lock().iter().cloned().collect()
   }

   pub fn len(&self) -> usize {
      self.lock().len()
   }

   pub fn is_empty(&self) -> bool {
      self.lock().is_empty()
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   fn response(domain: &str, ttl: u32, age: std::time::Duration) -> DnsResponse {
      DnsResponse {
         domain: domain.to_string(),
         query_type: crate::dns::TYPE_A,
         ttl,
         ipv4: vec![std::net::Ipv4Addr::new(192, 0, 2, 1)],
         timestamp: std::time::Instant::now() - age,
         ..Default::default()
      }
   }

   #[test]
   fn fresh_entry_is_served() {
      let cache = DnsCache::new();
      cache.insert(response("Example.com", 60, std::time::Duration::ZERO));
      assert!(matches!(cache.lookup("example.com", crate::dns::TYPE_A), CacheLookup::Hit(_)));
      assert!(matches!(cache.lookup("example.com", crate::dns::TYPE_AAAA), CacheLookup::Miss));
   }

   #[test]
   fn expired_entry_is_evicted_on_lookup() {
      let cache = DnsCache::new();
      cache.insert(response("stale.example", 5, std::time::Duration::from_secs(10)));
      assert!(matches!(cache.lookup("stale.example", crate::dns::TYPE_A), CacheLookup::Miss));
      assert!(cache.is_empty());
   }

   #[test]
   fn blocked_entry_is_reported_as_blocked() {
      let cache = DnsCache::new();
      let mut blocked = response("ads.example", 60, std::time::Duration::ZERO);
      blocked.blocked = true;
      cache.insert(blocked);
      assert!(matches!(cache.lookup("ads.example", crate::dns::TYPE_A), CacheLookup::HitBlocked(_)));
   }

   #[test]
   fn sweep_removes_only_expired() {
      let cache = DnsCache::new();
      cache.insert(response("fresh.example", 60, std::time::Duration::ZERO));
      cache.insert(response("old.example", 1, std::time::Duration::from_secs(5)));
      assert_eq!(cache.evict_expired(), 1);
      assert_eq!(cache.len(), 1);
   }

   #[test]
   fn response_store_is_bounded_and_pruned() {
      let store = ResponseStore::new(3);
      for i in 0..5 {
         store.push(response(&format!("host{i}.example"), 60, std::time::Duration::ZERO));
      }
      assert_eq!(store.len(), 3);
      assert_eq!(store.snapshot()[0].domain, "host2.example");

      store.push(response("old.example", 60, std::time::Duration::from_secs(120)));
      assert_eq!(store.prune(std::time::Duration::from_secs(60)), 1);
      assert_eq!(store.len(), 2);
   }
}
