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

use std::sync::atomic::{AtomicU64, Ordering};

// Cache-line aligned to prevent false sharing between the DNS workers and the verdict workers
#[repr(align(64))]
#[derive(Default)]
pub struct DnsStats {
   pub queries: AtomicU64,
   pub invalid: AtomicU64,
   pub cache_hits: AtomicU64,
   pub deduplicated: AtomicU64,
   pub resolved: AtomicU64,
   pub blocked: AtomicU64,
   pub failed: AtomicU64,
}

impl DnsStats {
   #[inline]
   pub fn increment(counter: &AtomicU64) -> u64 {
      counter.fetch_add(1, Ordering::Relaxed) + 1
   }
}

impl std::fmt::Display for DnsStats {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      write!(
         f,
         "queries: {}, invalid: {}, cache hits: {}, deduplicated: {}, resolved: {}, blocked: {}, failed: {}",
         self.queries.load(Ordering::Relaxed),
         self.invalid.load(Ordering::Relaxed),
         self.cache_hits.load(Ordering::Relaxed),
         self.deduplicated.load(Ordering::Relaxed),
         self.resolved.load(Ordering::Relaxed),
         self.blocked.load(Ordering::Relaxed),
         self.failed.load(Ordering::Relaxed),
      )
   }
}

#[repr(align(64))]
#[derive(Default)]
pub struct VerdictStats {
   pub connections: AtomicU64,
   pub allowed: AtomicU64,
   pub blocked: AtomicU64,
   pub redirected: AtomicU64,
   pub prompted: AtomicU64,
   pub ended: AtomicU64,
   pub malformed_frames: AtomicU64,
}

impl VerdictStats {
   /// Counts a decided verdict under its family
   pub fn record(&self, verdict: crate::connection::Verdict) {
      use crate::connection::Verdict;

      let counter = match verdict {
         Verdict::Accept | Verdict::PermanentAccept => &self.allowed,
         Verdict::Block | Verdict::PermanentBlock | Verdict::Drop | Verdict::PermanentDrop => &self.blocked,
         Verdict::RerouteToNameserver | Verdict::RerouteToTunnel => &self.redirected,
         Verdict::Undecided | Verdict::Undeterminable | Verdict::Failed => &self.prompted,
      };
      counter.fetch_add(1, Ordering::Relaxed);
      self.connections.fetch_add(1, Ordering::Relaxed);
   }
}

impl std::fmt::Display for VerdictStats {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      write!(
         f,
         "connections: {}, allowed: {}, blocked: {}, redirected: {}, prompted: {}, ended: {}, malformed frames: {}",
         self.connections.load(Ordering::Relaxed),
         self.allowed.load(Ordering::Relaxed),
         self.blocked.load(Ordering::Relaxed),
         self.redirected.load(Ordering::Relaxed),
         self.prompted.load(Ordering::Relaxed),
         self.ended.load(Ordering::Relaxed),
         self.malformed_frames.load(Ordering::Relaxed),
      )
   }
}
