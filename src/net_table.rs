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

//! OS connection tables, used to attribute a tuple to a process and to notice connections that went away

use crate::connection::{PROTOCOL_TCP, PROTOCOL_UDP};
use crate::error::Result;
use std::net::IpAddr;

/// One socket of the OS table. UDP entries carry an unspecified remote endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TableEntry {
   pub local_ip: IpAddr,
   pub local_port: u16,
   pub remote_ip: IpAddr,
   pub remote_port: u16,
   pub pid: u64,
}

impl TableEntry {
   #[inline]
   fn matches_tuple(&self, local_ip: &IpAddr, local_port: u16, remote_ip: &IpAddr, remote_port: u16) -> bool {
      self.local_port == local_port
         && self.remote_port == remote_port
         && ip_matches(&self.local_ip, local_ip)
         && ip_matches(&self.remote_ip, remote_ip)
   }

   #[inline]
   fn matches_local(&self, local_ip: &IpAddr, local_port: u16) -> bool {
      self.local_port == local_port && ip_matches(&self.local_ip, local_ip)
   }
}

// an unspecified table address is bound to every interface
#[inline]
fn ip_matches(table: &IpAddr, wanted: &IpAddr) -> bool {
   table.is_unspecified() || table.to_canonical() == wanted.to_canonical()
}

/// A full read of the four tables
#[derive(Clone, Debug, Default)]
pub struct TableSnapshot {
   pub tcp4: Vec<TableEntry>,
   pub tcp6: Vec<TableEntry>,
   pub udp4: Vec<TableEntry>,
   pub udp6: Vec<TableEntry>,
}

/// Where table snapshots come from
pub trait TableSource: Send + Sync {
   fn snapshot(&self) -> Result<TableSnapshot>;
}

#[derive(Default)]
struct Table {
   active: arc_swap::ArcSwap<Vec<TableEntry>>,
   // entries that left `active`, oldest first
   cache: arc_swap::ArcSwap<std::collections::VecDeque<TableEntry>>,
}

impl Table {
   fn replace(&self, fresh: Vec<TableEntry>) {
      let previous = self.active.load_full();
      let still_active: std::collections::HashSet<&TableEntry> = fresh.iter().collect();

      let mut cache = (**self.cache.load()).clone();
      cache.extend(previous.iter().filter(|entry| !still_active.contains(entry)).cloned());
      while cache.len() > crate::statics::MAX_CACHE_SIZE {
         cache.pop_front();
      }

      self.cache.store(std::sync::Arc::new(cache));
      self.active.store(std::sync::Arc::new(fresh));
   }

   fn find_active(&self, predicate: &impl Fn(&TableEntry) -> bool) -> Option<TableEntry> {
      self.active.load().iter().find(|entry| predicate(entry)).cloned()
   }

   fn find(&self, predicate: &impl Fn(&TableEntry) -> bool) -> Option<TableEntry> {
      self.find_active(predicate).or_else(|| self.cache.load().iter().rev().find(|entry| predicate(entry)).cloned())
   }

   fn cache_len(&self) -> usize {
      self.cache.load().len()
   }
}

/// Active TCP/UDP sockets per IP version plus a bounded cache of recently removed ones.
/// Readers never block; `update` swaps in new snapshots wholesale.
#[derive(Default)]
pub struct NetworkTables {
   tcp4: Table,
   tcp6: Table,
   udp4: Table,
   udp6: Table,
   update_lock: std::sync::Mutex<()>,
}

impl NetworkTables {
   pub fn new() -> Self {
      Self::default()
   }

   // dual-stack sockets list IPv4 peers as mapped addresses in the v6 tables
   fn tables(&self, protocol: u8, ip: &IpAddr) -> [Option<&Table>; 2] {
      match (protocol, ip.to_canonical().is_ipv4()) {
         (PROTOCOL_TCP, true) => [Some(&self.tcp4), Some(&self.tcp6)],
         (PROTOCOL_TCP, false) => [Some(&self.tcp6), None],
         (PROTOCOL_UDP, true) => [Some(&self.udp4), Some(&self.udp6)],
         (PROTOCOL_UDP, false) => [Some(&self.udp6), None],
         _ => [None, None],
      }
   }

   fn find(&self, protocol: u8, ip: &IpAddr, predicate: impl Fn(&TableEntry) -> bool) -> Option<TableEntry> {
      self.tables(protocol, ip).into_iter().flatten().find_map(|table| table.find(&predicate))
   }

   fn any_active(&self, protocol: u8, ip: &IpAddr, predicate: impl Fn(&TableEntry) -> bool) -> bool {
      self.tables(protocol, ip).into_iter().flatten().any(|table| table.find_active(&predicate).is_some())
   }

   pub fn update(&self, fresh: TableSnapshot) {
      let _guard = match self.update_lock.lock() {
         Ok(guard) => guard,
         Err(poisoned) => poisoned.into_inner(),
      };

      self.tcp4.replace(fresh.tcp4);
      self.tcp6.replace(fresh.tcp6);
      self.udp4.replace(fresh.udp4);
      self.udp6.replace(fresh.udp6);
   }

   /// Reads `source` and swaps the result in. A failed read keeps the previous tables.
   pub fn refresh(&self, source: &dyn TableSource) {
      match source.snapshot() {
         Ok(snapshot) => self.update(snapshot),
         Err(err) => tracing::warn!("Network table refresh failed: {}", err),
      }
   }

   /// Owning PID of a tuple. TCP needs the whole tuple, UDP only the local endpoint.
   pub fn check_pid(
      &self,
      protocol: u8,
      local_ip: &IpAddr,
      local_port: u16,
      remote_ip: &IpAddr,
      remote_port: u16,
   ) -> Option<u64> {
      let entry = match protocol {
         PROTOCOL_TCP => self.find(protocol, local_ip, |entry| entry.matches_tuple(local_ip, local_port, remote_ip, remote_port)),
         _ => self.find(protocol, local_ip, |entry| entry.matches_local(local_ip, local_port)),
      }?;

      (entry.pid != 0).then_some(entry.pid)
   }

   /// Whether the OS still lists the connection. Only active entries count, the removed-entry cache is for PID
   /// attribution. TCP is checked in both directions, UDP by either endpoint.
   pub fn contains(&self, protocol: u8, local_ip: &IpAddr, local_port: u16, remote_ip: &IpAddr, remote_port: u16) -> bool {
      match protocol {
         PROTOCOL_TCP => self.any_active(protocol, local_ip, |entry| {
            entry.matches_tuple(local_ip, local_port, remote_ip, remote_port)
               || entry.matches_tuple(remote_ip, remote_port, local_ip, local_port)
         }),
         _ => self.any_active(protocol, local_ip, |entry| {
            entry.matches_local(local_ip, local_port) || entry.matches_local(remote_ip, remote_port)
         }),
      }
   }

   /// Cached (removed) entry counts as `(tcp4, tcp6, udp4, udp6)`
   pub fn cache_sizes(&self) -> (usize, usize, usize, usize) {
      (self.tcp4.cache_len(), self.tcp6.cache_len(), self.udp4.cache_len(), self.udp6.cache_len())
   }
}

/// Source with nothing in it, for platforms without a table reader
pub struct EmptyTableSource;

impl TableSource for EmptyTableSource {
   fn snapshot(&self) -> Result<TableSnapshot> {
      Ok(TableSnapshot::default())
   }
}

#[cfg(target_os = "linux")]
pub use procfs_source::ProcTableSource;

#[cfg(target_os = "linux")]
mod procfs_source {
   use super::{TableEntry, TableSnapshot, TableSource};
   use crate::error::{Error, Result};

   fn proc_error(err: procfs::ProcError) -> Error {
      Error::Io(std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))
   }

   /// Reads `/proc/net/{tcp,tcp6,udp,udp6}` and resolves socket inodes through `/proc/<pid>/fd`
   #[derive(Default)]
   pub struct ProcTableSource;

   impl ProcTableSource {
      fn inode_owners() -> std::collections::HashMap<u64, u64, nohash_hasher::BuildNoHashHasher<u64>> {
         let mut owners = std::collections::HashMap::with_hasher(nohash_hasher::BuildNoHashHasher::default());

         let processes = match procfs::process::all_processes() {
            Ok(processes) => processes,
            Err(err) => {
               tracing::warn!("Unable to list processes: {}", err);
               return owners;
            }
         };

         for process in processes.flatten() {
            // processes of other users are unreadable without privileges
            let Ok(fds) = process.fd() else {
               continue;
            };
            for fd in fds.flatten() {
               if let procfs::process::FDTarget::Socket(inode) = fd.target {
                  owners.insert(inode, process.pid() as u64);
               }
            }
         }

         owners
      }
   }

   impl TableSource for ProcTableSource {
      fn snapshot(&self) -> Result<TableSnapshot> {
         let owners = Self::inode_owners();
         let owner = |inode: u64| owners.get(&inode).copied().unwrap_or(0);

         let tcp = |entries: Vec<procfs::net::TcpNetEntry>| -> Vec<TableEntry> {
            entries
               .into_iter()
               .map(|entry| TableEntry {
                  local_ip: entry.local_address.ip(),
                  local_port: entry.local_address.port(),
                  remote_ip: entry.remote_address.ip(),
                  remote_port: entry.remote_address.port(),
                  pid: owner(entry.inode),
               })
               .collect()
         };

         let udp = |entries: Vec<procfs::net::UdpNetEntry>| -> Vec<TableEntry> {
            entries
               .into_iter()
               .map(|entry| TableEntry {
                  local_ip: entry.local_address.ip(),
                  local_port: entry.local_address.port(),
                  remote_ip: entry.remote_address.ip(),
                  remote_port: entry.remote_address.port(),
                  pid: owner(entry.inode),
               })
               .collect()
         };

         Ok(TableSnapshot {
            tcp4: tcp(procfs::net::tcp().map_err(proc_error)?),
            tcp6: tcp(procfs::net::tcp6().unwrap_or_default()),
            udp4: udp(procfs::net::udp().map_err(proc_error)?),
            udp6: udp(procfs::net::udp6().unwrap_or_default()),
         })
      }
   }
}

/// Table reader for this platform
pub fn default_source() -> Box<dyn TableSource> {
   #[cfg(target_os = "linux")]
   {
      Box::new(ProcTableSource)
   }
   #[cfg(not(target_os = "linux"))]
   {
      Box::new(EmptyTableSource)
   }
}
