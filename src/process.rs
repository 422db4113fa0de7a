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

use std::net::IpAddr;

pub const SYSTEM: &str = "SYSTEM";
pub const UNKNOWN: &str = "UNKNOWN";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessInfo {
   pub name: String,
   pub path: String,
   pub command_line: String,
}

impl ProcessInfo {
   fn filled(value: &str) -> Self {
      Self { name: value.to_string(), path: value.to_string(), command_line: value.to_string() }
   }

   pub fn system() -> Self {
      Self::filled(SYSTEM)
   }

   pub fn unknown() -> Self {
      Self::filled(UNKNOWN)
   }

   #[inline]
   pub fn identity(&self) -> crate::profiles::ProcessIdentity<'_> {
      crate::profiles::ProcessIdentity { name: &self.name, path: &self.path, command_line: &self.command_line }
   }
}

/// Name, path and command line of a PID
pub trait ProcessInfoSource: Send + Sync {
   fn process_info(&self, pid: u64) -> ProcessInfo;
}

/// Bounded PID -> info map, oldest PID evicted first
pub struct ProcessInfoCache {
   entries: dashmap::DashMap<u64, ProcessInfo, nohash_hasher::BuildNoHashHasher<u64>>,
   order: std::sync::Mutex<std::collections::VecDeque<u64>>,
   capacity: usize,
}

impl ProcessInfoCache {
   pub fn new(capacity: usize) -> Self {
      Self {
         entries: dashmap::DashMap::with_capacity_and_hasher(capacity, nohash_hasher::BuildNoHashHasher::default()),
         order: std::sync::Mutex::new(std::collections::VecDeque::with_capacity(capacity)),
         capacity,
      }
   }

   #[inline]
   pub fn get(&self, pid: u64) -> Option<ProcessInfo> {
      self.entries.get(&pid).map(|entry| entry.value().clone())
   }

   pub fn insert(&self, pid: u64, info: ProcessInfo) {
      if self.entries.insert(pid, info).is_some() {
         return;
      }

      let mut order = match self.order.lock() {
         Ok(order) => order,
         Err(poisoned) => poisoned.into_inner(),
      };
      order.push_back(pid);
      while order.len() > self.capacity {
         if let Some(oldest) = order.pop_front() {
            self.entries.remove(&oldest);
         }
      }
   }

   pub fn remove(&self, pid: u64) {
      self.entries.remove(&pid);
   }

   pub fn len(&self) -> usize {
      self.entries.len()
   }

   pub fn is_empty(&self) -> bool {
      self.entries.is_empty()
   }
}

#[cfg(target_os = "linux")]
pub use procfs_source::ProcProcessInfo;

#[cfg(target_os = "linux")]
mod procfs_source {
   use super::{ProcessInfo, ProcessInfoCache, ProcessInfoSource, UNKNOWN};

   /// Process identity from `/proc/<pid>`
   pub struct ProcProcessInfo {
      cache: ProcessInfoCache,
   }

   impl Default for ProcProcessInfo {
      fn default() -> Self {
         Self { cache: ProcessInfoCache::new(crate::statics::MAX_CACHE_SIZE) }
      }
   }

   impl ProcProcessInfo {
      pub fn new() -> Self {
         Self::default()
      }

      fn read(pid: u64) -> Option<ProcessInfo> {
         let process = procfs::process::Process::new(i32::try_from(pid).ok()?).ok()?;
         let stat = process.stat().ok()?;

         let mut info = match process.exe() {
            Ok(exe) => ProcessInfo {
               name: exe.file_stem().map(|stem| stem.to_string_lossy().into_owned()).unwrap_or_else(|| stat.comm.clone()),
               path: exe.to_string_lossy().into_owned(),
               command_line: UNKNOWN.to_string(),
            },
            // kernel threads have no executable
            Err(_) => ProcessInfo { name: stat.comm.clone(), path: UNKNOWN.to_string(), command_line: UNKNOWN.to_string() },
         };

         if let Ok(arguments) = process.cmdline() {
            if !arguments.is_empty() {
               info.command_line = arguments.join(" ");
            }
         }

         if stat.ppid == 1 {
            if let Some(unit) = service_unit(&process) {
               info.name = format!("{}{}", crate::profiles::SERVICE_PREFIX, unit);
            }
         }

         Some(info)
      }
   }

   /// Unit name (without `.service`) of the systemd service cgroup the process lives in
   fn service_unit(process: &procfs::process::Process) -> Option<String> {
      let cgroups = process.cgroups().ok()?;
      cgroups.0.iter().find_map(|cgroup| {
         let last = cgroup.pathname.rsplit('/').next()?;
         last.strip_suffix(".service").map(str::to_string)
      })
   }

   impl ProcessInfoSource for ProcProcessInfo {
      fn process_info(&self, pid: u64) -> ProcessInfo {
         if pid == 0 {
            return ProcessInfo::system();
         }

         if let Some(cached) = self.cache.get(pid) {
            return cached;
         }

         let info = match Self::read(pid) {
            Some(info) => info,
            None => {
               tracing::debug!("Error getting process info for PID {}", pid);
               ProcessInfo::unknown()
            }
         };

         // unknown results are retried on the next lookup
         if info.name != UNKNOWN {
            self.cache.insert(pid, info.clone());
         }
         info
      }
   }
}

/// Source that knows nothing, for platforms without a process reader
pub struct NoProcessInfo;

impl ProcessInfoSource for NoProcessInfo {
   fn process_info(&self, pid: u64) -> ProcessInfo {
      if pid == 0 {
         ProcessInfo::system()
      } else {
         ProcessInfo::unknown()
      }
   }
}

/// Process reader for this platform
pub fn default_process_source() -> Box<dyn ProcessInfoSource> {
   #[cfg(target_os = "linux")]
   {
      Box::new(ProcProcessInfo::new())
   }
   #[cfg(not(target_os = "linux"))]
   {
      Box::new(NoProcessInfo)
   }
}

/// DNS servers the network adapters are configured with
pub trait AdapterDnsSource: Send + Sync {
   fn dns_servers(&self) -> Vec<IpAddr>;
}

/// `nameserver` lines of a resolv.conf style file
pub struct ResolvConf {
   pub path: std::path::PathBuf,
}

impl Default for ResolvConf {
   fn default() -> Self {
      Self { path: std::path::PathBuf::from("/etc/resolv.conf") }
   }
}

impl AdapterDnsSource for ResolvConf {
   fn dns_servers(&self) -> Vec<IpAddr> {
      match std::fs::read_to_string(&self.path) {
         Ok(text) => parse_resolv_conf(&text),
         Err(err) => {
            tracing::warn!("Unable to read {}: {}", self.path.display(), err);
            Vec::new()
         }
      }
   }
}

pub fn parse_resolv_conf(text: &str) -> Vec<IpAddr> {
   text
      .lines()
      .map(str::trim)
      .filter(|line| !line.starts_with('#') && !line.starts_with(';'))
      .filter_map(|line| {
         let mut parts = line.split_whitespace();
         if parts.next() != Some("nameserver") {
            return None;
         }
         // drop an IPv6 zone, e.g. fe80::1%eth0
         let address = parts.next()?.split('%').next()?;
         address.parse().ok()
      })
      .collect()
}

/// Geo / ownership data for an address
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IpInfo {
   pub ip: String,
   pub is_anycast: bool,
   pub country: String,
   pub asn: String,
   pub organization: String,
}

pub trait IpInfoSource: Send + Sync {
   fn lookup(&self, ip: &IpAddr) -> Option<IpInfo>;
}

/// No geo database configured
pub struct NoIpInfo;

impl IpInfoSource for NoIpInfo {
   fn lookup(&self, _ip: &IpAddr) -> Option<IpInfo> {
      None
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn resolv_conf_nameservers() {
      let text = "# generated\nsearch lan\nnameserver 192.168.1.1\nnameserver fe80::1%eth0\n;nameserver 9.9.9.9\nnameserver bogus\n";
      let servers = parse_resolv_conf(text);
      assert_eq!(servers, vec!["192.168.1.1".parse::<IpAddr>().unwrap(), "fe80::1".parse::<IpAddr>().unwrap()]);
   }

   #[test]
   fn cache_evicts_oldest() {
      let cache = ProcessInfoCache::new(2);
      cache.insert(1, ProcessInfo::unknown());
      cache.insert(2, ProcessInfo::system());
      cache.insert(3, ProcessInfo::unknown());

      assert_eq!(cache.len(), 2);
      assert!(cache.get(1).is_none());
      assert_eq!(cache.get(2), Some(ProcessInfo::system()));
   }

   #[test]
   fn reinserting_does_not_grow_the_order() {
      let cache = ProcessInfoCache::new(2);
      cache.insert(1, ProcessInfo::unknown());
      cache.insert(1, ProcessInfo::system());
      cache.insert(2, ProcessInfo::unknown());

      assert_eq!(cache.get(1), Some(ProcessInfo::system()));
      assert_eq!(cache.len(), 2);
   }

   #[test]
   fn pid_zero_is_system() {
      assert_eq!(NoProcessInfo.process_info(0), ProcessInfo::system());
      assert_eq!(NoProcessInfo.process_info(12), ProcessInfo::unknown());
   }

   #[cfg(target_os = "linux")]
   #[test]
   fn reads_own_process() {
      let source = ProcProcessInfo::new();
      let info = source.process_info(std::process::id() as u64);
      let exe = std::env::current_exe().unwrap();

      assert_eq!(info.path, exe.to_string_lossy());
      assert_eq!(source.process_info(0), ProcessInfo::system());
   }
}
