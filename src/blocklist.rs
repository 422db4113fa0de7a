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

use crate::settings::{BlocklistKind, BlocklistSettings, OfflineBlocklist, OnlineBlocklist};

lazy_static::lazy_static! {
   static ref REQWEST_AGENT: reqwest::Client = {
      reqwest::ClientBuilder::new()
         .min_tls_version(reqwest::tls::Version::TLS_1_2)
         .build()
         .unwrap_or_else(|_| reqwest::Client::new())
   };
}

/// Entries checked against a freshly built filter
const SELF_CHECK_SAMPLE: usize = 1000;

pub const DNS_DOMAINS: &str = "DNS_DOMAINS";
pub const DNS_IP: &str = "DNS_IP";

/// Storage root below the data directory, holding `online/` caches and `builtin/` lists
const BLOCKLIST_DIR: &str = "faf-blocklists";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentKind {
   Domain,
   Ip,
}

impl From<BlocklistKind> for ContentKind {
   fn from(kind: BlocklistKind) -> Self {
      match kind {
         BlocklistKind::Ip => ContentKind::Ip,
         BlocklistKind::Wildcard | BlocklistKind::Domain | BlocklistKind::Hosts => ContentKind::Domain,
      }
   }
}

/// A loaded list. Immutable once built.
pub struct Blocklist {
   pub name: String,
   pub kind: ContentKind,
   pub filter: crate::bloom::BloomFilter,
   pub entry_count: usize,
}

impl Blocklist {
   pub fn from_entries(name: &str, kind: ContentKind, entries: &[String]) -> Self {
      let mut filter = crate::bloom::BloomFilter::new(entries.len(), crate::statics::BLOCKLIST_FALSE_POSITIVE_RATE);
      for entry in entries {
         filter.add(entry);
      }

      for entry in entries.iter().take(SELF_CHECK_SAMPLE) {
         if !filter.might_contain(entry) {
            tracing::error!("False negative detected in {} for entry: {}", name, entry);
         }
      }

      Self { name: name.to_string(), kind, filter, entry_count: entries.len() }
   }

   #[inline]
   pub fn might_contain(&self, item: &str) -> bool {
      self.filter.might_contain(item)
   }
}

impl std::fmt::Debug for Blocklist {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("Blocklist").field("name", &self.name).field("kind", &self.kind).field("entry_count", &self.entry_count).finish()
   }
}

/// Normalized entry for one line of a list, `None` for comments and blanks
pub fn parse_line(line: &str, kind: BlocklistKind) -> Option<String> {
   let line = line.trim();
   if line.is_empty() || line.starts_with("//") || line.starts_with('#') {
      return None;
   }

   let parsed = match kind {
      BlocklistKind::Ip => line.split(['#', ';']).next().unwrap_or_default().trim(),
      BlocklistKind::Wildcard => line.trim_start_matches(['*', '.']),
      BlocklistKind::Domain => line,
      BlocklistKind::Hosts => line.split_whitespace().last().unwrap_or_default(),
   };

   if parsed.is_empty() {
      None
   } else {
      Some(parsed.to_lowercase())
   }
}

pub fn parse_entries(text: &str, kind: BlocklistKind) -> Vec<String> {
   text.lines().filter_map(|line| parse_line(line, kind)).collect()
}

/// Parsed entries of an online list, cached on disk between runs
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct BlocklistFile {
   /// unix seconds from the server's Last-Modified header, 0 when it sent none
   pub last_modified: i64,
   pub entries: Vec<String>,
}

/// Names of the lists that apply, given the global settings and an optional profile override.
/// Online lists follow the profile's state, falling back to the global state; enabled offline lists always apply.
pub fn enabled_blocklist_names(
   settings: &BlocklistSettings,
   profile: Option<&crate::profiles::ProfileBlocklists>,
) -> std::collections::HashSet<String> {
   let mut names = std::collections::HashSet::new();

   for online in &settings.online_blocklists {
      let profile_state = profile
         .and_then(|profile| profile.online_blocklists.iter().find(|state| state.name == online.name))
         .and_then(|state| state.is_enabled);
      if profile_state.unwrap_or(online.is_enabled) {
         names.insert(online.name.clone());
      }
   }

   names.extend(settings.offline_blocklists.iter().filter(|offline| offline.is_enabled).map(|offline| offline.name.clone()));
   names
}

/// `www.ads.example.com` -> `example.com`, `None` when the domain has fewer than three labels
fn primary_domain(domain: &str) -> Option<String> {
   let parts: Vec<&str> = domain.rsplitn(3, '.').collect();
   if parts.len() > 2 {
      Some(format!("{}.{}", parts[1], parts[0]))
   } else {
      None
   }
}

/// Loaded lists plus the built-in resolver lists, swapped wholesale on reload
pub struct BlocklistManager {
   data_directory: std::path::PathBuf,
   lists: arc_swap::ArcSwap<Vec<std::sync::Arc<Blocklist>>>,
   dns_ip: arc_swap::ArcSwap<std::collections::HashSet<std::net::IpAddr>>,
   dns_domains: arc_swap::ArcSwap<Blocklist>,
}

impl BlocklistManager {
   pub fn new(data_directory: std::path::PathBuf) -> Self {
      let manager = Self::with_lists(data_directory, Vec::new());
      manager.load_builtins();
      manager
   }

   /// Manager over already built lists, built-ins from the compiled in defaults
   pub fn with_lists(data_directory: std::path::PathBuf, lists: Vec<Blocklist>) -> Self {
      let dns_domains: Vec<String> = crate::statics::BUILTIN_DNS_DOMAINS.iter().map(|domain| domain.to_string()).collect();
      let dns_ip: std::collections::HashSet<std::net::IpAddr> =
         crate::statics::BUILTIN_DNS_IP.iter().filter_map(|ip| ip.parse().ok()).collect();

      Self {
         data_directory,
         lists: arc_swap::ArcSwap::from_pointee(lists.into_iter().map(std::sync::Arc::new).collect()),
         dns_ip: arc_swap::ArcSwap::from_pointee(dns_ip),
         dns_domains: arc_swap::ArcSwap::from_pointee(Blocklist::from_entries(DNS_DOMAINS, ContentKind::Domain, &dns_domains)),
      }
   }

   fn storage_dir(&self, section: &str) -> std::path::PathBuf {
      let mut path = self.data_directory.clone();
      path.push(BLOCKLIST_DIR);
      path.push(section);
      path
   }

   /// Replaces the built-in lists with `builtin/DNS_IP.txt` and `builtin/DNS_DOMAINS.txt` when those files exist
   pub fn load_builtins(&self) {
      let builtin_dir = self.storage_dir("builtin");

      let read_builtin = |name: &str, kind: BlocklistKind| -> Option<Vec<String>> {
         let path = builtin_dir.join(format!("{name}.txt"));
         match std::fs::read_to_string(&path) {
            Ok(text) => Some(parse_entries(&text, kind)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
               tracing::debug!("Built-in list {} not found, using defaults", path.display());
               None
            }
            Err(err) => {
               tracing::error!("Error loading built-in list {}: {}", path.display(), err);
               None
            }
         }
      };

      if let Some(entries) = read_builtin(DNS_IP, BlocklistKind::Ip) {
         let ips: std::collections::HashSet<std::net::IpAddr> = entries.iter().filter_map(|ip| ip.parse().ok()).collect();
         tracing::info!("Blocklist: Loaded {} Entries: {}", DNS_IP, ips.len());
         self.dns_ip.store(std::sync::Arc::new(ips));
      }

      if let Some(entries) = read_builtin(DNS_DOMAINS, BlocklistKind::Domain) {
         tracing::info!("Blocklist: Loaded {} Entries: {}", DNS_DOMAINS, entries.len());
         self.dns_domains.store(std::sync::Arc::new(Blocklist::from_entries(DNS_DOMAINS, ContentKind::Domain, &entries)));
      }
   }

   /// Loads every configured list, downloading online lists that are missing or due. Returns the online lists whose
   /// `last_update` moved, as `(name, unix seconds)`.
   pub async fn load(&self, settings: &BlocklistSettings) -> Vec<(String, i64)> {
      let mut lists: Vec<std::sync::Arc<Blocklist>> = Vec::new();

      for offline in &settings.offline_blocklists {
         match load_offline(offline) {
            Ok(blocklist) => lists.push(std::sync::Arc::new(blocklist)),
            Err(err) => tracing::error!("Error loading blocklist {}: {}", offline.name, err),
         }
      }

      let online_dir = self.storage_dir("online");
      let mut tasks = Vec::with_capacity(settings.online_blocklists.len());
      for online in settings.online_blocklists.iter().cloned() {
         let file_path = online_dir.join(format!("{}.bin", online.name));
         tasks.push(tokio::spawn(async move { load_online(&online, &file_path).await }));
      }

      let mut updated = Vec::new();
      for (task, online) in tasks.into_iter().zip(settings.online_blocklists.iter()) {
         match task.await {
            Ok(Some((blocklist, last_update))) => {
               lists.push(std::sync::Arc::new(blocklist));
               if let Some(last_update) = last_update {
                  updated.push((online.name.clone(), last_update));
               }
            }
            Ok(None) => (),
            Err(err) => tracing::error!("Blocklist task for {} failed: {}", online.name, err),
         }
      }

      let ip_count: usize = lists.iter().filter(|list| list.kind == ContentKind::Ip).map(|list| list.entry_count).sum();
      let domain_count: usize = lists.iter().filter(|list| list.kind == ContentKind::Domain).map(|list| list.entry_count).sum();
      tracing::info!("Blocklists: Loaded {} blocklists | {} IPs | {} domains", lists.len(), ip_count, domain_count);

      self.lists.store(std::sync::Arc::new(lists));
      updated
   }

   #[inline]
   pub fn lists(&self) -> std::sync::Arc<Vec<std::sync::Arc<Blocklist>>> {
      self.lists.load_full()
   }

   /// Well-known public resolver address
   #[inline]
   pub fn is_dns_ip(&self, ip: &std::net::IpAddr) -> bool {
      self.dns_ip.load().contains(ip)
   }

   /// Well-known DoH / DoT provider host
   pub fn is_dns_domain(&self, domain: &str) -> bool {
      let domain = domain.to_lowercase();
      let dns_domains = self.dns_domains.load();
      dns_domains.might_contain(&domain) || primary_domain(&domain).is_some_and(|primary| dns_domains.might_contain(&primary))
   }

   /// First enabled domain list holding `domain` or its primary domain
   pub fn match_domain(&self, domain: &str, enabled: &std::collections::HashSet<String>) -> Option<std::sync::Arc<Blocklist>> {
      let domain = crate::dns::clean_domain_name(domain).to_lowercase();
      let primary = primary_domain(&domain);

      self
         .lists
         .load()
         .iter()
         .filter(|list| list.kind == ContentKind::Domain && enabled.contains(&list.name))
         .find(|list| list.might_contain(&domain) || primary.as_deref().is_some_and(|primary| list.might_contain(primary)))
         .cloned()
   }

   /// First enabled IP list holding `ip`
   pub fn match_ip(&self, ip: &std::net::IpAddr, enabled: &std::collections::HashSet<String>) -> Option<std::sync::Arc<Blocklist>> {
      let ip = ip.to_string();
      self
         .lists
         .load()
         .iter()
         .filter(|list| list.kind == ContentKind::Ip && enabled.contains(&list.name))
         .find(|list| list.might_contain(&ip))
         .cloned()
   }

   /// Reloads on start, whenever the blocklist settings change, and hourly so due online lists get refreshed.
   /// New `last_update` stamps are written back to the settings.
   pub async fn run_updates(
      self: std::sync::Arc<Self>,
      settings: std::sync::Arc<crate::settings::SettingsHandle>,
      cancel: tokio_util::sync::CancellationToken,
   ) {
      const RECHECK_INTERVAL_SECS: u64 = 3600;

      let mut changes = settings.subscribe();
      let mut loaded: Option<BlocklistSettings> = None;

      loop {
         let current = settings.settings().blocklists.clone();
         if loaded.as_ref() != Some(&current) {
            let updated = self.load(&current).await;
            if !updated.is_empty() {
               settings.update_settings(|settings| {
                  for (name, last_update) in &updated {
                     if let Some(online) = settings.blocklists.online_blocklists.iter_mut().find(|online| &online.name == name) {
                        online.last_update = Some(*last_update);
                     }
                  }
               });
            }
            loaded = Some(settings.settings().blocklists.clone());
         }

         tokio::select! {
            _ = cancel.cancelled() => return,
            changed = changes.changed() => {
               if changed.is_err() {
                  return;
               }
            },
            _ = tokio::time::sleep(std::time::Duration::from_secs(RECHECK_INTERVAL_SECS)) => {
               // forces a pass so due online lists are refreshed
               loaded = None;
            },
         }
      }
   }
}

fn load_offline(offline: &OfflineBlocklist) -> crate::error::Result<Blocklist> {
   let mut entries = Vec::new();

   if offline.file_path.is_dir() {
      for entry in walkdir::WalkDir::new(&offline.file_path).into_iter().filter_map(|entry| entry.ok()) {
         if entry.file_type().is_file() {
            let text = std::fs::read_to_string(entry.path())?;
            entries.extend(parse_entries(&text, offline.kind));
         }
      }
   } else {
      let text = std::fs::read_to_string(&offline.file_path)?;
      entries = parse_entries(&text, offline.kind);
   }

   entries.sort_unstable();
   entries.dedup();

   let blocklist = Blocklist::from_entries(&offline.name, offline.kind.into(), &entries);
   tracing::info!("Blocklist: Loaded {} Type: {:?} Entries: {}", offline.name, blocklist.kind, blocklist.entry_count);
   Ok(blocklist)
}

/// Returns the list and, when the source was checked, the new `last_update`
async fn load_online(online: &OnlineBlocklist, file_path: &std::path::Path) -> Option<(Blocklist, Option<i64>)> {
   let existing: Option<BlocklistFile> = crate::util::read_from_file_bincode(file_path);
   let now = crate::util::get_unix_ts_secs() as i64;

   let due = online.is_auto_update
      && online.last_update.map_or(true, |last_update| last_update + (online.update_interval as i64) * 3600 < now);

   let (file, last_update) = match existing {
      Some(existing) if !due => (existing, None),
      existing => match download(online, existing.as_ref(), file_path).await {
         Ok(file) => (file, Some(now)),
         Err(err) => {
            tracing::error!("Error updating online blocklist {}: {}", online.name, err);
            (existing?, None)
         }
      },
   };

   let blocklist = Blocklist::from_entries(&online.name, online.kind.into(), &file.entries);
   tracing::info!("Blocklist: Loaded {} Type: {:?} Entries: {}", online.name, blocklist.kind, blocklist.entry_count);
   Some((blocklist, last_update))
}

/// Fetches a list unless the server's Last-Modified matches the cached copy
async fn download(
   online: &OnlineBlocklist,
   existing: Option<&BlocklistFile>,
   file_path: &std::path::Path,
) -> crate::error::Result<BlocklistFile> {
   let mut headers = reqwest::header::HeaderMap::new();
   headers.insert(
      reqwest::header::USER_AGENT,
      reqwest::header::HeaderValue::from_static(
         "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/117.0.0.0 Safari/537.36",
      ),
   );
   headers.insert(reqwest::header::ACCEPT, reqwest::header::HeaderValue::from_static("text/plain"));
   headers.insert(reqwest::header::CACHE_CONTROL, reqwest::header::HeaderValue::from_static("no-cache"));
   headers.insert(reqwest::header::PRAGMA, reqwest::header::HeaderValue::from_static("no-cache"));

   let head = REQWEST_AGENT.head(&online.uri).headers(headers.clone()).send().await?.error_for_status()?;
   let last_modified = head
      .headers()
      .get(reqwest::header::LAST_MODIFIED)
      .and_then(|value| value.to_str().ok())
      .and_then(|value| chrono::DateTime::parse_from_rfc2822(value).ok())
      .map(|date| date.timestamp());

   if let (Some(existing), Some(last_modified)) = (existing, last_modified) {
      if existing.last_modified == last_modified {
         tracing::debug!("Blocklist {} unchanged since {}", online.name, last_modified);
         return Ok(existing.clone());
      }
   }

   tracing::info!("Downloading blocklist: {} -> {}", online.uri, file_path.display());
   let body = REQWEST_AGENT.get(&online.uri).headers(headers).send().await?.error_for_status()?.text().await?;

   let mut entries = parse_entries(&body, online.kind);
   entries.sort_unstable();
   entries.dedup();
   if entries.is_empty() {
      return Err(crate::error::Error::Blocklist(format!("{} returned no entries", online.uri)));
   }

   let file = BlocklistFile { last_modified: last_modified.unwrap_or(0), entries };
   crate::util::write_to_file_bincode(&file, file_path)?;
   Ok(file)
}

#[cfg(test)]
mod tests {
   use super::*;

   fn temp_dir() -> std::path::PathBuf {
      let mut path = std::env::temp_dir();
      path.push(format!("faf-firewall-blocklist-{}-{:x}", std::process::id(), fastrand::u64(..)));
      std::fs::create_dir_all(&path).unwrap();
      path
   }

   #[test]
   fn lines_are_normalized_per_kind() {
      assert_eq!(parse_line("0.0.0.0 Ads.Example.com", BlocklistKind::Hosts).as_deref(), Some("ads.example.com"));
      assert_eq!(parse_line("*.tracker.example", BlocklistKind::Wildcard).as_deref(), Some("tracker.example"));
      assert_eq!(parse_line("1.2.3.4 # bad actor", BlocklistKind::Ip).as_deref(), Some("1.2.3.4"));
      assert_eq!(parse_line("5.6.7.8;comment", BlocklistKind::Ip).as_deref(), Some("5.6.7.8"));
      assert_eq!(parse_line("Example.ORG", BlocklistKind::Domain).as_deref(), Some("example.org"));
      assert_eq!(parse_line("# comment", BlocklistKind::Domain), None);
      assert_eq!(parse_line("// comment", BlocklistKind::Domain), None);
      assert_eq!(parse_line("   ", BlocklistKind::Domain), None);
   }

   #[test]
   fn domain_and_primary_domain_match() {
      let entries = vec!["ads.example".to_string(), "tracker.net".to_string()];
      let manager = BlocklistManager::with_lists(temp_dir(), vec![Blocklist::from_entries("Ads", ContentKind::Domain, &entries)]);
      let enabled: std::collections::HashSet<String> = ["Ads".to_string()].into_iter().collect();

      assert_eq!(manager.match_domain("ADS.example", &enabled).map(|list| list.name.clone()), Some("Ads".to_string()));
      assert!(manager.match_domain("cdn.tracker.net", &enabled).is_some());
      assert!(manager.match_domain("example.com", &enabled).is_none());
      assert!(manager.match_domain("ads.example", &std::collections::HashSet::new()).is_none());
   }

   #[test]
   fn ip_lists_only_match_ips() {
      let entries = vec!["203.0.113.7".to_string()];
      let manager = BlocklistManager::with_lists(temp_dir(), vec![Blocklist::from_entries("Bad", ContentKind::Ip, &entries)]);
      let enabled: std::collections::HashSet<String> = ["Bad".to_string()].into_iter().collect();

      assert!(manager.match_ip(&"203.0.113.7".parse().unwrap(), &enabled).is_some());
      assert!(manager.match_ip(&"203.0.113.8".parse().unwrap(), &enabled).is_none());
      assert!(manager.match_domain("203.0.113.7", &enabled).is_none());
   }

   #[test]
   fn builtin_lists_have_defaults_and_file_overrides() {
      let dir = temp_dir();
      let manager = BlocklistManager::new(dir.clone());
      assert!(manager.is_dns_ip(&"1.1.1.1".parse().unwrap()));
      assert!(manager.is_dns_domain("dns.google"));
      assert!(!manager.is_dns_ip(&"192.0.2.1".parse().unwrap()));

      let builtin = dir.join(BLOCKLIST_DIR).join("builtin");
      std::fs::create_dir_all(&builtin).unwrap();
      std::fs::write(builtin.join("DNS_IP.txt"), "// resolvers\n192.0.2.53\n").unwrap();
      manager.load_builtins();
      assert!(manager.is_dns_ip(&"192.0.2.53".parse().unwrap()));
      assert!(!manager.is_dns_ip(&"1.1.1.1".parse().unwrap()));
   }

   #[tokio::test]
   async fn offline_lists_load_from_file_and_directory() {
      let dir = temp_dir();
      let single = dir.join("hosts.txt");
      std::fs::write(&single, "# hosts\n0.0.0.0 ads.example\n127.0.0.1 tracker.example\n").unwrap();

      let nested = dir.join("ips");
      std::fs::create_dir_all(&nested).unwrap();
      std::fs::write(nested.join("a.txt"), "198.51.100.1\n").unwrap();
      std::fs::write(nested.join("b.txt"), "198.51.100.2 # second\n").unwrap();

      let settings = BlocklistSettings {
         offline_blocklists: vec![
            OfflineBlocklist { name: "Hosts".to_string(), file_path: single, kind: BlocklistKind::Hosts, is_enabled: true },
            OfflineBlocklist { name: "Ips".to_string(), file_path: nested, kind: BlocklistKind::Ip, is_enabled: true },
            OfflineBlocklist { name: "Missing".to_string(), file_path: dir.join("nope.txt"), kind: BlocklistKind::Domain, is_enabled: true },
         ],
         online_blocklists: Vec::new(),
      };

      let manager = BlocklistManager::new(dir);
      let updated = manager.load(&settings).await;
      assert!(updated.is_empty());

      let lists = manager.lists();
      assert_eq!(lists.len(), 2);
      assert_eq!(lists[0].entry_count, 2);
      assert_eq!(lists[1].kind, ContentKind::Ip);
      assert_eq!(lists[1].entry_count, 2);
   }

   #[tokio::test]
   async fn cached_online_list_is_used_when_not_due() {
      let dir = temp_dir();
      let online = OnlineBlocklist {
         name: "Cached".to_string(),
         uri: "https://127.0.0.1:1/never-fetched.txt".to_string(),
         update_interval: 24,
         kind: BlocklistKind::Domain,
         is_auto_update: true,
         last_update: Some(crate::util::get_unix_ts_secs() as i64),
         is_enabled: true,
      };

      let file_path = dir.join(BLOCKLIST_DIR).join("online").join("Cached.bin");
      let file = BlocklistFile { last_modified: 1, entries: vec!["cached.example".to_string()] };
      crate::util::write_to_file_bincode(&file, &file_path).unwrap();

      let manager = BlocklistManager::new(dir);
      let settings = BlocklistSettings { offline_blocklists: Vec::new(), online_blocklists: vec![online] };
      let updated = manager.load(&settings).await;

      assert!(updated.is_empty());
      let enabled = enabled_blocklist_names(&settings, None);
      assert!(manager.match_domain("cached.example", &enabled).is_some());
   }

   #[test]
   fn profile_state_overrides_global_online_state() {
      let settings = BlocklistSettings::default();
      let all_online: std::collections::HashSet<String> = settings.online_blocklists.iter().map(|list| list.name.clone()).collect();
      assert_eq!(enabled_blocklist_names(&settings, None), all_online);

      let first = settings.online_blocklists[0].name.clone();
      let profile = crate::profiles::ProfileBlocklists {
         offline_blocklists: Vec::new(),
         online_blocklists: vec![crate::profiles::BlocklistEnabledState { name: first.clone(), is_enabled: Some(false) }],
      };
      let enabled = enabled_blocklist_names(&settings, Some(&profile));
      assert!(!enabled.contains(&first));
      assert_eq!(enabled.len(), all_online.len() - 1);
   }
}
