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

//! Application settings, their YAML persistence, and the shared handle every engine reads them through.

use crate::error::Result;

#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApplicationSettings {
   pub dns_server: DnsServerSettings,
   pub network_action: NetworkActionSettings,
   pub blocklists: BlocklistSettings,
   pub application: GeneralSettings,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DnsServerSettings {
   pub is_enabled: bool,
   /// pick a random healthy resolver per query instead of the first one
   pub randomized_clients: bool,
   /// seconds a resolved response stays in the response store
   pub response_store_time: u64,
   pub max_concurrent_queries: usize,
   /// seconds a failing resolver sits out before it is tried again
   pub resolver_recovery_time: u64,
   /// milliseconds per upstream attempt
   pub query_timeout: u64,
   pub max_retries: u32,
   pub resolvers: Vec<String>,
}

impl Default for DnsServerSettings {
   fn default() -> Self {
      Self {
         is_enabled: false,
         randomized_clients: false,
         response_store_time: 600,
         max_concurrent_queries: 5,
         resolver_recovery_time: 10,
         query_timeout: 1000,
         max_retries: 3,
         resolvers: crate::statics::DEFAULT_RESOLVERS.iter().map(|uri| uri.to_string()).collect(),
      }
   }
}

impl DnsServerSettings {
   #[inline]
   pub fn query_timeout(&self) -> std::time::Duration {
      std::time::Duration::from_millis(self.query_timeout.max(1))
   }

   #[inline]
   pub fn resolver_recovery_time(&self) -> std::time::Duration {
      std::time::Duration::from_secs(self.resolver_recovery_time)
   }

   #[inline]
   pub fn selection_strategy(&self) -> crate::resolver::SelectionStrategy {
      if self.randomized_clients {
         crate::resolver::SelectionStrategy::Random
      } else {
         crate::resolver::SelectionStrategy::First
      }
   }
}

/// What happens to a connection no earlier stage decided on
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DefaultAction {
   Block,
   #[default]
   Allow,
   Prompt,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkActionSettings {
   pub default_network_action: DefaultAction,
   pub force_block_incoming: bool,
   pub force_block_localhost: bool,
   pub force_block_lan: bool,
   pub force_block_internet: bool,
   pub block_bypass_dns: bool,
   pub incoming_rules: Vec<String>,
   pub outgoing_rules: Vec<String>,
}

impl Default for NetworkActionSettings {
   fn default() -> Self {
      Self {
         default_network_action: DefaultAction::Allow,
         force_block_incoming: true,
         force_block_localhost: false,
         force_block_lan: false,
         force_block_internet: false,
         block_bypass_dns: true,
         incoming_rules: Vec::new(),
         outgoing_rules: Vec::new(),
      }
   }
}

/// Per-profile overrides, `None` falls back to the global value
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProfileNetworkAction {
   pub default_network_action: Option<DefaultAction>,
   pub force_block_incoming: Option<bool>,
   pub force_block_localhost: Option<bool>,
   pub force_block_lan: Option<bool>,
   pub force_block_internet: Option<bool>,
   pub block_bypass_dns: Option<bool>,
   pub incoming_rules: Option<Vec<String>>,
   pub outgoing_rules: Option<Vec<String>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BlocklistKind {
   Wildcard,
   Domain,
   Hosts,
   #[serde(rename = "IP")]
   Ip,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineBlocklist {
   pub name: String,
   /// a single list file, or a directory whose files are all read
   pub file_path: std::path::PathBuf,
   pub kind: BlocklistKind,
   #[serde(default)]
   pub is_enabled: bool,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineBlocklist {
   pub name: String,
   pub uri: String,
   /// hours between refreshes
   #[serde(default = "default_update_interval")]
   pub update_interval: u64,
   pub kind: BlocklistKind,
   #[serde(default = "default_true")]
   pub is_auto_update: bool,
   /// unix seconds of the last successful download
   #[serde(default)]
   pub last_update: Option<i64>,
   #[serde(default)]
   pub is_enabled: bool,
}

fn default_update_interval() -> u64 {
   24
}

fn default_true() -> bool {
   true
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BlocklistSettings {
   pub offline_blocklists: Vec<OfflineBlocklist>,
   pub online_blocklists: Vec<OnlineBlocklist>,
}

impl Default for BlocklistSettings {
   fn default() -> Self {
      let online = |name: &str, uri: &str, kind: BlocklistKind| OnlineBlocklist {
         name: name.to_string(),
         uri: uri.to_string(),
         update_interval: 24,
         kind,
         is_auto_update: true,
         last_update: None,
         is_enabled: true,
      };

      Self {
         offline_blocklists: Vec::new(),
         online_blocklists: vec![
            online("DnsBypass1", "https://raw.githubusercontent.com/hagezi/dns-blocklists/main/hosts/doh.txt", BlocklistKind::Hosts),
            online("DnsBypass2", "https://raw.githubusercontent.com/hagezi/dns-blocklists/main/wildcard/doh.txt", BlocklistKind::Wildcard),
            online("DnsBypass4", "https://raw.githubusercontent.com/hagezi/dns-blocklists/main/ips/doh.txt", BlocklistKind::Ip),
            online(
               "ThreatIntelligenceFeeds1",
               "https://raw.githubusercontent.com/hagezi/dns-blocklists/main/wildcard/tif-onlydomains.txt",
               BlocklistKind::Domain,
            ),
            online("ThreatIntelligenceFeeds2", "https://raw.githubusercontent.com/hagezi/dns-blocklists/main/ips/tif.txt", BlocklistKind::Ip),
         ],
      }
   }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GeneralSettings {
   /// seconds an ended connection is kept before it is purged
   pub connection_ended_timeout: u64,
   /// write `$HOME` style paths into generated fingerprints
   pub profile_generate_with_env_vars: bool,
}

impl Default for GeneralSettings {
   fn default() -> Self {
      Self { connection_ended_timeout: 600, profile_generate_with_env_vars: true }
   }
}

const SAVE_MAX_RETRIES: u32 = 3;
const SAVE_RETRY_DELAY_MS: u64 = 100;

/// Reads a YAML document. Missing, empty or unparsable files produce the default value.
pub fn load_yaml<T>(path: &std::path::Path) -> T
where
   T: serde::de::DeserializeOwned + Default,
{
   let yaml = match std::fs::read_to_string(path) {
      Ok(yaml) => yaml,
      Err(_) => return T::default(),
   };

   if yaml.trim().is_empty() {
      return T::default();
   }

   match serde_yaml::from_str::<T>(&yaml) {
      Ok(value) => value,
      Err(err) => {
         tracing::error!("Error loading {}: {}", path.display(), err);
         T::default()
      }
   }
}

/// Writes a YAML document, creating parent directories and retrying transient I/O failures
pub fn save_yaml<T>(path: &std::path::Path, value: &T) -> Result<()>
where
   T: serde::Serialize,
{
   let yaml = serde_yaml::to_string(value)?;

   let mut attempt = 0;
   loop {
      let result = (|| -> std::io::Result<()> {
         if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
         }
         std::fs::write(path, yaml.as_bytes())
      })();

      match result {
         Ok(()) => return Ok(()),
         Err(err) if attempt + 1 < SAVE_MAX_RETRIES => {
            attempt += 1;
            tracing::debug!("Retrying write of {} after: {}", path.display(), err);
            std::thread::sleep(std::time::Duration::from_millis(SAVE_RETRY_DELAY_MS));
         }
         Err(err) => return Err(err.into()),
      }
   }
}

/// Shared configuration. Readers take cheap snapshots, writers publish a whole new snapshot which is persisted and
/// announced on the change channel.
pub struct SettingsHandle {
   settings: arc_swap::ArcSwap<ApplicationSettings>,
   profiles: arc_swap::ArcSwap<Vec<crate::profiles::Profile>>,
   settings_path: Option<std::path::PathBuf>,
   profiles_path: Option<std::path::PathBuf>,
   writer_lock: std::sync::Mutex<()>,
   changed_tx: tokio::sync::watch::Sender<u64>,
}

impl SettingsHandle {
   /// Loads both documents, falling back to defaults, makes sure the special profiles exist and writes the result
   /// back so a fresh install ends up with complete files.
   pub fn load(settings_path: std::path::PathBuf, profiles_path: std::path::PathBuf) -> Self {
      let settings: ApplicationSettings = load_yaml(&settings_path);
      let mut profiles: Vec<crate::profiles::Profile> = load_yaml(&profiles_path);
      crate::profiles::ensure_special_profiles(&mut profiles);

      let handle = Self::build(settings, profiles, Some(settings_path), Some(profiles_path));
      handle.persist_settings();
      handle.persist_profiles();
      handle
   }

   /// Handle that never touches the disk
   pub fn in_memory(settings: ApplicationSettings, mut profiles: Vec<crate::profiles::Profile>) -> Self {
      crate::profiles::ensure_special_profiles(&mut profiles);
      Self::build(settings, profiles, None, None)
   }

   fn build(
      settings: ApplicationSettings,
      profiles: Vec<crate::profiles::Profile>,
      settings_path: Option<std::path::PathBuf>,
      profiles_path: Option<std::path::PathBuf>,
   ) -> Self {
      let (changed_tx, _) = tokio::sync::watch::channel(0);
      Self {
         settings: arc_swap::ArcSwap::from_pointee(settings),
         profiles: arc_swap::ArcSwap::from_pointee(profiles),
         settings_path,
         profiles_path,
         writer_lock: std::sync::Mutex::new(()),
         changed_tx,
      }
   }

   #[inline]
   pub fn settings(&self) -> std::sync::Arc<ApplicationSettings> {
      self.settings.load_full()
   }

   #[inline]
   pub fn profiles(&self) -> std::sync::Arc<Vec<crate::profiles::Profile>> {
      self.profiles.load_full()
   }

   pub fn subscribe(&self) -> tokio::sync::watch::Receiver<u64> {
      self.changed_tx.subscribe()
   }

   /// Read-modify-write of the settings snapshot
   pub fn update_settings<R>(&self, update: impl FnOnce(&mut ApplicationSettings) -> R) -> R {
      let _guard = self.writer_lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
      let mut next = (*self.settings.load_full()).clone();
      let result = update(&mut next);
      self.settings.store(std::sync::Arc::new(next));
      self.persist_settings();
      self.notify();
      result
   }

   /// Read-modify-write of the profile list. The special profiles are restored if the update removed them.
   pub fn update_profiles<R>(&self, update: impl FnOnce(&mut Vec<crate::profiles::Profile>) -> R) -> R {
      let _guard = self.writer_lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
      let mut next = (*self.profiles.load_full()).clone();
      let result = update(&mut next);
      crate::profiles::ensure_special_profiles(&mut next);
      self.profiles.store(std::sync::Arc::new(next));
      self.persist_profiles();
      self.notify();
      result
   }

   fn notify(&self) {
      self.changed_tx.send_modify(|generation| *generation = generation.wrapping_add(1));
   }

   fn persist_settings(&self) {
      if let Some(path) = &self.settings_path {
         if let Err(err) = save_yaml(path, &**self.settings.load()) {
            tracing::error!("Failed to save settings to {}: {}", path.display(), err);
         }
      }
   }

   fn persist_profiles(&self) {
      if let Some(path) = &self.profiles_path {
         if let Err(err) = save_yaml(path, &**self.profiles.load()) {
            tracing::error!("Failed to save profiles to {}: {}", path.display(), err);
         }
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   fn temp_path(name: &str) -> std::path::PathBuf {
      let mut path = std::env::temp_dir();
      path.push(format!("faf-firewall-test-{}-{:x}", std::process::id(), fastrand::u64(..)));
      path.push(name);
      path
   }

   #[test]
   fn defaults_match_documented_values() {
      let settings = ApplicationSettings::default();
      assert!(!settings.dns_server.is_enabled);
      assert_eq!(settings.dns_server.max_concurrent_queries, 5);
      assert_eq!(settings.dns_server.query_timeout(), std::time::Duration::from_millis(1000));
      assert_eq!(settings.dns_server.max_retries, 3);
      assert_eq!(settings.network_action.default_network_action, DefaultAction::Allow);
      assert!(settings.network_action.force_block_incoming);
      assert!(settings.network_action.block_bypass_dns);
      assert_eq!(settings.application.connection_ended_timeout, 600);
      assert!(crate::resolver::parse_resolvers(&settings.dns_server.resolvers).len() == settings.dns_server.resolvers.len());
   }

   #[test]
   fn partial_yaml_fills_in_defaults() {
      let yaml = "dnsServer:\n  isEnabled: true\n  maxRetries: 5\nnetworkAction:\n  defaultNetworkAction: Block\n  outgoingRules:\n    - BLOCK 10.0.0.0/8\n";
      let settings: ApplicationSettings = serde_yaml::from_str(yaml).unwrap();
      assert!(settings.dns_server.is_enabled);
      assert_eq!(settings.dns_server.max_retries, 5);
      assert_eq!(settings.dns_server.query_timeout, 1000);
      assert_eq!(settings.network_action.default_network_action, DefaultAction::Block);
      assert_eq!(settings.network_action.outgoing_rules, vec!["BLOCK 10.0.0.0/8".to_string()]);
      assert!(settings.network_action.force_block_incoming);
   }

   #[test]
   fn load_writes_back_defaults_and_special_profiles() {
      let settings_path = temp_path("settings.yaml");
      let profiles_path = temp_path("profiles.yaml");

      let handle = SettingsHandle::load(settings_path.clone(), profiles_path.clone());
      assert_eq!(*handle.settings(), ApplicationSettings::default());
      assert!(settings_path.exists());
      assert!(profiles_path.exists());

      let reloaded: Vec<crate::profiles::Profile> = load_yaml(&profiles_path);
      assert_eq!(reloaded.len(), handle.profiles().len());
      assert!(reloaded.iter().any(|profile| profile.id == crate::statics::PROFILE_ID_SELF));
   }

   #[test]
   fn updates_are_written_to_disk() {
      let settings_path = temp_path("settings.yaml");
      let profiles_path = temp_path("profiles.yaml");
      let handle = SettingsHandle::load(settings_path.clone(), profiles_path.clone());

      handle.update_settings(|settings| settings.dns_server.max_retries = 7);
      let reloaded: ApplicationSettings = load_yaml(&settings_path);
      assert_eq!(reloaded.dns_server.max_retries, 7);

      handle.update_profiles(|profiles| {
         profiles.push(crate::profiles::Profile { id: "written".to_string(), ..Default::default() })
      });
      let reloaded: Vec<crate::profiles::Profile> = load_yaml(&profiles_path);
      assert!(reloaded.iter().any(|profile| profile.id == "written"));
   }

   #[test]
   fn unparsable_yaml_yields_defaults() {
      let path = temp_path("broken.yaml");
      save_yaml(&path, &"just a string").unwrap();
      let settings: ApplicationSettings = load_yaml(&path);
      assert_eq!(settings, ApplicationSettings::default());
   }

   #[test]
   fn updates_publish_a_new_generation() {
      let handle = SettingsHandle::in_memory(ApplicationSettings::default(), Vec::new());
      let mut changes = handle.subscribe();
      let before = *changes.borrow_and_update();

      handle.update_settings(|settings| settings.dns_server.is_enabled = true);
      assert!(handle.settings().dns_server.is_enabled);
      assert!(changes.has_changed().unwrap());
      assert_ne!(*changes.borrow_and_update(), before);

      handle.update_profiles(|profiles| profiles.clear());
      assert!(handle.profiles().iter().any(|profile| profile.id == crate::statics::PROFILE_ID_UNKNOWN));
   }
}
