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

use crate::settings::{ApplicationSettings, DefaultAction, NetworkActionSettings, ProfileNetworkAction};

pub const SERVICE_PREFIX: &str = "SVC:";
pub const STORE_APP_PREFIX: &str = "WinStore:";

/// Service that answers DNS for the rest of the system
const SYSTEM_DNS_SERVICE: &str = "systemd-resolved";

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FingerprintKind {
   FullPath,
   ProcessName,
   CommandLine,
   Service,
   StoreApp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum MatchOperator {
   Equals,
   StartsWith,
   Contains,
   /// `*` stops at a path separator, `**` does not
   Wildcard,
   Regex,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fingerprint {
   pub kind: FingerprintKind,
   pub operator: MatchOperator,
   pub value: String,
}

impl Fingerprint {
   pub fn new(kind: FingerprintKind, operator: MatchOperator, value: impl Into<String>) -> Self {
      Self { kind, operator, value: value.into() }
   }

   pub fn matches(&self, process: &ProcessIdentity<'_>) -> bool {
      let subject = match self.kind {
         FingerprintKind::FullPath => process.path,
         FingerprintKind::ProcessName => process.name,
         FingerprintKind::CommandLine => process.command_line,
         FingerprintKind::Service => process.name.strip_prefix(SERVICE_PREFIX).unwrap_or_default(),
         FingerprintKind::StoreApp => process.name.strip_prefix(STORE_APP_PREFIX).unwrap_or_default(),
      };

      let value = self.normalized_value();
      match self.operator {
         MatchOperator::Equals => subject.eq_ignore_ascii_case(&value),
         MatchOperator::StartsWith => starts_with_ignore_case(subject, &value),
         MatchOperator::Contains => subject.to_lowercase().contains(&value.to_lowercase()),
         MatchOperator::Wildcard => matches_pattern(&wildcard_to_regex(&value), subject),
         MatchOperator::Regex => matches_pattern(&value, subject),
      }
   }

   /// Path and command line values compare with environment variables expanded
   fn normalized_value(&self) -> String {
      match self.kind {
         FingerprintKind::FullPath | FingerprintKind::CommandLine => crate::util::expand_env_vars(&self.value),
         _ => self.value.clone(),
      }
   }
}

impl PartialEq for Fingerprint {
   fn eq(&self, other: &Self) -> bool {
      self.kind == other.kind
         && self.operator == other.operator
         && self.normalized_value().to_lowercase() == other.normalized_value().to_lowercase()
   }
}

impl Eq for Fingerprint {}

#[inline]
fn starts_with_ignore_case(subject: &str, prefix: &str) -> bool {
   subject.len() >= prefix.len()
      && subject.is_char_boundary(prefix.len())
      && subject[..prefix.len()].eq_ignore_ascii_case(prefix)
}

fn wildcard_to_regex(pattern: &str) -> String {
   let escaped = regex::escape(pattern);
   format!("^{}$", escaped.replace(r"\*\*", ".*").replace(r"\*", "[^/]*"))
}

lazy_static::lazy_static! {
   /// Compiled fingerprint patterns, `None` for patterns that do not compile
   static ref PATTERN_CACHE: dashmap::DashMap<String, Option<regex::Regex>, ahash::RandomState> =
      dashmap::DashMap::with_hasher(ahash::RandomState::new());
}

fn matches_pattern(pattern: &str, subject: &str) -> bool {
   if let Some(compiled) = PATTERN_CACHE.get(pattern) {
      return compiled.as_ref().is_some_and(|regex| regex.is_match(subject));
   }

   let compiled = match regex::Regex::new(pattern) {
      Ok(regex) => Some(regex),
      Err(err) => {
         tracing::warn!("Invalid fingerprint pattern {}: {}", pattern, err);
         None
      }
   };
   let is_match = compiled.as_ref().is_some_and(|regex| regex.is_match(subject));
   PATTERN_CACHE.insert(pattern.to_string(), compiled);
   is_match
}

#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BlocklistEnabledState {
   pub name: String,
   /// `None` follows the global setting
   pub is_enabled: Option<bool>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProfileBlocklists {
   pub offline_blocklists: Vec<BlocklistEnabledState>,
   pub online_blocklists: Vec<BlocklistEnabledState>,
}

impl ProfileBlocklists {
   /// Snapshot of the global enablement, as given to new profiles
   pub fn from_settings(settings: &crate::settings::BlocklistSettings) -> Self {
      Self {
         offline_blocklists: settings
            .offline_blocklists
            .iter()
            .map(|list| BlocklistEnabledState { name: list.name.clone(), is_enabled: Some(list.is_enabled) })
            .collect(),
         online_blocklists: settings
            .online_blocklists
            .iter()
            .map(|list| BlocklistEnabledState { name: list.name.clone(), is_enabled: Some(list.is_enabled) })
            .collect(),
      }
   }
}

#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Profile {
   pub id: String,
   pub name: String,
   pub is_special: bool,
   pub is_auto_generated: bool,
   pub fingerprints: Vec<Fingerprint>,
   pub network_action: Option<ProfileNetworkAction>,
   pub blocklists: Option<ProfileBlocklists>,
}

impl Profile {
   /// The profile's overrides laid over the global network action
   pub fn effective_network_action(&self, global: &NetworkActionSettings) -> NetworkActionSettings {
      let Some(overrides) = &self.network_action else {
         return global.clone();
      };

      NetworkActionSettings {
         default_network_action: overrides.default_network_action.unwrap_or(global.default_network_action),
         force_block_incoming: overrides.force_block_incoming.unwrap_or(global.force_block_incoming),
         force_block_localhost: overrides.force_block_localhost.unwrap_or(global.force_block_localhost),
         force_block_lan: overrides.force_block_lan.unwrap_or(global.force_block_lan),
         force_block_internet: overrides.force_block_internet.unwrap_or(global.force_block_internet),
         block_bypass_dns: overrides.block_bypass_dns.unwrap_or(global.block_bypass_dns),
         incoming_rules: overrides.incoming_rules.clone().unwrap_or_else(|| global.incoming_rules.clone()),
         outgoing_rules: overrides.outgoing_rules.clone().unwrap_or_else(|| global.outgoing_rules.clone()),
      }
   }
}

/// The process attributes fingerprints are matched against
#[derive(Clone, Copy, Debug)]
pub struct ProcessIdentity<'a> {
   pub name: &'a str,
   pub path: &'a str,
   pub command_line: &'a str,
}

fn special_profile(id: &str, name: &str, fingerprints: Vec<Fingerprint>, network_action: ProfileNetworkAction) -> Profile {
   Profile {
      id: id.to_string(),
      name: name.to_string(),
      is_special: true,
      is_auto_generated: true,
      fingerprints,
      network_action: Some(network_action),
      blocklists: None,
   }
}

fn default_special_profiles() -> Vec<Profile> {
   let own_path = std::env::current_exe()
      .map(|path| path.to_string_lossy().into_owned())
      .unwrap_or_else(|_| crate::statics::PROJECT_NAME.to_string());

   let dns_rules = |extra: &[&str]| -> Option<Vec<String>> {
      let mut rules = vec![
         "ALLOW LOCALHOST",
         "ALLOW LAN UDP/5353",
         "ALLOW LAN UDP/5355",
         "ALLOW MULTICAST UDP/5353",
         "ALLOW MULTICAST UDP/5355",
      ];
      rules.extend_from_slice(extra);
      rules.push("BLOCK *");
      Some(rules.into_iter().map(str::to_string).collect())
   };

   let unrestricted = |default_network_action: DefaultAction| ProfileNetworkAction {
      default_network_action: Some(default_network_action),
      force_block_incoming: Some(false),
      force_block_localhost: Some(false),
      force_block_lan: Some(false),
      force_block_internet: Some(false),
      ..Default::default()
   };

   vec![
      special_profile(
         crate::statics::PROFILE_ID_SELF,
         "FaF Firewall",
         vec![Fingerprint::new(FingerprintKind::FullPath, MatchOperator::Equals, own_path)],
         ProfileNetworkAction { block_bypass_dns: Some(false), ..unrestricted(DefaultAction::Allow) },
      ),
      special_profile(
         crate::statics::PROFILE_ID_SYSTEM_DNS,
         "SystemDNS",
         vec![Fingerprint::new(FingerprintKind::Service, MatchOperator::Equals, SYSTEM_DNS_SERVICE)],
         ProfileNetworkAction {
            incoming_rules: dns_rules(&[]),
            outgoing_rules: dns_rules(&["ALLOW * UDP/53", "ALLOW * TCP/443", "ALLOW * TCP/853"]),
            ..unrestricted(DefaultAction::Block)
         },
      ),
      special_profile(
         crate::statics::PROFILE_ID_SYSTEM,
         "SYSTEM",
         vec![
            Fingerprint::new(FingerprintKind::ProcessName, MatchOperator::Equals, "SYSTEM"),
            Fingerprint::new(FingerprintKind::ProcessName, MatchOperator::Equals, "IDLE"),
         ],
         ProfileNetworkAction { incoming_rules: Some(Vec::new()), outgoing_rules: Some(Vec::new()), ..unrestricted(DefaultAction::Block) },
      ),
      special_profile(
         crate::statics::PROFILE_ID_UNKNOWN,
         "UNKNOWN",
         vec![Fingerprint::new(FingerprintKind::ProcessName, MatchOperator::Equals, "UNKNOWN")],
         ProfileNetworkAction::default(),
      ),
   ]
}

/// Adds any missing special profile. Returns true when the list changed.
pub fn ensure_special_profiles(profiles: &mut Vec<Profile>) -> bool {
   let mut changed = false;
   for special in default_special_profiles() {
      if !profiles.iter().any(|profile| profile.is_special && profile.id == special.id) {
         tracing::info!("ProfilesManager: Added special profile: {}", special.name);
         profiles.push(special);
         changed = true;
      }
   }
   changed
}

fn special_by_id<'a>(profiles: &'a [Profile], id: &str) -> Option<&'a Profile> {
   profiles.iter().find(|profile| profile.is_special && profile.id == id)
}

/// First profile owning `process`. SYSTEM, IDLE and UNKNOWN go to their special profiles before any fingerprint
/// is looked at.
pub fn match_process<'a>(profiles: &'a [Profile], process: &ProcessIdentity<'_>) -> Option<&'a Profile> {
   match process.name {
      "SYSTEM" | "IDLE" => return special_by_id(profiles, crate::statics::PROFILE_ID_SYSTEM),
      "UNKNOWN" => return special_by_id(profiles, crate::statics::PROFILE_ID_UNKNOWN),
      _ => (),
   }

   profiles.iter().find(|profile| profile.fingerprints.iter().any(|fingerprint| fingerprint.matches(process)))
}

pub enum DefaultProfile {
   /// A profile with the same fingerprint already exists
   Existing(Profile),
   Created(Profile),
}

/// Fingerprint identifying `process` in a generated profile
pub fn default_fingerprint(process: &ProcessIdentity<'_>, with_env_vars: bool) -> Fingerprint {
   if let Some(service) = process.name.strip_prefix(SERVICE_PREFIX) {
      // per-instance services share the part before the last underscore
      return match service.rfind('_') {
         Some(split) => Fingerprint::new(FingerprintKind::Service, MatchOperator::StartsWith, &service[..split]),
         None => Fingerprint::new(FingerprintKind::Service, MatchOperator::Equals, service),
      };
   }

   if let Some(store_app) = process.name.strip_prefix(STORE_APP_PREFIX) {
      return Fingerprint::new(FingerprintKind::StoreApp, MatchOperator::Equals, store_app);
   }

   let path = if with_env_vars { crate::util::contract_env_vars(process.path) } else { process.path.to_string() };
   Fingerprint::new(FingerprintKind::FullPath, MatchOperator::Equals, path)
}

/// Profile for a process no profile matched. A profile already carrying an equal fingerprint is reused.
pub fn create_default_profile(
   profiles: &[Profile],
   settings: &ApplicationSettings,
   process: &ProcessIdentity<'_>,
) -> DefaultProfile {
   let fingerprint = default_fingerprint(process, settings.application.profile_generate_with_env_vars);

   if let Some(existing) = profiles.iter().find(|profile| profile.fingerprints.contains(&fingerprint)) {
      return DefaultProfile::Existing(existing.clone());
   }

   DefaultProfile::Created(Profile {
      id: new_profile_id(),
      name: process.name.to_string(),
      is_special: false,
      is_auto_generated: true,
      fingerprints: vec![fingerprint],
      network_action: None,
      blocklists: Some(ProfileBlocklists::from_settings(&settings.blocklists)),
   })
}

/// Random version 4 style identifier
pub fn new_profile_id() -> String {
   let high = fastrand::u64(..);
   let low = fastrand::u64(..);
   format!(
      "{:08x}-{:04x}-4{:03x}-{:04x}-{:012x}",
      high >> 32,
      (high >> 16) & 0xffff,
      high & 0x0fff,
      ((low >> 48) & 0x3fff) | 0x8000,
      low & 0xffff_ffff_ffff
   )
}

#[cfg(test)]
mod tests {
   use super::*;

   fn identity<'a>(name: &'a str, path: &'a str) -> ProcessIdentity<'a> {
      ProcessIdentity { name, path, command_line: "" }
   }

   fn profiles() -> Vec<Profile> {
      let mut profiles = vec![
         Profile {
            id: "firefox".to_string(),
            name: "Firefox".to_string(),
            fingerprints: vec![Fingerprint::new(FingerprintKind::FullPath, MatchOperator::Equals, "/usr/lib/firefox/firefox")],
            ..Default::default()
         },
         Profile {
            id: "python".to_string(),
            name: "Python".to_string(),
            fingerprints: vec![Fingerprint::new(FingerprintKind::ProcessName, MatchOperator::StartsWith, "python")],
            ..Default::default()
         },
      ];
      ensure_special_profiles(&mut profiles);
      profiles
   }

   #[test]
   fn special_names_win_before_fingerprints() {
      let mut profiles = profiles();
      profiles.insert(
         0,
         Profile {
            id: "greedy".to_string(),
            fingerprints: vec![Fingerprint::new(FingerprintKind::ProcessName, MatchOperator::Contains, "")],
            ..Default::default()
         },
      );

      let system = match_process(&profiles, &identity("IDLE", "")).unwrap();
      assert_eq!(system.id, crate::statics::PROFILE_ID_SYSTEM);
      let unknown = match_process(&profiles, &identity("UNKNOWN", "")).unwrap();
      assert_eq!(unknown.id, crate::statics::PROFILE_ID_UNKNOWN);
   }

   #[test]
   fn first_profile_with_a_matching_fingerprint() {
      let profiles = profiles();
      assert_eq!(match_process(&profiles, &identity("firefox", "/USR/lib/firefox/firefox")).unwrap().id, "firefox");
      assert_eq!(match_process(&profiles, &identity("python3.11", "/usr/bin/python3.11")).unwrap().id, "python");
      assert!(match_process(&profiles, &identity("curl", "/usr/bin/curl")).is_none());
   }

   #[test]
   fn service_and_store_fingerprints() {
      let profiles = profiles();
      let resolved = match_process(&profiles, &identity("SVC:systemd-resolved", "/usr/lib/systemd/systemd-resolved")).unwrap();
      assert_eq!(resolved.id, crate::statics::PROFILE_ID_SYSTEM_DNS);

      let store = Fingerprint::new(FingerprintKind::StoreApp, MatchOperator::Equals, "Calculator");
      assert!(store.matches(&identity("WinStore:Calculator", "")));
      assert!(!store.matches(&identity("Calculator", "")));
   }

   #[test]
   fn wildcard_and_regex_operators() {
      let wildcard = Fingerprint::new(FingerprintKind::FullPath, MatchOperator::Wildcard, "/opt/*/bin/tool");
      assert!(wildcard.matches(&identity("tool", "/opt/acme/bin/tool")));
      assert!(!wildcard.matches(&identity("tool", "/opt/acme/nested/bin/tool")));

      let deep = Fingerprint::new(FingerprintKind::FullPath, MatchOperator::Wildcard, "/opt/**/tool");
      assert!(deep.matches(&identity("tool", "/opt/acme/nested/bin/tool")));

      let regex = Fingerprint::new(FingerprintKind::CommandLine, MatchOperator::Regex, r"--profile=\w+");
      assert!(regex.matches(&ProcessIdentity { name: "app", path: "/bin/app", command_line: "app --profile=work" }));

      let broken = Fingerprint::new(FingerprintKind::ProcessName, MatchOperator::Regex, "(unclosed");
      assert!(!broken.matches(&identity("(unclosed", "")));
   }

   #[test]
   fn default_fingerprints() {
      let per_instance = default_fingerprint(&identity("SVC:getty_tty1", ""), false);
      assert_eq!(per_instance, Fingerprint::new(FingerprintKind::Service, MatchOperator::StartsWith, "getty"));

      let plain = default_fingerprint(&identity("SVC:sshd", ""), false);
      assert_eq!(plain, Fingerprint::new(FingerprintKind::Service, MatchOperator::Equals, "sshd"));

      let store = default_fingerprint(&identity("WinStore:Calculator", ""), false);
      assert_eq!(store.kind, FingerprintKind::StoreApp);

      let path = default_fingerprint(&identity("curl", "/usr/bin/curl"), false);
      assert_eq!(path, Fingerprint::new(FingerprintKind::FullPath, MatchOperator::Equals, "/usr/bin/curl"));
   }

   #[test]
   fn existing_profile_is_reused() {
      let profiles = profiles();
      let settings = ApplicationSettings::default();

      let existing = create_default_profile(&profiles, &settings, &identity("firefox", "/usr/lib/firefox/firefox"));
      assert!(matches!(existing, DefaultProfile::Existing(ref profile) if profile.id == "firefox"));

      let created = create_default_profile(&profiles, &settings, &identity("curl", "/usr/bin/curl"));
      let DefaultProfile::Created(profile) = created else {
         panic!("expected a new profile");
      };
      assert_eq!(profile.name, "curl");
      assert!(profile.is_auto_generated);
      assert_eq!(profile.id.len(), 36);
      assert_eq!(
         profile.blocklists.unwrap().online_blocklists.len(),
         settings.blocklists.online_blocklists.len()
      );
   }

   #[test]
   fn path_fingerprints_compare_with_env_vars_expanded() {
      let Ok(home) = std::env::var("HOME") else {
         return;
      };
      let contracted = Fingerprint::new(FingerprintKind::FullPath, MatchOperator::Equals, "$HOME/bin/tool");
      let expanded = Fingerprint::new(FingerprintKind::FullPath, MatchOperator::Equals, format!("{home}/bin/tool"));
      assert_eq!(contracted, expanded);
   }

   #[test]
   fn generated_home_fingerprint_matches_its_process() {
      let Ok(home) = std::env::var("HOME") else {
         return;
      };
      if home.trim_end_matches('/').is_empty() || home.ends_with('/') {
         return;
      }
      let path = format!("{home}/bin/tool");
      let process = identity("tool", &path);

      let fingerprint = default_fingerprint(&process, true);
      assert!(fingerprint.matches(&process));

      let mut profiles = profiles();
      profiles.insert(0, Profile { id: "generated".to_string(), fingerprints: vec![fingerprint], ..Default::default() });
      profiles.push(Profile {
         id: "later".to_string(),
         fingerprints: vec![Fingerprint::new(FingerprintKind::ProcessName, MatchOperator::Equals, "tool")],
         ..Default::default()
      });
      assert_eq!(match_process(&profiles, &process).unwrap().id, "generated");

      let prefix = Fingerprint::new(FingerprintKind::FullPath, MatchOperator::StartsWith, "$HOME/bin/");
      assert!(prefix.matches(&process));
   }

   #[test]
   fn overrides_fall_back_to_global() {
      let profiles = profiles();
      let global = NetworkActionSettings::default();

      let self_profile = profiles.iter().find(|profile| profile.id == crate::statics::PROFILE_ID_SELF).unwrap();
      let effective = self_profile.effective_network_action(&global);
      assert!(!effective.block_bypass_dns);
      assert!(!effective.force_block_incoming);

      let unknown = profiles.iter().find(|profile| profile.id == crate::statics::PROFILE_ID_UNKNOWN).unwrap();
      assert_eq!(unknown.effective_network_action(&global), global);
   }

   #[test]
   fn special_profiles_are_added_once() {
      let mut profiles = Vec::new();
      assert!(ensure_special_profiles(&mut profiles));
      assert_eq!(profiles.len(), 4);
      assert!(!ensure_special_profiles(&mut profiles));
      assert_eq!(profiles.len(), 4);
   }
}
