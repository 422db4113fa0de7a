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

//! The decision pipeline. Checks run in a fixed order and the first one that decides wins:
//! incoming loopback, DNS traffic, force-block flags, DNS bypass, IP blocklists, rules, then the default action.

use crate::connection::{Connection, Direction, Verdict};
use crate::net::Scope;
use crate::profiles::Profile;
use crate::rules::{Rule, RuleAction};
use crate::settings::{ApplicationSettings, DefaultAction};

/// Everything besides the connection and its profile that a decision depends on
pub struct VerdictContext<'a> {
   pub settings: &'a ApplicationSettings,
   pub blocklists: &'a crate::blocklist::BlocklistManager,
   /// DNS servers of the local network adapters
   pub adapter_dns: &'a [std::net::IpAddr],
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decision {
   pub verdict: Verdict,
   pub reason: String,
   /// Decided by the DNS branch, kept apart from other connections
   pub dns: bool,
}

impl Decision {
   fn new(verdict: Verdict, reason: impl Into<String>) -> Self {
      Self { verdict, reason: reason.into(), dns: false }
   }

   fn dns(verdict: Verdict, reason: impl Into<String>) -> Self {
      Self { verdict, reason: reason.into(), dns: true }
   }
}

pub fn decide(connection: &Connection, profile: &Profile, context: &VerdictContext<'_>) -> Decision {
   let settings = context.settings;
   let action = profile.effective_network_action(&settings.network_action);

   if connection.direction == Direction::Inbound && connection.remote_scope == Scope::Loopback {
      return Decision::new(Verdict::PermanentAccept, "Loopback");
   }

   if connection.is_dns {
      if profile.id == crate::statics::PROFILE_ID_SELF {
         return Decision::dns(Verdict::PermanentAccept, "AllowOwnDNS");
      }
      if settings.dns_server.is_enabled {
         return Decision::dns(Verdict::RerouteToNameserver, "RedirectDNS");
      }
      if action.block_bypass_dns {
         let remote = connection.remote_ip.to_canonical();
         return if context.adapter_dns.iter().any(|server| server.to_canonical() == remote) {
            Decision::dns(Verdict::PermanentAccept, "AllowNetworkAdapterDNS")
         } else {
            Decision::dns(Verdict::PermanentBlock, "BlockNetworkAdapterDNSBypass")
         };
      }
      return Decision::dns(Verdict::PermanentAccept, "AllowExternalDNS");
   }

   let either_scope = |predicate: fn(Scope) -> bool| predicate(connection.local_scope) || predicate(connection.remote_scope);

   if action.force_block_incoming && connection.direction == Direction::Inbound {
      return Decision::new(Verdict::PermanentBlock, "ForceBlockIncoming");
   }
   if action.force_block_localhost && either_scope(|scope| scope == Scope::Loopback) {
      return Decision::new(Verdict::PermanentBlock, "ForceBlockLocalhost");
   }
   if action.force_block_lan && either_scope(|scope| matches!(scope, Scope::LocalMulticast | Scope::Lan)) {
      return Decision::new(Verdict::PermanentBlock, "ForceBlockLAN");
   }
   if action.force_block_internet && either_scope(|scope| scope == Scope::Internet) {
      return Decision::new(Verdict::PermanentBlock, "ForceBlockInternet");
   }

   if action.block_bypass_dns {
      if context.blocklists.is_dns_ip(&connection.remote_ip.to_canonical()) {
         return Decision::new(Verdict::PermanentBlock, "SecureDNSBypass");
      }
      if connection.remote_port == crate::statics::DOT_PORT {
         return Decision::new(Verdict::PermanentBlock, "SecureDNSBypassDOT");
      }
   }

   let enabled = crate::blocklist::enabled_blocklist_names(&settings.blocklists, profile.blocklists.as_ref());
   if let Some(list) = context.blocklists.match_ip(&connection.remote_ip.to_canonical(), &enabled) {
      return Decision::new(Verdict::PermanentBlock, format!("IPBlocklist({})", list.name));
   }

   let rules = match connection.direction {
      Direction::Inbound => &action.incoming_rules,
      Direction::Outbound => &action.outgoing_rules,
   };
   // rule text is parsed on every decision, so edits apply without any invalidation
   for source in rules.iter().filter(|source| !source.trim().is_empty()) {
      let rule = match Rule::parse(source) {
         Ok(rule) => rule,
         Err(err) => {
            tracing::debug!("Skipping rule: {}", err);
            continue;
         }
      };
      if rule.matches(connection) {
         let verdict = match rule.action {
            RuleAction::Block => Verdict::PermanentBlock,
            RuleAction::Allow => Verdict::PermanentAccept,
            RuleAction::Prompt => Verdict::Undecided,
         };
         return Decision::new(verdict, format!("Rule({})", rule.source));
      }
   }

   match action.default_network_action {
      DefaultAction::Block => Decision::new(Verdict::PermanentBlock, "DefaultBlock"),
      DefaultAction::Allow => Decision::new(Verdict::PermanentAccept, "DefaultAllow"),
      DefaultAction::Prompt => Decision::new(Verdict::Undecided, "DefaultPrompt"),
   }
}
