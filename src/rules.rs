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

//! Firewall rules: `ACTION [TARGET] [PROTOCOL[/PORT[-PORT]]]`
//!
//! ```text
//! BLOCK
//! ALLOW 192.168.1.1
//! BLOCK 10.0.0.0/8 TCP/443
//! ALLOW LAN UDP/5353
//! PROMPT AS13335 TCP/HTTP-HTTPS
//! BLOCK CN
//! ```

use crate::connection::{Connection, Direction};
use crate::error::{Error, Result};

const COMMON_PORTS: [(&str, u16); 15] = [
   ("HTTP", 80),
   ("HTTPS", 443),
   ("DNS", 53),
   ("FTP", 21),
   ("SSH", 22),
   ("TELNET", 23),
   ("SMTP", 25),
   ("POP3", 110),
   ("IMAP", 143),
   ("RDP", 3389),
   ("SMB", 445),
   ("MYSQL", 3306),
   ("PGSQL", 5432),
   ("MONGODB", 27017),
   ("REDIS", 6379),
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuleAction {
   Block,
   Allow,
   Prompt,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScopeKeyword {
   Localhost,
   Multicast,
   Broadcast,
   Lan,
   Internet,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
   Any,
   Ip(std::net::IpAddr),
   Cidr(ipnetwork::IpNetwork),
   Asn(String),
   Country(String),
   Scope(ScopeKeyword),
   /// Accepted by the parser, never matches a connection
   Domain(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rule {
   pub source: String,
   pub action: RuleAction,
   pub target: Target,
   pub protocol: Option<u8>,
   pub ports: Option<(u16, u16)>,
}

impl std::fmt::Display for Rule {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.write_str(&self.source)
   }
}

impl std::str::FromStr for Rule {
   type Err = Error;

   fn from_str(rule: &str) -> Result<Self> {
      Rule::parse(rule)
   }
}

impl Rule {
   pub fn parse(rule: &str) -> Result<Self> {
      let invalid = |reason: &str| Error::InvalidRule(format!("{rule}: {reason}"));
      let mut parts = rule.split_whitespace();

      let action = match parts.next().map(|action| action.to_ascii_uppercase()).as_deref() {
         Some("BLOCK") => RuleAction::Block,
         Some("ALLOW") => RuleAction::Allow,
         Some("PROMPT") => RuleAction::Prompt,
         Some(_) => return Err(invalid("action must be BLOCK, ALLOW or PROMPT")),
         None => return Err(invalid("empty rule")),
      };

      let target = match parts.next() {
         Some(target) => parse_target(target).map_err(|reason| invalid(reason))?,
         None => Target::Any,
      };

      let (protocol, ports) = match parts.next() {
         Some(protocol_and_ports) => parse_protocol_and_ports(protocol_and_ports).map_err(|reason| invalid(reason))?,
         None => (None, None),
      };

      if parts.next().is_some() {
         return Err(invalid("unexpected text after protocol"));
      }

      Ok(Self { source: rule.trim().to_string(), action, target, protocol, ports })
   }

   pub fn matches(&self, connection: &Connection) -> bool {
      if let Some(protocol) = self.protocol {
         if protocol != connection.protocol {
            return false;
         }
      }

      if let Some((start, end)) = self.ports {
         // multicast answers come back to the sender's port, not a fixed remote one
         let port = if connection.direction == Direction::Outbound && crate::net::is_multicast(&connection.remote_ip) {
            connection.local_port
         } else {
            connection.remote_port
         };
         if port < start || port > end {
            return false;
         }
      }

      match &self.target {
         Target::Any => true,
         Target::Ip(ip) => ip.to_canonical() == connection.remote_ip.to_canonical(),
         Target::Cidr(network) => network.contains(connection.remote_ip.to_canonical()),
         Target::Asn(asn) => asn.eq_ignore_ascii_case(&connection.asn),
         Target::Country(country) => country.eq_ignore_ascii_case(&connection.country),
         Target::Scope(scope) => match scope {
            ScopeKeyword::Localhost => connection.remote_scope == crate::net::Scope::Loopback,
            ScopeKeyword::Multicast => connection.remote_scope == crate::net::Scope::LocalMulticast,
            ScopeKeyword::Broadcast => crate::net::is_broadcast(&connection.remote_ip),
            ScopeKeyword::Lan => connection.remote_scope == crate::net::Scope::Lan,
            ScopeKeyword::Internet => connection.remote_scope == crate::net::Scope::Internet,
         },
         Target::Domain(pattern) => {
            tracing::trace!("Domain rule target {} is not evaluated", pattern);
            false
         }
      }
   }
}

fn parse_target(target: &str) -> std::result::Result<Target, &'static str> {
   if target == "*" {
      return Ok(Target::Any);
   }
   if let Ok(ip) = target.parse::<std::net::IpAddr>() {
      return Ok(Target::Ip(ip));
   }
   if target.contains('/') {
      return target.parse::<ipnetwork::IpNetwork>().map(Target::Cidr).map_err(|_| "invalid CIDR target");
   }

   let upper = target.to_ascii_uppercase();
   if let Some(number) = upper.strip_prefix("AS") {
      if !number.is_empty() && number.bytes().all(|b| b.is_ascii_digit()) {
         return Ok(Target::Asn(upper));
      }
   }

   let scope = match upper.as_str() {
      "LOCALHOST" => Some(ScopeKeyword::Localhost),
      "MULTICAST" => Some(ScopeKeyword::Multicast),
      "BROADCAST" => Some(ScopeKeyword::Broadcast),
      "LAN" => Some(ScopeKeyword::Lan),
      "INTERNET" => Some(ScopeKeyword::Internet),
      _ => None,
   };
   if let Some(scope) = scope {
      return Ok(Target::Scope(scope));
   }

   if upper.len() == 2 && upper.bytes().all(|b| b.is_ascii_alphabetic()) {
      return Ok(Target::Country(upper));
   }

   Ok(Target::Domain(target.to_lowercase()))
}

type ProtocolAndPorts = (Option<u8>, Option<(u16, u16)>);

fn parse_protocol_and_ports(text: &str) -> std::result::Result<ProtocolAndPorts, &'static str> {
   let (protocol, ports) = match text.split_once('/') {
      Some((protocol, ports)) => (protocol, Some(ports)),
      None => (text, None),
   };

   let protocol = match protocol {
      "*" => None,
      name => match crate::connection::protocol_from_name(name) {
         Some(number) => Some(number),
         None => Some(name.parse::<u8>().map_err(|_| "invalid protocol")?),
      },
   };

   let ports = match ports {
      None => None,
      Some(ports) => match ports.split_once('-') {
         Some((start, end)) => {
            let (start, end) = (parse_port(start)?, parse_port(end)?);
            if start > end {
               return Err("port range start is after its end");
            }
            Some((start, end))
         }
         None => {
            let port = parse_port(ports)?;
            Some((port, port))
         }
      },
   };

   Ok((protocol, ports))
}

fn parse_port(port: &str) -> std::result::Result<u16, &'static str> {
   match COMMON_PORTS.iter().find(|(name, _)| name.eq_ignore_ascii_case(port)) {
      Some((_, number)) => Ok(*number),
      None => port.parse::<u16>().map_err(|_| "invalid port"),
   }
}

/// Parses a configured rule list, skipping (and logging) rules that do not parse
pub fn parse_rules(rules: &[String]) -> Vec<Rule> {
   rules
      .iter()
      .filter(|rule| !rule.trim().is_empty())
      .filter_map(|rule| match Rule::parse(rule) {
         Ok(rule) => Some(rule),
         Err(err) => {
            tracing::warn!("Skipping rule: {}", err);
            None
         }
      })
      .collect()
}

/// First rule matching `connection`, in list order
pub fn first_match<'a>(rules: &'a [Rule], connection: &Connection) -> Option<&'a Rule> {
   rules.iter().find(|rule| rule.matches(connection))
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::connection::{ConnectionEvent, PROTOCOL_TCP, PROTOCOL_UDP};

   fn connection(protocol: u8, direction: Direction, local: &str, remote: &str) -> Connection {
      let split = |endpoint: &str| -> (std::net::IpAddr, u16) {
         let (ip, port) = endpoint.rsplit_once(':').unwrap();
         (ip.trim_start_matches('[').trim_end_matches(']').parse().unwrap(), port.parse().unwrap())
      };
      let (local_ip, local_port) = split(local);
      let (remote_ip, remote_port) = split(remote);
      Connection::from_event(&ConnectionEvent {
         id: 1,
         pid: 100,
         direction,
         protocol,
         local_ip,
         remote_ip,
         local_port,
         remote_port,
         payload_layer: 0,
         payload_size: 0,
         payload: Vec::new(),
      })
   }

   #[test]
   fn cidr_with_protocol_and_port() {
      let rule = Rule::parse("BLOCK 10.0.0.0/8 TCP/443").unwrap();
      assert_eq!(rule.action, RuleAction::Block);
      assert!(rule.matches(&connection(PROTOCOL_TCP, Direction::Outbound, "192.168.1.2:50000", "10.1.2.3:443")));
      assert!(!rule.matches(&connection(PROTOCOL_TCP, Direction::Outbound, "192.168.1.2:50000", "10.1.2.3:80")));
      assert!(!rule.matches(&connection(PROTOCOL_UDP, Direction::Outbound, "192.168.1.2:50000", "10.1.2.3:443")));
      assert!(!rule.matches(&connection(PROTOCOL_TCP, Direction::Outbound, "192.168.1.2:50000", "11.1.2.3:443")));
   }

   #[test]
   fn action_only_matches_everything() {
      let rule = Rule::parse("allow").unwrap();
      assert_eq!(rule.action, RuleAction::Allow);
      assert_eq!(rule.target, Target::Any);
      assert!(rule.matches(&connection(PROTOCOL_UDP, Direction::Inbound, "192.168.1.2:5353", "8.8.8.8:53")));
   }

   #[test]
   fn named_port_range() {
      let rule = Rule::parse("PROMPT * TCP/HTTP-HTTPS").unwrap();
      assert_eq!(rule.ports, Some((80, 443)));
      assert!(rule.matches(&connection(PROTOCOL_TCP, Direction::Outbound, "192.168.1.2:50000", "1.1.1.1:400")));
      assert!(!rule.matches(&connection(PROTOCOL_TCP, Direction::Outbound, "192.168.1.2:50000", "1.1.1.1:8080")));
   }

   #[test]
   fn outbound_multicast_checks_the_local_port() {
      let rule = Rule::parse("ALLOW MULTICAST UDP/5353").unwrap();
      let mdns = connection(PROTOCOL_UDP, Direction::Outbound, "192.168.1.2:5353", "224.0.0.251:40000");
      assert!(rule.matches(&mdns));

      let inbound = connection(PROTOCOL_UDP, Direction::Inbound, "192.168.1.2:40000", "224.0.0.251:5353");
      assert!(rule.matches(&inbound));
   }

   #[test]
   fn scope_country_and_asn_targets() {
      let mut remote = connection(PROTOCOL_TCP, Direction::Outbound, "192.168.1.2:50000", "1.1.1.1:443");
      remote.country = "AU".to_string();
      remote.asn = "AS13335".to_string();

      assert!(Rule::parse("BLOCK INTERNET").unwrap().matches(&remote));
      assert!(!Rule::parse("BLOCK LAN").unwrap().matches(&remote));
      assert!(Rule::parse("BLOCK au").unwrap().matches(&remote));
      assert!(Rule::parse("BLOCK as13335").unwrap().matches(&remote));
      assert!(!Rule::parse("BLOCK AS15169").unwrap().matches(&remote));

      let broadcast = connection(PROTOCOL_UDP, Direction::Outbound, "192.168.1.2:68", "255.255.255.255:67");
      assert!(Rule::parse("ALLOW BROADCAST UDP").unwrap().matches(&broadcast));
   }

   #[test]
   fn domain_targets_parse_but_never_match() {
      let rule = Rule::parse("BLOCK *.example.com").unwrap();
      assert_eq!(rule.target, Target::Domain("*.example.com".to_string()));
      assert!(!rule.matches(&connection(PROTOCOL_TCP, Direction::Outbound, "192.168.1.2:50000", "93.184.216.34:443")));

      assert!(matches!(Rule::parse("ALLOW ask.com").unwrap().target, Target::Domain(_)));
   }

   #[test]
   fn ipv6_targets() {
      let rule = Rule::parse("BLOCK 2001:db8::/32 *").unwrap();
      assert!(rule.matches(&connection(PROTOCOL_TCP, Direction::Outbound, "[::1]:1", "[2001:db8::5]:443")));
   }

   #[test]
   fn invalid_rules() {
      assert!(Rule::parse("").is_err());
      assert!(Rule::parse("DENY 1.1.1.1").is_err());
      assert!(Rule::parse("BLOCK 10.0.0.0/33").is_err());
      assert!(Rule::parse("BLOCK * NOTAPROTO").is_err());
      assert!(Rule::parse("BLOCK * TCP/99999").is_err());
      assert!(Rule::parse("BLOCK * TCP/443-80").is_err());
      assert!(Rule::parse("BLOCK * TCP/443 extra").is_err());

      let parsed = parse_rules(&["BLOCK 1.1.1.1".to_string(), "nonsense".to_string(), String::new()]);
      assert_eq!(parsed.len(), 1);
   }

   #[test]
   fn first_matching_rule_wins() {
      let rules = parse_rules(&["ALLOW 1.1.1.1 TCP/443".to_string(), "BLOCK INTERNET".to_string()]);
      let https = connection(PROTOCOL_TCP, Direction::Outbound, "192.168.1.2:50000", "1.1.1.1:443");
      let http = connection(PROTOCOL_TCP, Direction::Outbound, "192.168.1.2:50000", "1.1.1.1:80");
      assert_eq!(first_match(&rules, &https).unwrap().action, RuleAction::Allow);
      assert_eq!(first_match(&rules, &http).unwrap().action, RuleAction::Block);
   }
}
