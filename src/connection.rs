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

pub const PROTOCOL_ICMP: u8 = 1;
pub const PROTOCOL_TCP: u8 = 6;
pub const PROTOCOL_UDP: u8 = 17;
pub const PROTOCOL_ICMPV6: u8 = 58;

/// IANA protocol numbers the firewall knows by name
const PROTOCOL_NAMES: [(u8, &str); 13] = [
   (0, "HOPOPT"),
   (1, "ICMP"),
   (2, "IGMP"),
   (4, "IPv4"),
   (6, "TCP"),
   (17, "UDP"),
   (27, "RDP"),
   (33, "DCCP"),
   (41, "IPv6"),
   (44, "IPv6-Frag"),
   (58, "ICMPv6"),
   (98, "EncapsulationHeader"),
   (136, "UDPLite"),
];

pub fn protocol_to_string(protocol: u8) -> String {
   match PROTOCOL_NAMES.iter().find(|(number, _)| *number == protocol) {
      Some((_, name)) => name.to_string(),
      None => format!("UnknownProtocol({protocol})"),
   }
}

/// Case-insensitive protocol name lookup
pub fn protocol_from_name(name: &str) -> Option<u8> {
   PROTOCOL_NAMES.iter().find(|(_, known)| known.eq_ignore_ascii_case(name)).map(|(number, _)| *number)
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
   Outbound = 0,
   Inbound = 1,
}

impl TryFrom<u8> for Direction {
   type Error = crate::error::Error;

   fn try_from(value: u8) -> crate::error::Result<Self> {
      match value {
         0 => Ok(Direction::Outbound),
         1 => Ok(Direction::Inbound),
         _ => Err(crate::error::Error::MalformedFrame(format!("unknown direction {value}"))),
      }
   }
}

impl std::fmt::Display for Direction {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      match self {
         Direction::Outbound => f.write_str("OUT"),
         Direction::Inbound => f.write_str("IN"),
      }
   }
}

/// Decision code understood by the driver
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Verdict {
   #[default]
   Undecided = 0,
   Undeterminable = 1,
   Accept = 2,
   PermanentAccept = 3,
   Block = 4,
   PermanentBlock = 5,
   Drop = 6,
   PermanentDrop = 7,
   RerouteToNameserver = 8,
   RerouteToTunnel = 9,
   Failed = 10,
}

impl Verdict {
   /// `ALLOW`, `BLOCK`, `REDIRECT` or `PROMPT`
   pub fn as_verdict_string(self) -> &'static str {
      match self {
         Verdict::Accept | Verdict::PermanentAccept => "ALLOW",
         Verdict::Block | Verdict::PermanentBlock | Verdict::Drop | Verdict::PermanentDrop => "BLOCK",
         Verdict::RerouteToNameserver | Verdict::RerouteToTunnel => "REDIRECT",
         Verdict::Undecided | Verdict::Undeterminable | Verdict::Failed => "PROMPT",
      }
   }
}

impl TryFrom<u8> for Verdict {
   type Error = crate::error::Error;

   fn try_from(value: u8) -> crate::error::Result<Self> {
      let verdict = match value {
         0 => Verdict::Undecided,
         1 => Verdict::Undeterminable,
         2 => Verdict::Accept,
         3 => Verdict::PermanentAccept,
         4 => Verdict::Block,
         5 => Verdict::PermanentBlock,
         6 => Verdict::Drop,
         7 => Verdict::PermanentDrop,
         8 => Verdict::RerouteToNameserver,
         9 => Verdict::RerouteToTunnel,
         10 => Verdict::Failed,
         _ => return Err(crate::error::Error::MalformedFrame(format!("unknown verdict {value}"))),
      };
      Ok(verdict)
   }
}

/// Plain DNS query towards a nameserver
#[inline]
pub fn is_dns_traffic(protocol: u8, remote_port: u16) -> bool {
   protocol == PROTOCOL_UDP && remote_port == crate::statics::DNS_PORT
}

/// `"{protocol}-{direction}_{localIP}:{localPort}-{remoteIP}:{remotePort}"`
pub fn connection_id(
   protocol: u8,
   direction: Direction,
   local_ip: &IpAddr,
   local_port: u16,
   remote_ip: &IpAddr,
   remote_port: u16,
) -> String {
   format!("{}-{}_{}:{}-{}:{}", protocol, direction as u8, local_ip, local_port, remote_ip, remote_port)
}

/// Direction-less tuple key joining bandwidth counters to connections
pub fn tuple_key(protocol: u8, local_ip: &IpAddr, local_port: u16, remote_ip: &IpAddr, remote_port: u16) -> u64 {
   let mut bytes: Vec<u8> = Vec::with_capacity(37);
   bytes.push(protocol);
   for ip in [local_ip, remote_ip] {
      match ip {
         IpAddr::V4(v4) => bytes.extend_from_slice(&v4.octets()),
         IpAddr::V6(v6) => bytes.extend_from_slice(&v6.octets()),
      }
   }
   bytes.extend_from_slice(&local_port.to_le_bytes());
   bytes.extend_from_slice(&remote_port.to_le_bytes());
   crate::util::hash64(&bytes)
}

/// New connection reported by the driver
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionEvent {
   pub id: u64,
   pub pid: u64,
   pub direction: Direction,
   pub protocol: u8,
   pub local_ip: IpAddr,
   pub remote_ip: IpAddr,
   pub local_port: u16,
   pub remote_port: u16,
   pub payload_layer: u8,
   pub payload_size: u32,
   pub payload: Vec<u8>,
}

impl std::fmt::Display for ConnectionEvent {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      write!(
         f,
         "{}:{} - {}:{} {} {} {}",
         self.local_ip,
         self.local_port,
         self.remote_ip,
         self.remote_port,
         protocol_to_string(self.protocol),
         self.direction,
         self.pid
      )?;
      if self.payload_size > 0 {
         write!(f, " | PS:{} Layer:{}", self.payload_size, self.payload_layer)?;
      }
      Ok(())
   }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionEndEvent {
   pub pid: u64,
   pub direction: Direction,
   pub protocol: u8,
   pub local_ip: IpAddr,
   pub remote_ip: IpAddr,
   pub local_port: u16,
   pub remote_port: u16,
}

impl ConnectionEndEvent {
   #[inline]
   pub fn connection_id(&self) -> String {
      connection_id(self.protocol, self.direction, &self.local_ip, self.local_port, &self.remote_ip, self.remote_port)
   }
}

impl std::fmt::Display for ConnectionEndEvent {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      write!(
         f,
         "{}:{} - {}:{} {} {} {}",
         self.local_ip,
         self.local_port,
         self.remote_ip,
         self.remote_port,
         protocol_to_string(self.protocol),
         self.direction,
         self.pid
      )
   }
}

/// Cumulative byte counters for one tuple
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BandwidthStat {
   pub protocol: u8,
   pub local_ip: IpAddr,
   pub local_port: u16,
   pub remote_ip: IpAddr,
   pub remote_port: u16,
   pub transmitted: u64,
   pub received: u64,
}

impl BandwidthStat {
   #[inline]
   pub fn tuple_key(&self) -> u64 {
      tuple_key(self.protocol, &self.local_ip, self.local_port, &self.remote_ip, self.remote_port)
   }
}

/// A connection as tracked by the engine, with its verdict and everything known about its process
#[derive(Clone, Debug)]
pub struct Connection {
   pub connection_id: String,
   pub verdict_id: u64,
   pub verdict: Verdict,
   pub verdict_string: String,
   pub verdict_reason: String,

   pub profile_id: String,
   pub profile_name: String,

   pub pid: u64,
   /// PID as reported by the driver, which can lag the connection table
   pub pid_kext: u64,
   pub process_name: String,
   pub process_path: String,
   pub process_command_line: String,

   pub direction: Direction,
   pub protocol: u8,
   pub local_ip: IpAddr,
   pub local_port: u16,
   pub remote_ip: IpAddr,
   pub remote_port: u16,
   pub local_scope: crate::net::Scope,
   pub remote_scope: crate::net::Scope,
   pub ip_version: u8,

   pub start_date: chrono::DateTime<chrono::Utc>,
   pub end_date: Option<chrono::DateTime<chrono::Utc>>,
   pub is_active: bool,
   pub sent_bytes: u64,
   pub received_bytes: u64,

   pub is_dns: bool,
   pub payload_layer: u8,
   pub payload_size: u32,
   pub payload: Vec<u8>,

   pub is_anycast: bool,
   pub country: String,
   pub asn: String,
   pub organization: String,
   pub remote_host: Option<String>,
}

impl Connection {
   pub fn from_event(event: &ConnectionEvent) -> Self {
      Self {
         connection_id: connection_id(
            event.protocol,
            event.direction,
            &event.local_ip,
            event.local_port,
            &event.remote_ip,
            event.remote_port,
         ),
         verdict_id: event.id,
         verdict: Verdict::Undecided,
         verdict_string: String::new(),
         verdict_reason: String::new(),
         profile_id: String::new(),
         profile_name: String::new(),
         pid: event.pid,
         pid_kext: event.pid,
         process_name: String::new(),
         process_path: String::new(),
         process_command_line: String::new(),
         direction: event.direction,
         protocol: event.protocol,
         local_ip: event.local_ip,
         local_port: event.local_port,
         remote_ip: event.remote_ip,
         remote_port: event.remote_port,
         local_scope: crate::net::scope_of(&event.local_ip),
         remote_scope: crate::net::scope_of(&event.remote_ip),
         ip_version: if event.remote_ip.is_ipv4() { 4 } else { 6 },
         start_date: chrono::Utc::now(),
         end_date: None,
         is_active: true,
         sent_bytes: 0,
         received_bytes: 0,
         is_dns: is_dns_traffic(event.protocol, event.remote_port),
         payload_layer: event.payload_layer,
         payload_size: event.payload_size,
         payload: event.payload.clone(),
         is_anycast: false,
         country: String::new(),
         asn: String::new(),
         organization: String::new(),
         remote_host: None,
      }
   }

   pub fn set_verdict(&mut self, verdict: Verdict, reason: impl Into<String>) {
      self.verdict = verdict;
      self.verdict_string = verdict.as_verdict_string().to_string();
      self.verdict_reason = reason.into();
   }

   #[inline]
   pub fn tuple_key(&self) -> u64 {
      tuple_key(self.protocol, &self.local_ip, self.local_port, &self.remote_ip, self.remote_port)
   }

   pub fn mark_ended(&mut self) {
      if self.is_active {
         self.is_active = false;
         self.end_date = Some(chrono::Utc::now());
      }
   }
}

impl std::fmt::Display for Connection {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      write!(
         f,
         "{}:{} - {}:{} {} {} [{}={}]",
         self.local_ip,
         self.local_port,
         self.remote_ip,
         self.remote_port,
         protocol_to_string(self.protocol),
         self.direction,
         self.pid,
         self.process_name
      )?;

      if self.payload_size > 0 {
         write!(f, "|PS:{} PL:{}", self.payload_size, self.payload_layer)?;
      }
      if !self.verdict_string.is_empty() {
         write!(f, "|V:{}:{}", self.verdict_string, self.verdict_reason)?;
      }
      if !self.country.is_empty() {
         write!(f, "|CN:{}", self.country)?;
      }
      if !self.profile_name.is_empty() {
         write!(f, "|ProName:{}", self.profile_name)?;
      }
      Ok(())
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   fn event(id: u64) -> ConnectionEvent {
      ConnectionEvent {
         id,
         pid: 4242,
         direction: Direction::Outbound,
         protocol: PROTOCOL_TCP,
         local_ip: "192.168.1.20".parse().unwrap(),
         remote_ip: "93.184.216.34".parse().unwrap(),
         local_port: 51000,
         remote_port: 443,
         payload_layer: 0,
         payload_size: 0,
         payload: Vec::new(),
      }
   }

   #[test]
   fn connection_id_ignores_event_id() {
      let first = Connection::from_event(&event(1));
      let second = Connection::from_event(&event(99));
      assert_eq!(first.connection_id, second.connection_id);
      assert_eq!(first.connection_id, "6-0_192.168.1.20:51000-93.184.216.34:443");
   }

   #[test]
   fn tuple_key_ignores_direction() {
      let mut inbound = event(1);
      inbound.direction = Direction::Inbound;
      assert_eq!(Connection::from_event(&event(1)).tuple_key(), Connection::from_event(&inbound).tuple_key());
      assert_ne!(Connection::from_event(&event(1)).connection_id, Connection::from_event(&inbound).connection_id);
   }

   #[test]
   fn display() {
      let mut connection = Connection::from_event(&event(1));
      connection.process_name = "curl".to_string();
      connection.profile_name = "curl".to_string();
      connection.set_verdict(Verdict::PermanentAccept, "DefaultAllow");
      assert_eq!(
         connection.to_string(),
         "192.168.1.20:51000 - 93.184.216.34:443 TCP OUT [4242=curl]|V:ALLOW:DefaultAllow|ProName:curl"
      );
   }

   #[test]
   fn verdict_codes() {
      assert_eq!(Verdict::try_from(8).unwrap(), Verdict::RerouteToNameserver);
      assert_eq!(Verdict::Failed as u8, 10);
      assert!(Verdict::try_from(11).is_err());
      assert!(Direction::try_from(2).is_err());
   }

   #[test]
   fn protocol_names() {
      assert_eq!(protocol_to_string(17), "UDP");
      assert_eq!(protocol_to_string(200), "UnknownProtocol(200)");
      assert_eq!(protocol_from_name("tcp"), Some(6));
      assert_eq!(protocol_from_name("ipv6-frag"), Some(44));
      assert_eq!(protocol_from_name("nope"), None);
   }
}
