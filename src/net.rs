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

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Coarse network location of an address
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
   Loopback = 0,
   LocalMulticast = 1,
   Lan = 2,
   Internet = 3,
}

impl std::fmt::Display for Scope {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      let name = match self {
         Scope::Loopback => "Localhost",
         Scope::LocalMulticast => "Multicast",
         Scope::Lan => "LAN",
         Scope::Internet => "Internet",
      };
      f.write_str(name)
   }
}

pub fn scope_of(ip: &IpAddr) -> Scope {
   let ip = ip.to_canonical();
   if ip.is_loopback() {
      return Scope::Loopback;
   }

   match ip {
      IpAddr::V4(v4) => {
         if v4.is_link_local() || is_private_v4(&v4) {
            return Scope::Lan;
         }
      }
      IpAddr::V6(v6) => {
         if is_link_local_v6(&v6) || is_unique_local_v6(&v6) {
            return Scope::Lan;
         }
      }
   }

   if is_multicast(&ip) {
      return if is_local_multicast(&ip) { Scope::LocalMulticast } else { Scope::Internet };
   }

   Scope::Internet
}

#[inline]
fn is_private_v4(ip: &Ipv4Addr) -> bool {
   let octets = ip.octets();
   octets[0] == 10 || (octets[0] == 172 && (16..=31).contains(&octets[1])) || (octets[0] == 192 && octets[1] == 168)
}

#[inline]
fn is_link_local_v6(ip: &Ipv6Addr) -> bool {
   ip.segments()[0] & 0xffc0 == 0xfe80
}

#[inline]
fn is_unique_local_v6(ip: &Ipv6Addr) -> bool {
   ip.segments()[0] & 0xfe00 == 0xfc00
}

#[inline]
pub fn is_multicast(ip: &IpAddr) -> bool {
   ip.to_canonical().is_multicast()
}

// 224.0.0.0/24 and 239.0.0.0/8, or interface/link/site-local IPv6 scopes
fn is_local_multicast(ip: &IpAddr) -> bool {
   match ip {
      IpAddr::V4(v4) => {
         let octets = v4.octets();
         (octets[0] == 224 && octets[1] == 0 && octets[2] == 0) || octets[0] == 239
      }
      IpAddr::V6(v6) => {
         let octets = v6.octets();
         octets[0] == 0xff && matches!(octets[1], 0x01 | 0x02 | 0x05)
      }
   }
}

/// Limited broadcast, or the `.255` host of a private IPv4 network
pub fn is_broadcast(ip: &IpAddr) -> bool {
   match ip.to_canonical() {
      IpAddr::V4(v4) => v4.is_broadcast() || (is_private_v4(&v4) && v4.octets()[3] == 255),
      IpAddr::V6(_) => false,
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   fn scope(ip: &str) -> Scope {
      scope_of(&ip.parse().unwrap())
   }

   #[test]
   fn scopes() {
      assert_eq!(scope("127.0.0.1"), Scope::Loopback);
      assert_eq!(scope("::1"), Scope::Loopback);
      assert_eq!(scope("10.1.2.3"), Scope::Lan);
      assert_eq!(scope("172.20.0.1"), Scope::Lan);
      assert_eq!(scope("172.32.0.1"), Scope::Internet);
      assert_eq!(scope("192.168.1.10"), Scope::Lan);
      assert_eq!(scope("169.254.3.4"), Scope::Lan);
      assert_eq!(scope("fe80::1"), Scope::Lan);
      assert_eq!(scope("fd00::1"), Scope::Lan);
      assert_eq!(scope("224.0.0.251"), Scope::LocalMulticast);
      assert_eq!(scope("239.255.255.250"), Scope::LocalMulticast);
      assert_eq!(scope("ff02::fb"), Scope::LocalMulticast);
      assert_eq!(scope("233.1.1.1"), Scope::Internet);
      assert_eq!(scope("1.1.1.1"), Scope::Internet);
      assert_eq!(scope("2606:4700::1111"), Scope::Internet);
   }

   #[test]
   fn mapped_addresses_use_their_v4_scope() {
      assert_eq!(scope("::ffff:127.0.0.1"), Scope::Loopback);
      assert_eq!(scope("::ffff:192.168.0.1"), Scope::Lan);
   }

   #[test]
   fn broadcast() {
      assert!(is_broadcast(&"255.255.255.255".parse().unwrap()));
      assert!(is_broadcast(&"192.168.1.255".parse().unwrap()));
      assert!(!is_broadcast(&"8.8.8.255".parse().unwrap()));
      assert!(!is_broadcast(&"192.168.1.1".parse().unwrap()));
   }

   #[test]
   fn scope_codes() {
      assert_eq!(Scope::Loopback as u8, 0);
      assert_eq!(Scope::Internet as u8, 3);
      assert_eq!(Scope::LocalMulticast.to_string(), "Multicast");
   }
}
