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

pub const PROJECT_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub static ARGS: once_cell::sync::Lazy<crate::args::Args> = once_cell::sync::Lazy::new(clap::Parser::parse);

/// Resolvers written into a fresh settings file
pub const DEFAULT_RESOLVERS: [&str; 13] = [
   "dns://100.64.0.7?name=MULLVAD1",
   "dns://10.64.0.1?name=MULLVAD2",
   "doh://94.140.14.14?domain=dns.adguard.com&blockedIf=zeroip&name=Adguard1",
   "dot://[2a10:50c0::ad1:ff]?domain=dns.adguard.com&blockedIf=zeroip&name=Adguard2",
   "doh://194.242.2.9?domain=all.dns.mullvad.net&blockedIf=empty&name=Mullvad1",
   "dot://[2a07:e340::9]?domain=all.dns.mullvad.net&blockedIf=empty&name=Mullvad2",
   "doh://1.1.1.1?domain=cloudflare-dns.com&blockedIf=zeroip&name=Cloudflare1",
   "dot://1.1.1.1?domain=cloudflare-dns.com&blockedIf=zeroip&name=Cloudflare2",
   "dns://1.1.1.1?blockedIf=zeroip&name=Cloudflare3",
   "doh://9.9.9.9?domain=dns.quad9.net&blockedIf=empty&name=Quad9-1",
   "dot://9.9.9.9?domain=dns.quad9.net&blockedIf=empty&name=Quad9-2",
   "dns://9.9.9.9?blockedIf=empty&name=Quad9-3",
   "dns://8.8.8.8?name=Google",
];

// Special profiles, always present
pub const PROFILE_ID_SELF: &str = "00000000-0000-0000-0000-000000000001";
pub const PROFILE_ID_SYSTEM_DNS: &str = "00000000-0000-0000-0000-000000000002";
pub const PROFILE_ID_SYSTEM: &str = "00000000-0000-0000-0000-000000000003";
pub const PROFILE_ID_UNKNOWN: &str = "00000000-0000-0000-0000-000000000004";

/// Bounded caches (process info, network table history)
pub const MAX_CACHE_SIZE: usize = 1024;

/// Longest CNAME chain followed before the partial answer is returned
pub const MAX_CNAME_CHAIN: usize = 10;

/// False positive rate every blocklist Bloom filter is sized for
pub const BLOCKLIST_FALSE_POSITIVE_RATE: f64 = 0.0001;

/// Responses kept in the DNS response history
pub const RESPONSE_STORE_CAPACITY: usize = 1000;

/// Fixed pause between two attempts against the same resolver
pub const RESOLVER_RETRY_DELAY_MS: u64 = 1000;

pub const DNS_PORT: u16 = 53;
pub const DOT_PORT: u16 = 853;

/// Public resolver addresses, used to spot applications talking to their own resolver
pub const BUILTIN_DNS_IP: [&str; 28] = [
   "1.1.1.1",
   "1.0.0.1",
   "2606:4700:4700::1111",
   "2606:4700:4700::1001",
   "8.8.8.8",
   "8.8.4.4",
   "2001:4860:4860::8888",
   "2001:4860:4860::8844",
   "9.9.9.9",
   "149.112.112.112",
   "2620:fe::fe",
   "2620:fe::9",
   "94.140.14.14",
   "94.140.15.15",
   "2a10:50c0::ad1:ff",
   "2a10:50c0::ad2:ff",
   "194.242.2.2",
   "194.242.2.9",
   "2a07:e340::2",
   "2a07:e340::9",
   "208.67.222.222",
   "208.67.220.220",
   "185.228.168.9",
   "185.228.169.9",
   "76.76.2.0",
   "76.76.10.0",
   "45.90.28.0",
   "45.90.30.0",
];

/// DoH / DoT provider host names
pub const BUILTIN_DNS_DOMAINS: [&str; 16] = [
   "cloudflare-dns.com",
   "mozilla.cloudflare-dns.com",
   "one.one.one.one",
   "dns.google",
   "dns.google.com",
   "dns.quad9.net",
   "dns9.quad9.net",
   "dns.adguard.com",
   "dns.adguard-dns.com",
   "dns.mullvad.net",
   "all.dns.mullvad.net",
   "doh.opendns.com",
   "dns.nextdns.io",
   "doh.cleanbrowsing.org",
   "dns.controld.com",
   "doh.dns.sb",
];
