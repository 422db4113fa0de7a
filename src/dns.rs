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

// ref: https://datatracker.ietf.org/doc/html/rfc1035#section-4.1

use crate::error::{Error, Result};

pub const HEADER_LEN: usize = 12;

pub const TYPE_A: u16 = 1;
pub const TYPE_NS: u16 = 2;
pub const TYPE_CNAME: u16 = 5;
pub const TYPE_SOA: u16 = 6;
pub const TYPE_PTR: u16 = 12;
pub const TYPE_MX: u16 = 15;
pub const TYPE_TXT: u16 = 16;
pub const TYPE_AAAA: u16 = 28;
pub const TYPE_SRV: u16 = 33;
pub const TYPE_OPT: u16 = 41;
pub const TYPE_SVCB: u16 = 64;
pub const TYPE_HTTPS: u16 = 65;
pub const TYPE_ANY: u16 = 255;
pub const TYPE_CAA: u16 = 257;

pub const CLASS_IN: u16 = 1;

pub const RCODE_NOERROR: u8 = 0;
pub const RCODE_NXDOMAIN: u8 = 3;
pub const RCODE_REFUSED: u8 = 5;

/// Compression pointers followed while reading a single name
const MAX_POINTER_HOPS: usize = 16;

/// Names used for the cached / logged record types, `None` for anything non-standard
pub fn query_type_name(query_type: u16) -> Option<&'static str> {
   Some(match query_type {
      TYPE_A => "A",
      TYPE_NS => "NS",
      TYPE_CNAME => "CNAME",
      TYPE_SOA => "SOA",
      TYPE_PTR => "PTR",
      TYPE_MX => "MX",
      TYPE_TXT => "TXT",
      TYPE_AAAA => "AAAA",
      TYPE_SRV => "SRV",
      TYPE_OPT => "OPT",
      TYPE_SVCB => "SVCB",
      TYPE_HTTPS => "HTTPS",
      TYPE_ANY => "ANY",
      TYPE_CAA => "CAA",
      _ => return None,
   })
}

pub fn query_type_to_string(query_type: u16) -> String {
   match query_type_name(query_type) {
      Some(name) => name.to_string(),
      None => format!("TYPE{query_type}"),
   }
}

#[inline(always)]
fn read_u16(buf: &[u8], offset: usize) -> Result<u16> {
   match buf.get(offset..offset + 2) {
      Some(bytes) => Ok(u16::from_be_bytes([bytes[0], bytes[1]])),
      None => Err(Error::MalformedDns("truncated u16")),
   }
}

#[inline(always)]
fn read_u32(buf: &[u8], offset: usize) -> Result<u32> {
   match buf.get(offset..offset + 4) {
      Some(bytes) => Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
      None => Err(Error::MalformedDns("truncated u32")),
   }
}

/// Reads a possibly compressed name starting at `offset`. Returns the dotted name and the offset just past the
/// name in the original position (pointers count as 2 bytes there).
pub fn read_name(buf: &[u8], offset: usize) -> Result<(String, usize)> {
   let mut labels: Vec<String> = Vec::new();
   let next = read_name_into(buf, offset, &mut labels, 0)?;
   Ok((labels.join("."), next))
}

fn read_name_into(buf: &[u8], mut offset: usize, labels: &mut Vec<String>, hops: usize) -> Result<usize> {
   loop {
      let len = *buf.get(offset).ok_or(Error::MalformedDns("name runs past end of message"))?;

      if len == 0 {
         return Ok(offset + 1);
      }

      if len & 0xC0 == 0xC0 {
         if hops >= MAX_POINTER_HOPS {
            return Err(Error::MalformedDns("compression pointer loop"));
         }
         let pointer = (read_u16(buf, offset)? & 0x3FFF) as usize;
         read_name_into(buf, pointer, labels, hops + 1)?;
         return Ok(offset + 2);
      }

      if len & 0xC0 != 0 {
         return Err(Error::MalformedDns("reserved label type"));
      }

      let start = offset + 1;
      let end = start + len as usize;
      let label = buf.get(start..end).ok_or(Error::MalformedDns("label runs past end of message"))?;
      labels.push(String::from_utf8_lossy(label).into_owned());
      offset = end;
   }
}

/// Encodes a dotted name as length prefixed labels followed by the root label
pub fn encode_domain_name(domain: &str) -> Result<Vec<u8>> {
   let mut encoded = Vec::with_capacity(domain.len() + 2);
   for label in domain.split('.').filter(|label| !label.is_empty()) {
      if label.len() > 63 {
         return Err(Error::MalformedDns("label longer than 63 bytes"));
      }
      encoded.push(label.len() as u8);
      encoded.extend_from_slice(label.as_bytes());
   }
   encoded.push(0);
   Ok(encoded)
}

/// Strips the local-network and reverse-lookup suffixes a name may carry
pub fn clean_domain_name(domain: &str) -> &str {
   const SUFFIXES: [&str; 3] = [".mshome.net", ".in-addr.arpa", ".ip6.arpa"];

   let domain = domain.trim_end_matches('.');
   for suffix in SUFFIXES {
      if domain.len() > suffix.len() && domain.to_ascii_lowercase().ends_with(suffix) {
         return &domain[..domain.len() - suffix.len()];
      }
   }
   domain
}

/// Reverse lookup name for an address, `4.3.2.1.in-addr.arpa` or the nibble form under `ip6.arpa`
pub fn ptr_domain_for_ip(ip: &std::net::IpAddr) -> String {
   match ip {
      std::net::IpAddr::V4(v4) => {
         let [a, b, c, d] = v4.octets();
         format!("{d}.{c}.{b}.{a}.in-addr.arpa")
      }
      std::net::IpAddr::V6(v6) => {
         let mut name = String::with_capacity(72);
         for byte in v6.octets().iter().rev() {
            name.push_str(&format!("{:x}.{:x}.", byte & 0x0F, byte >> 4));
         }
         name.push_str("ip6.arpa");
         name
      }
   }
}

/// A client query as received on the listening socket
#[derive(Clone, Debug)]
pub struct DnsQuery {
   pub id: u16,
   pub flags: u16,
   pub question_count: u16,
   pub domain: String,
   pub query_type: u16,
   pub query_class: u16,
   pub raw: Vec<u8>,
}

impl DnsQuery {
   pub fn parse(buf: &[u8]) -> Result<Self> {
      if buf.len() < HEADER_LEN {
         return Err(Error::MalformedDns("shorter than header"));
      }

      let id = read_u16(buf, 0)?;
      let flags = read_u16(buf, 2)?;
      let question_count = read_u16(buf, 4)?;

      let (domain, query_type, query_class) = if question_count == 0 {
         (String::new(), 0, 0)
      } else {
         let (domain, next) = read_name(buf, HEADER_LEN)?;
         (domain, read_u16(buf, next)?, read_u16(buf, next + 2)?)
      };

      Ok(Self { id, flags, question_count, domain, query_type, query_class, raw: buf.to_vec() })
   }

   #[inline]
   pub fn is_query(&self) -> bool {
      self.flags & 0x8000 == 0
   }
}

/// Validates a raw client query, logging the reason for every rejection
pub fn is_valid_query(buf: &[u8]) -> bool {
   match validate_query(buf) {
      Ok(_) => true,
      Err(err) => {
         tracing::debug!("Invalid DNS query: {}", err);
         false
      }
   }
}

/// Parses and validates a raw client query
pub fn validate_query(buf: &[u8]) -> Result<DnsQuery> {
   if buf.len() < HEADER_LEN {
      return Err(Error::MalformedDns("shorter than header"));
   }

   let flags = read_u16(buf, 2)?;
   if flags & 0x8000 != 0 {
      return Err(Error::MalformedDns("not a query"));
   }
   if (flags >> 11) & 0x0F != 0 {
      return Err(Error::MalformedDns("non-standard opcode"));
   }

   let question_count = read_u16(buf, 4)?;
   if question_count != 1 {
      if question_count > 10 {
         tracing::warn!("Possible DoS: query with {} questions", question_count);
      }
      return Err(Error::MalformedDns("question count is not 1"));
   }

   let query = DnsQuery::parse(buf)?;
   if query.domain.is_empty() {
      return Err(Error::MalformedDns("empty domain"));
   }

   if query_type_name(query.query_type).is_none() {
      tracing::debug!("Non-standard query type {} for {}", query.query_type, query.domain);
   }

   if query.query_class != CLASS_IN {
      return Err(Error::MalformedDns("class is not IN"));
   }

   Ok(query)
}

/// Parsed upstream answer
#[derive(Clone, Debug)]
pub struct DnsResponse {
   pub domain: String,
   pub query_type: u16,
   pub rcode: u8,
   pub answer_count: u16,
   pub authority_count: u16,
   pub additional_count: u16,
   pub ttl: u32,
   pub ipv4: Vec<std::net::Ipv4Addr>,
   pub ipv6: Vec<std::net::Ipv6Addr>,
   pub cnames: Vec<String>,
   pub ptr_records: Vec<String>,
   pub timestamp: std::time::Instant,
   pub resolved_by: String,
   pub resolved_in: std::time::Duration,
   pub blocked: bool,
   pub blocked_by: String,
   pub blocked_reason: String,
}

impl Default for DnsResponse {
   fn default() -> Self {
      Self {
         domain: String::new(),
         query_type: 0,
         rcode: 0,
         answer_count: 0,
         authority_count: 0,
         additional_count: 0,
         ttl: 0,
         ipv4: Vec::new(),
         ipv6: Vec::new(),
         cnames: Vec::new(),
         ptr_records: Vec::new(),
         timestamp: std::time::Instant::now(),
         resolved_by: String::new(),
         resolved_in: std::time::Duration::ZERO,
         blocked: false,
         blocked_by: String::new(),
         blocked_reason: String::new(),
      }
   }
}

impl DnsResponse {
   pub fn parse(buf: &[u8]) -> Result<Self> {
      if buf.len() < HEADER_LEN {
         return Err(Error::MalformedDns("shorter than header"));
      }

      let mut response = DnsResponse {
         rcode: buf[3] & 0x0F,
         answer_count: read_u16(buf, 6)?,
         authority_count: read_u16(buf, 8)?,
         additional_count: read_u16(buf, 10)?,
         ..Default::default()
      };

      let question_count = read_u16(buf, 4)?;
      let mut offset = HEADER_LEN;
      for i in 0..question_count {
         let (name, next) = read_name(buf, offset)?;
         if i == 0 {
            response.domain = name;
            response.query_type = read_u16(buf, next)?;
         }
         offset = next + 4;
      }

      let mut min_ttl: Option<u32> = None;
      for _ in 0..response.answer_count {
         let (_, next) = read_name(buf, offset)?;
         let record_type = read_u16(buf, next)?;
         let ttl = read_u32(buf, next + 4)?;
         let rdlen = read_u16(buf, next + 8)? as usize;
         let rdata_start = next + 10;
         let rdata = buf.get(rdata_start..rdata_start + rdlen).ok_or(Error::MalformedDns("rdata runs past end of message"))?;

         match record_type {
            TYPE_A if rdlen == 4 => response.ipv4.push(std::net::Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3])),
            TYPE_AAAA if rdlen == 16 => {
               let mut octets = [0u8; 16];
               octets.copy_from_slice(rdata);
               response.ipv6.push(std::net::Ipv6Addr::from(octets));
            }
            TYPE_CNAME => response.cnames.push(read_name(buf, rdata_start)?.0),
            TYPE_PTR => response.ptr_records.push(read_name(buf, rdata_start)?.0),
            _ => {}
         }

         min_ttl = Some(min_ttl.map_or(ttl, |current| current.min(ttl)));
         offset = rdata_start + rdlen;
      }

      response.ttl = min_ttl.unwrap_or(0);
      Ok(response)
   }

   #[inline]
   pub fn has_ip_address(&self) -> bool {
      !self.ipv4.is_empty() || !self.ipv6.is_empty()
   }

   pub fn ips(&self) -> impl Iterator<Item = std::net::IpAddr> + '_ {
      self.ipv4.iter().map(|ip| std::net::IpAddr::V4(*ip)).chain(self.ipv6.iter().map(|ip| std::net::IpAddr::V6(*ip)))
   }

   /// True while `timestamp + ttl` has not passed
   #[inline]
   pub fn is_fresh(&self) -> bool {
      self.timestamp.elapsed() < std::time::Duration::from_secs(self.ttl as u64)
   }

   /// Folds records found further down a CNAME chain into this response
   pub fn merge_from(&mut self, deeper: &DnsResponse) {
      for ip in &deeper.ipv4 {
         if !self.ipv4.contains(ip) {
            self.ipv4.push(*ip);
         }
      }
      for ip in &deeper.ipv6 {
         if !self.ipv6.contains(ip) {
            self.ipv6.push(*ip);
         }
      }
      for cname in &deeper.cnames {
         if !self.cnames.contains(cname) {
            self.cnames.push(cname.clone());
         }
      }
      if deeper.has_ip_address() && (self.ttl == 0 || deeper.ttl < self.ttl) {
         self.ttl = deeper.ttl;
      }
      if deeper.blocked && !self.blocked {
         self.blocked = true;
         self.blocked_by = deeper.blocked_by.clone();
         self.blocked_reason = deeper.blocked_reason.clone();
      }
   }
}

impl std::fmt::Display for DnsResponse {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      write!(f, "{} {}ms: {} ({}) = ", self.resolved_by, self.resolved_in.as_millis(), self.domain, self.ttl)?;
      if self.blocked {
         write!(f, "BLOCKED ({})", self.blocked_reason)?;
      } else {
         write!(f, "ALLOWED")?;
      }
      write!(f, " | IPs: {} | CNAMEs: {}", self.ipv4.len() + self.ipv6.len(), self.cnames.len())
   }
}

/// Result of a reverse lookup
#[derive(Clone, Debug)]
pub struct DnsLookup {
   pub ip: std::net::IpAddr,
   pub ptr_records: Vec<String>,
   pub resolved_by: String,
   pub resolved_in: std::time::Duration,
}

/// Upstream censorship heuristic evaluated over the raw reply and its parsed form
pub fn is_blocked_upstream(raw: &[u8], response: &DnsResponse, blocked_if: crate::resolver::BlockedIf) -> bool {
   use crate::resolver::BlockedIf;

   if raw.len() < HEADER_LEN {
      return false;
   }
   let rcode = raw[3] & 0x0F;
   let no_records = raw[6..12].iter().all(|byte| *byte == 0);

   match blocked_if {
      BlockedIf::Disabled => false,
      BlockedIf::Refused => rcode == RCODE_REFUSED,
      BlockedIf::ZeroIp => rcode == RCODE_NOERROR && response.has_ip_address() && response.ips().all(|ip| ip.is_unspecified()),
      BlockedIf::Empty => {
         (rcode == RCODE_NXDOMAIN && no_records) || (!response.has_ip_address() && response.cnames.is_empty())
      }
   }
}

static QUERY_ID: std::sync::atomic::AtomicU16 = std::sync::atomic::AtomicU16::new(1);

#[inline]
pub fn next_query_id() -> u16 {
   QUERY_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
}

/// Minimal single question query with recursion desired
pub fn build_query(domain: &str, query_type: u16) -> Result<Vec<u8>> {
   let name = encode_domain_name(domain)?;
   let mut query = Vec::with_capacity(HEADER_LEN + name.len() + 4);
   query.extend_from_slice(&next_query_id().to_be_bytes());
   query.extend_from_slice(&[0x01, 0x00]);
   query.extend_from_slice(&1u16.to_be_bytes());
   query.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
   query.extend_from_slice(&name);
   query.extend_from_slice(&query_type.to_be_bytes());
   query.extend_from_slice(&CLASS_IN.to_be_bytes());
   Ok(query)
}

/// Returns the header and question section of a client query, the envelope every synthesized answer reuses
fn question_envelope(original_query: &[u8]) -> Result<&[u8]> {
   if original_query.len() < HEADER_LEN {
      return Err(Error::MalformedDns("shorter than header"));
   }
   let (_, next) = read_name(original_query, HEADER_LEN)?;
   original_query.get(..next + 4).ok_or(Error::MalformedDns("truncated question"))
}

fn start_response(envelope: &[u8], answer_count: usize) -> Vec<u8> {
   let mut response = Vec::with_capacity(envelope.len() + answer_count * 28);
   response.extend_from_slice(&envelope[..2]);
   response.extend_from_slice(&[0x81, 0x80]);
   response.extend_from_slice(&1u16.to_be_bytes());
   response.extend_from_slice(&(answer_count as u16).to_be_bytes());
   response.extend_from_slice(&[0, 0, 0, 0]);
   response.extend_from_slice(&envelope[HEADER_LEN..]);
   response
}

fn push_record(response: &mut Vec<u8>, record_type: u16, ttl: u32, rdata: &[u8]) {
   // owner name is a pointer to the question name at offset 12
   response.extend_from_slice(&[0xC0, 0x0C]);
   response.extend_from_slice(&record_type.to_be_bytes());
   response.extend_from_slice(&CLASS_IN.to_be_bytes());
   response.extend_from_slice(&ttl.to_be_bytes());
   response.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
   response.extend_from_slice(rdata);
}

/// Answers `original_query` with every CNAME then every address of `resolved`, all carrying `resolved.ttl`
pub fn build_response(original_query: &[u8], resolved: &DnsResponse) -> Result<Vec<u8>> {
   let envelope = question_envelope(original_query)?;
   let answer_count = resolved.cnames.len() + resolved.ipv4.len() + resolved.ipv6.len();
   let mut response = start_response(envelope, answer_count);

   for cname in &resolved.cnames {
      push_record(&mut response, TYPE_CNAME, resolved.ttl, &encode_domain_name(cname)?);
   }
   for ip in resolved.ips() {
      match ip {
         std::net::IpAddr::V4(v4) => push_record(&mut response, TYPE_A, resolved.ttl, &v4.octets()),
         std::net::IpAddr::V6(v6) => push_record(&mut response, TYPE_AAAA, resolved.ttl, &v6.octets()),
      }
   }

   Ok(response)
}

/// Answers a PTR query with the given target names
pub fn build_ptr_response(original_query: &[u8], targets: &[String], ttl: u32) -> Result<Vec<u8>> {
   let envelope = question_envelope(original_query)?;
   let mut response = start_response(envelope, targets.len());
   for target in targets {
      push_record(&mut response, TYPE_PTR, ttl, &encode_domain_name(target)?);
   }
   Ok(response)
}
