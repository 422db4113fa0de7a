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

//! Error types shared by the DNS engine, the verdict engine and the driver codec

/// Crate result type
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// Socket, file or pipe failure
   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   /// A single upstream attempt ran past its deadline
   #[error("timed out after {0:?}")]
   Timeout(std::time::Duration),

   /// The process-wide shutdown signal fired
   #[error("cancelled")]
   Cancelled,

   #[error("TLS error: {0}")]
   Tls(String),

   #[error("HTTP error: {0}")]
   Http(#[from] reqwest::Error),

   #[error("YAML error: {0}")]
   Yaml(#[from] serde_yaml::Error),

   #[error("bincode error: {0}")]
   Bincode(#[from] bincode::Error),

   #[error("regex error: {0}")]
   Regex(#[from] regex::Error),

   /// Resolver URI that does not follow `scheme://host[:port]?name=&domain=&blockedIf=`
   #[error("invalid resolver: {0}")]
   InvalidResolver(String),

   #[error("invalid rule: {0}")]
   InvalidRule(String),

   /// DNS message that cannot be parsed or validated
   #[error("malformed DNS message: {0}")]
   MalformedDns(&'static str),

   /// Driver frame with an unknown type or an implausible body
   #[error("malformed driver frame: {0}")]
   MalformedFrame(String),

   /// Every configured resolver is currently marked failing
   #[error("no resolver available")]
   NoResolverAvailable,

   #[error("blocklist error: {0}")]
   Blocklist(String),
}

impl Error {
   #[inline]
   pub fn is_timeout(&self) -> bool {
      matches!(self, Error::Timeout(_))
   }
}
