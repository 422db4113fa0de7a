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

use tokio_rustls::rustls;

const SESSION_CACHE_SIZE: usize = 256;

lazy_static::lazy_static! {
   // One connector for every DoT resolver so session tickets are shared
   pub static ref TLS_CONNECTOR: tokio_rustls::TlsConnector =
      tokio_rustls::TlsConnector::from(std::sync::Arc::new(get_tls_client_config())).early_data(true);
}

/// Client config for DNS over TLS: webpki roots, TLS 1.2 or 1.3, resumable sessions
#[inline]
pub fn get_tls_client_config() -> rustls::ClientConfig {
   let mut root_store = rustls::RootCertStore::empty();
   root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

   let mut config = rustls::ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
      .with_root_certificates(root_store)
      .with_no_client_auth();
   config.resumption = rustls::client::Resumption::in_memory_sessions(SESSION_CACHE_SIZE);
   config.enable_early_data = true;

   config
}

/// Name presented for SNI and certificate validation
pub fn server_name(domain: Option<&str>, ip: std::net::IpAddr) -> crate::error::Result<rustls::pki_types::ServerName<'static>> {
   match domain {
      Some(domain) => rustls::pki_types::ServerName::try_from(domain)
         .map(|name| name.to_owned())
         .map_err(|err| crate::error::Error::Tls(format!("invalid server name {domain}: {err}"))),
      None => Ok(rustls::pki_types::ServerName::IpAddress(ip.into())),
   }
}
