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

use clap::Parser;

/// FaF Firewall - connection verdicts and filtered DNS
#[derive(Parser, Debug, Default)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
   /// daemon mode, no banner.
   #[clap(short, long)]
   pub daemon: bool,

   /// debug level logging. RUST_LOG takes precedence when set.
   #[clap(short, long)]
   pub verbose: bool,

   /// application settings (YAML). Created with defaults when missing.
   #[clap(long, default_value = "./faf-firewall.yaml")]
   pub settings: std::path::PathBuf,

   /// profile list (YAML). Created with the special profiles when missing.
   #[clap(long, default_value = "./faf-firewall-profiles.yaml")]
   pub profiles: std::path::PathBuf,

   /// data directory to store blocklists. Defaults to the current working directory.
   #[clap(long)]
   pub data_directory: Option<std::path::PathBuf>,

   /// device or FIFO speaking the driver protocol. Without it only the DNS server runs.
   #[clap(long)]
   pub driver: Option<std::path::PathBuf>,

   /// port the DNS server listens on
   #[clap(short = 'p', long, default_value_t = crate::statics::DNS_PORT)]
   pub dns_port: u16,
}

impl Args {
   /// Root of the blocklist storage
   pub fn data_directory(&self) -> std::path::PathBuf {
      self.data_directory.clone().or_else(|| std::env::current_dir().ok()).unwrap_or_else(std::env::temp_dir)
   }
}
