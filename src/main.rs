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

mod args;
mod blocklist;
mod bloom;
mod cache;
mod clients;
mod connection;
mod dns;
mod driver;
mod engine;
mod error;
mod net;
mod net_table;
mod process;
mod profiles;
mod resolver;
mod rules;
mod server;
mod settings;
mod statics;
mod stats;
mod tls;
mod util;
mod verdict;

use anyhow::Context;
use tracing_subscriber::prelude::*;

// set once the driver is open, so a panic can still tell it to stop filtering
static DRIVER: once_cell::sync::OnceCell<std::sync::Arc<driver::Driver>> = once_cell::sync::OnceCell::new();

pub fn main() -> anyhow::Result<()> {
   init_logging();

   if !statics::ARGS.daemon {
      print_banner();
      print_version();
   }

   let default_hook = std::panic::take_hook();
   std::panic::set_hook(Box::new(move |info| {
      if let Some(driver) = DRIVER.get() {
         driver.shutdown_now();
      }
      default_hook(info);
   }));

   let runtime = tokio::runtime::Runtime::new().context("creating the tokio runtime")?;
   runtime.block_on(go())
}

fn init_logging() {
   let default_directive = if statics::ARGS.verbose { "faf_firewall=debug" } else { "faf_firewall=info" };
   let filter = tracing_subscriber::EnvFilter::try_from_default_env()
      .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));

   tracing_subscriber::registry().with(filter).with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr)).init();
}

async fn go() -> anyhow::Result<()> {
   let args = &*statics::ARGS;
   let cancel = tokio_util::sync::CancellationToken::new();

   let settings = std::sync::Arc::new(settings::SettingsHandle::load(args.settings.clone(), args.profiles.clone()));
   tracing::info!("Settings: {} | Profiles: {}", args.settings.display(), args.profiles.display());

   let blocklists = std::sync::Arc::new(blocklist::BlocklistManager::new(args.data_directory()));
   tokio::spawn(blocklists.clone().run_updates(settings.clone(), cancel.clone()));

   let listen_addr = std::net::SocketAddr::new(std::net::Ipv6Addr::UNSPECIFIED.into(), args.dns_port);
   let dns_server =
      server::DnsServer::new(settings.clone(), blocklists.clone(), clients::DnsClients::new(), listen_addr, cancel.clone());
   let dns_task = tokio::spawn(dns_server.clone().run());

   let mut engine_tasks = Vec::new();
   if let Some(driver_path) = &args.driver {
      let (driver, reader) = driver::Driver::open(driver_path, cancel.clone())
         .with_context(|| format!("opening the driver at {}", driver_path.display()))?;
      let driver = std::sync::Arc::new(driver);
      let _ = DRIVER.set(driver.clone());
      tracing::info!("Driver opened at {}", driver_path.display());

      let mut collaborators = engine::Collaborators::platform();
      collaborators.reverse_lookup = Some(dns_server.clone());

      let (queues, receivers) = engine::queues();
      let engine = engine::ConnectionEngine::new(
         settings.clone(),
         blocklists.clone(),
         std::sync::Arc::new(net_table::NetworkTables::default()),
         collaborators,
         driver.clone(),
         cancel.clone(),
      );
      engine_tasks = engine.start(receivers);
      driver::start(driver, reader, engine, queues, cancel.clone()).context("starting the driver reader")?;
   } else {
      tracing::info!("No driver configured, running the DNS server only");
   }

   tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
   tracing::info!("Shutting down");

   if let Some(driver) = DRIVER.get() {
      if let Err(err) = driver.send(&driver::Command::Shutdown) {
         tracing::error!("Failed to send shutdown to the driver: {}", err);
      }
   }
   cancel.cancel();

   for task in engine_tasks {
      let _ = task.await;
   }
   let _ = dns_task.await;

   Ok(())
}

fn print_banner() {
   println!();
   println!(
      r"
    ███████╗ █████╗ ███████╗    ███████╗██╗    ██╗
    ██╔════╝██╔══██╗██╔════╝    ██╔════╝██║    ██║
    █████╗  ███████║█████╗      █████╗  ██║ █╗ ██║
    ██╔══╝  ██╔══██║██╔══╝      ██╔══╝  ██║███╗██║
    ██║     ██║  ██║██║         ██║     ╚███╔███╔╝
    ╚═╝     ╚═╝  ╚═╝╚═╝         ╚═╝      ╚══╝╚══╝
    "
   );
   println!("\n");
}

fn print_version() {
   println!("{} v{}\n", statics::PROJECT_NAME, statics::VERSION);
}
