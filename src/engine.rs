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

use crate::connection::{BandwidthStat, Connection, ConnectionEndEvent, ConnectionEvent, Verdict};
use crate::net::Scope;
use std::sync::Arc;

const QUEUE_CAPACITY: usize = 8192;
const RECONCILE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);
// in reconcile ticks
const ADAPTER_DNS_REFRESH_TICKS: u64 = 10;

/// Where decided verdicts go, normally the driver
pub trait VerdictSink: Send + Sync {
   fn send_verdict(&self, verdict_id: u64, verdict: Verdict);

   /// Re-issues the verdict of a connection the driver already decided
   fn update_verdict(&self, connection: &Connection);
}

/// OS facing collaborators of the engine
pub struct Collaborators {
   pub tables: Box<dyn crate::net_table::TableSource>,
   pub processes: Box<dyn crate::process::ProcessInfoSource>,
   pub adapter_dns: Box<dyn crate::process::AdapterDnsSource>,
   pub ip_info: Box<dyn crate::process::IpInfoSource>,
   pub reverse_lookup: Option<Arc<dyn crate::server::ReverseLookup>>,
}

impl Collaborators {
   /// The readers of this platform, without geo data or reverse lookups
   pub fn platform() -> Self {
      Self {
         tables: crate::net_table::default_source(),
         processes: crate::process::default_process_source(),
         adapter_dns: Box::new(crate::process::ResolvConf::default()),
         ip_info: Box::new(crate::process::NoIpInfo),
         reverse_lookup: None,
      }
   }
}

/// Producer side of the engine's queues, handed to the driver reader
#[derive(Clone)]
pub struct EngineQueues {
   pub connections: kanal::Sender<ConnectionEvent>,
   pub ends: kanal::Sender<ConnectionEndEvent>,
   pub bandwidth: kanal::Sender<Vec<BandwidthStat>>,
}

pub struct EngineReceivers {
   connections: kanal::AsyncReceiver<ConnectionEvent>,
   ends: kanal::AsyncReceiver<ConnectionEndEvent>,
   bandwidth: kanal::AsyncReceiver<Vec<BandwidthStat>>,
}

pub fn queues() -> (EngineQueues, EngineReceivers) {
   let (connections_tx, connections_rx) = kanal::bounded(QUEUE_CAPACITY);
   let (ends_tx, ends_rx) = kanal::bounded(QUEUE_CAPACITY);
   let (bandwidth_tx, bandwidth_rx) = kanal::bounded(QUEUE_CAPACITY);

   (
      EngineQueues { connections: connections_tx, ends: ends_tx, bandwidth: bandwidth_tx },
      EngineReceivers {
         connections: connections_rx.to_async(),
         ends: ends_rx.to_async(),
         bandwidth: bandwidth_rx.to_async(),
      },
   )
}

type ConnectionMap = dashmap::DashMap<String, Connection, ahash::RandomState>;

/// Connection verdict engine: attributes each new connection to a process and profile, decides it, and tracks it
/// until the OS forgets it.
pub struct ConnectionEngine {
   settings: Arc<crate::settings::SettingsHandle>,
   blocklists: Arc<crate::blocklist::BlocklistManager>,
   tables: Arc<crate::net_table::NetworkTables>,
   sources: Collaborators,
   sink: Arc<dyn VerdictSink>,
   connections: ConnectionMap,
   connections_dns: ConnectionMap,
   // direction-less tuple -> connection id, for bandwidth accounting
   tuple_index: dashmap::DashMap<u64, String, nohash_hasher::BuildNoHashHasher<u64>>,
   adapter_dns: arc_swap::ArcSwap<Vec<std::net::IpAddr>>,
   cancel: tokio_util::sync::CancellationToken,
   pub stats: crate::stats::VerdictStats,
}

impl ConnectionEngine {
   pub fn new(
      settings: Arc<crate::settings::SettingsHandle>,
      blocklists: Arc<crate::blocklist::BlocklistManager>,
      tables: Arc<crate::net_table::NetworkTables>,
      sources: Collaborators,
      sink: Arc<dyn VerdictSink>,
      cancel: tokio_util::sync::CancellationToken,
   ) -> Arc<Self> {
      let adapter_dns = sources.adapter_dns.dns_servers();
      Arc::new(Self {
         settings,
         blocklists,
         tables,
         sources,
         sink,
         connections: dashmap::DashMap::with_hasher(ahash::RandomState::new()),
         connections_dns: dashmap::DashMap::with_hasher(ahash::RandomState::new()),
         tuple_index: dashmap::DashMap::with_hasher(nohash_hasher::BuildNoHashHasher::default()),
         adapter_dns: arc_swap::ArcSwap::from_pointee(adapter_dns),
         cancel,
         stats: crate::stats::VerdictStats::default(),
      })
   }

   /// Spawns the four workers
   pub fn start(self: &Arc<Self>, receivers: EngineReceivers) -> Vec<tokio::task::JoinHandle<()>> {
      let EngineReceivers { connections, ends, bandwidth } = receivers;

      let engine = self.clone();
      let connection_worker = tokio::spawn(async move {
         while let Some(event) = engine.next(&connections).await {
            engine.process_connection(event);
         }
         tracing::debug!("Connection worker stopped");
      });

      let engine = self.clone();
      let end_worker = tokio::spawn(async move {
         while let Some(event) = engine.next(&ends).await {
            engine.process_end(&event);
         }
         tracing::debug!("Connection end worker stopped");
      });

      let engine = self.clone();
      let bandwidth_worker = tokio::spawn(async move {
         while let Some(stats) = engine.next(&bandwidth).await {
            engine.process_bandwidth(&stats);
         }
         tracing::debug!("Bandwidth worker stopped");
      });

      let engine = self.clone();
      let reconcile_worker = tokio::spawn(async move { engine.reconcile_loop().await });

      vec![connection_worker, end_worker, bandwidth_worker, reconcile_worker]
   }

   async fn next<T>(&self, receiver: &kanal::AsyncReceiver<T>) -> Option<T> {
      tokio::select! {
         _ = self.cancel.cancelled() => None,
         received = receiver.recv() => received.ok(),
      }
   }

   #[inline]
   /// Re-reads the OS connection tables
   pub fn refresh_tables(&self) {
      self.tables.refresh(self.sources.tables.as_ref());
   }

   pub fn tables(&self) -> &crate::net_table::NetworkTables {
      &self.tables
   }

   pub fn connection(&self, connection_id: &str) -> Option<Connection> {
      self.connections.get(connection_id).map(|entry| entry.value().clone())
   }

   pub fn dns_connection(&self, connection_id: &str) -> Option<Connection> {
      self.connections_dns.get(connection_id).map(|entry| entry.value().clone())
   }

   /// `(connections, dns connections)` currently tracked
   pub fn len(&self) -> (usize, usize) {
      (self.connections.len(), self.connections_dns.len())
   }

   /// Driver PID, unless the OS table attributes the tuple to another process
   fn usermode_pid(&self, event: &ConnectionEvent) -> u64 {
      match self.tables.check_pid(event.protocol, &event.local_ip, event.local_port, &event.remote_ip, event.remote_port) {
         Some(table_pid) if table_pid != event.pid => {
            tracing::debug!("[CheckPID] New: {} != {} | {}", table_pid, event.pid, event);
            table_pid
         }
         _ => event.pid,
      }
   }

   fn enrich(&self, connection: &mut Connection) {
      let ip = if connection.remote_scope == Scope::Internet {
         connection.remote_ip
      } else if connection.local_scope == Scope::Internet {
         connection.local_ip
      } else {
         return;
      };

      if let Some(info) = self.sources.ip_info.lookup(&ip) {
         connection.is_anycast = info.is_anycast;
         connection.country = info.country;
         connection.asn = info.asn;
         connection.organization = info.organization;
      }
   }

   fn profile_for(&self, connection: &Connection) -> crate::profiles::Profile {
      let identity = crate::profiles::ProcessIdentity {
         name: &connection.process_name,
         path: &connection.process_path,
         command_line: &connection.process_command_line,
      };

      let profiles = self.settings.profiles();
      if let Some(profile) = crate::profiles::match_process(&profiles, &identity) {
         return profile.clone();
      }

      let settings = self.settings.settings();
      if let crate::profiles::DefaultProfile::Existing(profile) =
         crate::profiles::create_default_profile(&profiles, &settings, &identity)
      {
         return profile;
      }

      // another worker may have created it since the snapshot was taken
      self.settings.update_profiles(|profiles| {
         match crate::profiles::create_default_profile(profiles, &settings, &identity) {
            crate::profiles::DefaultProfile::Existing(profile) => profile,
            crate::profiles::DefaultProfile::Created(profile) => {
               tracing::info!("ProfilesManager: Created profile {} for {}", profile.name, connection.process_path);
               profiles.push(profile.clone());
               profile
            }
         }
      })
   }

   fn decide(&self, connection: &Connection, profile: &crate::profiles::Profile) -> crate::verdict::Decision {
      let settings = self.settings.settings();
      let adapter_dns = self.adapter_dns.load();
      crate::verdict::decide(
         connection,
         profile,
         &crate::verdict::VerdictContext { settings: &settings, blocklists: &self.blocklists, adapter_dns: &adapter_dns },
      )
   }

   pub fn process_connection(self: &Arc<Self>, event: ConnectionEvent) {
      let mut connection = Connection::from_event(&event);
      connection.pid = self.usermode_pid(&event);

      let info = self.sources.processes.process_info(connection.pid);
      connection.process_name = info.name;
      connection.process_path = info.path;
      connection.process_command_line = info.command_line;

      self.enrich(&mut connection);

      let profile = self.profile_for(&connection);
      connection.profile_id = profile.id.clone();
      connection.profile_name = profile.name.clone();

      let decision = self.decide(&connection, &profile);
      connection.set_verdict(decision.verdict, decision.reason);
      self.sink.send_verdict(connection.verdict_id, connection.verdict);
      self.stats.record(connection.verdict);
      tracing::debug!("Connection: {}", connection);

      let wants_host = !decision.dns && connection.remote_scope == Scope::Internet;
      let (remote_ip, connection_id) = (connection.remote_ip, connection.connection_id.clone());

      self.tuple_index.insert(connection.tuple_key(), connection.connection_id.clone());
      if decision.dns {
         self.connections_dns.insert(connection.connection_id.clone(), connection);
      } else {
         self.connections.insert(connection.connection_id.clone(), connection);
      }

      if wants_host {
         if let Some(reverse_lookup) = self.sources.reverse_lookup.clone() {
            let engine = self.clone();
            tokio::spawn(async move {
               if let Some(host) = reverse_lookup.reverse_lookup(remote_ip).await {
                  if let Some(mut connection) = engine.connections.get_mut(&connection_id) {
                     connection.remote_host = Some(host);
                  }
               }
            });
         }
      }
   }

   pub fn process_end(&self, event: &ConnectionEndEvent) {
      let connection_id = event.connection_id();
      let mut found = false;

      for map in [&self.connections, &self.connections_dns] {
         if let Some(mut connection) = map.get_mut(&connection_id) {
            connection.mark_ended();
            found = true;
         }
      }

      if found {
         self.stats.ended.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
      } else {
         tracing::trace!("End of untracked connection {}", event);
      }
   }

   /// Adds byte counts to the matching connection, whatever its direction. Unknown tuples are dropped.
   pub fn process_bandwidth(&self, stats: &[BandwidthStat]) {
      for stat in stats {
         let Some(connection_id) = self.tuple_index.get(&stat.tuple_key()).map(|id| id.value().clone()) else {
            continue;
         };

         for map in [&self.connections, &self.connections_dns] {
            if let Some(mut connection) = map.get_mut(&connection_id) {
               connection.sent_bytes = connection.sent_bytes.saturating_add(stat.transmitted);
               connection.received_bytes = connection.received_bytes.saturating_add(stat.received);
            }
         }
      }
   }

   /// Marks connections the OS tables no longer know as ended and forgets those that ended long enough ago
   pub fn reconcile(&self, now: chrono::DateTime<chrono::Utc>) {
      let ended_timeout = chrono::Duration::seconds(self.settings.settings().application.connection_ended_timeout as i64);

      for map in [&self.connections, &self.connections_dns] {
         for mut entry in map.iter_mut() {
            let connection = entry.value_mut();
            if connection.is_active
               && !self.tables.contains(
                  connection.protocol,
                  &connection.local_ip,
                  connection.local_port,
                  &connection.remote_ip,
                  connection.remote_port,
               )
            {
               connection.mark_ended();
               self.stats.ended.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
         }

         map.retain(|connection_id, connection| {
            let expired = connection.end_date.is_some_and(|end_date| end_date + ended_timeout < now);
            if expired {
               self.tuple_index.remove_if(&connection.tuple_key(), |_, indexed| indexed == connection_id);
            }
            !expired
         });
      }
   }

   /// Decides every active connection again and re-issues the verdicts that changed
   pub fn reevaluate(&self) {
      let profiles = self.settings.profiles();

      for map in [&self.connections, &self.connections_dns] {
         for mut entry in map.iter_mut() {
            let connection = entry.value_mut();
            if !connection.is_active {
               continue;
            }
            let Some(profile) = profiles.iter().find(|profile| profile.id == connection.profile_id) else {
               continue;
            };

            let decision = self.decide(connection, profile);
            if decision.verdict != connection.verdict {
               connection.set_verdict(decision.verdict, decision.reason);
               connection.profile_name = profile.name.clone();
               tracing::debug!("Connection updated: {}", connection);
               self.sink.update_verdict(connection);
            }
         }
      }
   }

   pub fn refresh_adapter_dns(&self) {
      let servers = self.sources.adapter_dns.dns_servers();
      if **self.adapter_dns.load() != servers {
         tracing::info!("Network adapter DNS servers: {:?}", servers);
         self.adapter_dns.store(Arc::new(servers));
      }
   }

   async fn reconcile_loop(&self) {
      let mut changes = self.settings.subscribe();
      let mut interval = tokio::time::interval(RECONCILE_INTERVAL);
      interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      let mut ticks: u64 = 0;

      loop {
         tokio::select! {
            _ = self.cancel.cancelled() => break,
            changed = changes.changed() => {
               if changed.is_err() {
                  break;
               }
               self.reevaluate();
            }
            _ = interval.tick() => {
               ticks += 1;
               self.refresh_tables();
               self.reconcile(chrono::Utc::now());
               if ticks % ADAPTER_DNS_REFRESH_TICKS == 0 {
                  self.refresh_adapter_dns();
               }
               if crate::util::is_power_of_2(ticks) {
                  tracing::debug!("{}", self.stats);
               }
            }
         }
      }
      tracing::debug!("Reconcile worker stopped");
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::connection::{Direction, PROTOCOL_TCP, PROTOCOL_UDP};
   use crate::net_table::{TableEntry, TableSnapshot};
   use crate::process::{IpInfo, ProcessInfo};

   #[derive(Default)]
   struct RecordingSink {
      verdicts: std::sync::Mutex<Vec<(u64, Verdict)>>,
      updates: std::sync::Mutex<Vec<(String, Verdict)>>,
   }

   impl VerdictSink for RecordingSink {
      fn send_verdict(&self, verdict_id: u64, verdict: Verdict) {
         self.verdicts.lock().unwrap().push((verdict_id, verdict));
      }

      fn update_verdict(&self, connection: &Connection) {
         self.updates.lock().unwrap().push((connection.connection_id.clone(), connection.verdict));
      }
   }

   struct StaticTables(std::sync::Mutex<TableSnapshot>);

   impl crate::net_table::TableSource for StaticTables {
      fn snapshot(&self) -> crate::error::Result<TableSnapshot> {
         Ok(self.0.lock().unwrap().clone())
      }
   }

   struct Processes;

   impl crate::process::ProcessInfoSource for Processes {
      fn process_info(&self, pid: u64) -> ProcessInfo {
         match pid {
            0 => ProcessInfo::system(),
            100 => ProcessInfo {
               name: "curl".to_string(),
               path: "/usr/bin/curl".to_string(),
               command_line: "curl https://example.com".to_string(),
            },
            200 => ProcessInfo {
               name: "firefox".to_string(),
               path: "/usr/lib/firefox/firefox".to_string(),
               command_line: "firefox".to_string(),
            },
            _ => ProcessInfo::unknown(),
         }
      }
   }

   struct AdapterDns;

   impl crate::process::AdapterDnsSource for AdapterDns {
      fn dns_servers(&self) -> Vec<std::net::IpAddr> {
         vec!["192.168.1.1".parse().unwrap()]
      }
   }

   struct Geo;

   impl crate::process::IpInfoSource for Geo {
      fn lookup(&self, ip: &std::net::IpAddr) -> Option<IpInfo> {
         Some(IpInfo { ip: ip.to_string(), country: "NL".to_string(), asn: "AS1136".to_string(), ..Default::default() })
      }
   }

   fn engine_with(settings: crate::settings::ApplicationSettings) -> (Arc<ConnectionEngine>, Arc<RecordingSink>) {
      let sink = Arc::new(RecordingSink::default());
      let engine = ConnectionEngine::new(
         Arc::new(crate::settings::SettingsHandle::in_memory(settings, Vec::new())),
         Arc::new(crate::blocklist::BlocklistManager::with_lists(std::env::temp_dir(), Vec::new())),
         Arc::new(crate::net_table::NetworkTables::new()),
         Collaborators {
            tables: Box::new(StaticTables(std::sync::Mutex::new(TableSnapshot::default()))),
            processes: Box::new(Processes),
            adapter_dns: Box::new(AdapterDns),
            ip_info: Box::new(Geo),
            reverse_lookup: None,
         },
         sink.clone(),
         tokio_util::sync::CancellationToken::new(),
      );
      (engine, sink)
   }

   fn event(id: u64, pid: u64, protocol: u8, local: &str, remote: &str) -> ConnectionEvent {
      let local: std::net::SocketAddr = local.parse().unwrap();
      let remote: std::net::SocketAddr = remote.parse().unwrap();
      ConnectionEvent {
         id,
         pid,
         direction: Direction::Outbound,
         protocol,
         local_ip: local.ip(),
         remote_ip: remote.ip(),
         local_port: local.port(),
         remote_port: remote.port(),
         payload_layer: 0,
         payload_size: 0,
         payload: Vec::new(),
      }
   }

   fn end_of(event: &ConnectionEvent) -> ConnectionEndEvent {
      ConnectionEndEvent {
         pid: event.pid,
         direction: event.direction,
         protocol: event.protocol,
         local_ip: event.local_ip,
         remote_ip: event.remote_ip,
         local_port: event.local_port,
         remote_port: event.remote_port,
      }
   }

   fn id_of(event: &ConnectionEvent) -> String {
      crate::connection::connection_id(
         event.protocol,
         event.direction,
         &event.local_ip,
         event.local_port,
         &event.remote_ip,
         event.remote_port,
      )
   }

   #[tokio::test]
   async fn new_connection_is_decided_and_profiled() {
      let (engine, sink) = engine_with(crate::settings::ApplicationSettings::default());
      let event = event(7, 100, PROTOCOL_TCP, "192.168.1.20:50000", "93.184.216.34:443");
      engine.process_connection(event.clone());

      let connection = engine.connection(&id_of(&event)).unwrap();
      assert_eq!(connection.verdict, Verdict::PermanentAccept);
      assert_eq!(connection.verdict_reason, "DefaultAllow");
      assert_eq!(connection.process_name, "curl");
      assert_eq!(connection.profile_name, "curl");
      assert_eq!(connection.country, "NL");
      assert_eq!(*sink.verdicts.lock().unwrap(), vec![(7, Verdict::PermanentAccept)]);

      // the generated profile is reused for the next connection of the same program
      engine.process_connection(crate::engine::tests::event(8, 100, PROTOCOL_TCP, "192.168.1.20:50001", "93.184.216.34:443"));
      let generated = engine.settings.profiles().iter().filter(|profile| profile.name == "curl").count();
      assert_eq!(generated, 1);
   }

   #[tokio::test]
   async fn table_pid_overrides_driver_pid() {
      let (engine, _) = engine_with(crate::settings::ApplicationSettings::default());
      engine.tables.update(TableSnapshot {
         tcp4: vec![TableEntry {
            local_ip: "192.168.1.20".parse().unwrap(),
            local_port: 50000,
            remote_ip: "93.184.216.34".parse().unwrap(),
            remote_port: 443,
            pid: 200,
         }],
         ..Default::default()
      });

      let event = event(1, 100, PROTOCOL_TCP, "192.168.1.20:50000", "93.184.216.34:443");
      engine.process_connection(event.clone());

      let connection = engine.connection(&id_of(&event)).unwrap();
      assert_eq!(connection.pid, 200);
      assert_eq!(connection.pid_kext, 100);
      assert_eq!(connection.process_name, "firefox");
   }

   #[tokio::test]
   async fn dns_connections_are_kept_apart() {
      let mut settings = crate::settings::ApplicationSettings::default();
      settings.network_action.block_bypass_dns = false;
      let (engine, _) = engine_with(settings);

      let event = event(1, 100, PROTOCOL_UDP, "192.168.1.20:40000", "9.9.9.9:53");
      engine.process_connection(event.clone());

      assert!(engine.connection(&id_of(&event)).is_none());
      assert_eq!(engine.dns_connection(&id_of(&event)).unwrap().verdict_reason, "AllowExternalDNS");
      assert_eq!(engine.len(), (0, 1));
   }

   #[tokio::test]
   async fn bandwidth_ignores_direction_and_drops_unknown_tuples() {
      let (engine, _) = engine_with(crate::settings::ApplicationSettings::default());
      let event = event(1, 100, PROTOCOL_TCP, "192.168.1.20:50000", "93.184.216.34:443");
      engine.process_connection(event.clone());

      let stat = |remote_port: u16, transmitted: u64, received: u64| BandwidthStat {
         protocol: PROTOCOL_TCP,
         local_ip: event.local_ip,
         local_port: event.local_port,
         remote_ip: event.remote_ip,
         remote_port,
         transmitted,
         received,
      };
      engine.process_bandwidth(&[stat(443, 100, 1000), stat(80, 5, 5)]);
      engine.process_bandwidth(&[stat(443, 20, 300)]);

      let connection = engine.connection(&id_of(&event)).unwrap();
      assert_eq!((connection.sent_bytes, connection.received_bytes), (120, 1300));
   }

   #[tokio::test]
   async fn end_event_marks_connection_inactive() {
      let (engine, _) = engine_with(crate::settings::ApplicationSettings::default());
      let event = event(1, 100, PROTOCOL_TCP, "192.168.1.20:50000", "93.184.216.34:443");
      engine.process_connection(event.clone());
      engine.process_end(&end_of(&event));

      let connection = engine.connection(&id_of(&event)).unwrap();
      assert!(!connection.is_active);
      assert!(connection.end_date.is_some());
   }

   #[tokio::test]
   async fn reconcile_ends_and_purges() {
      let (engine, _) = engine_with(crate::settings::ApplicationSettings::default());
      let alive = event(1, 100, PROTOCOL_TCP, "192.168.1.20:50000", "93.184.216.34:443");
      let gone = event(2, 100, PROTOCOL_TCP, "192.168.1.20:50001", "93.184.216.34:443");
      engine.tables.update(TableSnapshot {
         tcp4: vec![TableEntry {
            local_ip: alive.local_ip,
            local_port: alive.local_port,
            remote_ip: alive.remote_ip,
            remote_port: alive.remote_port,
            pid: 100,
         }],
         ..Default::default()
      });
      engine.process_connection(alive.clone());
      engine.process_connection(gone.clone());

      let now = chrono::Utc::now();
      engine.reconcile(now);
      assert!(engine.connection(&id_of(&alive)).unwrap().is_active);
      assert!(!engine.connection(&id_of(&gone)).unwrap().is_active);

      // connection_ended_timeout defaults to 600 seconds
      engine.reconcile(now + chrono::Duration::seconds(601));
      assert!(engine.connection(&id_of(&gone)).is_none());
      assert!(engine.connection(&id_of(&alive)).is_some());
   }

   #[tokio::test]
   async fn settings_change_reissues_changed_verdicts() {
      let (engine, sink) = engine_with(crate::settings::ApplicationSettings::default());
      let event = event(1, 100, PROTOCOL_TCP, "192.168.1.20:50000", "93.184.216.34:443");
      engine.process_connection(event.clone());

      engine.settings.update_settings(|settings| settings.network_action.outgoing_rules = vec!["BLOCK INTERNET".to_string()]);
      engine.reevaluate();

      let connection = engine.connection(&id_of(&event)).unwrap();
      assert_eq!(connection.verdict, Verdict::PermanentBlock);
      assert_eq!(connection.verdict_reason, "Rule(BLOCK INTERNET)");
      assert_eq!(*sink.updates.lock().unwrap(), vec![(id_of(&event), Verdict::PermanentBlock)]);
   }

   #[tokio::test]
   async fn adapter_dns_is_loaded_at_start() {
      let (engine, _) = engine_with(crate::settings::ApplicationSettings::default());
      let event = event(1, 100, PROTOCOL_UDP, "192.168.1.20:40000", "192.168.1.1:53");
      engine.process_connection(event.clone());
      assert_eq!(engine.dns_connection(&id_of(&event)).unwrap().verdict_reason, "AllowNetworkAdapterDNS");
   }

   #[tokio::test]
   async fn queued_events_reach_the_workers() {
      let (engine, sink) = engine_with(crate::settings::ApplicationSettings::default());
      let (queues, receivers) = queues();
      let workers = engine.start(receivers);

      queues.connections.send(event(5, 100, PROTOCOL_TCP, "192.168.1.20:50000", "93.184.216.34:443")).unwrap();
      for _ in 0..100 {
         if !sink.verdicts.lock().unwrap().is_empty() {
            break;
         }
         tokio::time::sleep(std::time::Duration::from_millis(10)).await;
      }
      assert_eq!(*sink.verdicts.lock().unwrap(), vec![(5, Verdict::PermanentAccept)]);

      engine.cancel.cancel();
      for worker in workers {
         worker.await.unwrap();
      }
   }
}
