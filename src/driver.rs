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

//! Framing spoken with the packet filter driver. Every multi-byte field is little-endian and packed.
//!
//! Inbound: `type: u8, length: u32` followed by the body of that type.
//! Outbound: a one byte opcode, followed by the command's fields.

use crate::connection::{BandwidthStat, ConnectionEndEvent, ConnectionEvent, Direction, Verdict};
use crate::error::{Error, Result};
use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const BANDWIDTH_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);
// a larger count means the stream is out of step
const MAX_BANDWIDTH_VALUES: u32 = 1_000_000;
// a full IPv6 bandwidth frame fits well within this
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameType {
   LogLine = 0,
   ConnectionV4 = 1,
   ConnectionV6 = 2,
   ConnectionEndV4 = 3,
   ConnectionEndV6 = 4,
   BandwidthStatsV4 = 5,
   BandwidthStatsV6 = 6,
}

impl TryFrom<u8> for FrameType {
   type Error = Error;

   fn try_from(value: u8) -> Result<Self> {
      let frame_type = match value {
         0 => FrameType::LogLine,
         1 => FrameType::ConnectionV4,
         2 => FrameType::ConnectionV6,
         3 => FrameType::ConnectionEndV4,
         4 => FrameType::ConnectionEndV6,
         5 => FrameType::BandwidthStatsV4,
         6 => FrameType::BandwidthStatsV6,
         _ => return Err(Error::MalformedFrame(format!("Invalid info type received: {value}"))),
      };
      Ok(frame_type)
   }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
   LogLine { severity: u8, line: String },
   Connection(ConnectionEvent),
   ConnectionEnd(ConnectionEndEvent),
   BandwidthStats(Vec<BandwidthStat>),
}

#[inline]
fn read_array<const N: usize, R: Read>(reader: &mut R) -> Result<[u8; N]> {
   let mut buf = [0u8; N];
   reader.read_exact(&mut buf)?;
   Ok(buf)
}

#[inline]
fn read_u8<R: Read>(reader: &mut R) -> Result<u8> {
   Ok(read_array::<1, R>(reader)?[0])
}

#[inline]
fn read_u16<R: Read>(reader: &mut R) -> Result<u16> {
   Ok(u16::from_le_bytes(read_array(reader)?))
}

#[inline]
fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
   Ok(u32::from_le_bytes(read_array(reader)?))
}

#[inline]
fn read_u64<R: Read>(reader: &mut R) -> Result<u64> {
   Ok(u64::from_le_bytes(read_array(reader)?))
}

fn read_ip<R: Read>(reader: &mut R, v6: bool) -> Result<IpAddr> {
   if v6 {
      Ok(IpAddr::V6(Ipv6Addr::from(read_array::<16, R>(reader)?)))
   } else {
      Ok(IpAddr::V4(Ipv4Addr::from(read_array::<4, R>(reader)?)))
   }
}

fn read_connection(body: &mut std::io::Cursor<&[u8]>, v6: bool) -> Result<ConnectionEvent> {
   let id = read_u64(body)?;
   let pid = read_u64(body)?;
   let direction = Direction::try_from(read_u8(body)?)?;
   let protocol = read_u8(body)?;
   let local_ip = read_ip(body, v6)?;
   let remote_ip = read_ip(body, v6)?;
   let local_port = read_u16(body)?;
   let remote_port = read_u16(body)?;
   let payload_layer = read_u8(body)?;
   let payload_size = read_u32(body)?;

   let remaining = body.get_ref().len() as u64 - body.position();
   if payload_size as u64 > remaining {
      return Err(Error::MalformedFrame(format!("payload size {payload_size} exceeds the {remaining} bytes left in the frame")));
   }
   let mut payload = vec![0u8; payload_size as usize];
   body.read_exact(&mut payload)?;

   Ok(ConnectionEvent {
      id,
      pid,
      direction,
      protocol,
      local_ip,
      remote_ip,
      local_port,
      remote_port,
      payload_layer,
      payload_size,
      payload,
   })
}

fn read_connection_end(body: &mut std::io::Cursor<&[u8]>, v6: bool) -> Result<ConnectionEndEvent> {
   let pid = read_u64(body)?;
   let direction = Direction::try_from(read_u8(body)?)?;
   let protocol = read_u8(body)?;
   let local_ip = read_ip(body, v6)?;
   let remote_ip = read_ip(body, v6)?;
   let local_port = read_u16(body)?;
   let remote_port = read_u16(body)?;

   Ok(ConnectionEndEvent { pid, direction, protocol, local_ip, remote_ip, local_port, remote_port })
}

fn read_bandwidth(body: &mut std::io::Cursor<&[u8]>, v6: bool) -> Result<Vec<BandwidthStat>> {
   let protocol = read_u8(body)?;
   let count = read_u32(body)?;
   if count == 0 || count > MAX_BANDWIDTH_VALUES {
      return Err(Error::MalformedFrame(format!("Invalid array size: {count}")));
   }
   let value_len: u64 = if v6 { 16 + 2 + 16 + 2 + 8 + 8 } else { 4 + 2 + 4 + 2 + 8 + 8 };
   let remaining = body.get_ref().len() as u64 - body.position();
   if count as u64 * value_len > remaining {
      return Err(Error::MalformedFrame(format!("Array size {count} exceeds the {remaining} bytes left in the frame")));
   }

   let mut stats = Vec::with_capacity(count as usize);
   for _ in 0..count {
      let local_ip = read_ip(body, v6)?;
      let local_port = read_u16(body)?;
      let remote_ip = read_ip(body, v6)?;
      let remote_port = read_u16(body)?;
      let transmitted = read_u64(body)?;
      let received = read_u64(body)?;
      stats.push(BandwidthStat { protocol, local_ip, local_port, remote_ip, remote_port, transmitted, received });
   }
   Ok(stats)
}

fn parse_body(frame_type: FrameType, body: &[u8]) -> Result<Frame> {
   let mut cursor = std::io::Cursor::new(body);
   let frame = match frame_type {
      FrameType::LogLine => {
         let (severity, line) = body.split_first().ok_or_else(|| Error::MalformedFrame("empty log line".to_string()))?;
         Frame::LogLine { severity: *severity, line: String::from_utf8_lossy(line).into_owned() }
      }
      FrameType::ConnectionV4 => Frame::Connection(read_connection(&mut cursor, false)?),
      FrameType::ConnectionV6 => Frame::Connection(read_connection(&mut cursor, true)?),
      FrameType::ConnectionEndV4 => Frame::ConnectionEnd(read_connection_end(&mut cursor, false)?),
      FrameType::ConnectionEndV6 => Frame::ConnectionEnd(read_connection_end(&mut cursor, true)?),
      FrameType::BandwidthStatsV4 => Frame::BandwidthStats(read_bandwidth(&mut cursor, false)?),
      FrameType::BandwidthStatsV6 => Frame::BandwidthStats(read_bandwidth(&mut cursor, true)?),
   };
   Ok(frame)
}

/// Next frame of the stream. `Ok(None)` when the stream ended cleanly between frames.
///
/// The whole body is consumed before it is parsed, so a `MalformedFrame` error drops only that frame and the stream
/// stays aligned on the next header. `Io` errors mean the stream itself is gone.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Frame>> {
   let mut header = [0u8; 5];
   match reader.read_exact(&mut header) {
      Ok(()) => (),
      Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
      Err(err) => return Err(err.into()),
   }

   let length = u32::from_le_bytes([header[1], header[2], header[3], header[4]]);
   if length > MAX_FRAME_LEN {
      std::io::copy(&mut reader.by_ref().take(length as u64), &mut std::io::sink())?;
      return Err(Error::MalformedFrame(format!("Frame length {length} too large")));
   }

   let mut body = vec![0u8; length as usize];
   reader.read_exact(&mut body)?;

   let frame_type = FrameType::try_from(header[0])?;
   match parse_body(frame_type, &body) {
      Ok(frame) => Ok(Some(frame)),
      Err(Error::Io(err)) => Err(Error::MalformedFrame(format!("{frame_type:?} body of {length} bytes is short: {err}"))),
      Err(err) => Err(err),
   }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Opcode {
   Shutdown = 0,
   Verdict = 1,
   UpdateV4 = 2,
   UpdateV6 = 3,
   ClearCache = 4,
   GetLogs = 5,
   BandwidthStats = 6,
   PrintMemoryStats = 7,
   CleanEndedConnections = 8,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
   Shutdown,
   Verdict {
      id: u64,
      verdict: Verdict,
   },
   /// Replaces the decision the driver holds for a tuple
   Update {
      protocol: u8,
      local_ip: IpAddr,
      local_port: u16,
      remote_ip: IpAddr,
      remote_port: u16,
      verdict: Verdict,
   },
   ClearCache,
   GetLogs,
   BandwidthStats,
   PrintMemoryStats,
   CleanEndedConnections,
}

impl Command {
   pub fn opcode(&self) -> Opcode {
      match self {
         Command::Shutdown => Opcode::Shutdown,
         Command::Verdict { .. } => Opcode::Verdict,
         Command::Update { local_ip, remote_ip, .. } => {
            if local_ip.to_canonical().is_ipv4() && remote_ip.to_canonical().is_ipv4() {
               Opcode::UpdateV4
            } else {
               Opcode::UpdateV6
            }
         }
         Command::ClearCache => Opcode::ClearCache,
         Command::GetLogs => Opcode::GetLogs,
         Command::BandwidthStats => Opcode::BandwidthStats,
         Command::PrintMemoryStats => Opcode::PrintMemoryStats,
         Command::CleanEndedConnections => Opcode::CleanEndedConnections,
      }
   }

   pub fn encode(&self) -> Vec<u8> {
      let opcode = self.opcode();
      let mut buf = vec![opcode as u8];

      match self {
         Command::Verdict { id, verdict } => {
            buf.extend_from_slice(&id.to_le_bytes());
            buf.push(*verdict as u8);
         }
         Command::Update { protocol, local_ip, local_port, remote_ip, remote_port, verdict } => {
            let push_ip = |buf: &mut Vec<u8>, ip: &IpAddr| match (opcode, ip.to_canonical()) {
               (Opcode::UpdateV4, IpAddr::V4(v4)) => buf.extend_from_slice(&v4.octets()),
               (_, IpAddr::V4(v4)) => buf.extend_from_slice(&v4.to_ipv6_mapped().octets()),
               (_, IpAddr::V6(v6)) => buf.extend_from_slice(&v6.octets()),
            };

            buf.push(*protocol);
            push_ip(&mut buf, local_ip);
            buf.extend_from_slice(&local_port.to_le_bytes());
            push_ip(&mut buf, remote_ip);
            buf.extend_from_slice(&remote_port.to_le_bytes());
            buf.push(*verdict as u8);
         }
         _ => (),
      }
      buf
   }
}

/// Writing half of the driver channel. Commands are serialized through one lock.
pub struct Driver {
   writer: std::sync::Mutex<Box<dyn Write + Send>>,
   cancel: tokio_util::sync::CancellationToken,
}

impl Driver {
   pub fn new(writer: Box<dyn Write + Send>, cancel: tokio_util::sync::CancellationToken) -> Self {
      Self { writer: std::sync::Mutex::new(writer), cancel }
   }

   /// Opens the device (or FIFO) at `path`, returning the command writer and a separate reader
   pub fn open(path: &std::path::Path, cancel: tokio_util::sync::CancellationToken) -> Result<(Self, std::fs::File)> {
      let file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
      let reader = file.try_clone()?;
      Ok((Self::new(Box::new(file), cancel), reader))
   }

   pub fn send(&self, command: &Command) -> Result<()> {
      let mut writer = self.writer.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
      writer.write_all(&command.encode())?;
      writer.flush()?;
      Ok(())
   }

   fn send_logged(&self, command: &Command) {
      if self.cancel.is_cancelled() {
         return;
      }
      if let Err(err) = self.send(command) {
         tracing::error!("Failed to send command {:?}: {}", command.opcode(), err);
      }
   }

   /// Tells the driver to stop filtering. Never waits on the writer lock, so it is usable from a panic hook.
   pub fn shutdown_now(&self) {
      match self.writer.try_lock() {
         Ok(mut writer) => {
            let _ = writer.write_all(&Command::Shutdown.encode()).and_then(|_| writer.flush());
         }
         Err(_) => eprintln!("Driver writer busy, unable to send shutdown"),
      }
   }

   /// Asks for bandwidth stats every 100 ms until cancelled
   pub async fn poll_bandwidth(self: std::sync::Arc<Self>) {
      let mut interval = tokio::time::interval(BANDWIDTH_POLL_INTERVAL);
      interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

      loop {
         tokio::select! {
            _ = self.cancel.cancelled() => break,
            _ = interval.tick() => self.send_logged(&Command::BandwidthStats),
         }
      }
   }
}

impl crate::engine::VerdictSink for Driver {
   fn send_verdict(&self, verdict_id: u64, verdict: Verdict) {
      self.send_logged(&Command::Verdict { id: verdict_id, verdict });
   }

   fn update_verdict(&self, connection: &crate::connection::Connection) {
      let command = Command::Update {
         protocol: connection.protocol,
         local_ip: connection.local_ip,
         local_port: connection.local_port,
         remote_ip: connection.remote_ip,
         remote_port: connection.remote_port,
         verdict: connection.verdict,
      };
      tracing::debug!("SendUpdate: {:?}", command);
      self.send_logged(&command);
   }
}

fn log_driver_line(severity: u8, line: &str) {
   match severity {
      0 | 1 => tracing::trace!("LogLine: {}", line),
      2 => tracing::debug!("LogLine: {}", line),
      3 => tracing::info!("LogLine: {}", line),
      4 => tracing::warn!("LogLine: {}", line),
      _ => tracing::error!("LogLine: {} : {}", severity, line),
   }
}

/// Reads frames until the stream ends or cancellation, feeding the engine's queues. Blocking.
pub fn read_loop<R: Read>(
   mut reader: R,
   engine: std::sync::Arc<crate::engine::ConnectionEngine>,
   queues: crate::engine::EngineQueues,
   cancel: tokio_util::sync::CancellationToken,
) {
   while !cancel.is_cancelled() {
      let frame = match read_frame(&mut reader) {
         Ok(Some(frame)) => frame,
         Ok(None) => {
            tracing::info!("Driver channel closed");
            break;
         }
         Err(Error::Io(err)) => {
            tracing::error!("Error reading info: {}", err);
            break;
         }
         Err(err) => {
            let malformed = engine.stats.malformed_frames.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1;
            if crate::util::is_power_of_2(malformed) {
               tracing::warn!("{} ({} malformed frames so far)", err, malformed);
            }
            continue;
         }
      };

      let queued = match frame {
         Frame::LogLine { severity, line } => {
            log_driver_line(severity, &line);
            Ok(())
         }
         Frame::Connection(event) => {
            // the PID check wants the newest table
            engine.refresh_tables();
            queues.connections.send(event).map_err(|err| err.to_string())
         }
         Frame::ConnectionEnd(event) => queues.ends.send(event).map_err(|err| err.to_string()),
         Frame::BandwidthStats(stats) => queues.bandwidth.send(stats).map_err(|err| err.to_string()),
      };

      if let Err(err) = queued {
         tracing::error!("Engine queue closed: {}", err);
         break;
      }
   }
}

/// Starts the reader thread and the bandwidth poll
pub fn start<R: Read + Send + 'static>(
   driver: std::sync::Arc<Driver>,
   reader: R,
   engine: std::sync::Arc<crate::engine::ConnectionEngine>,
   queues: crate::engine::EngineQueues,
   cancel: tokio_util::sync::CancellationToken,
) -> Result<()> {
   std::thread::Builder::new()
      .name("driver-reader".to_string())
      .spawn(move || read_loop(reader, engine, queues, cancel))?;

   tokio::spawn(driver.poll_bandwidth());
   Ok(())
}
