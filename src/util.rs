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

/// Gets duration since UNIX_EPOCH in seconds
#[inline]
pub fn get_unix_ts_secs() -> u64 {
   std::time::SystemTime::now().duration_since(std::time::SystemTime::UNIX_EPOCH).unwrap_or_default().as_secs()
}

#[inline]
pub fn is_power_of_2(num: u64) -> bool {
   num != 0 && num & (num - 1) == 0
}

/// Stable 64-bit hash, used for tuple keys in nohash maps
#[inline(always)]
pub fn hash64(bytes: &[u8]) -> u64 {
   xxhash_rust::xxh3::xxh3_64(bytes)
}

/// Expands `%VAR%`, `${VAR}` and `$VAR` references. Unknown variables are left as written.
pub fn expand_env_vars(input: &str) -> String {
   let mut output = String::with_capacity(input.len());
   let mut rest = input;

   while let Some(start) = rest.find(['%', '$']) {
      output.push_str(&rest[..start]);
      let marker = &rest[start..];

      let (name, consumed) = if let Some(after) = marker.strip_prefix('%') {
         match after.find('%') {
            Some(end) if end > 0 && is_env_var_name(&after[..end]) => (&after[..end], end + 2),
            _ => ("", 0),
         }
      } else if let Some(after) = marker.strip_prefix("${") {
         match after.find('}') {
            Some(end) if end > 0 => (&after[..end], end + 3),
            _ => ("", 0),
         }
      } else {
         let after = &marker[1..];
         let end = after.find(|c: char| !(c.is_ascii_alphanumeric() || c == '_')).unwrap_or(after.len());
         (&after[..end], if end > 0 { end + 1 } else { 0 })
      };

      match std::env::var(name).ok().filter(|_| consumed > 0) {
         Some(value) => {
            output.push_str(&value);
            rest = &marker[consumed..];
         }
         None => {
            output.push_str(&marker[..1]);
            rest = &marker[1..];
         }
      }
   }

   output.push_str(rest);
   output
}

#[inline]
fn is_env_var_name(name: &str) -> bool {
   name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '(' || c == ')')
}

/// Replaces a leading home directory with `$HOME` so generated fingerprints stay valid across users
pub fn contract_env_vars(path: &str) -> String {
   if let Ok(home) = std::env::var("HOME") {
      let home = home.trim_end_matches('/');
      if !home.is_empty() {
         if path == home {
            return "$HOME".to_string();
         }
         if let Some(rest) = path.strip_prefix(home).filter(|rest| rest.starts_with('/')) {
            return format!("$HOME{rest}");
         }
      }
   }
   path.to_string()
}

pub fn write_to_file_bincode<T>(data: &T, absolute_path: &std::path::Path) -> crate::error::Result<()>
where
   T: serde::Serialize,
{
   use std::io::Write;

   if let Some(parent) = absolute_path.parent() {
      std::fs::create_dir_all(parent)?;
   }

   let serialized_and_compressed_bytes = serialize_then_compress(data)?;
   let f = std::fs::OpenOptions::new().write(true).create(true).truncate(true).open(absolute_path)?;
   let mut writer = std::io::BufWriter::new(f);
   writer.write_all(serialized_and_compressed_bytes.as_slice())?;
   writer.flush()?;

   Ok(())
}

pub fn read_from_file_bincode<T>(absolute_path: &std::path::Path) -> Option<T>
where
   T: serde::de::DeserializeOwned,
{
   use std::io::Read;

   let mut f = std::fs::File::open(absolute_path).ok()?;
   let file_len = f.metadata().ok()?.len();
   let mut bytes = Vec::with_capacity(file_len as usize + 1);
   f.read_to_end(&mut bytes).ok()?;
   decompress_then_deserialize(bytes.as_slice())
}

#[inline]
fn serialize_then_compress<T>(serializable: &T) -> crate::error::Result<Vec<u8>>
where
   T: serde::Serialize,
{
   use std::io::Write;

   let bincode_bytes = bincode::serialize::<T>(serializable)?;
   let mut compressor = flate2::write::ZlibEncoder::new(Vec::with_capacity(bincode_bytes.len()), flate2::Compression::fast());
   compressor.write_all(&bincode_bytes)?;
   Ok(compressor.finish()?)
}

#[inline]
fn decompress_then_deserialize<T>(deserializable: &[u8]) -> Option<T>
where
   T: serde::de::DeserializeOwned,
{
   use std::io::Read;

   let mut decompressed_bytes = Vec::<u8>::new();
   flate2::read::ZlibDecoder::new(deserializable).read_to_end(&mut decompressed_bytes).ok()?;
   bincode::deserialize::<T>(&decompressed_bytes).ok()
}

#[test]
pub fn is_power_of_2_test() {
   for shift in 0..64 {
      assert!(is_power_of_2(1u64 << shift));
   }
   assert!(!is_power_of_2(0));
   assert!(!is_power_of_2(3));
   assert!(!is_power_of_2(1000));
}

#[test]
fn expand_env_vars_test() {
   std::env::set_var("FAF_UTIL_TEST_DIR", "/opt/faf");
   assert_eq!(expand_env_vars("%FAF_UTIL_TEST_DIR%/bin/app"), "/opt/faf/bin/app");
   assert_eq!(expand_env_vars("${FAF_UTIL_TEST_DIR}/bin"), "/opt/faf/bin");
   assert_eq!(expand_env_vars("$FAF_UTIL_TEST_DIR/bin"), "/opt/faf/bin");
   assert_eq!(expand_env_vars("/usr/bin/$FAF_UTIL_TEST_MISSING"), "/usr/bin/$FAF_UTIL_TEST_MISSING");
   assert_eq!(expand_env_vars("100% sure"), "100% sure");
   assert_eq!(expand_env_vars("plain"), "plain");
}

#[test]
fn contract_env_vars_test() {
   if let Ok(home) = std::env::var("HOME") {
      let home = home.trim_end_matches('/').to_string();
      if !home.is_empty() {
         let contracted = contract_env_vars(&format!("{home}/bin/app"));
         assert_eq!(contracted, "$HOME/bin/app");
         assert_eq!(expand_env_vars(&contracted), format!("{home}/bin/app"));
      }
   }
   assert_eq!(contract_env_vars("/usr/bin/curl"), "/usr/bin/curl");
}

#[test]
fn bincode_file_round_trip() {
   let mut path = std::env::temp_dir();
   path.push(format!("faf-firewall-util-{}-{:x}", std::process::id(), fastrand::u64(..)));
   path.push("entries.bin");

   let entries = vec!["ads.example".to_string(), "tracker.example".to_string()];
   write_to_file_bincode(&entries, &path).unwrap();
   let restored: Vec<String> = read_from_file_bincode(&path).unwrap();
   assert_eq!(restored, entries);

   path.set_extension("missing");
   assert!(read_from_file_bincode::<Vec<String>>(&path).is_none());
}
