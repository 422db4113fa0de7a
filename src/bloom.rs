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

/// Entries remembered as proven false positives before the set is cleared wholesale
pub const FALSE_POSITIVE_CACHE_SIZE: usize = 1000;

/// Bloom filter over UTF-8 strings. Probe positions come from SHA-256 and SHA-512 digests of the item, combined as
/// `h1 ^ rotl(h2, i)` for each of the `k` probes. There are no false negatives.
pub struct BloomFilter {
   bits: Vec<u64>,
   bit_count: u64,
   hash_count: u32,
   inserted: usize,
   false_positives: dashmap::DashSet<String, ahash::RandomState>,
}

impl BloomFilter {
   pub fn new(capacity: usize, false_positive_rate: f64) -> Self {
      let capacity = capacity.max(1) as f64;
      let ln2 = std::f64::consts::LN_2;
      let bit_count = (-capacity * false_positive_rate.ln() / (ln2 * ln2)).ceil().max(64.0) as u64;
      let hash_count = ((bit_count as f64 / capacity) * ln2).round().max(1.0) as u32;
      let words = bit_count.div_ceil(64) as usize;

      Self {
         bits: vec![0; words],
         bit_count,
         hash_count,
         inserted: 0,
         false_positives: dashmap::DashSet::with_hasher(ahash::RandomState::new()),
      }
   }

   #[inline]
   pub fn bit_count(&self) -> u64 {
      self.bit_count
   }

   #[inline]
   pub fn hash_count(&self) -> u32 {
      self.hash_count
   }

   #[inline]
   pub fn len(&self) -> usize {
      self.inserted
   }

   #[inline]
   pub fn is_empty(&self) -> bool {
      self.inserted == 0
   }

   pub fn add(&mut self, item: &str) {
      for index in probe_indexes(self.bit_count, self.hash_count, item) {
         self.bits[(index / 64) as usize] |= 1u64 << (index % 64);
      }
      self.inserted += 1;
   }

   pub fn might_contain(&self, item: &str) -> bool {
      let all_set = probe_indexes(self.bit_count, self.hash_count, item).all(|index| self.bits[(index / 64) as usize] & (1u64 << (index % 64)) != 0);
      all_set && !self.false_positives.contains(item)
   }

   /// Records an item a consumer proved to be a spurious hit. The cache is cleared once it holds
   /// `FALSE_POSITIVE_CACHE_SIZE` entries.
   pub fn add_false_positive(&self, item: &str) {
      if self.false_positives.len() >= FALSE_POSITIVE_CACHE_SIZE {
         self.false_positives.clear();
      }
      self.false_positives.insert(item.to_owned());
   }

   /// Estimated number of distinct items, derived from the fraction of set bits
   pub fn estimate_size(&self) -> f64 {
      let set_bits: u64 = self.bits.iter().map(|word| word.count_ones() as u64).sum();
      let m = self.bit_count as f64;
      let k = self.hash_count as f64;
      if set_bits as f64 >= m {
         return f64::INFINITY;
      }
      -(m / k) * (1.0 - set_bits as f64 / m).ln()
   }

   /// Expected false positive rate at the current fill level
   pub fn estimate_false_positive_rate(&self) -> f64 {
      let m = self.bit_count as f64;
      let k = self.hash_count as f64;
      let n = self.inserted as f64;
      (1.0 - (-k * n / m).exp()).powf(k)
   }

}

/// Bit positions of `item`. Owns its digests, so callers may mutate the filter while iterating.
fn probe_indexes(bit_count: u64, hash_count: u32, item: &str) -> impl Iterator<Item = u64> {
   use sha2::Digest;

   let sha256 = sha2::Sha256::digest(item.as_bytes());
   let sha512 = sha2::Sha512::digest(item.as_bytes());

   (0..hash_count).map(move |i| {
      let h1 = read_u32_le(&sha256, (i as usize * 4) % (32 - 4));
      let h2 = read_u32_le(&sha512, (i as usize * 4) % (64 - 4));
      (h1 ^ h2.rotate_left(i % 32)) as u64 % bit_count
   })
}

#[inline(always)]
fn read_u32_le(bytes: &[u8], offset: usize) -> u32 {
   u32::from_le_bytes([bytes[offset], bytes[offset + 1], bytes[offset + 2], bytes[offset + 3]])
}
