//! Compact hash tables.
//!
//! A read-only table from a name hash to a `u32` value, laid out as
//! little-endian `u32` words:
//!
//! ```text
//! bucket_count | entry_count | bucket_start[bucket_count + 1] | (hash, value)[entry_count]
//! ```
//!
//! Entries of bucket `b` occupy `bucket_start[b]..bucket_start[b + 1]`. The table
//! stores hashes only; a lookup yields candidate values and the caller compares
//! the key it finds behind each one.

use crate::LoadError;

const ENTRIES_PER_BUCKET: usize = 4;

/// First four bytes of the BLAKE3 digest of `name`, little-endian.
pub fn name_hash(name: &str) -> u32 {
    let digest = blake3::hash(name.as_bytes());
    let b = digest.as_bytes();
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

#[derive(Debug, Default)]
pub struct CompactHashtableBuilder {
    entries: Vec<(u32, u32)>,
}

impl CompactHashtableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: &str, value: u32) {
        self.entries.push((name_hash(name), value));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn build(mut self) -> Vec<u8> {
        let buckets = self.entries.len().div_ceil(ENTRIES_PER_BUCKET).max(1);
        // Stable: equal hashes keep insertion order.
        self.entries.sort_by_key(|&(hash, _)| hash as usize % buckets);

        let mut words = Vec::with_capacity(2 + buckets + 1 + 2 * self.entries.len());
        words.push(buckets as u32);
        words.push(self.entries.len() as u32);
        let mut start = 0u32;
        for b in 0..buckets {
            words.push(start);
            start += self
                .entries
                .iter()
                .filter(|&&(hash, _)| hash as usize % buckets == b)
                .count() as u32;
        }
        words.push(start);
        for (hash, value) in &self.entries {
            words.push(*hash);
            words.push(*value);
        }
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }
}

/// Zero-copy view of a built table.
#[derive(Debug, Clone, Copy)]
pub struct CompactHashtable<'a> {
    bytes: &'a [u8],
    buckets: usize,
    entries: usize,
}

impl<'a> CompactHashtable<'a> {
    pub fn new(bytes: &'a [u8]) -> Result<Self, LoadError> {
        let bad = |what: &str| LoadError::BadSection(format!("compact table: {what}"));
        if bytes.len() < 8 {
            return Err(bad("too short"));
        }
        let buckets = word(bytes, 0) as usize;
        let entries = word(bytes, 1) as usize;
        if buckets == 0 {
            return Err(bad("no buckets"));
        }
        let needed = 4 * (2 + buckets + 1) + 8 * entries;
        if bytes.len() < needed {
            return Err(bad("truncated"));
        }
        let table = Self {
            bytes,
            buckets,
            entries,
        };
        if table.bucket_start(buckets) as usize != entries {
            return Err(bad("bucket offsets do not cover the entries"));
        }
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    fn bucket_start(&self, b: usize) -> u32 {
        word(self.bytes, 2 + b)
    }

    fn entry(&self, i: usize) -> (u32, u32) {
        let at = 2 + self.buckets + 1 + 2 * i;
        (word(self.bytes, at), word(self.bytes, at + 1))
    }

    /// Values whose key hashes like `name`.
    pub fn lookup(&self, name: &str) -> impl Iterator<Item = u32> + 'a {
        let hash = name_hash(name);
        let b = hash as usize % self.buckets;
        let (start, end) = (self.bucket_start(b) as usize, self.bucket_start(b + 1) as usize);
        let this = *self;
        (start..end.min(this.entries))
            .map(move |i| this.entry(i))
            .filter(move |&(h, _)| h == hash)
            .map(|(_, v)| v)
    }

    /// Every value, bucket by bucket.
    pub fn values(&self) -> impl Iterator<Item = u32> + 'a {
        let this = *self;
        (0..this.entries).map(move |i| this.entry(i).1)
    }
}

fn word(bytes: &[u8], index: usize) -> u32 {
    let at = index * 4;
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_finds_every_key() {
        let mut b = CompactHashtableBuilder::new();
        let names: Vec<String> = (0..50).map(|i| format!("app/C{i}")).collect();
        for (i, n) in names.iter().enumerate() {
            b.add(n, i as u32);
        }
        let bytes = b.build();
        let t = CompactHashtable::new(&bytes).unwrap();
        assert_eq!(t.len(), 50);
        for (i, n) in names.iter().enumerate() {
            assert!(t.lookup(n).any(|v| v == i as u32), "{n}");
        }
        assert_eq!(t.lookup("app/Missing").count(), 0);
        let mut all: Vec<u32> = t.values().collect();
        all.sort_unstable();
        assert_eq!(all, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_duplicate_keys_keep_insertion_order() {
        let mut b = CompactHashtableBuilder::new();
        b.add("app/Main", 7);
        b.add("app/Main", 3);
        let bytes = b.build();
        let t = CompactHashtable::new(&bytes).unwrap();
        assert_eq!(t.lookup("app/Main").collect::<Vec<_>>(), vec![7, 3]);
    }

    #[test]
    fn test_empty_table_and_corruption() {
        let bytes = CompactHashtableBuilder::new().build();
        let t = CompactHashtable::new(&bytes).unwrap();
        assert!(t.is_empty());
        assert_eq!(t.lookup("x").count(), 0);

        assert!(CompactHashtable::new(&bytes[..4]).is_err());
        let mut b = CompactHashtableBuilder::new();
        b.add("a", 1);
        let bytes = b.build();
        assert!(CompactHashtable::new(&bytes[..bytes.len() - 4]).is_err());
    }

    #[test]
    fn test_name_hash_is_stable() {
        assert_eq!(name_hash("java/lang/Object"), name_hash("java/lang/Object"));
        assert_ne!(name_hash("java/lang/Object"), name_hash("java/lang/String"));
    }
}
