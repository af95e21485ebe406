//! The cleaner's in-memory key -> last-known-offset map (spec component
//! C1a).
//!
//! Storage is proportional to a fixed slot count rather than to the number
//! or size of keys observed: each slot holds a hash of a key plus the
//! offset it was last seen at, never the key bytes themselves. This bounds
//! memory and lets the cleaner answer "how many dirty records can I
//! deduplicate in one pass" from configuration alone, at the cost of
//! occasional hash collisions silently overwriting an unrelated key's
//! entry -- see `DESIGN.md` for why that tradeoff is kept rather than
//! "fixed" with full-key storage.

use siphasher::sip::SipHasher13;
use std::hash::Hasher;

/// Fixed key used to seed the key hash. Not meant to resist adversarial
/// inputs -- the map's consumer (the cleaner) already trusts the data it is
/// compacting -- only to spread hash values evenly across slots.
const HASH_KEY: (u64, u64) = (0x5f3a_cafe_f00d_babe, 0xdead_beef_1234_5678);

/// Sentinel returned by [`OffsetMap::get`] when the key has not been seen.
pub const SENTINEL: u64 = u64::MAX;

#[derive(Clone, Copy)]
struct Slot {
    hash: u64,
    offset: u64,
}

/// A bounded, hash-only, open-addressed map from message key to the last
/// offset that key was seen at.
pub struct OffsetMap {
    slots: Vec<Option<Slot>>,
    len: usize,
    load_factor: f64,
}

impl OffsetMap {
    /// `capacity_bytes` is the memory budget; each slot costs 16 bytes (an
    /// 8-byte hash plus an 8-byte offset), matching `dedupeBufferSize` from
    /// the spec's configuration surface. `load_factor` caps fill (e.g. 0.9)
    /// before the map reports [`OffsetMap::is_full`].
    pub fn new(capacity_bytes: usize, load_factor: f64) -> Self {
        let num_slots = (capacity_bytes / 16).max(1);
        Self {
            slots: vec![None; num_slots],
            len: 0,
            load_factor,
        }
    }

    pub fn slots(&self) -> usize {
        self.slots.len()
    }

    pub fn size(&self) -> usize {
        self.len
    }

    pub fn utilization(&self) -> f64 {
        self.len as f64 / self.slots.len() as f64
    }

    /// True once utilization has reached the configured load factor; the
    /// cleaner stops feeding this map further keys once it's full.
    pub fn is_full(&self) -> bool {
        self.utilization() >= self.load_factor
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
        self.len = 0;
    }

    /// Record that `key` was last seen at `offset`.
    ///
    /// If the map is already full this is a no-op and the caller (the
    /// cleaner) is expected to have checked [`OffsetMap::is_full`] first and
    /// stopped indexing further segments.
    pub fn put(&mut self, key: &[u8], offset: u64) {
        if self.is_full() {
            return;
        }
        let hash = Self::hash_key(key);
        let num_slots = self.slots.len();
        let home = (hash % num_slots as u64) as usize;

        for step in 0..num_slots {
            let idx = (home + step) % num_slots;
            match &mut self.slots[idx] {
                None => {
                    self.slots[idx] = Some(Slot { hash, offset });
                    self.len += 1;
                    return;
                }
                Some(slot) if slot.hash == hash => {
                    // Either the same key, or a hash collision with a
                    // different key: per spec, we overwrite either way.
                    slot.offset = offset;
                    return;
                }
                Some(_) => continue,
            }
        }
        // Every slot probed and occupied by a different hash: the map is
        // saturated despite `is_full`'s threshold not having tripped yet
        // (possible with a load factor close to 1.0). Drop the write.
    }

    /// Look up the last-known offset for `key`, or [`SENTINEL`] if unseen.
    pub fn get(&self, key: &[u8]) -> u64 {
        let hash = Self::hash_key(key);
        let num_slots = self.slots.len();
        let home = (hash % num_slots as u64) as usize;

        for step in 0..num_slots {
            let idx = (home + step) % num_slots;
            match &self.slots[idx] {
                None => return SENTINEL,
                Some(slot) if slot.hash == hash => return slot.offset,
                Some(_) => continue,
            }
        }
        SENTINEL
    }

    fn hash_key(key: &[u8]) -> u64 {
        let mut hasher = SipHasher13::new_with_keys(HASH_KEY.0, HASH_KEY.1);
        hasher.write(key);
        hasher.finish()
    }
}
