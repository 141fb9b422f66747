use crate::error::RingError;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Lower bound on rehash steps before falling back to a clockwise walk.
const MIN_REHASH_ATTEMPTS: usize = 8;

pub(crate) fn fnv1a64(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut h = OFFSET;
    for &b in bytes {
        h ^= b as u64;
        h = h.wrapping_mul(PRIME);
    }
    h
}

/// Hash of the minimal big-endian byte representation of `value`.
pub(crate) fn hash_u64(value: u64) -> u64 {
    let bytes = value.to_be_bytes();
    let skip = (value.leading_zeros() / 8) as usize;
    fnv1a64(&bytes[skip..])
}

pub(crate) fn hash_key(key: i64) -> u64 {
    hash_u64(key.unsigned_abs())
}

pub(crate) fn hash_address(address: &str) -> u64 {
    fnv1a64(address.as_bytes())
}

#[derive(Debug)]
pub struct ProxySlot {
    address: String,
    evicted: AtomicBool,
}

impl ProxySlot {
    fn new(address: String) -> Self {
        Self {
            address,
            evicted: AtomicBool::new(false),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEntry {
    pub hash: u64,
    /// `None` while the slot is evicted.
    pub address: Option<String>,
}

/// One immutable ring topology. Only the per-slot eviction flags change
/// after construction.
#[derive(Debug, Default)]
struct RingSnapshot {
    entries: HashMap<u64, ProxySlot>,
    hashes: Vec<u64>,
    live: AtomicUsize,
}

impl RingSnapshot {
    fn build<I>(addresses: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let mut entries = HashMap::new();
        for address in addresses {
            entries
                .entry(hash_address(&address))
                .or_insert_with(|| ProxySlot::new(address));
        }
        let mut hashes: Vec<u64> = entries.keys().copied().collect();
        hashes.sort_unstable();
        let live = AtomicUsize::new(hashes.len());
        Self {
            entries,
            hashes,
            live,
        }
    }

    /// Index of the first hash >= target, wrapping past the end.
    fn index_for(&self, target: u64) -> usize {
        let index = self.hashes.partition_point(|h| *h < target);
        if index == self.hashes.len() {
            0
        } else {
            index
        }
    }

    fn slot_at(&self, index: usize) -> Option<(u64, &ProxySlot)> {
        let hash = *self.hashes.get(index)?;
        self.entries.get(&hash).map(|slot| (hash, slot))
    }

    fn locate(&self, key: i64) -> Result<(u64, &ProxySlot), RingError> {
        if self.hashes.is_empty() || self.live.load(Ordering::Acquire) == 0 {
            return Err(RingError::Empty);
        }

        let mut target = hash_key(key);
        let budget = self.hashes.len().max(MIN_REHASH_ATTEMPTS);
        for _ in 0..budget {
            if let Some((hash, slot)) = self.slot_at(self.index_for(target)) {
                if !slot.is_evicted() {
                    return Ok((hash, slot));
                }
            }
            target = hash_u64(target);
        }

        // Rehash chain kept landing on evicted slots; walk clockwise instead.
        let start = self.index_for(target);
        let len = self.hashes.len();
        for offset in 0..len {
            if let Some((hash, slot)) = self.slot_at((start + offset) % len) {
                if !slot.is_evicted() {
                    return Ok((hash, slot));
                }
            }
        }
        Err(RingError::Empty)
    }

    fn evict_slot(&self, slot: &ProxySlot) -> bool {
        let flipped = slot
            .evicted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if flipped {
            self.live.fetch_sub(1, Ordering::AcqRel);
        }
        flipped
    }
}

/// Consistent-hash ring of egress proxies.
///
/// Reloads swap the whole topology at once; eviction only flips a flag on
/// one slot, so lookups never wait on each other.
#[derive(Debug, Default)]
pub struct ProxyRing {
    snapshot: RwLock<Arc<RingSnapshot>>,
}

impl ProxyRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_addresses<I>(addresses: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let ring = Self::new();
        ring.replace(addresses);
        ring
    }

    fn current(&self) -> Arc<RingSnapshot> {
        self.snapshot.read().clone()
    }

    /// Installs a fresh topology built from `addresses`; returns its size.
    pub fn replace<I>(&self, addresses: I) -> usize
    where
        I: IntoIterator<Item = String>,
    {
        let next = Arc::new(RingSnapshot::build(addresses));
        let size = next.hashes.len();
        *self.snapshot.write() = next;
        size
    }

    pub fn resolve(&self, key: i64) -> Result<String, RingError> {
        let snapshot = self.current();
        snapshot
            .locate(key)
            .map(|(_, slot)| slot.address().to_string())
    }

    /// Empties the slot `key` currently resolves to and returns its address.
    /// The slot keeps its position so other keys keep their routes.
    pub fn evict(&self, key: i64) -> Option<String> {
        let snapshot = self.current();
        let (hash, slot) = snapshot.locate(key).ok()?;
        if snapshot.evict_slot(slot) {
            tracing::debug!(
                "[ProxyRing] Evicted proxy {} (slot {:016x}) for key {}",
                slot.address(),
                hash,
                key
            );
        }
        Some(slot.address().to_string())
    }

    /// Evicts a proxy by address, if it belongs to the current topology.
    pub fn evict_address(&self, address: &str) -> bool {
        let snapshot = self.current();
        match snapshot.entries.get(&hash_address(address)) {
            Some(slot) if slot.address() == address => snapshot.evict_slot(slot),
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.current().hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn live_count(&self) -> usize {
        self.current().live.load(Ordering::Acquire)
    }

    /// Ring contents in hash order.
    pub fn entries(&self) -> Vec<ProxyEntry> {
        let snapshot = self.current();
        snapshot
            .hashes
            .iter()
            .filter_map(|hash| {
                snapshot.entries.get(hash).map(|slot| ProxyEntry {
                    hash: *hash,
                    address: (!slot.is_evicted()).then(|| slot.address().to_string()),
                })
            })
            .collect()
    }
}
