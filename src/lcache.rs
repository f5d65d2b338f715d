use crate::context::CoreStats;
use crate::cptr::{CompactPtr, CpWidth};
use crate::heap::Heap;
use crate::name::PropName;
use crate::property::PropertyRecord;
use crate::proplist::{self, PropertyIndex};

/// One direct-mapped entry: packed (object, name) identifier plus the
/// 1-based slot index of the property. `id == 0` marks an empty entry.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
struct LcacheEntry {
    id: u64,
    index: PropertyIndex,
}

/// Process-wide (object, name) → slot cache, LRU within each row.
///
/// Best-effort accelerator: correctness never depends on its contents. The
/// coherence contract is that an entry exists for a record iff the record's
/// LCACHED flag is set, and `lcache_id` then names the entry.
pub struct LookupCache {
    row_len: usize,
    row_mask: u32,
    row_shift: u32,
    width_bits: u32,
    value_mask: u32,
    entries: Box<[LcacheEntry]>,
}

impl LookupCache {
    pub fn new(rows: usize, row_len: usize, width: CpWidth) -> Self {
        debug_assert!(rows.is_power_of_two());
        debug_assert!(row_len > 0);
        debug_assert!(rows * row_len <= u16::MAX as usize + 1);
        let row_shift = width.lcache_row_shift();
        Self {
            row_len,
            row_mask: ((rows - 1) as u32) << row_shift,
            row_shift,
            width_bits: width.bits(),
            value_mask: width.value_mask(),
            entries: vec![LcacheEntry::default(); rows * row_len].into_boxed_slice(),
        }
    }

    /// Mixing the object pointer into the name lets properties of different
    /// objects with the same name spread over distinct rows.
    fn row_start(&self, object_cp: CompactPtr, name_cp: u32) -> usize {
        let row = ((name_cp ^ object_cp.raw()) & self.row_mask) >> self.row_shift;
        row as usize * self.row_len
    }

    fn entry_id(&self, object_cp: CompactPtr, name_cp: u32) -> u64 {
        debug_assert!(!object_cp.is_null());
        ((object_cp.raw() as u64) << self.width_bits) | (name_cp & self.value_mask) as u64
    }
}

/// Look up a property without touching the list. Returns the slot index and
/// a copy of the record on a verified hit.
pub fn lookup(
    heap: &Heap,
    cache: &LookupCache,
    object_cp: CompactPtr,
    name: PropName,
) -> Option<(PropertyIndex, PropertyRecord)> {
    let list_cp = proplist::list_cp_of(heap, object_cp);
    if list_cp.is_null() {
        return None;
    }
    let name_cp = name.record_name_cp() & cache.value_mask;
    let id = cache.entry_id(object_cp, name_cp);
    let start = cache.row_start(object_cp, name_cp);
    for entry in &cache.entries[start..start + cache.row_len] {
        if entry.id != id {
            continue;
        }
        debug_assert!(entry.index != proplist::INDEX_INVALID);
        let record = proplist::read_record(heap, list_cp, entry.index);
        // guards direct/indirect confusion and direct payloads that alias
        // after width masking
        if record.matches_name(name) {
            return Some((entry.index, record));
        }
    }
    None
}

/// Insert a resolved (object, name) → slot mapping, evicting the row's last
/// entry if the row is full. Marks the record LCACHED and stores the entry's
/// flat index in it.
pub fn insert(
    heap: &mut Heap,
    cache: &mut LookupCache,
    stats: &mut CoreStats,
    mru_arity: usize,
    object_cp: CompactPtr,
    name: PropName,
    index: PropertyIndex,
) {
    let name_cp = name.record_name_cp() & cache.value_mask;
    let start = cache.row_start(object_cp, name_cp);
    let mut pos = None;
    for (i, entry) in cache.entries[start..start + cache.row_len].iter().enumerate() {
        if entry.id == 0 {
            pos = Some(start + i);
            break;
        }
    }

    let slot = match pos {
        Some(slot) => slot,
        None => {
            // evict the oldest entry and shift the row toward the end
            let last = start + cache.row_len - 1;
            evict(heap, cache, stats, mru_arity, last);
            let mut i = last;
            while i > start {
                let moved = cache.entries[i - 1];
                cache.entries[i] = moved;
                if moved.id != 0 {
                    rewrite_lcache_id(heap, cache, i);
                }
                i -= 1;
            }
            start
        }
    };

    cache.entries[slot] = LcacheEntry {
        id: cache.entry_id(object_cp, name_cp),
        index,
    };

    let list_cp = proplist::list_cp_of(heap, object_cp);
    let offset = proplist::record_offset(list_cp, index);
    let mut record: PropertyRecord = heap.read(offset);
    record.set_lcached(true);
    record.lcache_id = slot as u16;
    heap.write(offset, record);
}

/// Drop the entry of an LCACHED record; clears the flag and the entry as one
/// step. The entry must exist.
pub fn invalidate(heap: &mut Heap, cache: &mut LookupCache, record_offset: usize) {
    let mut record: PropertyRecord = heap.read(record_offset);
    debug_assert!(record.is_lcached());
    let slot = record.lcache_id as usize;
    debug_assert!(slot < cache.entries.len());
    debug_assert!(cache.entries[slot].id != 0);
    cache.entries[slot] = LcacheEntry::default();
    record.set_lcached(false);
    record.lcache_id = 0;
    heap.write(record_offset, record);
}

fn evict(
    heap: &mut Heap,
    cache: &mut LookupCache,
    stats: &mut CoreStats,
    mru_arity: usize,
    slot: usize,
) {
    let entry = cache.entries[slot];
    debug_assert!(entry.id != 0);
    let object_cp = CompactPtr::from_raw((entry.id >> cache.width_bits) as u32);
    let list_cp = proplist::list_cp_of(heap, object_cp);
    let offset = proplist::record_offset(list_cp, entry.index);
    let mut record: PropertyRecord = heap.read(offset);
    debug_assert!(record.is_lcached());
    record.set_lcached(false);
    record.lcache_id = 0;
    heap.write(offset, record);
    // hand the slot index back to the list's MRU hints
    proplist::mru_note(heap, list_cp, entry.index, mru_arity);
    cache.entries[slot] = LcacheEntry::default();
    stats.lcache_evictions += 1;
    tracing::trace!(object = object_cp.raw(), index = entry.index, "lcache entry evicted");
}

/// Whether the record's `lcache_id` names an entry that really maps this
/// (object, slot) pair. Consistency-sweep helper.
pub(crate) fn entry_matches(
    cache: &LookupCache,
    record: &PropertyRecord,
    object_cp: CompactPtr,
    index: PropertyIndex,
) -> bool {
    let slot = record.lcache_id as usize;
    if slot >= cache.entries.len() {
        return false;
    }
    let entry = cache.entries[slot];
    entry.index == index && (entry.id >> cache.width_bits) as u32 == object_cp.raw()
}

fn rewrite_lcache_id(heap: &mut Heap, cache: &LookupCache, slot: usize) {
    let entry = cache.entries[slot];
    let object_cp = CompactPtr::from_raw((entry.id >> cache.width_bits) as u32);
    let list_cp = proplist::list_cp_of(heap, object_cp);
    let offset = proplist::record_offset(list_cp, entry.index);
    let mut record: PropertyRecord = heap.read(offset);
    debug_assert!(record.is_lcached());
    record.lcache_id = slot as u16;
    heap.write(offset, record);
}
