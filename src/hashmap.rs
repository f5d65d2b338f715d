use crate::context::{HashmapAllocState, JSContext};
use crate::cptr::CompactPtr;
use crate::heap::Heap;
use crate::name::{equal_nondirect, name_hash, NameType, PropName};
use crate::proplist::{self, PropertyIndex, PropertyListHeader};
use core::mem::size_of;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Accelerator header; `bucket_count` cells of `PropertyIndex` follow.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct HashmapHeader {
    pub bucket_count: u16,
    pub property_count: u16,
    /// Cells still in the never-used state; only these terminate a probe.
    pub null_count: u16,
    /// Tombstoned cells.
    pub unused_count: u16,
}

pub const HASHMAP_HEADER_SIZE: usize = size_of::<HashmapHeader>();
const _: () = assert!(HASHMAP_HEADER_SIZE == 8);

/// Never-used cell. Doubles as the invalid 1-based slot index, so a zeroed
/// table starts fully clean.
pub const CELL_CLEAN: u16 = 0;
/// Tombstone: a probe must keep going past it.
pub const CELL_DIRTY: u16 = 0xffff;

/// Odd probe steps, all coprime with the power-of-two table size, so every
/// probe sequence visits each cell exactly once.
const PROBE_STEPS: [u16; 8] = [3, 5, 7, 11, 13, 17, 19, 23];

const MIN_BUCKET_COUNT: u16 = 8;
const MAX_BUCKET_COUNT: u16 = 1 << 15;

/// Outcome of a hashmap delete. A missing cell still reports `HasHashmap`;
/// callers must not rely on the found/not-found distinction.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HashmapDeleteStatus {
    HasHashmap,
    /// Tombstones crossed the rebuild threshold; the caller frees and
    /// re-creates the map.
    Recreate,
}

fn total_size(bucket_count: u16) -> usize {
    HASHMAP_HEADER_SIZE + bucket_count as usize * size_of::<PropertyIndex>()
}

fn cell_offset(map_cp: CompactPtr, cell: u32) -> usize {
    map_cp.offset() + HASHMAP_HEADER_SIZE + cell as usize * size_of::<PropertyIndex>()
}

fn is_free_cell(cell: u16) -> bool {
    cell == CELL_CLEAN || cell == CELL_DIRTY
}

fn probe_step(hash: u32) -> u32 {
    PROBE_STEPS[(hash & (PROBE_STEPS.len() as u32 - 1)) as usize] as u32
}

/// Attach a hashmap to the list. A no-op while hashmap allocation is off,
/// while the list is below half the attach threshold, or when the optional
/// allocation fails; the list keeps working through its slow paths.
pub fn create(ctx: &mut JSContext, list_cp: CompactPtr) {
    let mut list: PropertyListHeader = ctx.heap.read(list_cp.offset());
    debug_assert!(CompactPtr::from_raw(list.hashmap_cp).is_null());

    if ctx.hashmap_alloc_state != HashmapAllocState::On {
        return;
    }
    let count = list.count;
    if count < ctx.config.minimum_hashmap_size / 2 {
        return;
    }

    // smallest power of two leaving at least one third of the cells free
    let needed = (count as u32 * 3).div_ceil(2);
    let bucket_count = needed.next_power_of_two().max(MIN_BUCKET_COUNT as u32);
    if bucket_count > MAX_BUCKET_COUNT as u32 || count as u32 >= bucket_count {
        return;
    }
    let bucket_count = bucket_count as u16;

    let Some(map_cp) = ctx.heap.alloc_block_null_on_error(total_size(bucket_count)) else {
        return;
    };
    ctx.heap
        .bytes_mut(map_cp.offset(), total_size(bucket_count))
        .fill(0);
    let mut header = HashmapHeader {
        bucket_count,
        property_count: 0,
        null_count: bucket_count,
        unused_count: 0,
    };

    for index in 1..=count {
        let record = proplist::read_record(&ctx.heap, list_cp, index);
        if record.is_deleted() || record.property_type() == crate::property::PROPERTY_TYPE_SPECIAL {
            continue;
        }
        let hash = name_hash(&ctx.heap, record.name());
        probe_insert(&mut ctx.heap, map_cp, &mut header, hash, index);
    }
    ctx.heap.write(map_cp.offset(), header);

    list.hashmap_cp = map_cp.raw();
    ctx.heap.write(list_cp.offset(), list);

    ctx.stats.hashmaps_created += 1;
    tracing::trace!(list = list_cp.raw(), buckets = bucket_count, "property hashmap created");
}

/// Detach and free the hashmap; the list falls back to MRU mode.
pub fn free(heap: &mut Heap, list_cp: CompactPtr) {
    let mut list: PropertyListHeader = heap.read(list_cp.offset());
    let map_cp = CompactPtr::from_raw(list.hashmap_cp);
    debug_assert!(!map_cp.is_null());
    let header: HashmapHeader = heap.read(map_cp.offset());
    heap.free_block(map_cp, total_size(header.bucket_count));

    list.hashmap_cp = CompactPtr::NULL.raw();
    // restore the MRU hints to the always-valid first slot
    list.mru = [1; proplist::MRU_SLOTS];
    heap.write(list_cp.offset(), list);
}

/// Insert a freshly appended slot. Rebuilds first when too few clean cells
/// remain, which re-walks the whole list (the new slot included).
pub fn insert(ctx: &mut JSContext, list_cp: CompactPtr, name: PropName, index: PropertyIndex) {
    let list: PropertyListHeader = ctx.heap.read(list_cp.offset());
    let map_cp = CompactPtr::from_raw(list.hashmap_cp);
    debug_assert!(!map_cp.is_null());
    let mut header: HashmapHeader = ctx.heap.read(map_cp.offset());

    if header.null_count < header.bucket_count / 8 {
        free(&mut ctx.heap, list_cp);
        create(ctx, list_cp);
        ctx.stats.hashmaps_rebuilt += 1;
        tracing::trace!(list = list_cp.raw(), "property hashmap rebuilt on insert");
        return;
    }

    let hash = name_hash(&ctx.heap, name);
    probe_insert(&mut ctx.heap, map_cp, &mut header, hash, index);
    ctx.heap.write(map_cp.offset(), header);
}

fn probe_insert(
    heap: &mut Heap,
    map_cp: CompactPtr,
    header: &mut HashmapHeader,
    hash: u32,
    index: PropertyIndex,
) {
    debug_assert!(!is_free_cell(index));
    let mask = header.bucket_count as u32 - 1;
    let step = probe_step(hash);
    let mut cell = hash & mask;
    for _ in 0..header.bucket_count {
        let current: u16 = heap.read(cell_offset(map_cp, cell));
        if is_free_cell(current) {
            heap.write(cell_offset(map_cp, cell), index);
            if current == CELL_CLEAN {
                header.null_count -= 1;
            } else {
                header.unused_count -= 1;
            }
            header.property_count += 1;
            return;
        }
        cell = (cell + step) & mask;
    }
    debug_assert!(false, "hashmap insert must find a free cell");
}

/// Tombstone the record's cell. Reports `Recreate` when tombstones dominate.
pub fn delete(
    heap: &mut Heap,
    list_cp: CompactPtr,
    name: PropName,
    index: PropertyIndex,
) -> HashmapDeleteStatus {
    let list: PropertyListHeader = heap.read(list_cp.offset());
    let map_cp = CompactPtr::from_raw(list.hashmap_cp);
    debug_assert!(!map_cp.is_null());
    let mut header: HashmapHeader = heap.read(map_cp.offset());

    let hash = name_hash(heap, name);
    let mask = header.bucket_count as u32 - 1;
    let step = probe_step(hash);
    let mut cell = hash & mask;
    for _ in 0..header.bucket_count {
        let current: u16 = heap.read(cell_offset(map_cp, cell));
        if current == CELL_CLEAN {
            return HashmapDeleteStatus::HasHashmap;
        }
        if current == index {
            heap.write(cell_offset(map_cp, cell), CELL_DIRTY);
            header.unused_count += 1;
            header.property_count -= 1;
            heap.write(map_cp.offset(), header);
            if header.unused_count > header.bucket_count / 4 * 3 {
                return HashmapDeleteStatus::Recreate;
            }
            return HashmapDeleteStatus::HasHashmap;
        }
        cell = (cell + step) & mask;
    }
    HashmapDeleteStatus::HasHashmap
}

/// Probe for a name. A clean cell ends the probe; tombstones are skipped.
pub fn find(heap: &Heap, list_cp: CompactPtr, name: PropName) -> Option<PropertyIndex> {
    let list: PropertyListHeader = heap.read(list_cp.offset());
    let map_cp = CompactPtr::from_raw(list.hashmap_cp);
    debug_assert!(!map_cp.is_null());
    let header: HashmapHeader = heap.read(map_cp.offset());

    let hash = name_hash(heap, name);
    let mask = header.bucket_count as u32 - 1;
    let step = probe_step(hash);
    let mut cell = hash & mask;
    let mut found = None;
    for _ in 0..header.bucket_count {
        let current: u16 = heap.read(cell_offset(map_cp, cell));
        if current == CELL_CLEAN {
            break;
        }
        if current != CELL_DIRTY {
            let record = proplist::read_record(heap, list_cp, current);
            debug_assert!(!record.is_deleted());
            if name.is_direct() {
                if record.matches_name(name) {
                    found = Some(current);
                    break;
                }
            } else if record.name_type() == NameType::Ptr
                && (record.name_cp == name.record_name_cp()
                    || equal_nondirect(
                        heap,
                        CompactPtr::from_raw(record.name_cp),
                        name.string_cp(),
                    ))
            {
                found = Some(current);
                break;
            }
        }
        cell = (cell + step) & mask;
    }

    #[cfg(debug_assertions)]
    assert_membership_agreement(heap, list_cp, name, found);

    found
}

/// Debug sweep: the list and the hashmap must agree on membership.
#[cfg(debug_assertions)]
fn assert_membership_agreement(
    heap: &Heap,
    list_cp: CompactPtr,
    name: PropName,
    found: Option<PropertyIndex>,
) {
    let list: PropertyListHeader = heap.read(list_cp.offset());
    let mut linear = None;
    for index in 1..=list.count {
        let record = proplist::read_record(heap, list_cp, index);
        if record.is_deleted() || record.property_type() == crate::property::PROPERTY_TYPE_SPECIAL {
            continue;
        }
        let hit = if name.is_direct() {
            record.matches_name(name)
        } else {
            record.name_type() == NameType::Ptr
                && (record.name_cp == name.record_name_cp()
                    || equal_nondirect(
                        heap,
                        CompactPtr::from_raw(record.name_cp),
                        name.string_cp(),
                    ))
        };
        if hit {
            linear = Some(index);
            break;
        }
    }
    debug_assert!(
        found == linear,
        "hashmap and property list disagree on membership"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextConfig, JSContext};
    use crate::name::intern;
    use crate::property::PropertyAttrs;
    use crate::proplist::{create_named_data_property, delete_property, find_named_property};

    fn new_ctx() -> JSContext {
        JSContext::new(ContextConfig::default()).expect("context init")
    }

    fn populate(ctx: &mut JSContext, obj: CompactPtr, count: usize) -> Vec<PropName> {
        let mut names = Vec::new();
        for i in 0..count {
            let label = format!("prop{i:02}");
            let name = intern(&mut ctx.heap, label.as_bytes()).unwrap();
            create_named_data_property(ctx, obj, name, PropertyAttrs::all()).unwrap();
            names.push(name);
        }
        names
    }

    #[test]
    fn probe_sequence_visits_every_cell() {
        for hash in [0u32, 1, 17, 0x1234_5678, u32::MAX] {
            let bucket_count = 64u32;
            let mask = bucket_count - 1;
            let step = probe_step(hash);
            let mut seen = vec![false; bucket_count as usize];
            let mut cell = hash & mask;
            for _ in 0..bucket_count {
                assert!(!seen[cell as usize]);
                seen[cell as usize] = true;
                cell = (cell + step) & mask;
            }
            assert!(seen.iter().all(|&s| s));
        }
    }

    #[test]
    fn create_attaches_and_finds_everything() {
        let mut ctx = new_ctx();
        let obj = crate::object::create_object(&mut ctx, CompactPtr::NULL).unwrap();
        let names = populate(&mut ctx, obj, 40);
        assert!(ctx.has_property_hashmap(obj));
        assert_eq!(ctx.stats.hashmaps_created, 1);

        let list_cp = proplist::list_cp_of(&ctx.heap, obj);
        for (i, name) in names.iter().enumerate() {
            assert_eq!(find(&ctx.heap, list_cp, *name), Some(i as u16 + 1));
        }
        let missing = intern(&mut ctx.heap, b"absent").unwrap();
        assert_eq!(find(&ctx.heap, list_cp, missing), None);
    }

    #[test]
    fn internal_names_resolve_through_the_hashmap() {
        let mut ctx = new_ctx();
        let obj = crate::object::create_object(&mut ctx, CompactPtr::NULL).unwrap();
        populate(&mut ctx, obj, 32);
        assert!(ctx.has_property_hashmap(obj));

        crate::proplist::create_internal_property(
            &mut ctx,
            obj,
            crate::name::magic::NATIVE_POINTER,
            0x77,
        )
        .unwrap();
        let name = PropName::magic(crate::name::magic::NATIVE_POINTER);
        let prop = find_named_property(&mut ctx, obj, name).unwrap();
        assert_eq!(crate::proplist::record_of(&ctx.heap, prop).value, 0x77);
    }

    #[test]
    fn clean_cell_accounting() {
        let mut ctx = new_ctx();
        let obj = crate::object::create_object(&mut ctx, CompactPtr::NULL).unwrap();
        populate(&mut ctx, obj, 32);
        let list_cp = proplist::list_cp_of(&ctx.heap, obj);
        let list: PropertyListHeader = ctx.heap.read(list_cp.offset());
        let header: HashmapHeader = ctx.heap.read(CompactPtr::from_raw(list.hashmap_cp).offset());
        assert_eq!(header.property_count, 32);
        assert_eq!(
            header.null_count,
            header.bucket_count - header.property_count
        );
        assert_eq!(header.unused_count, 0);
    }

    #[test]
    fn tombstones_accumulate_below_threshold() {
        let mut ctx = new_ctx();
        let obj = crate::object::create_object(&mut ctx, CompactPtr::NULL).unwrap();
        let names = populate(&mut ctx, obj, 40);

        // 31 tombstones stay under 3/4 of the 64-cell table
        for name in &names[..31] {
            let prop = find_named_property(&mut ctx, obj, *name).unwrap();
            delete_property(&mut ctx, obj, prop);
        }
        assert_eq!(ctx.stats.hashmaps_rebuilt, 0);
        assert!(ctx.has_property_hashmap(obj));

        let list_cp = proplist::list_cp_of(&ctx.heap, obj);
        let list: PropertyListHeader = ctx.heap.read(list_cp.offset());
        let header: HashmapHeader = ctx.heap.read(CompactPtr::from_raw(list.hashmap_cp).offset());
        assert_eq!(header.unused_count, 31);
        assert_eq!(header.property_count, 9);

        for name in &names[31..] {
            assert!(find_named_property(&mut ctx, obj, *name).is_some());
        }
        for name in &names[..31] {
            assert!(find_named_property(&mut ctx, obj, *name).is_none());
        }
    }

    #[test]
    fn delete_threshold_recreates_with_identical_membership() {
        let mut ctx = new_ctx();
        let obj = crate::object::create_object(&mut ctx, CompactPtr::NULL).unwrap();
        // 56 live entries leave 8 clean cells in the 64-cell table, just
        // above the insert-rebuild threshold
        let names = populate(&mut ctx, obj, 56);
        assert_eq!(ctx.stats.hashmaps_created, 1);
        assert_eq!(ctx.stats.hashmaps_rebuilt, 0);

        // the 49th tombstone crosses 3/4 of the table
        for name in &names[..49] {
            let prop = find_named_property(&mut ctx, obj, *name).unwrap();
            delete_property(&mut ctx, obj, prop);
        }
        assert_eq!(ctx.stats.hashmaps_rebuilt, 1);
        assert!(ctx.has_property_hashmap(obj));

        let list_cp = proplist::list_cp_of(&ctx.heap, obj);
        let list: PropertyListHeader = ctx.heap.read(list_cp.offset());
        let header: HashmapHeader = ctx.heap.read(CompactPtr::from_raw(list.hashmap_cp).offset());
        assert_eq!(header.unused_count, 0);
        assert_eq!(header.property_count, 7);

        for name in &names[49..] {
            assert!(find_named_property(&mut ctx, obj, *name).is_some());
        }
        for name in &names[..49] {
            assert!(find_named_property(&mut ctx, obj, *name).is_none());
        }
    }
}
