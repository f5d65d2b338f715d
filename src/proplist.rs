use crate::context::{FatalCode, JSContext};
use crate::cptr::CompactPtr;
use crate::hashmap::{self, HashmapDeleteStatus};
use crate::heap::Heap;
use crate::jsvalue::{
    copy_value, copy_value_if_not_object, free_value, free_value_if_not_object, JSValue,
    JS_UNDEFINED, JS_UNINITIALIZED,
};
use crate::lcache;
use crate::name::{equal_nondirect, magic, string_deref, string_ref, NameType, PropName, StringHeader};
use crate::object::{self, ObjectKind};
use crate::property::{
    free_accessor_value, make_accessor_value, replace_accessor_getter, replace_accessor_setter,
    DescriptorFlags, GetterSetterPair, PropertyAttrs, PropertyDescriptor, PropertyKind,
    PropertyRecord, PROPERTY_RECORD_SIZE, PROPERTY_TYPE_INTERNAL, PROPERTY_TYPE_NAMED_ACCESSOR,
    PROPERTY_TYPE_NAMED_DATA, PROPERTY_TYPE_SPECIAL,
};
use core::mem::size_of;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// 1-based index of a slot within its list slab. 0 is invalid.
pub type PropertyIndex = u16;
pub const INDEX_INVALID: PropertyIndex = 0;

pub const MRU_SLOTS: usize = 3;

/// List header; occupies the stride of one record, so slot `i` lives at byte
/// offset `i * PROPERTY_RECORD_SIZE` from the slab start.
///
/// `hashmap_cp` is the explicit accelerator discriminant: NULL means the
/// `mru` hints are live, anything else names the attached hashmap. The MRU
/// slots always hold valid slot indices (they are seeded with 1, and slot 1
/// exists in every allocated list).
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct PropertyListHeader {
    pub count: u16,
    pub mru: [u16; MRU_SLOTS],
    pub hashmap_cp: u32,
}

const _: () = assert!(size_of::<PropertyListHeader>() == PROPERTY_RECORD_SIZE);

/// Stable handle to a property: the owning object plus the 1-based slot
/// index. Slot indices survive the grow-by-one reallocation, so the handle
/// stays valid until the property is deleted.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PropertyRef {
    pub object_cp: CompactPtr,
    pub index: PropertyIndex,
}

pub fn list_cp_of(heap: &Heap, obj: CompactPtr) -> CompactPtr {
    CompactPtr::from_raw(object::read_object(heap, obj).property_header_cp)
}

pub fn record_offset(list_cp: CompactPtr, index: PropertyIndex) -> usize {
    debug_assert!(!list_cp.is_null());
    debug_assert!(index != INDEX_INVALID);
    list_cp.offset() + index as usize * PROPERTY_RECORD_SIZE
}

pub fn read_record(heap: &Heap, list_cp: CompactPtr, index: PropertyIndex) -> PropertyRecord {
    heap.read(record_offset(list_cp, index))
}

fn write_record(heap: &mut Heap, list_cp: CompactPtr, index: PropertyIndex, record: PropertyRecord) {
    heap.write(record_offset(list_cp, index), record);
}

fn list_alloc_size(count: usize) -> usize {
    (count + 1) * PROPERTY_RECORD_SIZE
}

/// Resolve a name against the object's own properties.
///
/// Order: lookup cache, then the hashmap when one is attached, then the MRU
/// hints (only when the list outgrows them), then a linear scan with a
/// direct-string fast path. A scan or hashmap hit is published to the MRU
/// hints and the lookup cache.
pub fn find_named_property(
    ctx: &mut JSContext,
    obj: CompactPtr,
    name: PropName,
) -> Option<PropertyRef> {
    debug_assert!(!obj.is_null());
    // object-bound environments resolve through their binding object in the
    // layer above; their header field is not a property list
    debug_assert!(object::read_object(&ctx.heap, obj).kind() != ObjectKind::ObjectBoundEnv);

    if let Some(cache) = ctx.lcache.as_ref() {
        if let Some((index, _)) = lcache::lookup(&ctx.heap, cache, obj, name) {
            return Some(PropertyRef {
                object_cp: obj,
                index,
            });
        }
    }

    let list_cp = list_cp_of(&ctx.heap, obj);
    if list_cp.is_null() {
        return None;
    }
    let header: PropertyListHeader = ctx.heap.read(list_cp.offset());
    let arity = ctx.config.compact_pointer_width.mru_arity();

    let (index, cached_name) = if !CompactPtr::from_raw(header.hashmap_cp).is_null() {
        let index = hashmap::find(&ctx.heap, list_cp, name)?;
        let record = read_record(&ctx.heap, list_cp, index);
        (index, record.name())
    } else {
        if header.count as usize > arity {
            for &hint in &header.mru[..arity] {
                if hint == INDEX_INVALID || hint > header.count {
                    continue;
                }
                let record = read_record(&ctx.heap, list_cp, hint);
                if record.matches_name(name) {
                    return Some(PropertyRef {
                        object_cp: obj,
                        index: hint,
                    });
                }
            }
        }

        let found = if name.is_direct() {
            let mut found = None;
            for index in 1..=header.count {
                let record = read_record(&ctx.heap, list_cp, index);
                if record.matches_name(name) {
                    found = Some((index, name));
                    break;
                }
            }
            found
        } else {
            let mut found = None;
            for index in 1..=header.count {
                let record = read_record(&ctx.heap, list_cp, index);
                if record.name_type() != NameType::Ptr {
                    continue;
                }
                if record.name_cp == name.record_name_cp() {
                    found = Some((index, name));
                    break;
                }
                if equal_nondirect(
                    &ctx.heap,
                    CompactPtr::from_raw(record.name_cp),
                    name.string_cp(),
                ) {
                    // cache under the record's own name
                    found = Some((index, record.name()));
                    break;
                }
            }
            found
        };
        let (index, cached_name) = found?;
        mru_note(&mut ctx.heap, list_cp, index, arity);
        (index, cached_name)
    };

    let record = read_record(&ctx.heap, list_cp, index);
    if let Some(cache) = ctx.lcache.as_mut() {
        if !record.is_lcached() {
            lcache::insert(
                &mut ctx.heap,
                cache,
                &mut ctx.stats,
                arity,
                obj,
                cached_name,
                index,
            );
        }
    }
    Some(PropertyRef {
        object_cp: obj,
        index,
    })
}

/// Fetch a property that is known to exist as named data.
pub fn get_named_data_property(ctx: &mut JSContext, obj: CompactPtr, name: PropName) -> PropertyRef {
    let prop = find_named_property(ctx, obj, name).expect("named data property must exist");
    debug_assert!(
        record_of(&ctx.heap, prop).property_type() == PROPERTY_TYPE_NAMED_DATA
    );
    prop
}

pub fn record_of(heap: &Heap, prop: PropertyRef) -> PropertyRecord {
    read_record(heap, list_cp_of(heap, prop.object_cp), prop.index)
}

/// Copy of a property's record, for callers outside the core.
pub fn property_record(ctx: &JSContext, prop: PropertyRef) -> PropertyRecord {
    record_of(&ctx.heap, prop)
}

/// Append a property slot, growing the list by one.
///
/// The slab is reallocated on every insertion; slot indices are stable, and
/// lookup-cache entries key on (object, name, index), so none of them point
/// into the old slab and no rewrite pass is needed. Allocation failure is
/// fatal to the request and leaves the list in its pre-call state.
pub fn create_property(
    ctx: &mut JSContext,
    obj: CompactPtr,
    name: PropName,
    type_and_flags: u8,
    value: u32,
) -> Result<PropertyRef, FatalCode> {
    debug_assert!(!obj.is_null());
    let mut obj_rec = object::read_object(&ctx.heap, obj);
    debug_assert!(obj_rec.kind() != ObjectKind::ObjectBoundEnv);

    let old_cp = CompactPtr::from_raw(obj_rec.property_header_cp);
    let (list_cp, index) = if old_cp.is_null() {
        let list_cp = ctx.heap.alloc_block(list_alloc_size(1))?;
        ctx.heap.write(
            list_cp.offset(),
            PropertyListHeader {
                count: 1,
                mru: [1; MRU_SLOTS],
                hashmap_cp: CompactPtr::NULL.raw(),
            },
        );
        (list_cp, 1)
    } else {
        let header: PropertyListHeader = ctx.heap.read(old_cp.offset());
        let old_count = header.count as usize;
        let new_cp = ctx.heap.realloc_block(
            old_cp,
            list_alloc_size(old_count),
            list_alloc_size(old_count + 1),
        )?;
        let mut header: PropertyListHeader = ctx.heap.read(new_cp.offset());
        header.count += 1;
        ctx.heap.write(new_cp.offset(), header);
        (new_cp, header.count)
    };

    obj_rec.property_header_cp = list_cp.raw();
    ctx.heap.write(obj.offset(), obj_rec);

    // the record owns one reference to an indirect name
    if name.name_type() == NameType::Ptr {
        string_ref(&mut ctx.heap, name.string_cp())?;
    }
    write_record(
        &mut ctx.heap,
        list_cp,
        index,
        PropertyRecord::new(type_and_flags, name, value),
    );

    if ctx.config.hashmap_enabled {
        let header: PropertyListHeader = ctx.heap.read(list_cp.offset());
        if !CompactPtr::from_raw(header.hashmap_cp).is_null() {
            hashmap::insert(ctx, list_cp, name, index);
        } else if header.count >= ctx.config.minimum_hashmap_size {
            hashmap::create(ctx, list_cp);
        }
    }

    #[cfg(debug_assertions)]
    verify_list_consistency(ctx, obj);

    Ok(PropertyRef {
        object_cp: obj,
        index,
    })
}

/// Create a named data property; the value starts out undefined.
pub fn create_named_data_property(
    ctx: &mut JSContext,
    obj: CompactPtr,
    name: PropName,
    attrs: PropertyAttrs,
) -> Result<PropertyRef, FatalCode> {
    debug_assert!(!contains_name(&ctx.heap, obj, name));
    create_property(
        ctx,
        obj,
        name,
        PROPERTY_TYPE_NAMED_DATA | attrs.bits(),
        JS_UNDEFINED.raw(),
    )
}

/// Create a named accessor property from a getter/setter pair (either may be
/// NULL).
pub fn create_named_accessor_property(
    ctx: &mut JSContext,
    obj: CompactPtr,
    name: PropName,
    getter: CompactPtr,
    setter: CompactPtr,
    attrs: PropertyAttrs,
) -> Result<PropertyRef, FatalCode> {
    debug_assert!(!contains_name(&ctx.heap, obj, name));
    debug_assert!(!attrs.contains(PropertyAttrs::WRITABLE));
    let width = ctx.config.compact_pointer_width;
    let value = make_accessor_value(&mut ctx.heap, width, getter, setter)?;
    create_property(
        ctx,
        obj,
        name,
        PROPERTY_TYPE_NAMED_ACCESSOR | attrs.bits(),
        value,
    )
}

/// Create an engine-private internal property carrying a raw payload word.
pub fn create_internal_property(
    ctx: &mut JSContext,
    obj: CompactPtr,
    magic_name: u32,
    payload: u32,
) -> Result<PropertyRef, FatalCode> {
    debug_assert!(magic_name >= magic::FIRST_INTERNAL && magic_name != magic::DELETED);
    create_property(
        ctx,
        obj,
        PropName::magic(magic_name),
        PROPERTY_TYPE_INTERNAL,
        payload,
    )
}

/// Release a property's payload and detach it from the caches. The slot
/// itself is untouched.
pub fn free_property(ctx: &mut JSContext, obj: CompactPtr, index: PropertyIndex) {
    let list_cp = list_cp_of(&ctx.heap, obj);
    let record = read_record(&ctx.heap, list_cp, index);
    let width = ctx.config.compact_pointer_width;

    match record.property_type() {
        PROPERTY_TYPE_NAMED_DATA => {
            free_value_if_not_object(ctx, JSValue::from_raw(record.value));
        }
        PROPERTY_TYPE_NAMED_ACCESSOR => {
            free_accessor_value(&mut ctx.heap, width, record.value);
        }
        PROPERTY_TYPE_INTERNAL => {
            // engine-private payload bags are owned by their registrar
            debug_assert!(matches!(
                record.kind(),
                PropertyKind::Internal | PropertyKind::Virtual
            ));
        }
        _ => {
            debug_assert!(false, "special slots carry no payload");
        }
    }

    let record = read_record(&ctx.heap, list_cp, index);
    if record.is_lcached() {
        let offset = record_offset(list_cp, index);
        if let Some(cache) = ctx.lcache.as_mut() {
            lcache::invalidate(&mut ctx.heap, cache, offset);
        }
    }

    if record.name_type() == NameType::Ptr {
        string_deref(&mut ctx.heap, CompactPtr::from_raw(record.name_cp));
    }
}

/// Delete a property: free its payload, tombstone the slot, and keep the
/// hashmap in step. Slot storage is reclaimed only with the object.
pub fn delete_property(ctx: &mut JSContext, obj: CompactPtr, prop: PropertyRef) {
    debug_assert!(prop.object_cp == obj);
    let list_cp = list_cp_of(&ctx.heap, obj);
    if list_cp.is_null() {
        return;
    }
    let header: PropertyListHeader = ctx.heap.read(list_cp.offset());
    debug_assert!(prop.index != INDEX_INVALID && prop.index <= header.count);
    let record = read_record(&ctx.heap, list_cp, prop.index);
    debug_assert!(record.property_type() != PROPERTY_TYPE_SPECIAL);

    let mut status = HashmapDeleteStatus::HasHashmap;
    let has_hashmap = !CompactPtr::from_raw(header.hashmap_cp).is_null();
    if has_hashmap {
        status = hashmap::delete(&mut ctx.heap, list_cp, record.name(), prop.index);
    }

    free_property(ctx, obj, prop.index);
    write_record(
        &mut ctx.heap,
        list_cp,
        prop.index,
        PropertyRecord::new(PROPERTY_TYPE_SPECIAL, PropName::magic(magic::DELETED), 0),
    );

    if has_hashmap && status == HashmapDeleteStatus::Recreate {
        hashmap::free(&mut ctx.heap, list_cp);
        hashmap::create(ctx, list_cp);
        ctx.stats.hashmaps_rebuilt += 1;
        tracing::trace!(list = list_cp.raw(), "property hashmap rebuilt on delete");
    }

    #[cfg(debug_assertions)]
    verify_list_consistency(ctx, obj);
}

/// Assign to a named data property, releasing the previous value. Takes
/// ownership of `value`.
pub fn named_data_property_assign_value(
    ctx: &mut JSContext,
    obj: CompactPtr,
    prop: PropertyRef,
    value: JSValue,
) {
    assert_object_contains(&ctx.heap, obj, prop, PROPERTY_TYPE_NAMED_DATA);
    let list_cp = list_cp_of(&ctx.heap, obj);
    let record = read_record(&ctx.heap, list_cp, prop.index);
    let old = JSValue::from_raw(record.value);
    if old == value {
        return;
    }
    free_value_if_not_object(ctx, old);
    let list_cp = list_cp_of(&ctx.heap, obj);
    let mut record = read_record(&ctx.heap, list_cp, prop.index);
    record.value = value.raw();
    write_record(&mut ctx.heap, list_cp, prop.index, record);
}

pub fn named_accessor_pair(ctx: &JSContext, prop: PropertyRef) -> GetterSetterPair {
    let record = record_of(&ctx.heap, prop);
    debug_assert!(record.property_type() == PROPERTY_TYPE_NAMED_ACCESSOR);
    crate::property::accessor_pair(&ctx.heap, ctx.config.compact_pointer_width, record.value)
}

pub fn set_named_accessor_getter(
    ctx: &mut JSContext,
    obj: CompactPtr,
    prop: PropertyRef,
    getter: CompactPtr,
) {
    assert_object_contains(&ctx.heap, obj, prop, PROPERTY_TYPE_NAMED_ACCESSOR);
    let width = ctx.config.compact_pointer_width;
    let list_cp = list_cp_of(&ctx.heap, obj);
    let mut record = read_record(&ctx.heap, list_cp, prop.index);
    record.value = replace_accessor_getter(&mut ctx.heap, width, record.value, getter);
    write_record(&mut ctx.heap, list_cp, prop.index, record);
}

pub fn set_named_accessor_setter(
    ctx: &mut JSContext,
    obj: CompactPtr,
    prop: PropertyRef,
    setter: CompactPtr,
) {
    assert_object_contains(&ctx.heap, obj, prop, PROPERTY_TYPE_NAMED_ACCESSOR);
    let width = ctx.config.compact_pointer_width;
    let list_cp = list_cp_of(&ctx.heap, obj);
    let mut record = read_record(&ctx.heap, list_cp, prop.index);
    record.value = replace_accessor_setter(&mut ctx.heap, width, record.value, setter);
    write_record(&mut ctx.heap, list_cp, prop.index, record);
}

pub fn set_property_writable_attr(ctx: &mut JSContext, prop: PropertyRef, writable: bool) {
    let list_cp = list_cp_of(&ctx.heap, prop.object_cp);
    let mut record = read_record(&ctx.heap, list_cp, prop.index);
    record.set_writable(writable);
    write_record(&mut ctx.heap, list_cp, prop.index, record);
}

pub fn set_property_enumerable_attr(ctx: &mut JSContext, prop: PropertyRef, enumerable: bool) {
    let list_cp = list_cp_of(&ctx.heap, prop.object_cp);
    let mut record = read_record(&ctx.heap, list_cp, prop.index);
    record.set_enumerable(enumerable);
    write_record(&mut ctx.heap, list_cp, prop.index, record);
}

pub fn set_property_configurable_attr(ctx: &mut JSContext, prop: PropertyRef, configurable: bool) {
    let list_cp = list_cp_of(&ctx.heap, prop.object_cp);
    let mut record = read_record(&ctx.heap, list_cp, prop.index);
    record.set_configurable(configurable);
    write_record(&mut ctx.heap, list_cp, prop.index, record);
}

/// Number of allocated slots, deleted ones included.
pub fn property_count(ctx: &JSContext, obj: CompactPtr) -> PropertyIndex {
    let list_cp = list_cp_of(&ctx.heap, obj);
    if list_cp.is_null() {
        return 0;
    }
    let header: PropertyListHeader = ctx.heap.read(list_cp.offset());
    header.count
}

/// Iteration by slot index; `None` past the end or without a list.
pub fn record_at(ctx: &JSContext, obj: CompactPtr, index: PropertyIndex) -> Option<PropertyRecord> {
    let list_cp = list_cp_of(&ctx.heap, obj);
    if list_cp.is_null() || index == INDEX_INVALID {
        return None;
    }
    let header: PropertyListHeader = ctx.heap.read(list_cp.offset());
    if index > header.count {
        return None;
    }
    Some(read_record(&ctx.heap, list_cp, index))
}

/// Own enumerable property names in insertion order.
pub fn own_enumerable_names(ctx: &JSContext, obj: CompactPtr) -> Vec<PropName> {
    let mut names = Vec::new();
    let count = property_count(ctx, obj);
    let list_cp = list_cp_of(&ctx.heap, obj);
    for index in 1..=count {
        let record = read_record(&ctx.heap, list_cp, index);
        if record.is_deleted() || !record.is_named() {
            continue;
        }
        if record.is_enumerable() {
            names.push(record.name());
        }
    }
    names
}

/// Build an own-property descriptor for `name`, taking references for the
/// held value or accessor objects. `None` for missing names and
/// engine-private internal properties.
pub fn own_property_descriptor(
    ctx: &mut JSContext,
    obj: CompactPtr,
    name: PropName,
) -> Result<Option<PropertyDescriptor>, FatalCode> {
    let Some(prop) = find_named_property(ctx, obj, name) else {
        return Ok(None);
    };
    let record = record_of(&ctx.heap, prop);
    let mut desc = PropertyDescriptor::empty();
    match record.kind() {
        PropertyKind::NamedData | PropertyKind::Virtual => {
            desc.flags |= DescriptorFlags::VALUE_DEFINED
                | DescriptorFlags::WRITABLE_DEFINED
                | DescriptorFlags::ENUMERABLE_DEFINED
                | DescriptorFlags::CONFIGURABLE_DEFINED;
            if record.is_writable() {
                desc.flags |= DescriptorFlags::WRITABLE;
            }
            desc.value = copy_value(ctx, JSValue::from_raw(record.value))?;
        }
        PropertyKind::NamedAccessor => {
            desc.flags |= DescriptorFlags::GET_DEFINED
                | DescriptorFlags::SET_DEFINED
                | DescriptorFlags::ENUMERABLE_DEFINED
                | DescriptorFlags::CONFIGURABLE_DEFINED;
            let pair = named_accessor_pair(ctx, prop);
            desc.getter = CompactPtr::from_raw(pair.getter_cp);
            desc.setter = CompactPtr::from_raw(pair.setter_cp);
            if !desc.getter.is_null() {
                object::object_ref(&mut ctx.heap, desc.getter)?;
            }
            if !desc.setter.is_null() {
                object::object_ref(&mut ctx.heap, desc.setter)?;
            }
        }
        _ => return Ok(None),
    }
    if record.is_enumerable() {
        desc.flags |= DescriptorFlags::ENUMERABLE;
    }
    if record.is_configurable() {
        desc.flags |= DescriptorFlags::CONFIGURABLE;
    }
    Ok(Some(desc))
}

/// Release the references held by a descriptor and reset it to empty.
pub fn free_property_descriptor(ctx: &mut JSContext, desc: &mut PropertyDescriptor) {
    if desc.flags.contains(DescriptorFlags::VALUE_DEFINED) {
        free_value(ctx, desc.value);
    }
    if desc.flags.contains(DescriptorFlags::GET_DEFINED) && !desc.getter.is_null() {
        object::object_deref(ctx, desc.getter);
    }
    if desc.flags.contains(DescriptorFlags::SET_DEFINED) && !desc.setter.is_null() {
        object::object_deref(ctx, desc.setter);
    }
    *desc = PropertyDescriptor::empty();
}

/// Snapshot a declarative environment: a fresh environment with the same
/// names and attributes. Non-object values are copied when `copy_values` is
/// set; object values are shared; otherwise slots start uninitialized.
/// Drops the caller's reference on `env`.
pub fn clone_decl_lexical_environment(
    ctx: &mut JSContext,
    env: CompactPtr,
    copy_values: bool,
) -> Result<CompactPtr, FatalCode> {
    debug_assert!(object::read_object(&ctx.heap, env).kind() == ObjectKind::DeclarativeEnv);
    let outer = object::lex_env_outer(&ctx.heap, env);
    let new_env = object::create_decl_lex_env(ctx, outer)?;

    let list_cp = list_cp_of(&ctx.heap, env);
    if !list_cp.is_null() {
        let header: PropertyListHeader = ctx.heap.read(list_cp.offset());
        for index in 1..=header.count {
            let record = read_record(&ctx.heap, list_cp, index);
            if record.is_deleted() {
                continue;
            }
            debug_assert!(record.property_type() == PROPERTY_TYPE_NAMED_DATA);
            let attrs = record.attrs();
            let new_prop = create_named_data_property(ctx, new_env, record.name(), attrs)?;

            let value = if copy_values {
                copy_value_if_not_object(ctx, JSValue::from_raw(record.value))?
            } else {
                JS_UNINITIALIZED
            };
            let new_list = list_cp_of(&ctx.heap, new_env);
            let mut new_record = read_record(&ctx.heap, new_list, new_prop.index);
            debug_assert!(JSValue::from_raw(new_record.value) == JS_UNDEFINED);
            new_record.value = value.raw();
            write_record(&mut ctx.heap, new_list, new_prop.index, new_record);
        }
    }

    object::object_deref(ctx, env);
    Ok(new_env)
}

/// Tear down an object's whole property list (object reclamation path).
pub(crate) fn free_property_list(ctx: &mut JSContext, obj: CompactPtr) {
    let list_cp = list_cp_of(&ctx.heap, obj);
    if list_cp.is_null() {
        return;
    }
    let header: PropertyListHeader = ctx.heap.read(list_cp.offset());
    for index in 1..=header.count {
        let record = read_record(&ctx.heap, list_cp, index);
        if !record.is_deleted() {
            free_property(ctx, obj, index);
        }
    }
    if !CompactPtr::from_raw(header.hashmap_cp).is_null() {
        hashmap::free(&mut ctx.heap, list_cp);
    }
    ctx.heap.free_block(list_cp, list_alloc_size(header.count as usize));

    let mut obj_rec = object::read_object(&ctx.heap, obj);
    obj_rec.property_header_cp = CompactPtr::NULL.raw();
    ctx.heap.write(obj.offset(), obj_rec);
}

/// Rotate a slot index into the MRU hints. A no-op while a hashmap fronts
/// the list.
pub(crate) fn mru_note(heap: &mut Heap, list_cp: CompactPtr, index: PropertyIndex, arity: usize) {
    if list_cp.is_null() {
        return;
    }
    let mut header: PropertyListHeader = heap.read(list_cp.offset());
    if !CompactPtr::from_raw(header.hashmap_cp).is_null() {
        return;
    }
    debug_assert!(index != INDEX_INVALID && index <= header.count);
    for slot in (1..arity).rev() {
        header.mru[slot] = header.mru[slot - 1];
    }
    header.mru[0] = index;
    heap.write(list_cp.offset(), header);
}

/// Invariant sweep over one object's three indexes: live slots carry valid
/// names, the LCACHED flag mirrors exactly one lookup-cache entry, and the
/// hashmap agrees with the list on membership. Debug builds run it after
/// structural mutations; tests call it directly.
pub fn verify_list_consistency(ctx: &JSContext, obj: CompactPtr) {
    let list_cp = list_cp_of(&ctx.heap, obj);
    if list_cp.is_null() {
        return;
    }
    let header: PropertyListHeader = ctx.heap.read(list_cp.offset());
    let hashmap_fronted = !CompactPtr::from_raw(header.hashmap_cp).is_null();

    if !hashmap_fronted {
        let arity = ctx.config.compact_pointer_width.mru_arity();
        for &hint in &header.mru[..arity] {
            assert!(hint != INDEX_INVALID && hint <= header.count);
        }
    }

    for index in 1..=header.count {
        let record = read_record(&ctx.heap, list_cp, index);
        if record.is_deleted() {
            continue;
        }
        if record.name_type() == NameType::Ptr {
            let name_header: StringHeader =
                ctx.heap.read(CompactPtr::from_raw(record.name_cp).offset());
            assert!(name_header.refs > 0, "live slot holds a dead name");
        }
        if record.is_lcached() {
            let cache = ctx.lcache.as_ref().expect("LCACHED requires a lookup cache");
            assert!(
                lcache::entry_matches(cache, &record, obj, index),
                "LCACHED flag without a matching cache entry"
            );
        }
        if hashmap_fronted {
            assert_eq!(
                hashmap::find(&ctx.heap, list_cp, record.name()),
                Some(index),
                "hashmap lost a live slot"
            );
        }
    }
}

/// Linear membership probe used by creation-time uniqueness asserts.
fn contains_name(heap: &Heap, obj: CompactPtr, name: PropName) -> bool {
    let list_cp = list_cp_of(heap, obj);
    if list_cp.is_null() {
        return false;
    }
    let header: PropertyListHeader = heap.read(list_cp.offset());
    for index in 1..=header.count {
        let record = read_record(heap, list_cp, index);
        if record.is_deleted() {
            continue;
        }
        if record.matches_name(name) {
            return true;
        }
        if name.name_type() == NameType::Ptr
            && record.name_type() == NameType::Ptr
            && equal_nondirect(heap, CompactPtr::from_raw(record.name_cp), name.string_cp())
        {
            return true;
        }
    }
    false
}

fn assert_object_contains(heap: &Heap, obj: CompactPtr, prop: PropertyRef, property_type: u8) {
    let _ = (heap, obj, prop, property_type);
    #[cfg(debug_assertions)]
    {
        debug_assert!(prop.object_cp == obj);
        let list_cp = list_cp_of(heap, obj);
        debug_assert!(!list_cp.is_null());
        let header: PropertyListHeader = heap.read(list_cp.offset());
        debug_assert!(prop.index != INDEX_INVALID && prop.index <= header.count);
        let record = read_record(heap, list_cp, prop.index);
        debug_assert!(record.property_type() == property_type);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextConfig, JSContext};
    use crate::name::intern;
    use crate::object::create_object;

    fn new_ctx() -> JSContext {
        JSContext::new(ContextConfig::default()).expect("context init")
    }

    fn ctx_without_accelerators() -> JSContext {
        JSContext::new(ContextConfig {
            hashmap_enabled: false,
            lookup_cache_enabled: false,
            ..ContextConfig::default()
        })
        .expect("context init")
    }

    #[test]
    fn create_then_find_roundtrip() {
        let mut ctx = new_ctx();
        let obj = create_object(&mut ctx, CompactPtr::NULL).unwrap();
        let name = intern(&mut ctx.heap, b"answer").unwrap();
        let prop = create_named_data_property(&mut ctx, obj, name, PropertyAttrs::all()).unwrap();
        assert_eq!(prop.index, 1);

        let found = find_named_property(&mut ctx, obj, name).unwrap();
        assert_eq!(found, prop);
        // stable until deletion
        assert_eq!(find_named_property(&mut ctx, obj, name).unwrap(), prop);

        delete_property(&mut ctx, obj, prop);
        assert!(find_named_property(&mut ctx, obj, name).is_none());
    }

    #[test]
    fn deleted_slot_keeps_its_position() {
        let mut ctx = new_ctx();
        let obj = create_object(&mut ctx, CompactPtr::NULL).unwrap();
        let a = intern(&mut ctx.heap, b"a").unwrap();
        let b = intern(&mut ctx.heap, b"b").unwrap();
        let pa = create_named_data_property(&mut ctx, obj, a, PropertyAttrs::all()).unwrap();
        let pb = create_named_data_property(&mut ctx, obj, b, PropertyAttrs::all()).unwrap();

        delete_property(&mut ctx, obj, pa);
        assert_eq!(property_count(&ctx, obj), 2);
        assert_eq!(record_at(&ctx, obj, pa.index).unwrap().kind(), PropertyKind::Deleted);
        assert_eq!(find_named_property(&mut ctx, obj, b).unwrap(), pb);

        // a new property reuses no slot; the list keeps growing
        let c = intern(&mut ctx.heap, b"c").unwrap();
        let pc = create_named_data_property(&mut ctx, obj, c, PropertyAttrs::all()).unwrap();
        assert_eq!(pc.index, 3);
    }

    #[test]
    fn equal_content_names_resolve_to_one_record() {
        let mut ctx = new_ctx();
        let obj = create_object(&mut ctx, CompactPtr::NULL).unwrap();
        let name = intern(&mut ctx.heap, b"shared").unwrap();
        let alias = intern(&mut ctx.heap, b"shared").unwrap();
        assert_ne!(name.record_name_cp(), alias.record_name_cp());

        let prop = create_named_data_property(&mut ctx, obj, name, PropertyAttrs::all()).unwrap();
        assert_eq!(find_named_property(&mut ctx, obj, alias), Some(prop));
    }

    #[test]
    fn direct_names_use_the_fast_path() {
        let mut ctx = ctx_without_accelerators();
        let obj = create_object(&mut ctx, CompactPtr::NULL).unwrap();
        let idx = PropName::uint(7);
        let prop = create_named_data_property(&mut ctx, obj, idx, PropertyAttrs::all()).unwrap();
        assert_eq!(find_named_property(&mut ctx, obj, idx), Some(prop));
        assert_eq!(find_named_property(&mut ctx, obj, PropName::uint(8)), None);
        // the numeric spelling interns to the same direct identity
        let seven = intern(&mut ctx.heap, b"7").unwrap();
        assert_eq!(find_named_property(&mut ctx, obj, seven), Some(prop));
    }

    #[test]
    fn mru_hints_track_recent_finds() {
        let mut ctx = ctx_without_accelerators();
        let obj = create_object(&mut ctx, CompactPtr::NULL).unwrap();
        let mut names = Vec::new();
        for i in 0..8 {
            let label = format!("n{i}");
            let name = intern(&mut ctx.heap, label.as_bytes()).unwrap();
            create_named_data_property(&mut ctx, obj, name, PropertyAttrs::all()).unwrap();
            names.push(name);
        }
        // repeated finds keep resolving through the MRU hints
        for _ in 0..3 {
            for name in &names {
                assert!(find_named_property(&mut ctx, obj, *name).is_some());
            }
        }
        let list_cp = list_cp_of(&ctx.heap, obj);
        let header: PropertyListHeader = ctx.heap.read(list_cp.offset());
        assert_eq!(header.mru[0], 8);
    }

    #[test]
    fn attribute_setters_rewrite_flags_in_place() {
        let mut ctx = new_ctx();
        let obj = create_object(&mut ctx, CompactPtr::NULL).unwrap();
        let name = intern(&mut ctx.heap, b"attr").unwrap();
        let prop = create_named_data_property(&mut ctx, obj, name, PropertyAttrs::all()).unwrap();

        set_property_writable_attr(&mut ctx, prop, false);
        set_property_enumerable_attr(&mut ctx, prop, false);
        set_property_configurable_attr(&mut ctx, prop, false);
        let record = record_of(&ctx.heap, prop);
        assert!(!record.is_writable());
        assert!(!record.is_enumerable());
        assert!(!record.is_configurable());

        // idempotent, and attributes survive unrelated lookups
        set_property_writable_attr(&mut ctx, prop, false);
        let again = get_named_data_property(&mut ctx, obj, name);
        assert_eq!(again, prop);
        assert_eq!(record_of(&ctx.heap, again).attrs(), record.attrs());
    }

    #[test]
    fn assign_value_releases_previous_string() {
        let mut ctx = new_ctx();
        let obj = create_object(&mut ctx, CompactPtr::NULL).unwrap();
        let name = intern(&mut ctx.heap, b"s").unwrap();
        let prop = create_named_data_property(&mut ctx, obj, name, PropertyAttrs::all()).unwrap();

        let used_before = ctx.heap.stats().used;
        let text = intern(&mut ctx.heap, b"payload").unwrap();
        named_data_property_assign_value(&mut ctx, obj, prop, JSValue::make_string(text.string_cp()));
        named_data_property_assign_value(&mut ctx, obj, prop, JSValue::make_int(1));
        assert_eq!(ctx.heap.stats().used, used_before);
        assert_eq!(
            JSValue::from_raw(record_of(&ctx.heap, prop).value),
            JSValue::make_int(1)
        );
    }

    #[test]
    fn accessor_property_stores_and_replaces_pair() {
        let mut ctx = new_ctx();
        let obj = create_object(&mut ctx, CompactPtr::NULL).unwrap();
        let getter = create_object(&mut ctx, CompactPtr::NULL).unwrap();
        let setter = create_object(&mut ctx, CompactPtr::NULL).unwrap();
        let name = intern(&mut ctx.heap, b"acc").unwrap();
        let prop = create_named_accessor_property(
            &mut ctx,
            obj,
            name,
            getter,
            CompactPtr::NULL,
            PropertyAttrs::CONFIGURABLE | PropertyAttrs::ENUMERABLE,
        )
        .unwrap();

        let pair = named_accessor_pair(&ctx, prop);
        assert_eq!(pair.getter_cp, getter.raw());
        assert_eq!(pair.setter_cp, 0);

        set_named_accessor_setter(&mut ctx, obj, prop, setter);
        let pair = named_accessor_pair(&ctx, prop);
        assert_eq!(pair.setter_cp, setter.raw());
    }

    #[test]
    fn width_masked_cache_ids_never_false_hit() {
        let mut ctx = new_ctx();
        let obj = create_object(&mut ctx, CompactPtr::NULL).unwrap();
        // payloads that alias after 16-bit id masking
        let low = PropName::uint(5);
        let high = PropName::uint(0x10005);
        let p_low = create_named_data_property(&mut ctx, obj, low, PropertyAttrs::all()).unwrap();
        let p_high = create_named_data_property(&mut ctx, obj, high, PropertyAttrs::all()).unwrap();

        for _ in 0..3 {
            assert_eq!(find_named_property(&mut ctx, obj, low), Some(p_low));
            assert_eq!(find_named_property(&mut ctx, obj, high), Some(p_high));
        }
    }

    #[test]
    fn accessor_descriptor_takes_object_references() {
        let mut ctx = new_ctx();
        let obj = create_object(&mut ctx, CompactPtr::NULL).unwrap();
        let getter = create_object(&mut ctx, CompactPtr::NULL).unwrap();
        let name = intern(&mut ctx.heap, b"view").unwrap();
        create_named_accessor_property(
            &mut ctx,
            obj,
            name,
            getter,
            CompactPtr::NULL,
            PropertyAttrs::ENUMERABLE,
        )
        .unwrap();

        let mut desc = own_property_descriptor(&mut ctx, obj, name).unwrap().unwrap();
        assert!(desc
            .flags
            .contains(DescriptorFlags::GET_DEFINED | DescriptorFlags::SET_DEFINED));
        assert!(desc.flags.contains(DescriptorFlags::ENUMERABLE));
        assert!(!desc.flags.contains(DescriptorFlags::CONFIGURABLE));
        assert_eq!(desc.getter, getter);
        assert_eq!(
            object::read_object(&ctx.heap, getter).refs(),
            2 * crate::object::OBJECT_REF_ONE
        );

        free_property_descriptor(&mut ctx, &mut desc);
        assert_eq!(
            object::read_object(&ctx.heap, getter).refs(),
            crate::object::OBJECT_REF_ONE
        );
        assert_eq!(desc, PropertyDescriptor::empty());
    }

    #[test]
    fn internal_properties_are_invisible_to_enumeration() {
        let mut ctx = new_ctx();
        let obj = create_object(&mut ctx, CompactPtr::NULL).unwrap();
        let name = intern(&mut ctx.heap, b"visible").unwrap();
        create_named_data_property(&mut ctx, obj, name, PropertyAttrs::all()).unwrap();
        create_internal_property(&mut ctx, obj, magic::NATIVE_POINTER, 0xbeef).unwrap();

        let names = own_enumerable_names(&ctx, obj);
        assert_eq!(names.len(), 1);

        let prop =
            find_named_property(&mut ctx, obj, PropName::magic(magic::NATIVE_POINTER)).unwrap();
        assert_eq!(record_of(&ctx.heap, prop).value, 0xbeef);
        assert_eq!(record_of(&ctx.heap, prop).kind(), PropertyKind::Internal);
    }

    #[test]
    fn clone_env_copies_names_attrs_and_values() {
        let mut ctx = new_ctx();
        let env = object::create_decl_lex_env(&mut ctx, CompactPtr::NULL).unwrap();
        let x = intern(&mut ctx.heap, b"x").unwrap();
        let y = intern(&mut ctx.heap, b"y").unwrap();
        let px = create_named_data_property(&mut ctx, env, x, PropertyAttrs::WRITABLE).unwrap();
        create_named_data_property(&mut ctx, env, y, PropertyAttrs::all()).unwrap();
        named_data_property_assign_value(&mut ctx, env, px, JSValue::make_int(5));

        object::object_ref(&mut ctx.heap, env).unwrap();
        let snapshot = clone_decl_lexical_environment(&mut ctx, env, true).unwrap();

        let px2 = find_named_property(&mut ctx, snapshot, x).unwrap();
        let rec = record_of(&ctx.heap, px2);
        assert_eq!(JSValue::from_raw(rec.value), JSValue::make_int(5));
        assert!(rec.is_writable());
        assert!(!rec.is_configurable());

        object::object_ref(&mut ctx.heap, snapshot).unwrap();
        let bare = clone_decl_lexical_environment(&mut ctx, snapshot, false).unwrap();
        let px3 = find_named_property(&mut ctx, bare, x).unwrap();
        assert!(JSValue::from_raw(record_of(&ctx.heap, px3).value).is_uninitialized());
    }

    #[test]
    fn teardown_releases_everything() {
        let mut ctx = new_ctx();
        let used_before = ctx.heap.stats().used;
        let obj = create_object(&mut ctx, CompactPtr::NULL).unwrap();
        for i in 0..40 {
            let label = format!("k{i}");
            let name = intern(&mut ctx.heap, label.as_bytes()).unwrap();
            let prop = create_named_data_property(&mut ctx, obj, name, PropertyAttrs::all()).unwrap();
            // drop our interning reference; the record keeps its own
            string_deref(&mut ctx.heap, name.string_cp());
            let _ = prop;
        }
        assert!(ctx.has_property_hashmap(obj));
        object::object_deref(&mut ctx, obj);
        assert_eq!(ctx.heap.stats().used, used_before);
    }
}
