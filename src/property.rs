use crate::context::FatalCode;
use crate::cptr::{CompactPtr, CpWidth};
use crate::heap::Heap;
use crate::jsvalue::JSValue;
use crate::name::{magic, NameType, PropName};
use bitflags::bitflags;
use core::mem::size_of;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

// type_flags layout: bits 0-1 storage type, bits 2-4 attributes,
// bit 5 lookup-cache presence, bits 6-7 name type.
pub const PROPERTY_TYPE_MASK: u8 = 0x3;
pub const PROPERTY_TYPE_SPECIAL: u8 = 0;
pub const PROPERTY_TYPE_NAMED_DATA: u8 = 1;
pub const PROPERTY_TYPE_NAMED_ACCESSOR: u8 = 2;
pub const PROPERTY_TYPE_INTERNAL: u8 = 3;
/// Read-only computed views share the internal storage encoding; the two are
/// told apart by the name (internal properties carry reserved magic names).
pub const PROPERTY_TYPE_VIRTUAL: u8 = PROPERTY_TYPE_INTERNAL;

pub const PROPERTY_FLAG_LCACHED: u8 = 1 << 5;
pub const PROPERTY_NAME_TYPE_SHIFT: u8 = 6;

/// `type_flags` byte of a deleted slot: special type with a magic name tag.
pub const PROPERTY_TYPE_FLAGS_DELETED: u8 =
    PROPERTY_TYPE_SPECIAL | ((NameType::Magic as u8) << PROPERTY_NAME_TYPE_SHIFT);

bitflags! {
    /// Attribute bits, positioned so they OR directly into `type_flags`.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct PropertyAttrs: u8 {
        const CONFIGURABLE = 1 << 2;
        const ENUMERABLE = 1 << 3;
        const WRITABLE = 1 << 4;
    }
}

pub const PROPERTY_ATTRS_MASK: u8 = PropertyAttrs::all().bits();

const _: () = assert!(PROPERTY_ATTRS_MASK & PROPERTY_TYPE_MASK == 0);
const _: () = assert!(PROPERTY_ATTRS_MASK & PROPERTY_FLAG_LCACHED == 0);
const _: () = assert!(PROPERTY_ATTRS_MASK & (0x3 << PROPERTY_NAME_TYPE_SHIFT) == 0);

/// Six-way classification of a slot, derived from the storage type bits and
/// the name.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PropertyKind {
    NamedData,
    NamedAccessor,
    Internal,
    Virtual,
    Special,
    Deleted,
}

/// One property slot. Fixed 12-byte layout; the list header occupies the
/// same stride, which keeps slot indices 1-based.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct PropertyRecord {
    pub type_flags: u8,
    _reserved: u8,
    /// Flat index of this record's lookup-cache entry; meaningful only while
    /// the LCACHED flag is set.
    pub lcache_id: u16,
    /// Compact pointer to the name, or the direct-name payload.
    pub name_cp: u32,
    /// Value word, accessor pair, or engine-private payload.
    pub value: u32,
}

pub const PROPERTY_RECORD_SIZE: usize = 12;
const _: () = assert!(size_of::<PropertyRecord>() == PROPERTY_RECORD_SIZE);

impl PropertyRecord {
    pub fn new(type_and_flags: u8, name: PropName, value: u32) -> Self {
        debug_assert!(type_and_flags & (0x3 << PROPERTY_NAME_TYPE_SHIFT) == 0);
        Self {
            type_flags: type_and_flags | ((name.name_type() as u8) << PROPERTY_NAME_TYPE_SHIFT),
            _reserved: 0,
            lcache_id: 0,
            name_cp: name.record_name_cp(),
            value,
        }
    }

    pub const fn property_type(self) -> u8 {
        self.type_flags & PROPERTY_TYPE_MASK
    }

    pub const fn name_type(self) -> NameType {
        NameType::from_bits(self.type_flags >> PROPERTY_NAME_TYPE_SHIFT)
    }

    pub fn name(self) -> PropName {
        PropName::from_record(self.name_cp, self.name_type())
    }

    pub fn is_deleted(self) -> bool {
        self.type_flags == PROPERTY_TYPE_FLAGS_DELETED && self.name_cp == magic::DELETED
    }

    pub fn is_named(self) -> bool {
        matches!(
            self.property_type(),
            PROPERTY_TYPE_NAMED_DATA | PROPERTY_TYPE_NAMED_ACCESSOR
        )
    }

    pub fn kind(self) -> PropertyKind {
        match self.property_type() {
            PROPERTY_TYPE_NAMED_DATA => PropertyKind::NamedData,
            PROPERTY_TYPE_NAMED_ACCESSOR => PropertyKind::NamedAccessor,
            PROPERTY_TYPE_INTERNAL => {
                if self.name_type() == NameType::Magic && self.name_cp >= magic::FIRST_INTERNAL {
                    PropertyKind::Internal
                } else {
                    PropertyKind::Virtual
                }
            }
            _ => {
                if self.is_deleted() {
                    PropertyKind::Deleted
                } else {
                    PropertyKind::Special
                }
            }
        }
    }

    /// Single-comparison name match used by the direct fast paths.
    pub fn matches_name(self, name: PropName) -> bool {
        self.name_cp == name.record_name_cp() && self.name_type() == name.name_type()
    }

    pub fn attrs(self) -> PropertyAttrs {
        PropertyAttrs::from_bits_truncate(self.type_flags)
    }

    pub fn is_writable(self) -> bool {
        debug_assert!(matches!(
            self.property_type(),
            PROPERTY_TYPE_NAMED_DATA | PROPERTY_TYPE_VIRTUAL
        ));
        self.type_flags & PropertyAttrs::WRITABLE.bits() != 0
    }

    pub fn set_writable(&mut self, writable: bool) {
        debug_assert!(self.property_type() == PROPERTY_TYPE_NAMED_DATA);
        self.set_attr_bit(PropertyAttrs::WRITABLE.bits(), writable);
    }

    pub fn is_enumerable(self) -> bool {
        debug_assert!(self.is_named() || self.property_type() == PROPERTY_TYPE_VIRTUAL);
        self.type_flags & PropertyAttrs::ENUMERABLE.bits() != 0
    }

    pub fn set_enumerable(&mut self, enumerable: bool) {
        debug_assert!(self.is_named());
        self.set_attr_bit(PropertyAttrs::ENUMERABLE.bits(), enumerable);
    }

    pub fn is_configurable(self) -> bool {
        debug_assert!(self.is_named() || self.property_type() == PROPERTY_TYPE_VIRTUAL);
        self.type_flags & PropertyAttrs::CONFIGURABLE.bits() != 0
    }

    pub fn set_configurable(&mut self, configurable: bool) {
        debug_assert!(self.is_named());
        self.set_attr_bit(PropertyAttrs::CONFIGURABLE.bits(), configurable);
    }

    pub fn is_lcached(self) -> bool {
        debug_assert!(self.is_named() || self.property_type() == PROPERTY_TYPE_INTERNAL);
        self.type_flags & PROPERTY_FLAG_LCACHED != 0
    }

    pub fn set_lcached(&mut self, lcached: bool) {
        debug_assert!(self.is_named() || self.property_type() == PROPERTY_TYPE_INTERNAL);
        self.set_attr_bit(PROPERTY_FLAG_LCACHED, lcached);
    }

    fn set_attr_bit(&mut self, bit: u8, on: bool) {
        if on {
            self.type_flags |= bit;
        } else {
            self.type_flags &= !bit;
        }
    }
}

/// Getter/setter pair of a named accessor; either half may be NULL.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct GetterSetterPair {
    pub getter_cp: u32,
    pub setter_cp: u32,
}

const _: () = assert!(size_of::<GetterSetterPair>() == crate::heap::POOL_CHUNK_SIZE);

/// Build the accessor value word: the pair is packed inline on 16-bit
/// pointers and stored behind a pooled allocation on 32-bit pointers.
pub fn make_accessor_value(
    heap: &mut Heap,
    width: CpWidth,
    getter: CompactPtr,
    setter: CompactPtr,
) -> Result<u32, FatalCode> {
    match width {
        CpWidth::Cp16 => {
            debug_assert!(getter.raw() <= 0xffff && setter.raw() <= 0xffff);
            Ok(getter.raw() | (setter.raw() << 16))
        }
        CpWidth::Cp32 => {
            let pair_cp = heap.pool_alloc()?;
            heap.write(
                pair_cp.offset(),
                GetterSetterPair {
                    getter_cp: getter.raw(),
                    setter_cp: setter.raw(),
                },
            );
            Ok(pair_cp.raw())
        }
    }
}

pub fn accessor_pair(heap: &Heap, width: CpWidth, value: u32) -> GetterSetterPair {
    match width {
        CpWidth::Cp16 => GetterSetterPair {
            getter_cp: value & 0xffff,
            setter_cp: value >> 16,
        },
        CpWidth::Cp32 => heap.read(CompactPtr::from_raw(value).offset()),
    }
}

/// Replace the getter half in O(1); returns the record's new value word
/// (unchanged on 32-bit pointers, where the pooled pair is written through).
pub fn replace_accessor_getter(
    heap: &mut Heap,
    width: CpWidth,
    value: u32,
    getter: CompactPtr,
) -> u32 {
    match width {
        CpWidth::Cp16 => {
            debug_assert!(getter.raw() <= 0xffff);
            (value & 0xffff_0000) | getter.raw()
        }
        CpWidth::Cp32 => {
            let pair_cp = CompactPtr::from_raw(value);
            let mut pair: GetterSetterPair = heap.read(pair_cp.offset());
            pair.getter_cp = getter.raw();
            heap.write(pair_cp.offset(), pair);
            value
        }
    }
}

pub fn replace_accessor_setter(
    heap: &mut Heap,
    width: CpWidth,
    value: u32,
    setter: CompactPtr,
) -> u32 {
    match width {
        CpWidth::Cp16 => {
            debug_assert!(setter.raw() <= 0xffff);
            (value & 0x0000_ffff) | (setter.raw() << 16)
        }
        CpWidth::Cp32 => {
            let pair_cp = CompactPtr::from_raw(value);
            let mut pair: GetterSetterPair = heap.read(pair_cp.offset());
            pair.setter_cp = setter.raw();
            heap.write(pair_cp.offset(), pair);
            value
        }
    }
}

/// Release the out-of-line pair, if the width uses one.
pub fn free_accessor_value(heap: &mut Heap, width: CpWidth, value: u32) {
    if width == CpWidth::Cp32 {
        heap.pool_free(CompactPtr::from_raw(value));
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct DescriptorFlags: u16 {
        const VALUE_DEFINED = 1 << 0;
        const GET_DEFINED = 1 << 1;
        const SET_DEFINED = 1 << 2;
        const WRITABLE_DEFINED = 1 << 3;
        const ENUMERABLE_DEFINED = 1 << 4;
        const CONFIGURABLE_DEFINED = 1 << 5;
        const WRITABLE = 1 << 6;
        const ENUMERABLE = 1 << 7;
        const CONFIGURABLE = 1 << 8;
    }
}

/// Own-property descriptor as handed to the layers above.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PropertyDescriptor {
    pub flags: DescriptorFlags,
    pub value: JSValue,
    pub getter: CompactPtr,
    pub setter: CompactPtr,
}

impl PropertyDescriptor {
    pub fn empty() -> Self {
        Self {
            flags: DescriptorFlags::empty(),
            value: crate::jsvalue::JS_UNDEFINED,
            getter: CompactPtr::NULL,
            setter: CompactPtr::NULL,
        }
    }
}
