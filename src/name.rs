use crate::context::FatalCode;
use crate::cptr::CompactPtr;
use crate::heap::Heap;
use core::hash::Hasher;
use core::mem::size_of;
use rustc_hash::FxHasher;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Name tag carried both in `PropName` and mirrored in the high bits of a
/// property record's `type_flags`, so a name match is a single comparison.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NameType {
    /// Indirect name: payload is a compact pointer to a heap string record.
    Ptr = 0,
    /// Direct engine-reserved name: payload is a magic identifier.
    Magic = 1,
    /// Direct array-index name: payload is the integer index.
    Uint = 2,
}

impl NameType {
    pub const fn from_bits(bits: u8) -> Self {
        match bits & 0x3 {
            1 => NameType::Magic,
            2 => NameType::Uint,
            _ => NameType::Ptr,
        }
    }
}

/// Magic identifiers. Values at or above `FIRST_INTERNAL` name engine-private
/// internal properties; `DELETED` marks tombstoned property slots.
pub mod magic {
    pub const FIRST_INTERNAL: u32 = 0x100;
    pub const DELETED: u32 = 0x100;
    pub const NATIVE_POINTER: u32 = 0x101;
    pub const ENVIRONMENT_RECORD: u32 = 0x102;
}

/// Property name handle: two tag bits plus a payload.
///
/// Direct names (`Magic`, `Uint`) carry their payload inline and never touch
/// the heap; `Ptr` names reference a refcounted heap string record.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct PropName(u32);

const NAME_TYPE_BITS: u32 = 2;

impl PropName {
    pub fn from_string(cp: CompactPtr) -> Self {
        debug_assert!(!cp.is_null());
        Self((cp.raw() << NAME_TYPE_BITS) | NameType::Ptr as u32)
    }

    pub const fn magic(value: u32) -> Self {
        Self((value << NAME_TYPE_BITS) | NameType::Magic as u32)
    }

    pub const fn uint(value: u32) -> Self {
        Self((value << NAME_TYPE_BITS) | NameType::Uint as u32)
    }

    pub const fn name_type(self) -> NameType {
        NameType::from_bits((self.0 & 0x3) as u8)
    }

    pub fn is_direct(self) -> bool {
        self.name_type() != NameType::Ptr
    }

    pub fn direct_type(self) -> u8 {
        debug_assert!(self.is_direct());
        (self.0 & 0x3) as u8
    }

    pub const fn direct_value(self) -> u32 {
        self.0 >> NAME_TYPE_BITS
    }

    pub fn string_cp(self) -> CompactPtr {
        debug_assert!(self.name_type() == NameType::Ptr);
        CompactPtr::from_raw(self.0 >> NAME_TYPE_BITS)
    }

    /// The word stored in a property record's `name_cp` field: the string's
    /// compact pointer, or the direct payload.
    pub const fn record_name_cp(self) -> u32 {
        self.0 >> NAME_TYPE_BITS
    }

    /// Rebuild a handle from record storage.
    pub fn from_record(name_cp: u32, name_type: NameType) -> Self {
        Self((name_cp << NAME_TYPE_BITS) | name_type as u32)
    }
}

/// Heap string record header; character bytes follow immediately.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct StringHeader {
    pub refs: u16,
    pub len: u16,
    pub hash: u32,
}

pub const STRING_HEADER_SIZE: usize = size_of::<StringHeader>();
const _: () = assert!(STRING_HEADER_SIZE == 8);

const STRING_MAX_REFS: u16 = u16::MAX;

fn string_alloc_size(len: usize) -> usize {
    STRING_HEADER_SIZE + len
}

/// Largest payload a direct array-index name can carry.
pub const DIRECT_UINT_MAX: u32 = (1 << 28) - 1;

/// Canonical array-index strings become direct names, so equal contents
/// resolve to one identity regardless of how the name was produced.
fn parse_array_index(bytes: &[u8]) -> Option<u32> {
    if bytes.is_empty() || bytes.len() > 10 {
        return None;
    }
    if bytes.len() > 1 && bytes[0] == b'0' {
        return None;
    }
    let mut value: u64 = 0;
    for &byte in bytes {
        if !byte.is_ascii_digit() {
            return None;
        }
        value = value * 10 + (byte - b'0') as u64;
    }
    (value <= DIRECT_UINT_MAX as u64).then_some(value as u32)
}

/// Intern a property name. Canonical numeric strings come back as direct
/// `Uint` names; everything else allocates a string record holding one
/// reference.
pub fn intern(heap: &mut Heap, bytes: &[u8]) -> Result<PropName, FatalCode> {
    debug_assert!(bytes.len() <= u16::MAX as usize);
    if let Some(value) = parse_array_index(bytes) {
        return Ok(PropName::uint(value));
    }
    let cp = heap.alloc_block(string_alloc_size(bytes.len()))?;
    let header = StringHeader {
        refs: 1,
        len: bytes.len() as u16,
        hash: hash_bytes(bytes),
    };
    heap.write(cp.offset(), header);
    heap.bytes_mut(cp.offset() + STRING_HEADER_SIZE, bytes.len())
        .copy_from_slice(bytes);
    Ok(PropName::from_string(cp))
}

pub fn string_bytes(heap: &Heap, cp: CompactPtr) -> &[u8] {
    let header: StringHeader = heap.read(cp.offset());
    heap.bytes(cp.offset() + STRING_HEADER_SIZE, header.len as usize)
}

pub fn string_hash(heap: &Heap, cp: CompactPtr) -> u32 {
    let header: StringHeader = heap.read(cp.offset());
    header.hash
}

/// Saturating 16-bit refcount; the cap is a fatal condition.
pub fn string_ref(heap: &mut Heap, cp: CompactPtr) -> Result<(), FatalCode> {
    let mut header: StringHeader = heap.read(cp.offset());
    if header.refs >= STRING_MAX_REFS {
        return Err(FatalCode::RefCountLimit);
    }
    header.refs += 1;
    heap.write(cp.offset(), header);
    Ok(())
}

pub fn string_deref(heap: &mut Heap, cp: CompactPtr) {
    let mut header: StringHeader = heap.read(cp.offset());
    debug_assert!(header.refs > 0);
    header.refs -= 1;
    if header.refs == 0 {
        let size = string_alloc_size(header.len as usize);
        heap.free_block(cp, size);
    } else {
        heap.write(cp.offset(), header);
    }
}

/// Deep comparison of two indirect names: hash check, then bytes.
pub fn equal_nondirect(heap: &Heap, a: CompactPtr, b: CompactPtr) -> bool {
    if a == b {
        return true;
    }
    let ha: StringHeader = heap.read(a.offset());
    let hb: StringHeader = heap.read(b.offset());
    if ha.hash != hb.hash || ha.len != hb.len {
        return false;
    }
    string_bytes(heap, a) == string_bytes(heap, b)
}

/// Name equality as the resolution protocol sees it: direct names compare as
/// a (type, payload) pair, indirect names fall back to deep comparison.
pub fn names_equal(heap: &Heap, a: PropName, b: PropName) -> bool {
    if a == b {
        return true;
    }
    if a.name_type() != b.name_type() || a.is_direct() {
        return false;
    }
    equal_nondirect(heap, a.string_cp(), b.string_cp())
}

/// Hash of a property name; stable for the lifetime of the name.
pub fn name_hash(heap: &Heap, name: PropName) -> u32 {
    match name.name_type() {
        NameType::Ptr => string_hash(heap, name.string_cp()),
        _ => hash_direct(name.0),
    }
}

fn hash_bytes(bytes: &[u8]) -> u32 {
    let mut hasher = FxHasher::default();
    hasher.write(bytes);
    fold_hash(hasher.finish())
}

fn hash_direct(raw: u32) -> u32 {
    let mut hasher = FxHasher::default();
    hasher.write_u32(raw);
    fold_hash(hasher.finish())
}

fn fold_hash(hash: u64) -> u32 {
    (hash ^ (hash >> 32)) as u32
}
