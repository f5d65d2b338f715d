use crate::context::{FatalCode, JSContext};
use crate::cptr::CompactPtr;
use crate::heap::Heap;
use crate::proplist;
use core::mem::size_of;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

// type_flags_refs layout: bits 0-1 object kind, bit 2 extensible,
// bits 3-15 reference counter.
const OBJECT_KIND_MASK: u16 = 0x3;
const OBJECT_FLAG_EXTENSIBLE: u16 = 1 << 2;
pub const OBJECT_REF_ONE: u16 = 1 << 3;
const OBJECT_MAX_REFS: u16 = u16::MAX & !(OBJECT_REF_ONE - 1);

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ObjectKind {
    Ordinary = 0,
    DeclarativeEnv = 1,
    ObjectBoundEnv = 2,
}

/// Object or lexical-environment record.
///
/// `property_header_cp` names the property list for ordinary objects and
/// declarative environments; for object-bound environments the same field
/// holds the binding object instead (such environments never own properties).
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ObjectRecord {
    pub type_flags_refs: u16,
    _reserved: u16,
    pub property_header_cp: u32,
    pub proto_or_outer_cp: u32,
}

pub const OBJECT_RECORD_SIZE: usize = 12;
const _: () = assert!(size_of::<ObjectRecord>() == OBJECT_RECORD_SIZE);

impl ObjectRecord {
    pub fn kind(self) -> ObjectKind {
        match self.type_flags_refs & OBJECT_KIND_MASK {
            1 => ObjectKind::DeclarativeEnv,
            2 => ObjectKind::ObjectBoundEnv,
            _ => ObjectKind::Ordinary,
        }
    }

    pub fn refs(self) -> u16 {
        self.type_flags_refs & !(OBJECT_REF_ONE - 1)
    }
}

fn create(ctx: &mut JSContext, kind: ObjectKind, flags: u16, link: CompactPtr) -> Result<CompactPtr, FatalCode> {
    let cp = ctx.heap.alloc_block(OBJECT_RECORD_SIZE)?;
    ctx.heap.write(
        cp.offset(),
        ObjectRecord {
            type_flags_refs: kind as u16 | flags | OBJECT_REF_ONE,
            _reserved: 0,
            property_header_cp: CompactPtr::NULL.raw(),
            proto_or_outer_cp: link.raw(),
        },
    );
    Ok(cp)
}

/// Create an ordinary object with the given prototype (NULL for none).
/// The reference counter starts at one; the object is extensible.
pub fn create_object(ctx: &mut JSContext, proto: CompactPtr) -> Result<CompactPtr, FatalCode> {
    create(ctx, ObjectKind::Ordinary, OBJECT_FLAG_EXTENSIBLE, proto)
}

/// Create a declarative lexical environment nested in `outer` (NULL for the
/// global scope).
pub fn create_decl_lex_env(ctx: &mut JSContext, outer: CompactPtr) -> Result<CompactPtr, FatalCode> {
    create(ctx, ObjectKind::DeclarativeEnv, 0, outer)
}

/// Create an object-bound lexical environment over `binding`.
pub fn create_object_lex_env(
    ctx: &mut JSContext,
    outer: CompactPtr,
    binding: CompactPtr,
) -> Result<CompactPtr, FatalCode> {
    debug_assert!(!binding.is_null());
    debug_assert!(!is_lexical_environment(&ctx.heap, binding));
    let cp = create(ctx, ObjectKind::ObjectBoundEnv, 0, outer)?;
    let mut rec: ObjectRecord = ctx.heap.read(cp.offset());
    rec.property_header_cp = binding.raw();
    ctx.heap.write(cp.offset(), rec);
    Ok(cp)
}

pub fn read_object(heap: &Heap, obj: CompactPtr) -> ObjectRecord {
    debug_assert!(!obj.is_null());
    heap.read(obj.offset())
}

pub fn is_lexical_environment(heap: &Heap, obj: CompactPtr) -> bool {
    read_object(heap, obj).kind() != ObjectKind::Ordinary
}

pub fn lex_env_outer(heap: &Heap, env: CompactPtr) -> CompactPtr {
    let rec = read_object(heap, env);
    debug_assert!(rec.kind() != ObjectKind::Ordinary);
    CompactPtr::from_raw(rec.proto_or_outer_cp)
}

pub fn lex_env_binding_object(heap: &Heap, env: CompactPtr) -> CompactPtr {
    let rec = read_object(heap, env);
    debug_assert!(rec.kind() == ObjectKind::ObjectBoundEnv);
    CompactPtr::from_raw(rec.property_header_cp)
}

pub fn is_extensible(heap: &Heap, obj: CompactPtr) -> bool {
    let rec = read_object(heap, obj);
    debug_assert!(rec.kind() == ObjectKind::Ordinary);
    rec.type_flags_refs & OBJECT_FLAG_EXTENSIBLE != 0
}

pub fn set_extensible(heap: &mut Heap, obj: CompactPtr, extensible: bool) {
    let mut rec = read_object(heap, obj);
    debug_assert!(rec.kind() == ObjectKind::Ordinary);
    if extensible {
        rec.type_flags_refs |= OBJECT_FLAG_EXTENSIBLE;
    } else {
        rec.type_flags_refs &= !OBJECT_FLAG_EXTENSIBLE;
    }
    heap.write(obj.offset(), rec);
}

/// Saturating reference increment; the cap is a fatal condition.
pub fn object_ref(heap: &mut Heap, obj: CompactPtr) -> Result<(), FatalCode> {
    let mut rec = read_object(heap, obj);
    if rec.refs() >= OBJECT_MAX_REFS {
        return Err(FatalCode::RefCountLimit);
    }
    rec.type_flags_refs += OBJECT_REF_ONE;
    heap.write(obj.offset(), rec);
    Ok(())
}

/// Drop one reference; the last one tears the object down. Teardown walks the
/// property list through `free_property` (the only reentrant path into the
/// core, and the only moment a list may be observed mid-destruction).
pub fn object_deref(ctx: &mut JSContext, obj: CompactPtr) {
    let mut rec = read_object(&ctx.heap, obj);
    debug_assert!(rec.refs() >= OBJECT_REF_ONE);
    rec.type_flags_refs -= OBJECT_REF_ONE;
    if rec.refs() > 0 {
        ctx.heap.write(obj.offset(), rec);
        return;
    }
    if rec.kind() != ObjectKind::ObjectBoundEnv {
        proplist::free_property_list(ctx, obj);
    }
    ctx.heap.free_block(obj, OBJECT_RECORD_SIZE);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextConfig, JSContext};

    fn new_ctx() -> JSContext {
        JSContext::new(ContextConfig::default()).expect("context init")
    }

    #[test]
    fn object_starts_extensible_with_one_ref() {
        let mut ctx = new_ctx();
        let obj = create_object(&mut ctx, CompactPtr::NULL).unwrap();
        let rec = read_object(&ctx.heap, obj);
        assert_eq!(rec.kind(), ObjectKind::Ordinary);
        assert_eq!(rec.refs(), OBJECT_REF_ONE);
        assert!(is_extensible(&ctx.heap, obj));
        assert!(!is_lexical_environment(&ctx.heap, obj));
    }

    #[test]
    fn env_links_outer_and_binding() {
        let mut ctx = new_ctx();
        let global = create_decl_lex_env(&mut ctx, CompactPtr::NULL).unwrap();
        let inner = create_decl_lex_env(&mut ctx, global).unwrap();
        assert!(is_lexical_environment(&ctx.heap, inner));
        assert_eq!(lex_env_outer(&ctx.heap, inner), global);

        let binding = create_object(&mut ctx, CompactPtr::NULL).unwrap();
        let obj_env = create_object_lex_env(&mut ctx, global, binding).unwrap();
        assert_eq!(lex_env_binding_object(&ctx.heap, obj_env), binding);
    }

    #[test]
    fn deref_frees_the_record() {
        let mut ctx = new_ctx();
        let used_before = ctx.heap.stats().used;
        let obj = create_object(&mut ctx, CompactPtr::NULL).unwrap();
        object_ref(&mut ctx.heap, obj).unwrap();
        object_deref(&mut ctx, obj);
        assert!(ctx.heap.stats().used > used_before);
        object_deref(&mut ctx, obj);
        assert_eq!(ctx.heap.stats().used, used_before);
    }

    #[test]
    fn ref_saturation_is_fatal() {
        let mut ctx = new_ctx();
        let obj = create_object(&mut ctx, CompactPtr::NULL).unwrap();
        let mut rec = read_object(&ctx.heap, obj);
        rec.type_flags_refs |= OBJECT_MAX_REFS;
        ctx.heap.write(obj.offset(), rec);
        assert_eq!(object_ref(&mut ctx.heap, obj), Err(FatalCode::RefCountLimit));
    }
}
