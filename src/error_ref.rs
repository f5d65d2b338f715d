use crate::context::{FatalCode, JSContext};
use crate::cptr::CompactPtr;
use crate::heap::{Heap, POOL_CHUNK_SIZE};
use crate::jsvalue::{copy_value, free_value, JSValue};
use core::mem::size_of;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Refcounted carrier for a thrown value travelling outside the engine.
/// Bit 0 distinguishes aborts from ordinary exceptions; the remaining bits
/// count references in steps of `ERROR_REF_ONE`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ErrorRefRecord {
    pub refs_and_flags: u16,
    _reserved: u16,
    pub value: u32,
}

const _: () = assert!(size_of::<ErrorRefRecord>() == POOL_CHUNK_SIZE);

pub const ERROR_REF_ABORT: u16 = 1;
pub const ERROR_REF_ONE: u16 = 2;
const ERROR_MAX_REF: u16 = u16::MAX - 1;

/// Wrap a value in a fresh error reference. Takes ownership of the value.
pub fn create_error_reference(
    ctx: &mut JSContext,
    value: JSValue,
    is_exception: bool,
) -> Result<JSValue, FatalCode> {
    debug_assert!(!value.is_error_ref());
    let cp = ctx.heap.pool_alloc()?;
    ctx.heap.write(
        cp.offset(),
        ErrorRefRecord {
            refs_and_flags: ERROR_REF_ONE | if is_exception { 0 } else { ERROR_REF_ABORT },
            _reserved: 0,
            value: value.raw(),
        },
    );
    Ok(JSValue::make_error_ref(cp))
}

/// Capture the pending thrown value as an error reference.
pub fn create_error_reference_from_context(ctx: &mut JSContext) -> Result<JSValue, FatalCode> {
    let is_abort = ctx.has_pending_abort();
    if is_abort {
        ctx.set_abort_flag(false);
    }
    let value = ctx.take_exception();
    create_error_reference(ctx, value, !is_abort)
}

/// Saturating 16-bit reference increment; the cap is fatal.
pub fn ref_error_reference(heap: &mut Heap, cp: CompactPtr) -> Result<(), FatalCode> {
    let mut record: ErrorRefRecord = heap.read(cp.offset());
    if record.refs_and_flags >= ERROR_MAX_REF {
        return Err(FatalCode::RefCountLimit);
    }
    record.refs_and_flags += ERROR_REF_ONE;
    heap.write(cp.offset(), record);
    Ok(())
}

/// Drop one reference; the last one releases the held value and the record.
pub fn deref_error_reference(ctx: &mut JSContext, cp: CompactPtr) {
    let mut record: ErrorRefRecord = ctx.heap.read(cp.offset());
    debug_assert!(record.refs_and_flags >= ERROR_REF_ONE);
    record.refs_and_flags -= ERROR_REF_ONE;
    if record.refs_and_flags < ERROR_REF_ONE {
        free_value(ctx, JSValue::from_raw(record.value));
        ctx.heap.pool_free(cp);
    } else {
        ctx.heap.write(cp.offset(), record);
    }
}

/// Re-raise the referenced value in the context, restoring the abort flag.
/// Drops one reference: the last reference transfers the value, earlier ones
/// hand out a copy.
pub fn raise_error_from_error_reference(
    ctx: &mut JSContext,
    value: JSValue,
) -> Result<(), FatalCode> {
    debug_assert!(!ctx.has_pending_exception() && !ctx.has_pending_abort());
    debug_assert!(value.is_error_ref());
    let cp = value.get_ptr();
    let mut record: ErrorRefRecord = ctx.heap.read(cp.offset());
    debug_assert!(record.refs_and_flags >= ERROR_REF_ONE);

    let abort = record.refs_and_flags & ERROR_REF_ABORT != 0;
    let mut referenced = JSValue::from_raw(record.value);
    if record.refs_and_flags >= 2 * ERROR_REF_ONE {
        record.refs_and_flags -= ERROR_REF_ONE;
        ctx.heap.write(cp.offset(), record);
        referenced = copy_value(ctx, referenced)?;
    } else {
        ctx.heap.pool_free(cp);
    }

    ctx.set_exception(referenced);
    ctx.set_abort_flag(abort);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextConfig, JSContext};
    use crate::name::intern;

    fn new_ctx() -> JSContext {
        JSContext::new(ContextConfig::default()).expect("context init")
    }

    #[test]
    fn create_and_raise_roundtrip() {
        let mut ctx = new_ctx();
        let err = create_error_reference(&mut ctx, JSValue::make_int(3), true).unwrap();
        assert!(err.is_error_ref());
        raise_error_from_error_reference(&mut ctx, err).unwrap();
        assert!(ctx.has_pending_exception());
        assert!(!ctx.has_pending_abort());
        assert_eq!(ctx.take_exception(), JSValue::make_int(3));
    }

    #[test]
    fn abort_flag_travels_with_the_reference() {
        let mut ctx = new_ctx();
        ctx.set_exception(JSValue::make_int(9));
        ctx.set_abort_flag(true);
        let err = create_error_reference_from_context(&mut ctx).unwrap();
        assert!(!ctx.has_pending_exception());

        raise_error_from_error_reference(&mut ctx, err).unwrap();
        assert!(ctx.has_pending_abort());
        assert_eq!(ctx.take_exception(), JSValue::make_int(9));
    }

    #[test]
    fn last_reference_frees_the_value() {
        let mut ctx = new_ctx();
        let used_before = ctx.heap.stats().used;
        let text = intern(&mut ctx.heap, b"thrown").unwrap();
        let err = create_error_reference(&mut ctx, JSValue::make_string(text.string_cp()), true)
            .unwrap();
        ref_error_reference(&mut ctx.heap, err.get_ptr()).unwrap();
        deref_error_reference(&mut ctx, err.get_ptr());
        assert!(ctx.heap.stats().used > used_before);
        deref_error_reference(&mut ctx, err.get_ptr());
        assert_eq!(ctx.heap.stats().used, used_before);
    }

    #[test]
    fn shared_reference_raises_a_copy() {
        let mut ctx = new_ctx();
        let text = intern(&mut ctx.heap, b"shared").unwrap();
        let err = create_error_reference(&mut ctx, JSValue::make_string(text.string_cp()), true)
            .unwrap();
        ref_error_reference(&mut ctx.heap, err.get_ptr()).unwrap();

        raise_error_from_error_reference(&mut ctx, err).unwrap();
        let raised = ctx.take_exception();
        assert!(raised.is_string());
        // the record survives with one reference left
        let record: ErrorRefRecord = ctx.heap.read(err.get_ptr().offset());
        assert_eq!(record.refs_and_flags & !ERROR_REF_ABORT, ERROR_REF_ONE);
        deref_error_reference(&mut ctx, err.get_ptr());
    }

    #[test]
    fn ref_saturation_is_fatal() {
        let mut ctx = new_ctx();
        let err = create_error_reference(&mut ctx, JSValue::make_int(0), true).unwrap();
        let cp = err.get_ptr();
        let mut record: ErrorRefRecord = ctx.heap.read(cp.offset());
        record.refs_and_flags = ERROR_MAX_REF;
        ctx.heap.write(cp.offset(), record);
        assert_eq!(
            ref_error_reference(&mut ctx.heap, cp),
            Err(FatalCode::RefCountLimit)
        );
    }
}
