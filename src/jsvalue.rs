use crate::context::{FatalCode, JSContext};
use crate::cptr::CompactPtr;
use crate::name::{string_deref, string_ref};
use crate::object::{object_deref, object_ref};

/// Tagged 32-bit value word: low `JS_TAG_BITS` select the tag, the payload
/// sits above. Heap-backed payloads carry a compact pointer.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct JSValue(u32);

pub const JS_TAG_BITS: u32 = 3;
const TAG_MASK: u32 = (1 << JS_TAG_BITS) - 1;

pub const JS_TAG_SIMPLE: u32 = 0;
pub const JS_TAG_INT: u32 = 1;
pub const JS_TAG_OBJECT: u32 = 2;
pub const JS_TAG_STRING: u32 = 3;
pub const JS_TAG_ERROR_REF: u32 = 4;

const SIMPLE_UNDEFINED: u32 = 0;
const SIMPLE_NULL: u32 = 1;
const SIMPLE_FALSE: u32 = 2;
const SIMPLE_TRUE: u32 = 3;
const SIMPLE_UNINITIALIZED: u32 = 4;
const SIMPLE_EMPTY: u32 = 5;

pub const JS_UNDEFINED: JSValue = JSValue::make_simple(SIMPLE_UNDEFINED);
pub const JS_NULL: JSValue = JSValue::make_simple(SIMPLE_NULL);
pub const JS_FALSE: JSValue = JSValue::make_simple(SIMPLE_FALSE);
pub const JS_TRUE: JSValue = JSValue::make_simple(SIMPLE_TRUE);
pub const JS_UNINITIALIZED: JSValue = JSValue::make_simple(SIMPLE_UNINITIALIZED);
pub const JS_EMPTY: JSValue = JSValue::make_simple(SIMPLE_EMPTY);

pub const JS_INT_MIN: i32 = -(1 << (31 - JS_TAG_BITS));
pub const JS_INT_MAX: i32 = (1 << (31 - JS_TAG_BITS)) - 1;

impl JSValue {
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn tag(self) -> u32 {
        self.0 & TAG_MASK
    }

    pub const fn payload(self) -> u32 {
        self.0 >> JS_TAG_BITS
    }

    const fn make_simple(payload: u32) -> Self {
        Self((payload << JS_TAG_BITS) | JS_TAG_SIMPLE)
    }

    pub fn make_int(value: i32) -> Self {
        debug_assert!((JS_INT_MIN..=JS_INT_MAX).contains(&value));
        Self(((value as u32) << JS_TAG_BITS) | JS_TAG_INT)
    }

    pub fn get_int(self) -> i32 {
        debug_assert!(self.is_int());
        (self.0 as i32) >> JS_TAG_BITS
    }

    pub fn make_object(cp: CompactPtr) -> Self {
        debug_assert!(!cp.is_null());
        Self((cp.raw() << JS_TAG_BITS) | JS_TAG_OBJECT)
    }

    pub fn make_string(cp: CompactPtr) -> Self {
        debug_assert!(!cp.is_null());
        Self((cp.raw() << JS_TAG_BITS) | JS_TAG_STRING)
    }

    pub fn make_error_ref(cp: CompactPtr) -> Self {
        debug_assert!(!cp.is_null());
        Self((cp.raw() << JS_TAG_BITS) | JS_TAG_ERROR_REF)
    }

    pub fn get_ptr(self) -> CompactPtr {
        debug_assert!(self.is_object() || self.is_string() || self.is_error_ref());
        CompactPtr::from_raw(self.payload())
    }

    pub const fn is_int(self) -> bool {
        self.tag() == JS_TAG_INT
    }

    pub const fn is_object(self) -> bool {
        self.tag() == JS_TAG_OBJECT
    }

    pub const fn is_string(self) -> bool {
        self.tag() == JS_TAG_STRING
    }

    pub const fn is_error_ref(self) -> bool {
        self.tag() == JS_TAG_ERROR_REF
    }

    pub fn is_undefined(self) -> bool {
        self == JS_UNDEFINED
    }

    pub fn is_uninitialized(self) -> bool {
        self == JS_UNINITIALIZED
    }

    pub fn is_bool(self) -> bool {
        self == JS_TRUE || self == JS_FALSE
    }
}

/// Take a reference for a copied value. Strings and objects are refcounted;
/// everything else is a plain word.
pub fn copy_value(ctx: &mut JSContext, value: JSValue) -> Result<JSValue, FatalCode> {
    if value.is_string() {
        string_ref(&mut ctx.heap, value.get_ptr())?;
    } else if value.is_object() {
        object_ref(&mut ctx.heap, value.get_ptr())?;
    }
    Ok(value)
}

/// Copy semantics used when snapshotting environments: object values are
/// shared without a new reference.
pub fn copy_value_if_not_object(ctx: &mut JSContext, value: JSValue) -> Result<JSValue, FatalCode> {
    if value.is_object() {
        return Ok(value);
    }
    copy_value(ctx, value)
}

pub fn free_value(ctx: &mut JSContext, value: JSValue) {
    if value.is_string() {
        string_deref(&mut ctx.heap, value.get_ptr());
    } else if value.is_object() {
        object_deref(ctx, value.get_ptr());
    }
}

pub fn free_value_if_not_object(ctx: &mut JSContext, value: JSValue) {
    if !value.is_object() {
        free_value(ctx, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_roundtrip() {
        assert_eq!(JSValue::make_int(111).get_int(), 111);
        assert_eq!(JSValue::make_int(-4).get_int(), -4);
        assert_eq!(JSValue::make_int(JS_INT_MIN).get_int(), JS_INT_MIN);
        assert_eq!(JSValue::make_int(JS_INT_MAX).get_int(), JS_INT_MAX);
    }

    #[test]
    fn simple_values_are_distinct() {
        let all = [JS_UNDEFINED, JS_NULL, JS_FALSE, JS_TRUE, JS_UNINITIALIZED, JS_EMPTY];
        for (i, a) in all.iter().enumerate() {
            for (j, b) in all.iter().enumerate() {
                assert_eq!(a == b, i == j);
            }
        }
    }

    #[test]
    fn pointer_payload_roundtrip() {
        let cp = CompactPtr::from_raw(0x1234);
        let val = JSValue::make_object(cp);
        assert!(val.is_object());
        assert!(!val.is_string());
        assert_eq!(val.get_ptr(), cp);
    }
}
