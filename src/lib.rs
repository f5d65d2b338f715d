//! Property storage and lookup core of an embedded JavaScript engine.
//!
//! Three cooperating subsystems resolve a property name to a slot:
//! the per-object property list (the authoritative store), the optional
//! per-object hashmap accelerator, and the process-wide lookup cache.
//! Everything lives in one compact-pointer heap arena owned by the
//! [`context::JSContext`] threaded through every entry point.

pub mod bytecode;
pub mod context;
pub mod cptr;
pub mod error_ref;
pub mod hashmap;
pub mod heap;
pub mod jsvalue;
pub mod lcache;
pub mod name;
pub mod object;
pub mod property;
pub mod proplist;
