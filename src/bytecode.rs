use crate::context::{FatalCode, JSContext};
use crate::cptr::{CompactPtr, ALIGNMENT, ALIGNMENT_LOG};
use crate::heap::Heap;
use bitflags::bitflags;
use core::mem::size_of;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct CodeFlags: u16 {
        /// Function block: the literal table references child blocks.
        const FUNCTION = 1 << 0;
        /// Baked into the image; never reclaimed.
        const STATIC_FUNCTION = 1 << 1;
        /// Excluded from debugger free notifications.
        const DEBUGGER_IGNORE = 1 << 2;
    }
}

/// Compiled-code block header; `literal_count` compact pointers follow.
/// `prev_cp` threads the debugger's pending-free chain.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct CompiledCodeHeader {
    pub refs: u16,
    pub status_flags: u16,
    /// Block size in allocation-granularity units.
    pub size_units: u16,
    pub literal_count: u16,
    pub prev_cp: u32,
}

pub const COMPILED_CODE_HEADER_SIZE: usize = size_of::<CompiledCodeHeader>();
const _: () = assert!(COMPILED_CODE_HEADER_SIZE == 12);

fn total_size(literal_count: usize) -> usize {
    COMPILED_CODE_HEADER_SIZE + literal_count * size_of::<u32>()
}

fn literal_offset(cp: CompactPtr, index: usize) -> usize {
    cp.offset() + COMPILED_CODE_HEADER_SIZE + index * size_of::<u32>()
}

/// Allocate a compiled-code block holding references to child blocks.
/// The reference counter starts at one.
pub fn alloc_compiled_code(
    ctx: &mut JSContext,
    flags: CodeFlags,
    literals: &[CompactPtr],
) -> Result<CompactPtr, FatalCode> {
    let size = total_size(literals.len());
    let cp = ctx.heap.alloc_block(size)?;
    let size_units = size.div_ceil(ALIGNMENT);
    debug_assert!(size_units <= u16::MAX as usize);
    ctx.heap.write(
        cp.offset(),
        CompiledCodeHeader {
            refs: 1,
            status_flags: flags.bits(),
            size_units: size_units as u16,
            literal_count: literals.len() as u16,
            prev_cp: CompactPtr::NULL.raw(),
        },
    );
    for (index, literal) in literals.iter().enumerate() {
        ctx.heap.write(literal_offset(cp, index), literal.raw());
    }
    Ok(cp)
}

pub fn read_compiled_code(heap: &Heap, cp: CompactPtr) -> CompiledCodeHeader {
    heap.read(cp.offset())
}

pub fn literal_at(heap: &Heap, cp: CompactPtr, index: usize) -> CompactPtr {
    let header = read_compiled_code(heap, cp);
    debug_assert!(index < header.literal_count as usize);
    CompactPtr::from_raw(heap.read(literal_offset(cp, index)))
}

/// Take a reference on a compiled-code block; overflow is fatal.
pub fn bytecode_ref(heap: &mut Heap, cp: CompactPtr) -> Result<(), FatalCode> {
    let mut header = read_compiled_code(heap, cp);
    if header.refs == u16::MAX {
        return Err(FatalCode::RefCountLimit);
    }
    header.refs += 1;
    heap.write(cp.offset(), header);
    Ok(())
}

/// Drop a reference. On the last one, function blocks release their literal
/// table (self references ignored) and the block is reclaimed — or parked on
/// the debugger's pending-free chain while a debugger is attached, so the
/// client is told before the memory goes away.
pub fn bytecode_deref(ctx: &mut JSContext, cp: CompactPtr) {
    let mut header = read_compiled_code(&ctx.heap, cp);
    debug_assert!(header.refs > 0);
    let flags = CodeFlags::from_bits_truncate(header.status_flags);
    debug_assert!(!flags.contains(CodeFlags::STATIC_FUNCTION));

    header.refs -= 1;
    ctx.heap.write(cp.offset(), header);
    if header.refs > 0 {
        return;
    }

    if flags.contains(CodeFlags::FUNCTION) {
        for index in 0..header.literal_count as usize {
            let literal = literal_at(&ctx.heap, cp, index);
            if !literal.is_null() && literal != cp {
                bytecode_deref(ctx, literal);
            }
        }
    }

    if ctx.debugger_connected() && !flags.contains(CodeFlags::DEBUGGER_IGNORE) {
        defer_free(ctx, cp);
        return;
    }

    let size = (header.size_units as usize) << ALIGNMENT_LOG;
    ctx.heap.free_block(cp, size);
}

fn defer_free(ctx: &mut JSContext, cp: CompactPtr) {
    let mut header = read_compiled_code(&ctx.heap, cp);
    header.prev_cp = CompactPtr::NULL.raw();
    ctx.heap.write(cp.offset(), header);

    if ctx.debugger_free_head.is_null() {
        ctx.debugger_free_tail = cp;
    } else {
        let head = ctx.debugger_free_head;
        let mut head_header = read_compiled_code(&ctx.heap, head);
        head_header.prev_cp = cp.raw();
        ctx.heap.write(head.offset(), head_header);
    }
    ctx.debugger_free_head = cp;
}

/// Release every block parked for the debugger (client notified or the
/// connection went away).
pub fn flush_debugger_pending_frees(ctx: &mut JSContext) {
    let mut cursor = ctx.debugger_free_tail;
    while !cursor.is_null() {
        let header = read_compiled_code(&ctx.heap, cursor);
        let next = CompactPtr::from_raw(header.prev_cp);
        let size = (header.size_units as usize) << ALIGNMENT_LOG;
        ctx.heap.free_block(cursor, size);
        cursor = next;
    }
    ctx.debugger_free_head = CompactPtr::NULL;
    ctx.debugger_free_tail = CompactPtr::NULL;
}
