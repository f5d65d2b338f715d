use crate::cptr::{CompactPtr, CpWidth};
use crate::heap::{Heap, HeapStats};
use crate::jsvalue::{JSValue, JS_UNDEFINED};
use crate::lcache::LookupCache;
use crate::name::{self, PropName, NameType};
use crate::proplist::{self, PropertyListHeader};
use bitflags::bitflags;

/// Codes delivered through the host's fatal exit path. Modeled as an error
/// value so the embedder decides how to die.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FatalCode {
    OutOfMemory,
    RefCountLimit,
}

/// Host-controlled switch for hashmap growth, e.g. under memory pressure.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HashmapAllocState {
    On,
    Off,
}

bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct ContextFlags: u8 {
        const PENDING_EXCEPTION = 1 << 0;
        const PENDING_ABORT = 1 << 1;
        const DEBUGGER_CONNECTED = 1 << 2;
    }
}

/// Context construction parameters.
#[derive(Copy, Clone, Debug)]
pub struct ContextConfig {
    pub heap_size: usize,
    pub compact_pointer_width: CpWidth,
    pub hashmap_enabled: bool,
    pub lookup_cache_enabled: bool,
    /// List size at which a hashmap gets attached.
    pub minimum_hashmap_size: u16,
    pub lookup_cache_rows: usize,
    pub lookup_cache_row_len: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            heap_size: 256 * 1024,
            compact_pointer_width: CpWidth::Cp16,
            hashmap_enabled: true,
            lookup_cache_enabled: true,
            minimum_hashmap_size: 32,
            lookup_cache_rows: 128,
            lookup_cache_row_len: 2,
        }
    }
}

const MIN_CONTEXT_BYTES: usize = 1024;

#[derive(Debug)]
pub enum ContextError {
    MemoryTooSmall { min: usize, actual: usize },
    HeapTooLargeForWidth { max: usize, actual: usize },
    RowsNotPowerOfTwo(usize),
    RowLengthZero,
    LookupCacheTooLarge { max: usize, actual: usize },
    MinimumHashmapSizeZero,
}

/// Structural-event counters, cheap enough to keep in release builds.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct CoreStats {
    pub hashmaps_created: u32,
    pub hashmaps_rebuilt: u32,
    pub lcache_evictions: u32,
}

/// One engine instance: the heap, the process-wide lookup cache, and the
/// flags shared by every core entry point. Single-threaded by construction;
/// every operation takes `&mut JSContext`.
pub struct JSContext {
    pub(crate) heap: Heap,
    pub(crate) lcache: Option<LookupCache>,
    pub(crate) config: ContextConfig,
    pub(crate) hashmap_alloc_state: HashmapAllocState,
    pub(crate) error_value: JSValue,
    pub(crate) flags: ContextFlags,
    pub(crate) debugger_free_head: CompactPtr,
    pub(crate) debugger_free_tail: CompactPtr,
    pub(crate) stats: CoreStats,
}

impl JSContext {
    pub fn new(config: ContextConfig) -> Result<Self, ContextError> {
        if config.heap_size < MIN_CONTEXT_BYTES {
            return Err(ContextError::MemoryTooSmall {
                min: MIN_CONTEXT_BYTES,
                actual: config.heap_size,
            });
        }
        let max_heap = config.compact_pointer_width.max_heap_size();
        if config.heap_size > max_heap {
            return Err(ContextError::HeapTooLargeForWidth {
                max: max_heap,
                actual: config.heap_size,
            });
        }
        if !config.lookup_cache_rows.is_power_of_two() {
            return Err(ContextError::RowsNotPowerOfTwo(config.lookup_cache_rows));
        }
        if config.lookup_cache_row_len == 0 {
            return Err(ContextError::RowLengthZero);
        }
        let entries = config.lookup_cache_rows * config.lookup_cache_row_len;
        if entries > u16::MAX as usize + 1 {
            return Err(ContextError::LookupCacheTooLarge {
                max: u16::MAX as usize + 1,
                actual: entries,
            });
        }
        if config.minimum_hashmap_size == 0 {
            return Err(ContextError::MinimumHashmapSizeZero);
        }

        let lcache = config.lookup_cache_enabled.then(|| {
            LookupCache::new(
                config.lookup_cache_rows,
                config.lookup_cache_row_len,
                config.compact_pointer_width,
            )
        });
        tracing::debug!(
            heap_size = config.heap_size,
            hashmap = config.hashmap_enabled,
            lcache = config.lookup_cache_enabled,
            "engine context created"
        );
        Ok(Self {
            heap: Heap::new(config.heap_size),
            lcache,
            config,
            hashmap_alloc_state: HashmapAllocState::On,
            error_value: JS_UNDEFINED,
            flags: ContextFlags::empty(),
            debugger_free_head: CompactPtr::NULL,
            debugger_free_tail: CompactPtr::NULL,
            stats: CoreStats::default(),
        })
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn stats(&self) -> CoreStats {
        self.stats
    }

    pub fn heap_stats(&self) -> HeapStats {
        self.heap.stats()
    }

    pub fn hashmap_alloc_state(&self) -> HashmapAllocState {
        self.hashmap_alloc_state
    }

    pub fn set_hashmap_alloc_state(&mut self, state: HashmapAllocState) {
        self.hashmap_alloc_state = state;
    }

    /// Whether the object's list currently carries the accelerator.
    pub fn has_property_hashmap(&self, obj: CompactPtr) -> bool {
        let list_cp = proplist::list_cp_of(&self.heap, obj);
        if list_cp.is_null() {
            return false;
        }
        let header: PropertyListHeader = self.heap.read(list_cp.offset());
        !CompactPtr::from_raw(header.hashmap_cp).is_null()
    }

    pub fn intern_name(&mut self, bytes: &[u8]) -> Result<PropName, FatalCode> {
        name::intern(&mut self.heap, bytes)
    }

    /// Readback of an indirect name's bytes; `None` for direct names.
    pub fn name_bytes(&self, name: PropName) -> Option<&[u8]> {
        if name.name_type() != NameType::Ptr {
            return None;
        }
        Some(name::string_bytes(&self.heap, name.string_cp()))
    }

    /// Readback of a string value's bytes; `None` for non-strings.
    pub fn string_value_bytes(&self, value: JSValue) -> Option<&[u8]> {
        if !value.is_string() {
            return None;
        }
        Some(name::string_bytes(&self.heap, value.get_ptr()))
    }

    pub fn has_pending_exception(&self) -> bool {
        self.flags.contains(ContextFlags::PENDING_EXCEPTION)
    }

    pub fn has_pending_abort(&self) -> bool {
        self.flags.contains(ContextFlags::PENDING_ABORT)
    }

    /// Record a thrown value. Exactly one may be pending at a time.
    pub fn set_exception(&mut self, value: JSValue) {
        debug_assert!(!self.has_pending_exception());
        self.flags |= ContextFlags::PENDING_EXCEPTION;
        self.error_value = value;
    }

    pub fn set_abort_flag(&mut self, abort: bool) {
        if abort {
            self.flags |= ContextFlags::PENDING_ABORT;
        } else {
            self.flags &= !ContextFlags::PENDING_ABORT;
        }
    }

    /// Take the pending thrown value, clearing both flags.
    pub fn take_exception(&mut self) -> JSValue {
        debug_assert!(self.has_pending_exception());
        self.flags &= !(ContextFlags::PENDING_EXCEPTION | ContextFlags::PENDING_ABORT);
        core::mem::replace(&mut self.error_value, JS_UNDEFINED)
    }

    pub fn set_debugger_connected(&mut self, connected: bool) {
        if connected {
            self.flags |= ContextFlags::DEBUGGER_CONNECTED;
        } else {
            self.flags &= !ContextFlags::DEBUGGER_CONNECTED;
        }
    }

    pub fn debugger_connected(&self) -> bool {
        self.flags.contains(ContextFlags::DEBUGGER_CONNECTED)
    }
}
