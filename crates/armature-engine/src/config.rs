//! User configuration
//!
//! Everything the embedder can tune when constructing a `Jit`. Memory,
//! exception and cycle callbacks are mandatory (the `Environment` the
//! facade takes alongside this struct); the rest defaults to a plain
//! callback-based, optimization-enabled instance.

use std::sync::Arc;

use crate::env::Coprocessor;
use crate::runtime::monitor::ExclusiveMonitor;

/// A 4 KiB-paged translation table: one host pointer per guest page, null
/// for unmapped pages. Accesses through mapped pages bypass the callbacks;
/// unmapped pages fall back to them.
#[derive(Debug, Clone, Copy)]
pub struct PageTable {
    /// Pointer to `1 << (address_bits - 12)` page entries.
    pub entries: *const *mut u8,
    /// Guest address bits covered by the table.
    pub address_bits: u32,
}

// Safety: the table is owned by the embedder for the JIT's lifetime and the
// engine only ever reads entries.
unsafe impl Send for PageTable {}
unsafe impl Sync for PageTable {}

impl PageTable {
    /// Host pointer for `vaddr`, if its page is mapped.
    pub fn lookup(&self, vaddr: u64) -> Option<*mut u8> {
        if self.address_bits < 64 && vaddr >> self.address_bits != 0 {
            return None;
        }
        let page = (vaddr >> 12) as usize;
        // Safety: page index bounded by address_bits per the constructor
        // contract
        let entry = unsafe { *self.entries.add(page) };
        if entry.is_null() {
            None
        } else {
            Some(unsafe { entry.add((vaddr & 0xfff) as usize) })
        }
    }
}

/// Construction-time options shared by the A32 and A64 facades.
pub struct Config {
    /// Guest coprocessors (A32 only; index = coprocessor number).
    pub coprocessors: [Option<Arc<dyn Coprocessor + Send + Sync>>; 16],
    /// Optional 4 KiB page table consulted before the memory callbacks.
    pub page_table: Option<PageTable>,
    /// Base of a flat host mapping of guest memory. When set, loads and
    /// stores compile to direct host accesses backed by the fault handler
    /// instead of callback calls.
    pub fastmem_pointer: Option<u64>,
    /// Treat all guest accesses as little-endian regardless of the E bit.
    pub always_little_endian: bool,
    /// Enable the CRC32-indexed fast dispatch path.
    pub enable_fast_dispatch: bool,
    /// Run the optimization passes. Disabling produces naive but directly
    /// debuggable code.
    pub enable_optimizations: bool,
    /// Processor id used for exclusive-monitor reservations.
    pub processor_id: u32,
    /// Shared exclusive monitor for multi-core configurations. When absent,
    /// a private single-core monitor is created.
    pub global_monitor: Option<Arc<ExclusiveMonitor>>,
    /// Upper bound on guest instructions per translated block.
    pub max_instructions_per_block: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            coprocessors: Default::default(),
            page_table: None,
            fastmem_pointer: None,
            always_little_endian: true,
            enable_fast_dispatch: true,
            enable_optimizations: true,
            processor_id: 0,
            global_monitor: None,
            max_instructions_per_block: 32,
        }
    }
}
