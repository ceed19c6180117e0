use std::collections::HashMap;

use crate::allocator::Allocator;
use crate::constants::{
    DATA_ALLOC_BASE, DATA_ALLOC_SIZE, LIB_ALLOC_BASE, LIB_ALLOC_SIZE, MALLOC_ADDRESS, MALLOC_SIZE,
    SCRATCH_ALLOC_BASE, SCRATCH_ALLOC_SIZE,
};
use crate::vfs::VirtualFileSystem;

#[derive(Debug, Clone)]
pub(crate) struct SymbolEntry {
    pub(crate) name: String,
    pub(crate) resolved: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct LoadedLibrary {
    pub(crate) name: String,
    pub(crate) symbols: Vec<SymbolEntry>,
    pub(crate) symbols_by_name: HashMap<String, u64>,
}

#[derive(Debug)]
pub(crate) struct RuntimeState {
    /// Permanent arena backing `alloc_data`. Never reset.
    pub(crate) data_allocator: Allocator,
    /// Scratch arena backing `alloc_temporary`. Reset at the start of every
    /// `invoke_cdecl`.
    pub(crate) scratch_allocator: Allocator,
    pub(crate) library_allocator: Allocator,
    pub(crate) malloc_allocator: Allocator,
    pub(crate) malloc_sizes: HashMap<u64, u64>,
    pub(crate) errno_address: Option<u64>,
    pub(crate) library_blobs: HashMap<String, Vec<u8>>,
    pub(crate) loaded_libraries: Vec<LoadedLibrary>,
    /// Backing store for the guest's `open`/`read`/`write`/... imports (the
    /// "adi" member of the session's `FSCollection`). Guest file descriptors
    /// are the `VirtualFileSystem`'s own handle indices.
    pub(crate) adi_fs: VirtualFileSystem,
    pub(crate) library_root: Option<String>,
}

impl RuntimeState {
    pub(crate) fn new() -> Self {
        Self {
            data_allocator: Allocator::new(DATA_ALLOC_BASE, DATA_ALLOC_SIZE),
            scratch_allocator: Allocator::new(SCRATCH_ALLOC_BASE, SCRATCH_ALLOC_SIZE),
            library_allocator: Allocator::new(LIB_ALLOC_BASE, LIB_ALLOC_SIZE),
            malloc_allocator: Allocator::new(MALLOC_ADDRESS, MALLOC_SIZE),
            malloc_sizes: HashMap::new(),
            errno_address: None,
            library_blobs: HashMap::new(),
            loaded_libraries: Vec::new(),
            adi_fs: VirtualFileSystem::new(),
            library_root: None,
        }
    }
}
