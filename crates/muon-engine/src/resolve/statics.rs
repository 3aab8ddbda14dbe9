//! Static field storage
//!
//! Storage is carved lazily from a per-assembly arena (global fallback)
//! on first resolution, unless the loader reports a field RVA, in which
//! case the embedded data address is used directly. Generic
//! instantiations get disjoint storage: entries key on
//! `(field token, type-arg hash)` per assembly. GC-reference slots are
//! enumerable for the collector's root scan.

use dashmap::DashMap;
use parking_lot::Mutex;
use rustc_hash::{FxBuildHasher, FxHashMap};
use tracing::warn;

use crate::metadata::token::Token;

/// Bytes of static storage per assembly arena.
const ASSEMBLY_ARENA_SIZE: usize = 64 * 1024;

/// Bytes of the shared fallback arena.
const GLOBAL_ARENA_SIZE: usize = 256 * 1024;

/// One allocated static field slot.
#[derive(Debug, Copy, Clone)]
pub struct StaticFieldEntry {
    /// The field's token.
    pub field_token: Token,
    /// The declaring type's token.
    pub declaring_type_token: Token,
    /// Hash of the declaring type's instantiation arguments.
    pub type_arg_hash: u32,
    /// Storage address.
    pub address: usize,
    /// Size in bytes.
    pub size: u32,
    /// Whether the slot holds a managed reference.
    pub is_gc_ref: bool,
}

struct Arena {
    buf: &'static mut [u8],
    used: usize,
}

impl Arena {
    fn new(size: usize) -> Self {
        Arena { buf: vec![0u8; size].leak(), used: 0 }
    }

    fn alloc(&mut self, size: usize) -> Option<usize> {
        let aligned = (self.used + 7) & !7;
        let end = aligned.checked_add(size)?;
        if end > self.buf.len() {
            return None;
        }
        self.used = end;
        Some(self.buf[aligned..].as_ptr() as usize)
    }
}

/// Registry of static field storage.
pub struct StaticFieldRegistry {
    entries: DashMap<(u32, u32, u32), StaticFieldEntry, FxBuildHasher>,
    arenas: Mutex<FxHashMap<u32, Arena>>,
    global: Mutex<Arena>,
}

impl StaticFieldRegistry {
    /// An empty registry; arenas are created on first allocation.
    pub fn new() -> Self {
        StaticFieldRegistry {
            entries: DashMap::with_hasher(FxBuildHasher),
            arenas: Mutex::new(FxHashMap::default()),
            global: Mutex::new(Arena::new(GLOBAL_ARENA_SIZE)),
        }
    }

    /// The storage address for `(field, type-arg hash)`, allocating on
    /// first touch. `rva_address` short-circuits allocation (embedded
    /// initialized data).
    ///
    /// Returns `None` only when every arena is exhausted; existing
    /// entries are unaffected by that failure.
    #[allow(clippy::too_many_arguments)]
    pub fn ensure(
        &self,
        assembly: u32,
        field_token: Token,
        declaring_type_token: Token,
        type_arg_hash: u32,
        size: u32,
        is_gc_ref: bool,
        rva_address: Option<usize>,
    ) -> Option<usize> {
        use dashmap::mapref::entry::Entry;

        match self.entries.entry((assembly, field_token.raw(), type_arg_hash)) {
            Entry::Occupied(occupied) => Some(occupied.get().address),
            Entry::Vacant(vacant) => {
                let address = match rva_address {
                    Some(address) => address,
                    None => self.allocate(assembly, size as usize)?,
                };
                vacant.insert(StaticFieldEntry {
                    field_token,
                    declaring_type_token,
                    type_arg_hash,
                    address,
                    size,
                    is_gc_ref,
                });
                Some(address)
            }
        }
    }

    fn allocate(&self, assembly: u32, size: usize) -> Option<usize> {
        {
            let mut arenas = self.arenas.lock();
            let arena = arenas
                .entry(assembly)
                .or_insert_with(|| Arena::new(ASSEMBLY_ARENA_SIZE));
            if let Some(address) = arena.alloc(size) {
                return Some(address);
            }
        }
        let fallback = self.global.lock().alloc(size);
        if fallback.is_none() {
            warn!(target: "muon::statics", assembly, size, "static arenas exhausted");
        }
        fallback
    }

    /// The entry for `(assembly, field, type-arg hash)`, if allocated.
    pub fn get(&self, assembly: u32, field_token: Token, type_arg_hash: u32) -> Option<StaticFieldEntry> {
        self.entries
            .get(&(assembly, field_token.raw(), type_arg_hash))
            .map(|entry| *entry)
    }

    /// Number of allocated entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no statics have been allocated.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Visit every GC-reference static slot address (collector roots).
    pub fn for_each_gc_ref(&self, mut visit: impl FnMut(usize)) {
        for entry in self.entries.iter() {
            if entry.is_gc_ref {
                visit(entry.address);
            }
        }
    }
}

impl Default for StaticFieldRegistry {
    fn default() -> Self {
        Self::new()
    }
}
