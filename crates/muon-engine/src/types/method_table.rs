//! Runtime type handles
//!
//! A `MethodTable` is the process-wide descriptor of one runtime type:
//! sizes, parent, the inline vtable of native code pointers, and the
//! interface dispatch map. Identity is pointer identity; tables are
//! created once, leaked, and never freed. Vtable slots are the only
//! mutable cells, patched by single aligned atomic writes.

use std::fmt::{Debug, Formatter};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};

use bitflags::bitflags;
use rustc_hash::FxHasher;

use crate::metadata::token::Token;

/// Bytes of object header preceding instance fields of reference types
/// (and included in a value type's boxed footprint).
pub const OBJECT_HEADER_SIZE: u32 = 8;

bitflags! {
    /// Classification bits of a method table.
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
    pub struct MethodTableFlags: u32 {
        /// Value type (struct or enum).
        const VALUE_TYPE = 0x01;
        /// Interface type.
        const INTERFACE = 0x02;
        /// One of the fourteen primitives.
        const PRIMITIVE = 0x04;
        /// Array type (SZ or multi-dimensional).
        const ARRAY = 0x08;
        /// The `System.String` type.
        const STRING = 0x10;
        /// Open generic definition (has uninstantiated parameters).
        const GENERIC_DEFINITION = 0x20;
    }
}

/// One dispatch-map entry: the interface and where its slots start in the
/// implementing type's slot space.
#[derive(Debug, Copy, Clone)]
pub struct InterfaceMapEntry {
    /// The implemented interface.
    pub interface: &'static MethodTable,
    /// First slot of the interface's method range.
    pub start_slot: u16,
}

/// Returned by bounds-aware slot accessors for indices past the physical
/// vtable.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SlotOutOfBounds;

/// Runtime type descriptor. See module docs.
pub struct MethodTable {
    flags: MethodTableFlags,
    base_size: u32,
    component_size: u32,
    parent: Option<&'static MethodTable>,
    num_vtable_slots: u16,
    num_interface_slots: u16,
    hash: u32,
    assembly: u32,
    token: Token,
    type_args: Box<[&'static MethodTable]>,
    type_arg_hash: u32,
    element: Option<&'static MethodTable>,
    rank: u8,
    name: Option<Box<str>>,
    vtable: Box<[AtomicUsize]>,
    dispatch_map: Box<[InterfaceMapEntry]>,
    sealed_slots: Box<[AtomicUsize]>,
}

impl MethodTable {
    /// Classification flags.
    pub fn flags(&self) -> MethodTableFlags {
        self.flags
    }

    /// Whether instances are values (copied, unboxed by default).
    pub fn is_value_type(&self) -> bool {
        self.flags.contains(MethodTableFlags::VALUE_TYPE)
    }

    /// Whether this is an interface type.
    pub fn is_interface(&self) -> bool {
        self.flags.contains(MethodTableFlags::INTERFACE)
    }

    /// Whether this is an array type.
    pub fn is_array(&self) -> bool {
        self.flags.contains(MethodTableFlags::ARRAY)
    }

    /// Whether this is `System.String`.
    pub fn is_string(&self) -> bool {
        self.flags.contains(MethodTableFlags::STRING)
    }

    /// Boxed footprint in bytes (value bytes plus header for value types).
    pub fn base_size(&self) -> u32 {
        self.base_size
    }

    /// Element size for arrays; value size for primitives; zero otherwise.
    pub fn component_size(&self) -> u32 {
        self.component_size
    }

    /// Raw (unboxed) size of the value, in bytes.
    ///
    /// Reference types answer pointer size.
    pub fn value_size(&self) -> u32 {
        if !self.is_value_type() {
            return 8;
        }
        if self.component_size != 0 {
            self.component_size
        } else {
            self.base_size.saturating_sub(OBJECT_HEADER_SIZE)
        }
    }

    /// Parent type, if any.
    pub fn parent(&self) -> Option<&'static MethodTable> {
        self.parent
    }

    /// Walk the parent chain looking for `ancestor` (pointer identity).
    pub fn inherits_from(&self, ancestor: &MethodTable) -> bool {
        let mut current = self.parent;
        while let Some(mt) = current {
            if std::ptr::eq(mt, ancestor) {
                return true;
            }
            current = mt.parent;
        }
        false
    }

    /// Number of physical vtable slots.
    pub fn num_vtable_slots(&self) -> u16 {
        self.num_vtable_slots
    }

    /// Number of sealed-virtual slots past the physical vtable.
    pub fn num_interface_slots(&self) -> u16 {
        self.num_interface_slots
    }

    /// Stable per-type hash code.
    pub fn hash(&self) -> u32 {
        self.hash
    }

    /// Defining assembly id.
    pub fn assembly(&self) -> u32 {
        self.assembly
    }

    /// Defining (or synthetic) token.
    pub fn token(&self) -> Token {
        self.token
    }

    /// Instantiation arguments; empty unless this is an instantiated
    /// generic.
    pub fn type_args(&self) -> &[&'static MethodTable] {
        &self.type_args
    }

    /// Hash of the instantiation argument list (zero when empty).
    pub fn type_arg_hash(&self) -> u32 {
        self.type_arg_hash
    }

    /// Array element type, for array tables.
    pub fn element(&self) -> Option<&'static MethodTable> {
        self.element
    }

    /// Array rank; zero for non-arrays, one for SZ arrays.
    pub fn rank(&self) -> u8 {
        self.rank
    }

    /// Diagnostic type name, when known.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Read vtable slot `slot`, bounds-aware.
    pub fn vtable_slot(&self, slot: u16) -> Result<usize, SlotOutOfBounds> {
        self.vtable
            .get(slot as usize)
            .map(|cell| cell.load(Ordering::Acquire))
            .ok_or(SlotOutOfBounds)
    }

    /// Patch vtable slot `slot` with a native code pointer.
    pub fn set_vtable_slot(&self, slot: u16, code: usize) -> Result<(), SlotOutOfBounds> {
        self.vtable
            .get(slot as usize)
            .map(|cell| cell.store(code, Ordering::Release))
            .ok_or(SlotOutOfBounds)
    }

    /// Read sealed-virtual slot `index` (relative to the vtable end).
    pub fn sealed_slot(&self, index: u16) -> Option<usize> {
        self.sealed_slots
            .get(index as usize)
            .map(|cell| cell.load(Ordering::Acquire))
    }

    /// Patch sealed-virtual slot `index`.
    pub fn set_sealed_slot(&self, index: u16, code: usize) -> bool {
        match self.sealed_slots.get(index as usize) {
            Some(cell) => {
                cell.store(code, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// The interface dispatch map.
    pub fn dispatch_map(&self) -> &[InterfaceMapEntry] {
        &self.dispatch_map
    }

    /// Whether the type carries a dispatch map.
    pub fn has_dispatch_map(&self) -> bool {
        !self.dispatch_map.is_empty()
    }

    /// Find the dispatch-map entry whose slot range contains `slot`,
    /// returning the entry and the method index within the interface.
    pub fn interface_range_containing(&self, slot: u16) -> Option<(&InterfaceMapEntry, u16)> {
        self.dispatch_map.iter().find_map(|entry| {
            let count = entry.interface.num_vtable_slots;
            let start = entry.start_slot;
            (slot >= start && slot < start + count).then(|| (entry, slot - start))
        })
    }

    /// First `n` vtable entries, for the dispatch-exhaustion diagnostic.
    pub fn vtable_prefix(&self, n: usize) -> Vec<usize> {
        self.vtable
            .iter()
            .take(n)
            .map(|cell| cell.load(Ordering::Relaxed))
            .collect()
    }
}

impl Debug for MethodTable {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut dbg = f.debug_struct("MethodTable");
        dbg.field("token", &self.token)
            .field("assembly", &self.assembly)
            .field("flags", &self.flags)
            .field("base_size", &self.base_size)
            .field("component_size", &self.component_size)
            .field("vtable_slots", &self.num_vtable_slots);
        if let Some(name) = &self.name {
            dbg.field("name", name);
        }
        dbg.finish()
    }
}

/// Constructs method tables; `build` leaks the table to `'static`.
pub struct MethodTableBuilder {
    flags: MethodTableFlags,
    base_size: u32,
    component_size: u32,
    parent: Option<&'static MethodTable>,
    num_vtable_slots: u16,
    num_interface_slots: u16,
    assembly: u32,
    token: Token,
    type_args: Vec<&'static MethodTable>,
    type_arg_hash: u32,
    element: Option<&'static MethodTable>,
    rank: u8,
    name: Option<Box<str>>,
    vtable_init: Vec<usize>,
    dispatch_map: Vec<InterfaceMapEntry>,
}

impl MethodTableBuilder {
    /// Start building the table for `(assembly, token)`.
    pub fn new(assembly: u32, token: Token) -> Self {
        MethodTableBuilder {
            flags: MethodTableFlags::empty(),
            base_size: OBJECT_HEADER_SIZE,
            component_size: 0,
            parent: None,
            num_vtable_slots: 0,
            num_interface_slots: 0,
            assembly,
            token,
            type_args: Vec::new(),
            type_arg_hash: 0,
            element: None,
            rank: 0,
            name: None,
            vtable_init: Vec::new(),
            dispatch_map: Vec::new(),
        }
    }

    /// Set classification flags.
    pub fn flags(mut self, flags: MethodTableFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Set the boxed footprint.
    pub fn base_size(mut self, size: u32) -> Self {
        self.base_size = size;
        self
    }

    /// Set the component (element/value) size.
    pub fn component_size(mut self, size: u32) -> Self {
        self.component_size = size;
        self
    }

    /// Set the parent type.
    pub fn parent(mut self, parent: Option<&'static MethodTable>) -> Self {
        self.parent = parent;
        self
    }

    /// Set the vtable slot count. Slots not covered by
    /// [`vtable_init`](Self::vtable_init) start empty.
    pub fn vtable_slots(mut self, count: u16) -> Self {
        self.num_vtable_slots = count;
        self
    }

    /// Set the sealed-virtual slot count past the vtable.
    pub fn interface_slots(mut self, count: u16) -> Self {
        self.num_interface_slots = count;
        self
    }

    /// Pre-populate leading vtable slots with native code addresses.
    pub fn vtable_init(mut self, values: Vec<usize>) -> Self {
        self.vtable_init = values;
        self
    }

    /// Record the instantiation arguments and their hash.
    pub fn type_args(mut self, args: Vec<&'static MethodTable>, hash: u32) -> Self {
        self.type_args = args;
        self.type_arg_hash = hash;
        self
    }

    /// Record the array element and rank.
    pub fn array_of(mut self, element: &'static MethodTable, rank: u8) -> Self {
        self.element = Some(element);
        self.rank = rank;
        self
    }

    /// Attach a diagnostic name.
    pub fn name(mut self, name: impl Into<Box<str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the interface dispatch map.
    pub fn dispatch_map(mut self, map: Vec<InterfaceMapEntry>) -> Self {
        self.dispatch_map = map;
        self
    }

    /// Finish the table without leaking (used for the contiguous
    /// primitive buffer).
    pub fn build_value(self) -> MethodTable {
        let mut hasher = FxHasher::default();
        self.assembly.hash(&mut hasher);
        self.token.raw().hash(&mut hasher);
        self.type_arg_hash.hash(&mut hasher);
        self.flags.bits().hash(&mut hasher);
        self.rank.hash(&mut hasher);
        let hash = hasher.finish() as u32;

        let mut vtable: Vec<AtomicUsize> = Vec::with_capacity(self.num_vtable_slots as usize);
        for slot in 0..self.num_vtable_slots as usize {
            vtable.push(AtomicUsize::new(
                self.vtable_init.get(slot).copied().unwrap_or(0),
            ));
        }
        let sealed_slots: Vec<AtomicUsize> = (0..self.num_interface_slots)
            .map(|_| AtomicUsize::new(0))
            .collect();

        MethodTable {
            flags: self.flags,
            base_size: self.base_size,
            component_size: self.component_size,
            parent: self.parent,
            num_vtable_slots: self.num_vtable_slots,
            num_interface_slots: self.num_interface_slots,
            hash,
            assembly: self.assembly,
            token: self.token,
            type_args: self.type_args.into_boxed_slice(),
            type_arg_hash: self.type_arg_hash,
            element: self.element,
            rank: self.rank,
            name: self.name,
            vtable: vtable.into_boxed_slice(),
            dispatch_map: self.dispatch_map.into_boxed_slice(),
            sealed_slots: sealed_slots.into_boxed_slice(),
        }
    }

    /// Finish and leak the table; the result lives for the process.
    pub fn build(self) -> &'static MethodTable {
        Box::leak(Box::new(self.build_value()))
    }
}
