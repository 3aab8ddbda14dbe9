//! Type handle canonicalization
//!
//! One method table per `(assembly, token)`, per `(definition, type-args)`
//! instantiation, and per `(element, rank)` array. The fourteen primitive
//! tables live in one contiguous leaked buffer so primitive-ness and the
//! primitive index are pointer-range queries. Well-known identities bind
//! late into lock-free slots.

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicPtr, Ordering};

use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHasher};
use tracing::debug;

use crate::external::WellKnownMethods;
use crate::metadata::token::{PrimitiveKind, Token, WellKnownType, PRIMITIVE_COUNT};
use crate::types::method_table::{
    MethodTable, MethodTableBuilder, MethodTableFlags, OBJECT_HEADER_SIZE,
};

/// Hash of an instantiation argument list; empty lists hash to zero.
///
/// Equal lists always produce equal hashes (the registries additionally
/// compare the lists themselves, so collisions are benign).
pub fn type_arg_hash(args: &[&'static MethodTable]) -> u32 {
    if args.is_empty() {
        return 0;
    }
    let mut hasher = FxHasher::default();
    for mt in args {
        (*mt as *const MethodTable as usize).hash(&mut hasher);
    }
    let hash = hasher.finish() as u32;
    // Zero is reserved for "no arguments".
    if hash == 0 {
        1
    } else {
        hash
    }
}

#[derive(PartialEq, Eq, Hash)]
struct InstKey {
    assembly: u32,
    definition: u32,
    args: Box<[usize]>,
}

impl InstKey {
    fn new(assembly: u32, definition: Token, args: &[&'static MethodTable]) -> Self {
        InstKey {
            assembly,
            definition: definition.raw(),
            args: args.iter().map(|mt| *mt as *const MethodTable as usize).collect(),
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash)]
struct ArrayKey {
    element: usize,
    rank: u8,
    multi_dim: bool,
}

/// The process-wide type handle registry.
pub struct TypeHandleRegistry {
    by_token: RwLock<FxHashMap<(u32, u32), &'static MethodTable>>,
    global_by_token: RwLock<FxHashMap<u32, &'static MethodTable>>,
    arrays: RwLock<FxHashMap<ArrayKey, &'static MethodTable>>,
    generic_insts: RwLock<FxHashMap<InstKey, &'static MethodTable>>,
    well_known: [AtomicPtr<MethodTable>; WellKnownType::SLOT_COUNT],
    primitives: &'static [MethodTable; PRIMITIVE_COUNT],
}

impl TypeHandleRegistry {
    /// Build the registry and synthesize the primitive tables from the
    /// AOT well-known method addresses.
    pub fn new(methods: &WellKnownMethods) -> Self {
        let primitives: &'static [MethodTable; PRIMITIVE_COUNT] =
            Box::leak(Box::new(std::array::from_fn(|index| {
                let kind = PrimitiveKind::ALL[index];
                let size = kind.size();
                MethodTableBuilder::new(0, kind.well_known().token())
                    .flags(MethodTableFlags::VALUE_TYPE | MethodTableFlags::PRIMITIVE)
                    .base_size(size + OBJECT_HEADER_SIZE)
                    .component_size(size)
                    .vtable_slots(3)
                    .vtable_init(methods.primitive_vtable(kind).to_vec())
                    .name(format!("System.{kind:?}"))
                    .build_value()
            })));

        let registry = TypeHandleRegistry {
            by_token: RwLock::new(FxHashMap::default()),
            global_by_token: RwLock::new(FxHashMap::default()),
            arrays: RwLock::new(FxHashMap::default()),
            generic_insts: RwLock::new(FxHashMap::default()),
            well_known: std::array::from_fn(|_| AtomicPtr::new(std::ptr::null_mut())),
            primitives,
        };
        for kind in PrimitiveKind::ALL {
            registry.set_well_known(kind.well_known(), &registry.primitives[kind as usize]);
        }
        registry
    }

    /// Associate `token` with `mt` in `assembly`'s scope and globally.
    ///
    /// Idempotent; a later registration with the same token updates the
    /// binding (late binding of well-known types relies on this).
    pub fn register(&self, assembly: u32, token: Token, mt: &'static MethodTable) {
        self.by_token.write().insert((assembly, token.raw()), mt);
        self.global_by_token.write().insert(token.raw(), mt);
        if let Some(wk) = token.well_known() {
            self.set_well_known(wk, mt);
        }
    }

    /// Canonicalizing registration: the first table bound to
    /// `(assembly, token)` wins, and it is returned. Used by on-demand
    /// TypeDef construction so racing builders agree on one identity.
    pub fn get_or_register(
        &self,
        assembly: u32,
        token: Token,
        mt: &'static MethodTable,
    ) -> &'static MethodTable {
        let canonical = {
            let mut by_token = self.by_token.write();
            *by_token.entry((assembly, token.raw())).or_insert(mt)
        };
        self.global_by_token.write().entry(token.raw()).or_insert(canonical);
        if let Some(wk) = token.well_known() {
            self.capture_well_known(wk, canonical);
        }
        canonical
    }

    /// Method table for `token` in `assembly`'s scope, falling back to the
    /// global binding.
    pub fn lookup(&self, assembly: u32, token: Token) -> Option<&'static MethodTable> {
        if let Some(mt) = self.by_token.read().get(&(assembly, token.raw())) {
            return Some(mt);
        }
        self.global_by_token.read().get(&token.raw()).copied()
    }

    /// Bind a well-known identity. Unconditional; the newest binding wins.
    pub fn set_well_known(&self, wk: WellKnownType, mt: &'static MethodTable) {
        self.well_known[wk.slot()]
            .store(mt as *const MethodTable as *mut MethodTable, Ordering::Release);
    }

    /// One-shot capture of a well-known identity: only the first capture
    /// sticks.
    pub fn capture_well_known(&self, wk: WellKnownType, mt: &'static MethodTable) {
        let _ = self.well_known[wk.slot()].compare_exchange(
            std::ptr::null_mut(),
            mt as *const MethodTable as *mut MethodTable,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// The method table bound to a well-known identity, if any yet.
    pub fn well_known(&self, wk: WellKnownType) -> Option<&'static MethodTable> {
        let ptr = self.well_known[wk.slot()].load(Ordering::Acquire);
        // Tables are never freed, so a published pointer stays valid.
        unsafe { ptr.cast_const().as_ref() }
    }

    /// The primitive table for `kind`.
    pub fn primitive(&self, kind: PrimitiveKind) -> &'static MethodTable {
        &self.primitives[kind as usize]
    }

    /// Whether `mt` lives in the primitive buffer.
    pub fn is_primitive(&self, mt: &MethodTable) -> bool {
        self.primitive_index(mt).is_some()
    }

    /// Primitive index derived by pointer arithmetic over the contiguous
    /// primitive buffer; authoritative for the process lifetime.
    pub fn primitive_index(&self, mt: &MethodTable) -> Option<usize> {
        let base = self.primitives.as_ptr() as usize;
        let ptr = mt as *const MethodTable as usize;
        if ptr < base {
            return None;
        }
        let offset = ptr - base;
        let index = offset / std::mem::size_of::<MethodTable>();
        (offset % std::mem::size_of::<MethodTable>() == 0 && index < PRIMITIVE_COUNT)
            .then_some(index)
    }

    /// Canonical SZ-array table of `element`.
    pub fn intern_array(&self, element: &'static MethodTable) -> &'static MethodTable {
        self.intern_array_inner(element, 1, false)
    }

    /// Canonical multi-dimensional array table of `(element, rank)`.
    pub fn intern_md_array(&self, element: &'static MethodTable, rank: u8) -> &'static MethodTable {
        self.intern_array_inner(element, rank, true)
    }

    fn intern_array_inner(
        &self,
        element: &'static MethodTable,
        rank: u8,
        multi_dim: bool,
    ) -> &'static MethodTable {
        let key = ArrayKey {
            element: element as *const MethodTable as usize,
            rank,
            multi_dim,
        };
        if let Some(mt) = self.arrays.read().get(&key) {
            return mt;
        }

        let parent = self
            .well_known(WellKnownType::Array)
            .or_else(|| self.well_known(WellKnownType::Object));
        let vtable_init = parent
            .map(|p| p.vtable_prefix(p.num_vtable_slots() as usize))
            .unwrap_or_default();
        let mut name = element.name().map(|n| n.to_string()).unwrap_or_default();
        if multi_dim {
            name.push_str(&format!("[{}]", ",".repeat(rank.saturating_sub(1) as usize)));
        } else {
            name.push_str("[]");
        }
        let built = MethodTableBuilder::new(element.assembly(), element.token())
            .flags(MethodTableFlags::ARRAY)
            .base_size(OBJECT_HEADER_SIZE + 8)
            .component_size(element.value_size())
            .parent(parent)
            .vtable_slots(parent.map_or(0, |p| p.num_vtable_slots()))
            .vtable_init(vtable_init)
            .array_of(element, rank)
            .name(name)
            .build();

        let mut arrays = self.arrays.write();
        // A racing interner may have won; keep the canonical table.
        *arrays.entry(key).or_insert(built)
    }

    /// Canonical instantiation table, if one was interned.
    pub fn generic_instantiation(
        &self,
        assembly: u32,
        definition: Token,
        args: &[&'static MethodTable],
    ) -> Option<&'static MethodTable> {
        self.generic_insts
            .read()
            .get(&InstKey::new(assembly, definition, args))
            .copied()
    }

    /// Intern the instantiation table for `(definition, args)`, building
    /// it with `build` on first touch.
    pub fn intern_generic_instantiation(
        &self,
        assembly: u32,
        definition: Token,
        args: &[&'static MethodTable],
        build: impl FnOnce() -> &'static MethodTable,
    ) -> &'static MethodTable {
        let key = InstKey::new(assembly, definition, args);
        if let Some(mt) = self.generic_insts.read().get(&key) {
            return mt;
        }
        let built = build();
        let mut insts = self.generic_insts.write();
        *insts.entry(key).or_insert(built)
    }

    /// Record well-known abstract bases reachable from a freshly created
    /// concrete type: delegate and exception families, `Type`, and
    /// `IDisposable`. Each capture is one-shot and idempotent.
    pub fn capture_well_known_bases(&self, mt: &'static MethodTable) {
        let mut current = Some(mt);
        while let Some(table) = current {
            match table.name() {
                Some("System.MulticastDelegate") => {
                    self.capture_well_known(WellKnownType::MulticastDelegate, table);
                    if let Some(parent) = table.parent() {
                        self.capture_well_known(WellKnownType::Delegate, parent);
                    }
                }
                Some("System.Delegate") => {
                    self.capture_well_known(WellKnownType::Delegate, table);
                }
                Some("System.Exception") => {
                    self.capture_well_known(WellKnownType::Exception, table);
                }
                Some("System.Type") => {
                    self.capture_well_known(WellKnownType::Type, table);
                }
                Some("System.RuntimeType") => {
                    self.capture_well_known(WellKnownType::RuntimeType, table);
                }
                _ => {}
            }
            current = table.parent();
        }
        for entry in mt.dispatch_map() {
            if entry.interface.name() == Some("System.IDisposable") {
                self.capture_well_known(WellKnownType::IDisposable, entry.interface);
                debug!(?mt, "captured IDisposable");
            }
        }
    }
}
