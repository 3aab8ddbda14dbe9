//! Compiled-method records
//!
//! One record per `(token, assembly)`, allocated once and never moved:
//! the record's native-code cell is the stable address emitted code calls
//! through while a method is still being compiled. State moves
//! NotCompiled → BeingCompiled → Compiled; promotion to Compiled is a
//! single aligned atomic store of the code pointer followed by the state
//! bit. A type-argument-hash mismatch demotes a compiled record so
//! instantiation-dependent code is regenerated.

use std::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::metadata::token::Token;
use crate::resolve::methods::ReturnKind;
use crate::types::method_table::MethodTable;

const STATE_NOT_COMPILED: u8 = 0;
const STATE_BEING_COMPILED: u8 = 1;
const STATE_COMPILED: u8 = 2;

/// Dispatch facts of a method, fixed at record creation.
#[derive(Debug, Clone, Copy)]
pub struct MethodFacts {
    /// Machine argument count, including `this`.
    pub arg_count: u8,
    /// The method takes a `this` argument.
    pub has_this: bool,
    /// Return classification.
    pub return_kind: ReturnKind,
    /// Returned struct size, when `return_kind` is a struct.
    pub return_struct_size: u32,
    /// Virtual method.
    pub is_virtual: bool,
    /// Assigned vtable slot; −1 when none was computed.
    pub vtable_slot: i32,
    /// Declaring type's table (used by `newobj`).
    pub method_table: Option<&'static MethodTable>,
    /// Declared on an interface.
    pub is_interface_method: bool,
    /// The declaring interface's table.
    pub interface_mt: Option<&'static MethodTable>,
    /// Method index within the declaring interface.
    pub interface_slot: i32,
}

impl Default for MethodFacts {
    fn default() -> Self {
        MethodFacts {
            arg_count: 0,
            has_this: false,
            return_kind: ReturnKind::Void,
            return_struct_size: 0,
            is_virtual: false,
            vtable_slot: -1,
            method_table: None,
            is_interface_method: false,
            interface_mt: None,
            interface_slot: -1,
        }
    }
}

/// Per-method registry record. See module docs.
#[derive(Debug)]
pub struct CompiledMethod {
    /// The method's token.
    pub token: Token,
    /// The method's assembly.
    pub assembly: u32,
    /// Dispatch facts from metadata.
    pub facts: MethodFacts,
    state: AtomicU8,
    native_code: AtomicUsize,
    type_arg_hash: AtomicU32,
    method_arg_hash: AtomicU32,
}

impl CompiledMethod {
    fn new(token: Token, assembly: u32, facts: MethodFacts) -> Self {
        CompiledMethod {
            token,
            assembly,
            facts,
            state: AtomicU8::new(STATE_NOT_COMPILED),
            native_code: AtomicUsize::new(0),
            type_arg_hash: AtomicU32::new(0),
            method_arg_hash: AtomicU32::new(0),
        }
    }

    /// The method has finished compiling.
    pub fn is_compiled(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_COMPILED
    }

    /// Compilation is in flight (possibly on this very call chain).
    pub fn is_being_compiled(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_BEING_COMPILED
    }

    /// Current native code address; zero while not compiled.
    pub fn native_code(&self) -> usize {
        self.native_code.load(Ordering::Acquire)
    }

    /// Type-argument hash the current code was compiled under.
    pub fn type_arg_hash(&self) -> u32 {
        self.type_arg_hash.load(Ordering::Acquire)
    }

    /// Method-argument hash the current code was compiled under.
    pub fn method_arg_hash(&self) -> u32 {
        self.method_arg_hash.load(Ordering::Acquire)
    }

    /// Address of the native-code cell.
    ///
    /// While the method is being compiled the emitter routes calls
    /// indirectly through this cell; completing the compile patches it
    /// and the edges close without further fixup.
    pub fn code_cell_address(&self) -> usize {
        &self.native_code as *const AtomicUsize as usize
    }

    /// Whether the compiled code matches the given instantiation hashes.
    pub fn matches_instantiation(&self, type_hash: u32, method_hash: u32) -> bool {
        self.type_arg_hash() == type_hash && self.method_arg_hash() == method_hash
    }

    /// Try to move NotCompiled → BeingCompiled. False if another
    /// compilation already owns the record (including the caller's own
    /// outer frame, which is how recursion is detected).
    pub fn begin_compiling(&self) -> bool {
        self.state
            .compare_exchange(
                STATE_NOT_COMPILED,
                STATE_BEING_COMPILED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Publish the finished code: patch the cell, record the
    /// instantiation hashes, then flip the state.
    pub fn finish_compiling(&self, code: usize, type_hash: u32, method_hash: u32) {
        self.type_arg_hash.store(type_hash, Ordering::Release);
        self.method_arg_hash.store(method_hash, Ordering::Release);
        self.native_code.store(code, Ordering::Release);
        self.state.store(STATE_COMPILED, Ordering::Release);
    }

    /// Abandon an in-flight compilation.
    pub fn fail_compiling(&self) {
        self.state.store(STATE_NOT_COMPILED, Ordering::Release);
    }

    /// Demote a compiled record whose code was generated under a
    /// different instantiation; the next resolve recompiles.
    pub fn mark_not_compiled(&self) {
        self.native_code.store(0, Ordering::Release);
        self.state.store(STATE_NOT_COMPILED, Ordering::Release);
    }
}

/// Registry of compiled-method records, keyed `(token, assembly)`.
pub struct CompiledMethodRegistry {
    records: RwLock<FxHashMap<(u32, u32), &'static CompiledMethod>>,
}

impl CompiledMethodRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        CompiledMethodRegistry { records: RwLock::new(FxHashMap::default()) }
    }

    /// The record for `(token, assembly)`, if one exists.
    pub fn get(&self, token: Token, assembly: u32) -> Option<&'static CompiledMethod> {
        self.records.read().get(&(token.raw(), assembly)).copied()
    }

    /// The record for `(token, assembly)`, creating it from `facts` on
    /// first touch.
    pub fn get_or_insert(
        &self,
        token: Token,
        assembly: u32,
        facts: impl FnOnce() -> MethodFacts,
    ) -> &'static CompiledMethod {
        if let Some(record) = self.records.read().get(&(token.raw(), assembly)) {
            return record;
        }
        let mut records = self.records.write();
        records
            .entry((token.raw(), assembly))
            .or_insert_with(|| Box::leak(Box::new(CompiledMethod::new(token, assembly, facts()))))
    }

    /// Find a compiled or in-flight record assigned to `slot` of `mt`,
    /// either exactly or via the generic definition the instantiated `mt`
    /// was made from.
    ///
    /// Returns `(record, is_exact)`; `is_exact` is false for the
    /// definition-record-on-instantiation case.
    pub fn find_by_slot(
        &self,
        mt: &MethodTable,
        slot: i32,
    ) -> Option<(&'static CompiledMethod, bool)> {
        let records = self.records.read();
        let mut definition_hit = None;
        for record in records.values() {
            if record.facts.vtable_slot != slot {
                continue;
            }
            let Some(record_mt) = record.facts.method_table else { continue };
            if std::ptr::eq(record_mt, mt) {
                return Some((*record, true));
            }
            // Same definition token: the record belongs to the open
            // definition while dispatch is on an instantiation.
            if record_mt.token() == mt.token()
                && record_mt.assembly() == mt.assembly()
                && !mt.type_args().is_empty()
            {
                definition_hit = Some((*record, false));
            }
        }
        definition_hit
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether the registry has no records.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl Default for CompiledMethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}
