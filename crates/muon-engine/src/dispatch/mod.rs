//! Lazy compilation dispatch
//!
//! The stubs emitted code calls before transferring control: ensure the
//! callee is native, patch vtables on demand, and resolve interface,
//! default-interface, and sealed-slot dispatch. Three entry points are
//! published as C-ABI addresses for direct calls from emitted code.
//!
//! Compilation failure on these paths is fatal through the kernel halt
//! hook: a half-dispatched call site has no user space to unwind to.

pub mod registry;

use once_cell::sync::OnceCell;
use tracing::debug;

use crate::context::{self, ContextGuard, TypeArgList};
use crate::external::EmitError;
use crate::metadata::token::{TableId, Token};
use crate::resolve::{AssemblyScope, Runtime};
use crate::types::method_table::MethodTable;
use registry::CompiledMethod;

impl Runtime {
    /// Compile `(assembly, token)` now unless it already is, registering
    /// and publishing the result.
    ///
    /// Returns the registry record. A record still in the
    /// being-compiled state belongs to an outer frame of this very call
    /// chain (recursion) or to a concurrent compiler; either way its
    /// code cell is the thing to call through.
    pub(crate) fn compile_method_now(
        &self,
        assembly: u32,
        token: Token,
    ) -> Result<&'static CompiledMethod, EmitError> {
        let record = self
            .methods
            .get_or_insert(token, assembly, || self.method_facts(assembly, token));

        let ctx = context::current();
        let type_hash = ctx.type_args.hash();
        let method_hash = ctx.method_args.hash();

        if record.is_compiled() {
            if record.matches_instantiation(type_hash, method_hash) {
                return Ok(record);
            }
            record.mark_not_compiled();
        }
        if !record.begin_compiling() {
            return Ok(record);
        }

        let emitter = match self.emitter.get() {
            Some(emitter) => emitter,
            None => {
                record.fail_compiling();
                return Err(EmitError("no emitter installed".into()));
            }
        };
        let emitted = match emitter.compile_method(assembly, token) {
            Ok(emitted) => emitted,
            Err(err) => {
                record.fail_compiling();
                return Err(err);
            }
        };
        // Frames of this method must be walkable before anything can
        // call it.
        if let Err(err) = self.publish_method(&emitted.method_info) {
            record.fail_compiling();
            return Err(EmitError(format!("unwind publication failed: {err}").into()));
        }
        record.finish_compiling(emitted.native_code, type_hash, method_hash);
        debug!(
            target: "muon::dispatch",
            ?token,
            assembly,
            code = format_args!("{:#x}", emitted.native_code),
            "method compiled"
        );
        Ok(record)
    }

    /// Ensure `(token, assembly)` has native code before a direct call.
    pub fn ensure_compiled(&self, token: Token, assembly: u32) {
        if let Some(record) = self.methods.get(token, assembly) {
            if record.is_compiled() {
                return;
            }
        }
        if let Err(err) = self.compile_method_now(assembly, token) {
            self.fatal(&format!(
                "EnsureCompiled: {token:?} in assembly {assembly}: {err}"
            ));
        }
    }

    /// Ensure the target of a known-slot virtual call is compiled and
    /// the slot holds its code.
    pub fn ensure_virtual_compiled(
        &self,
        token: Token,
        assembly: u32,
        mt: &MethodTable,
        slot: i16,
    ) {
        if slot < 0 {
            self.ensure_compiled(token, assembly);
            return;
        }
        let slot = slot as u16;
        if let Some(record) = self.methods.get(token, assembly) {
            if record.is_compiled() {
                let code = record.native_code();
                if mt.vtable_slot(slot) != Ok(code) {
                    let _ = mt.set_vtable_slot(slot, code);
                }
                return;
            }
        }
        match self.compile_method_now(assembly, token) {
            Ok(record) => {
                let code = record.native_code();
                if code != 0 {
                    let _ = mt.set_vtable_slot(slot, code);
                }
            }
            Err(err) => self.fatal(&format!(
                "EnsureVirtualCompiled: {token:?} in assembly {assembly}: {err}"
            )),
        }
    }

    /// The `callvirt` path: resolve the native target for `slot` of the
    /// object's type.
    ///
    /// The returned pointer is the call target; callers never re-read
    /// the vtable afterwards, which is what makes the out-of-bounds
    /// cases (sealed slots, AOT fallbacks) safe — those never write a
    /// slot that does not physically exist.
    pub fn ensure_vtable_slot_compiled(&self, object: *const u8, slot: i16) -> usize {
        if object.is_null() || slot < 0 {
            self.fatal(&format!("EnsureVtableSlotCompiled: bad dispatch (object {object:p}, slot {slot})"));
        }
        // The first header word of every object is its method table.
        let mt: &'static MethodTable = unsafe { &**(object as *const *const MethodTable) };
        let slot_index = slot as u16;
        let slot_count = mt.num_vtable_slots();

        if slot_index >= slot_count {
            if mt.has_dispatch_map() {
                if let Some(code) = mt.sealed_slot(slot_index - slot_count) {
                    if code != 0 {
                        return code;
                    }
                }
            }
            if mt.is_string() {
                if let Some(code) = self.well_known_methods.string_slot(slot_index) {
                    return code;
                }
            }
            if let Some(code) = self.well_known_methods.object_slot(slot_index) {
                return code;
            }
            self.dispatch_exhausted(mt, slot);
        }

        if let Ok(code) = mt.vtable_slot(slot_index) {
            if code != 0 {
                return code;
            }
        }

        if let Some((record, exact)) = self.methods.find_by_slot(mt, slot as i32) {
            let instantiation_hash = crate::types::registry::type_arg_hash(mt.type_args());
            if exact && record.is_compiled() && record.type_arg_hash() == instantiation_hash {
                let code = record.native_code();
                let _ = mt.set_vtable_slot(slot_index, code);
                return code;
            }
            // Compile (or recompile) under this concrete type's
            // instantiation, then patch. Arrays carry no cached argument
            // list; their element stands in as the single argument.
            let context_args = if !mt.type_args().is_empty() {
                TypeArgList::from_slice(mt.type_args())
            } else if let Some(element) = mt.element() {
                TypeArgList::from_slice(&[element])
            } else {
                TypeArgList::empty()
            };
            let _guard = ContextGuard::replace_type_args(context_args);
            match self.compile_method_now(record.assembly, record.token) {
                Ok(record) => {
                    let code = record.native_code();
                    if code != 0 {
                        let _ = mt.set_vtable_slot(slot_index, code);
                        return code;
                    }
                    // In flight on another path; surface the current
                    // slot value, the winner's patch takes over later.
                    return mt.vtable_slot(slot_index).unwrap_or(0);
                }
                Err(err) => self.fatal(&format!(
                    "EnsureVtableSlotCompiled: slot {slot} of {:?}: {err}",
                    mt.token()
                )),
            }
        }

        if let Some(code) = self.resolve_interface_slot(mt, slot_index) {
            let _ = mt.set_vtable_slot(slot_index, code);
            return code;
        }

        self.dispatch_exhausted(mt, slot)
    }

    /// Interface-map walk for a slot no registry record claims: default
    /// interface methods compile directly; abstract interface methods
    /// dispatch to an implementation found by name on the concrete class
    /// and its ancestors.
    fn resolve_interface_slot(&self, mt: &'static MethodTable, slot: u16) -> Option<usize> {
        let (entry, index) = mt.interface_range_containing(slot)?;
        let iface = entry.interface;
        let methods = self.provider.methods_of(iface.assembly(), iface.token());
        let iface_method = *methods.get(index as usize)?;
        let iface_row = self.provider.method_row(iface.assembly(), iface_method)?;

        if iface_row.has_body {
            // Default interface method.
            let _guard =
                ContextGuard::replace_type_args(TypeArgList::from_slice(iface.type_args()));
            let _scope = AssemblyScope::switch(self, iface.assembly());
            let record = self.compile_method_now(iface.assembly(), iface_method).ok()?;
            return (record.native_code() != 0).then(|| record.native_code());
        }

        let arg_count = self.method_sig_param_count(&iface_row.signature);
        self.compile_implementation_by_name(mt, &iface_row.name, arg_count)
    }

    /// Name-based implementation search on the class then its parents.
    /// Known limitation: name plus argument count can shadow unrelated
    /// members; a signature-equivalence match would be required for full
    /// correctness.
    fn compile_implementation_by_name(
        &self,
        mt: &'static MethodTable,
        name: &str,
        arg_count: Option<u32>,
    ) -> Option<usize> {
        let mut current = Some(mt);
        while let Some(table) = current {
            if table.token().table() == Some(TableId::TypeDef) {
                let assembly = table.assembly();
                for method in self.provider.methods_of(assembly, table.token()) {
                    let Some(row) = self.provider.method_row(assembly, method) else { continue };
                    if row.name != name || !row.has_body {
                        continue;
                    }
                    if arg_count.is_some()
                        && self.method_sig_param_count(&row.signature) != arg_count
                    {
                        continue;
                    }
                    let _guard =
                        ContextGuard::replace_type_args(TypeArgList::from_slice(mt.type_args()));
                    let _scope = AssemblyScope::switch(self, assembly);
                    let record = self.compile_method_now(assembly, method).ok()?;
                    return (record.native_code() != 0).then(|| record.native_code());
                }
            }
            current = table.parent();
        }
        None
    }

    fn dispatch_exhausted(&self, mt: &MethodTable, slot: i16) -> ! {
        let prefix = mt.vtable_prefix(4);
        self.fatal(&format!(
            "EnsureVtableSlotCompiled: no dispatch target for slot {slot} of {mt:?} \
             (assembly {}, token {:?}); vtable[0..4] = {prefix:#x?}",
            mt.assembly(),
            mt.token(),
        ))
    }
}

static RUNTIME: OnceCell<Runtime> = OnceCell::new();

/// Install the process-wide runtime behind the published entry points.
///
/// A second install keeps the existing instance.
pub fn install(runtime: Runtime) -> &'static Runtime {
    if RUNTIME.set(runtime).is_err() {
        tracing::warn!(target: "muon::dispatch", "runtime already installed, keeping existing");
    }
    RUNTIME.get().expect("runtime installed above")
}

/// The installed runtime, if any.
pub fn installed() -> Option<&'static Runtime> {
    RUNTIME.get()
}

/// C-ABI wrapper for [`Runtime::ensure_compiled`].
pub extern "C" fn ensure_compiled_entry(token: u32, assembly: u32) {
    if let Some(runtime) = installed() {
        runtime.ensure_compiled(Token::new(token), assembly);
    }
}

/// C-ABI wrapper for [`Runtime::ensure_virtual_compiled`].
///
/// # Safety
///
/// `mt` must point to a live method table (they are never freed, so any
/// table the runtime ever produced qualifies).
pub unsafe extern "C" fn ensure_virtual_compiled_entry(
    token: u32,
    assembly: u32,
    mt: *const MethodTable,
    slot: i16,
) {
    if let (Some(runtime), Some(mt)) = (installed(), unsafe { mt.as_ref() }) {
        runtime.ensure_virtual_compiled(Token::new(token), assembly, mt, slot);
    }
}

/// C-ABI wrapper for [`Runtime::ensure_vtable_slot_compiled`].
///
/// # Safety
///
/// `object` must point to a live managed object whose first header word
/// is its method table.
pub unsafe extern "C" fn ensure_vtable_slot_compiled_entry(object: *const u8, slot: i16) -> usize {
    match installed() {
        Some(runtime) => runtime.ensure_vtable_slot_compiled(object, slot),
        None => 0,
    }
}

/// The function addresses the emitter plants direct calls to.
#[derive(Debug, Copy, Clone)]
pub struct DispatchEntryPoints {
    /// `EnsureCompiled(token, assembly)`.
    pub ensure_compiled: usize,
    /// `EnsureVirtualCompiled(token, assembly, method_table, slot)`.
    pub ensure_virtual_compiled: usize,
    /// `EnsureVtableSlotCompiled(object, slot) -> code`.
    pub ensure_vtable_slot_compiled: usize,
    /// `CheckStaticClassConstruction`, externally implemented.
    pub check_static_construction: usize,
}

/// Published addresses for `runtime`.
pub fn entry_points(runtime: &Runtime) -> DispatchEntryPoints {
    DispatchEntryPoints {
        ensure_compiled: ensure_compiled_entry as usize,
        ensure_virtual_compiled: ensure_virtual_compiled_entry as usize,
        ensure_vtable_slot_compiled: ensure_vtable_slot_compiled_entry as usize,
        check_static_construction: runtime.check_static_construction_address(),
    }
}
