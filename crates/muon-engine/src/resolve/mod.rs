//! Metadata integration layer
//!
//! The central resolver: tokens in, descriptors out. The [`Runtime`]
//! owns every registry and the collaborator seams; its resolution
//! methods are spread over this module's files (types, fields, methods,
//! statics, cctors, strings).

pub mod cctor;
pub mod fields;
pub mod intrinsics;
pub mod methods;
pub mod statics;
pub mod strings;
pub mod types;

use std::sync::atomic::{AtomicU32, Ordering};

use once_cell::sync::OnceCell;

use muon_unwind::{JitMethodInfo, JitMethodRegistry, PlatformUnwinder, PublishError};

use crate::dispatch::registry::CompiledMethodRegistry;
use crate::external::{AssemblyProvider, FatalHandler, MethodEmitter, WellKnownMethods};
use crate::resolve::cctor::CctorRegistry;
use crate::resolve::fields::FieldLayoutCache;
use crate::resolve::statics::StaticFieldRegistry;
use crate::resolve::strings::StringRegistry;
use crate::types::registry::TypeHandleRegistry;

/// The JIT runtime core: registries plus collaborator seams.
///
/// Process-wide and initialized once; everything it allocates outlives
/// it. All resolution entry points take `&self` and are reentrant.
pub struct Runtime {
    pub(crate) types: TypeHandleRegistry,
    pub(crate) methods: CompiledMethodRegistry,
    pub(crate) statics: StaticFieldRegistry,
    pub(crate) field_cache: FieldLayoutCache,
    pub(crate) cctors: CctorRegistry,
    pub(crate) strings: StringRegistry,
    pub(crate) publisher: JitMethodRegistry,
    pub(crate) provider: Box<dyn AssemblyProvider>,
    pub(crate) emitter: OnceCell<Box<dyn MethodEmitter>>,
    unwinder: Box<dyn PlatformUnwinder>,
    pub(crate) well_known_methods: WellKnownMethods,
    current_assembly: AtomicU32,
    fatal: FatalHandler,
}

impl Runtime {
    /// Build a runtime over the given collaborators.
    ///
    /// `handler_rva` is the personality-routine RVA stamped into every
    /// published unwind record that carries EH flags.
    pub fn new(
        provider: Box<dyn AssemblyProvider>,
        unwinder: Box<dyn PlatformUnwinder>,
        well_known_methods: WellKnownMethods,
        handler_rva: u32,
    ) -> Self {
        Runtime {
            types: TypeHandleRegistry::new(&well_known_methods),
            methods: CompiledMethodRegistry::new(),
            statics: StaticFieldRegistry::new(),
            field_cache: FieldLayoutCache::new(),
            cctors: CctorRegistry::new(),
            strings: StringRegistry::new(),
            publisher: JitMethodRegistry::new(handler_rva),
            provider,
            emitter: OnceCell::new(),
            unwinder,
            well_known_methods,
            current_assembly: AtomicU32::new(0),
            fatal: crate::external::default_fatal_handler,
        }
    }

    /// Replace the halt hook (the kernel installs its real halt).
    pub fn with_fatal_handler(mut self, fatal: FatalHandler) -> Self {
        self.fatal = fatal;
        self
    }

    /// Install the emitter. One-shot; later calls are ignored.
    pub fn set_emitter(&self, emitter: Box<dyn MethodEmitter>) {
        let _ = self.emitter.set(emitter);
    }

    /// The type handle registry.
    pub fn types(&self) -> &TypeHandleRegistry {
        &self.types
    }

    /// The compiled-method registry.
    pub fn methods(&self) -> &CompiledMethodRegistry {
        &self.methods
    }

    /// The unwind/EH publication registry.
    pub fn publisher(&self) -> &JitMethodRegistry {
        &self.publisher
    }

    /// The static-field storage registry.
    pub fn statics(&self) -> &StaticFieldRegistry {
        &self.statics
    }

    /// The field-layout cache.
    pub fn field_cache(&self) -> &FieldLayoutCache {
        &self.field_cache
    }

    /// The cctor-context registry.
    pub fn cctors(&self) -> &CctorRegistry {
        &self.cctors
    }

    /// The interned-string registry.
    pub fn strings(&self) -> &StringRegistry {
        &self.strings
    }

    /// The assembly currently scoping token resolution.
    pub fn current_assembly(&self) -> u32 {
        self.current_assembly.load(Ordering::Acquire)
    }

    /// Rebind token resolution to `assembly`.
    ///
    /// Cross-assembly resolution must pair every switch with a restore;
    /// use [`AssemblyScope`] rather than calling this directly.
    pub fn set_current_assembly(&self, assembly: u32) {
        self.current_assembly.store(assembly, Ordering::Release);
    }

    /// Address of the `CheckStaticClassConstruction` helper the emitter
    /// plants before every static-field access.
    pub fn check_static_construction_address(&self) -> usize {
        self.well_known_methods.check_static_construction
    }

    /// Publish one compiled method's unwind/EH metadata.
    ///
    /// Called after every successful emit, before control returns to the
    /// dispatcher; failure aborts that method's compilation.
    pub fn publish_method(&self, info: &JitMethodInfo) -> Result<u16, PublishError> {
        self.publisher.register(info, &*self.unwinder)
    }

    /// Halt through the kernel hook; never returns.
    pub(crate) fn fatal(&self, message: &str) -> ! {
        tracing::error!(target: "muon::dispatch", "{message}");
        (self.fatal)(message)
    }
}

/// Saves the current assembly on construction, switches, and restores it
/// on drop — on success, error, and recursive return paths alike.
pub struct AssemblyScope<'r> {
    runtime: &'r Runtime,
    saved: u32,
}

impl<'r> AssemblyScope<'r> {
    /// Switch `runtime` to resolve against `assembly`.
    pub fn switch(runtime: &'r Runtime, assembly: u32) -> Self {
        let saved = runtime.current_assembly.swap(assembly, Ordering::AcqRel);
        AssemblyScope { runtime, saved }
    }
}

impl Drop for AssemblyScope<'_> {
    fn drop(&mut self) {
        self.runtime.current_assembly.store(self.saved, Ordering::Release);
    }
}
