//! muon JIT runtime core
//!
//! The metadata-integration and lazy-compilation layer of a
//! kernel-resident CLI bytecode runtime:
//! - **Metadata**: tokens, attribute words, and signature decoding
//!   (`metadata` module)
//! - **Types**: method tables and their canonicalizing registry
//!   (`types` module)
//! - **Resolve**: the central resolver — type, field, method, string,
//!   static-storage, and cctor resolution (`resolve` module)
//! - **Dispatch**: the lazy-compilation stubs behind every call site
//!   (`dispatch` module)
//!
//! The IL emitter, metadata reader, assembly loader, GC heap, and
//! platform unwinder are collaborators behind the traits in `external`;
//! unwind/EH publication lives in the `muon-unwind` crate.
//!
//! # Example
//!
//! ```rust,ignore
//! use muon_engine::{Runtime, dispatch};
//!
//! let runtime = Runtime::new(loader, unwinder, well_known, handler_rva);
//! runtime.set_emitter(emitter);
//! let runtime = dispatch::install(runtime);
//!
//! // Hand the emitter its direct-call targets.
//! let entries = dispatch::entry_points(runtime);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod context;
pub mod dispatch;
pub mod external;
pub mod metadata;
pub mod resolve;
pub mod types;

pub use context::{ContextGuard, GenericContext, TypeArgList, MAX_GENERIC_ARGS};
pub use dispatch::registry::{CompiledMethod, CompiledMethodRegistry, MethodFacts};
pub use dispatch::{entry_points, install, installed, DispatchEntryPoints};
pub use external::{
    AotStaticField, AssemblyProvider, ClassLayout, EmitError, EmittedMethod, FieldRow,
    MemberRefRow, MethodEmitter, MethodRow, MethodSpecRow, TypeDefRow, WellKnownMethods,
};
pub use metadata::flags::{
    FieldAttributes, MethodAttributes, MethodImplAttributes, TypeAttributes,
};
pub use metadata::signature::{MethodSigHeader, SigError, SigReader};
pub use metadata::token::{PrimitiveKind, TableId, Token, WellKnownType, PRIMITIVE_COUNT};
pub use resolve::cctor::{CctorCell, CctorRegistry};
pub use resolve::fields::{FieldDescriptor, FieldLayoutCache};
pub use resolve::intrinsics::Intrinsic;
pub use resolve::methods::{signature_hash, MethodDescriptor, ReturnKind};
pub use resolve::statics::{StaticFieldEntry, StaticFieldRegistry};
pub use resolve::strings::StringRegistry;
pub use resolve::{AssemblyScope, Runtime};
pub use types::method_table::{
    InterfaceMapEntry, MethodTable, MethodTableBuilder, MethodTableFlags, SlotOutOfBounds,
    OBJECT_HEADER_SIZE,
};
pub use types::registry::{type_arg_hash, TypeHandleRegistry};
