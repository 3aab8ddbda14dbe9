//! Collaborator seams
//!
//! The core resolves and dispatches; it does not read PE images, emit
//! machine code, or own the platform unwinder. Those collaborators sit
//! behind the traits here: the assembly loader with its metadata-row
//! primitives, the IL emitter, and the kernel's fatal-halt hook. The
//! well-known AOT method addresses arrive once at initialization.

use thiserror::Error;

use crate::metadata::flags::{
    FieldAttributes, MethodAttributes, MethodImplAttributes, TypeAttributes,
};
use crate::metadata::token::{PrimitiveKind, Token, PRIMITIVE_COUNT};

/// TypeDef row fields the resolver consumes.
#[derive(Debug, Clone)]
pub struct TypeDefRow {
    /// Attribute word.
    pub flags: TypeAttributes,
    /// Base type token (TypeDef, TypeRef, or nil).
    pub extends: Token,
    /// Namespace, possibly empty.
    pub namespace: String,
    /// Simple name.
    pub name: String,
}

impl TypeDefRow {
    /// `Namespace.Name`, or just `Name` for the empty namespace.
    pub fn qualified_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.namespace, self.name)
        }
    }
}

/// Field row fields the resolver consumes.
#[derive(Debug, Clone)]
pub struct FieldRow {
    /// Attribute word.
    pub flags: FieldAttributes,
    /// Field name.
    pub name: String,
    /// Field signature blob (calling convention byte + type).
    pub signature: Vec<u8>,
}

/// MethodDef row fields the resolver consumes.
#[derive(Debug, Clone)]
pub struct MethodRow {
    /// Attribute word.
    pub flags: MethodAttributes,
    /// Implementation attribute word.
    pub impl_flags: MethodImplAttributes,
    /// Method name.
    pub name: String,
    /// Method signature blob.
    pub signature: Vec<u8>,
    /// Whether the method has an IL body.
    pub has_body: bool,
}

/// MemberRef row fields the resolver consumes.
#[derive(Debug, Clone)]
pub struct MemberRefRow {
    /// Parent token (TypeRef, TypeDef, or TypeSpec).
    pub class: Token,
    /// Member name.
    pub name: String,
    /// Member signature blob.
    pub signature: Vec<u8>,
}

/// MethodSpec row: the instantiated method and its instantiation blob.
#[derive(Debug, Clone)]
pub struct MethodSpecRow {
    /// The generic method (MethodDef or MemberRef).
    pub method: Token,
    /// Instantiation signature blob (`GENERICINST` convention).
    pub instantiation: Vec<u8>,
}

/// ClassLayout row: explicit packing and/or total size.
#[derive(Debug, Copy, Clone)]
pub struct ClassLayout {
    /// Packing size in bytes; zero means default, one disables padding.
    pub packing: u16,
    /// Explicit total size in bytes; zero means computed.
    pub size: u32,
}

/// An ahead-of-time compiled static field of a well-known type.
#[derive(Debug, Copy, Clone)]
pub struct AotStaticField {
    /// Address of the static storage.
    pub address: usize,
    /// Size in bytes.
    pub size: u32,
    /// Whether the slot holds a managed reference.
    pub is_gc_ref: bool,
}

/// The assembly loader and metadata-reader primitives.
///
/// Row accessors return `None` for tokens that do not name a row; the
/// resolver reports those as resolution misses without state change.
pub trait AssemblyProvider: Send + Sync {
    /// TypeDef row for a TypeDef token.
    fn type_def_row(&self, assembly: u32, token: Token) -> Option<TypeDefRow>;

    /// Field row for a FieldDef token.
    fn field_row(&self, assembly: u32, token: Token) -> Option<FieldRow>;

    /// MethodDef row for a MethodDef token.
    fn method_row(&self, assembly: u32, token: Token) -> Option<MethodRow>;

    /// MemberRef row for a MemberRef token.
    fn member_ref_row(&self, assembly: u32, token: Token) -> Option<MemberRefRow>;

    /// MethodSpec row for a MethodSpec token.
    fn method_spec_row(&self, assembly: u32, token: Token) -> Option<MethodSpecRow>;

    /// Signature blob of a TypeSpec, MethodSpec, or StandAloneSig token.
    fn signature_blob(&self, assembly: u32, token: Token) -> Option<Vec<u8>>;

    /// ClassLayout row for a TypeDef, when present.
    fn class_layout(&self, assembly: u32, type_token: Token) -> Option<ClassLayout>;

    /// Explicit offset of a field from the FieldLayout table.
    fn field_explicit_offset(&self, assembly: u32, field_token: Token) -> Option<u32>;

    /// Address of a field's embedded initialized data, when the field has
    /// an RVA.
    fn field_rva(&self, assembly: u32, field_token: Token) -> Option<usize>;

    /// Declaring TypeDef of a FieldDef or MethodDef.
    fn declaring_type(&self, assembly: u32, member_token: Token) -> Option<Token>;

    /// FieldDef tokens of a type, in metadata order.
    fn fields_of(&self, assembly: u32, type_token: Token) -> Vec<Token>;

    /// MethodDef tokens of a type, in metadata order.
    fn methods_of(&self, assembly: u32, type_token: Token) -> Vec<Token>;

    /// Implemented interface tokens of a type.
    fn interfaces_of(&self, assembly: u32, type_token: Token) -> Vec<Token>;

    /// Qualified name of a TypeRef's target, without resolving the target
    /// assembly (AOT well-known matching compares names only).
    fn type_ref_name(&self, assembly: u32, token: Token) -> Option<String>;

    /// Resolve a TypeRef to its defining `(assembly, TypeDef)`.
    fn resolve_type_ref(&self, assembly: u32, token: Token) -> Option<(u32, Token)>;

    /// Resolve a MemberRef to its target `(assembly, FieldDef | MethodDef)`.
    fn resolve_member_ref_target(&self, assembly: u32, token: Token) -> Option<(u32, Token)>;

    /// AOT static storage for `"Type.Field"`-keyed well-known statics.
    fn aot_static_field(&self, qualified_name: &str) -> Option<AotStaticField>;

    /// AOT native code for a well-known method, keyed by type name, member
    /// name, argument count, and signature hash.
    fn aot_method(
        &self,
        type_name: &str,
        method_name: &str,
        arg_count: u8,
        sig_hash: u32,
    ) -> Option<usize>;

    /// Runtime type tokens of a vararg call site's variable arguments.
    fn vararg_types(&self, assembly: u32, call_site_token: Token) -> Option<Vec<Token>>;

    /// Contents of a user-string (`0x70`) token.
    fn user_string(&self, assembly: u32, token: Token) -> Option<String>;
}

/// Emitter failure; fatal on the dispatch fast paths.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("method compilation failed: {0}")]
pub struct EmitError(pub Box<str>);

/// The emitter's output: the entry address plus everything the
/// publication layer needs to make the method's frames walkable.
#[derive(Debug, Clone)]
pub struct EmittedMethod {
    /// Native entry address.
    pub native_code: usize,
    /// Unwind and EH description for the publication registry.
    pub method_info: muon_unwind::JitMethodInfo,
}

/// The IL-to-native emitter.
///
/// The emitter reenters the resolver for every token its method body
/// references; the resolver's reentrancy contract (registry records,
/// generic-context guards) exists for this call.
pub trait MethodEmitter: Send + Sync {
    /// Compile one method.
    fn compile_method(&self, assembly: u32, token: Token) -> Result<EmittedMethod, EmitError>;
}

/// Non-returning halt hook. There is no user space to unwind to; the
/// kernel supplies the real halt, tests install a panicking one.
pub type FatalHandler = fn(&str) -> !;

/// Default halt: panic (suits tests and hosted harnesses).
pub fn default_fatal_handler(message: &str) -> ! {
    panic!("{message}");
}

/// Ahead-of-time native-code addresses for the well-known virtuals, plus
/// the static-construction check helper handed to the emitter.
///
/// Slots 0/1/2 are `ToString`/`Equals`/`GetHashCode`. A zero entry means
/// "no specific implementation"; users fall back to the `object` row.
#[derive(Debug, Clone)]
pub struct WellKnownMethods {
    /// `System.Object`'s three virtuals.
    pub object: [usize; 3],
    /// `System.String`'s three virtuals.
    pub string: [usize; 3],
    /// Per-primitive overrides, indexed by [`PrimitiveKind`].
    pub primitives: [[usize; 3]; PRIMITIVE_COUNT],
    /// Address of the `CheckStaticClassConstruction` helper.
    pub check_static_construction: usize,
}

impl WellKnownMethods {
    /// Vtable image for one primitive: its overrides with `object`
    /// fallbacks.
    pub fn primitive_vtable(&self, kind: PrimitiveKind) -> [usize; 3] {
        let overrides = self.primitives[kind as usize];
        std::array::from_fn(|slot| {
            if overrides[slot] != 0 {
                overrides[slot]
            } else {
                self.object[slot]
            }
        })
    }

    /// Fallback for an object virtual by slot index (0..=2).
    pub fn object_slot(&self, slot: u16) -> Option<usize> {
        self.object.get(slot as usize).copied().filter(|&a| a != 0)
    }

    /// String virtual by slot index (0..=2), falling back to `object`.
    pub fn string_slot(&self, slot: u16) -> Option<usize> {
        match self.string.get(slot as usize).copied() {
            Some(0) | None => self.object_slot(slot),
            Some(addr) => Some(addr),
        }
    }
}

impl Default for WellKnownMethods {
    fn default() -> Self {
        WellKnownMethods {
            object: [0; 3],
            string: [0; 3],
            primitives: [[0; 3]; PRIMITIVE_COUNT],
            check_static_construction: 0,
        }
    }
}
