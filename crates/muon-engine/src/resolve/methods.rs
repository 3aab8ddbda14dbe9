//! Method resolution
//!
//! MethodDef, MemberRef, and MethodSpec tokens resolve to a descriptor
//! the emitter turns into a direct call, an indirect call through a
//! registry cell (recursion), a virtual or interface dispatch, a
//! delegate construction, or an inline intrinsic expansion. Resolution
//! consults the compiled-method registry first; the registry record is
//! the linearization point for in-flight compilations.

use std::hash::{Hash, Hasher};

use rustc_hash::FxHasher;
use tracing::debug;

use crate::context::{self, ContextGuard, TypeArgList};
use crate::dispatch::registry::{CompiledMethod, MethodFacts};
use crate::external::MethodRow;
use crate::metadata::flags::{MethodAttributes, TypeAttributes};
use crate::metadata::signature::{
    calling_convention, element_type, read_method_sig_header, SigReader,
};
use crate::metadata::token::{TableId, Token};
use crate::resolve::intrinsics::{self, Intrinsic};
use crate::resolve::{AssemblyScope, Runtime};
use crate::types::method_table::MethodTable;

/// Return-value classification for call lowering.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum ReturnKind {
    /// No return value.
    #[default]
    Void,
    /// Integer-register scalar (including pointers and small structs the
    /// emitter scalarizes itself).
    Integer,
    /// Floating-point register scalar.
    Float,
    /// Managed reference.
    Reference,
    /// By-value struct; see `return_struct_size`.
    Struct,
}

/// Everything the emitter needs to lower one call site.
#[derive(Debug, Clone, Default)]
pub struct MethodDescriptor {
    /// Native entry address; zero when not (yet) compiled.
    pub native_code: usize,
    /// Machine argument count, including `this`.
    pub arg_count: u8,
    /// The callee takes a `this` argument.
    pub has_this: bool,
    /// Return classification.
    pub return_kind: ReturnKind,
    /// Returned struct size when `return_kind` is [`ReturnKind::Struct`].
    pub return_struct_size: u32,
    /// Dispatch virtually through the vtable slot.
    pub is_virtual: bool,
    /// Vtable slot; −1 when none.
    pub vtable_slot: i32,
    /// Declaring type's table (`newobj` allocation target).
    pub method_table: Option<&'static MethodTable>,
    /// Interface dispatch required.
    pub is_interface_method: bool,
    /// Declaring interface's table.
    pub interface_mt: Option<&'static MethodTable>,
    /// Method index within the interface's MethodDef list.
    pub interface_slot: i32,
    /// Delegate constructor special.
    pub is_delegate_ctor: bool,
    /// Delegate `Invoke` special.
    pub is_delegate_invoke: bool,
    /// Inline-expanded intrinsic, when recognized.
    pub intrinsic: Option<Intrinsic>,
    /// Rank, for the MD-array intrinsics.
    pub md_array_rank: u8,
    /// Element size, for the MD-array intrinsics.
    pub md_array_elem_size: u32,
    /// Vararg call site.
    pub is_vararg_call: bool,
    /// Resolved types of the variable arguments.
    pub vararg_types: Vec<&'static MethodTable>,
    /// The registry record to call through indirectly while the callee
    /// is still compiling.
    pub registry_entry: Option<&'static CompiledMethod>,
}

/// Hash of a signature blob, for AOT well-known method matching.
pub fn signature_hash(signature: &[u8]) -> u32 {
    let mut hasher = FxHasher::default();
    signature.hash(&mut hasher);
    hasher.finish() as u32
}

impl Runtime {
    /// Resolve a method token against the current assembly and generic
    /// context.
    pub fn resolve_method(&self, token: Token) -> Option<MethodDescriptor> {
        self.resolve_method_in(self.current_assembly(), token)
    }

    /// Resolve a method token against `assembly`.
    pub fn resolve_method_in(&self, assembly: u32, token: Token) -> Option<MethodDescriptor> {
        let ctx = context::current();
        let type_hash = ctx.type_args.hash();
        let method_hash = ctx.method_args.hash();

        if let Some(record) = self.methods.get(token, assembly) {
            if record.is_compiled() {
                if record.matches_instantiation(type_hash, method_hash) {
                    return Some(self.descriptor_from_record(record));
                }
                // Shared code was generated under a different
                // instantiation; sizes baked into it do not transfer.
                debug!(target: "muon::resolve", ?token, "instantiation mismatch, recompiling");
                record.mark_not_compiled();
            }
            if record.is_being_compiled() {
                return Some(self.recursion_descriptor(record));
            }
        }

        match token.table()? {
            TableId::MethodDef => self.resolve_method_def(assembly, token),
            TableId::MemberRef => self.resolve_member_ref_method(assembly, token),
            TableId::MethodSpec => self.resolve_method_spec(assembly, token),
            _ => None,
        }
    }

    /// Descriptor for a registry record, with the devirtualization rule
    /// applied.
    pub(crate) fn descriptor_from_record(&self, record: &'static CompiledMethod) -> MethodDescriptor {
        let facts = record.facts;
        let mut descriptor = MethodDescriptor {
            native_code: record.native_code(),
            arg_count: facts.arg_count,
            has_this: facts.has_this,
            return_kind: facts.return_kind,
            return_struct_size: facts.return_struct_size,
            is_virtual: facts.is_virtual,
            vtable_slot: facts.vtable_slot,
            method_table: facts.method_table,
            is_interface_method: facts.is_interface_method,
            interface_mt: facts.interface_mt,
            interface_slot: facts.interface_slot,
            ..MethodDescriptor::default()
        };
        // Slots 0-2 (ToString/Equals/GetHashCode) stay virtual; higher
        // slots with known code go direct. Known limitation: sealed
        // overrides above slot 2 called through a base reference lose
        // late binding.
        if descriptor.is_virtual && descriptor.native_code != 0 && descriptor.vtable_slot >= 3 {
            descriptor.is_virtual = false;
        }
        descriptor
    }

    fn recursion_descriptor(&self, record: &'static CompiledMethod) -> MethodDescriptor {
        let mut descriptor = self.descriptor_from_record(record);
        descriptor.native_code = 0;
        descriptor.registry_entry = Some(record);
        descriptor
    }

    fn resolve_method_def(&self, assembly: u32, token: Token) -> Option<MethodDescriptor> {
        let row = self.provider.method_row(assembly, token)?;
        let declaring = self.provider.declaring_type(assembly, token)?;
        let declaring_row = self.provider.type_def_row(assembly, declaring)?;

        if declaring_row.flags.contains(TypeAttributes::INTERFACE)
            && row.flags.contains(MethodAttributes::ABSTRACT)
        {
            let interface_mt = self.ensure_type_def(assembly, declaring)?;
            let index = self
                .provider
                .methods_of(assembly, declaring)
                .iter()
                .position(|&m| m == token)? as i32;
            let (arg_count, has_this, return_kind, return_struct_size) =
                self.method_sig_facts(assembly, &row.signature)?;
            return Some(MethodDescriptor {
                arg_count,
                has_this,
                return_kind,
                return_struct_size,
                is_virtual: true,
                is_interface_method: true,
                interface_mt: Some(interface_mt),
                interface_slot: index,
                ..MethodDescriptor::default()
            });
        }

        if row.impl_flags.is_runtime() {
            if let Some(descriptor) = self.delegate_descriptor(assembly, declaring, &row) {
                return Some(descriptor);
            }
        }

        if row.flags.contains(MethodAttributes::ABSTRACT) {
            let (arg_count, has_this, return_kind, return_struct_size) =
                self.method_sig_facts(assembly, &row.signature)?;
            return Some(MethodDescriptor {
                arg_count,
                has_this,
                return_kind,
                return_struct_size,
                is_virtual: true,
                vtable_slot: self.vtable_slot_of_method(assembly, token),
                method_table: self.ensure_type_def(assembly, declaring),
                ..MethodDescriptor::default()
            });
        }

        if !row.has_body {
            debug!(target: "muon::resolve", ?token, "method has no body and is not abstract");
            return None;
        }

        let record = self.compile_method_now(assembly, token).ok()?;
        if record.is_being_compiled() {
            return Some(self.recursion_descriptor(record));
        }
        Some(self.descriptor_from_record(record))
    }

    fn delegate_descriptor(
        &self,
        assembly: u32,
        declaring: Token,
        row: &MethodRow,
    ) -> Option<MethodDescriptor> {
        let special = match row.name.as_str() {
            ".ctor" => (true, false),
            "Invoke" => (false, true),
            _ => return None,
        };
        let (arg_count, has_this, return_kind, return_struct_size) =
            self.method_sig_facts(assembly, &row.signature)?;
        Some(MethodDescriptor {
            arg_count,
            has_this,
            return_kind,
            return_struct_size,
            is_delegate_ctor: special.0,
            is_delegate_invoke: special.1,
            method_table: self.ensure_type_def(assembly, declaring),
            ..MethodDescriptor::default()
        })
    }

    fn resolve_member_ref_method(&self, assembly: u32, token: Token) -> Option<MethodDescriptor> {
        let row = self.provider.member_ref_row(assembly, token)?;
        let header = {
            let mut reader = SigReader::new(&row.signature);
            read_method_sig_header(&mut reader).ok()?
        };
        let arg_count = (header.param_count as u8).saturating_add(header.has_this as u8);

        if let Some(type_name) = self.member_ref_type_name(assembly, row.class) {
            if let Some(intrinsic) = intrinsics::detect(&type_name, &row.name) {
                let (arg_count, has_this, return_kind, return_struct_size) =
                    self.method_sig_facts(assembly, &row.signature)?;
                return Some(MethodDescriptor {
                    arg_count,
                    has_this,
                    return_kind,
                    return_struct_size,
                    intrinsic: Some(intrinsic),
                    ..MethodDescriptor::default()
                });
            }
            // AOT methods of well-known types: matched by name, arity,
            // and signature hash — no assembly's tokens are involved.
            if let Some(native_code) = self.provider.aot_method(
                &type_name,
                &row.name,
                arg_count,
                signature_hash(&row.signature),
            ) {
                let (arg_count, has_this, return_kind, return_struct_size) =
                    self.method_sig_facts(assembly, &row.signature)?;
                return Some(MethodDescriptor {
                    native_code,
                    arg_count,
                    has_this,
                    return_kind,
                    return_struct_size,
                    ..MethodDescriptor::default()
                });
            }
        }

        if row.class.table() == Some(TableId::TypeSpec) {
            if let Some(descriptor) = self.md_array_descriptor(assembly, &row, token) {
                return Some(descriptor);
            }
        }

        // Vararg types belong to the call-site assembly; collect before
        // switching scope.
        let vararg_types = if header.is_vararg {
            self.provider
                .vararg_types(assembly, token)
                .map(|tokens| {
                    tokens
                        .into_iter()
                        .filter_map(|t| self.resolve_type_in(assembly, t))
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        let (target_assembly, target) = self.provider.resolve_member_ref_target(assembly, token)?;
        if target.table() != Some(TableId::MethodDef) {
            return None;
        }
        // A TypeSpec parent names the instantiation the target resolves
        // under; its table also becomes the newobj target.
        let mut instantiation = None;
        let _context = if row.class.table() == Some(TableId::TypeSpec) {
            let inst = self.resolve_type_in(assembly, row.class)?;
            instantiation = Some(inst);
            Some(ContextGuard::replace_type_args(TypeArgList::from_slice(inst.type_args())))
        } else {
            None
        };
        let _scope = AssemblyScope::switch(self, target_assembly);
        let mut descriptor = self.resolve_method_in(target_assembly, target)?;
        if let Some(inst) = instantiation {
            descriptor.method_table = Some(inst);
        }
        if header.is_vararg {
            descriptor.is_vararg_call = true;
            descriptor.vararg_types = vararg_types;
        }
        Some(descriptor)
    }

    fn md_array_descriptor(
        &self,
        assembly: u32,
        row: &crate::external::MemberRefRow,
        _token: Token,
    ) -> Option<MethodDescriptor> {
        let intrinsic = intrinsics::detect_md_array(&row.name)?;
        let blob = self.provider.signature_blob(assembly, row.class)?;
        let mut reader = SigReader::new(&blob);
        if reader.peek().ok()? != element_type::ARRAY {
            return None;
        }
        reader.read_u8().ok()?;
        let element = self.resolve_type_sig(assembly, &mut reader)?;
        let rank = reader.read_compressed_u32().ok()?.min(255) as u8;
        let array_mt = self.types.intern_md_array(element, rank);
        let (arg_count, has_this, return_kind, return_struct_size) =
            self.method_sig_facts(assembly, &row.signature)?;
        Some(MethodDescriptor {
            arg_count,
            has_this,
            return_kind,
            return_struct_size,
            intrinsic: Some(intrinsic),
            md_array_rank: rank,
            md_array_elem_size: element.value_size(),
            method_table: Some(array_mt),
            ..MethodDescriptor::default()
        })
    }

    fn resolve_method_spec(&self, assembly: u32, token: Token) -> Option<MethodDescriptor> {
        let spec = self.provider.method_spec_row(assembly, token)?;
        let mut reader = SigReader::new(&spec.instantiation);
        let convention = reader.read_u8().ok()?;
        if convention != calling_convention::GENERIC_INST {
            debug!(target: "muon::resolve", ?token, convention, "bad method instantiation blob");
            return None;
        }
        let count = reader.read_compressed_u32().ok()?;
        let mut args = TypeArgList::empty();
        for _ in 0..count {
            let mt = self.resolve_type_sig(assembly, &mut reader)?;
            if !args.push(mt) {
                return None;
            }
        }

        // Intrinsics short-circuit before any cross-assembly walk; their
        // expansion reads sizes from the method-type-arg context.
        let intrinsic = match spec.method.table()? {
            TableId::MemberRef => {
                let member = self.provider.member_ref_row(assembly, spec.method)?;
                self.member_ref_type_name(assembly, member.class)
                    .and_then(|type_name| intrinsics::detect(&type_name, &member.name))
                    .map(|i| (i, member.signature))
            }
            TableId::MethodDef => {
                let method = self.provider.method_row(assembly, spec.method)?;
                let declaring = self.provider.declaring_type(assembly, spec.method)?;
                let declaring_row = self.provider.type_def_row(assembly, declaring)?;
                intrinsics::detect(&declaring_row.qualified_name(), &method.name)
                    .map(|i| (i, method.signature))
            }
            _ => None,
        };

        let _guard = ContextGuard::replace_method_args(args);
        if let Some((intrinsic, signature)) = intrinsic {
            let (arg_count, has_this, return_kind, return_struct_size) =
                self.method_sig_facts(assembly, &signature)?;
            return Some(MethodDescriptor {
                arg_count,
                has_this,
                return_kind,
                return_struct_size,
                intrinsic: Some(intrinsic),
                ..MethodDescriptor::default()
            });
        }
        self.resolve_method_in(assembly, spec.method)
    }

    /// `(arg_count, has_this, return_kind, return_struct_size)` of a
    /// method signature.
    pub(crate) fn method_sig_facts(
        &self,
        assembly: u32,
        signature: &[u8],
    ) -> Option<(u8, bool, ReturnKind, u32)> {
        let mut reader = SigReader::new(signature);
        let header = read_method_sig_header(&mut reader).ok()?;
        let (return_kind, return_struct_size) = self.return_kind_at(assembly, &mut reader)?;
        Some((
            (header.param_count as u8).saturating_add(header.has_this as u8),
            header.has_this,
            return_kind,
            return_struct_size,
        ))
    }

    fn return_kind_at(
        &self,
        assembly: u32,
        reader: &mut SigReader<'_>,
    ) -> Option<(ReturnKind, u32)> {
        use element_type::*;

        while matches!(reader.peek().ok()?, CMOD_OPT | CMOD_REQD) {
            reader.read_u8().ok()?;
            reader.read_type_def_or_ref().ok()?;
        }
        let element = reader.peek().ok()?;
        let simple = match element {
            VOID => Some((ReturnKind::Void, 0)),
            R4 | R8 => Some((ReturnKind::Float, 0)),
            BOOLEAN | CHAR | I1 | U1 | I2 | U2 | I4 | U4 | I8 | U8 | I | U | PTR | BYREF
            | FNPTR => Some((ReturnKind::Integer, 0)),
            STRING | OBJECT | CLASS | SZARRAY | ARRAY => Some((ReturnKind::Reference, 0)),
            TYPEDBYREF => Some((ReturnKind::Struct, 16)),
            _ => None,
        };
        if let Some(result) = simple {
            return Some(result);
        }
        match element {
            VALUETYPE | GENERICINST | VAR | MVAR => {
                let mt = self.resolve_type_sig(assembly, reader)?;
                if let Some(index) = self.types.primitive_index(mt) {
                    match crate::metadata::token::PrimitiveKind::ALL[index] {
                        crate::metadata::token::PrimitiveKind::Single
                        | crate::metadata::token::PrimitiveKind::Double => {
                            Some((ReturnKind::Float, 0))
                        }
                        _ => Some((ReturnKind::Integer, 0)),
                    }
                } else if mt.is_value_type() {
                    Some((ReturnKind::Struct, mt.value_size()))
                } else {
                    Some((ReturnKind::Reference, 0))
                }
            }
            other => {
                debug!(target: "muon::resolve", element = other, "unresolved return type");
                None
            }
        }
    }

    /// Dispatch facts for a MethodDef, used when its registry record is
    /// created.
    pub(crate) fn method_facts(&self, assembly: u32, token: Token) -> MethodFacts {
        let Some(row) = self.provider.method_row(assembly, token) else {
            return MethodFacts::default();
        };
        let declaring = self.provider.declaring_type(assembly, token);
        let declaring_mt =
            declaring.and_then(|d| self.ensure_type_def(assembly, d));
        let is_interface = declaring
            .and_then(|d| self.provider.type_def_row(assembly, d))
            .map(|r| r.flags.contains(TypeAttributes::INTERFACE))
            .unwrap_or(false);
        let interface_slot = if is_interface {
            declaring
                .map(|d| self.provider.methods_of(assembly, d))
                .and_then(|methods| methods.iter().position(|&m| m == token))
                .map_or(-1, |i| i as i32)
        } else {
            -1
        };
        let (arg_count, has_this, return_kind, return_struct_size) = self
            .method_sig_facts(assembly, &row.signature)
            .unwrap_or((0, false, ReturnKind::Void, 0));
        let is_virtual = row.flags.contains(MethodAttributes::VIRTUAL);
        MethodFacts {
            arg_count,
            has_this,
            return_kind,
            return_struct_size,
            is_virtual,
            vtable_slot: if is_virtual {
                self.vtable_slot_of_method(assembly, token)
            } else {
                -1
            },
            method_table: declaring_mt,
            is_interface_method: is_interface,
            interface_mt: if is_interface { declaring_mt } else { None },
            interface_slot,
        }
    }
}
