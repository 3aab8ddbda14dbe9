//! Field resolution and layout
//!
//! FieldDef and MemberRef tokens resolve to a flat descriptor carrying
//! everything the emitter needs for a load, store, or address-of:
//! offset or static address, size, signedness, GC-ness, and the
//! declaring type's shape. Instance offsets come from the sequential
//! layout algorithm; resolutions cache per `(token, assembly,
//! type-arg-hash)`.

use dashmap::DashMap;
use rustc_hash::FxBuildHasher;
use tracing::debug;

use crate::context::{self, ContextGuard, TypeArgList};
use crate::metadata::flags::FieldAttributes;
use crate::metadata::signature::{calling_convention, element_type, SigReader};
use crate::metadata::token::{PrimitiveKind, TableId, Token};
use crate::resolve::{AssemblyScope, Runtime};
use crate::types::method_table::OBJECT_HEADER_SIZE;

/// Everything the emitter needs to access one field.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    /// Instance offset from the object pointer (header included for
    /// reference types); zero for statics.
    pub offset: i32,
    /// Field size in bytes (clamped to 255; struct copies use the
    /// declaring-type size).
    pub size: u8,
    /// Loads sign-extend.
    pub is_signed: bool,
    /// Static field.
    pub is_static: bool,
    /// The slot holds a managed reference.
    pub is_gc_ref: bool,
    /// Static storage address, for statics.
    pub static_address: Option<usize>,
    /// The declaring type is a value type.
    pub declaring_type_is_value_type: bool,
    /// Declaring type's raw size (value size for value types, instance
    /// size for reference types).
    pub declaring_type_size: u32,
    /// The field's own type is a value type.
    pub field_type_is_value_type: bool,
    /// Declaring type's token.
    pub declaring_token: Token,
    /// Declaring assembly.
    pub declaring_assembly: u32,
    /// Resolution succeeded.
    pub valid: bool,
}

impl Default for FieldDescriptor {
    fn default() -> Self {
        FieldDescriptor {
            offset: 0,
            size: 0,
            is_signed: false,
            is_static: false,
            is_gc_ref: false,
            static_address: None,
            declaring_type_is_value_type: false,
            declaring_type_size: 0,
            field_type_is_value_type: false,
            declaring_token: Token::new(0),
            declaring_assembly: 0,
            valid: false,
        }
    }
}

/// Cache of resolved field descriptors, keyed
/// `(token, assembly, type-arg-hash)`.
pub struct FieldLayoutCache {
    entries: DashMap<(u32, u32, u32), FieldDescriptor, FxBuildHasher>,
}

impl FieldLayoutCache {
    /// An empty cache.
    pub fn new() -> Self {
        FieldLayoutCache { entries: DashMap::with_hasher(FxBuildHasher) }
    }

    fn get(&self, key: &(u32, u32, u32)) -> Option<FieldDescriptor> {
        self.entries.get(key).map(|entry| *entry)
    }

    fn insert(&self, key: (u32, u32, u32), descriptor: FieldDescriptor) {
        self.entries.insert(key, descriptor);
    }

    /// Number of cached descriptors.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for FieldLayoutCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Shape facts of one field's type, derived from its signature.
#[derive(Debug, Copy, Clone)]
pub(crate) struct FieldTypeInfo {
    pub size: u32,
    pub is_signed: bool,
    pub is_gc_ref: bool,
    pub is_value_type: bool,
}

impl Runtime {
    /// Resolve a field token against the current assembly and generic
    /// context.
    pub fn resolve_field(&self, token: Token) -> Option<FieldDescriptor> {
        let assembly = self.current_assembly();
        let key = (token.raw(), assembly, context::current().type_args.hash());
        if let Some(cached) = self.field_cache.get(&key) {
            return Some(cached);
        }
        let descriptor = match token.table()? {
            TableId::Field => self.resolve_field_def(assembly, token),
            TableId::MemberRef => self.resolve_field_member_ref(assembly, token),
            _ => None,
        }?;
        self.field_cache.insert(key, descriptor);
        Some(descriptor)
    }

    pub(crate) fn resolve_field_def(
        &self,
        assembly: u32,
        token: Token,
    ) -> Option<FieldDescriptor> {
        let row = self.provider.field_row(assembly, token)?;
        if row.flags.contains(FieldAttributes::LITERAL) {
            // Literals fold into the IL stream; there is nothing to access.
            return None;
        }
        let declaring = self.provider.declaring_type(assembly, token)?;
        let declaring_row = self.provider.type_def_row(assembly, declaring)?;

        let mut reader = SigReader::new(&row.signature);
        let convention = reader.read_u8().ok()?;
        if convention & 0x0F != calling_convention::FIELD {
            debug!(target: "muon::resolve", ?token, convention, "not a field signature");
            return None;
        }
        let info = self.field_sig_info(assembly, &mut reader)?;

        let declaring_is_value_type = self.is_value_type_def(assembly, &declaring_row);
        let declaring_type_size = if declaring_is_value_type {
            self.value_type_size(assembly, declaring)?
        } else {
            self.instance_size(assembly, declaring)?
        };

        let mut descriptor = FieldDescriptor {
            size: info.size.min(255) as u8,
            is_signed: info.is_signed,
            is_gc_ref: info.is_gc_ref,
            field_type_is_value_type: info.is_value_type,
            declaring_type_is_value_type: declaring_is_value_type,
            declaring_type_size,
            declaring_token: declaring,
            declaring_assembly: assembly,
            valid: true,
            ..FieldDescriptor::default()
        };

        if row.flags.contains(FieldAttributes::STATIC) {
            let rva = if row.flags.contains(FieldAttributes::HAS_FIELD_RVA) {
                self.provider.field_rva(assembly, token)
            } else {
                None
            };
            let type_arg_hash = context::current().type_args.hash();
            let address = self.statics.ensure(
                assembly,
                token,
                declaring,
                type_arg_hash,
                info.size.max(1),
                info.is_gc_ref,
                rva,
            )?;
            descriptor.is_static = true;
            descriptor.static_address = Some(address);
        } else {
            descriptor.offset = self.field_offset_of(assembly, declaring, token)?;
        }
        Some(descriptor)
    }

    fn resolve_field_member_ref(&self, assembly: u32, token: Token) -> Option<FieldDescriptor> {
        let row = self.provider.member_ref_row(assembly, token)?;

        // AOT statics of well-known types match on names alone; no
        // assembly commits to their tokens.
        if let Some(type_name) = self.member_ref_type_name(assembly, row.class) {
            let qualified = format!("{type_name}.{}", row.name);
            if let Some(aot) = self.provider.aot_static_field(&qualified) {
                return Some(FieldDescriptor {
                    size: aot.size.min(255) as u8,
                    is_static: true,
                    is_gc_ref: aot.is_gc_ref,
                    static_address: Some(aot.address),
                    declaring_token: row.class,
                    declaring_assembly: assembly,
                    valid: true,
                    ..FieldDescriptor::default()
                });
            }
        }

        let (target_assembly, target) = self.provider.resolve_member_ref_target(assembly, token)?;
        if target.table() != Some(TableId::Field) {
            return None;
        }
        // A TypeSpec parent carries the instantiation the target resolves
        // under.
        let _context = if row.class.table() == Some(TableId::TypeSpec) {
            let inst = self.resolve_type_in(assembly, row.class)?;
            Some(ContextGuard::replace_type_args(TypeArgList::from_slice(inst.type_args())))
        } else {
            None
        };
        let _scope = AssemblyScope::switch(self, target_assembly);
        self.resolve_field_def(target_assembly, target)
    }

    pub(crate) fn member_ref_type_name(&self, assembly: u32, class: Token) -> Option<String> {
        match class.table()? {
            TableId::TypeRef => self.provider.type_ref_name(assembly, class),
            TableId::TypeDef => {
                Some(self.provider.type_def_row(assembly, class)?.qualified_name())
            }
            _ => None,
        }
    }

    /// Shape of the field type at the cursor. `VAR`/`MVAR` substitute
    /// from the generic context and derive their size from the
    /// substituted table.
    pub(crate) fn field_sig_info(
        &self,
        assembly: u32,
        reader: &mut SigReader<'_>,
    ) -> Option<FieldTypeInfo> {
        use element_type::*;

        while matches!(reader.peek().ok()?, CMOD_OPT | CMOD_REQD) {
            reader.read_u8().ok()?;
            reader.read_type_def_or_ref().ok()?;
        }
        let element = reader.peek().ok()?;
        let primitive = |kind: PrimitiveKind| {
            Some(FieldTypeInfo {
                size: kind.size(),
                is_signed: kind.is_signed(),
                is_gc_ref: false,
                is_value_type: true,
            })
        };
        match element {
            BOOLEAN => { reader.read_u8().ok()?; primitive(PrimitiveKind::Boolean) }
            CHAR => { reader.read_u8().ok()?; primitive(PrimitiveKind::Char) }
            I1 => { reader.read_u8().ok()?; primitive(PrimitiveKind::SByte) }
            U1 => { reader.read_u8().ok()?; primitive(PrimitiveKind::Byte) }
            I2 => { reader.read_u8().ok()?; primitive(PrimitiveKind::Int16) }
            U2 => { reader.read_u8().ok()?; primitive(PrimitiveKind::UInt16) }
            I4 => { reader.read_u8().ok()?; primitive(PrimitiveKind::Int32) }
            U4 => { reader.read_u8().ok()?; primitive(PrimitiveKind::UInt32) }
            I8 => { reader.read_u8().ok()?; primitive(PrimitiveKind::Int64) }
            U8 => { reader.read_u8().ok()?; primitive(PrimitiveKind::UInt64) }
            R4 => { reader.read_u8().ok()?; primitive(PrimitiveKind::Single) }
            R8 => { reader.read_u8().ok()?; primitive(PrimitiveKind::Double) }
            I => { reader.read_u8().ok()?; primitive(PrimitiveKind::IntPtr) }
            U => { reader.read_u8().ok()?; primitive(PrimitiveKind::UIntPtr) }
            STRING | OBJECT | CLASS | SZARRAY | ARRAY => {
                reader.skip_type().ok()?;
                Some(FieldTypeInfo {
                    size: 8,
                    is_signed: false,
                    is_gc_ref: true,
                    is_value_type: false,
                })
            }
            PTR | BYREF | FNPTR => {
                reader.skip_type().ok()?;
                Some(FieldTypeInfo {
                    size: 8,
                    is_signed: false,
                    is_gc_ref: false,
                    is_value_type: false,
                })
            }
            VALUETYPE | GENERICINST | VAR | MVAR => {
                let mt = self.resolve_type_sig(assembly, reader)?;
                if mt.is_value_type() {
                    let is_signed = self
                        .types
                        .primitive_index(mt)
                        .map(|index| PrimitiveKind::ALL[index].is_signed())
                        .unwrap_or(false);
                    Some(FieldTypeInfo {
                        size: mt.value_size(),
                        is_signed,
                        is_gc_ref: false,
                        is_value_type: true,
                    })
                } else {
                    Some(FieldTypeInfo {
                        size: 8,
                        is_signed: false,
                        is_gc_ref: true,
                        is_value_type: false,
                    })
                }
            }
            other => {
                debug!(target: "muon::resolve", element = other, "unresolved field type");
                None
            }
        }
    }

    /// Sequential layout: the instance offset of `field_token` within
    /// `declaring`.
    pub(crate) fn field_offset_of(
        &self,
        assembly: u32,
        declaring: Token,
        field_token: Token,
    ) -> Option<i32> {
        let declaring_row = self.provider.type_def_row(assembly, declaring)?;
        let is_value_type = self.is_value_type_def(assembly, &declaring_row);

        // Explicit offsets are used verbatim (past the header for
        // reference types).
        if let Some(explicit) = self.provider.field_explicit_offset(assembly, field_token) {
            let header = if is_value_type { 0 } else { OBJECT_HEADER_SIZE };
            return Some((explicit + header) as i32);
        }

        let pack_cap = self.packing_cap(assembly, declaring);
        let mut offset: u32 = if is_value_type {
            0
        } else if let Some((parent_assembly, parent)) = self.parent_def_of(assembly, declaring) {
            self.instance_size_bounded(parent_assembly, parent, 0)?
        } else {
            OBJECT_HEADER_SIZE
        };

        for candidate in self.provider.fields_of(assembly, declaring) {
            let row = self.provider.field_row(assembly, candidate)?;
            if row.flags.contains(FieldAttributes::STATIC)
                || row.flags.contains(FieldAttributes::LITERAL)
            {
                continue;
            }
            let mut reader = SigReader::new(&row.signature);
            reader.read_u8().ok()?;
            let info = self.field_sig_info(assembly, &mut reader)?;
            let align = info.size.clamp(1, 8).min(pack_cap);
            offset = align_up(offset, align);
            if candidate == field_token {
                return Some(offset as i32);
            }
            offset += info.size;
        }
        None
    }

    fn packing_cap(&self, assembly: u32, declaring: Token) -> u32 {
        match self.provider.class_layout(assembly, declaring) {
            Some(layout) if layout.packing != 0 => (layout.packing as u32).min(8),
            _ => 8,
        }
    }

    /// Instance size of a reference type: header plus inherited and own
    /// fields, aligned to the largest field alignment.
    pub(crate) fn instance_size(&self, assembly: u32, type_token: Token) -> Option<u32> {
        self.instance_size_bounded(assembly, type_token, 0)
    }

    fn instance_size_bounded(
        &self,
        assembly: u32,
        type_token: Token,
        depth: u32,
    ) -> Option<u32> {
        if depth > 32 {
            return None;
        }
        let row = self.provider.type_def_row(assembly, type_token)?;
        if self.is_value_type_def(assembly, &row) {
            return Some(self.value_type_size(assembly, type_token)? + OBJECT_HEADER_SIZE);
        }

        let mut offset = match self.parent_def_of(assembly, type_token) {
            Some((parent_assembly, parent)) => {
                self.instance_size_bounded(parent_assembly, parent, depth + 1)?
            }
            None => OBJECT_HEADER_SIZE,
        };
        let pack_cap = self.packing_cap(assembly, type_token);
        let mut max_align = 1;
        for candidate in self.provider.fields_of(assembly, type_token) {
            let row = self.provider.field_row(assembly, candidate)?;
            if row.flags.contains(FieldAttributes::STATIC)
                || row.flags.contains(FieldAttributes::LITERAL)
            {
                continue;
            }
            let mut reader = SigReader::new(&row.signature);
            reader.read_u8().ok()?;
            let info = self.field_sig_info(assembly, &mut reader)?;
            let align = info.size.clamp(1, 8).min(pack_cap);
            offset = align_up(offset, align) + info.size;
            max_align = max_align.max(align);
        }
        Some(align_up(offset, max_align))
    }

    /// Raw value size of a value type: the class-layout explicit size
    /// when set, otherwise the sequential-layout end aligned to the
    /// largest field alignment. Empty structs occupy one byte.
    pub(crate) fn value_type_size(&self, assembly: u32, type_token: Token) -> Option<u32> {
        if let Some(layout) = self.provider.class_layout(assembly, type_token) {
            if layout.size > 0 {
                return Some(layout.size);
            }
        }
        let pack_cap = self.packing_cap(assembly, type_token);
        let mut offset = 0u32;
        let mut max_align = 1;
        for candidate in self.provider.fields_of(assembly, type_token) {
            let row = self.provider.field_row(assembly, candidate)?;
            if row.flags.contains(FieldAttributes::STATIC)
                || row.flags.contains(FieldAttributes::LITERAL)
            {
                continue;
            }
            let mut reader = SigReader::new(&row.signature);
            reader.read_u8().ok()?;
            let info = self.field_sig_info(assembly, &mut reader)?;
            let align = info.size.clamp(1, 8).min(pack_cap);
            offset = align_up(offset, align) + info.size;
            max_align = max_align.max(align);
        }
        Some(align_up(offset, max_align).max(1))
    }
}

fn align_up(value: u32, align: u32) -> u32 {
    if align <= 1 {
        value
    } else {
        value.div_ceil(align) * align
    }
}
