//! Type resolution
//!
//! Token → method table, including TypeSpec signature walks, generic
//! instantiation interning, array interning, and on-demand construction
//! of TypeDef tables (parent chain, vtable slot layout, interface map,
//! instance size).

use tracing::debug;

use crate::context::{self, ContextGuard, TypeArgList};
use crate::external::TypeDefRow;
use crate::metadata::flags::{MethodAttributes, TypeAttributes};
use crate::metadata::signature::{element_type, SigReader};
use crate::metadata::token::{PrimitiveKind, TableId, Token, WellKnownType};
use crate::resolve::{AssemblyScope, Runtime};
use crate::types::method_table::{
    InterfaceMapEntry, MethodTable, MethodTableBuilder, MethodTableFlags, OBJECT_HEADER_SIZE,
};
use crate::types::registry::type_arg_hash;

impl Runtime {
    /// Resolve a type token against the current assembly.
    pub fn resolve_type(&self, token: Token) -> Option<&'static MethodTable> {
        self.resolve_type_in(self.current_assembly(), token)
    }

    /// Resolve a type token against `assembly`.
    pub fn resolve_type_in(&self, assembly: u32, token: Token) -> Option<&'static MethodTable> {
        match token.table()? {
            TableId::WellKnown => self.types.well_known(token.well_known()?),
            TableId::TypeDef => self.ensure_type_def(assembly, token),
            TableId::TypeRef => {
                let (target, def) = self.provider.resolve_type_ref(assembly, token)?;
                let _scope = AssemblyScope::switch(self, target);
                self.ensure_type_def(target, def)
            }
            TableId::TypeSpec => {
                let blob = self.provider.signature_blob(assembly, token)?;
                self.resolve_type_sig(assembly, &mut SigReader::new(&blob))
            }
            _ => None,
        }
    }

    /// Resolve `token` and intern the SZ-array of it.
    pub fn resolve_array_element_type(&self, token: Token) -> Option<&'static MethodTable> {
        let element = self.resolve_type(token)?;
        Some(self.types.intern_array(element))
    }

    /// Size of the type a token names, as the emitter sees it: raw value
    /// bytes for value types, pointer size for reference types and the
    /// runtime handle structs.
    pub fn type_size(&self, token: Token) -> Option<u32> {
        if let Some(wk) = token.well_known() {
            if wk.is_runtime_handle() {
                return Some(8);
            }
        }
        let mt = self.resolve_type(token)?;
        Some(mt.value_size())
    }

    /// Resolve the type signature at the cursor to a method table,
    /// substituting `VAR`/`MVAR` from the generic context.
    ///
    /// `None` means unresolved; the cursor state is unspecified then, and
    /// the caller treats the whole signature as a miss.
    pub fn resolve_type_sig(
        &self,
        assembly: u32,
        reader: &mut SigReader<'_>,
    ) -> Option<&'static MethodTable> {
        use element_type::*;

        let element = reader.read_u8().ok()?;
        match element {
            BOOLEAN => Some(self.types.primitive(PrimitiveKind::Boolean)),
            CHAR => Some(self.types.primitive(PrimitiveKind::Char)),
            I1 => Some(self.types.primitive(PrimitiveKind::SByte)),
            U1 => Some(self.types.primitive(PrimitiveKind::Byte)),
            I2 => Some(self.types.primitive(PrimitiveKind::Int16)),
            U2 => Some(self.types.primitive(PrimitiveKind::UInt16)),
            I4 => Some(self.types.primitive(PrimitiveKind::Int32)),
            U4 => Some(self.types.primitive(PrimitiveKind::UInt32)),
            I8 => Some(self.types.primitive(PrimitiveKind::Int64)),
            U8 => Some(self.types.primitive(PrimitiveKind::UInt64)),
            R4 => Some(self.types.primitive(PrimitiveKind::Single)),
            R8 => Some(self.types.primitive(PrimitiveKind::Double)),
            I => Some(self.types.primitive(PrimitiveKind::IntPtr)),
            U => Some(self.types.primitive(PrimitiveKind::UIntPtr)),
            STRING => self.types.well_known(WellKnownType::String),
            OBJECT => self.types.well_known(WellKnownType::Object),
            VAR => {
                let index = reader.read_compressed_u32().ok()? as usize;
                context::type_arg(index)
            }
            MVAR => {
                let index = reader.read_compressed_u32().ok()? as usize;
                context::method_arg(index)
            }
            CLASS | VALUETYPE => {
                let token = reader.read_type_def_or_ref().ok()?;
                self.resolve_type_in(assembly, token)
            }
            GENERICINST => {
                let kind = reader.read_u8().ok()?;
                let def_token = reader.read_type_def_or_ref().ok()?;
                let arg_count = reader.read_compressed_u32().ok()?;
                let mut args = Vec::with_capacity(arg_count as usize);
                for _ in 0..arg_count {
                    args.push(self.resolve_type_sig(assembly, reader)?);
                }
                self.intern_instantiation(assembly, def_token, &args, kind == VALUETYPE)
            }
            SZARRAY => {
                let element = self.resolve_type_sig(assembly, reader)?;
                Some(self.types.intern_array(element))
            }
            ARRAY => {
                let element = self.resolve_type_sig(assembly, reader)?;
                let rank = reader.read_compressed_u32().ok()?;
                let num_sizes = reader.read_compressed_u32().ok()?;
                for _ in 0..num_sizes {
                    reader.read_compressed_u32().ok()?;
                }
                let num_lo_bounds = reader.read_compressed_u32().ok()?;
                for _ in 0..num_lo_bounds {
                    reader.read_compressed_u32().ok()?;
                }
                Some(self.types.intern_md_array(element, rank.min(255) as u8))
            }
            // Pointer-sized stand-in; loses GC tracking for the pointee.
            PTR | BYREF => {
                reader.skip_type().ok()?;
                Some(self.types.primitive(PrimitiveKind::IntPtr))
            }
            FNPTR => {
                reader.skip_method_sig(0).ok()?;
                Some(self.types.primitive(PrimitiveKind::IntPtr))
            }
            CMOD_OPT | CMOD_REQD => {
                reader.read_type_def_or_ref().ok()?;
                self.resolve_type_sig(assembly, reader)
            }
            PINNED | SENTINEL => self.resolve_type_sig(assembly, reader),
            other => {
                debug!(target: "muon::resolve", element = other, "unresolved type signature element");
                None
            }
        }
    }

    /// The canonical instantiation table for `(definition, args)`.
    pub(crate) fn intern_instantiation(
        &self,
        assembly: u32,
        def_token: Token,
        args: &[&'static MethodTable],
        is_value_type: bool,
    ) -> Option<&'static MethodTable> {
        let def = self.resolve_type_in(assembly, def_token)?;
        if let Some(mt) = self.types.generic_instantiation(def.assembly(), def.token(), args) {
            return Some(mt);
        }

        // Sizes depend on the instantiation, so compute them under the
        // instantiation's own context.
        let hash = type_arg_hash(args);
        let (base_size, component_size) = if is_value_type {
            let _guard = ContextGuard::replace_type_args(TypeArgList::from_slice(args));
            let value_size = self.value_type_size(def.assembly(), def.token())?;
            (value_size + OBJECT_HEADER_SIZE, 0)
        } else {
            let _guard = ContextGuard::replace_type_args(TypeArgList::from_slice(args));
            (self.instance_size(def.assembly(), def.token())?, 0)
        };

        let parent = def.parent();
        let vtable_init = parent
            .map(|p| p.vtable_prefix(p.num_vtable_slots() as usize))
            .unwrap_or_default();
        let mut name = def.name().unwrap_or("?").to_string();
        name.push('[');
        for (index, arg) in args.iter().enumerate() {
            if index > 0 {
                name.push(',');
            }
            name.push_str(arg.name().unwrap_or("?"));
        }
        name.push(']');

        let mut flags = def.flags() & !MethodTableFlags::GENERIC_DEFINITION;
        if is_value_type {
            flags |= MethodTableFlags::VALUE_TYPE;
        }
        let built = MethodTableBuilder::new(def.assembly(), def.token())
            .flags(flags)
            .base_size(base_size)
            .component_size(component_size)
            .parent(parent)
            .vtable_slots(def.num_vtable_slots())
            .vtable_init(vtable_init)
            .interface_slots(def.num_interface_slots())
            .dispatch_map(def.dispatch_map().to_vec())
            .type_args(args.to_vec(), hash)
            .name(name)
            .build();
        Some(
            self.types
                .intern_generic_instantiation(def.assembly(), def.token(), args, || built),
        )
    }

    /// The table for a TypeDef, building it on first resolution.
    pub(crate) fn ensure_type_def(
        &self,
        assembly: u32,
        token: Token,
    ) -> Option<&'static MethodTable> {
        if let Some(mt) = self.types.lookup(assembly, token) {
            return Some(mt);
        }
        let built = self.build_type_def_table(assembly, token)?;
        let mt = self.types.get_or_register(assembly, token, built);
        self.types.capture_well_known_bases(mt);
        Some(mt)
    }

    fn build_type_def_table(&self, assembly: u32, token: Token) -> Option<&'static MethodTable> {
        let row = self.provider.type_def_row(assembly, token)?;
        let qualified = row.qualified_name();
        let is_interface = row.flags.contains(TypeAttributes::INTERFACE);
        let is_value_type = self.is_value_type_def(assembly, &row);

        let parent = if row.extends.is_nil() || is_interface {
            None
        } else {
            self.resolve_type_in(assembly, row.extends)
        };

        // Vtable: parent's slots (value types restart at zero), then
        // newslot virtuals in MethodDef order, then one range per
        // implemented interface.
        let base_slots: u16 = if is_value_type {
            0
        } else {
            parent.map_or(0, |p| p.num_vtable_slots())
        };
        let own_virtuals = if is_interface {
            self.provider.methods_of(assembly, token).len() as u16
        } else {
            self.count_newslot_virtuals(assembly, token)
        };

        let mut next_slot = base_slots + own_virtuals;
        let mut dispatch_map: Vec<InterfaceMapEntry> =
            parent.map(|p| p.dispatch_map().to_vec()).unwrap_or_default();
        for iface_token in self.provider.interfaces_of(assembly, token) {
            let Some(iface) = self.resolve_type_in(assembly, iface_token) else { continue };
            if dispatch_map.iter().any(|e| std::ptr::eq(e.interface, iface)) {
                continue;
            }
            dispatch_map.push(InterfaceMapEntry { interface: iface, start_slot: next_slot });
            next_slot += iface.num_vtable_slots();
        }
        let total_slots = next_slot;

        let vtable_init = parent
            .filter(|_| !is_value_type)
            .map(|p| p.vtable_prefix(p.num_vtable_slots() as usize))
            .unwrap_or_default();

        let mut flags = MethodTableFlags::empty();
        // Open generic definitions have unsubstituted VAR fields and no
        // intrinsic size; their tables are templates for interning.
        let (base_size, component_size) = if is_interface {
            flags |= MethodTableFlags::INTERFACE;
            (OBJECT_HEADER_SIZE, 0)
        } else if is_value_type {
            flags |= MethodTableFlags::VALUE_TYPE;
            match self.value_type_size(assembly, token) {
                Some(value_size) => (value_size + OBJECT_HEADER_SIZE, 0),
                None => {
                    flags |= MethodTableFlags::GENERIC_DEFINITION;
                    (OBJECT_HEADER_SIZE, 0)
                }
            }
        } else {
            if qualified == "System.String" {
                flags |= MethodTableFlags::STRING;
            }
            match self.instance_size(assembly, token) {
                Some(size) => (size, 0),
                None => {
                    flags |= MethodTableFlags::GENERIC_DEFINITION;
                    (OBJECT_HEADER_SIZE, 0)
                }
            }
        };

        let mt = MethodTableBuilder::new(assembly, token)
            .flags(flags)
            .base_size(base_size)
            .component_size(component_size)
            .parent(parent)
            .vtable_slots(total_slots)
            .vtable_init(vtable_init)
            .dispatch_map(dispatch_map)
            .name(qualified)
            .build();
        debug!(target: "muon::resolve", ?token, assembly, name = mt.name(), "built type table");
        Some(mt)
    }

    /// Whether a TypeDef row describes a value type: it extends
    /// `System.ValueType` or `System.Enum` without being one of them.
    pub(crate) fn is_value_type_def(&self, assembly: u32, row: &TypeDefRow) -> bool {
        if row.extends.is_nil() {
            return false;
        }
        let qualified = row.qualified_name();
        if qualified == "System.ValueType" || qualified == "System.Enum" {
            return false;
        }
        matches!(
            self.extends_name(assembly, row.extends).as_deref(),
            Some("System.ValueType") | Some("System.Enum")
        )
    }

    fn extends_name(&self, assembly: u32, extends: Token) -> Option<String> {
        match extends.table()? {
            TableId::TypeDef => {
                Some(self.provider.type_def_row(assembly, extends)?.qualified_name())
            }
            TableId::TypeRef => self.provider.type_ref_name(assembly, extends),
            TableId::WellKnown => match extends.well_known()? {
                WellKnownType::ValueType => Some("System.ValueType".to_string()),
                WellKnownType::Enum => Some("System.Enum".to_string()),
                _ => None,
            },
            _ => None,
        }
    }

    fn count_newslot_virtuals(&self, assembly: u32, type_token: Token) -> u16 {
        let mut count = 0;
        for method in self.provider.methods_of(assembly, type_token) {
            if let Some(row) = self.provider.method_row(assembly, method) {
                if row.flags.contains(MethodAttributes::VIRTUAL)
                    && row.flags.contains(MethodAttributes::NEW_SLOT)
                {
                    count += 1;
                }
            }
        }
        count
    }

    /// Vtable slot of a virtual MethodDef: newslot virtuals get their
    /// appended slot; overrides take the matching ancestor slot, found by
    /// name and argument count; −1 when no slot can be determined.
    pub(crate) fn vtable_slot_of_method(&self, assembly: u32, method_token: Token) -> i32 {
        let Some(row) = self.provider.method_row(assembly, method_token) else { return -1 };
        if !row.flags.contains(MethodAttributes::VIRTUAL) {
            return -1;
        }
        let Some(declaring) = self.provider.declaring_type(assembly, method_token) else {
            return -1;
        };

        if row.flags.contains(MethodAttributes::NEW_SLOT) {
            let base = self.vtable_base_of(assembly, declaring);
            let mut appended = 0;
            for candidate in self.provider.methods_of(assembly, declaring) {
                if candidate == method_token {
                    return (base + appended) as i32;
                }
                if let Some(c) = self.provider.method_row(assembly, candidate) {
                    if c.flags.contains(MethodAttributes::VIRTUAL)
                        && c.flags.contains(MethodAttributes::NEW_SLOT)
                    {
                        appended += 1;
                    }
                }
            }
            return -1;
        }

        let arg_count = self.method_sig_param_count(&row.signature);
        match self.parent_def_of(assembly, declaring) {
            Some((parent_asm, parent_def)) => self
                .inherited_virtual_slot(parent_asm, parent_def, &row.name, arg_count, 0)
                .map_or(-1, |slot| slot as i32),
            None => -1,
        }
    }

    fn vtable_base_of(&self, assembly: u32, type_token: Token) -> u16 {
        let Some(row) = self.provider.type_def_row(assembly, type_token) else { return 0 };
        if self.is_value_type_def(assembly, &row) || row.extends.is_nil() {
            return 0;
        }
        self.resolve_type_in(assembly, row.extends)
            .map_or(0, |p| p.num_vtable_slots())
    }

    /// Find the slot of a virtual `name` in `type_token` or its
    /// ancestors. Name-and-argument-count matching; signature
    /// equivalence across instantiations is not checked.
    pub(crate) fn inherited_virtual_slot(
        &self,
        assembly: u32,
        type_token: Token,
        name: &str,
        arg_count: Option<u32>,
        depth: u32,
    ) -> Option<u16> {
        if depth > 32 {
            return None;
        }
        let base = self.vtable_base_of(assembly, type_token);
        let mut appended = 0u16;
        for candidate in self.provider.methods_of(assembly, type_token) {
            let Some(row) = self.provider.method_row(assembly, candidate) else { continue };
            if !row.flags.contains(MethodAttributes::VIRTUAL) {
                continue;
            }
            if row.flags.contains(MethodAttributes::NEW_SLOT) {
                let slot = base + appended;
                appended += 1;
                if row.name == name
                    && (arg_count.is_none()
                        || self.method_sig_param_count(&row.signature) == arg_count)
                {
                    return Some(slot);
                }
            } else if row.name == name {
                // An override's slot is wherever the ancestor put it.
                break;
            }
        }
        let (parent_asm, parent_def) = self.parent_def_of(assembly, type_token)?;
        let _scope = AssemblyScope::switch(self, parent_asm);
        self.inherited_virtual_slot(parent_asm, parent_def, name, arg_count, depth + 1)
    }

    pub(crate) fn parent_def_of(&self, assembly: u32, type_token: Token) -> Option<(u32, Token)> {
        let row = self.provider.type_def_row(assembly, type_token)?;
        if row.extends.is_nil() {
            return None;
        }
        match row.extends.table()? {
            TableId::TypeDef => Some((assembly, row.extends)),
            TableId::TypeRef => self.provider.resolve_type_ref(assembly, row.extends),
            _ => None,
        }
    }

    pub(crate) fn method_sig_param_count(&self, signature: &[u8]) -> Option<u32> {
        let mut reader = SigReader::new(signature);
        crate::metadata::signature::read_method_sig_header(&mut reader)
            .ok()
            .map(|h| h.param_count)
    }
}
