//! Shared fixtures: an in-memory metadata image, a scripted emitter,
//! and a recording platform unwinder.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use muon_engine::metadata::signature::{calling_convention, element_type};
use muon_engine::{
    AotStaticField, AssemblyProvider, ClassLayout, EmitError, EmittedMethod, FieldAttributes,
    FieldRow, MemberRefRow, MethodAttributes, MethodEmitter, MethodImplAttributes, MethodRow,
    MethodSpecRow, MethodTable, MethodTableBuilder, MethodTableFlags, Runtime, TableId, Token,
    TypeAttributes, TypeDefRow, WellKnownMethods, WellKnownType,
};
use muon_unwind::{JitMethodInfo, PlatformUnwinder, UnwindInfo};

/// Well-known AOT addresses used across tests.
pub const OBJECT_TO_STRING: usize = 0xA100;
pub const OBJECT_EQUALS: usize = 0xA200;
pub const OBJECT_GET_HASH_CODE: usize = 0xA300;
pub const STRING_TO_STRING: usize = 0xB100;
pub const STRING_EQUALS: usize = 0xB200;
pub const STRING_GET_HASH_CODE: usize = 0xB300;
pub const CHECK_STATIC_CTOR: usize = 0xC000;

/// The well-known method table handed to every test runtime.
pub fn well_known_methods() -> WellKnownMethods {
    let mut methods = WellKnownMethods::default();
    methods.object = [OBJECT_TO_STRING, OBJECT_EQUALS, OBJECT_GET_HASH_CODE];
    methods.string = [STRING_TO_STRING, STRING_EQUALS, STRING_GET_HASH_CODE];
    methods.check_static_construction = CHECK_STATIC_CTOR;
    methods
}

/// In-memory metadata image implementing the loader seam.
#[derive(Default)]
pub struct TestImage {
    type_defs: HashMap<(u32, u32), TypeDefRow>,
    fields: HashMap<(u32, u32), FieldRow>,
    methods: HashMap<(u32, u32), MethodRow>,
    member_refs: HashMap<(u32, u32), MemberRefRow>,
    method_specs: HashMap<(u32, u32), MethodSpecRow>,
    blobs: HashMap<(u32, u32), Vec<u8>>,
    class_layouts: HashMap<(u32, u32), ClassLayout>,
    explicit_offsets: HashMap<(u32, u32), u32>,
    field_rvas: HashMap<(u32, u32), usize>,
    declaring: HashMap<(u32, u32), Token>,
    fields_of: HashMap<(u32, u32), Vec<Token>>,
    methods_of: HashMap<(u32, u32), Vec<Token>>,
    interfaces_of: HashMap<(u32, u32), Vec<Token>>,
    type_refs: HashMap<(u32, u32), (u32, Token)>,
    type_ref_names: HashMap<(u32, u32), String>,
    member_ref_targets: HashMap<(u32, u32), (u32, Token)>,
    aot_statics: HashMap<String, AotStaticField>,
    aot_methods: HashMap<(String, String), usize>,
    vararg_types: HashMap<(u32, u32), Vec<Token>>,
    user_strings: HashMap<(u32, u32), String>,
}

impl TestImage {
    pub fn new() -> Self {
        TestImage::default()
    }

    pub fn add_type(
        &mut self,
        assembly: u32,
        token: Token,
        namespace: &str,
        name: &str,
        extends: Token,
        flags: TypeAttributes,
    ) {
        self.type_defs.insert(
            (assembly, token.raw()),
            TypeDefRow {
                flags,
                extends,
                namespace: namespace.to_string(),
                name: name.to_string(),
            },
        );
        self.fields_of.entry((assembly, token.raw())).or_default();
        self.methods_of.entry((assembly, token.raw())).or_default();
    }

    pub fn add_field(
        &mut self,
        assembly: u32,
        type_token: Token,
        field_token: Token,
        name: &str,
        flags: FieldAttributes,
        signature: Vec<u8>,
    ) {
        self.fields.insert(
            (assembly, field_token.raw()),
            FieldRow { flags, name: name.to_string(), signature },
        );
        self.declaring.insert((assembly, field_token.raw()), type_token);
        self.fields_of
            .entry((assembly, type_token.raw()))
            .or_default()
            .push(field_token);
    }

    pub fn add_method(
        &mut self,
        assembly: u32,
        type_token: Token,
        method_token: Token,
        name: &str,
        flags: MethodAttributes,
        impl_flags: MethodImplAttributes,
        signature: Vec<u8>,
        has_body: bool,
    ) {
        self.methods.insert(
            (assembly, method_token.raw()),
            MethodRow {
                flags,
                impl_flags,
                name: name.to_string(),
                signature,
                has_body,
            },
        );
        self.declaring.insert((assembly, method_token.raw()), type_token);
        self.methods_of
            .entry((assembly, type_token.raw()))
            .or_default()
            .push(method_token);
    }

    pub fn add_interface_impl(&mut self, assembly: u32, type_token: Token, interface: Token) {
        self.interfaces_of
            .entry((assembly, type_token.raw()))
            .or_default()
            .push(interface);
    }

    pub fn add_blob(&mut self, assembly: u32, token: Token, blob: Vec<u8>) {
        self.blobs.insert((assembly, token.raw()), blob);
    }

    pub fn add_class_layout(&mut self, assembly: u32, type_token: Token, layout: ClassLayout) {
        self.class_layouts.insert((assembly, type_token.raw()), layout);
    }

    pub fn add_explicit_offset(&mut self, assembly: u32, field_token: Token, offset: u32) {
        self.explicit_offsets.insert((assembly, field_token.raw()), offset);
    }

    pub fn add_field_rva(&mut self, assembly: u32, field_token: Token, address: usize) {
        self.field_rvas.insert((assembly, field_token.raw()), address);
    }

    pub fn add_member_ref(
        &mut self,
        assembly: u32,
        token: Token,
        class: Token,
        name: &str,
        signature: Vec<u8>,
    ) {
        self.member_refs.insert(
            (assembly, token.raw()),
            MemberRefRow { class, name: name.to_string(), signature },
        );
    }

    pub fn add_member_ref_target(&mut self, assembly: u32, token: Token, target: (u32, Token)) {
        self.member_ref_targets.insert((assembly, token.raw()), target);
    }

    pub fn add_method_spec(
        &mut self,
        assembly: u32,
        token: Token,
        method: Token,
        instantiation: Vec<u8>,
    ) {
        self.method_specs
            .insert((assembly, token.raw()), MethodSpecRow { method, instantiation });
    }

    pub fn add_type_ref(
        &mut self,
        assembly: u32,
        token: Token,
        qualified_name: &str,
        target: Option<(u32, Token)>,
    ) {
        self.type_ref_names
            .insert((assembly, token.raw()), qualified_name.to_string());
        if let Some(target) = target {
            self.type_refs.insert((assembly, token.raw()), target);
        }
    }

    pub fn add_aot_static(&mut self, qualified_name: &str, entry: AotStaticField) {
        self.aot_statics.insert(qualified_name.to_string(), entry);
    }

    pub fn add_aot_method(&mut self, type_name: &str, method_name: &str, address: usize) {
        self.aot_methods
            .insert((type_name.to_string(), method_name.to_string()), address);
    }

    pub fn add_user_string(&mut self, assembly: u32, token: Token, value: &str) {
        self.user_strings.insert((assembly, token.raw()), value.to_string());
    }
}

impl AssemblyProvider for TestImage {
    fn type_def_row(&self, assembly: u32, token: Token) -> Option<TypeDefRow> {
        self.type_defs.get(&(assembly, token.raw())).cloned()
    }

    fn field_row(&self, assembly: u32, token: Token) -> Option<FieldRow> {
        self.fields.get(&(assembly, token.raw())).cloned()
    }

    fn method_row(&self, assembly: u32, token: Token) -> Option<MethodRow> {
        self.methods.get(&(assembly, token.raw())).cloned()
    }

    fn member_ref_row(&self, assembly: u32, token: Token) -> Option<MemberRefRow> {
        self.member_refs.get(&(assembly, token.raw())).cloned()
    }

    fn method_spec_row(&self, assembly: u32, token: Token) -> Option<MethodSpecRow> {
        self.method_specs.get(&(assembly, token.raw())).cloned()
    }

    fn signature_blob(&self, assembly: u32, token: Token) -> Option<Vec<u8>> {
        self.blobs.get(&(assembly, token.raw())).cloned()
    }

    fn class_layout(&self, assembly: u32, type_token: Token) -> Option<ClassLayout> {
        self.class_layouts.get(&(assembly, type_token.raw())).copied()
    }

    fn field_explicit_offset(&self, assembly: u32, field_token: Token) -> Option<u32> {
        self.explicit_offsets.get(&(assembly, field_token.raw())).copied()
    }

    fn field_rva(&self, assembly: u32, field_token: Token) -> Option<usize> {
        self.field_rvas.get(&(assembly, field_token.raw())).copied()
    }

    fn declaring_type(&self, assembly: u32, member_token: Token) -> Option<Token> {
        self.declaring.get(&(assembly, member_token.raw())).copied()
    }

    fn fields_of(&self, assembly: u32, type_token: Token) -> Vec<Token> {
        self.fields_of
            .get(&(assembly, type_token.raw()))
            .cloned()
            .unwrap_or_default()
    }

    fn methods_of(&self, assembly: u32, type_token: Token) -> Vec<Token> {
        self.methods_of
            .get(&(assembly, type_token.raw()))
            .cloned()
            .unwrap_or_default()
    }

    fn interfaces_of(&self, assembly: u32, type_token: Token) -> Vec<Token> {
        self.interfaces_of
            .get(&(assembly, type_token.raw()))
            .cloned()
            .unwrap_or_default()
    }

    fn type_ref_name(&self, assembly: u32, token: Token) -> Option<String> {
        self.type_ref_names.get(&(assembly, token.raw())).cloned()
    }

    fn resolve_type_ref(&self, assembly: u32, token: Token) -> Option<(u32, Token)> {
        self.type_refs.get(&(assembly, token.raw())).copied()
    }

    fn resolve_member_ref_target(&self, assembly: u32, token: Token) -> Option<(u32, Token)> {
        self.member_ref_targets.get(&(assembly, token.raw())).copied()
    }

    fn aot_static_field(&self, qualified_name: &str) -> Option<AotStaticField> {
        self.aot_statics.get(qualified_name).copied()
    }

    fn aot_method(
        &self,
        type_name: &str,
        method_name: &str,
        _arg_count: u8,
        _sig_hash: u32,
    ) -> Option<usize> {
        self.aot_methods
            .get(&(type_name.to_string(), method_name.to_string()))
            .copied()
    }

    fn vararg_types(&self, assembly: u32, call_site_token: Token) -> Option<Vec<Token>> {
        self.vararg_types.get(&(assembly, call_site_token.raw())).cloned()
    }

    fn user_string(&self, assembly: u32, token: Token) -> Option<String> {
        self.user_strings.get(&(assembly, token.raw())).cloned()
    }
}

/// Emitter returning sequential fake code addresses, recording every
/// invocation. An optional hook runs mid-compile (for reentrancy tests).
pub struct ScriptedEmitter {
    next_code: AtomicUsize,
    invocations: Mutex<Vec<(u32, u32)>>,
    hook: Mutex<Option<Box<dyn FnMut(u32, Token) + Send>>>,
}

impl ScriptedEmitter {
    pub fn new() -> Self {
        ScriptedEmitter {
            next_code: AtomicUsize::new(0x10_0000),
            invocations: Mutex::new(Vec::new()),
            hook: Mutex::new(None),
        }
    }

    pub fn with_hook(hook: impl FnMut(u32, Token) + Send + 'static) -> Self {
        let emitter = ScriptedEmitter::new();
        *emitter.hook.lock().unwrap() = Some(Box::new(hook));
        emitter
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations.lock().unwrap().len()
    }

    pub fn invocations(&self) -> Vec<(u32, u32)> {
        self.invocations.lock().unwrap().clone()
    }
}

/// Wraps a shared `ScriptedEmitter` handle so it can be boxed as a
/// `MethodEmitter` trait object (the orphan rules forbid implementing a
/// foreign trait directly on `Arc<ScriptedEmitter>`).
pub struct SharedEmitter(pub std::sync::Arc<ScriptedEmitter>);

impl MethodEmitter for SharedEmitter {
    fn compile_method(&self, assembly: u32, token: Token) -> Result<EmittedMethod, EmitError> {
        self.0.compile_method(assembly, token)
    }
}

impl MethodEmitter for ScriptedEmitter {
    fn compile_method(&self, assembly: u32, token: Token) -> Result<EmittedMethod, EmitError> {
        self.invocations.lock().unwrap().push((assembly, token.raw()));
        if let Some(hook) = self.hook.lock().unwrap().as_mut() {
            hook(assembly, token);
        }
        let code = self.next_code.fetch_add(0x100, Ordering::Relaxed);
        let begin = (code & 0xFFFF) as u32;
        Ok(EmittedMethod {
            native_code: code,
            method_info: JitMethodInfo::new(0x40_0000, begin, begin + 64, UnwindInfo::new()),
        })
    }
}

/// Emitter that always fails.
pub struct FailingEmitter;

impl MethodEmitter for FailingEmitter {
    fn compile_method(&self, _assembly: u32, _token: Token) -> Result<EmittedMethod, EmitError> {
        Err(EmitError("scripted failure".into()))
    }
}

/// Unwinder that records registrations and always accepts.
pub struct RecordingUnwinder {
    pub registered: AtomicUsize,
}

impl RecordingUnwinder {
    pub fn new() -> Self {
        RecordingUnwinder { registered: AtomicUsize::new(0) }
    }
}

impl PlatformUnwinder for RecordingUnwinder {
    fn add_function_table(&self, _begin: u32, _end: u32, _unwind: u32) -> bool {
        self.registered.fetch_add(1, Ordering::Relaxed);
        true
    }
}

/// A leaked runtime over `image` with object/string well-knowns bound.
pub fn runtime_over(image: TestImage) -> &'static Runtime {
    let runtime = Runtime::new(
        Box::new(image),
        Box::new(RecordingUnwinder::new()),
        well_known_methods(),
        0x100,
    );
    let runtime: &'static Runtime = Box::leak(Box::new(runtime));
    install_core_types(runtime);
    runtime
}

/// Bind `System.Object` and `System.String` method tables.
pub fn install_core_types(runtime: &Runtime) {
    let object = MethodTableBuilder::new(0, WellKnownType::Object.token())
        .vtable_slots(3)
        .vtable_init(vec![OBJECT_TO_STRING, OBJECT_EQUALS, OBJECT_GET_HASH_CODE])
        .name("System.Object")
        .build();
    runtime.types().register(0, WellKnownType::Object.token(), object);

    let string = MethodTableBuilder::new(0, WellKnownType::String.token())
        .flags(MethodTableFlags::STRING)
        .component_size(2)
        .base_size(16)
        .parent(Some(object))
        .vtable_slots(3)
        .vtable_init(vec![STRING_TO_STRING, STRING_EQUALS, STRING_GET_HASH_CODE])
        .name("System.String")
        .build();
    runtime.types().register(0, WellKnownType::String.token(), string);
}

/// Fake managed object: header word points at the method table.
pub struct FakeObject {
    storage: Box<[usize; 4]>,
}

impl FakeObject {
    pub fn of(mt: &'static MethodTable) -> Self {
        FakeObject {
            storage: Box::new([mt as *const MethodTable as usize, 0, 0, 0]),
        }
    }

    pub fn ptr(&self) -> *const u8 {
        self.storage.as_ptr() as *const u8
    }
}

// Signature blob builders.

pub fn field_sig(element: &[u8]) -> Vec<u8> {
    let mut sig = vec![calling_convention::FIELD];
    sig.extend_from_slice(element);
    sig
}

pub fn method_sig(has_this: bool, params: &[&[u8]], ret: &[u8]) -> Vec<u8> {
    let mut sig = vec![if has_this { calling_convention::HAS_THIS } else { 0 }];
    sig.push(params.len() as u8);
    sig.extend_from_slice(ret);
    for param in params {
        sig.extend_from_slice(param);
    }
    sig
}

/// `GENERICINST CLASS <typedef> <args>` TypeSpec blob.
pub fn generic_inst_sig(def: Token, args: &[&[u8]]) -> Vec<u8> {
    assert_eq!(def.table(), Some(TableId::TypeDef));
    let mut sig = vec![element_type::GENERICINST, element_type::CLASS];
    // coded TypeDefOrRef: (row << 2) | 0, single byte for small rows
    let coded = (def.row() << 2) as u8;
    sig.push(coded);
    sig.push(args.len() as u8);
    for arg in args {
        sig.extend_from_slice(arg);
    }
    sig
}

/// Method-instantiation blob for a MethodSpec.
pub fn method_inst_sig(args: &[&[u8]]) -> Vec<u8> {
    let mut sig = vec![calling_convention::GENERIC_INST];
    sig.push(args.len() as u8);
    for arg in args {
        sig.extend_from_slice(arg);
    }
    sig
}

pub fn typedef(row: u32) -> Token {
    Token::from_parts(TableId::TypeDef, row)
}

pub fn fielddef(row: u32) -> Token {
    Token::from_parts(TableId::Field, row)
}

pub fn methoddef(row: u32) -> Token {
    Token::from_parts(TableId::MethodDef, row)
}

pub fn memberref(row: u32) -> Token {
    Token::from_parts(TableId::MemberRef, row)
}

pub fn typespec(row: u32) -> Token {
    Token::from_parts(TableId::TypeSpec, row)
}

pub fn methodspec(row: u32) -> Token {
    Token::from_parts(TableId::MethodSpec, row)
}
