//! Lazy-compilation dispatch integration tests: recursion, vtable
//! patching, AOT fallbacks, interface dispatch, and publication.

mod common;

use std::sync::{Arc, Mutex};

use common::*;
use muon_engine::metadata::signature::element_type::*;
use muon_engine::{
    context, Intrinsic, MethodAttributes, MethodDescriptor, MethodImplAttributes,
    MethodTableBuilder, MethodTableFlags, SlotOutOfBounds, Token, TypeAttributes, WellKnownType,
};

fn plain_method_image() -> TestImage {
    let mut image = TestImage::new();
    image.add_type(1, typedef(2), "App", "Worker", Token::new(0), TypeAttributes::empty());
    image.add_method(
        1,
        typedef(2),
        methoddef(1),
        "Run",
        MethodAttributes::empty(),
        MethodImplAttributes::empty(),
        method_sig(false, &[], &[VOID]),
        true,
    );
    image
}

#[test]
fn test_ensure_compiled_then_resolve_is_idempotent() {
    let runtime = runtime_over(plain_method_image());
    runtime.set_current_assembly(1);
    let emitter = Arc::new(ScriptedEmitter::new());
    runtime.set_emitter(Box::new(SharedEmitter(emitter.clone())));

    runtime.ensure_compiled(methoddef(1), 1);
    assert_eq!(emitter.invocation_count(), 1);

    let first = runtime.resolve_method(methoddef(1)).unwrap();
    let second = runtime.resolve_method(methoddef(1)).unwrap();
    assert_ne!(first.native_code, 0);
    assert_eq!(first.native_code, second.native_code);
    assert_eq!(first.arg_count, 0);
    // no further emitter invocations for either resolve
    assert_eq!(emitter.invocation_count(), 1);

    // one published unwind record
    assert_eq!(runtime.publisher().method_count(), 1);
}

#[test]
fn test_recursive_compile_goes_through_registry_cell() {
    let runtime = runtime_over(plain_method_image());
    runtime.set_current_assembly(1);

    let nested: Arc<Mutex<Option<MethodDescriptor>>> = Arc::new(Mutex::new(None));
    let emitter = Arc::new(ScriptedEmitter::with_hook({
        let nested = nested.clone();
        move |assembly, token| {
            // The body of Run calls Run: the emitter resolves the very
            // method being compiled.
            let descriptor = runtime.resolve_method_in(assembly, token).unwrap();
            *nested.lock().unwrap() = Some(descriptor);
        }
    }));
    runtime.set_emitter(Box::new(SharedEmitter(emitter.clone())));

    runtime.ensure_compiled(methoddef(1), 1);
    assert_eq!(emitter.invocation_count(), 1);

    let nested = nested.lock().unwrap();
    let nested = nested.as_ref().expect("nested resolution ran");
    // mid-compile: no direct code, but a registry cell to call through
    assert_eq!(nested.native_code, 0);
    let record = nested.registry_entry.expect("registry back-pointer");
    // after the outer compile completed, the cell holds the final code
    let final_code = runtime.resolve_method(methoddef(1)).unwrap().native_code;
    assert_ne!(final_code, 0);
    assert_eq!(record.native_code(), final_code);
}

#[test]
#[should_panic(expected = "EnsureCompiled")]
fn test_compile_failure_is_fatal_on_dispatch_path() {
    let runtime = runtime_over(plain_method_image());
    runtime.set_current_assembly(1);
    runtime.set_emitter(Box::new(FailingEmitter));
    runtime.ensure_compiled(methoddef(1), 1);
}

/// Four newslot virtuals on a root type: slots 0..=3.
fn virtuals_image() -> TestImage {
    let mut image = TestImage::new();
    image.add_type(1, typedef(2), "App", "Shape", Token::new(0), TypeAttributes::empty());
    for row in 1..=4 {
        image.add_method(
            1,
            typedef(2),
            methoddef(row),
            &format!("V{row}"),
            MethodAttributes::VIRTUAL | MethodAttributes::NEW_SLOT,
            MethodImplAttributes::empty(),
            method_sig(true, &[], &[VOID]),
            true,
        );
    }
    image
}

#[test]
fn test_devirtualization_floor() {
    let runtime = runtime_over(virtuals_image());
    runtime.set_current_assembly(1);
    runtime.set_emitter(Box::new(ScriptedEmitter::new()));

    // slot 3 with native code: demoted to a direct call
    let v4 = runtime.resolve_method(methoddef(4)).unwrap();
    assert_eq!(v4.vtable_slot, 3);
    assert_ne!(v4.native_code, 0);
    assert!(!v4.is_virtual);

    // slot 2 stays virtual (ToString/Equals/GetHashCode convention)
    let v3 = runtime.resolve_method(methoddef(3)).unwrap();
    assert_eq!(v3.vtable_slot, 2);
    assert!(v3.is_virtual);
}

#[test]
fn test_callvirt_patches_vtable_once() {
    let runtime = runtime_over(virtuals_image());
    runtime.set_current_assembly(1);
    let emitter = Arc::new(ScriptedEmitter::new());
    runtime.set_emitter(Box::new(SharedEmitter(emitter.clone())));

    let mt = runtime.resolve_type(typedef(2)).unwrap();
    assert_eq!(mt.num_vtable_slots(), 4);

    // Resolve creates the registry record with its slot assignment.
    let expected = runtime.resolve_method(methoddef(4)).unwrap().native_code;

    let object = FakeObject::of(mt);
    let code = runtime.ensure_vtable_slot_compiled(object.ptr(), 3);
    assert_eq!(code, expected);
    assert_eq!(mt.vtable_slot(3), Ok(code));

    // Patched slot satisfies the next dispatch with no compilation.
    let invocations = emitter.invocation_count();
    let again = runtime.ensure_vtable_slot_compiled(object.ptr(), 3);
    assert_eq!(again, code);
    assert_eq!(emitter.invocation_count(), invocations);
}

#[test]
fn test_ensure_virtual_compiled_patches_stale_slot() {
    let runtime = runtime_over(virtuals_image());
    runtime.set_current_assembly(1);
    runtime.set_emitter(Box::new(ScriptedEmitter::new()));

    let mt = runtime.resolve_type(typedef(2)).unwrap();
    runtime.ensure_virtual_compiled(methoddef(2), 1, mt, 1);
    let code = mt.vtable_slot(1).unwrap();
    assert_ne!(code, 0);

    // Clobber and re-ensure: the fast path repairs the slot.
    mt.set_vtable_slot(1, 0xDEAD).unwrap();
    runtime.ensure_virtual_compiled(methoddef(2), 1, mt, 1);
    assert_eq!(mt.vtable_slot(1), Ok(code));
}

#[test]
fn test_string_aot_fallback_past_vtable_end() {
    // A String table with only two physical slots: GetHashCode (slot 2)
    // resolves to the AOT address and never writes the vtable.
    let runtime = runtime_over(TestImage::new());
    let string_mt = MethodTableBuilder::new(0, WellKnownType::String.token())
        .flags(MethodTableFlags::STRING)
        .base_size(16)
        .component_size(2)
        .vtable_slots(2)
        .vtable_init(vec![STRING_TO_STRING, STRING_EQUALS])
        .name("System.String")
        .build();

    let object = FakeObject::of(string_mt);
    let code = runtime.ensure_vtable_slot_compiled(object.ptr(), 2);
    assert_eq!(code, STRING_GET_HASH_CODE);
    assert_eq!(string_mt.vtable_slot(2), Err(SlotOutOfBounds));
}

#[test]
fn test_object_aot_fallback() {
    let runtime = runtime_over(TestImage::new());
    let bare = MethodTableBuilder::new(1, typedef(9)).name("App.Bare").build();
    let object = FakeObject::of(bare);
    assert_eq!(runtime.ensure_vtable_slot_compiled(object.ptr(), 1), OBJECT_EQUALS);
}

#[test]
fn test_sealed_slot_read_without_patch() {
    let runtime = runtime_over(TestImage::new());
    let iface = MethodTableBuilder::new(1, typedef(8))
        .flags(MethodTableFlags::INTERFACE)
        .vtable_slots(1)
        .name("App.ISealed")
        .build();
    let mt = MethodTableBuilder::new(1, typedef(9))
        .vtable_slots(2)
        .interface_slots(1)
        .dispatch_map(vec![muon_engine::InterfaceMapEntry { interface: iface, start_slot: 2 }])
        .name("App.Sealed")
        .build();
    mt.set_sealed_slot(0, 0xDD00);

    let object = FakeObject::of(mt);
    // slot 2 is one past the physical vtable
    assert_eq!(runtime.ensure_vtable_slot_compiled(object.ptr(), 2), 0xDD00);
}

#[test]
#[should_panic(expected = "no dispatch target")]
fn test_dispatch_exhaustion_is_fatal() {
    let runtime = runtime_over(TestImage::new());
    let bare = MethodTableBuilder::new(1, typedef(9)).name("App.Bare").build();
    let object = FakeObject::of(bare);
    // slot 7 has no sealed slots, no AOT fallback
    runtime.ensure_vtable_slot_compiled(object.ptr(), 7);
}

fn interface_image(implementation_has_body: bool, default_method: bool) -> TestImage {
    let mut image = TestImage::new();
    image.add_type(1, typedef(3), "App", "IGreet", Token::new(0), TypeAttributes::INTERFACE);
    image.add_method(
        1,
        typedef(3),
        methoddef(10),
        "Greet",
        if default_method {
            MethodAttributes::VIRTUAL | MethodAttributes::NEW_SLOT
        } else {
            MethodAttributes::VIRTUAL | MethodAttributes::NEW_SLOT | MethodAttributes::ABSTRACT
        },
        MethodImplAttributes::empty(),
        method_sig(true, &[], &[VOID]),
        default_method,
    );
    image.add_type(1, typedef(4), "App", "Greeter", Token::new(0), TypeAttributes::empty());
    if implementation_has_body {
        image.add_method(
            1,
            typedef(4),
            methoddef(11),
            "Greet",
            MethodAttributes::empty(),
            MethodImplAttributes::empty(),
            method_sig(true, &[], &[VOID]),
            true,
        );
    }
    image.add_interface_impl(1, typedef(4), typedef(3));
    image
}

#[test]
fn test_interface_dispatch_by_name_fallback() {
    let runtime = runtime_over(interface_image(true, false));
    runtime.set_current_assembly(1);
    let emitter = Arc::new(ScriptedEmitter::new());
    runtime.set_emitter(Box::new(SharedEmitter(emitter.clone())));

    let mt = runtime.resolve_type(typedef(4)).unwrap();
    assert_eq!(mt.num_vtable_slots(), 1);
    assert!(mt.has_dispatch_map());

    let object = FakeObject::of(mt);
    let code = runtime.ensure_vtable_slot_compiled(object.ptr(), 0);
    assert_ne!(code, 0);
    assert_eq!(mt.vtable_slot(0), Ok(code));
    // the implementation, not the interface method, was compiled
    assert_eq!(emitter.invocations(), vec![(1, methoddef(11).raw())]);
}

#[test]
fn test_default_interface_method_dispatch() {
    let runtime = runtime_over(interface_image(false, true));
    runtime.set_current_assembly(1);
    let emitter = Arc::new(ScriptedEmitter::new());
    runtime.set_emitter(Box::new(SharedEmitter(emitter.clone())));

    let mt = runtime.resolve_type(typedef(4)).unwrap();
    let object = FakeObject::of(mt);
    let code = runtime.ensure_vtable_slot_compiled(object.ptr(), 0);
    assert_ne!(code, 0);
    // the interface's own body was compiled
    assert_eq!(emitter.invocations(), vec![(1, methoddef(10).raw())]);
}

#[test]
fn test_interface_method_resolution_descriptor() {
    let runtime = runtime_over(interface_image(true, false));
    runtime.set_current_assembly(1);

    let descriptor = runtime.resolve_method(methoddef(10)).unwrap();
    assert!(descriptor.is_interface_method);
    assert!(descriptor.is_virtual);
    assert_eq!(descriptor.interface_slot, 0);
    assert!(descriptor.interface_mt.is_some());
    assert_eq!(descriptor.native_code, 0);
}

#[test]
fn test_delegate_specials() {
    let mut image = TestImage::new();
    image.add_type(1, typedef(5), "App", "Handler", Token::new(0), TypeAttributes::SEALED);
    image.add_method(
        1,
        typedef(5),
        methoddef(20),
        ".ctor",
        MethodAttributes::SPECIAL_NAME | MethodAttributes::RT_SPECIAL_NAME,
        MethodImplAttributes::from_bits_retain(0x0003),
        method_sig(true, &[&[OBJECT], &[I]], &[VOID]),
        false,
    );
    image.add_method(
        1,
        typedef(5),
        methoddef(21),
        "Invoke",
        MethodAttributes::VIRTUAL | MethodAttributes::NEW_SLOT,
        MethodImplAttributes::from_bits_retain(0x0003),
        method_sig(true, &[&[I4]], &[VOID]),
        false,
    );
    let runtime = runtime_over(image);
    runtime.set_current_assembly(1);

    let ctor = runtime.resolve_method(methoddef(20)).unwrap();
    assert!(ctor.is_delegate_ctor);
    assert!(!ctor.is_delegate_invoke);
    assert_eq!(ctor.arg_count, 3);
    assert!(ctor.method_table.is_some());

    let invoke = runtime.resolve_method(methoddef(21)).unwrap();
    assert!(invoke.is_delegate_invoke);
    assert_eq!(invoke.arg_count, 2);
}

#[test]
fn test_aot_member_ref_by_name() {
    let mut image = TestImage::new();
    image.add_type_ref(1, Token::from_parts(muon_engine::TableId::TypeRef, 1), "System.Console", None);
    image.add_member_ref(
        1,
        memberref(1),
        Token::from_parts(muon_engine::TableId::TypeRef, 1),
        "WriteLine",
        method_sig(false, &[&[STRING]], &[VOID]),
    );
    image.add_aot_method("System.Console", "WriteLine", 0xAA10);
    let runtime = runtime_over(image);
    runtime.set_current_assembly(1);

    let descriptor = runtime.resolve_method(memberref(1)).unwrap();
    assert_eq!(descriptor.native_code, 0xAA10);
    assert_eq!(descriptor.arg_count, 1);
    assert!(!descriptor.is_virtual);
}

#[test]
fn test_cross_assembly_member_ref_restores_scope() {
    let mut image = TestImage::new();
    image.add_type_ref(1, Token::from_parts(muon_engine::TableId::TypeRef, 2), "Lib.Api", Some((2, typedef(2))));
    image.add_type(2, typedef(2), "Lib", "Api", Token::new(0), TypeAttributes::empty());
    image.add_method(
        2,
        typedef(2),
        methoddef(7),
        "Call",
        MethodAttributes::empty(),
        MethodImplAttributes::empty(),
        method_sig(false, &[], &[I4]),
        true,
    );
    image.add_member_ref(
        1,
        memberref(3),
        Token::from_parts(muon_engine::TableId::TypeRef, 2),
        "Call",
        method_sig(false, &[], &[I4]),
    );
    image.add_member_ref_target(1, memberref(3), (2, methoddef(7)));
    // a failing ref: target missing
    image.add_member_ref(
        1,
        memberref(4),
        Token::from_parts(muon_engine::TableId::TypeRef, 2),
        "Missing",
        method_sig(false, &[], &[VOID]),
    );
    let runtime = runtime_over(image);
    runtime.set_current_assembly(1);
    runtime.set_emitter(Box::new(ScriptedEmitter::new()));

    let descriptor = runtime.resolve_method(memberref(3)).unwrap();
    assert_ne!(descriptor.native_code, 0);
    assert_eq!(runtime.current_assembly(), 1);

    assert!(runtime.resolve_method(memberref(4)).is_none());
    assert_eq!(runtime.current_assembly(), 1);
}

#[test]
fn test_unsafe_add_intrinsic_via_method_spec() {
    let mut image = TestImage::new();
    let unsafe_ref = Token::from_parts(muon_engine::TableId::TypeRef, 3);
    image.add_type_ref(1, unsafe_ref, "System.Runtime.CompilerServices.Unsafe", None);
    image.add_member_ref(
        1,
        memberref(5),
        unsafe_ref,
        "Add",
        method_sig(false, &[&[BYREF, MVAR, 0x00], &[I4]], &[BYREF, MVAR, 0x00]),
    );
    image.add_method_spec(1, methodspec(1), memberref(5), method_inst_sig(&[&[I8]]));
    let runtime = runtime_over(image);
    runtime.set_current_assembly(1);

    assert!(context::method_arg(0).is_none());
    let descriptor = runtime.resolve_method(methodspec(1)).unwrap();
    assert_eq!(descriptor.intrinsic, Some(Intrinsic::UnsafeAdd));
    assert_eq!(descriptor.arg_count, 2);
    // context restored after resolution
    assert!(context::method_arg(0).is_none());
}

#[test]
fn test_md_array_member_ref() {
    let mut image = TestImage::new();
    // int[,] via a TypeSpec the MemberRef hangs off
    image.add_blob(1, typespec(6), vec![ARRAY, I4, 0x02, 0x00, 0x00]);
    image.add_member_ref(
        1,
        memberref(6),
        typespec(6),
        "Get",
        method_sig(true, &[&[I4], &[I4]], &[I4]),
    );
    let runtime = runtime_over(image);
    runtime.set_current_assembly(1);

    let descriptor = runtime.resolve_method(memberref(6)).unwrap();
    assert_eq!(descriptor.intrinsic, Some(Intrinsic::MdArrayGet));
    assert_eq!(descriptor.md_array_rank, 2);
    assert_eq!(descriptor.md_array_elem_size, 4);
    assert!(descriptor.method_table.unwrap().is_array());
}

#[test]
fn test_cctor_registered_before_compile_and_runs_once() {
    let mut image = TestImage::new();
    image.add_type(1, typedef(2), "App", "Config", Token::new(0), TypeAttributes::empty());
    image.add_method(
        1,
        typedef(2),
        methoddef(30),
        ".cctor",
        MethodAttributes::STATIC | MethodAttributes::RT_SPECIAL_NAME | MethodAttributes::SPECIAL_NAME,
        MethodImplAttributes::empty(),
        method_sig(false, &[], &[VOID]),
        true,
    );
    let runtime = runtime_over(image);
    runtime.set_current_assembly(1);
    let emitter = Arc::new(ScriptedEmitter::new());
    runtime.set_emitter(Box::new(SharedEmitter(emitter.clone())));

    let cell = runtime.ensure_cctor_registered(1, typedef(2)).unwrap();
    let pending = cell.pending();
    assert_ne!(pending, 0);
    assert_eq!(emitter.invocation_count(), 1);

    // re-registration is a no-op returning the same cell
    let again = runtime.ensure_cctor_registered(1, typedef(2)).unwrap();
    assert!(std::ptr::eq(cell, again));
    assert_eq!(emitter.invocation_count(), 1);

    // the helper claims the cctor exactly once
    assert_eq!(cell.take(), pending);
    assert_eq!(cell.take(), 0);
    assert_eq!(cell.pending(), 0);
}

#[test]
fn test_type_without_cctor_registers_nothing() {
    let mut image = TestImage::new();
    image.add_type(1, typedef(2), "App", "Plain", Token::new(0), TypeAttributes::empty());
    let runtime = runtime_over(image);
    runtime.set_current_assembly(1);
    assert!(runtime.ensure_cctor_registered(1, typedef(2)).is_none());
    assert!(runtime.cctors().is_empty());
}

#[test]
fn test_string_literal_interning() {
    let mut image = TestImage::new();
    let literal = Token::from_parts(muon_engine::TableId::UserString, 5);
    image.add_user_string(1, literal, "hello kernel");
    let runtime = runtime_over(image);
    runtime.set_current_assembly(1);

    let first = runtime.resolve_string(literal).unwrap();
    let second = runtime.resolve_string(literal).unwrap();
    assert_eq!(first, "hello kernel");
    assert!(std::ptr::eq(first, second));
    assert!(runtime.resolve_string(Token::from_parts(muon_engine::TableId::UserString, 6)).is_none());
}

#[test]
fn test_entry_points_are_published() {
    let runtime_value = muon_engine::Runtime::new(
        Box::new(TestImage::new()),
        Box::new(RecordingUnwinder::new()),
        well_known_methods(),
        0x100,
    );
    let runtime = muon_engine::install(runtime_value);
    let entries = muon_engine::entry_points(runtime);
    assert_ne!(entries.ensure_compiled, 0);
    assert_ne!(entries.ensure_virtual_compiled, 0);
    assert_ne!(entries.ensure_vtable_slot_compiled, 0);
    assert_eq!(entries.check_static_construction, CHECK_STATIC_CTOR);
}
